//! Agent handlers: the code a worker runs for one run.
//!
//! A handler receives the run input together with the credentials of the
//! agent instance, records progress through the [`StepContext`] and returns
//! either a final result or a prompt asking the user for more input.

pub mod builtin;
pub mod registry;

use crate::worker::context::StepContext;
use agentrun_base::data::{RunId, RunMode};
use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub run_id: RunId,
    pub input: serde_json::Value,
    pub mode: RunMode,
    pub user_id: String,
    pub credentials: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    Completed(serde_json::Value),
    /// the run pauses until the user resumes it with more input
    AwaitingInput(serde_json::Value),
}

#[async_trait]
pub trait AgentHandler: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// An `Err` fails the run with the error message. Returning the
    /// `CancelledError` of the context leaves the cancelled run untouched.
    async fn run(&self, request: AgentRequest, ctx: &StepContext) -> Result<AgentOutcome>;
}

pub mod rdb;
pub mod rows;

use agentrun_base::data::Step;
use anyhow::Result;
use async_trait::async_trait;

/// write side of step persistence (used by the worker step buffer)
#[async_trait]
pub trait StepWriter: Send + Sync + 'static {
    /// insert all steps in one statement (all or nothing)
    async fn insert_batch(&self, steps: &[Step]) -> Result<u64>;
    async fn insert(&self, step: &Step) -> Result<bool>;
}

use super::context::StepContext;
use super::step_buffer::StepBuffer;
use crate::agent::registry::AgentRegistry;
use crate::agent::{AgentHandler, AgentOutcome, AgentRequest};
use agentrun_base::data::{AgentInstance, JobEnvelope, Run, RunId, RunStatus};
use agentrun_base::error::AgentRunError;
use anyhow::{anyhow, Context, Result};
use debug_stub_derive::DebugStub;
use futures_util::FutureExt;
use infra::infra::agent_instance::rdb::{RdbAgentInstanceRepository, UseRdbAgentInstanceRepository};
use infra::infra::module::RepositoryModule;
use infra::infra::run::rdb::{RdbRunRepository, RdbRunRepositoryImpl, UseRdbRunRepository};
use infra::infra::step::rdb::{RdbStepRepository, UseRdbStepRepository};
use infra::infra::JobQueueConfig;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// what the executor did with a leased job. either way the job is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// the run was missing or not runnable (e.g. cancelled while queued)
    Skipped,
    /// the handler ran; the run is now in this status
    Finished(RunStatus),
}

/// Runs one job: the run moves to RUNNING, its agent handler is invoked
/// and the outcome is written as the run status.
///
/// Handler failures (errors, panics, timeouts) end up in the run row.
/// An `Err` from [`RunExecutor::execute`] is an infrastructure failure the
/// caller reports to the queue.
#[derive(Clone, DebugStub)]
pub struct RunExecutor {
    #[debug_stub = "RepositoryModule"]
    repositories: Arc<RepositoryModule>,
    registry: Arc<AgentRegistry>,
    step_buffer: Arc<StepBuffer>,
    job_queue_config: Arc<JobQueueConfig>,
}

impl UseRdbRunRepository for RunExecutor {
    fn run_repository(&self) -> &RdbRunRepositoryImpl {
        &self.repositories.run_repository
    }
}

impl RunExecutor {
    pub fn new(
        repositories: Arc<RepositoryModule>,
        registry: Arc<AgentRegistry>,
        step_buffer: Arc<StepBuffer>,
        job_queue_config: Arc<JobQueueConfig>,
    ) -> Self {
        Self {
            repositories,
            registry,
            step_buffer,
            job_queue_config,
        }
    }

    pub async fn execute(&self, envelope: &JobEnvelope) -> Result<ExecutionOutcome> {
        let run_id = envelope.run_id;
        let run = match self.run_repository().find(&run_id).await? {
            Some(run) => run,
            None => {
                tracing::warn!(run_id = run_id.value, "run of job not found, drop job");
                return Ok(ExecutionOutcome::Skipped);
            }
        };
        if run.status.is_terminal() || run.status == RunStatus::AwaitingInput {
            tracing::debug!(run_id = run_id.value, status = %run.status, "run not runnable, skip");
            return Ok(ExecutionOutcome::Skipped);
        }
        if !self
            .run_repository()
            .transition(&run_id, RunStatus::Running, None, None)
            .await
            .context("failed to start run")?
        {
            // cancelled between find and transition
            tracing::debug!(run_id = run_id.value, "run changed before start, skip");
            return Ok(ExecutionOutcome::Skipped);
        }
        tracing::info!(run_id = run_id.value, "run started");

        let (handler, instance) = match self.resolve_handler(&run).await? {
            Ok(found) => found,
            Err(reason) => {
                tracing::warn!(run_id = run_id.value, "cannot execute run: {}", &reason);
                return self.finish(&run_id, RunStatus::Failed, Some(reason), None).await;
            }
        };

        // re-execution of a stalled job appends after the stored steps
        let first_idx = self
            .repositories
            .step_repository()
            .max_idx(&run_id)
            .await?
            .unwrap_or(0)
            + 1;
        let ctx = StepContext::new(
            run_id,
            first_idx,
            self.step_buffer.clone(),
            self.run_repository().clone(),
        );
        let request = AgentRequest {
            run_id,
            input: run.input.clone(),
            mode: run.mode,
            user_id: run.user_id.clone(),
            credentials: instance.credentials,
        };
        let res = self.run_handler(handler.as_ref(), request, &ctx).await;

        // every step must be readable once the final status is visible
        self.step_buffer.flush().await;

        match res {
            Ok(AgentOutcome::Completed(result)) => {
                self.finish(&run_id, RunStatus::Completed, None, Some(result))
                    .await
            }
            Ok(AgentOutcome::AwaitingInput(prompt)) => {
                self.finish(&run_id, RunStatus::AwaitingInput, None, Some(prompt))
                    .await
            }
            Err(e) => {
                if AgentRunError::is_cancelled(&e) {
                    tracing::info!(run_id = run_id.value, "handler stopped: run cancelled");
                } else {
                    tracing::warn!(run_id = run_id.value, "handler failed: {:#}", e);
                }
                // a cancelled run does not match the RUNNING guard and keeps its status
                self.finish(&run_id, RunStatus::Failed, Some(format!("{:#}", e)), None)
                    .await
            }
        }
    }

    /// Ok(Err(reason)) when the run can never be executed
    async fn resolve_handler(
        &self,
        run: &Run,
    ) -> Result<std::result::Result<(Arc<dyn AgentHandler>, AgentInstance), String>> {
        let instance = match self
            .repositories
            .agent_instance_repository()
            .find(&run.agent_instance_id)
            .await?
        {
            Some(instance) if instance.user_id == run.user_id => instance,
            _ => {
                return Ok(Err(AgentRunError::NotFound(format!(
                    "agent instance not found: {}",
                    run.agent_instance_id
                ))
                .to_string()))
            }
        };
        match self.registry.get(&instance.agent_name) {
            Some(handler) => Ok(Ok((handler, instance))),
            None => Ok(Err(AgentRunError::AgentNotFound(format!(
                "unknown agent: {}",
                instance.agent_name
            ))
            .to_string())),
        }
    }

    async fn run_handler(
        &self,
        handler: &dyn AgentHandler,
        request: AgentRequest,
        ctx: &StepContext,
    ) -> Result<AgentOutcome> {
        let name = handler.name().to_string();
        let timeout = self.job_queue_config.lease_timeout_msec;
        let fut = AssertUnwindSafe(handler.run(request, ctx)).catch_unwind();
        // always bounded: the lease ends GRAB_MERGIN_MILLISEC after this timeout
        let res = tokio::select! {
            r = fut => r,
            _ = tokio::time::sleep(Duration::from_millis(timeout)) => {
                tracing::warn!(run_id = ctx.run_id().value, "timeout: agent {} ran over {}ms", &name, timeout);
                return Err(AgentRunError::TimeoutError(format!("timeout: {}ms", timeout)).into());
            }
        };
        res.map_err(|e| {
            let msg = format!("Caught panic from agent {}: {}", &name, panic_message(e.as_ref()));
            tracing::error!(run_id = ctx.run_id().value, "{}", &msg);
            anyhow!(msg)
        })?
    }

    async fn finish(
        &self,
        run_id: &RunId,
        status: RunStatus,
        error: Option<String>,
        result: Option<serde_json::Value>,
    ) -> Result<ExecutionOutcome> {
        if self
            .run_repository()
            .transition(run_id, status, error, result)
            .await
            .context("failed to finish run")?
        {
            tracing::info!(run_id = run_id.value, status = %status, "run finished");
            return Ok(ExecutionOutcome::Finished(status));
        }
        // only a terminal row refuses RUNNING -> *
        let current = self.run_repository().find_status(run_id).await?;
        tracing::info!(
            run_id = run_id.value,
            "run already {:?}, {} not recorded",
            current,
            status
        );
        Ok(ExecutionOutcome::Finished(current.unwrap_or(status)))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

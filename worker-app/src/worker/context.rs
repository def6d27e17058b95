use super::step_buffer::StepBuffer;
use agentrun_base::data::{RunId, RunStatus, Step};
use agentrun_base::error::AgentRunError;
use agentrun_base::limits::MAX_STEP_NAME_LENGTH;
use anyhow::Result;
use common::util::datetime;
use infra::infra::run::rdb::{RdbRunRepository, RdbRunRepositoryImpl};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Per-run handle passed to an agent handler.
///
/// Steps go through the process-wide [`StepBuffer`]. Cancellation is
/// cooperative: [`StepContext::append_step`] and [`StepContext::check_cancelled`]
/// read the run status and return `CancelledError` once the run is CANCELLED.
#[derive(Clone, Debug)]
pub struct StepContext {
    run_id: RunId,
    next_idx: Arc<Mutex<i64>>,
    step_buffer: Arc<StepBuffer>,
    run_repository: RdbRunRepositoryImpl,
}

impl StepContext {
    pub fn new(
        run_id: RunId,
        first_idx: i64,
        step_buffer: Arc<StepBuffer>,
        run_repository: RdbRunRepositoryImpl,
    ) -> Self {
        Self {
            run_id,
            next_idx: Arc::new(Mutex::new(first_idx)),
            step_buffer,
            run_repository,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// record a step. returns its index.
    pub async fn append_step(&self, name: &str, output: serde_json::Value) -> Result<i64> {
        if name.is_empty() || name.len() > MAX_STEP_NAME_LENGTH {
            return Err(AgentRunError::InvalidParameter(format!(
                "step name must be 1 to {} bytes: {:?}",
                MAX_STEP_NAME_LENGTH, name
            ))
            .into());
        }
        self.check_cancelled().await?;
        // held until the step is buffered: buffer order follows idx order
        let mut next_idx = self.next_idx.lock().await;
        let idx = *next_idx;
        *next_idx += 1;
        self.step_buffer
            .append(Step {
                run_id: self.run_id,
                idx,
                name: name.to_string(),
                output,
                error: None,
                created_at: datetime::now_millis(),
            })
            .await;
        Ok(idx)
    }

    pub async fn check_cancelled(&self) -> Result<()> {
        match self.run_repository.find_status(&self.run_id).await? {
            Some(RunStatus::Cancelled) => Err(AgentRunError::CancelledError(format!(
                "run {} was cancelled",
                self.run_id
            ))
            .into()),
            Some(_) => Ok(()),
            None => Err(AgentRunError::NotFound(format!("run not found: {}", self.run_id)).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrun_base::data::RunMode;
    use app::app::StepBufferConfig;
    use app::module::test::create_test_app;
    use async_trait::async_trait;
    use infra::infra::step::StepWriter;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingWriter {
        idx: StdMutex<Vec<i64>>,
    }

    #[async_trait]
    impl StepWriter for RecordingWriter {
        async fn insert_batch(&self, steps: &[Step]) -> Result<u64> {
            self.idx.lock().unwrap().extend(steps.iter().map(|s| s.idx));
            Ok(steps.len() as u64)
        }
        async fn insert(&self, step: &Step) -> Result<bool> {
            self.idx.lock().unwrap().push(step.idx);
            Ok(true)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_reach_buffer_in_idx_order() -> Result<()> {
        let app = create_test_app().await?;
        let instance_id = app
            .agent_instance_app
            .create_agent_instance("u1", "echo", json!({}))
            .await?;
        let run_id = app
            .run_app
            .submit_run("u1", &instance_id, json!({}), RunMode::Live)
            .await?;
        let writer = Arc::new(RecordingWriter::default());
        let buffer = Arc::new(StepBuffer::new(
            writer.clone(),
            Arc::new(StepBufferConfig {
                max_entries: 7,
                flush_interval_msec: 60_000,
            }),
        ));
        let ctx = StepContext::new(
            run_id,
            1,
            buffer.clone(),
            app.repositories.run_repository.clone(),
        );
        let tasks = (0..8)
            .map(|t| {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    for i in 0..5 {
                        ctx.append_step(&format!("t{}-{}", t, i), json!({})).await?;
                    }
                    Ok::<_, anyhow::Error>(())
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await??;
        }
        buffer.flush().await;
        let written = writer.idx.lock().unwrap().clone();
        assert_eq!(written, (1..=40).collect::<Vec<i64>>());
        Ok(())
    }

    #[tokio::test]
    async fn test_append_rejects_bad_name_and_cancelled_run() -> Result<()> {
        let app = create_test_app().await?;
        let instance_id = app
            .agent_instance_app
            .create_agent_instance("u1", "echo", json!({}))
            .await?;
        let run_id = app
            .run_app
            .submit_run("u1", &instance_id, json!({}), RunMode::Live)
            .await?;
        let buffer = Arc::new(StepBuffer::new(
            app.repositories.step_writer(),
            app.config_module.step_buffer_config.clone(),
        ));
        let ctx = StepContext::new(run_id, 1, buffer, app.repositories.run_repository.clone());
        let err = ctx.append_step("", json!({})).await.unwrap_err();
        assert!(matches!(
            AgentRunError::find_in(&err),
            Some(AgentRunError::InvalidParameter(_))
        ));
        assert_eq!(ctx.append_step("first", json!({})).await?, 1);

        app.run_app.cancel_run("u1", &run_id).await?;
        let err = ctx.append_step("second", json!({})).await.unwrap_err();
        assert!(matches!(
            AgentRunError::find_in(&err),
            Some(AgentRunError::CancelledError(_))
        ));
        Ok(())
    }
}

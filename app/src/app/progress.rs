use super::{ProgressConfig, UseProgressConfig};
use agentrun_base::data::{ProgressEvent, RunId, RunStatus};
use agentrun_base::error::AgentRunError;
use agentrun_base::limits::MAX_LIMIT;
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use infra::infra::module::RepositoryModule;
use infra::infra::run::rdb::RdbRunRepository;
use infra::infra::step::rdb::RdbStepRepository;
use std::{fmt, sync::Arc, time::Duration};

#[async_trait]
pub trait RunProgressApp: fmt::Debug + Send + Sync {
    /// Live progress of one run as a lazy, finite stream.
    ///
    /// Every poll reads the run first and then the steps after the last
    /// emitted index, so a terminal status is only observed after all steps
    /// written before it. New steps are yielded in index order, then a status
    /// event if the status changed. The stream ends after the status event of
    /// a terminal or AWAITING_INPUT run. A stream cannot be resumed: a new
    /// one starts from the first step again.
    async fn stream_progress(
        &self,
        user_id: &str,
        run_id: &RunId,
    ) -> Result<BoxStream<'static, Result<ProgressEvent>>>;
}

#[derive(Clone, Debug)]
pub struct RunProgressAppImpl {
    progress_config: Arc<ProgressConfig>,
    repositories: Arc<RepositoryModule>,
}

impl RunProgressAppImpl {
    pub fn new(progress_config: Arc<ProgressConfig>, repositories: Arc<RepositoryModule>) -> Self {
        Self {
            progress_config,
            repositories,
        }
    }

    fn is_final(status: RunStatus) -> bool {
        status.is_terminal() || status == RunStatus::AwaitingInput
    }
}

impl UseProgressConfig for RunProgressAppImpl {
    fn progress_config(&self) -> &ProgressConfig {
        &self.progress_config
    }
}

#[async_trait]
impl RunProgressApp for RunProgressAppImpl {
    async fn stream_progress(
        &self,
        user_id: &str,
        run_id: &RunId,
    ) -> Result<BoxStream<'static, Result<ProgressEvent>>> {
        match self.repositories.run_repository.find(run_id).await? {
            Some(run) if run.user_id == user_id => {}
            _ => return Err(AgentRunError::NotFound(format!("run not found: {}", run_id)).into()),
        }
        let runs = self.repositories.run_repository.clone();
        let steps = self.repositories.step_repository.clone();
        let poll_interval = Duration::from_millis(self.progress_config().poll_interval_msec);
        let run_id = *run_id;

        let stream = async_stream::try_stream! {
            let mut last_status: Option<RunStatus> = None;
            let mut last_idx: i64 = 0;
            loop {
                let run = runs.find(&run_id).await?.ok_or_else(|| {
                    AgentRunError::NotFound(format!("run disappeared: {}", run_id))
                })?;
                loop {
                    let new_steps = steps.find_after(&run_id, last_idx, MAX_LIMIT).await?;
                    let fetched = new_steps.len();
                    for step in new_steps {
                        last_idx = step.idx;
                        yield ProgressEvent::Step(step);
                    }
                    if fetched < MAX_LIMIT as usize {
                        break;
                    }
                }
                if last_status != Some(run.status) {
                    last_status = Some(run.status);
                    yield ProgressEvent::Status {
                        run_id,
                        status: run.status,
                        error: run.error.clone(),
                        result: run.result.clone(),
                    };
                }
                if Self::is_final(run.status) {
                    tracing::debug!("progress stream of run {} finished: {}", run_id, run.status);
                    break;
                }
                tokio::time::sleep(poll_interval).await;
            }
        };
        Ok(Box::pin(stream))
    }
}

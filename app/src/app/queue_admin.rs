use agentrun_base::data::{JobCounts, JobState, QueuedJob, RunId};
use agentrun_base::limits;
use anyhow::Result;
use async_trait::async_trait;
use infra::infra::job::queue::{JobQueueRepository, UseJobQueueRepository};
use std::{fmt, sync::Arc};

/// manual inspection and remediation of the job queue (dead letters included)
#[async_trait]
pub trait QueueAdminApp: fmt::Debug + Send + Sync {
    async fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: Option<i32>,
        offset: Option<i64>,
    ) -> Result<Vec<QueuedJob>>;
    async fn counts(&self) -> Result<JobCounts>;
    async fn find_job(&self, run_id: &RunId) -> Result<Option<QueuedJob>>;
    async fn retry_dead_job(&self, run_id: &RunId) -> Result<bool>;
    async fn remove_job(&self, run_id: &RunId) -> Result<bool>;
}

#[derive(Clone)]
pub struct QueueAdminAppImpl {
    job_queue_repository: Arc<dyn JobQueueRepository>,
}

impl QueueAdminAppImpl {
    pub fn new(job_queue_repository: Arc<dyn JobQueueRepository>) -> Self {
        Self {
            job_queue_repository,
        }
    }
}

impl fmt::Debug for QueueAdminAppImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueAdminAppImpl").finish()
    }
}

impl UseJobQueueRepository for QueueAdminAppImpl {
    fn job_queue_repository(&self) -> Arc<dyn JobQueueRepository> {
        self.job_queue_repository.clone()
    }
}

#[async_trait]
impl QueueAdminApp for QueueAdminAppImpl {
    async fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: Option<i32>,
        offset: Option<i64>,
    ) -> Result<Vec<QueuedJob>> {
        let (limit, offset) = limits::clamp_page(limit, offset);
        self.job_queue_repository()
            .list(state, limit as u32, offset as u64)
            .await
    }

    async fn counts(&self) -> Result<JobCounts> {
        self.job_queue_repository().count_by_state().await
    }

    async fn find_job(&self, run_id: &RunId) -> Result<Option<QueuedJob>> {
        self.job_queue_repository().find(run_id).await
    }

    async fn retry_dead_job(&self, run_id: &RunId) -> Result<bool> {
        let retried = self.job_queue_repository().retry_dead(run_id).await?;
        if retried {
            tracing::info!(run_id = run_id.value, "dead-lettered job moved back to waiting");
        }
        Ok(retried)
    }

    async fn remove_job(&self, run_id: &RunId) -> Result<bool> {
        let removed = self.job_queue_repository().remove(run_id).await?;
        if removed {
            tracing::info!(run_id = run_id.value, "job removed from queue");
        }
        Ok(removed)
    }
}

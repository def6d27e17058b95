pub mod rdb;
pub mod redis;

use agentrun_base::data::{FailOutcome, JobCounts, JobEnvelope, JobState, QueuedJob, RunId};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Durable queue of run jobs.
///
/// The job id is the run id: while a job for a run is live (waiting, delayed,
/// leased or dead-lettered) a second enqueue of the same run is a no-op.
/// A leased job is invisible to other workers until its lease expires; an
/// expired lease makes it fetchable again (stalled job recovery).
#[async_trait]
pub trait JobQueueRepository: Send + Sync + 'static {
    /// false if a job for the same run already exists (deduplicated)
    async fn enqueue(&self, envelope: &JobEnvelope) -> Result<bool>;

    /// lease up to `limit` runnable jobs (attempts is incremented per lease).
    /// stalled jobs that already used all attempts are dead-lettered instead.
    async fn fetch_and_lease(&self, limit: u32) -> Result<Vec<QueuedJob>>;

    /// remove a finished job. `job` is the lease returned by `fetch_and_lease`:
    /// false (nothing removed) once that lease expired and the job was leased
    /// again, or the job was dead-lettered or removed.
    async fn complete(&self, job: &QueuedJob) -> Result<bool>;

    /// infrastructure failure of a leased job: retry with backoff or dead-letter.
    /// `LeaseLost` if `job`'s lease is no longer the current one.
    async fn fail(&self, job: &QueuedJob, reason: &str) -> Result<FailOutcome>;

    async fn find(&self, run_id: &RunId) -> Result<Option<QueuedJob>>;

    async fn list(&self, state: Option<JobState>, limit: u32, offset: u64)
        -> Result<Vec<QueuedJob>>;

    async fn count_by_state(&self) -> Result<JobCounts>;

    /// move a dead-lettered job back to waiting with fresh attempts
    async fn retry_dead(&self, run_id: &RunId) -> Result<bool>;

    async fn remove(&self, run_id: &RunId) -> Result<bool>;
}

pub trait UseJobQueueRepository {
    fn job_queue_repository(&self) -> Arc<dyn JobQueueRepository>;
}

use super::executor::{ExecutionOutcome, RunExecutor};
use super::step_buffer::StepBuffer;
use agentrun_base::data::{FailOutcome, JobEnvelope, QueuedJob, RunId, RunStatus};
use agentrun_base::error::AgentRunError;
use anyhow::Result;
use app::app::{UseWorkerConfig, WorkerConfig};
use common::util::result::TapErr;
use common::util::shutdown::{ShutdownLock, ShutdownSignal};
use futures::{stream, StreamExt};
use infra::infra::job::queue::{JobQueueRepository, UseJobQueueRepository};
use infra::infra::run::rdb::{RdbRunRepository, RdbRunRepositoryImpl, UseRdbRunRepository};
use infra::infra::{JobQueueConfig, UseJobQueueConfig};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Polls the job queue, leases up to `concurrency` jobs at a time and runs
/// them concurrently through the [`RunExecutor`].
pub struct JobDispatcherImpl {
    executor: Arc<RunExecutor>,
    job_queue_repository: Arc<dyn JobQueueRepository>,
    run_repository: RdbRunRepositoryImpl,
    step_buffer: Arc<StepBuffer>,
    worker_config: Arc<WorkerConfig>,
    job_queue_config: Arc<JobQueueConfig>,
}

impl fmt::Debug for JobDispatcherImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDispatcherImpl")
            .field("executor", &self.executor)
            .field("step_buffer", &self.step_buffer)
            .field("worker_config", &self.worker_config)
            .field("job_queue_config", &self.job_queue_config)
            .finish_non_exhaustive()
    }
}

impl UseJobQueueRepository for JobDispatcherImpl {
    fn job_queue_repository(&self) -> Arc<dyn JobQueueRepository> {
        self.job_queue_repository.clone()
    }
}
impl UseRdbRunRepository for JobDispatcherImpl {
    fn run_repository(&self) -> &RdbRunRepositoryImpl {
        &self.run_repository
    }
}
impl UseWorkerConfig for JobDispatcherImpl {
    fn worker_config(&self) -> &WorkerConfig {
        &self.worker_config
    }
}
impl UseJobQueueConfig for JobDispatcherImpl {
    fn job_queue_config(&self) -> &JobQueueConfig {
        &self.job_queue_config
    }
}

impl JobDispatcherImpl {
    pub fn new(
        executor: Arc<RunExecutor>,
        job_queue_repository: Arc<dyn JobQueueRepository>,
        run_repository: RdbRunRepositoryImpl,
        step_buffer: Arc<StepBuffer>,
        worker_config: Arc<WorkerConfig>,
        job_queue_config: Arc<JobQueueConfig>,
    ) -> Self {
        Self {
            executor,
            job_queue_repository,
            run_repository,
            step_buffer,
            worker_config,
            job_queue_config,
        }
    }

    fn concurrency(&self) -> u32 {
        self.worker_config().concurrency.max(1)
    }

    /// Spawn the polling loop. Jobs already leased are finished before the
    /// loop stops on shutdown; the step buffer is flushed last.
    pub fn dispatch_jobs(
        self: Arc<Self>,
        lock: ShutdownLock,
        mut shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        let interval = Duration::from_millis(self.job_queue_config().fetch_interval as u64);
        tracing::info!(
            "start dispatching jobs: concurrency = {}, fetch interval = {:?}",
            self.concurrency(),
            interval
        );
        tokio::spawn(async move {
            while !shutdown.is_shutdown() {
                let fetched = self
                    .pop_and_execute()
                    .await
                    .tap_err(|e| tracing::error!("failed to pop and execute: {:?}", e))
                    .unwrap_or(0);
                if fetched > 0 {
                    // more work may be waiting
                    continue;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.recv() => {
                        tracing::debug!("break dispatch loop");
                        break;
                    }
                }
            }
            self.step_buffer.flush().await;
            tracing::info!("job dispatcher stopped");
            lock.unlock();
        })
    }

    /// lease a batch of jobs and execute them. returns the number leased.
    pub async fn pop_and_execute(self: &Arc<Self>) -> Result<usize> {
        let conc = self.concurrency();
        let jobs = self.job_queue_repository().fetch_and_lease(conc).await?;
        let len = jobs.len();
        if len == 0 {
            return Ok(0);
        }
        tracing::debug!("leased {} jobs", len);
        let results = stream::iter(jobs)
            .map(|job| {
                let this = self.clone();
                // spawn async task for each job
                tokio::spawn(async move { this.process_job(job).await })
            })
            .buffered(conc as usize)
            .collect::<Vec<_>>()
            .await;
        for res in results {
            if let Err(e) = res {
                // the lease expires and the job is recovered as stalled
                tracing::error!("job task aborted: {:?}", e);
            }
        }
        Ok(len)
    }

    async fn process_job(&self, job: QueuedJob) {
        let run_id = job.envelope.run_id;
        tracing::debug!(
            run_id = run_id.value,
            attempts = job.attempts,
            "process job"
        );
        match self.executor.execute(&job.envelope).await {
            Ok(outcome) => self.on_executed(&job, outcome).await,
            Err(e) => self.handle_error(&job, e).await,
        }
    }

    async fn on_executed(&self, job: &QueuedJob, outcome: ExecutionOutcome) {
        let run_id = job.envelope.run_id;
        tracing::debug!(run_id = run_id.value, "job done: {:?}", outcome);
        if self.complete(job).await
            && matches!(
                outcome,
                ExecutionOutcome::Skipped | ExecutionOutcome::Finished(RunStatus::AwaitingInput)
            )
        {
            self.requeue_if_resumed(&run_id).await;
        }
    }

    async fn complete(&self, job: &QueuedJob) -> bool {
        let run_id = job.envelope.run_id;
        self.job_queue_repository()
            .complete(job)
            .await
            .tap_err(|e| tracing::error!(run_id = run_id.value, "failed to complete job: {:?}", e))
            .unwrap_or(false)
    }

    // a resume while this job was still queued could not enqueue a new job
    async fn requeue_if_resumed(&self, run_id: &RunId) {
        let run = match self.run_repository().find(run_id).await {
            Ok(Some(run)) if run.status == RunStatus::Pending => run,
            Ok(_) => return,
            Err(e) => {
                // reconcile_pending picks the run up later
                tracing::error!(run_id = run_id.value, "failed to find run: {:?}", e);
                return;
            }
        };
        match self
            .job_queue_repository()
            .enqueue(&JobEnvelope::from_run(&run))
            .await
        {
            Ok(true) => tracing::info!(run_id = run_id.value, "resumed run requeued"),
            Ok(false) => {}
            Err(e) => tracing::error!(run_id = run_id.value, "failed to requeue run: {:?}", e),
        }
    }

    async fn handle_error(&self, job: &QueuedJob, err: anyhow::Error) {
        let run_id = job.envelope.run_id;
        let reason = format!("{:#}", err);
        if AgentRunError::find_in(&err).is_some_and(|e| e.is_permanent()) {
            // retrying cannot help: fail the run itself if it is still running
            match self
                .run_repository()
                .transition(&run_id, RunStatus::Failed, Some(reason.clone()), None)
                .await
            {
                Ok(true) => {
                    tracing::warn!(run_id = run_id.value, "run failed permanently: {}", &reason);
                    self.complete(job).await;
                    return;
                }
                Ok(false) => {}
                Err(e) => tracing::error!(run_id = run_id.value, "failed to fail run: {:?}", e),
            }
        }
        tracing::warn!(run_id = run_id.value, "job failed: {}", &reason);
        match self.job_queue_repository().fail(job, &reason).await {
            Ok(FailOutcome::Retrying { run_after_time }) => tracing::info!(
                run_id = run_id.value,
                attempts = job.attempts,
                run_after_time,
                "job will be retried"
            ),
            Ok(FailOutcome::DeadLettered) => tracing::error!(
                run_id = run_id.value,
                attempts = job.attempts,
                "job dead-lettered: {}",
                &reason
            ),
            Ok(FailOutcome::LeaseLost) => tracing::warn!(
                run_id = run_id.value,
                attempts = job.attempts,
                "job lease expired before the failure was recorded"
            ),
            Err(e) => tracing::error!(run_id = run_id.value, "failed to fail job: {:?}", e),
        }
    }
}

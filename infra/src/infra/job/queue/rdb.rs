use super::JobQueueRepository;
use crate::infra::job::rows::{JobRow, STATE_ACTIVE, STATE_FAILED, STATE_WAITING};
use crate::infra::{JobQueueConfig, UseJobQueueConfig};
use agentrun_base::codec::UseJsonCodec;
use agentrun_base::data::{FailOutcome, JobCounts, JobEnvelope, JobState, QueuedJob, RunId};
use agentrun_base::error::AgentRunError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::infra::rdb::{Rdb, RdbPool, UseRdbPool};
use common::util::datetime;
use std::sync::Arc;

#[cfg(not(feature = "mysql"))]
const INSERT_IGNORE: &str = "INSERT OR IGNORE";
#[cfg(feature = "mysql")]
const INSERT_IGNORE: &str = "INSERT IGNORE";

#[async_trait]
pub trait RdbJobQueueRepository: UseRdbPool + UseJobQueueConfig + UseJsonCodec + Sync + Send {
    async fn insert_job(&self, envelope: &JobEnvelope) -> Result<bool> {
        let query = format!(
            "{} INTO job (
              id,
              envelope,
              state,
              attempts,
              max_attempts,
              enqueue_time,
              run_after_time,
              grabbed_until_time
            ) VALUES (?,?,?,0,?,?,0,0)",
            INSERT_IGNORE
        );
        let res = sqlx::query::<Rdb>(&query)
            .bind(envelope.idempotency_key().value)
            .bind(Self::serialize_message(envelope)?)
            .bind(STATE_WAITING)
            .bind(self.job_queue_config().max_attempts as i64)
            .bind(datetime::now_millis())
            .execute(self.db_pool())
            .await
            .map_err(AgentRunError::DBError)
            .context(format!("error in enqueue job: run = {}", envelope.run_id))?;
        Ok(res.rows_affected() > 0)
    }

    /// runnable now: waiting and due, or leased with an expired lease (stalled)
    async fn fetch_jobs_to_process(&self, now: i64, limit: u32) -> Result<Vec<JobRow>> {
        sqlx::query_as::<Rdb, JobRow>(
            r#"
            SELECT * FROM job
            WHERE (state = ? AND run_after_time <= ?)
               OR (state = ? AND grabbed_until_time <= ?)
            ORDER BY run_after_time, enqueue_time
            LIMIT ?
            "#,
        )
        .bind(STATE_WAITING)
        .bind(now)
        .bind(STATE_ACTIVE)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(self.db_pool())
        .await
        .map_err(AgentRunError::DBError)
        .context("failed to fetch jobs to process")
    }

    /// grab(lock) job to prevent other workers from processing it.
    /// succeeds only if nobody grabbed the row since it was read.
    async fn grab_job(&self, row: &JobRow, grabbed_until_time: i64) -> Result<bool> {
        let res = sqlx::query::<Rdb>(
            r#"
            UPDATE job
            SET state = ?, attempts = attempts + 1, grabbed_until_time = ?
            WHERE id = ? AND state = ? AND grabbed_until_time = ? AND attempts = ?
            "#,
        )
        .bind(STATE_ACTIVE)
        .bind(grabbed_until_time)
        .bind(row.id)
        .bind(&row.state)
        .bind(row.grabbed_until_time)
        .bind(row.attempts)
        .execute(self.db_pool())
        .await
        .map_err(AgentRunError::DBError)
        .context(format!("failed to grab job: id = {}", row.id))?;
        Ok(res.rows_affected() > 0)
    }

    /// dead-letter the job if it is still in the observed (state, lease)
    async fn dead_letter(&self, row: &JobRow, reason: &str) -> Result<bool> {
        let res = sqlx::query::<Rdb>(
            r#"
            UPDATE job
            SET state = ?, grabbed_until_time = 0, failed_reason = ?
            WHERE id = ? AND state = ? AND grabbed_until_time = ?
            "#,
        )
        .bind(STATE_FAILED)
        .bind(reason)
        .bind(row.id)
        .bind(&row.state)
        .bind(row.grabbed_until_time)
        .execute(self.db_pool())
        .await
        .map_err(AgentRunError::DBError)
        .context(format!("failed to dead-letter job: id = {}", row.id))?;
        Ok(res.rows_affected() > 0)
    }

    async fn find_row(&self, id: i64) -> Result<Option<JobRow>> {
        sqlx::query_as::<Rdb, JobRow>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db_pool())
            .await
            .map_err(AgentRunError::DBError)
            .context(format!("failed to find job: id = {}", id))
    }

    async fn count_where(&self, where_clause: &str, state: &str, now: Option<i64>) -> Result<i64> {
        let query = format!("SELECT count(*) FROM job WHERE {}", where_clause);
        let mut q = sqlx::query_scalar::<Rdb, i64>(&query).bind(state);
        if let Some(now) = now {
            q = q.bind(now);
        }
        q.fetch_one(self.db_pool())
            .await
            .map_err(AgentRunError::DBError)
            .context("failed to count jobs")
    }
}

#[derive(Clone, Debug)]
pub struct RdbJobQueueRepositoryImpl {
    pool: RdbPool,
    job_queue_config: Arc<JobQueueConfig>,
}

impl RdbJobQueueRepositoryImpl {
    pub fn new(pool: RdbPool, job_queue_config: Arc<JobQueueConfig>) -> Self {
        Self {
            pool,
            job_queue_config,
        }
    }
}

impl UseRdbPool for RdbJobQueueRepositoryImpl {
    fn db_pool(&self) -> &RdbPool {
        &self.pool
    }
}
impl UseJobQueueConfig for RdbJobQueueRepositoryImpl {
    fn job_queue_config(&self) -> &JobQueueConfig {
        &self.job_queue_config
    }
}
impl UseJsonCodec for RdbJobQueueRepositoryImpl {}
impl RdbJobQueueRepository for RdbJobQueueRepositoryImpl {}

#[async_trait]
impl JobQueueRepository for RdbJobQueueRepositoryImpl {
    async fn enqueue(&self, envelope: &JobEnvelope) -> Result<bool> {
        let inserted = self.insert_job(envelope).await?;
        if !inserted {
            tracing::debug!("job for run {} already queued: deduplicated", envelope.run_id);
        }
        Ok(inserted)
    }

    async fn fetch_and_lease(&self, limit: u32) -> Result<Vec<QueuedJob>> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let now = datetime::now_millis();
        let grabbed_until_time = now + self.job_queue_config().lease_msec();
        let rows = self.fetch_jobs_to_process(now, limit).await?;
        let mut leased = Vec::with_capacity(rows.len());
        for row in rows {
            if row.state == STATE_ACTIVE && row.attempts >= row.max_attempts {
                // stalled on its last attempt
                let reason = format!("lease expired after {} attempts", row.attempts);
                if self.dead_letter(&row, &reason).await? {
                    tracing::warn!("job dead-lettered: run = {}, {}", row.id, &reason);
                }
                continue;
            }
            if row.state == STATE_ACTIVE {
                tracing::info!(
                    "recover stalled job: run = {}, attempts = {}",
                    row.id,
                    row.attempts
                );
            }
            if !self.grab_job(&row, grabbed_until_time).await? {
                tracing::debug!("job already grabbed by other worker: run = {}", row.id);
                continue;
            }
            let grabbed = JobRow {
                state: STATE_ACTIVE.to_string(),
                attempts: row.attempts + 1,
                grabbed_until_time,
                ..row
            };
            match grabbed.to_queued_job(now) {
                Ok(job) => leased.push(job),
                Err(e) => {
                    // a broken envelope can never run
                    tracing::error!("invalid job row: id = {}: {:?}", grabbed.id, e);
                    self.dead_letter(&grabbed, &format!("invalid job: {}", e))
                        .await?;
                }
            }
        }
        Ok(leased)
    }

    async fn complete(&self, job: &QueuedJob) -> Result<bool> {
        let run_id = job.envelope.run_id;
        let res = sqlx::query::<Rdb>(
            "DELETE FROM job WHERE id = ? AND state = ? AND grabbed_until_time = ?",
        )
        .bind(run_id.value)
        .bind(STATE_ACTIVE)
        .bind(job.grabbed_until_time)
        .execute(self.db_pool())
        .await
        .map_err(AgentRunError::DBError)
        .context(format!("failed to complete job: run = {}", run_id))?;
        if res.rows_affected() == 0 {
            tracing::warn!("job not completed (lease lost or job gone): run = {}", run_id);
        }
        Ok(res.rows_affected() > 0)
    }

    async fn fail(&self, job: &QueuedJob, reason: &str) -> Result<FailOutcome> {
        let run_id = job.envelope.run_id;
        let row = self.find_row(run_id.value).await?.ok_or_else(|| {
            AgentRunError::NotFound(format!("job not found: run = {}", run_id))
        })?;
        if row.state == STATE_FAILED {
            return Ok(FailOutcome::DeadLettered);
        }
        if row.state != STATE_ACTIVE || row.grabbed_until_time != job.grabbed_until_time {
            tracing::warn!("job not failed (lease lost): run = {}", run_id);
            return Ok(FailOutcome::LeaseLost);
        }
        if row.attempts >= row.max_attempts {
            if !self.dead_letter(&row, reason).await? {
                return Ok(FailOutcome::LeaseLost);
            }
            tracing::warn!(
                "job dead-lettered: run = {}, attempts = {}: {}",
                run_id,
                row.attempts,
                reason
            );
            return Ok(FailOutcome::DeadLettered);
        }
        let run_after_time = datetime::now_millis()
            + self.job_queue_config().retry_delay_msec(row.attempts.max(1) as u32) as i64;
        let res = sqlx::query::<Rdb>(
            r#"
            UPDATE job
            SET state = ?, grabbed_until_time = 0, run_after_time = ?, failed_reason = ?
            WHERE id = ? AND state = ? AND grabbed_until_time = ?
            "#,
        )
        .bind(STATE_WAITING)
        .bind(run_after_time)
        .bind(reason)
        .bind(row.id)
        .bind(&row.state)
        .bind(row.grabbed_until_time)
        .execute(self.db_pool())
        .await
        .map_err(AgentRunError::DBError)
        .context(format!("failed to reschedule job: run = {}", run_id))?;
        if res.rows_affected() == 0 {
            return Ok(FailOutcome::LeaseLost);
        }
        tracing::info!(
            "job rescheduled: run = {}, attempts = {}, run_after_time = {}",
            run_id,
            row.attempts,
            run_after_time
        );
        Ok(FailOutcome::Retrying { run_after_time })
    }

    async fn find(&self, run_id: &RunId) -> Result<Option<QueuedJob>> {
        let now = datetime::now_millis();
        self.find_row(run_id.value)
            .await?
            .map(|r| r.to_queued_job(now))
            .transpose()
    }

    async fn list(
        &self,
        state: Option<JobState>,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<QueuedJob>> {
        let now = datetime::now_millis();
        let (where_clause, stored, bind_now) = match state {
            None => ("1 = 1", None, false),
            Some(JobState::Waiting) => ("state = ? AND run_after_time <= ?", Some(STATE_WAITING), true),
            Some(JobState::Delayed) => ("state = ? AND run_after_time > ?", Some(STATE_WAITING), true),
            Some(JobState::Active) => ("state = ?", Some(STATE_ACTIVE), false),
            Some(JobState::Failed) => ("state = ?", Some(STATE_FAILED), false),
        };
        let query = format!(
            "SELECT * FROM job WHERE {} ORDER BY enqueue_time, id LIMIT ? OFFSET ?",
            where_clause
        );
        let mut q = sqlx::query_as::<Rdb, JobRow>(&query);
        if let Some(s) = stored {
            q = q.bind(s);
        }
        if bind_now {
            q = q.bind(now);
        }
        let rows = q
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(self.db_pool())
            .await
            .map_err(AgentRunError::DBError)
            .context("failed to list jobs")?;
        Ok(rows
            .iter()
            .flat_map(|r| {
                r.to_queued_job(now)
                    .inspect_err(|e| tracing::error!("skip invalid job row: {:?}", e))
                    .ok()
            })
            .collect())
    }

    async fn count_by_state(&self) -> Result<JobCounts> {
        let now = datetime::now_millis();
        Ok(JobCounts {
            waiting: self
                .count_where("state = ? AND run_after_time <= ?", STATE_WAITING, Some(now))
                .await?,
            delayed: self
                .count_where("state = ? AND run_after_time > ?", STATE_WAITING, Some(now))
                .await?,
            active: self.count_where("state = ?", STATE_ACTIVE, None).await?,
            failed: self.count_where("state = ?", STATE_FAILED, None).await?,
        })
    }

    async fn retry_dead(&self, run_id: &RunId) -> Result<bool> {
        let res = sqlx::query::<Rdb>(
            r#"
            UPDATE job
            SET state = ?, attempts = 0, run_after_time = 0, grabbed_until_time = 0, failed_reason = NULL
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(STATE_WAITING)
        .bind(run_id.value)
        .bind(STATE_FAILED)
        .execute(self.db_pool())
        .await
        .map_err(AgentRunError::DBError)
        .context(format!("failed to retry dead job: run = {}", run_id))?;
        Ok(res.rows_affected() > 0)
    }

    async fn remove(&self, run_id: &RunId) -> Result<bool> {
        let res = sqlx::query::<Rdb>("DELETE FROM job WHERE id = ?")
            .bind(run_id.value)
            .execute(self.db_pool())
            .await
            .map_err(AgentRunError::DBError)
            .context(format!("failed to remove job: run = {}", run_id))?;
        Ok(res.rows_affected() > 0)
    }
}

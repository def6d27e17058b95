use super::JobQueueRepository;
use crate::infra::job::rows::{JobRow, STATE_WAITING};
use crate::infra::{JobQueueConfig, UseJobQueueConfig};
use agentrun_base::codec::UseJsonCodec;
use agentrun_base::data::{FailOutcome, JobCounts, JobEnvelope, JobState, QueuedJob, RunId};
use agentrun_base::error::AgentRunError;
use anyhow::Result;
use async_trait::async_trait;
use common::infra::redis::{RedisPool, UseRedisPool};
use common::util::datetime;
use debug_stub_derive::DebugStub;
use once_cell::sync::Lazy;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;

// KEYS: job hash, wait list / ARGV: id, envelope, max_attempts, now
static ENQUEUE_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
if redis.call('HSETNX', KEYS[1], 'envelope', ARGV[2]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], 'state', 'waiting', 'attempts', 0, 'max_attempts', ARGV[3],
  'enqueue_time', ARGV[4], 'run_after_time', 0, 'grabbed_until_time', 0)
redis.call('RPUSH', KEYS[2], ARGV[1])
return 1
"#,
    )
});

// KEYS: wait, delayed, active, failed / ARGV: now, limit, grabbed_until_time, job key prefix
static FETCH_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
local now = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local until_time = ARGV[3]
local prefix = ARGV[4]
for _, id in ipairs(redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)) do
  redis.call('ZREM', KEYS[2], id)
  if redis.call('EXISTS', prefix .. id) == 1 then
    redis.call('RPUSH', KEYS[1], id)
  end
end
for _, id in ipairs(redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now)) do
  redis.call('ZREM', KEYS[3], id)
  local key = prefix .. id
  if redis.call('EXISTS', key) == 1 then
    local attempts = tonumber(redis.call('HGET', key, 'attempts') or '0')
    local max_attempts = tonumber(redis.call('HGET', key, 'max_attempts') or '0')
    if attempts >= max_attempts then
      redis.call('HSET', key, 'state', 'failed', 'grabbed_until_time', 0,
        'failed_reason', 'lease expired after ' .. attempts .. ' attempts')
      redis.call('ZADD', KEYS[4], now, id)
    else
      redis.call('HSET', key, 'state', 'waiting', 'grabbed_until_time', 0)
      redis.call('LPUSH', KEYS[1], id)
    end
  end
end
local leased = {}
while #leased < limit do
  local id = redis.call('LPOP', KEYS[1])
  if not id then
    break
  end
  local key = prefix .. id
  if redis.call('EXISTS', key) == 1 then
    redis.call('HINCRBY', key, 'attempts', 1)
    redis.call('HSET', key, 'state', 'active', 'grabbed_until_time', until_time)
    redis.call('ZADD', KEYS[3], until_time, id)
    table.insert(leased, id)
  end
end
return leased
"#,
    )
});

// KEYS: job hash, active / ARGV: id, grabbed_until_time of the lease
static COMPLETE_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active'
  or redis.call('HGET', KEYS[1], 'grabbed_until_time') ~= ARGV[2] then
  return 0
end
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[1])
return 1
"#,
    )
});

// KEYS: job hash, active, delayed, failed
// ARGV: id, grabbed_until_time of the lease, reason, now, run_after_time
// returns: -1 not found, 0 retrying, 1 dead-lettered, 2 lease lost
static FAIL_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
  return -1
end
if state == 'failed' then
  return 1
end
if state ~= 'active' or redis.call('HGET', KEYS[1], 'grabbed_until_time') ~= ARGV[2] then
  return 2
end
local attempts = tonumber(redis.call('HGET', KEYS[1], 'attempts') or '0')
local max_attempts = tonumber(redis.call('HGET', KEYS[1], 'max_attempts') or '0')
redis.call('ZREM', KEYS[2], ARGV[1])
if attempts >= max_attempts then
  redis.call('HSET', KEYS[1], 'state', 'failed', 'grabbed_until_time', 0, 'failed_reason', ARGV[3])
  redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
  return 1
end
redis.call('HSET', KEYS[1], 'state', 'waiting', 'grabbed_until_time', 0,
  'run_after_time', ARGV[5], 'failed_reason', ARGV[3])
redis.call('ZADD', KEYS[3], ARGV[5], ARGV[1])
return 0
"#,
    )
});

/// Redis layout (all keys share one hash tag so the scripts stay on one slot):
/// - `{aq}:job:<run id>`: hash (envelope, state, attempts, ...); HSETNX on envelope is the dedup gate
/// - `{aq}:wait`: list of runnable ids
/// - `{aq}:delayed`: zset scored by run_after_time
/// - `{aq}:active`: zset scored by grabbed_until_time (lease deadline)
/// - `{aq}:failed`: zset of dead-lettered ids scored by failure time
#[async_trait]
pub trait RedisJobQueueRepository:
    UseRedisPool + UseJobQueueConfig + UseJsonCodec + Sync + Send + 'static
{
    fn key_prefix(&self) -> &str;

    fn job_key(&self, run_id: i64) -> String {
        format!("{}:job:{}", self.key_prefix(), run_id)
    }
    fn wait_key(&self) -> String {
        format!("{}:wait", self.key_prefix())
    }
    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.key_prefix())
    }
    fn active_key(&self) -> String {
        format!("{}:active", self.key_prefix())
    }
    fn failed_key(&self) -> String {
        format!("{}:failed", self.key_prefix())
    }

    async fn find_row(&self, run_id: i64) -> Result<Option<JobRow>> {
        let mut con = self.redis_pool().get().await?;
        let map: HashMap<String, String> = con
            .hgetall(self.job_key(run_id))
            .await
            .map_err(AgentRunError::RedisError)?;
        if map.is_empty() {
            return Ok(None);
        }
        Self::row_from_hash(run_id, &map).map(Some)
    }

    fn row_from_hash(run_id: i64, map: &HashMap<String, String>) -> Result<JobRow> {
        let num = |field: &str| -> i64 {
            map.get(field)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0)
        };
        let envelope = map.get("envelope").cloned().ok_or_else(|| {
            AgentRunError::ParseError(format!("job {}: no envelope", run_id))
        })?;
        Ok(JobRow {
            id: run_id,
            envelope,
            state: map
                .get("state")
                .cloned()
                .unwrap_or_else(|| STATE_WAITING.to_string()),
            attempts: num("attempts"),
            max_attempts: num("max_attempts"),
            enqueue_time: num("enqueue_time"),
            run_after_time: num("run_after_time"),
            grabbed_until_time: num("grabbed_until_time"),
            failed_reason: map.get("failed_reason").filter(|s| !s.is_empty()).cloned(),
        })
    }

    async fn find_jobs(&self, ids: Vec<i64>, now: i64) -> Result<Vec<QueuedJob>> {
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.find_row(id).await? {
                Some(row) => match row.to_queued_job(now) {
                    Ok(job) => jobs.push(job),
                    Err(e) => tracing::error!("skip invalid job: id = {}: {:?}", id, e),
                },
                // removed concurrently
                None => tracing::debug!("job disappeared: id = {}", id),
            }
        }
        Ok(jobs)
    }

    async fn ids_in(&self, state: JobState, start: isize, stop: isize) -> Result<Vec<i64>> {
        let mut con = self.redis_pool().get().await?;
        let res: redis::RedisResult<Vec<i64>> = match state {
            JobState::Waiting => con.lrange(self.wait_key(), start, stop).await,
            JobState::Delayed => con.zrange(self.delayed_key(), start, stop).await,
            JobState::Active => con.zrange(self.active_key(), start, stop).await,
            JobState::Failed => con.zrange(self.failed_key(), start, stop).await,
        };
        Ok(res.map_err(AgentRunError::RedisError)?)
    }
}

#[derive(Clone, DebugStub)]
pub struct RedisJobQueueRepositoryImpl {
    #[debug_stub = "RedisPool"]
    redis_pool: RedisPool,
    job_queue_config: Arc<JobQueueConfig>,
    key_prefix: String,
}

impl RedisJobQueueRepositoryImpl {
    pub const DEFAULT_KEY_PREFIX: &'static str = "{aq}";

    pub fn new(redis_pool: RedisPool, job_queue_config: Arc<JobQueueConfig>) -> Self {
        Self::new_with_prefix(redis_pool, job_queue_config, Self::DEFAULT_KEY_PREFIX)
    }
    pub fn new_with_prefix(
        redis_pool: RedisPool,
        job_queue_config: Arc<JobQueueConfig>,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            redis_pool,
            job_queue_config,
            key_prefix: key_prefix.into(),
        }
    }
}

impl UseRedisPool for RedisJobQueueRepositoryImpl {
    fn redis_pool(&self) -> &RedisPool {
        &self.redis_pool
    }
}
impl UseJobQueueConfig for RedisJobQueueRepositoryImpl {
    fn job_queue_config(&self) -> &JobQueueConfig {
        &self.job_queue_config
    }
}
impl UseJsonCodec for RedisJobQueueRepositoryImpl {}
impl RedisJobQueueRepository for RedisJobQueueRepositoryImpl {
    fn key_prefix(&self) -> &str {
        &self.key_prefix
    }
}

#[async_trait]
impl JobQueueRepository for RedisJobQueueRepositoryImpl {
    async fn enqueue(&self, envelope: &JobEnvelope) -> Result<bool> {
        let id = envelope.idempotency_key().value;
        let mut con = self.redis_pool().get().await?;
        let res: i64 = ENQUEUE_SCRIPT
            .key(self.job_key(id))
            .key(self.wait_key())
            .arg(id)
            .arg(Self::serialize_message(envelope)?)
            .arg(self.job_queue_config().max_attempts)
            .arg(datetime::now_millis())
            .invoke_async(&mut con)
            .await
            .map_err(AgentRunError::RedisError)?;
        if res == 0 {
            tracing::debug!("job for run {} already queued: deduplicated", id);
        }
        Ok(res > 0)
    }

    async fn fetch_and_lease(&self, limit: u32) -> Result<Vec<QueuedJob>> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let now = datetime::now_millis();
        let grabbed_until_time = now + self.job_queue_config().lease_msec();
        let ids: Vec<i64> = {
            let mut con = self.redis_pool().get().await?;
            FETCH_SCRIPT
                .key(self.wait_key())
                .key(self.delayed_key())
                .key(self.active_key())
                .key(self.failed_key())
                .arg(now)
                .arg(limit)
                .arg(grabbed_until_time)
                .arg(format!("{}:job:", self.key_prefix()))
                .invoke_async(&mut con)
                .await
                .map_err(AgentRunError::RedisError)?
        };
        self.find_jobs(ids, now).await
    }

    async fn complete(&self, job: &QueuedJob) -> Result<bool> {
        let id = job.envelope.run_id.value;
        let mut con = self.redis_pool().get().await?;
        let res: i64 = COMPLETE_SCRIPT
            .key(self.job_key(id))
            .key(self.active_key())
            .arg(id)
            .arg(job.grabbed_until_time)
            .invoke_async(&mut con)
            .await
            .map_err(AgentRunError::RedisError)?;
        if res == 0 {
            tracing::warn!("job not completed (lease lost or job gone): run = {}", id);
        }
        Ok(res > 0)
    }

    async fn fail(&self, job: &QueuedJob, reason: &str) -> Result<FailOutcome> {
        let id = job.envelope.run_id.value;
        let now = datetime::now_millis();
        // attempts of the job cannot change while its lease is current
        let run_after_time =
            now + self.job_queue_config().retry_delay_msec(job.attempts.max(1)) as i64;
        let mut con = self.redis_pool().get().await?;
        let res: i64 = FAIL_SCRIPT
            .key(self.job_key(id))
            .key(self.active_key())
            .key(self.delayed_key())
            .key(self.failed_key())
            .arg(id)
            .arg(job.grabbed_until_time)
            .arg(reason)
            .arg(now)
            .arg(run_after_time)
            .invoke_async(&mut con)
            .await
            .map_err(AgentRunError::RedisError)?;
        match res {
            -1 => Err(AgentRunError::NotFound(format!("job not found: run = {}", id)).into()),
            0 => {
                tracing::info!(
                    "job rescheduled: run = {}, attempts = {}, run_after_time = {}",
                    id,
                    job.attempts,
                    run_after_time
                );
                Ok(FailOutcome::Retrying { run_after_time })
            }
            1 => {
                tracing::warn!(
                    "job dead-lettered: run = {}, attempts = {}: {}",
                    id,
                    job.attempts,
                    reason
                );
                Ok(FailOutcome::DeadLettered)
            }
            _ => {
                tracing::warn!("job not failed (lease lost): run = {}", id);
                Ok(FailOutcome::LeaseLost)
            }
        }
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
        if limit == 0 {
            return Ok(vec![]);
        }
        let now = datetime::now_millis();
        let ids = match state {
            Some(s) => {
                let start = offset as isize;
                self.ids_in(s, start, start + limit as isize - 1).await?
            }
            None => {
                let mut all = Vec::new();
                for s in [
                    JobState::Waiting,
                    JobState::Delayed,
                    JobState::Active,
                    JobState::Failed,
                ] {
                    all.extend(self.ids_in(s, 0, -1).await?);
                }
                all.into_iter()
                    .skip(offset as usize)
                    .take(limit as usize)
                    .collect()
            }
        };
        self.find_jobs(ids, now).await
    }

    async fn count_by_state(&self) -> Result<JobCounts> {
        let mut con = self.redis_pool().get().await?;
        let (waiting, delayed, active, failed): (i64, i64, i64, i64) = redis::pipe()
            .llen(self.wait_key())
            .zcard(self.delayed_key())
            .zcard(self.active_key())
            .zcard(self.failed_key())
            .query_async(&mut con)
            .await
            .map_err(AgentRunError::RedisError)?;
        Ok(JobCounts {
            waiting,
            delayed,
            active,
            failed,
        })
    }

    async fn retry_dead(&self, run_id: &RunId) -> Result<bool> {
        let mut con = self.redis_pool().get().await?;
        let removed: i64 = con
            .zrem(self.failed_key(), run_id.value)
            .await
            .map_err(AgentRunError::RedisError)?;
        if removed == 0 {
            return Ok(false);
        }
        redis::pipe()
            .atomic()
            .hset_multiple(
                self.job_key(run_id.value),
                &[
                    ("state", STATE_WAITING),
                    ("attempts", "0"),
                    ("run_after_time", "0"),
                    ("grabbed_until_time", "0"),
                    ("failed_reason", ""),
                ],
            )
            .ignore()
            .rpush(self.wait_key(), run_id.value)
            .ignore()
            .query_async::<()>(&mut con)
            .await
            .map_err(AgentRunError::RedisError)?;
        Ok(true)
    }

    async fn remove(&self, run_id: &RunId) -> Result<bool> {
        let mut con = self.redis_pool().get().await?;
        let (deleted,): (i64,) = redis::pipe()
            .atomic()
            .del(self.job_key(run_id.value))
            .lrem(self.wait_key(), 0, run_id.value)
            .ignore()
            .zrem(self.delayed_key(), run_id.value)
            .ignore()
            .zrem(self.active_key(), run_id.value)
            .ignore()
            .zrem(self.failed_key(), run_id.value)
            .ignore()
            .query_async(&mut con)
            .await
            .map_err(AgentRunError::RedisError)?;
        Ok(deleted > 0)
    }
}

// run with a redis server: TEST_REDIS_URL=redis://... cargo test -- --ignored
#[cfg(test)]
mod test {
    use super::*;
    use agentrun_base::data::{AgentInstanceId, RunMode};
    use common::infra::test::setup_test_redis_pool;
    use serde_json::json;

    fn envelope(id: i64) -> JobEnvelope {
        JobEnvelope {
            run_id: RunId::new(id),
            agent_instance_id: AgentInstanceId::new(1),
            user_id: "alice".to_string(),
            input: json!({"n": id}),
            mode: RunMode::Live,
        }
    }

    async fn new_repo(name: &str, conf: JobQueueConfig) -> Result<RedisJobQueueRepositoryImpl> {
        let pool = setup_test_redis_pool().await?;
        let prefix = format!("{{test-{}-{}}}", name, datetime::now_millis());
        Ok(RedisJobQueueRepositoryImpl::new_with_prefix(
            pool,
            Arc::new(conf),
            prefix,
        ))
    }

    async fn expire_lease(repo: &RedisJobQueueRepositoryImpl, id: i64) -> Result<()> {
        let mut con = repo.redis_pool().get().await?;
        let _: i64 = con.zadd(repo.active_key(), id, 1).await?;
        Ok(())
    }

    #[tokio::test]
    #[ignore]
    async fn test_enqueue_dedup_and_lease() -> Result<()> {
        let repo = new_repo("lease", JobQueueConfig::default()).await?;
        assert!(repo.enqueue(&envelope(1)).await?);
        assert!(!repo.enqueue(&envelope(1)).await?);
        assert!(repo.enqueue(&envelope(2)).await?);
        assert_eq!(repo.count_by_state().await?.waiting, 2);

        let leased = repo.fetch_and_lease(10).await?;
        assert_eq!(leased.len(), 2);
        assert_eq!(leased[0].envelope, envelope(1));
        assert_eq!(leased[0].attempts, 1);
        assert_eq!(leased[0].state, JobState::Active);
        assert!(repo.fetch_and_lease(10).await?.is_empty());
        assert!(!repo.enqueue(&envelope(1)).await?);

        assert!(repo.complete(&leased[0]).await?);
        assert!(!repo.complete(&leased[0]).await?);
        assert!(repo.remove(&RunId::new(2)).await?);
        assert_eq!(repo.count_by_state().await?, JobCounts::default());
        assert!(repo.enqueue(&envelope(1)).await?);
        repo.remove(&RunId::new(1)).await?;
        Ok(())
    }

    #[tokio::test]
    #[ignore]
    async fn test_stalled_and_failed_jobs() -> Result<()> {
        let repo = new_repo(
            "stalled",
            JobQueueConfig {
                max_attempts: 2,
                backoff_msec: 1,
                max_backoff_msec: 1,
                ..Default::default()
            },
        )
        .await?;
        let run_id = RunId::new(1);
        repo.enqueue(&envelope(1)).await?;
        let stale = repo.fetch_and_lease(1).await?.remove(0);
        expire_lease(&repo, 1).await?;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let recovered = repo.fetch_and_lease(1).await?;
        assert_eq!(recovered[0].attempts, 2);
        assert!(!repo.complete(&stale).await?);
        assert_eq!(repo.fail(&stale, "late").await?, FailOutcome::LeaseLost);

        assert_eq!(
            repo.fail(&recovered[0], "broken").await?,
            FailOutcome::DeadLettered
        );
        let dead = repo.list(Some(JobState::Failed), 10, 0).await?;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].failed_reason.as_deref(), Some("broken"));
        assert!(!repo.complete(&recovered[0]).await?);

        assert!(repo.retry_dead(&run_id).await?);
        let again = repo.fetch_and_lease(1).await?;
        assert_eq!(again[0].attempts, 1);
        assert!(matches!(
            repo.fail(&again[0], "once more").await?,
            FailOutcome::Retrying { .. }
        ));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        // promoted from delayed
        assert_eq!(repo.fetch_and_lease(1).await?.len(), 1);
        repo.remove(&run_id).await?;
        Ok(())
    }
}

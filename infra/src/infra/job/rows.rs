use agentrun_base::codec::UseJsonCodec;
use agentrun_base::data::{JobEnvelope, JobState, QueuedJob};
use agentrun_base::error::AgentRunError;
use anyhow::Result;
use std::str::FromStr;

// stored states of the job table (Delayed is derived from run_after_time)
pub const STATE_WAITING: &str = "waiting";
pub const STATE_ACTIVE: &str = "active";
pub const STATE_FAILED: &str = "failed";

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct JobRow {
    pub id: i64,
    pub envelope: String,
    pub state: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub enqueue_time: i64,
    pub run_after_time: i64,
    pub grabbed_until_time: i64,
    pub failed_reason: Option<String>,
}

impl UseJsonCodec for JobRow {}

impl JobRow {
    pub fn to_queued_job(&self, now: i64) -> Result<QueuedJob> {
        let envelope: JobEnvelope = Self::deserialize_message(&self.envelope)?;
        let stored = JobState::from_str(&self.state).map_err(|e| {
            AgentRunError::ParseError(format!("job {}: unknown state {}: {:?}", self.id, &self.state, e))
        })?;
        Ok(QueuedJob {
            envelope,
            state: derive_state(stored, self.run_after_time, now),
            attempts: self.attempts.max(0) as u32,
            max_attempts: self.max_attempts.max(0) as u32,
            enqueue_time: self.enqueue_time,
            run_after_time: self.run_after_time,
            grabbed_until_time: self.grabbed_until_time,
            failed_reason: self.failed_reason.clone(),
        })
    }
}

/// a waiting job whose run_after_time is in the future is reported as delayed
pub fn derive_state(stored: JobState, run_after_time: i64, now: i64) -> JobState {
    match stored {
        JobState::Waiting if run_after_time > now => JobState::Delayed,
        s => s,
    }
}

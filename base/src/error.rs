use redis::RedisError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentRunError {
    #[error("InvalidParameter({0})")]
    InvalidParameter(String),
    #[error("ParseError({0})")]
    ParseError(String),
    #[error("CodecError({0})")]
    CodecError(String),
    #[error("NotFound({0})")]
    NotFound(String),
    #[error("AlreadyExists({0})")]
    AlreadyExists(String),
    #[error("InvalidStatusTransition({0})")]
    InvalidStatusTransition(String),
    #[error("AgentNotFound({0})")]
    AgentNotFound(String),
    #[error("EnqueueError({0})")]
    EnqueueError(String),
    #[error("HandlerError({0})")]
    HandlerError(String),
    #[error("TimeoutError({0})")]
    TimeoutError(String),
    #[error("GenerateIdError({0})")]
    GenerateIdError(String),
    #[error("serde_json error({0:?})")]
    SerdeJsonError(serde_json::error::Error),
    #[error("RedisError({0:?})")]
    RedisError(RedisError),
    #[error("DBError({0:?})")]
    DBError(sqlx::Error),
    #[error("RuntimeError({0})")]
    RuntimeError(String),
    #[error("CancelledError({0})")]
    CancelledError(String),
}

impl AgentRunError {
    /// Returns true if retrying the job cannot change the outcome.
    /// Permanent errors fail the run immediately instead of the queue job:
    /// - InvalidParameter / NotFound / AgentNotFound (the request can never be executed)
    /// - Codec / Parse errors (the stored envelope is broken)
    ///
    /// Everything else (DB, redis, timeout) is treated as transient
    /// and goes through the queue retry policy.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            AgentRunError::InvalidParameter(_)
                | AgentRunError::NotFound(_)
                | AgentRunError::AgentNotFound(_)
                | AgentRunError::CodecError(_)
                | AgentRunError::ParseError(_)
        )
    }

    /// find an AgentRunError in the anyhow error chain
    pub fn find_in(err: &anyhow::Error) -> Option<&AgentRunError> {
        err.chain().find_map(|e| e.downcast_ref::<AgentRunError>())
    }

    pub fn is_cancelled(err: &anyhow::Error) -> bool {
        matches!(
            Self::find_in(err),
            Some(AgentRunError::CancelledError(_))
        )
    }
}

impl From<RedisError> for AgentRunError {
    fn from(e: RedisError) -> Self {
        AgentRunError::RedisError(e)
    }
}
impl From<serde_json::Error> for AgentRunError {
    fn from(e: serde_json::Error) -> Self {
        AgentRunError::SerdeJsonError(e)
    }
}
impl From<sqlx::Error> for AgentRunError {
    fn from(e: sqlx::Error) -> Self {
        AgentRunError::DBError(e)
    }
}

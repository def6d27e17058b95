//! Data model shared by every layer of the pipeline.
//!
//! Ids are snowflake `i64` values wrapped in newtypes. They are serialized
//! as JSON strings (browsers cannot represent 64bit integers) and accepted
//! either as strings or as numbers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! define_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name {
            pub value: i64,
        }

        impl $name {
            pub fn new(value: i64) -> Self {
                Self { value }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.value)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse::<i64>().map(Self::new)
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(&self.value.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                #[derive(Deserialize)]
                #[serde(untagged)]
                enum Repr {
                    Num(i64),
                    Str(String),
                }
                match Repr::deserialize(d)? {
                    Repr::Num(n) => Ok(Self::new(n)),
                    Repr::Str(s) => s.parse().map_err(serde::de::Error::custom),
                }
            }
        }
    };
}

define_id!(RunId);
define_id!(AgentInstanceId);

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::AsRefStr,
    strum_macros::EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    AwaitingInput,
}

impl RunStatus {
    pub const TERMINAL: [RunStatus; 3] =
        [RunStatus::Completed, RunStatus::Failed, RunStatus::Cancelled];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// statuses a run may be in before moving to `self`
    pub fn allowed_sources(&self) -> &'static [RunStatus] {
        match self {
            RunStatus::Pending => &[RunStatus::AwaitingInput],
            // RUNNING -> RUNNING: re-execution of a stalled job
            RunStatus::Running => &[RunStatus::Pending, RunStatus::Running],
            RunStatus::Completed | RunStatus::Failed | RunStatus::AwaitingInput => {
                &[RunStatus::Running]
            }
            RunStatus::Cancelled => &[
                RunStatus::Pending,
                RunStatus::Running,
                RunStatus::AwaitingInput,
            ],
        }
    }

    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        to.allowed_sources().contains(self)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RunMode {
    #[default]
    Live,
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: RunId,
    pub user_id: String,
    pub agent_instance_id: AgentInstanceId,
    pub input: serde_json::Value,
    pub mode: RunMode,
    pub status: RunStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

/// one unit of recorded progress within a run (append-only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub run_id: RunId,
    pub idx: i64,
    pub name: String,
    pub output: serde_json::Value,
    pub error: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInstance {
    pub id: AgentInstanceId,
    pub user_id: String,
    pub agent_name: String,
    #[serde(skip_serializing, default)]
    pub credentials: serde_json::Value,
    pub created_at: i64,
}

/// message placed on the job queue for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub run_id: RunId,
    pub agent_instance_id: AgentInstanceId,
    pub user_id: String,
    pub input: serde_json::Value,
    pub mode: RunMode,
}

impl JobEnvelope {
    pub fn from_run(run: &Run) -> Self {
        Self {
            run_id: run.id,
            agent_instance_id: run.agent_instance_id,
            user_id: run.user_id.clone(),
            input: run.input.clone(),
            mode: run.mode,
        }
    }
    /// at most one live job per run: the queue dedups on this key
    pub fn idempotency_key(&self) -> RunId {
        self.run_id
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::AsRefStr,
    strum_macros::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobState {
    /// runnable now
    Waiting,
    /// waiting for run_after_time (retry backoff)
    Delayed,
    /// leased by a worker
    Active,
    /// dead-lettered: exhausted its attempts
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    pub envelope: JobEnvelope,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub enqueue_time: i64,
    pub run_after_time: i64,
    pub grabbed_until_time: i64,
    pub failed_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum FailOutcome {
    Retrying { run_after_time: i64 },
    DeadLettered,
    /// the lease expired and the job belongs to another worker now: nothing changed
    LeaseLost,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: i64,
    pub delayed: i64,
    pub active: i64,
    pub failed: i64,
}

/// one item of a progress stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProgressEvent {
    #[serde(rename_all = "camelCase")]
    Status {
        run_id: RunId,
        status: RunStatus,
        error: Option<String>,
        result: Option<serde_json::Value>,
    },
    Step(Step),
}

impl ProgressEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ProgressEvent::Status { .. } => "status",
            ProgressEvent::Step(_) => "step",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_terminal_status_never_transitions() {
        for from in RunStatus::TERMINAL {
            for to in RunStatus::iter() {
                assert!(
                    !from.can_transition_to(to),
                    "{from} must not move to {to}"
                );
            }
        }
    }

    #[test]
    fn test_transitions() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Cancelled));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::AwaitingInput));
        assert!(RunStatus::AwaitingInput.can_transition_to(RunStatus::Pending));
        assert!(!RunStatus::AwaitingInput.can_transition_to(RunStatus::Completed));
    }

    #[test]
    fn test_status_string_forms() {
        assert_eq!(RunStatus::AwaitingInput.as_ref(), "AWAITING_INPUT");
        assert_eq!(
            "CANCELLED".parse::<RunStatus>().unwrap(),
            RunStatus::Cancelled
        );
        assert_eq!(
            serde_json::to_string(&RunStatus::AwaitingInput).unwrap(),
            "\"AWAITING_INPUT\""
        );
        assert_eq!("delayed".parse::<JobState>().unwrap(), JobState::Delayed);
    }

    #[test]
    fn test_id_json_accepts_string_and_number() {
        let id = RunId::new(7_000_000_000_000_000_001);
        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, "\"7000000000000000001\"");
        assert_eq!(serde_json::from_str::<RunId>(&s).unwrap(), id);
        assert_eq!(
            serde_json::from_str::<RunId>("42").unwrap(),
            RunId::new(42)
        );
        assert!(serde_json::from_str::<RunId>("\"abc\"").is_err());
    }

    #[test]
    fn test_progress_event_json() {
        let ev = ProgressEvent::Status {
            run_id: RunId::new(1),
            status: RunStatus::Running,
            error: None,
            result: None,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "status");
        assert_eq!(v["runId"], "1");
        assert_eq!(v["status"], "RUNNING");
        assert_eq!(ev.event_type(), "status");
    }

    #[test]
    fn test_credentials_are_not_serialized() {
        let instance = AgentInstance {
            id: AgentInstanceId::new(3),
            user_id: "u".to_string(),
            agent_name: "echo".to_string(),
            credentials: serde_json::json!({"apiKey": "secret"}),
            created_at: 0,
        };
        let v = serde_json::to_value(&instance).unwrap();
        assert!(v.get("credentials").is_none());
    }
}

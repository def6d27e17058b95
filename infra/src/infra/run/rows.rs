use agentrun_base::data::{AgentInstanceId, Run, RunId, RunMode, RunStatus};
use agentrun_base::error::AgentRunError;
use anyhow::Result;
use std::str::FromStr;

// db row definitions
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct RunRow {
    pub id: i64,
    pub user_id: String,
    pub agent_instance_id: i64,
    pub input: String,
    pub mode: String,
    pub status: String,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
    pub result: Option<String>,
}

impl RunRow {
    pub fn to_run(&self) -> Result<Run> {
        Ok(Run {
            id: RunId::new(self.id),
            user_id: self.user_id.clone(),
            agent_instance_id: AgentInstanceId::new(self.agent_instance_id),
            input: serde_json::from_str(&self.input).map_err(|e| {
                AgentRunError::ParseError(format!("run {}: broken input: {:?}", self.id, e))
            })?,
            mode: RunMode::from_str(&self.mode).map_err(|e| {
                AgentRunError::ParseError(format!("run {}: unknown mode {}: {:?}", self.id, &self.mode, e))
            })?,
            status: parse_status(&self.status)?,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
            result: self
                .result
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(|e| {
                    AgentRunError::ParseError(format!("run {}: broken result: {:?}", self.id, e))
                })?,
        })
    }
}

pub fn parse_status(s: &str) -> Result<RunStatus> {
    RunStatus::from_str(s)
        .map_err(|e| AgentRunError::ParseError(format!("unknown run status {}: {:?}", s, e)).into())
}

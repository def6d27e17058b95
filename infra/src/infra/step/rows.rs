use agentrun_base::data::{RunId, Step};
use agentrun_base::error::AgentRunError;
use anyhow::Result;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct StepRow {
    pub run_id: i64,
    pub idx: i64,
    pub name: String,
    pub output: String,
    pub error: Option<String>,
    pub created_at: i64,
}

impl StepRow {
    pub fn to_step(&self) -> Result<Step> {
        Ok(Step {
            run_id: RunId::new(self.run_id),
            idx: self.idx,
            name: self.name.clone(),
            output: serde_json::from_str(&self.output).map_err(|e| {
                AgentRunError::ParseError(format!(
                    "step {}:{}: broken output: {:?}",
                    self.run_id, self.idx, e
                ))
            })?,
            error: self.error.clone(),
            created_at: self.created_at,
        })
    }
}

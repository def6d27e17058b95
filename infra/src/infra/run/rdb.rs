use super::rows::{parse_status, RunRow};
use agentrun_base::data::{Run, RunId, RunStatus};
use agentrun_base::error::AgentRunError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::infra::rdb::{Rdb, RdbPool, UseRdbPool};
use common::util::datetime;
use itertools::Itertools;

#[async_trait]
pub trait RdbRunRepository: UseRdbPool + Sync + Send {
    async fn create(&self, run: &Run) -> Result<bool> {
        let res = sqlx::query::<Rdb>(
            "INSERT INTO run (
              id,
              user_id,
              agent_instance_id,
              input,
              mode,
              status,
              created_at,
              started_at,
              completed_at,
              error,
              result
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(run.id.value)
        .bind(&run.user_id)
        .bind(run.agent_instance_id.value)
        .bind(serde_json::to_string(&run.input).map_err(AgentRunError::SerdeJsonError)?)
        .bind(run.mode.as_ref())
        .bind(run.status.as_ref())
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(&run.error)
        .bind(
            run.result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(AgentRunError::SerdeJsonError)?,
        )
        .execute(self.db_pool())
        .await
        .map_err(AgentRunError::DBError)
        .context(format!("error in create run: id = {}", run.id))?;
        Ok(res.rows_affected() > 0)
    }

    async fn find(&self, id: &RunId) -> Result<Option<Run>> {
        sqlx::query_as::<Rdb, RunRow>("SELECT * FROM run WHERE id = ?")
            .bind(id.value)
            .fetch_optional(self.db_pool())
            .await
            .map_err(AgentRunError::DBError)
            .context(format!("error in find run: id = {}", id))?
            .map(|r| r.to_run())
            .transpose()
    }

    async fn find_status(&self, id: &RunId) -> Result<Option<RunStatus>> {
        let status: Option<String> = sqlx::query_scalar::<Rdb, String>(
            "SELECT status FROM run WHERE id = ?",
        )
        .bind(id.value)
        .fetch_optional(self.db_pool())
        .await
        .map_err(AgentRunError::DBError)
        .context(format!("error in find run status: id = {}", id))?;
        status.map(|s| parse_status(&s)).transpose()
    }

    /// newest first
    async fn find_list_by_user(&self, user_id: &str, limit: i32, offset: i64) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<Rdb, RunRow>(
            "SELECT * FROM run WHERE user_id = ? ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.db_pool())
        .await
        .map_err(AgentRunError::DBError)
        .context(format!("error in find_list_by_user: user = {}", user_id))?;
        Ok(rows
            .iter()
            .flat_map(|r| {
                r.to_run()
                    .inspect_err(|e| tracing::error!("skip invalid run row: {:?}", e))
                    .ok()
            })
            .collect_vec())
    }

    /// PENDING runs created before `created_before` (oldest first)
    async fn find_pending_before(&self, created_before: i64, limit: i32) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<Rdb, RunRow>(
            "SELECT * FROM run WHERE status = ? AND created_at < ? ORDER BY created_at LIMIT ?",
        )
        .bind(RunStatus::Pending.as_ref())
        .bind(created_before)
        .bind(limit)
        .fetch_all(self.db_pool())
        .await
        .map_err(AgentRunError::DBError)
        .context("error in find_pending_before")?;
        Ok(rows
            .iter()
            .flat_map(|r| {
                r.to_run()
                    .inspect_err(|e| tracing::error!("skip invalid run row: {:?}", e))
                    .ok()
            })
            .collect_vec())
    }

    /// Move the run to `to` only if its current status is one of the
    /// allowed sources of `to`. A terminal row never matches, so finished
    /// runs are never rewritten.
    ///
    /// Returns false if no row was updated (missing run or disallowed transition).
    async fn transition(
        &self,
        id: &RunId,
        to: RunStatus,
        error: Option<String>,
        result: Option<serde_json::Value>,
    ) -> Result<bool> {
        let now = datetime::now_millis();
        let sources = to.allowed_sources();
        let time_clause = if to == RunStatus::Running {
            ", started_at = COALESCE(started_at, ?)"
        } else if to.is_terminal() {
            ", completed_at = ?"
        } else {
            ""
        };
        let query = format!(
            "UPDATE run SET status = ?, error = ?, result = ?{} WHERE id = ? AND status IN ({})",
            time_clause,
            sources.iter().map(|_| "?").join(",")
        );
        let result = result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(AgentRunError::SerdeJsonError)?;
        let mut q = sqlx::query::<Rdb>(&query)
            .bind(to.as_ref())
            .bind(error)
            .bind(result);
        if !time_clause.is_empty() {
            q = q.bind(now);
        }
        q = q.bind(id.value);
        for s in sources {
            q = q.bind(s.as_ref());
        }
        let res = q
            .execute(self.db_pool())
            .await
            .map_err(AgentRunError::DBError)
            .context(format!("error in run transition: id = {}, to = {}", id, to))?;
        Ok(res.rows_affected() > 0)
    }

    /// AWAITING_INPUT -> PENDING with the new input
    async fn resume(&self, id: &RunId, input: &serde_json::Value) -> Result<bool> {
        let res = sqlx::query::<Rdb>(
            "UPDATE run SET status = ?, input = ?, error = NULL, result = NULL
             WHERE id = ? AND status = ?",
        )
        .bind(RunStatus::Pending.as_ref())
        .bind(serde_json::to_string(input).map_err(AgentRunError::SerdeJsonError)?)
        .bind(id.value)
        .bind(RunStatus::AwaitingInput.as_ref())
        .execute(self.db_pool())
        .await
        .map_err(AgentRunError::DBError)
        .context(format!("error in resume run: id = {}", id))?;
        Ok(res.rows_affected() > 0)
    }
}

#[derive(Clone, Debug)]
pub struct RdbRunRepositoryImpl {
    pool: RdbPool,
}

impl RdbRunRepositoryImpl {
    pub fn new(pool: RdbPool) -> Self {
        Self { pool }
    }
}

impl UseRdbPool for RdbRunRepositoryImpl {
    fn db_pool(&self) -> &RdbPool {
        &self.pool
    }
}

impl RdbRunRepository for RdbRunRepositoryImpl {}

pub trait UseRdbRunRepository {
    fn run_repository(&self) -> &RdbRunRepositoryImpl;
}

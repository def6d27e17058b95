use super::rows::StepRow;
use super::StepWriter;
use agentrun_base::data::{RunId, Step};
use agentrun_base::error::AgentRunError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::infra::rdb::{Rdb, RdbPool, UseRdbPool};
use itertools::Itertools;
use sqlx::QueryBuilder;

#[async_trait]
pub trait RdbStepRepository: UseRdbPool + Sync + Send {
    async fn create_batch(&self, steps: &[Step]) -> Result<u64> {
        if steps.is_empty() {
            return Ok(0);
        }
        let outputs = steps
            .iter()
            .map(|s| serde_json::to_string(&s.output))
            .collect::<Result<Vec<_>, _>>()
            .map_err(AgentRunError::SerdeJsonError)?;
        let mut builder = QueryBuilder::<Rdb>::new(
            "INSERT INTO step (run_id, idx, name, output, error, created_at) ",
        );
        builder.push_values(steps.iter().zip(outputs), |mut b, (step, output)| {
            b.push_bind(step.run_id.value)
                .push_bind(step.idx)
                .push_bind(step.name.clone())
                .push_bind(output)
                .push_bind(step.error.clone())
                .push_bind(step.created_at);
        });
        let res = builder
            .build()
            .execute(self.db_pool())
            .await
            .map_err(AgentRunError::DBError)
            .context(format!("error in step batch insert: {} steps", steps.len()))?;
        Ok(res.rows_affected())
    }

    async fn create(&self, step: &Step) -> Result<bool> {
        let res = sqlx::query::<Rdb>(
            "INSERT INTO step (run_id, idx, name, output, error, created_at) VALUES (?,?,?,?,?,?)",
        )
        .bind(step.run_id.value)
        .bind(step.idx)
        .bind(&step.name)
        .bind(serde_json::to_string(&step.output).map_err(AgentRunError::SerdeJsonError)?)
        .bind(&step.error)
        .bind(step.created_at)
        .execute(self.db_pool())
        .await
        .map_err(AgentRunError::DBError)
        .context(format!(
            "error in step insert: run = {}, idx = {}",
            step.run_id, step.idx
        ))?;
        Ok(res.rows_affected() > 0)
    }

    /// steps with idx > after_idx in ordinal order
    async fn find_after(&self, run_id: &RunId, after_idx: i64, limit: i32) -> Result<Vec<Step>> {
        let rows = sqlx::query_as::<Rdb, StepRow>(
            "SELECT * FROM step WHERE run_id = ? AND idx > ? ORDER BY idx LIMIT ?",
        )
        .bind(run_id.value)
        .bind(after_idx)
        .bind(limit)
        .fetch_all(self.db_pool())
        .await
        .map_err(AgentRunError::DBError)
        .context(format!("error in find steps: run = {}", run_id))?;
        rows.iter().map(|r| r.to_step()).collect()
    }

    async fn max_idx(&self, run_id: &RunId) -> Result<Option<i64>> {
        sqlx::query_scalar::<Rdb, Option<i64>>("SELECT MAX(idx) FROM step WHERE run_id = ?")
            .bind(run_id.value)
            .fetch_one(self.db_pool())
            .await
            .map_err(AgentRunError::DBError)
            .context(format!("error in max step idx: run = {}", run_id))
    }

    async fn count(&self, run_id: &RunId) -> Result<i64> {
        sqlx::query_scalar::<Rdb, i64>("SELECT count(*) FROM step WHERE run_id = ?")
            .bind(run_id.value)
            .fetch_one(self.db_pool())
            .await
            .map_err(AgentRunError::DBError)
            .context(format!("error in count steps: run = {}", run_id))
    }
}

#[derive(Clone, Debug)]
pub struct RdbStepRepositoryImpl {
    pool: RdbPool,
}

impl RdbStepRepositoryImpl {
    pub fn new(pool: RdbPool) -> Self {
        Self { pool }
    }
}

impl UseRdbPool for RdbStepRepositoryImpl {
    fn db_pool(&self) -> &RdbPool {
        &self.pool
    }
}

impl RdbStepRepository for RdbStepRepositoryImpl {}

#[async_trait]
impl StepWriter for RdbStepRepositoryImpl {
    async fn insert_batch(&self, steps: &[Step]) -> Result<u64> {
        self.create_batch(steps).await
    }
    async fn insert(&self, step: &Step) -> Result<bool> {
        self.create(step).await
    }
}

pub trait UseRdbStepRepository {
    fn step_repository(&self) -> &RdbStepRepositoryImpl;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::infra::resource::test::setup_test_rdb;
    use serde_json::json;

    fn step(run_id: i64, idx: i64) -> Step {
        Step {
            run_id: RunId::new(run_id),
            idx,
            name: format!("step-{idx}"),
            output: json!({"n": idx}),
            error: None,
            created_at: 1000 + idx,
        }
    }

    #[tokio::test]
    async fn test_batch_insert_and_find_after() -> Result<()> {
        let repo = RdbStepRepositoryImpl::new(setup_test_rdb().await?);
        let run_id = RunId::new(1);
        assert_eq!(repo.max_idx(&run_id).await?, None);
        assert_eq!(repo.create_batch(&[]).await?, 0);

        let steps = (1..=5).map(|i| step(1, i)).collect_vec();
        assert_eq!(repo.insert_batch(&steps).await?, 5);
        repo.insert(&step(2, 1)).await?;

        assert_eq!(repo.max_idx(&run_id).await?, Some(5));
        assert_eq!(repo.count(&run_id).await?, 5);
        let after = repo.find_after(&run_id, 2, 100).await?;
        assert_eq!(after, steps[2..].to_vec());
        let limited = repo.find_after(&run_id, 0, 2).await?;
        assert_eq!(limited.iter().map(|s| s.idx).collect_vec(), vec![1, 2]);
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_with_duplicate_is_all_or_nothing() -> Result<()> {
        let repo = RdbStepRepositoryImpl::new(setup_test_rdb().await?);
        repo.insert(&step(1, 2)).await?;
        let batch = vec![step(1, 1), step(1, 2), step(1, 3)];
        assert!(repo.insert_batch(&batch).await.is_err());
        assert_eq!(repo.count(&RunId::new(1)).await?, 1);
        // single inserts still work for the non-conflicting entries
        assert!(repo.insert(&batch[0]).await?);
        assert!(repo.insert(&batch[1]).await.is_err());
        assert!(repo.insert(&batch[2]).await?);
        assert_eq!(repo.count(&RunId::new(1)).await?, 3);
        Ok(())
    }
}

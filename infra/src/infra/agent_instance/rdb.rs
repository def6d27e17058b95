use agentrun_base::data::{AgentInstance, AgentInstanceId};
use agentrun_base::error::AgentRunError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::infra::rdb::{Rdb, RdbPool, UseRdbPool};

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct AgentInstanceRow {
    pub id: i64,
    pub user_id: String,
    pub agent_name: String,
    pub credentials: String,
    pub created_at: i64,
}

impl AgentInstanceRow {
    pub fn to_agent_instance(&self) -> Result<AgentInstance> {
        Ok(AgentInstance {
            id: AgentInstanceId::new(self.id),
            user_id: self.user_id.clone(),
            agent_name: self.agent_name.clone(),
            credentials: serde_json::from_str(&self.credentials).map_err(|e| {
                AgentRunError::ParseError(format!(
                    "agent instance {}: broken credentials: {:?}",
                    self.id, e
                ))
            })?,
            created_at: self.created_at,
        })
    }
}

#[async_trait]
pub trait RdbAgentInstanceRepository: UseRdbPool + Sync + Send {
    async fn create(&self, instance: &AgentInstance) -> Result<bool> {
        let res = sqlx::query::<Rdb>(
            "INSERT INTO agent_instance (id, user_id, agent_name, credentials, created_at)
             VALUES (?,?,?,?,?)",
        )
        .bind(instance.id.value)
        .bind(&instance.user_id)
        .bind(&instance.agent_name)
        .bind(serde_json::to_string(&instance.credentials).map_err(AgentRunError::SerdeJsonError)?)
        .bind(instance.created_at)
        .execute(self.db_pool())
        .await
        .map_err(AgentRunError::DBError)
        .context(format!("error in create agent instance: id = {}", instance.id))?;
        Ok(res.rows_affected() > 0)
    }

    async fn find(&self, id: &AgentInstanceId) -> Result<Option<AgentInstance>> {
        sqlx::query_as::<Rdb, AgentInstanceRow>("SELECT * FROM agent_instance WHERE id = ?")
            .bind(id.value)
            .fetch_optional(self.db_pool())
            .await
            .map_err(AgentRunError::DBError)
            .context(format!("error in find agent instance: id = {}", id))?
            .map(|r| r.to_agent_instance())
            .transpose()
    }

    async fn find_list_by_user(&self, user_id: &str) -> Result<Vec<AgentInstance>> {
        sqlx::query_as::<Rdb, AgentInstanceRow>(
            "SELECT * FROM agent_instance WHERE user_id = ? ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(self.db_pool())
        .await
        .map_err(AgentRunError::DBError)
        .context(format!("error in find agent instances: user = {}", user_id))?
        .iter()
        .map(|r| r.to_agent_instance())
        .collect()
    }
}

#[derive(Clone, Debug)]
pub struct RdbAgentInstanceRepositoryImpl {
    pool: RdbPool,
}

impl RdbAgentInstanceRepositoryImpl {
    pub fn new(pool: RdbPool) -> Self {
        Self { pool }
    }
}

impl UseRdbPool for RdbAgentInstanceRepositoryImpl {
    fn db_pool(&self) -> &RdbPool {
        &self.pool
    }
}

impl RdbAgentInstanceRepository for RdbAgentInstanceRepositoryImpl {}

pub trait UseRdbAgentInstanceRepository {
    fn agent_instance_repository(&self) -> &RdbAgentInstanceRepositoryImpl;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::infra::resource::test::setup_test_rdb;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_find() -> Result<()> {
        let repo = RdbAgentInstanceRepositoryImpl::new(setup_test_rdb().await?);
        let instance = AgentInstance {
            id: AgentInstanceId::new(7),
            user_id: "alice".to_string(),
            agent_name: "echo".to_string(),
            credentials: json!({"apiKey": "k"}),
            created_at: 1,
        };
        assert!(repo.create(&instance).await?);
        assert_eq!(repo.find(&instance.id).await?, Some(instance.clone()));
        assert_eq!(repo.find(&AgentInstanceId::new(8)).await?, None);
        assert_eq!(repo.find_list_by_user("alice").await?, vec![instance]);
        assert!(repo.find_list_by_user("bob").await?.is_empty());
        Ok(())
    }
}

use agentrun_base::data::{AgentInstance, AgentInstanceId};
use agentrun_base::error::AgentRunError;
use agentrun_base::limits::MAX_AGENT_NAME_LENGTH;
use anyhow::Result;
use async_trait::async_trait;
use common::util::datetime;
use infra::infra::agent_instance::rdb::RdbAgentInstanceRepository;
use infra::infra::module::RepositoryModule;
use infra::infra::IdGeneratorWrapper;
use std::{fmt, sync::Arc};

// the minimal create/find path needed to submit runs
#[async_trait]
pub trait AgentInstanceApp: fmt::Debug + Send + Sync {
    async fn create_agent_instance(
        &self,
        user_id: &str,
        agent_name: &str,
        credentials: serde_json::Value,
    ) -> Result<AgentInstanceId>;

    async fn find_agent_instance(
        &self,
        user_id: &str,
        id: &AgentInstanceId,
    ) -> Result<Option<AgentInstance>>;

    async fn list_agent_instances(&self, user_id: &str) -> Result<Vec<AgentInstance>>;
}

#[derive(Clone, Debug)]
pub struct AgentInstanceAppImpl {
    id_generator: Arc<IdGeneratorWrapper>,
    repositories: Arc<RepositoryModule>,
}

impl AgentInstanceAppImpl {
    pub fn new(id_generator: Arc<IdGeneratorWrapper>, repositories: Arc<RepositoryModule>) -> Self {
        Self {
            id_generator,
            repositories,
        }
    }

    fn validate_agent_name(agent_name: &str) -> Result<()> {
        if agent_name.trim().is_empty() {
            return Err(AgentRunError::InvalidParameter("agent name is empty".to_string()).into());
        }
        if agent_name.len() > MAX_AGENT_NAME_LENGTH {
            return Err(AgentRunError::InvalidParameter(format!(
                "agent name too long: {} > {}",
                agent_name.len(),
                MAX_AGENT_NAME_LENGTH
            ))
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl AgentInstanceApp for AgentInstanceAppImpl {
    async fn create_agent_instance(
        &self,
        user_id: &str,
        agent_name: &str,
        credentials: serde_json::Value,
    ) -> Result<AgentInstanceId> {
        Self::validate_agent_name(agent_name)?;
        let instance = AgentInstance {
            id: AgentInstanceId::new(self.id_generator.generate_id()?),
            user_id: user_id.to_string(),
            agent_name: agent_name.to_string(),
            credentials,
            created_at: datetime::now_millis(),
        };
        self.repositories
            .agent_instance_repository
            .create(&instance)
            .await?;
        tracing::info!(
            agent_instance_id = instance.id.value,
            "agent instance created: {}",
            agent_name
        );
        Ok(instance.id)
    }

    async fn find_agent_instance(
        &self,
        user_id: &str,
        id: &AgentInstanceId,
    ) -> Result<Option<AgentInstance>> {
        Ok(self
            .repositories
            .agent_instance_repository
            .find(id)
            .await?
            .filter(|i| i.user_id == user_id))
    }

    async fn list_agent_instances(&self, user_id: &str) -> Result<Vec<AgentInstance>> {
        self.repositories
            .agent_instance_repository
            .find_list_by_user(user_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::test::create_test_app;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_and_find_agent_instance() -> Result<()> {
        let app = create_test_app().await?;
        let id = app
            .agent_instance_app
            .create_agent_instance("alice", "echo", json!({"apiKey": "k"}))
            .await?;
        let found = app
            .agent_instance_app
            .find_agent_instance("alice", &id)
            .await?
            .unwrap();
        assert_eq!(found.agent_name, "echo");
        assert_eq!(found.credentials, json!({"apiKey": "k"}));
        assert!(app
            .agent_instance_app
            .find_agent_instance("bob", &id)
            .await?
            .is_none());
        assert_eq!(app.agent_instance_app.list_agent_instances("alice").await?.len(), 1);

        assert!(app
            .agent_instance_app
            .create_agent_instance("alice", " ", json!({}))
            .await
            .is_err());
        assert!(app
            .agent_instance_app
            .create_agent_instance("alice", &"x".repeat(MAX_AGENT_NAME_LENGTH + 1), json!({}))
            .await
            .is_err());
        Ok(())
    }
}

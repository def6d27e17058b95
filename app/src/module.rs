use crate::app::agent_instance::{AgentInstanceApp, AgentInstanceAppImpl};
use crate::app::progress::{RunProgressApp, RunProgressAppImpl};
use crate::app::queue_admin::{QueueAdminApp, QueueAdminAppImpl};
use crate::app::run::{RunApp, RunAppImpl};
use crate::app::{
    ProgressConfig, StepBufferConfig, StorageConfig, SweepConfig, WorkerConfig,
};
use anyhow::Result;
use infra::infra::module::RepositoryModule;
use infra::infra::{IdGeneratorWrapper, InfraConfigModule, JobQueueConfig, StorageType};
use serde::de::DeserializeOwned;
use std::sync::Arc;

fn load_prefixed<T: DeserializeOwned + Default>(prefix: &str) -> T {
    envy::prefixed(prefix).from_env::<T>().unwrap_or_else(|e| {
        tracing::debug!("use default config for {}: {:?}", prefix, e);
        T::default()
    })
}

pub fn load_storage_config() -> StorageConfig {
    load_prefixed("STORAGE_")
}
pub fn load_worker_config() -> WorkerConfig {
    load_prefixed("WORKER_")
}
pub fn load_step_buffer_config() -> StepBufferConfig {
    load_prefixed("STEP_BUFFER_")
}
pub fn load_progress_config() -> ProgressConfig {
    load_prefixed("PROGRESS_")
}
pub fn load_sweep_config() -> SweepConfig {
    load_prefixed("SWEEP_")
}

#[derive(Clone, Debug, Default)]
pub struct AppConfigModule {
    pub storage_config: Arc<StorageConfig>,
    pub worker_config: Arc<WorkerConfig>,
    pub job_queue_config: Arc<JobQueueConfig>,
    pub step_buffer_config: Arc<StepBufferConfig>,
    pub progress_config: Arc<ProgressConfig>,
    pub sweep_config: Arc<SweepConfig>,
}

impl AppConfigModule {
    pub fn new_by_env(infra_config_module: &InfraConfigModule) -> Self {
        Self {
            storage_config: Arc::new(load_storage_config()),
            worker_config: Arc::new(load_worker_config()),
            job_queue_config: infra_config_module.job_queue_config.clone(),
            step_buffer_config: Arc::new(load_step_buffer_config()),
            progress_config: Arc::new(load_progress_config()),
            sweep_config: Arc::new(load_sweep_config()),
        }
    }
    // shortcut method
    pub fn storage_type(&self) -> StorageType {
        self.storage_config.r#type
    }
}

#[derive(Clone, Debug)]
pub struct AppModule {
    pub config_module: Arc<AppConfigModule>,
    pub repositories: Arc<RepositoryModule>,
    pub id_generator: Arc<IdGeneratorWrapper>,
    pub run_app: Arc<dyn RunApp + 'static>,
    pub agent_instance_app: Arc<dyn AgentInstanceApp + 'static>,
    pub progress_app: Arc<dyn RunProgressApp + 'static>,
    pub queue_admin_app: Arc<dyn QueueAdminApp + 'static>,
}

impl AppModule {
    pub fn new(
        config_module: Arc<AppConfigModule>,
        repositories: Arc<RepositoryModule>,
        id_generator: Arc<IdGeneratorWrapper>,
    ) -> Self {
        Self {
            run_app: Arc::new(RunAppImpl::new(id_generator.clone(), repositories.clone())),
            agent_instance_app: Arc::new(AgentInstanceAppImpl::new(
                id_generator.clone(),
                repositories.clone(),
            )),
            progress_app: Arc::new(RunProgressAppImpl::new(
                config_module.progress_config.clone(),
                repositories.clone(),
            )),
            queue_admin_app: Arc::new(QueueAdminAppImpl::new(
                repositories.job_queue_repository.clone(),
            )),
            config_module,
            repositories,
            id_generator,
        }
    }

    pub async fn new_by_env(
        config_module: Arc<AppConfigModule>,
        infra_config_module: &InfraConfigModule,
    ) -> Result<Self> {
        let repositories = Arc::new(
            RepositoryModule::new(config_module.storage_type(), infra_config_module).await?,
        );
        Ok(Self::new(
            config_module,
            repositories,
            Arc::new(IdGeneratorWrapper::new()),
        ))
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test {
    use super::*;
    use infra::infra::module::test::setup_test_repository_module;

    /// standalone app on a private in-memory database
    pub async fn create_test_app_with(config_module: AppConfigModule) -> Result<AppModule> {
        let repositories =
            setup_test_repository_module((*config_module.job_queue_config).clone()).await?;
        Ok(AppModule::new(
            Arc::new(config_module),
            Arc::new(repositories),
            Arc::new(IdGeneratorWrapper::new_mock()),
        ))
    }

    pub async fn create_test_app() -> Result<AppModule> {
        create_test_app_with(AppConfigModule::default()).await
    }
}

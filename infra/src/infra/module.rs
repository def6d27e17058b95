use super::agent_instance::rdb::{RdbAgentInstanceRepositoryImpl, UseRdbAgentInstanceRepository};
use super::job::queue::rdb::RdbJobQueueRepositoryImpl;
use super::job::queue::redis::RedisJobQueueRepositoryImpl;
use super::job::queue::{JobQueueRepository, UseJobQueueRepository};
use super::run::rdb::{RdbRunRepositoryImpl, UseRdbRunRepository};
use super::step::rdb::{RdbStepRepositoryImpl, UseRdbStepRepository};
use super::step::StepWriter;
use super::{resource, InfraConfigModule, JobQueueConfig, StorageType};
use agentrun_base::error::AgentRunError;
use anyhow::Result;
use common::infra::rdb::RdbPool;
use common::infra::redis::RedisPool;
use std::fmt;
use std::sync::Arc;

// repositories for DI: records always live in the rdb, the job queue in
// the rdb (Standalone) or in redis (Scalable)
#[derive(Clone)]
pub struct RepositoryModule {
    pub storage_type: StorageType,
    pub rdb_pool: RdbPool,
    pub run_repository: RdbRunRepositoryImpl,
    pub step_repository: RdbStepRepositoryImpl,
    pub agent_instance_repository: RdbAgentInstanceRepositoryImpl,
    pub job_queue_repository: Arc<dyn JobQueueRepository>,
}

impl fmt::Debug for RepositoryModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryModule")
            .field("storage_type", &self.storage_type)
            .field("rdb_pool", &self.rdb_pool)
            .finish_non_exhaustive()
    }
}

impl RepositoryModule {
    pub fn new_standalone(rdb_pool: RdbPool, job_queue_config: Arc<JobQueueConfig>) -> Self {
        let queue = RdbJobQueueRepositoryImpl::new(rdb_pool.clone(), job_queue_config);
        Self::new_with_queue(StorageType::Standalone, rdb_pool, Arc::new(queue))
    }

    pub fn new_scalable(
        rdb_pool: RdbPool,
        redis_pool: RedisPool,
        job_queue_config: Arc<JobQueueConfig>,
    ) -> Self {
        let queue = RedisJobQueueRepositoryImpl::new(redis_pool, job_queue_config);
        Self::new_with_queue(StorageType::Scalable, rdb_pool, Arc::new(queue))
    }

    pub fn new_with_queue(
        storage_type: StorageType,
        rdb_pool: RdbPool,
        job_queue_repository: Arc<dyn JobQueueRepository>,
    ) -> Self {
        Self {
            storage_type,
            run_repository: RdbRunRepositoryImpl::new(rdb_pool.clone()),
            step_repository: RdbStepRepositoryImpl::new(rdb_pool.clone()),
            agent_instance_repository: RdbAgentInstanceRepositoryImpl::new(rdb_pool.clone()),
            rdb_pool,
            job_queue_repository,
        }
    }

    pub async fn new(storage_type: StorageType, config_module: &InfraConfigModule) -> Result<Self> {
        let rdb_config = config_module.rdb_config.clone().unwrap_or_default();
        let rdb_pool = resource::setup_rdb(&rdb_config).await?;
        match storage_type {
            StorageType::Standalone => Ok(Self::new_standalone(
                rdb_pool,
                config_module.job_queue_config.clone(),
            )),
            StorageType::Scalable => {
                let redis_config = config_module.redis_config.as_ref().ok_or_else(|| {
                    AgentRunError::InvalidParameter(
                        "Scalable storage needs REDIS_URL".to_string(),
                    )
                })?;
                let redis_pool = resource::setup_redis_pool(redis_config).await?;
                Ok(Self::new_scalable(
                    rdb_pool,
                    redis_pool,
                    config_module.job_queue_config.clone(),
                ))
            }
        }
    }

    pub fn step_writer(&self) -> Arc<dyn StepWriter> {
        Arc::new(self.step_repository.clone())
    }
}

impl UseRdbRunRepository for RepositoryModule {
    fn run_repository(&self) -> &RdbRunRepositoryImpl {
        &self.run_repository
    }
}
impl UseRdbStepRepository for RepositoryModule {
    fn step_repository(&self) -> &RdbStepRepositoryImpl {
        &self.step_repository
    }
}
impl UseRdbAgentInstanceRepository for RepositoryModule {
    fn agent_instance_repository(&self) -> &RdbAgentInstanceRepositoryImpl {
        &self.agent_instance_repository
    }
}
impl UseJobQueueRepository for RepositoryModule {
    fn job_queue_repository(&self) -> Arc<dyn JobQueueRepository> {
        self.job_queue_repository.clone()
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test {
    use super::*;

    /// standalone module on a private in-memory database
    pub async fn setup_test_repository_module(
        job_queue_config: JobQueueConfig,
    ) -> Result<RepositoryModule> {
        let pool = resource::test::setup_test_rdb().await?;
        Ok(RepositoryModule::new_standalone(
            pool,
            Arc::new(job_queue_config),
        ))
    }
}

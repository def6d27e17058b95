pub mod agent_instance;
pub mod job;
pub mod module;
pub mod resource;
pub mod run;
pub mod step;

use agentrun_base::error::AgentRunError;
use anyhow::Result;
use common::infra::{rdb::RdbConfig, redis::RedisConfig};
use common::util::id_generator::{self, IDGenerator, MockIdGenerator};
use debug_stub_derive::DebugStub;
use serde::Deserialize;
use std::sync::{Arc, Mutex};

use self::resource::{load_db_config_from_env, load_redis_config_from_env};

#[derive(Clone, DebugStub)]
pub struct IdGeneratorWrapper {
    #[debug_stub = "IDGenerator"]
    id_generator: Arc<Mutex<IDGenerator>>,
}

impl IdGeneratorWrapper {
    pub fn new() -> Self {
        IdGeneratorWrapper {
            id_generator: Arc::new(Mutex::new(id_generator::new_generator_by_env())),
        }
    }
    // for test
    pub fn new_mock() -> Self {
        IdGeneratorWrapper {
            id_generator: Arc::new(Mutex::new(IDGenerator::Mock(MockIdGenerator::new()))),
        }
    }
    // thread safe
    pub fn generate_id(&self) -> Result<i64> {
        self.id_generator
            .lock()
            .map_err(|e| AgentRunError::GenerateIdError(e.to_string()).into())
            .and_then(|mut g| g.generate())
    }
}

impl Default for IdGeneratorWrapper {
    fn default() -> Self {
        Self::new()
    }
}

pub trait UseIdGenerator {
    fn id_generator(&self) -> &IdGeneratorWrapper;
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct JobQueueConfig {
    /// msec between queue polls of an idle worker
    pub fetch_interval: u32,
    /// msec an agent handler may run. a leased job stays invisible to other
    /// workers for this long plus GRAB_MERGIN_MILLISEC. must be > 0
    pub lease_timeout_msec: u64,
    /// attempts (leases) before a job is dead-lettered
    pub max_attempts: u32,
    /// base delay of the exponential retry backoff
    pub backoff_msec: u64,
    pub max_backoff_msec: u64,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            fetch_interval: 1000,
            lease_timeout_msec: 10 * 60 * 1000, // 10min
            max_attempts: 3,
            backoff_msec: 1000,
            max_backoff_msec: 60 * 1000,
        }
    }
}

impl JobQueueConfig {
    /// backoff_msec * 2^(attempts-1), capped by max_backoff_msec
    pub fn retry_delay_msec(&self, attempts: u32) -> u64 {
        let exp = attempts.saturating_sub(1).min(30);
        self.backoff_msec
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_msec.max(self.backoff_msec))
    }
    /// lease length including the grab mergin
    pub fn lease_msec(&self) -> i64 {
        self.lease_timeout_msec as i64 + job::GRAB_MERGIN_MILLISEC
    }

    pub fn validate(&self) -> Result<()> {
        // the handler timeout bounds every lease
        if self.lease_timeout_msec == 0 {
            return Err(AgentRunError::InvalidParameter(
                "JOB_QUEUE_LEASE_TIMEOUT_MSEC must be greater than 0".to_string(),
            )
            .into());
        }
        if self.max_attempts == 0 {
            return Err(AgentRunError::InvalidParameter(
                "JOB_QUEUE_MAX_ATTEMPTS must be greater than 0".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

pub fn load_job_queue_config_from_env() -> Result<JobQueueConfig> {
    let config = envy::prefixed("JOB_QUEUE_")
        .from_env::<JobQueueConfig>()
        .map_err(|e| {
            AgentRunError::RuntimeError(format!("cannot read job queue config from env: {:?}", e))
        })?;
    config.validate()?;
    Ok(config)
}

pub trait UseJobQueueConfig {
    fn job_queue_config(&self) -> &JobQueueConfig;
}

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StorageType {
    /// rdb only (sqlite by default)
    #[default]
    Standalone,
    /// job queue on redis, records on rdb
    Scalable,
}

#[derive(Clone, Debug)]
pub struct InfraConfigModule {
    pub redis_config: Option<RedisConfig>,
    pub rdb_config: Option<RdbConfig>,
    pub job_queue_config: Arc<JobQueueConfig>,
}

impl InfraConfigModule {
    /// fails on an invalid job queue config; missing rdb / redis configs
    /// fall back to their defaults
    pub fn new_by_env() -> Result<Self> {
        Ok(Self {
            redis_config: load_redis_config_from_env().ok(),
            rdb_config: load_db_config_from_env().ok(),
            job_queue_config: Arc::new(load_job_queue_config_from_env()?),
        })
    }
}

pub mod agent_instance;
pub mod progress;
pub mod queue_admin;
pub mod run;

use infra::infra::StorageType;
use serde::Deserialize;

#[derive(Deserialize, Clone, Debug)]
pub struct StorageConfig {
    pub r#type: StorageType,
}

impl Default for StorageConfig {
    // use standalone (sqlite) in default
    fn default() -> Self {
        tracing::info!("Use default StorageConfig (Standalone).");
        Self {
            r#type: StorageType::Standalone,
        }
    }
}

pub trait UseStorageConfig {
    fn storage_config(&self) -> &StorageConfig;
}

/// worker setting (per worker process)
#[derive(Deserialize, Debug, Clone)]
pub struct WorkerConfig {
    /// jobs executed concurrently by one worker process
    pub concurrency: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let cn = num_cpus::get() as u32;
        tracing::info!("Use default WorkerConfig (core number concurrency: {}).", cn);
        Self { concurrency: cn }
    }
}

pub trait UseWorkerConfig {
    fn worker_config(&self) -> &WorkerConfig;
}

/// step write batching of a worker process
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StepBufferConfig {
    /// flush as soon as this many steps are buffered
    pub max_entries: usize,
    /// flush at the latest this long after the first buffered step
    pub flush_interval_msec: u64,
}

impl Default for StepBufferConfig {
    fn default() -> Self {
        Self {
            max_entries: 10,
            flush_interval_msec: 1000,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ProgressConfig {
    pub poll_interval_msec: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            poll_interval_msec: 1000,
        }
    }
}

pub trait UseProgressConfig {
    fn progress_config(&self) -> &ProgressConfig;
}

/// periodic re-enqueue of PENDING runs whose enqueue may have been lost
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SweepConfig {
    /// 0 disables the sweep
    pub interval_sec: u64,
    /// only runs pending at least this long are re-enqueued
    pub pending_age_sec: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_sec: 60,
            pending_age_sec: 300,
        }
    }
}

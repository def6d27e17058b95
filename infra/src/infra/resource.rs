use agentrun_base::error::AgentRunError;
use anyhow::Result;
use common::infra::{
    rdb::{RdbConfig, RdbPool},
    redis::{RedisConfig, RedisPool},
};

#[cfg(not(feature = "mysql"))]
pub const RDB_SCHEMA: &str = include_str!("../../sql/sqlite/001_schema.sql");
#[cfg(feature = "mysql")]
pub const RDB_SCHEMA: &str = include_str!("../../sql/mysql/001_schema.sql");

pub async fn setup_rdb_by_env() -> Result<RdbPool> {
    let conf = load_db_config_from_env().unwrap_or_default();
    setup_rdb(&conf).await
}

// new rdb pool with the schema applied
pub async fn setup_rdb(db_config: &RdbConfig) -> Result<RdbPool> {
    common::infra::rdb::new_rdb_pool(db_config, Some(RDB_SCHEMA)).await
}

pub fn load_db_config_from_env() -> Result<RdbConfig> {
    // sqlite first
    envy::prefixed("SQLITE_")
        .from_env::<RdbConfig>()
        .or_else(|_| envy::prefixed("MYSQL_").from_env::<RdbConfig>())
        .map_err(|e| {
            AgentRunError::RuntimeError(format!("cannot read rdb config from env: {:?}", e)).into()
        })
}

pub async fn setup_redis_pool(config: &RedisConfig) -> Result<RedisPool> {
    common::infra::redis::new_redis_pool(config).await
}

pub fn load_redis_config_from_env() -> Result<RedisConfig> {
    envy::prefixed("REDIS_")
        .from_env::<RedisConfig>()
        .map_err(|e| {
            AgentRunError::RuntimeError(format!("cannot read redis config from env: {:?}", e))
                .into()
        })
}

// for test only
#[cfg(any(test, feature = "test-utils"))]
pub mod test {
    use super::*;

    pub async fn setup_test_rdb() -> Result<RdbPool> {
        common::infra::test::setup_test_rdb(RDB_SCHEMA).await
    }
}

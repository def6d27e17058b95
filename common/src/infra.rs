pub mod rdb;
pub mod redis;

// for test only
pub mod test {
    use super::rdb::{RdbConfig, RdbPool};
    use super::redis::{RedisConfig, RedisPool};
    use anyhow::Result;
    use once_cell::sync::Lazy;

    pub static SQLITE_MEMORY_CONFIG: Lazy<RdbConfig> = Lazy::new(|| RdbConfig {
        host: "".to_string(),
        port: "".to_string(),
        user: "".to_string(),
        password: "".to_string(),
        dbname: ":memory:".to_string(),
        max_connections: 1,
    });

    pub static MYSQL_CONFIG: Lazy<RdbConfig> = Lazy::new(|| {
        let host = std::env::var("TEST_MYSQL_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        RdbConfig {
            host,
            port: "3306".to_string(),
            user: "mysql".to_string(),
            password: "mysql".to_string(),
            dbname: "test".to_string(),
            max_connections: 20,
        }
    });

    pub static REDIS_CONFIG: Lazy<RedisConfig> = Lazy::new(|| {
        let url = std::env::var("TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RedisConfig {
            url,
            pool_size: Some(8),
        }
    });

    /// a fresh database with `schema` applied.
    /// (sqlite: a private in-memory database per call)
    pub async fn setup_test_rdb(schema: &str) -> Result<RdbPool> {
        #[cfg(feature = "mysql")]
        let config = &*MYSQL_CONFIG;
        #[cfg(not(feature = "mysql"))]
        let config = &*SQLITE_MEMORY_CONFIG;
        super::rdb::new_rdb_pool(config, Some(schema)).await
    }

    pub async fn setup_test_redis_pool() -> Result<RedisPool> {
        super::redis::new_redis_pool(&REDIS_CONFIG).await
    }
}

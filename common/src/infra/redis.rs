use anyhow::Result;
use deadpool_redis::{Config, Runtime};
use serde::Deserialize;

pub type RedisPool = deadpool_redis::Pool;

pub trait UseRedisPool {
    fn redis_pool(&self) -> &RedisPool;
}

#[derive(Deserialize, Clone, Debug)]
pub struct RedisConfig {
    pub url: String,
    pub pool_size: Option<usize>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        tracing::info!("Use default RedisConfig (redis://127.0.0.1:6379).");
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: None,
        }
    }
}

pub async fn new_redis_pool(config: &RedisConfig) -> Result<RedisPool> {
    let mut cfg = Config::from_url(config.url.clone());
    if let Some(size) = config.pool_size {
        cfg.pool = Some(deadpool_redis::PoolConfig::new(size));
    }
    let pool = cfg.create_pool(Some(Runtime::Tokio1))?;
    // fail fast if the server is unreachable
    let mut con = pool.get().await?;
    let _: String = redis::cmd("PING").query_async(&mut con).await?;
    Ok(pool)
}

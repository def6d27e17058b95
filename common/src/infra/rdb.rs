use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

#[cfg(not(feature = "mysql"))]
pub type Rdb = sqlx::Sqlite;
#[cfg(feature = "mysql")]
pub type Rdb = sqlx::MySql;

pub type RdbPool = sqlx::Pool<Rdb>;

pub trait UseRdbPool {
    fn db_pool(&self) -> &RdbPool;
}

#[derive(Deserialize, Clone, Debug)]
pub struct RdbConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub dbname: String,
    pub max_connections: u32,
}

impl Default for RdbConfig {
    fn default() -> Self {
        tracing::info!("Use default RdbConfig (sqlite: ./agentrun.sqlite3).");
        Self {
            host: "".to_string(),
            port: "".to_string(),
            user: "".to_string(),
            password: "".to_string(),
            dbname: "./agentrun.sqlite3".to_string(),
            max_connections: 20,
        }
    }
}

impl RdbConfig {
    pub fn is_memory(&self) -> bool {
        self.dbname == ":memory:"
    }
}

// create pool and apply schema (idempotent DDL) if specified
#[cfg(not(feature = "mysql"))]
pub async fn new_rdb_pool(config: &RdbConfig, schema: Option<&str>) -> Result<RdbPool> {
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
    use std::str::FromStr;

    let pool = if config.is_memory() {
        // one connection that never expires: every connection of an in-memory
        // sqlite is a separate database
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
            .await?
    } else {
        let options = SqliteConnectOptions::new()
            .filename(&config.dbname)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?
    };
    if let Some(schema) = schema {
        sqlx::raw_sql(schema).execute(&pool).await?;
    }
    tracing::debug!("rdb pool created: sqlite {}", &config.dbname);
    Ok(pool)
}

#[cfg(feature = "mysql")]
pub async fn new_rdb_pool(config: &RdbConfig, schema: Option<&str>) -> Result<RdbPool> {
    use sqlx::mysql::MySqlPoolOptions;

    let url = format!(
        "mysql://{}:{}@{}:{}/{}",
        config.user, config.password, config.host, config.port, config.dbname
    );
    let pool = MySqlPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&url)
        .await?;
    if let Some(schema) = schema {
        sqlx::raw_sql(schema).execute(&pool).await?;
    }
    tracing::debug!("rdb pool created: mysql {}:{}", &config.host, &config.port);
    Ok(pool)
}

#[cfg(all(test, not(feature = "mysql")))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pool_keeps_schema() -> Result<()> {
        let pool = new_rdb_pool(
            &crate::infra::test::SQLITE_MEMORY_CONFIG,
            Some("CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY);"),
        )
        .await?;
        sqlx::query("INSERT INTO t (id) VALUES (1)")
            .execute(&pool)
            .await?;
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM t")
            .fetch_one(&pool)
            .await?;
        assert_eq!(count, 1);
        Ok(())
    }
}

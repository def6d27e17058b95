use anyhow::Result;
use serde::Deserialize;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Deserialize, Clone, Debug)]
pub struct LoggingConfig {
    /// default filter directive (RUST_LOG overrides)
    pub level: Option<String>,
    pub file_name: Option<String>,
    pub file_dir: Option<String>,
    #[serde(default)]
    pub use_json: bool,
    #[serde(default = "default_use_stdout")]
    pub use_stdout: bool,
}

fn default_use_stdout() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Some("info".to_string()),
            file_name: None,
            file_dir: None,
            use_json: false,
            use_stdout: true,
        }
    }
}

pub fn load_tracing_config_from_env() -> Result<LoggingConfig> {
    envy::prefixed("LOG_")
        .from_env::<LoggingConfig>()
        .map_err(|e| anyhow::anyhow!("cannot read logging config from env: {:?}", e))
}

pub fn create_filename_with_pid_postfix(name: &str, ext: &str) -> String {
    format!("{}.{}.{}", name, std::process::id(), ext)
}

pub fn tracing_init(conf: LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(conf.level.as_deref().unwrap_or("info")))?;

    let stdout_layer = if conf.use_stdout {
        Some(if conf.use_json {
            fmt::layer().json().boxed()
        } else {
            fmt::layer().boxed()
        })
    } else {
        None
    };

    let file_layer = match conf.file_name.as_ref() {
        Some(name) => {
            let dir = PathBuf::from(conf.file_dir.as_deref().unwrap_or("."));
            std::fs::create_dir_all(&dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(name))?;
            let writer = Mutex::new(file);
            Some(if conf.use_json {
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .boxed()
            } else {
                fmt::layer().with_ansi(false).with_writer(writer).boxed()
            })
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}

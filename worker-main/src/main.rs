use agentrun_base::APP_NAME;
use anyhow::Result;
use common::util::tracing::LoggingConfig;
use dotenvy::dotenv;

// start all-in-one server (worker + http front)
#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let conf = common::util::tracing::load_tracing_config_from_env().unwrap_or_default();
    let log_filename = common::util::tracing::create_filename_with_pid_postfix(APP_NAME, "log");
    let conf = LoggingConfig {
        file_name: Some(log_filename),
        ..conf
    };
    common::util::tracing::tracing_init(conf)?;

    agentrun_main::boot_all_in_one().await
}

use agentrun_base::APP_WORKER_NAME;
use anyhow::Result;
use common::util::tracing::LoggingConfig;
use dotenvy::dotenv;

#[tokio::main(flavor = "multi_thread")]
pub async fn main() -> Result<()> {
    dotenv().ok();
    // process specific log file (several workers may share a host)
    let log_filename =
        common::util::tracing::create_filename_with_pid_postfix(APP_WORKER_NAME, "log");
    let conf = common::util::tracing::load_tracing_config_from_env().unwrap_or_default();
    common::util::tracing::tracing_init(LoggingConfig {
        file_name: Some(log_filename),
        ..conf
    })?;

    agentrun_main::boot_worker().await
}

use agentrun_base::APP_FRONT_NAME;
use anyhow::Result;
use common::util::tracing::LoggingConfig;
use dotenvy::dotenv;

#[tokio::main(flavor = "multi_thread")]
pub async fn main() -> Result<()> {
    dotenv().ok();
    let log_filename =
        common::util::tracing::create_filename_with_pid_postfix(APP_FRONT_NAME, "log");
    let conf = common::util::tracing::load_tracing_config_from_env().unwrap_or_default();
    common::util::tracing::tracing_init(LoggingConfig {
        file_name: Some(log_filename),
        ..conf
    })?;

    agentrun_main::boot_front().await
}

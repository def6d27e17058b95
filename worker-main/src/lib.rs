use anyhow::Result;
use app::module::{AppConfigModule, AppModule};
use common::util::shutdown::{self, ShutdownLock, ShutdownSignal, ShutdownTrigger};
use http_front::config::{AuthConfig, ServerConfig};
use http_front::server::auth::TokenStore;
use infra::infra::InfraConfigModule;
use std::sync::Arc;
use tokio::task::JoinHandle;
use worker_app::agent::registry::AgentRegistry;
use worker_app::WorkerModules;

pub async fn load_app_module() -> Result<Arc<AppModule>> {
    let infra_config_module = InfraConfigModule::new_by_env()?;
    let config_module = Arc::new(AppConfigModule::new_by_env(&infra_config_module));
    let app_module = AppModule::new_by_env(config_module, &infra_config_module).await?;
    Ok(Arc::new(app_module))
}

pub fn start_worker(
    app_module: Arc<AppModule>,
    registry: Arc<AgentRegistry>,
    lock: ShutdownLock,
    shutdown: ShutdownSignal,
) -> Vec<JoinHandle<()>> {
    let wm = WorkerModules::new(app_module, registry);
    let handles = wm.start(lock, shutdown);
    tracing::debug!("worker started");
    handles
}

/// Run the http server in a task. A failed boot (e.g. the address is in use)
/// triggers shutdown of the whole process.
pub fn start_front_server(
    app_module: Arc<AppModule>,
    lock: ShutdownLock,
    shutdown: ShutdownSignal,
    trigger: ShutdownTrigger,
) -> Result<JoinHandle<Result<()>>> {
    let token_store = Arc::new(TokenStore::from_config(&AuthConfig::from_env())?);
    if !token_store.is_enabled() {
        tracing::warn!("authentication is disabled: x-user-id header is trusted");
    }
    Ok(tokio::spawn(async move {
        let res = http_front::server::http::boot_http_server(
            app_module,
            token_store,
            ServerConfig::default(),
            lock,
            shutdown,
        )
        .await;
        if let Err(e) = &res {
            tracing::error!("http server stopped with error: {:?}", e);
            trigger.shutdown();
        }
        res
    }))
}

async fn join_all(handles: Vec<JoinHandle<()>>) -> Result<()> {
    for h in handles {
        h.await?;
    }
    Ok(())
}

pub async fn boot_worker() -> Result<()> {
    let (lock, mut wait) = shutdown::create_lock_and_wait();
    let (trigger, signal) = shutdown::shutdown_signal();
    trigger.spawn_ctrl_c_listener();

    let app_module = load_app_module().await?;
    let handles = start_worker(
        app_module,
        Arc::new(AgentRegistry::with_builtins()),
        lock,
        signal,
    );

    tracing::info!("wait for processing ...");
    wait.wait().await;
    join_all(handles).await?;
    tracing::info!("shutdown normally");
    Ok(())
}

pub async fn boot_front() -> Result<()> {
    let (lock, mut wait) = shutdown::create_lock_and_wait();
    let (trigger, signal) = shutdown::shutdown_signal();
    trigger.spawn_ctrl_c_listener();

    let app_module = load_app_module().await?;
    let jh = start_front_server(app_module, lock, signal, trigger)?;

    wait.wait().await;
    jh.await??;
    tracing::info!("shutdown normally");
    Ok(())
}

pub async fn boot_all_in_one() -> Result<()> {
    let (lock, mut wait) = shutdown::create_lock_and_wait();
    let (trigger, signal) = shutdown::shutdown_signal();
    trigger.spawn_ctrl_c_listener();

    let app_module = load_app_module().await?;

    tracing::info!("start worker");
    let handles = start_worker(
        app_module.clone(),
        Arc::new(AgentRegistry::with_builtins()),
        lock.clone(),
        signal.clone(),
    );
    tracing::info!("start server");
    let jh = start_front_server(app_module, lock, signal, trigger)?;

    tracing::info!("waiting worker");
    wait.wait().await;

    join_all(handles).await?;
    jh.await??;
    tracing::info!("shutdown normally");
    Ok(())
}

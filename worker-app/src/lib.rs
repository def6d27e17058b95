use agent::registry::AgentRegistry;
use app::module::AppModule;
use common::util::shutdown::{ShutdownLock, ShutdownSignal};
use std::sync::Arc;
use tokio::task::JoinHandle;
use worker::{
    dispatcher::JobDispatcherImpl, executor::RunExecutor, step_buffer::StepBuffer,
    sweep::spawn_pending_sweep,
};

pub mod agent;
pub mod worker;

pub struct WorkerModules {
    pub app_module: Arc<AppModule>,
    pub registry: Arc<AgentRegistry>,
    pub step_buffer: Arc<StepBuffer>,
    pub executor: Arc<RunExecutor>,
    pub job_dispatcher: Arc<JobDispatcherImpl>,
}

impl WorkerModules {
    pub fn new(app_module: Arc<AppModule>, registry: Arc<AgentRegistry>) -> Self {
        let config_module = app_module.config_module.clone();
        let repositories = app_module.repositories.clone();
        // one buffer per process, shared by every run it executes
        let step_buffer = Arc::new(StepBuffer::new(
            repositories.step_writer(),
            config_module.step_buffer_config.clone(),
        ));
        let executor = Arc::new(RunExecutor::new(
            repositories.clone(),
            registry.clone(),
            step_buffer.clone(),
            config_module.job_queue_config.clone(),
        ));
        let job_dispatcher = Arc::new(JobDispatcherImpl::new(
            executor.clone(),
            repositories.job_queue_repository.clone(),
            repositories.run_repository.clone(),
            step_buffer.clone(),
            config_module.worker_config.clone(),
            config_module.job_queue_config.clone(),
        ));
        Self {
            app_module,
            registry,
            step_buffer,
            executor,
            job_dispatcher,
        }
    }

    /// start the dispatch loop and the pending-run sweep.
    /// each task holds a clone of `lock` until it has stopped.
    pub fn start(&self, lock: ShutdownLock, shutdown: ShutdownSignal) -> Vec<JoinHandle<()>> {
        tracing::info!("start worker: agents = {:?}", self.registry.names());
        let mut handles = vec![self
            .job_dispatcher
            .clone()
            .dispatch_jobs(lock.clone(), shutdown.clone())];
        if let Some(h) = spawn_pending_sweep(
            self.app_module.run_app.clone(),
            self.app_module.config_module.sweep_config.clone(),
            lock,
            shutdown,
        ) {
            handles.push(h);
        }
        handles
    }
}

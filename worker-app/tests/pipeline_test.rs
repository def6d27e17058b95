//! Full pipeline tests: submit -> queue -> worker -> steps -> terminal status -> progress stream.
//!
//! Every test runs a real dispatcher against a private in-memory database
//! with short poll intervals.

use agentrun_base::data::{AgentInstanceId, ProgressEvent, RunId, RunMode, RunStatus};
use anyhow::Result;
use app::app::{ProgressConfig, StepBufferConfig, WorkerConfig};
use app::module::test::create_test_app_with;
use app::module::{AppConfigModule, AppModule};
use common::util::shutdown::{create_lock_and_wait, shutdown_signal, ShutdownTrigger, ShutdownWait};
use futures::StreamExt;
use infra::infra::job::queue::JobQueueRepository;
use infra::infra::step::rdb::RdbStepRepository;
use infra::infra::JobQueueConfig;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use worker_app::agent::registry::AgentRegistry;
use worker_app::WorkerModules;

struct Pipeline {
    app: Arc<AppModule>,
    trigger: ShutdownTrigger,
    wait: ShutdownWait,
}

impl Pipeline {
    async fn start(concurrency: u32) -> Result<Self> {
        let mut config = AppConfigModule::default();
        config.job_queue_config = Arc::new(JobQueueConfig {
            fetch_interval: 10,
            ..Default::default()
        });
        config.worker_config = Arc::new(WorkerConfig { concurrency });
        config.step_buffer_config = Arc::new(StepBufferConfig {
            max_entries: 10,
            flush_interval_msec: 50,
        });
        config.progress_config = Arc::new(ProgressConfig {
            poll_interval_msec: 10,
        });
        let app = Arc::new(create_test_app_with(config).await?);
        let worker = WorkerModules::new(app.clone(), Arc::new(AgentRegistry::with_builtins()));
        let (lock, wait) = create_lock_and_wait();
        let (trigger, signal) = shutdown_signal();
        worker.start(lock, signal);
        Ok(Self { app, trigger, wait })
    }

    async fn stop(mut self) -> Result<()> {
        self.trigger.shutdown();
        tokio::time::timeout(Duration::from_secs(5), self.wait.wait()).await?;
        Ok(())
    }

    async fn instance(&self, agent: &str) -> Result<AgentInstanceId> {
        self.app
            .agent_instance_app
            .create_agent_instance("u1", agent, json!({}))
            .await
    }

    async fn submit(&self, agent: &str, input: serde_json::Value) -> Result<RunId> {
        let instance_id = self.instance(agent).await?;
        self.app
            .run_app
            .submit_run("u1", &instance_id, input, RunMode::Live)
            .await
    }

    async fn collect_progress(&self, run_id: &RunId) -> Result<Vec<ProgressEvent>> {
        let stream = self.app.progress_app.stream_progress("u1", run_id).await?;
        let events = tokio::time::timeout(Duration::from_secs(10), stream.collect::<Vec<_>>()).await?;
        events.into_iter().collect()
    }

    async fn wait_status(&self, run_id: &RunId, done: impl Fn(RunStatus) -> bool) -> Result<RunStatus> {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(run) = self.app.run_app.find_run("u1", run_id).await? {
                    if done(run.status) {
                        return Ok::<_, anyhow::Error>(run.status);
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?
    }
}

fn step_indices(events: &[ProgressEvent]) -> Vec<i64> {
    events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Step(s) => Some(s.idx),
            _ => None,
        })
        .collect()
}

fn statuses(events: &[ProgressEvent]) -> Vec<RunStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Status { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_run_streams_every_step_then_completes() -> Result<()> {
    let pipeline = Pipeline::start(2).await?;
    let run_id = pipeline
        .submit("sequence", json!({"steps": 25, "delayMsec": 2}))
        .await?;
    let events = pipeline.collect_progress(&run_id).await?;

    assert_eq!(step_indices(&events), (1..=25).collect::<Vec<i64>>());
    let statuses = statuses(&events);
    assert_eq!(statuses.last(), Some(&RunStatus::Completed));
    assert!(statuses.windows(2).all(|w| w[0] != w[1]));
    match events.last() {
        Some(ProgressEvent::Status { result, .. }) => {
            assert_eq!(result, &Some(json!({"steps": 25})))
        }
        other => panic!("stream must end with a status: {:?}", other),
    }
    pipeline.stop().await
}

#[tokio::test]
async fn test_duplicate_enqueue_runs_once() -> Result<()> {
    let pipeline = Pipeline::start(4).await?;
    let run_id = pipeline.submit("sequence", json!({"steps": 3})).await?;
    let run = pipeline
        .app
        .run_app
        .find_run("u1", &run_id)
        .await?
        .expect("run stored");
    let envelope = agentrun_base::data::JobEnvelope::from_run(&run);
    let queue = pipeline.app.repositories.job_queue_repository.clone();
    let results = futures::future::join_all((0..10).map(|_| queue.enqueue(&envelope))).await;
    for res in results {
        // the submit already holds the dedup key unless the job finished in between
        res?;
    }

    assert_eq!(
        pipeline.wait_status(&run_id, |s| s.is_terminal()).await?,
        RunStatus::Completed
    );
    // let any duplicate lease surface
    tokio::time::sleep(Duration::from_millis(100)).await;
    let steps = pipeline
        .app
        .repositories
        .step_repository
        .find_after(&run_id, 0, 100)
        .await?;
    let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["step-1", "step-2", "step-3"]);
    pipeline.stop().await
}

#[tokio::test]
async fn test_cancel_stops_running_handler() -> Result<()> {
    let pipeline = Pipeline::start(2).await?;
    let run_id = pipeline
        .submit("sequence", json!({"steps": 1000, "delayMsec": 10}))
        .await?;
    pipeline
        .wait_status(&run_id, |s| s == RunStatus::Running)
        .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let cancelled = pipeline.app.run_app.cancel_run("u1", &run_id).await?;
    assert_eq!(cancelled.status, RunStatus::Cancelled);

    let events = pipeline.collect_progress(&run_id).await?;
    assert_eq!(statuses(&events).last(), Some(&RunStatus::Cancelled));

    // the handler notices at its next step and records nothing more
    tokio::time::sleep(Duration::from_millis(200)).await;
    let count = pipeline.app.repositories.step_repository.count(&run_id).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        pipeline.app.repositories.step_repository.count(&run_id).await?,
        count
    );
    assert!(count < 1000);
    let run = pipeline.app.run_app.find_run("u1", &run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.result, None);
    pipeline.stop().await
}

#[tokio::test]
async fn test_awaiting_input_and_resume() -> Result<()> {
    let pipeline = Pipeline::start(2).await?;
    let run_id = pipeline
        .submit("prompt", json!({"question": "which file?"}))
        .await?;
    let events = pipeline.collect_progress(&run_id).await?;
    assert_eq!(statuses(&events).last(), Some(&RunStatus::AwaitingInput));
    assert_eq!(step_indices(&events), vec![1]);

    // the job of the first execution is completed right after the status write
    tokio::time::timeout(Duration::from_secs(5), async {
        while pipeline
            .app
            .repositories
            .job_queue_repository
            .find(&run_id)
            .await?
            .is_some()
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok::<_, anyhow::Error>(())
    })
    .await??;

    pipeline
        .app
        .run_app
        .resume_run("u1", &run_id, json!({"answer": "main.rs"}))
        .await?;
    let events = pipeline.collect_progress(&run_id).await?;
    assert_eq!(statuses(&events).last(), Some(&RunStatus::Completed));
    // a new stream starts from the first step
    assert_eq!(step_indices(&events), vec![1, 2]);
    let run = pipeline.app.run_app.find_run("u1", &run_id).await?.unwrap();
    assert_eq!(
        run.result,
        Some(json!({"question": "which file?", "answer": "main.rs"}))
    );
    pipeline.stop().await
}

#[tokio::test]
async fn test_many_runs_complete_with_bounded_concurrency() -> Result<()> {
    let pipeline = Pipeline::start(3).await?;
    let mut run_ids = Vec::new();
    for i in 0..10 {
        run_ids.push(pipeline.submit("echo", json!({"i": i})).await?);
    }
    for run_id in run_ids.iter() {
        assert_eq!(
            pipeline.wait_status(run_id, |s| s.is_terminal()).await?,
            RunStatus::Completed
        );
    }
    // jobs are completed right after the final status write
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let counts = pipeline
                .app
                .repositories
                .job_queue_repository
                .count_by_state()
                .await?;
            if counts.waiting + counts.active + counts.delayed + counts.failed == 0 {
                return Ok::<_, anyhow::Error>(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await??;
    pipeline.stop().await
}

#[tokio::test]
async fn test_failing_handler_marks_run_failed_not_job() -> Result<()> {
    let pipeline = Pipeline::start(1).await?;
    let run_id = pipeline
        .submit("sequence", json!({"steps": 3, "failAt": 2}))
        .await?;
    let events = pipeline.collect_progress(&run_id).await?;
    assert_eq!(statuses(&events).last(), Some(&RunStatus::Failed));
    assert_eq!(step_indices(&events), vec![1]);
    match events.last() {
        Some(ProgressEvent::Status { error, .. }) => {
            assert!(error.as_deref().unwrap_or_default().contains("failed at step 2"))
        }
        other => panic!("stream must end with a status: {:?}", other),
    }
    // handler failures are not retried by the queue
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(pipeline
        .app
        .repositories
        .job_queue_repository
        .find(&run_id)
        .await?
        .is_none());
    pipeline.stop().await
}

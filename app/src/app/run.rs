use agentrun_base::data::{
    AgentInstanceId, JobEnvelope, Run, RunId, RunMode, RunStatus, Step,
};
use agentrun_base::error::AgentRunError;
use agentrun_base::limits;
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::util::datetime;
use infra::infra::agent_instance::rdb::{
    RdbAgentInstanceRepository, RdbAgentInstanceRepositoryImpl, UseRdbAgentInstanceRepository,
};
use infra::infra::job::queue::{JobQueueRepository, UseJobQueueRepository};
use infra::infra::module::RepositoryModule;
use infra::infra::run::rdb::{RdbRunRepository, RdbRunRepositoryImpl, UseRdbRunRepository};
use infra::infra::step::rdb::{RdbStepRepository, RdbStepRepositoryImpl, UseRdbStepRepository};
use infra::infra::{IdGeneratorWrapper, UseIdGenerator};
use std::{fmt, sync::Arc};

/// max runs re-enqueued by one sweep
const RECONCILE_BATCH_SIZE: i32 = 1000;

#[async_trait]
pub trait RunApp: fmt::Debug + Send + Sync {
    /// create a PENDING run and enqueue its job. returns as soon as the job is queued.
    async fn submit_run(
        &self,
        user_id: &str,
        agent_instance_id: &AgentInstanceId,
        input: serde_json::Value,
        mode: RunMode,
    ) -> Result<RunId>;

    /// AWAITING_INPUT -> PENDING with the input merged in, then re-enqueue
    async fn resume_run(
        &self,
        user_id: &str,
        run_id: &RunId,
        input: serde_json::Value,
    ) -> Result<RunId>;

    /// advisory: an in-flight handler notices at its next step
    async fn cancel_run(&self, user_id: &str, run_id: &RunId) -> Result<Run>;

    async fn find_run(&self, user_id: &str, run_id: &RunId) -> Result<Option<Run>>;

    async fn list_runs(
        &self,
        user_id: &str,
        limit: Option<i32>,
        offset: Option<i64>,
    ) -> Result<Vec<Run>>;

    async fn list_steps(
        &self,
        user_id: &str,
        run_id: &RunId,
        after_idx: Option<i64>,
        limit: Option<i32>,
    ) -> Result<Vec<Step>>;

    /// re-enqueue PENDING runs older than `older_than_msec`.
    /// returns the number of runs that got a new job.
    async fn reconcile_pending(&self, older_than_msec: u64) -> Result<usize>;
}

pub trait UseRunApp {
    fn run_app(&self) -> &Arc<dyn RunApp>;
}

#[derive(Clone, Debug)]
pub struct RunAppImpl {
    id_generator: Arc<IdGeneratorWrapper>,
    repositories: Arc<RepositoryModule>,
}

impl RunAppImpl {
    pub fn new(id_generator: Arc<IdGeneratorWrapper>, repositories: Arc<RepositoryModule>) -> Self {
        Self {
            id_generator,
            repositories,
        }
    }

    // not found and owned by another user look the same to the caller
    async fn find_owned(&self, user_id: &str, run_id: &RunId) -> Result<Run> {
        match self.run_repository().find(run_id).await? {
            Some(run) if run.user_id == user_id => Ok(run),
            _ => Err(AgentRunError::NotFound(format!("run not found: {}", run_id)).into()),
        }
    }

    async fn enqueue(&self, run: &Run) -> Result<bool> {
        let envelope = JobEnvelope::from_run(run);
        self.job_queue_repository()
            .enqueue(&envelope)
            .await
            .map_err(|e| {
                tracing::error!("failed to enqueue run {}: {:?}", run.id, e);
                AgentRunError::EnqueueError(format!("run {}: {}", run.id, e)).into()
            })
    }

    /// shallow merge of json objects; any other shape is replaced
    fn merge_input(current: &serde_json::Value, input: serde_json::Value) -> serde_json::Value {
        match (current, input) {
            (serde_json::Value::Object(cur), serde_json::Value::Object(new)) => {
                let mut merged = cur.clone();
                merged.extend(new);
                serde_json::Value::Object(merged)
            }
            (_, new) => new,
        }
    }
}

impl UseIdGenerator for RunAppImpl {
    fn id_generator(&self) -> &IdGeneratorWrapper {
        &self.id_generator
    }
}
impl UseRdbRunRepository for RunAppImpl {
    fn run_repository(&self) -> &RdbRunRepositoryImpl {
        &self.repositories.run_repository
    }
}
impl UseRdbStepRepository for RunAppImpl {
    fn step_repository(&self) -> &RdbStepRepositoryImpl {
        &self.repositories.step_repository
    }
}
impl UseRdbAgentInstanceRepository for RunAppImpl {
    fn agent_instance_repository(&self) -> &RdbAgentInstanceRepositoryImpl {
        &self.repositories.agent_instance_repository
    }
}
impl UseJobQueueRepository for RunAppImpl {
    fn job_queue_repository(&self) -> Arc<dyn JobQueueRepository> {
        self.repositories.job_queue_repository.clone()
    }
}

#[async_trait]
impl RunApp for RunAppImpl {
    async fn submit_run(
        &self,
        user_id: &str,
        agent_instance_id: &AgentInstanceId,
        input: serde_json::Value,
        mode: RunMode,
    ) -> Result<RunId> {
        match self.agent_instance_repository().find(agent_instance_id).await? {
            Some(instance) if instance.user_id == user_id => {}
            _ => {
                return Err(AgentRunError::NotFound(format!(
                    "agent instance not found: {}",
                    agent_instance_id
                ))
                .into())
            }
        }
        let run = Run {
            id: RunId::new(self.id_generator().generate_id()?),
            user_id: user_id.to_string(),
            agent_instance_id: *agent_instance_id,
            input,
            mode,
            status: RunStatus::Pending,
            created_at: datetime::now_millis(),
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
        };
        self.run_repository()
            .create(&run)
            .await
            .context("failed to create run")?;
        // the row stays PENDING on enqueue failure and is picked up by the sweep
        self.enqueue(&run).await?;
        tracing::info!(
            run_id = run.id.value,
            agent_instance_id = agent_instance_id.value,
            "run submitted"
        );
        Ok(run.id)
    }

    async fn resume_run(
        &self,
        user_id: &str,
        run_id: &RunId,
        input: serde_json::Value,
    ) -> Result<RunId> {
        let run = self.find_owned(user_id, run_id).await?;
        if run.status != RunStatus::AwaitingInput {
            return Err(AgentRunError::InvalidStatusTransition(format!(
                "run {} is {}, not {}",
                run_id,
                run.status,
                RunStatus::AwaitingInput
            ))
            .into());
        }
        let merged = Self::merge_input(&run.input, input);
        if !self.run_repository().resume(run_id, &merged).await? {
            // cancelled or resumed concurrently
            return Err(AgentRunError::InvalidStatusTransition(format!(
                "run {} is no longer awaiting input",
                run_id
            ))
            .into());
        }
        let resumed = Run {
            input: merged,
            status: RunStatus::Pending,
            error: None,
            result: None,
            ..run
        };
        if !self.enqueue(&resumed).await? {
            // the job that asked for input is still leased: the worker requeues
            // the run when it completes that job
            tracing::warn!(
                run_id = run_id.value,
                "previous job still queued: resumed run waits for it to complete"
            );
        }
        tracing::info!(run_id = run_id.value, "run resumed");
        Ok(*run_id)
    }

    async fn cancel_run(&self, user_id: &str, run_id: &RunId) -> Result<Run> {
        let run = self.find_owned(user_id, run_id).await?;
        if run.status.is_terminal() {
            tracing::debug!("run {} already {}: not cancelled", run_id, run.status);
            return Ok(run);
        }
        if self
            .run_repository()
            .transition(run_id, RunStatus::Cancelled, None, None)
            .await?
        {
            tracing::info!(run_id = run_id.value, "run cancelled");
        }
        // re-read: the run may have finished concurrently
        self.find_owned(user_id, run_id).await
    }

    async fn find_run(&self, user_id: &str, run_id: &RunId) -> Result<Option<Run>> {
        Ok(self
            .run_repository()
            .find(run_id)
            .await?
            .filter(|r| r.user_id == user_id))
    }

    async fn list_runs(
        &self,
        user_id: &str,
        limit: Option<i32>,
        offset: Option<i64>,
    ) -> Result<Vec<Run>> {
        let (limit, offset) = limits::clamp_page(limit, offset);
        self.run_repository()
            .find_list_by_user(user_id, limit, offset)
            .await
    }

    async fn list_steps(
        &self,
        user_id: &str,
        run_id: &RunId,
        after_idx: Option<i64>,
        limit: Option<i32>,
    ) -> Result<Vec<Step>> {
        self.find_owned(user_id, run_id).await?;
        let (limit, _) = limits::clamp_page(limit, None);
        self.step_repository()
            .find_after(run_id, after_idx.unwrap_or(0), limit)
            .await
    }

    async fn reconcile_pending(&self, older_than_msec: u64) -> Result<usize> {
        let cutoff = datetime::now_millis() - older_than_msec as i64;
        let runs = self
            .run_repository()
            .find_pending_before(cutoff, RECONCILE_BATCH_SIZE)
            .await?;
        let mut enqueued = 0;
        for run in runs.iter() {
            match self.enqueue(run).await {
                Ok(true) => {
                    tracing::warn!(run_id = run.id.value, "re-enqueued stale pending run");
                    enqueued += 1;
                }
                // already has a live job
                Ok(false) => {}
                Err(e) => tracing::error!("sweep: failed to re-enqueue run {}: {:?}", run.id, e),
            }
        }
        Ok(enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::agent_instance::AgentInstanceApp;
    use crate::module::test::create_test_app;
    use agentrun_base::data::JobState;
    use serde_json::json;

    #[tokio::test]
    async fn test_submit_run_creates_pending_run_and_job() -> Result<()> {
        let app = create_test_app().await?;
        let instance_id = app
            .agent_instance_app
            .create_agent_instance("alice", "echo", json!({}))
            .await?;
        let run_id = app
            .run_app
            .submit_run("alice", &instance_id, json!({"q": 1}), RunMode::Live)
            .await?;

        let run = app.run_app.find_run("alice", &run_id).await?.unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.input, json!({"q": 1}));
        let job = app
            .repositories
            .job_queue_repository
            .find(&run_id)
            .await?
            .unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.envelope.run_id, run_id);
        assert_eq!(job.envelope.agent_instance_id, instance_id);

        // other users cannot see it
        assert_eq!(app.run_app.find_run("bob", &run_id).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_submit_run_rejects_foreign_or_missing_instance() -> Result<()> {
        let app = create_test_app().await?;
        let instance_id = app
            .agent_instance_app
            .create_agent_instance("alice", "echo", json!({}))
            .await?;
        for (user, id) in [("bob", instance_id), ("alice", AgentInstanceId::new(-1))] {
            let err = app
                .run_app
                .submit_run(user, &id, json!({}), RunMode::Live)
                .await
                .unwrap_err();
            assert!(matches!(
                AgentRunError::find_in(&err),
                Some(AgentRunError::NotFound(_))
            ));
        }
        assert!(app.run_app.list_runs("alice", None, None).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_run() -> Result<()> {
        let app = create_test_app().await?;
        let instance_id = app
            .agent_instance_app
            .create_agent_instance("alice", "echo", json!({}))
            .await?;
        let run_id = app
            .run_app
            .submit_run("alice", &instance_id, json!({}), RunMode::Live)
            .await?;
        assert!(app.run_app.cancel_run("bob", &run_id).await.is_err());

        let cancelled = app.run_app.cancel_run("alice", &run_id).await?;
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
        // idempotent
        let again = app.run_app.cancel_run("alice", &run_id).await?;
        assert_eq!(again, cancelled);
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_run_only_when_awaiting_input() -> Result<()> {
        let app = create_test_app().await?;
        let instance_id = app
            .agent_instance_app
            .create_agent_instance("alice", "prompt", json!({}))
            .await?;
        let run_id = app
            .run_app
            .submit_run("alice", &instance_id, json!({"topic": "x"}), RunMode::Live)
            .await?;
        let err = app
            .run_app
            .resume_run("alice", &run_id, json!({"answer": "y"}))
            .await
            .unwrap_err();
        assert!(matches!(
            AgentRunError::find_in(&err),
            Some(AgentRunError::InvalidStatusTransition(_))
        ));

        // simulate the worker: lease, run, ask for input, complete the job
        let queue = app.repositories.job_queue_repository.clone();
        let job = queue.fetch_and_lease(1).await?.remove(0);
        let runs = &app.repositories.run_repository;
        runs.transition(&run_id, RunStatus::Running, None, None).await?;
        runs.transition(&run_id, RunStatus::AwaitingInput, None, Some(json!({"question": "?"})))
            .await?;
        assert!(queue.complete(&job).await?);

        app.run_app
            .resume_run("alice", &run_id, json!({"answer": "y"}))
            .await?;
        let run = app.run_app.find_run("alice", &run_id).await?.unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.input, json!({"topic": "x", "answer": "y"}));
        assert!(queue.find(&run_id).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_before_job_completes_keeps_run_pending() -> Result<()> {
        let app = create_test_app().await?;
        let instance_id = app
            .agent_instance_app
            .create_agent_instance("alice", "prompt", json!({}))
            .await?;
        let run_id = app
            .run_app
            .submit_run("alice", &instance_id, json!({}), RunMode::Live)
            .await?;
        let queue = app.repositories.job_queue_repository.clone();
        let job = queue.fetch_and_lease(1).await?.remove(0);
        let runs = &app.repositories.run_repository;
        runs.transition(&run_id, RunStatus::Running, None, None).await?;
        runs.transition(&run_id, RunStatus::AwaitingInput, None, Some(json!({"question": "?"})))
            .await?;

        // the old job is still leased, so the enqueue is deduplicated
        app.run_app
            .resume_run("alice", &run_id, json!({"answer": "y"}))
            .await?;
        let run = app.run_app.find_run("alice", &run_id).await?.unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        let queued = queue.find(&run_id).await?.unwrap();
        assert_eq!(queued.state, JobState::Active);
        assert_eq!(queued.attempts, job.attempts);
        Ok(())
    }

    #[tokio::test]
    async fn test_reconcile_pending_requeues_lost_jobs() -> Result<()> {
        let app = create_test_app().await?;
        let instance_id = app
            .agent_instance_app
            .create_agent_instance("alice", "echo", json!({}))
            .await?;
        let lost = app
            .run_app
            .submit_run("alice", &instance_id, json!({}), RunMode::Live)
            .await?;
        let queued = app
            .run_app
            .submit_run("alice", &instance_id, json!({}), RunMode::Live)
            .await?;
        // simulate a lost enqueue
        app.repositories.job_queue_repository.remove(&lost).await?;

        assert_eq!(app.run_app.reconcile_pending(0).await?, 1);
        assert!(app.repositories.job_queue_repository.find(&lost).await?.is_some());
        assert!(app.repositories.job_queue_repository.find(&queued).await?.is_some());
        // nothing left to do
        assert_eq!(app.run_app.reconcile_pending(0).await?, 0);
        // too young to be swept
        app.repositories.job_queue_repository.remove(&lost).await?;
        assert_eq!(app.run_app.reconcile_pending(3_600_000).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_steps_checks_owner() -> Result<()> {
        let app = create_test_app().await?;
        let instance_id = app
            .agent_instance_app
            .create_agent_instance("alice", "echo", json!({}))
            .await?;
        let run_id = app
            .run_app
            .submit_run("alice", &instance_id, json!({}), RunMode::Live)
            .await?;
        assert!(app.run_app.list_steps("alice", &run_id, None, None).await?.is_empty());
        assert!(app.run_app.list_steps("bob", &run_id, None, None).await.is_err());
        Ok(())
    }

    #[test]
    fn test_merge_input() {
        assert_eq!(
            RunAppImpl::merge_input(&json!({"a": 1, "b": 2}), json!({"b": 3, "c": 4})),
            json!({"a": 1, "b": 3, "c": 4})
        );
        assert_eq!(
            RunAppImpl::merge_input(&json!("text"), json!({"b": 3})),
            json!({"b": 3})
        );
    }
}

//! Agents shipped with the worker.
//!
//! - `echo`: records the input as one step and returns it
//! - `sequence`: records a configurable number of steps, optionally slowly or failing
//! - `prompt`: asks a question and completes once the run is resumed with an answer

use super::{AgentHandler, AgentOutcome, AgentRequest};
use crate::worker::context::StepContext;
use agentrun_base::data::RunMode;
use agentrun_base::error::AgentRunError;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const MAX_SEQUENCE_STEPS: u32 = 10_000;

fn parse_input<T: for<'de> Deserialize<'de> + Default>(input: &serde_json::Value) -> Result<T> {
    if input.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(input.clone())
        .map_err(|e| AgentRunError::InvalidParameter(format!("invalid agent input: {}", e)).into())
}

#[derive(Debug, Clone, Copy)]
pub struct EchoAgent;

#[async_trait]
impl AgentHandler for EchoAgent {
    fn name(&self) -> &str {
        "echo"
    }

    async fn run(&self, request: AgentRequest, ctx: &StepContext) -> Result<AgentOutcome> {
        ctx.append_step("echo", request.input.clone()).await?;
        Ok(AgentOutcome::Completed(json!({
            "echo": request.input,
            "mode": request.mode,
        })))
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
struct SequenceInput {
    steps: u32,
    delay_msec: u64,
    /// return an error instead of recording this step
    fail_at: Option<u32>,
}

impl Default for SequenceInput {
    fn default() -> Self {
        Self {
            steps: 3,
            delay_msec: 0,
            fail_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SequenceAgent;

#[async_trait]
impl AgentHandler for SequenceAgent {
    fn name(&self) -> &str {
        "sequence"
    }

    async fn run(&self, request: AgentRequest, ctx: &StepContext) -> Result<AgentOutcome> {
        let input: SequenceInput = parse_input(&request.input)?;
        if input.steps > MAX_SEQUENCE_STEPS {
            return Err(AgentRunError::InvalidParameter(format!(
                "steps must be at most {}",
                MAX_SEQUENCE_STEPS
            ))
            .into());
        }
        let dry_run = request.mode == RunMode::DryRun;
        for i in 1..=input.steps {
            if input.delay_msec > 0 {
                ctx.check_cancelled().await?;
                tokio::time::sleep(Duration::from_millis(input.delay_msec)).await;
            }
            if input.fail_at == Some(i) {
                return Err(AgentRunError::HandlerError(format!("sequence failed at step {}", i)).into());
            }
            ctx.append_step(&format!("step-{}", i), json!({"i": i, "dryRun": dry_run}))
                .await?;
        }
        Ok(AgentOutcome::Completed(json!({"steps": input.steps})))
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
struct PromptInput {
    question: Option<String>,
    answer: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy)]
pub struct PromptAgent;

#[async_trait]
impl AgentHandler for PromptAgent {
    fn name(&self) -> &str {
        "prompt"
    }

    async fn run(&self, request: AgentRequest, ctx: &StepContext) -> Result<AgentOutcome> {
        let input: PromptInput = parse_input(&request.input)?;
        let question = input
            .question
            .unwrap_or_else(|| "input required".to_string());
        match input.answer {
            Some(answer) => {
                ctx.append_step("answer", json!({"answer": &answer})).await?;
                Ok(AgentOutcome::Completed(json!({
                    "question": question,
                    "answer": answer,
                })))
            }
            None => {
                ctx.append_step("question", json!({"question": &question}))
                    .await?;
                Ok(AgentOutcome::AwaitingInput(json!({"question": question})))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::step_buffer::StepBuffer;
    use agentrun_base::data::RunStatus;
    use app::module::test::create_test_app;
    use app::module::AppModule;
    use infra::infra::run::rdb::RdbRunRepository;
    use infra::infra::step::rdb::RdbStepRepository;
    use std::sync::Arc;

    struct Fixture {
        app: AppModule,
        buffer: Arc<StepBuffer>,
        ctx: StepContext,
        request: AgentRequest,
    }

    async fn setup(agent: &str, input: serde_json::Value) -> Result<Fixture> {
        let app = create_test_app().await?;
        let instance_id = app
            .agent_instance_app
            .create_agent_instance("u1", agent, json!({}))
            .await?;
        let run_id = app
            .run_app
            .submit_run("u1", &instance_id, input.clone(), RunMode::Live)
            .await?;
        let buffer = Arc::new(StepBuffer::new(
            app.repositories.step_writer(),
            app.config_module.step_buffer_config.clone(),
        ));
        let ctx = StepContext::new(
            run_id,
            1,
            buffer.clone(),
            app.repositories.run_repository.clone(),
        );
        let request = AgentRequest {
            run_id,
            input,
            mode: RunMode::Live,
            user_id: "u1".to_string(),
            credentials: json!({}),
        };
        Ok(Fixture {
            app,
            buffer,
            ctx,
            request,
        })
    }

    async fn flushed_step_names(f: &Fixture) -> Result<Vec<String>> {
        f.buffer.flush().await;
        Ok(f.app
            .repositories
            .step_repository
            .find_after(&f.request.run_id, 0, 100)
            .await?
            .into_iter()
            .map(|s| s.name)
            .collect())
    }

    #[tokio::test]
    async fn test_echo() -> Result<()> {
        let f = setup("echo", json!({"text": "hi"})).await?;
        let outcome = EchoAgent.run(f.request.clone(), &f.ctx).await?;
        assert_eq!(
            outcome,
            AgentOutcome::Completed(json!({"echo": {"text": "hi"}, "mode": "LIVE"}))
        );
        assert_eq!(flushed_step_names(&f).await?, vec!["echo"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_sequence_steps_and_failure() -> Result<()> {
        let f = setup("sequence", json!({"steps": 4, "failAt": 3})).await?;
        let err = SequenceAgent.run(f.request.clone(), &f.ctx).await.unwrap_err();
        assert!(matches!(
            AgentRunError::find_in(&err),
            Some(AgentRunError::HandlerError(_))
        ));
        assert_eq!(
            flushed_step_names(&f).await?,
            vec!["step-1", "step-2"]
        );

        let err = SequenceAgent
            .run(
                AgentRequest {
                    input: json!({"steps": "many"}),
                    mode: RunMode::DryRun,
                    ..f.request.clone()
                },
                &f.ctx,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            AgentRunError::find_in(&err),
            Some(AgentRunError::InvalidParameter(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_sequence_stops_when_cancelled() -> Result<()> {
        let f = setup("sequence", json!({"steps": 2})).await?;
        f.app.run_app.cancel_run("u1", &f.request.run_id).await?;
        let err = SequenceAgent.run(f.request.clone(), &f.ctx).await.unwrap_err();
        assert!(AgentRunError::is_cancelled(&err));
        Ok(())
    }

    #[tokio::test]
    async fn test_prompt_question_then_answer() -> Result<()> {
        let f = setup("prompt", json!({"question": "name?"})).await?;
        let outcome = PromptAgent.run(f.request.clone(), &f.ctx).await?;
        assert_eq!(outcome, AgentOutcome::AwaitingInput(json!({"question": "name?"})));

        let outcome = PromptAgent
            .run(
                AgentRequest {
                    input: json!({"question": "name?", "answer": "alice"}),
                    ..f.request.clone()
                },
                &f.ctx,
            )
            .await?;
        assert_eq!(
            outcome,
            AgentOutcome::Completed(json!({"question": "name?", "answer": "alice"}))
        );
        assert_eq!(
            flushed_step_names(&f).await?,
            vec!["question", "answer"]
        );
        // the handler itself never touches the run status
        assert_eq!(
            f.app
                .repositories
                .run_repository
                .find_status(&f.request.run_id)
                .await?,
            Some(RunStatus::Pending)
        );
        Ok(())
    }
}

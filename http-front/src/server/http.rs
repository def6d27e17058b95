//! HTTP server implementation.
//!
//! axum router under `/api` over the run, agent instance, progress and
//! queue admin applications.

use crate::config::ServerConfig;
use crate::error::AppError;
use crate::server::auth::{admin_middleware, auth_middleware, AuthUser, TokenStore};
use agentrun_base::data::{AgentInstanceId, JobState, ProgressEvent, RunId, RunMode};
use anyhow::Result;
use app::module::AppModule;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use common::util::shutdown::{ShutdownLock, ShutdownSignal};
use futures::stream::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Application state for axum handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    pub app_module: Arc<AppModule>,
    pub token_store: Arc<TokenStore>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            header::HeaderName::from_static("x-user-id"),
        ]);

    let admin_routes = Router::new()
        .route("/jobs", get(list_jobs_handler))
        .route("/jobs/counts", get(job_counts_handler))
        .route("/jobs/{run_id}", get(find_job_handler).delete(remove_job_handler))
        .route("/jobs/{run_id}/retry", post(retry_job_handler))
        .layer(axum::middleware::from_fn(admin_middleware));

    let api_routes = Router::new()
        .route(
            "/agent-instances",
            post(create_agent_instance_handler).get(list_agent_instances_handler),
        )
        .route("/runs", post(submit_run_handler).get(list_runs_handler))
        .route("/runs/{run_id}", get(find_run_handler).delete(cancel_run_handler))
        .route("/runs/{run_id}/steps", get(list_steps_handler))
        .route("/runs/{run_id}/stream", get(stream_handler))
        .route("/runs/{run_id}/resume", post(resume_run_handler))
        .nest("/admin", admin_routes)
        .layer(axum::middleware::from_fn_with_state(
            state.token_store.clone(),
            auth_middleware,
        ));

    Router::new()
        .nest(
            "/api",
            Router::new()
                .route("/health", get(health_handler))
                .merge(api_routes),
        )
        .layer(cors)
        .with_state(state)
}

/// Boot the HTTP server; returns after `shutdown` fired and in-flight
/// requests finished.
pub async fn boot_http_server(
    app_module: Arc<AppModule>,
    token_store: Arc<TokenStore>,
    config: ServerConfig,
    lock: ShutdownLock,
    mut shutdown: ShutdownSignal,
) -> Result<()> {
    let app = router(AppState {
        app_module,
        token_store,
    });
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("HTTP server started on {}", &config.bind_addr);

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.recv().await;
            tracing::info!("shutting down HTTP server");
        })
        .await;

    // Always unlock regardless of success or error
    lock.unlock();
    result.map_err(Into::into)
}

fn parse_run_id(s: &str) -> Result<RunId, AppError> {
    RunId::from_str(s).map_err(|_| AppError::BadRequest(format!("invalid run id: {}", s)))
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| AppError::BadRequest(e.body_text()))
}

/// Health check endpoint.
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": agentrun_base::APP_FRONT_NAME,
    }))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CreateAgentInstanceRequest {
    agent_name: String,
    #[serde(default)]
    credentials: serde_json::Value,
}

async fn create_agent_instance_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    payload: Result<Json<CreateAgentInstanceRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let req = json_body(payload)?;
    let id = state
        .app_module
        .agent_instance_app
        .create_agent_instance(&user.user_id, &req.agent_name, req.credentials)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"agentInstanceId": id})),
    )
        .into_response())
}

async fn list_agent_instances_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Response, AppError> {
    let instances = state
        .app_module
        .agent_instance_app
        .list_agent_instances(&user.user_id)
        .await?;
    Ok(Json(instances).into_response())
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SubmitRunRequest {
    agent_instance_id: AgentInstanceId,
    #[serde(default)]
    input: serde_json::Value,
    #[serde(default)]
    mode: RunMode,
}

/// POST /api/runs - accepted as soon as the job is queued
async fn submit_run_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    payload: Result<Json<SubmitRunRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let req = json_body(payload)?;
    let run_id = state
        .app_module
        .run_app
        .submit_run(&user.user_id, &req.agent_instance_id, req.input, req.mode)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({"runId": run_id}))).into_response())
}

#[derive(Deserialize, Debug, Default)]
struct PageQuery {
    limit: Option<i32>,
    offset: Option<i64>,
}

async fn list_runs_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(page): Query<PageQuery>,
) -> Result<Response, AppError> {
    let runs = state
        .app_module
        .run_app
        .list_runs(&user.user_id, page.limit, page.offset)
        .await?;
    Ok(Json(runs).into_response())
}

async fn find_run_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(run_id): Path<String>,
) -> Result<Response, AppError> {
    let run_id = parse_run_id(&run_id)?;
    match state
        .app_module
        .run_app
        .find_run(&user.user_id, &run_id)
        .await?
    {
        Some(run) => Ok(Json(run).into_response()),
        None => Err(AppError::NotFound(format!("run not found: {}", run_id))),
    }
}

/// DELETE /api/runs/{run_id} - advisory cancel
async fn cancel_run_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(run_id): Path<String>,
) -> Result<Response, AppError> {
    let run_id = parse_run_id(&run_id)?;
    let run = state
        .app_module
        .run_app
        .cancel_run(&user.user_id, &run_id)
        .await?;
    Ok(Json(run).into_response())
}

#[derive(Deserialize, Debug, Default)]
struct StepsQuery {
    after: Option<i64>,
    limit: Option<i32>,
}

async fn list_steps_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(run_id): Path<String>,
    Query(query): Query<StepsQuery>,
) -> Result<Response, AppError> {
    let run_id = parse_run_id(&run_id)?;
    let steps = state
        .app_module
        .run_app
        .list_steps(&user.user_id, &run_id, query.after, query.limit)
        .await?;
    Ok(Json(steps).into_response())
}

#[derive(Deserialize, Debug)]
struct ResumeRunRequest {
    #[serde(default)]
    input: serde_json::Value,
}

async fn resume_run_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(run_id): Path<String>,
    payload: Result<Json<ResumeRunRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let run_id = parse_run_id(&run_id)?;
    let req = json_body(payload)?;
    let run_id = state
        .app_module
        .run_app
        .resume_run(&user.user_id, &run_id, req.input)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({"runId": run_id}))).into_response())
}

fn to_sse_event(event: &ProgressEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    let sse = Event::default().event(event.event_type()).data(data);
    match event {
        ProgressEvent::Step(step) => sse.id(step.idx.to_string()),
        ProgressEvent::Status { .. } => sse,
    }
}

/// GET /api/runs/{run_id}/stream - progress as Server-Sent Events
async fn stream_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(run_id): Path<String>,
) -> Result<Response, AppError> {
    let run_id = parse_run_id(&run_id)?;
    let events = state
        .app_module
        .progress_app
        .stream_progress(&user.user_id, &run_id)
        .await?;
    let sse_stream = events.map(move |res| {
        let event = match res {
            Ok(event) => to_sse_event(&event),
            Err(e) => {
                tracing::warn!(run_id = run_id.value, "progress stream failed: {:?}", &e);
                let body = AppError::from(e).to_json();
                Event::default().event("error").data(body.to_string())
            }
        };
        Ok::<_, Infallible>(event)
    });

    let mut response = Sse::new(sse_stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    // Disable buffering for real-time streaming
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    response.headers_mut().insert(
        header::HeaderName::from_static("x-accel-buffering"),
        header::HeaderValue::from_static("no"),
    );
    Ok(response)
}

#[derive(Deserialize, Debug, Default)]
struct JobsQuery {
    state: Option<String>,
    limit: Option<i32>,
    offset: Option<i64>,
}

async fn list_jobs_handler(
    State(state): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> Result<Response, AppError> {
    let job_state = query
        .state
        .as_deref()
        .map(|s| {
            JobState::from_str(s)
                .map_err(|_| AppError::BadRequest(format!("unknown job state: {}", s)))
        })
        .transpose()?;
    let jobs = state
        .app_module
        .queue_admin_app
        .list_jobs(job_state, query.limit, query.offset)
        .await?;
    Ok(Json(jobs).into_response())
}

async fn job_counts_handler(State(state): State<AppState>) -> Result<Response, AppError> {
    let counts = state.app_module.queue_admin_app.counts().await?;
    Ok(Json(counts).into_response())
}

async fn find_job_handler(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Response, AppError> {
    let run_id = parse_run_id(&run_id)?;
    match state.app_module.queue_admin_app.find_job(&run_id).await? {
        Some(job) => Ok(Json(job).into_response()),
        None => Err(AppError::NotFound(format!("job not found: {}", run_id))),
    }
}

async fn retry_job_handler(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Response, AppError> {
    let run_id = parse_run_id(&run_id)?;
    if state
        .app_module
        .queue_admin_app
        .retry_dead_job(&run_id)
        .await?
    {
        Ok(Json(serde_json::json!({"retried": true})).into_response())
    } else {
        Err(AppError::NotFound(format!("no dead job for run {}", run_id)))
    }
}

async fn remove_job_handler(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Response, AppError> {
    let run_id = parse_run_id(&run_id)?;
    if state.app_module.queue_admin_app.remove_job(&run_id).await? {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Err(AppError::NotFound(format!("job not found: {}", run_id)))
    }
}

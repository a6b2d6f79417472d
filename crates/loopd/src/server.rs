//! HTTP control plane for loopd (Section 6.1).
//!
//! A local REST+SSE surface over `RunStore`/`Scheduler`, grounded in the
//! reference server's router layout (`create_router`, bearer-token
//! `check_auth`, SSE via `stream::unfold`) and adapted from its
//! database-backed `Run`/`Step` model to this crate's file-backed
//! `RunState`/`IterationRecord`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use loop_core::{Config, Id, IterationRecord, RunState};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::planner::LlmProvider;
use crate::scheduler::Scheduler;
use crate::store::RunStore;

struct AppState<P: LlmProvider + Send + Sync + 'static> {
    store: Arc<RunStore>,
    scheduler: Arc<Scheduler<P>>,
    auth_token: Option<String>,
    sse_poll_interval: Duration,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn err(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (status, Json(ErrorResponse { error: message.into() }))
}

fn check_auth<P: LlmProvider + Send + Sync + 'static>(
    state: &AppState<P>,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    let Some(expected) = &state.auth_token else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));
    match provided {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(err(StatusCode::UNAUTHORIZED, "invalid auth token")),
        None => Err(err(StatusCode::UNAUTHORIZED, "missing auth token")),
    }
}

#[derive(Debug, Deserialize)]
struct CreateRunRequest {
    task: String,
    workspace: String,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    max_iters: Option<u32>,
}

#[derive(Debug, Serialize)]
struct CreateRunResponse {
    run_id: Id,
}

#[derive(Debug, Serialize)]
struct ListRunsResponse {
    runs: Vec<RunState>,
}

async fn create_run<P: LlmProvider + Send + Sync + 'static>(
    State(state): State<Arc<AppState<P>>>,
    headers: HeaderMap,
    Json(req): Json<CreateRunRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;

    let run_id = Id::new();
    let run_state = RunState::new(
        run_id.clone(),
        req.task,
        req.provider.unwrap_or_else(|| "openai".to_string()),
        req.model.unwrap_or_else(|| "gpt-4o-mini".to_string()),
        req.workspace.clone(),
        String::new(),
        req.max_iters.unwrap_or(10),
    );

    state
        .store
        .init_run(&run_state)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to create run: {e}")))?;

    state.scheduler.spawn(run_id.clone(), req.workspace).map_err(|e| {
        warn!(run_id = %run_id, error = %e, "failed to admit run");
        err(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })?;

    info!(run_id = %run_id, "created run");
    Ok((StatusCode::CREATED, Json(CreateRunResponse { run_id })))
}

async fn list_runs<P: LlmProvider + Send + Sync + 'static>(
    State(state): State<Arc<AppState<P>>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;

    let ids = state
        .store
        .list_run_ids()
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to list runs: {e}")))?;
    let runs = ids.iter().filter_map(|id| state.store.read_state(id).ok()).collect();
    Ok(Json(ListRunsResponse { runs }))
}

async fn get_run<P: LlmProvider + Send + Sync + 'static>(
    State(state): State<Arc<AppState<P>>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;

    let run_id = Id::from_string(&id);
    let run = state
        .store
        .read_state(&run_id)
        .map_err(|e| err(StatusCode::NOT_FOUND, format!("run not found: {e}")))?;
    Ok(Json(run))
}

#[derive(Debug, Serialize)]
struct ListIterationsResponse {
    iterations: Vec<IterationRecord>,
}

async fn list_iterations<P: LlmProvider + Send + Sync + 'static>(
    State(state): State<Arc<AppState<P>>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;

    let run_id = Id::from_string(&id);
    state
        .store
        .read_state(&run_id)
        .map_err(|e| err(StatusCode::NOT_FOUND, format!("run not found: {e}")))?;
    let iterations = state
        .store
        .read_iterations(&run_id)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to read iterations: {e}")))?;
    Ok(Json(ListIterationsResponse { iterations }))
}

async fn cancel_run<P: LlmProvider + Send + Sync + 'static>(
    State(state): State<Arc<AppState<P>>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;

    let run_id = Id::from_string(&id);
    state
        .store
        .request_cancel(&run_id)
        .map_err(|e| err(StatusCode::NOT_FOUND, format!("failed to cancel run: {e}")))?;
    info!(run_id = %run_id, "cancel requested");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /runs/{id}/events — Server-Sent Events, one event line per message.
/// Resumable via the `Last-Event-ID` header (a 0-based event index); closes
/// once the run reaches a terminal status and no events remain to flush.
async fn stream_events<P: LlmProvider + Send + Sync + 'static>(
    State(state): State<Arc<AppState<P>>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;

    let run_id = Id::from_string(&id);
    state
        .store
        .read_state(&run_id)
        .map_err(|e| err(StatusCode::NOT_FOUND, format!("run not found: {e}")))?;

    let start_index = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .map(|v| v + 1)
        .unwrap_or(0);

    let store = Arc::clone(&state.store);
    let poll_interval = state.sse_poll_interval;

    let stream = stream::unfold((store, run_id, start_index), move |(store, run_id, index)| async move {
        loop {
            let events = match store.read_events_after(&run_id, index) {
                Ok(events) => events,
                Err(_) => return None,
            };
            if !events.is_empty() {
                let next_index = index + events.len();
                let sse_events: Vec<_> = events
                    .into_iter()
                    .enumerate()
                    .map(|(offset, line)| SseEvent::default().id((index + offset).to_string()).data(line))
                    .map(Ok)
                    .collect();
                return Some((sse_events, (store, run_id, next_index)));
            }

            let terminal = store.read_state(&run_id).map(|s| s.is_terminal()).unwrap_or(true);
            if terminal {
                return None;
            }
            tokio::time::sleep(poll_interval).await;
        }
    })
    .flat_map(stream::iter);

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

fn create_router<P: LlmProvider + Send + Sync + 'static>(state: Arc<AppState<P>>) -> Router {
    Router::new()
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/events", get(stream_events))
        .route("/runs/{id}/iterations", get(list_iterations))
        .route("/health", get(health_check))
        .with_state(state)
}

/// Bind and serve the control-plane HTTP API until the process stops.
pub async fn serve<P: LlmProvider + Send + Sync + 'static>(
    store: Arc<RunStore>,
    scheduler: Arc<Scheduler<P>>,
    config: &Config,
) -> eyre::Result<()> {
    let state = Arc::new(AppState {
        store,
        scheduler,
        auth_token: config.auth_token.clone(),
        sse_poll_interval: Duration::from_millis(config.sse_poll_interval_ms),
    });

    let router = create_router(state);
    info!(bind_addr = %config.bind_addr, "HTTP server listening");
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_loop::{AgentLoop, LoopConfig};
    use crate::planner::LlmResponse;
    use crate::sandbox::SandboxConfig;
    use async_trait::async_trait;
    use loop_core::error::PlannerError;
    use loop_core::TokenUsage;
    use tempfile::tempdir;
    use tower::ServiceExt;

    struct NeverDoneProvider;

    #[async_trait]
    impl LlmProvider for NeverDoneProvider {
        async fn complete(&self, _system: &str, _user: &str) -> std::result::Result<LlmResponse, PlannerError> {
            Ok(LlmResponse {
                text: r#"{"done": false, "actions": []}"#.to_string(),
                token_usage: TokenUsage::default(),
            })
        }
    }

    fn test_app(store: Arc<RunStore>) -> Router {
        let workspace = std::env::temp_dir();
        let sandbox_config = SandboxConfig {
            workspace,
            safe_commands: vec![],
            exec_timeout_sec: 5,
            exec_runtime: loop_core::ExecRuntime::Host,
            exec_container_lifecycle: loop_core::ContainerLifecycle::PerAction,
            exec_container_image: "n/a".to_string(),
            exec_container_network: "none".to_string(),
            exec_container_cpus: 1.0,
            exec_container_memory: "512m".to_string(),
            exec_container_pids_limit: 64,
            exec_container_env_vars: vec![],
            max_action_output_chars: 4000,
            web_fetch_tls_verify: true,
            run_id: Id::from_string("http-test"),
        };
        let loop_config = LoopConfig {
            max_iters: 3,
            run_max_wall_time_sec: 60,
            no_progress_repeat_threshold: 2,
            max_previous_output_chars: 4000,
            planner_retry_max_attempts: 1,
        };
        let agent_loop = Arc::new(AgentLoop::new(Arc::clone(&store), sandbox_config, NeverDoneProvider, loop_config));
        let scheduler = Arc::new(Scheduler::new(agent_loop, 2, None));
        let state = Arc::new(AppState {
            store,
            scheduler,
            auth_token: Some("secret".to_string()),
            sse_poll_interval: Duration::from_millis(50),
        });
        create_router(state)
    }

    #[tokio::test]
    async fn health_check_requires_no_auth() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RunStore::new(dir.path()).unwrap());
        let app = test_app(store);

        let response = app
            .oneshot(axum::http::Request::builder().uri("/health").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn list_runs_rejects_missing_auth_token() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RunStore::new(dir.path()).unwrap());
        let app = test_app(store);

        let response = app
            .oneshot(axum::http::Request::builder().uri("/runs").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn get_run_returns_404_for_unknown_id() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RunStore::new(dir.path()).unwrap());
        let app = test_app(store);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/runs/does-not-exist")
                    .header(header::AUTHORIZATION, "Bearer secret")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde_json::{json, Value};
use taskstream_core::{Credentials, TransportFrame};
use taskstream_observability::{emit_event, ObservabilityEvent, ProcessKind};
use taskstream_orchestrator::{EngineError, RecoveryOutcome, WorkflowInput};
use taskstream_wire::{
    Envelope, ErrorEnvelope, LatestSnapshotResponse, RecoveryQuery, StartWorkflowRequest,
    StartWorkflowResponse, StreamQuery, TriggerRecoveryRequest, TriggerRecoveryResponse,
    UpdatesSinceResponse, WorkflowStatusResponse,
};
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tracing::Level;
use uuid::Uuid;

use crate::AppState;

struct ApiError {
    status: StatusCode,
    body: ErrorEnvelope,
}

impl ApiError {
    fn not_found(task_id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: ErrorEnvelope {
                success: false,
                error: "Workflow not found".to_string(),
                task_id: Some(task_id.to_string()),
                details: None,
            },
        }
    }

    fn engine(context: &str, err: EngineError) -> Self {
        let status = match err {
            EngineError::AlreadyStarted(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(error = %err, "{context}");
        Self {
            status,
            body: ErrorEnvelope {
                success: false,
                error: context.to_string(),
                task_id: None,
                details: Some(err.to_string()),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/stream", get(stream))
        .route("/broadcast", post(broadcast))
        .route("/workflow", post(start_workflow))
        .route("/workflow/{task_id}", get(workflow_status))
        .route(
            "/recovery/{task_id}",
            get(recovery_updates).post(trigger_recovery),
        )
        .route("/recovery/{task_id}/latest", get(recovery_latest))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_listener(listener, state, async {
        if tokio::signal::ctrl_c().await.is_err() {
            futures::future::pending::<()>().await;
        }
    })
    .await
}

pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let teardown = state.clone();
    let app = app_router(state);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    teardown.shutdown().await;
    result?;
    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "connections": state.hub.connection_count(),
        "build": env!("CARGO_PKG_VERSION"),
    }))
}

fn sse_stream(
    state: &AppState,
    connection_id: &str,
) -> impl Stream<Item = Result<Event, Infallible>> {
    state
        .transport
        .open(connection_id)
        .map(|frame| match frame {
            TransportFrame::Event(payload) => Ok(Event::default().data(payload)),
            TransportFrame::Heartbeat => Ok(Event::default().comment("keep-alive")),
        })
}

async fn stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let connection_id = query
        .connection_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    Sse::new(sse_stream(&state, &connection_id))
}

async fn broadcast(State(state): State<AppState>, Json(envelope): Json<Envelope>) -> Json<Value> {
    let report = state.hub.broadcast(&envelope);
    Json(json!({
        "success": true,
        "delivered": report.delivered,
    }))
}

async fn start_workflow(
    State(state): State<AppState>,
    Json(request): Json<StartWorkflowRequest>,
) -> ApiResult<StartWorkflowResponse> {
    let task_id = request.task.id.clone();
    let input = WorkflowInput {
        task: request.task,
        credentials: Credentials::new(request.token),
        session_id: request.session_id,
        prompt: request.prompt,
    };
    let started = state
        .tasks
        .start_task(input)
        .await
        .map_err(|err| ApiError::engine("Failed to start task workflow", err))?;
    emit_event(
        Level::INFO,
        ProcessKind::Server,
        ObservabilityEvent {
            event: "http.workflow.start",
            component: "http",
            task_id: Some(&task_id),
            workflow_id: Some(&started.workflow_id),
            status: Some(started.message()),
            ..Default::default()
        },
    );
    Ok(Json(StartWorkflowResponse {
        message: started.message().to_string(),
        workflow_id: started.workflow_id,
    }))
}

async fn workflow_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<WorkflowStatusResponse> {
    state
        .tasks
        .status(&task_id)
        .await
        .map(Json)
        .map_err(|err| ApiError::engine("Failed to read workflow status", err))
}

async fn recovery_updates(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<RecoveryQuery>,
) -> ApiResult<UpdatesSinceResponse> {
    let outcome = state
        .recovery
        .updates_since(
            &task_id,
            query.since_sequence.unwrap_or(0),
            query.since_timestamp.unwrap_or(0),
        )
        .await
        .map_err(|err| ApiError::engine("Failed to get updates", err))?;
    let RecoveryOutcome::Found(since) = outcome else {
        return Err(ApiError::not_found(&task_id));
    };
    Ok(Json(UpdatesSinceResponse {
        success: true,
        task_id,
        workflow_status: since.workflow_status,
        total_updates: since.total_updates,
        last_sequence: since.last_sequence,
        current_status: since.current_status,
        updates: since.updates,
        message: since.message,
    }))
}

async fn trigger_recovery(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(request): Json<TriggerRecoveryRequest>,
) -> ApiResult<TriggerRecoveryResponse> {
    let outcome = state
        .recovery
        .trigger_recovery(
            &task_id,
            request.connection_id.as_deref(),
            request.last_sequence,
            request.last_timestamp,
        )
        .await
        .map_err(|err| ApiError::engine("Failed to trigger recovery", err))?;
    let RecoveryOutcome::Found(report) = outcome else {
        return Err(ApiError::not_found(&task_id));
    };
    Ok(Json(TriggerRecoveryResponse {
        success: true,
        task_id,
        recovered_updates: report.recovered_updates,
        message: format!("Recovered {} updates", report.recovered_updates),
    }))
}

async fn recovery_latest(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<LatestSnapshotResponse> {
    let outcome = state
        .recovery
        .latest(&task_id)
        .await
        .map_err(|err| ApiError::engine("Failed to get latest state", err))?;
    let RecoveryOutcome::Found(latest) = outcome else {
        return Err(ApiError::not_found(&task_id));
    };
    Ok(Json(LatestSnapshotResponse {
        success: true,
        task_id,
        workflow_status: latest.workflow_status,
        current_status: latest.current_status,
        total_updates: latest.total_updates,
        last_sequence: latest.last_sequence,
        start_time: latest.start_time,
        completed_at: latest.completed_at,
        all_updates: latest.all_updates,
        message: latest.message,
    }))
}

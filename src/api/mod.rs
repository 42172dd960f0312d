//! Control plane: authenticated HTTP endpoints plus the `/ws` streaming
//! socket that carries every published update as a JSON text frame.

use crate::{
    agent::SessionActivity,
    auth::{auth_middleware, create_auth_state},
    bus::UpdateBus,
    config::{ApiConfig, Config},
    orchestrator::Orchestrator,
    queue::QueueStatus,
    ConductorError, Result,
};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    http::StatusCode,
    middleware,
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

const SERVICE_NAME: &str = "conductor-core";

const ROUTE_HEALTH: &str = "/health";
const ROUTE_INSTRUCTION: &str = "/instruction";
const ROUTE_APPROVAL_RESPONSE: &str = "/approval-response";
const ROUTE_INPUT_RESPONSE: &str = "/input-response";
const ROUTE_CANCEL_TASK: &str = "/cancel-task";
const ROUTE_CANCEL: &str = "/cancel";
const ROUTE_RESET: &str = "/reset";
const ROUTE_STATUS: &str = "/status";
const ROUTE_WS: &str = "/ws";

const REASON_BLOCKED: &str = "blocked_operation";
const REASON_QUEUE_FULL: &str = "queue_full";
const REASON_USER_QUOTA: &str = "user_quota_exceeded";

#[derive(Clone)]
pub struct ApiServer {
    config: ApiConfig,
    orchestrator: Arc<Orchestrator>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionRequest {
    pub user_id: String,
    pub message_id: String,
    pub instruction: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum InstructionResponse {
    #[serde(rename_all = "camelCase")]
    Accepted {
        status: &'static str,
        task_id: String,
        repo_key: String,
        queue_position: usize,
        total_queued: usize,
        active_repos: usize,
        timestamp: String,
    },
    #[serde(rename_all = "camelCase")]
    Rejected {
        status: &'static str,
        reason: &'static str,
        message: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponseRequest {
    pub approval_id: String,
    pub approved: bool,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputResponseRequest {
    pub input_id: String,
    pub user_id: String,
    pub response: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTaskRequest {
    pub task_id: String,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAgentStatus {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    pub repo: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub sub_agents: Vec<SubAgentStatus>,
    pub parallel_queue: QueueStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl From<SessionActivity> for SubAgentStatus {
    fn from(activity: SessionActivity) -> Self {
        Self {
            id: format!("{}:{}", activity.agent_kind.as_str(), activity.repo_key),
            task: activity.current_task_title,
            repo: activity.repo_key,
            status: if activity.is_processing {
                "processing".to_string()
            } else {
                "idle".to_string()
            },
            started_at: activity.started_at.map(|t| t.to_rfc3339()),
            last_update: activity.last_update.map(|t| t.to_rfc3339()),
        }
    }
}

impl ApiServer {
    pub fn new(config: Config, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            config: config.api,
            orchestrator,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();

        let listener =
            tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port))
                .await
                .map_err(|e| ConductorError::Internal(e.into()))?;

        info!(
            "Control plane listening on {}:{}",
            self.config.host, self.config.port
        );

        axum::serve(listener, app)
            .await
            .map_err(|e| ConductorError::Internal(e.into()))?;

        Ok(())
    }

    /// Middleware order: auth → trace → CORS → routes. `/health` and CORS
    /// preflight bypass auth inside the middleware itself.
    pub fn build_router(&self) -> Router {
        let auth_state = create_auth_state(self.config.secret.clone());

        let cors_layer = CorsLayer::new()
            .allow_origin(
                self.config
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::header::AUTHORIZATION,
            ]);

        Router::new()
            .route(ROUTE_HEALTH, get(health_check))
            .route(ROUTE_INSTRUCTION, post(post_instruction))
            .route(ROUTE_APPROVAL_RESPONSE, post(post_approval_response))
            .route(ROUTE_INPUT_RESPONSE, post(post_input_response))
            .route(ROUTE_CANCEL_TASK, post(post_cancel_task))
            .route(ROUTE_CANCEL, post(post_cancel_all))
            .route(ROUTE_RESET, post(post_reset))
            .route(ROUTE_STATUS, get(get_status))
            .route(ROUTE_WS, get(ws_upgrade))
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn_with_state(auth_state, auth_middleware))
                    .layer(TraceLayer::new_for_http())
                    .layer(cors_layer),
            )
            .with_state(self.clone())
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Instruction intake. Policy rejections (blocked operation, queue bounds)
/// are well-formed `rejected` bodies, not HTTP errors; only malformed
/// input and internal faults use error status codes.
async fn post_instruction(
    State(server): State<ApiServer>,
    Json(request): Json<InstructionRequest>,
) -> std::result::Result<Json<InstructionResponse>, (StatusCode, Json<ErrorResponse>)> {
    let outcome = server
        .orchestrator
        .submit_instruction(&request.user_id, &request.message_id, &request.instruction)
        .await;

    match outcome {
        Ok(outcome) => Ok(Json(InstructionResponse::Accepted {
            status: "accepted",
            task_id: outcome.task.id,
            repo_key: outcome.task.repo_key,
            queue_position: outcome.task.position,
            total_queued: outcome.total_queued,
            active_repos: outcome.active_repos,
            timestamp: chrono::Utc::now().to_rfc3339(),
        })),
        Err(ConductorError::BlockedOperation { reason }) => {
            Ok(Json(InstructionResponse::Rejected {
                status: "rejected",
                reason: REASON_BLOCKED,
                message: reason,
            }))
        }
        Err(ConductorError::QueueFull) => Ok(Json(InstructionResponse::Rejected {
            status: "rejected",
            reason: REASON_QUEUE_FULL,
            message: "The task queue is full; try again shortly".to_string(),
        })),
        Err(ConductorError::UserQuotaExceeded { .. }) => {
            Ok(Json(InstructionResponse::Rejected {
                status: "rejected",
                reason: REASON_USER_QUOTA,
                message: "You already have the maximum number of queued tasks".to_string(),
            }))
        }
        Err(ConductorError::Validation(message)) => {
            Err((StatusCode::BAD_REQUEST, Json(ErrorResponse { error: message })))
        }
        Err(e) => {
            warn!("Instruction intake failed: {e}");
            Err(internal_error())
        }
    }
}

async fn post_approval_response(
    State(server): State<ApiServer>,
    Json(request): Json<ApprovalResponseRequest>,
) -> std::result::Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let handled = server
        .orchestrator
        .handle_approval_response(&request.approval_id, request.approved, &request.user_id)
        .await;

    if handled {
        Ok(Json(serde_json::json!({ "status": "processed" })))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Unknown approval id: {}", request.approval_id),
            }),
        ))
    }
}

async fn post_input_response(
    State(server): State<ApiServer>,
    Json(request): Json<InputResponseRequest>,
) -> std::result::Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    match server
        .orchestrator
        .handle_input_response(&request.input_id, &request.user_id, &request.response)
        .await
    {
        Ok(()) => Ok(Json(serde_json::json!({ "status": "accepted" }))),
        Err(ConductorError::NotFound(message)) => {
            Err((StatusCode::NOT_FOUND, Json(ErrorResponse { error: message })))
        }
        Err(e) => {
            warn!("Input response delivery failed: {e}");
            Err(internal_error())
        }
    }
}

async fn post_cancel_task(
    State(server): State<ApiServer>,
    Json(request): Json<CancelTaskRequest>,
) -> std::result::Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    match server
        .orchestrator
        .cancel_task(&request.task_id, &request.user_id)
        .await
    {
        Ok(outcome) => Ok(Json(serde_json::json!({
            "status": "cancelled",
            "repoKey": outcome.repo_key,
        }))),
        Err(ConductorError::NotFound(message)) => {
            Err((StatusCode::NOT_FOUND, Json(ErrorResponse { error: message })))
        }
        Err(e) => {
            warn!("Task cancellation failed: {e}");
            Err(internal_error())
        }
    }
}

async fn post_cancel_all(
    State(server): State<ApiServer>,
    Json(request): Json<UserRequest>,
) -> Json<serde_json::Value> {
    let summary = server.orchestrator.cancel_all(&request.user_id).await;
    let total = summary.cancelled_running + summary.cancelled_queued;

    Json(serde_json::json!({
        "cancelledTasks": total,
        "cancelledRunning": summary.cancelled_running,
        "cancelledQueued": summary.cancelled_queued,
        "cancelledSubAgents": summary.cancelled_sub_agents,
        "processingRepos": summary.processing_repos,
        "message": format!("Cancelled {total} task(s)"),
    }))
}

async fn post_reset(
    State(server): State<ApiServer>,
    Json(request): Json<UserRequest>,
) -> Json<serde_json::Value> {
    server.orchestrator.reset_user(&request.user_id).await;
    Json(serde_json::json!({
        "status": "reset",
        "userId": request.user_id,
    }))
}

async fn get_status(State(server): State<ApiServer>) -> Json<StatusResponse> {
    let sub_agents = server
        .orchestrator
        .session_activity()
        .await
        .into_iter()
        .map(SubAgentStatus::from)
        .collect();
    let parallel_queue = server.orchestrator.queue_status().await;

    Json(StatusResponse {
        sub_agents,
        parallel_queue,
    })
}

/// Streaming socket. Auth already happened in the middleware on the
/// handshake request; from here every published update is forwarded as
/// one JSON text frame.
async fn ws_upgrade(State(server): State<ApiServer>, ws: WebSocketUpgrade) -> Response {
    let bus = server.orchestrator.bus().clone();
    ws.on_upgrade(move |socket| stream_updates(socket, bus))
}

async fn stream_updates(mut socket: WebSocket, bus: UpdateBus) {
    let mut updates = bus.subscribe();
    debug!("Streaming subscriber connected");

    loop {
        match updates.recv().await {
            Ok(update) => {
                let frame = match serde_json::to_string(&update) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Failed to serialize update: {e}");
                        continue;
                    }
                };
                // A failed send means the client went away; dropping the
                // receiver is the bus-side cleanup for this subscriber.
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                // Per-subscriber drop: this client skips what it missed,
                // everyone else is unaffected.
                warn!(missed, "Streaming subscriber lagged; dropping updates");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    debug!("Streaming subscriber disconnected");
}

fn internal_error() -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "Internal server error".to_string(),
        }),
    )
}

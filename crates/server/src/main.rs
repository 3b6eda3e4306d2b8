use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, patch, post},
    Json, Router,
};
use futures::{future, Stream, StreamExt};
use gateway::{CommandError, CommandReceipt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shared::{
    domain::{
        is_command_value, is_control_target, DeviceId, HistoryEntry, SubscriberId, SYSTEM_TARGET,
    },
    error::{ApiError, ErrorCode},
};
use storage::{Storage, HISTORY_PAGE_SIZE};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod device_socket;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

const MAX_BODY_BYTES: usize = 16 * 1024;
const MAX_DEVICE_ID_BYTES: usize = 64;

type ApiFailure = (StatusCode, Json<ApiError>);

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct RegisterDeviceRequest {
    device_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegisteredDevice {
    device_id: String,
}

#[derive(Debug, Deserialize)]
struct ServiceControlRequest {
    service_type: String,
    value: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CommandAccepted {
    message: String,
    command_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_message: Option<String>,
}

impl CommandAccepted {
    fn new(message: &str, receipt: CommandReceipt) -> Self {
        Self {
            message: message.to_string(),
            command_id: receipt.command_id.to_string(),
            device_message: receipt.message,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ConnectionStatus {
    device_id: String,
    connected: bool,
    state: Option<String>,
    pending_commands: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = Arc::new(AppState::new(storage, settings.command_timeout()));
    let command_timeout = state.gateway.correlator().timeout();
    let app = build_router(state);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, ?command_timeout, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/devices", post(register_device))
        .route("/devices/:device_id/connection", get(device_connection_status))
        .route("/system/on", post(system_on))
        .route("/system/off", post(system_off))
        .route("/service", patch(control_service))
        .route("/services/status", get(services_status))
        .route("/history", get(action_history))
        .route("/events", get(notification_events))
        .route("/ws/:device_id", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

fn failure(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> ApiFailure {
    (status, Json(ApiError::new(code, message)))
}

fn internal(err: anyhow::Error) -> ApiFailure {
    error!(error = %err, "storage operation failed");
    failure(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::Internal,
        err.to_string(),
    )
}

fn command_failure(err: &CommandError) -> ApiFailure {
    let (status, code) = match err {
        CommandError::NotConnected => (StatusCode::SERVICE_UNAVAILABLE, ErrorCode::DeviceUnavailable),
        CommandError::CommandTimeout => (StatusCode::GATEWAY_TIMEOUT, ErrorCode::Timeout),
        CommandError::ConnectionLost => (StatusCode::BAD_GATEWAY, ErrorCode::DeviceUnavailable),
        CommandError::DeviceRejected(_) => (StatusCode::BAD_GATEWAY, ErrorCode::DeviceRejected),
    };
    failure(status, code, err.to_string())
}

async fn ensure_registered(state: &AppState, device_id: &DeviceId) -> Result<(), ApiFailure> {
    if state.storage.device_exists(device_id).await.map_err(internal)? {
        Ok(())
    } else {
        Err(failure(
            StatusCode::NOT_FOUND,
            ErrorCode::NotFound,
            format!("device '{device_id}' is not registered"),
        ))
    }
}

async fn issue_command(
    state: &AppState,
    device_id: &DeviceId,
    target: &str,
    value: &str,
) -> Result<CommandReceipt, ApiFailure> {
    ensure_registered(state, device_id).await?;
    state
        .gateway
        .issue(device_id, target, value)
        .await
        .map_err(|err| {
            warn!(%device_id, capability = target, value, error = %err, "command failed");
            command_failure(&err)
        })
}

fn validate_device_id(raw: &str) -> Result<DeviceId, ApiFailure> {
    let device_id = raw.trim();
    if device_id.is_empty() {
        return Err(failure(
            StatusCode::BAD_REQUEST,
            ErrorCode::Validation,
            "device_id cannot be empty",
        ));
    }
    if device_id.len() > MAX_DEVICE_ID_BYTES {
        return Err(failure(
            StatusCode::BAD_REQUEST,
            ErrorCode::Validation,
            "device_id is too long",
        ));
    }
    if !device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(failure(
            StatusCode::BAD_REQUEST,
            ErrorCode::Validation,
            "device_id may only contain letters, digits, '-' and '_'",
        ));
    }
    Ok(DeviceId::new(device_id))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, ApiFailure> {
    state.storage.health_check().await.map_err(internal)?;
    Ok("ok")
}

async fn register_device(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterDeviceRequest>,
) -> Result<(StatusCode, Json<RegisteredDevice>), ApiFailure> {
    let device_id = validate_device_id(&req.device_id)?;
    let created = state
        .storage
        .register_device(&device_id)
        .await
        .map_err(internal)?;
    if !created {
        return Err(failure(
            StatusCode::CONFLICT,
            ErrorCode::Conflict,
            format!("device '{device_id}' is already registered"),
        ));
    }
    info!(%device_id, "device registered");
    Ok((
        StatusCode::CREATED,
        Json(RegisteredDevice {
            device_id: device_id.to_string(),
        }),
    ))
}

async fn device_connection_status(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Json<ConnectionStatus> {
    let device_id = DeviceId::new(device_id);
    let device_state = state.gateway.device_state(&device_id);
    Json(ConnectionStatus {
        connected: device_state.is_some(),
        state: device_state,
        pending_commands: state.gateway.registry().pending_commands(&device_id),
        device_id: device_id.to_string(),
    })
}

async fn system_on(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<CommandAccepted>, ApiFailure> {
    let device_id = DeviceId::new(q.user_id);
    let receipt = issue_command(&state, &device_id, SYSTEM_TARGET, "on").await?;
    info!(%device_id, "system started");
    Ok(Json(CommandAccepted::new("System started successfully", receipt)))
}

async fn system_off(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<CommandAccepted>, ApiFailure> {
    let device_id = DeviceId::new(q.user_id);
    let receipt = issue_command(&state, &device_id, SYSTEM_TARGET, "off").await?;
    info!(%device_id, "system stopped");
    Ok(Json(CommandAccepted::new("System stopped successfully", receipt)))
}

async fn control_service(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
    Json(req): Json<ServiceControlRequest>,
) -> Result<Json<CommandAccepted>, ApiFailure> {
    if !is_control_target(&req.service_type) {
        return Err(failure(
            StatusCode::BAD_REQUEST,
            ErrorCode::Validation,
            format!("unknown service_type '{}'", req.service_type),
        ));
    }
    if !is_command_value(&req.value) {
        return Err(failure(
            StatusCode::BAD_REQUEST,
            ErrorCode::Validation,
            "value must be 'on', 'off' or a non-negative number",
        ));
    }

    let device_id = DeviceId::new(q.user_id);
    let receipt = issue_command(&state, &device_id, &req.service_type, &req.value).await?;
    info!(%device_id, service_type = %req.service_type, value = %req.value, "service updated");
    Ok(Json(CommandAccepted::new(
        "Service control request processed successfully",
        receipt,
    )))
}

async fn services_status(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Map<String, Value>>, ApiFailure> {
    let device_id = DeviceId::new(q.user_id);
    state
        .storage
        .services_status(&device_id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| {
            failure(
                StatusCode::NOT_FOUND,
                ErrorCode::NotFound,
                format!("no service status for device '{device_id}'"),
            )
        })
}

async fn action_history(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<HistoryEntry>>, ApiFailure> {
    let device_id = DeviceId::new(q.user_id);
    ensure_registered(&state, &device_id).await?;
    let history = state
        .storage
        .list_action_history(&device_id, HISTORY_PAGE_SIZE)
        .await
        .map_err(internal)?;
    Ok(Json(history))
}

async fn notification_events(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiFailure> {
    let device_id = DeviceId::new(q.user_id);
    ensure_registered(&state, &device_id).await?;
    let events = state
        .gateway
        .stream(&SubscriberId::from(&device_id))
        .filter_map(|payload| {
            future::ready(match Event::default().json_data(&payload) {
                Ok(event) => Some(Ok(event)),
                Err(err) => {
                    error!(error = %err, "failed to encode notification event");
                    None
                }
            })
        });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> impl IntoResponse {
    let device_id = DeviceId::new(device_id);
    ws.on_upgrade(move |socket| device_socket::device_connection(state, socket, device_id))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

//! UI server
//!
//! Control-plane endpoint for operators. Two transports behind one listener,
//! selected by configuration: a WebSocket speaking the `ui0.0.1`
//! sub-protocol with `[uuid, procedure, payload]` frames, and plain HTTP
//! POST `/ui/{version}/{procedure}`. Optional HTTP Basic authentication and
//! a static-asset fallback for the web front-end round it out.

use crate::bus::ControlBus;
use crate::error::{ControlError, ControlResult};
use crate::procedures::{ProcedureName, RequestPayload, ResponseStatus};
use crate::UI_SUB_PROTOCOL;
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Transport the UI server speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationProtocol {
    Ws,
    Http,
}

impl Default for ApplicationProtocol {
    fn default() -> Self {
        ApplicationProtocol::Ws
    }
}

/// HTTP Basic authentication settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthenticationConfig {
    pub enabled: bool,
    pub username: String,
    pub password: String,
}

/// UI server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UiServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub protocol: ApplicationProtocol,
    pub authentication: AuthenticationConfig,
}

impl Default for UiServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 8080,
            protocol: ApplicationProtocol::Ws,
            authentication: AuthenticationConfig::default(),
        }
    }
}

/// Simulator-wide operations the UI server delegates upward
#[async_trait]
pub trait SimulatorControl: Send + Sync {
    async fn start_simulator(&self) -> anyhow::Result<()>;
    async fn stop_simulator(&self) -> anyhow::Result<()>;
}

#[derive(Clone)]
struct AppState {
    config: UiServerConfig,
    bus: Arc<ControlBus>,
    control: Arc<dyn SimulatorControl>,
}

/// The control-plane endpoint
pub struct UiServer {
    state: AppState,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl UiServer {
    pub fn new(
        config: UiServerConfig,
        bus: Arc<ControlBus>,
        control: Arc<dyn SimulatorControl>,
    ) -> Self {
        Self {
            state: AppState {
                config,
                bus,
                control,
            },
            handle: Mutex::new(None),
        }
    }

    /// Bind and serve; returns the bound address
    pub async fn start(&self) -> ControlResult<SocketAddr> {
        let state = self.state.clone();
        let router = build_router(state.clone());
        let address = format!("{}:{}", state.config.host, state.config.port);
        let listener = tokio::net::TcpListener::bind(&address)
            .await
            .map_err(|e| ControlError::server(format!("Bind {} failed: {}", address, e)))?;
        let bound = listener
            .local_addr()
            .map_err(|e| ControlError::server(e.to_string()))?;
        info!(%bound, protocol = ?state.config.protocol, "UI server listening");

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!(error = %e, "UI server terminated");
            }
        });
        *self.handle.lock().await = Some(handle);
        Ok(bound)
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
            info!("UI server stopped");
        }
    }
}

fn build_router(state: AppState) -> Router {
    let static_assets = ServeDir::new("./dist").fallback(ServeDir::new("./dist/dist"));
    Router::new()
        .route("/", get(root_handler))
        .route("/ui/:version/:procedure", post(http_handler))
        .fallback_service(static_assets)
        .layer(middleware::from_fn_with_state(state.clone(), basic_auth))
        .with_state(state)
}

/// Render a control-plane error as its HTTP response
fn error_response(error: &ControlError) -> Response {
    let status = StatusCode::from(error);
    let mut response = (
        status,
        Json(json!({"status": "failure", "errorMessage": error.to_string()})),
    )
        .into_response();
    if matches!(error, ControlError::Unauthorized) {
        response.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"fleet-simulator\""),
        );
    }
    response
}

async fn basic_auth(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let auth = &state.config.authentication;
    if !auth.enabled {
        return next.run(request).await;
    }
    let expected = base64::engine::general_purpose::STANDARD
        .encode(format!("{}:{}", auth.username, auth.password));
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .map(|credentials| credentials == expected)
        .unwrap_or(false);
    if !authorized {
        return error_response(&ControlError::Unauthorized);
    }
    next.run(request).await
}

async fn root_handler(
    State(state): State<AppState>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    match ws {
        Some(upgrade) if state.config.protocol == ApplicationProtocol::Ws => upgrade
            .protocols([UI_SUB_PROTOCOL])
            .on_upgrade(move |socket| handle_socket(socket, state)),
        _ => Redirect::to("/index.html").into_response(),
    }
}

/// Close the socket with the code and description the error maps to
async fn close_with_error(socket: &mut WebSocket, error: ControlError) {
    warn!(error = %error, "Closing UI socket");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: error.ws_close_code(),
            reason: error.to_string().into(),
        })))
        .await;
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    if socket.protocol().is_none() {
        close_with_error(
            &mut socket,
            ControlError::protocol("unsupported sub-protocol"),
        )
        .await;
        return;
    }
    while let Some(message) = socket.recv().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => return,
            Ok(_) => continue,
        };
        let (uuid, procedure, payload) = match parse_ui_frame(&text) {
            Ok(frame) => frame,
            Err(error) => {
                close_with_error(&mut socket, error).await;
                return;
            }
        };
        debug!(%uuid, %procedure, "UI request");
        let response = dispatch(&state, procedure, payload).await;
        let frame = json!([uuid, response]);
        if socket
            .send(Message::Text(frame.to_string()))
            .await
            .is_err()
        {
            return;
        }
    }
}

/// Parse a `[uuid, procedure, payload]` frame
fn parse_ui_frame(text: &str) -> ControlResult<(Uuid, ProcedureName, Value)> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ControlError::protocol(format!("Malformed request frame: {}", e)))?;
    let Some(parts) = value.as_array().filter(|parts| parts.len() == 3) else {
        return Err(ControlError::protocol(
            "request is not a [uuid, procedure, payload] array",
        ));
    };
    let uuid = parts[0]
        .as_str()
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .ok_or_else(|| ControlError::protocol("request uuid is not a valid UUID"))?;
    let procedure: ProcedureName = serde_json::from_value(parts[1].clone()).map_err(|_| {
        ControlError::UnknownProcedure(
            parts[1].as_str().unwrap_or_default().to_string(),
        )
    })?;
    if !parts[2].is_object() {
        return Err(ControlError::invalid_payload("payload must be an object"));
    }
    Ok((uuid, procedure, parts[2].clone()))
}

async fn http_handler(
    State(state): State<AppState>,
    Path((version, procedure)): Path<(String, String)>,
    Json(payload): Json<Value>,
) -> Response {
    if state.config.protocol != ApplicationProtocol::Http {
        return StatusCode::NOT_FOUND.into_response();
    }
    let uuid = Uuid::new_v4();
    debug!(%uuid, %version, %procedure, "UI HTTP request");
    let Ok(procedure) = serde_json::from_value::<ProcedureName>(Value::String(procedure.clone()))
    else {
        return error_response(&ControlError::UnknownProcedure(procedure));
    };
    let response = dispatch(&state, procedure, payload).await;
    let status = match response.get("status").and_then(|status| status.as_str()) {
        Some("success") => StatusCode::OK,
        Some("failure") => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(response)).into_response()
}

/// Run one procedure: simulator-wide ones locally, everything else fanned
/// out over the bus
async fn dispatch(state: &AppState, procedure: ProcedureName, payload: Value) -> Value {
    match procedure {
        ProcedureName::ListChargingStations => json!({
            "status": "success",
            "chargingStations": state.bus.stations(),
        }),
        ProcedureName::StartSimulator => simulator_result(
            state.control.start_simulator().await,
            ProcedureName::StartSimulator,
        ),
        ProcedureName::StopSimulator => simulator_result(
            state.control.stop_simulator().await,
            ProcedureName::StopSimulator,
        ),
        _ => {
            let request: RequestPayload =
                serde_json::from_value(payload.clone()).unwrap_or_default();
            let aggregated = state.bus.request(procedure, payload, request.targets()).await;
            serde_json::to_value(aggregated).unwrap_or_else(|e| {
                json!({"status": "failure", "errorMessage": e.to_string()})
            })
        }
    }
}

fn simulator_result(result: anyhow::Result<()>, procedure: ProcedureName) -> Value {
    match result {
        Ok(()) => json!({"status": "success"}),
        Err(e) => json!({
            "status": "failure",
            "command": procedure.to_string(),
            "errorMessage": e.to_string(),
        }),
    }
}

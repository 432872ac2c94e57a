//! HTTP handlers

use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::gateway::config::GatewayConfig;
use crate::gateway::page;
use crate::protocol::{Command, BOUNDARY_NAME};
use crate::relay::{RelayForwarder, RelayPhase, Subscription};
use crate::stats::RelayStatsSnapshot;
use crate::supervisor::{StartOutcome, WorkerSupervisor};
use crate::worker::send_command;

/// State shared by every handler
#[derive(Clone)]
pub struct GatewayState {
    inner: Arc<Shared>,
}

struct Shared {
    config: GatewayConfig,
    worker_host: IpAddr,
    relays: Vec<Arc<RelayForwarder>>,
    supervisor: Arc<WorkerSupervisor>,
}

impl GatewayState {
    pub fn new(
        config: GatewayConfig,
        worker_host: IpAddr,
        relays: Vec<Arc<RelayForwarder>>,
        supervisor: Arc<WorkerSupervisor>,
    ) -> Self {
        Self {
            inner: Arc::new(Shared {
                config,
                worker_host,
                relays,
                supervisor,
            }),
        }
    }

    /// Relays indexed by camera id
    pub fn relays(&self) -> &[Arc<RelayForwarder>] {
        &self.inner.relays
    }

    fn relay(&self, id: &str) -> Option<&Arc<RelayForwarder>> {
        id.parse::<usize>().ok().and_then(|i| self.inner.relays.get(i))
    }
}

/// Build the gateway router
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/camera/:id", get(camera))
        .route("/status", get(status))
        .route("/start_jetson", get(start_workers))
        .route("/set_prompt", get(set_prompt))
        .with_state(state)
}

async fn index(State(state): State<GatewayState>) -> Html<String> {
    Html(page::render(state.inner.worker_host, state.relays()))
}

async fn camera(State(state): State<GatewayState>, Path(id): Path<String>) -> Response {
    let relay = match state.relay(&id) {
        Some(relay) => Arc::clone(relay),
        None => return (StatusCode::NOT_FOUND, format!("Unknown camera {}", id)).into_response(),
    };

    let config = &state.inner.config;
    if !relay.wait_connected(config.camera_wait, config.camera_poll).await {
        tracing::warn!(camera = relay.camera(), "Camera request timed out waiting for upstream");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            format!(
                "Camera {} not connected after {}s",
                relay.camera(),
                config.camera_wait.as_secs_f32()
            ),
        )
            .into_response();
    }

    let subscription = relay.subscribe();
    let body = Body::from_stream(camera_stream(subscription, relay.watch_phase()));

    (
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={}", BOUNDARY_NAME),
            ),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        body,
    )
        .into_response()
}

/// Chunks for one consumer, ending when the upstream stops streaming
///
/// Dropping the stream (client went away) drops the subscription, which
/// removes the consumer from the relay.
fn camera_stream(
    subscription: Subscription,
    phases: watch::Receiver<RelayPhase>,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    stream::unfold((subscription, phases), |(mut subscription, mut phases)| async move {
        let next = tokio::select! {
            chunk = subscription.recv() => chunk,
            _ = phases.wait_for(|phase| *phase != RelayPhase::Streaming) => None,
        };
        next.map(|chunk| (Ok(chunk), (subscription, phases)))
    })
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(rename = "pi_server")]
    hub: &'static str,
    #[serde(rename = "jetson_ip")]
    worker_host: String,
    cameras: Vec<CameraStatus>,
}

#[derive(Debug, Serialize)]
struct CameraStatus {
    id: usize,
    clients: usize,
    connected: bool,
    stats: RelayStatsSnapshot,
}

async fn status(State(state): State<GatewayState>) -> Json<StatusResponse> {
    let cameras = state
        .relays()
        .iter()
        .map(|relay| CameraStatus {
            id: relay.camera(),
            clients: relay.consumer_count(),
            connected: relay.connected(),
            stats: relay.stats(),
        })
        .collect();

    Json(StatusResponse {
        hub: "running",
        worker_host: state.inner.worker_host.to_string(),
        cameras,
    })
}

async fn start_workers(State(state): State<GatewayState>) -> (StatusCode, String) {
    match state.inner.supervisor.start_workers().await {
        StartOutcome::Started => (StatusCode::OK, "Workers started".to_string()),
        StartOutcome::StillUnreachable { port } => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Workers did not come up: port {} unreachable", port),
        ),
        StartOutcome::LaunchFailed(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to start workers: {}", e),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct PromptQuery {
    text: Option<String>,
}

async fn set_prompt(State(state): State<GatewayState>, Query(query): Query<PromptQuery>) -> (StatusCode, String) {
    let text = match query.text {
        Some(text) if !text.trim().is_empty() => text,
        _ => return (StatusCode::BAD_REQUEST, "No prompt provided".to_string()),
    };

    let config = &state.inner.config;
    match send_command(config.command_addr, &Command::set_prompt(text), config.command_timeout).await {
        Ok(reply) if reply.is_ok() => (StatusCode::OK, reply.to_string()),
        Ok(reply) => {
            tracing::warn!(reply = %reply, "Worker rejected prompt");
            (StatusCode::INTERNAL_SERVER_ERROR, reply.to_string())
        }
        Err(e) => {
            tracing::error!(addr = %config.command_addr, error = %e, "Command channel unreachable");
            (StatusCode::BAD_GATEWAY, format!("Command channel unreachable: {}", e))
        }
    }
}

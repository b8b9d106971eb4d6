//! HTTP request handlers.

use super::AppState;
use crate::notify::MeshStatus;
use crate::radio::DeferredMessage;
use crate::scheduler::{mark_push_received, PushEdge};
use crate::status::{LedPattern, LedState};
use crate::store::{Service, ServiceEntry, ServiceInput, ServicePatch, StoreError};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Largest accepted import payload.
pub const MAX_IMPORT_BYTES: usize = 16 * 1024;

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn store_error(e: StoreError) -> Response {
    match e {
        StoreError::NotFound => error(StatusCode::NOT_FOUND, "Service not found"),
        StoreError::Full(_) => error(StatusCode::BAD_REQUEST, "Maximum services reached"),
        StoreError::Invalid(reason) => error(StatusCode::BAD_REQUEST, reason),
        StoreError::Json(_) => error(StatusCode::BAD_REQUEST, "Invalid JSON"),
        StoreError::Io(e) => {
            tracing::error!("Failed to save services: {}", e);
            error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save services")
        }
    }
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|_| error(StatusCode::BAD_REQUEST, "Invalid JSON"))
}

/// Seconds since a monotonic timestamp, or -1 if it never happened.
fn seconds_since(at: Option<u64>, now_ms: u64) -> i64 {
    at.map_or(-1, |t| (now_ms.saturating_sub(t) / 1000) as i64)
}

// ============================================================================
// API: Services
// ============================================================================

/// A service with its runtime state, as listed by the admin API.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceView {
    #[serde(flatten)]
    pub service: Service,
    pub type_name: &'static str,
    pub is_up: bool,
    pub has_been_up: bool,
    pub consecutive_passes: u32,
    pub consecutive_fails: u32,
    pub last_error: String,
    pub seconds_since_last_check: i64,
    pub seconds_since_last_push: i64,
    /// Seconds.
    pub pause_remaining: u64,
}

impl ServiceView {
    pub fn new(entry: ServiceEntry, now_ms: u64) -> Self {
        let rt = entry.runtime;
        Self {
            type_name: entry.service.kind.as_str(),
            pause_remaining: entry.service.pause_remaining_ms(now_ms).div_ceil(1000),
            is_up: rt.is_up,
            has_been_up: rt.has_been_up,
            consecutive_passes: rt.consecutive_passes,
            consecutive_fails: rt.consecutive_fails,
            last_error: rt.last_error,
            seconds_since_last_check: seconds_since(rt.last_check, now_ms),
            seconds_since_last_push: seconds_since(rt.last_push, now_ms),
            service: entry.service,
        }
    }
}

pub async fn handle_list_services(State(state): State<AppState>) -> impl IntoResponse {
    let now = state.clock.now_ms();
    let services: Vec<ServiceView> = state
        .store
        .list()
        .into_iter()
        .map(|entry| ServiceView::new(entry, now))
        .collect();
    Json(json!({ "services": services }))
}

pub async fn handle_create_service(State(state): State<AppState>, body: Bytes) -> Response {
    let input: ServiceInput = match parse_body(&body) {
        Ok(input) => input,
        Err(response) => return response,
    };

    match state.store.add(input) {
        Ok(service) => Json(json!({
            "success": true,
            "id": service.id,
            "pushToken": service.push_token,
        }))
        .into_response(),
        Err(e) => store_error(e),
    }
}

pub async fn handle_update_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let patch: ServicePatch = match parse_body(&body) {
        Ok(patch) => patch,
        Err(response) => return response,
    };

    match state.store.update(&id, &patch, state.clock.now_ms()) {
        Ok(service) => {
            if let Some(seconds) = patch.pause_duration {
                if seconds == 0 {
                    tracing::info!("Resumed '{}'", service.name);
                } else {
                    tracing::info!("Paused '{}' for {}s", service.name, seconds);
                }
            }
            Json(json!({ "success": true })).into_response()
        }
        Err(e) => store_error(e),
    }
}

pub async fn handle_delete_service(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.delete(&id) {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => store_error(e),
    }
}

// ============================================================================
// API: Export / Import
// ============================================================================

pub async fn handle_export(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(
            header::CONTENT_DISPOSITION,
            "attachment; filename=\"monitors-backup.json\"",
        )],
        Json(state.store.export()),
    )
}

#[derive(Debug, Deserialize)]
struct ImportRequest {
    services: Option<Vec<serde_json::Value>>,
}

pub async fn handle_import(State(state): State<AppState>, body: Bytes) -> Response {
    if body.len() > MAX_IMPORT_BYTES {
        return error(StatusCode::BAD_REQUEST, "Payload too large");
    }
    let request: ImportRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let Some(items) = request.services else {
        return error(StatusCode::BAD_REQUEST, "Missing services array");
    };

    match state.store.import(items) {
        Ok(summary) => Json(json!({
            "success": true,
            "imported": summary.imported,
            "skipped": summary.skipped,
        }))
        .into_response(),
        Err(e) => store_error(e),
    }
}

// ============================================================================
// API: Push heartbeat
// ============================================================================

pub async fn handle_push(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    let Some(id) = state.store.find_push_token(&token) else {
        return error(StatusCode::NOT_FOUND, "Unknown push token");
    };

    let now = state.clock.now_ms();
    let outcome = state
        .store
        .update_runtime(&id, |svc, rt| (svc.name.clone(), mark_push_received(rt, now)));
    let Some((name, transition)) = outcome else {
        return error(StatusCode::NOT_FOUND, "Unknown push token");
    };

    tracing::debug!("Push received for '{}'", name);
    if let Some(transition) = transition {
        tracing::info!("Service '{}' is now UP (push received)", name);
        let edge = PushEdge {
            service_id: id,
            transition,
        };
        // The store already says Up, so the edge must not be dropped.
        if state.push_tx.send(edge).await.is_err() {
            tracing::error!("Monitor loop is gone, push edge for '{}' lost", name);
        }
    }

    Json(json!({
        "success": true,
        "service": name,
        "timestamp": chrono::Utc::now().timestamp(),
    }))
    .into_response()
}

// ============================================================================
// API: Mesh
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshStatusResponse {
    #[serde(flatten)]
    pub mesh: MeshStatus,
    pub ble_operation_in_progress: bool,
    pub monitoring_paused: bool,
    pub pending_deferred: bool,
    pub queued_notifications: usize,
}

pub async fn handle_mesh_status(State(state): State<AppState>) -> impl IntoResponse {
    let mesh = match state.fanout.mesh() {
        Some(notifier) => notifier.status(),
        None => MeshStatus {
            configured: false,
            transport: state.config.mesh.transport.as_str().to_string(),
            peer_name: state.config.mesh.ble_peer_name.clone(),
            channel: state.config.mesh.channel.clone(),
            protocol_state: "disconnected".to_string(),
            ..Default::default()
        },
    };

    Json(MeshStatusResponse {
        mesh,
        ble_operation_in_progress: state.arbiter.ble_op_in_progress(),
        monitoring_paused: state.arbiter.monitoring_paused(),
        pending_deferred: state.mailbox.is_pending(),
        queued_notifications: state.fanout.mesh_pending(),
    })
}

#[derive(Debug, Deserialize)]
struct MeshSendRequest {
    title: Option<String>,
    message: Option<String>,
}

pub async fn handle_mesh_send(State(state): State<AppState>, body: Bytes) -> Response {
    let request: MeshSendRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let message = request.message.unwrap_or_default();
    if message.is_empty() {
        return error(StatusCode::BAD_REQUEST, "Missing message");
    }

    if !state.fanout.mesh().is_some_and(|mesh| mesh.is_configured()) {
        return error(StatusCode::SERVICE_UNAVAILABLE, "Mesh sink not configured");
    }
    if state.arbiter.ble_op_in_progress() {
        return error(StatusCode::SERVICE_UNAVAILABLE, "BLE operation already in progress");
    }

    let title = request
        .title
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "Mesh Message".to_string());
    if let Some(replaced) = state.mailbox.post(DeferredMessage { title, message }) {
        tracing::warn!("Replacing unsent mesh message '{}'", replaced.title);
    }

    (
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "status": "queued" })),
    )
        .into_response()
}

// ============================================================================
// API: System status
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub led: LedState,
    pub led_color: &'static str,
    pub led_pattern: LedPattern,
    pub wifi_connected: bool,
    pub radio_mode: &'static str,
    pub services: usize,
    pub services_up: usize,
    pub services_down: usize,
    pub queue_depth: usize,
}

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    let entries = state.store.list();
    let up = entries.iter().filter(|e| e.runtime.is_up).count();
    let down = entries
        .iter()
        .filter(|e| e.runtime.last_check.is_some() && !e.runtime.is_up)
        .count();
    let led = state.led.get();

    Json(SystemStatus {
        led,
        led_color: led.color(),
        led_pattern: led.pattern(),
        wifi_connected: state.arbiter.wifi_connected().await,
        radio_mode: state.arbiter.mode().as_str(),
        services: entries.len(),
        services_up: up,
        services_down: down,
        queue_depth: state.fanout.queue_depth(),
    })
}

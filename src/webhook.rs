//! HTTP surface: the inbound webhook plus read-only queue audit routes.
//!
//! The webhook only appends to the queue. Processing happens later on the
//! poller, so the relay gets an answer as soon as the payload is stored.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::ingest::RawDelivery;
use crate::queue::model::{QueueItem, QueueStatus};
use crate::store::QueueStore;

/// Relays forward attachments inline; allow well past axum's 2 MB default.
pub const MAX_PAYLOAD_BYTES: usize = 32 * 1024 * 1024;

/// Shared state for the webhook routes.
#[derive(Clone)]
pub struct WebhookState {
    pub queue: Arc<dyn QueueStore>,
}

/// Audit view of one queue item. The payload itself is not echoed back.
#[derive(Debug, Clone, Serialize)]
pub struct QueueItemView {
    pub id: Uuid,
    pub status: QueueStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub content_type: Option<String>,
    pub payload_bytes: usize,
    pub received_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&QueueItem> for QueueItemView {
    fn from(item: &QueueItem) -> Self {
        Self {
            id: item.id,
            status: item.status,
            attempt_count: item.attempt_count,
            last_error: item.last_error.clone(),
            content_type: item.payload.content_type.clone(),
            payload_bytes: item.payload.bytes.len(),
            received_at: item.payload.received_at,
            created_at: item.created_at,
            updated_at: item.updated_at,
        }
    }
}

/// Build the webhook and audit routes.
pub fn webhook_routes(queue: Arc<dyn QueueStore>) -> Router {
    Router::new()
        .route("/webhooks/inbound", post(receive_inbound))
        .route("/health", get(health))
        .route("/api/queue/stats", get(queue_stats))
        .route("/api/queue/{id}", get(get_queue_item))
        .layer(DefaultBodyLimit::max(MAX_PAYLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(WebhookState { queue })
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /webhooks/inbound
///
/// Accepts any body. 202 once the payload is queued; 503 only when it could
/// not be stored, so the relay retries the delivery.
async fn receive_inbound(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let delivery = RawDelivery::new(body.to_vec(), content_type);

    match state.queue.enqueue(&delivery).await {
        Ok(item) => {
            info!(
                item_id = %item.id,
                bytes = delivery.bytes.len(),
                content_type = delivery.content_type.as_deref().unwrap_or("-"),
                "Inbound delivery queued"
            );
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({"id": item.id, "status": item.status})),
            )
        }
        Err(e) => {
            error!("Failed to queue inbound delivery: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"error": "Delivery could not be stored"})),
            )
        }
    }
}

/// GET /api/queue/{id}
async fn get_queue_item(
    State(state): State<WebhookState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "Invalid queue item ID"})),
            );
        }
    };

    match state.queue.get_item(id).await {
        Ok(Some(item)) => (
            StatusCode::OK,
            Json(serde_json::json!(QueueItemView::from(&item))),
        ),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Queue item not found"})),
        ),
        Err(e) => {
            error!(item_id = %id, "Failed to load queue item: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"error": "Queue unavailable"})),
            )
        }
    }
}

/// GET /api/queue/stats
async fn queue_stats(State(state): State<WebhookState>) -> impl IntoResponse {
    match state.queue.queue_stats().await {
        Ok(stats) => (StatusCode::OK, Json(serde_json::json!(stats))),
        Err(e) => {
            error!("Failed to load queue stats: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"error": "Queue unavailable"})),
            )
        }
    }
}

//! HTTP surface: delivery operations, gateway webhook, live status stream.

mod handlers;
mod sse;

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::pipeline::{CallerContext, DeliveryEngine, DeliveryOrchestrator, Role};
use crate::webhook::WebhookReconciler;

/// Header carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the authenticated user's role.
pub const USER_ROLE_HEADER: &str = "x-user-role";
/// Header carrying the hex HMAC of a webhook body.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Shared state for relay routes.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DeliveryEngine>,
    pub orchestrator: Arc<DeliveryOrchestrator>,
    pub reconciler: Arc<WebhookReconciler>,
}

/// Build the relay routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/health/detailed", get(handlers::health_detailed))
        .route("/api/analytics/delivery", get(handlers::delivery_analytics))
        .route(
            "/api/patients/{patient_id}/reminders/{reminder_id}/send",
            post(handlers::send_reminder),
        )
        .route(
            "/api/patients/{patient_id}/reminders/{reminder_id}/retry",
            post(handlers::retry_reminder),
        )
        .route(
            "/api/patients/{patient_id}/reminders/{reminder_id}/cancel",
            post(handlers::cancel_reminder),
        )
        .route(
            "/api/patients/{patient_id}/reminders/{reminder_id}/status",
            get(handlers::reminder_status),
        )
        .route("/api/webhook/gateway", post(handlers::gateway_webhook))
        .route("/api/sse/delivery-status", get(sse::delivery_status_stream))
        .fallback(handlers::not_found)
        .with_state(state)
}

/// CORS for the dashboard origin. An unparsable origin allows any.
pub fn cors_layer(origin: &str) -> CorsLayer {
    let allow_origin = match HeaderValue::from_str(origin) {
        Ok(value) => AllowOrigin::exact(value),
        Err(_) => {
            warn!(origin = %origin, "Invalid CORS origin, allowing any");
            AllowOrigin::any()
        }
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

// ── Responses ───────────────────────────────────────────────────────

pub(crate) fn json_ok(status: StatusCode, data: impl serde::Serialize, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({ "data": data, "message": message })),
    )
        .into_response()
}

pub(crate) fn json_error(status: StatusCode, code: &str, error: impl std::fmt::Display) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": error.to_string(), "code": code })),
    )
        .into_response()
}

// ── Caller identity ─────────────────────────────────────────────────

/// Caller resolved by the authentication layer in front of the relay.
pub struct Caller(pub CallerContext);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let Some(user_id) = header(USER_ID_HEADER) else {
            return Err(json_error(
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Missing caller identity",
            ));
        };
        let role = header(USER_ROLE_HEADER)
            .map(Role::parse)
            .unwrap_or(Role::Volunteer);

        Ok(Caller(CallerContext::new(user_id, role)))
    }
}

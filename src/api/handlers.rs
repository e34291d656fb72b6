//! Route handlers for delivery operations, the gateway webhook, health and reports.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::warn;

use super::{AppState, Caller, SIGNATURE_HEADER, json_error, json_ok};
use crate::delivery::DeliveryStatus;
use crate::error::{DeliveryError, WebhookError};
use crate::gateway::CircuitState;
use crate::pipeline::SendOutcome;

type ReminderPath = Path<(String, String)>;

/// Fallback handler for unmatched routes.
pub(crate) async fn not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "NOT_FOUND", "not found")
}

/// GET /health
///
/// Reads breaker state without probing it; a poll never closes a cooled-down circuit.
pub(crate) async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let gateway = state.engine.gateway();
    let circuit_state = gateway.circuit_state();
    let response = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "gateway": {
            "available": circuit_state == CircuitState::Closed,
            "circuit_state": circuit_state,
            "failures": gateway.circuit_failures(),
        },
        "observers": state.engine.events().observer_count(),
        "timestamp": state.engine.now(),
    });
    (StatusCode::OK, axum::Json(response))
}

/// GET /api/health/detailed
pub(crate) async fn health_detailed(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> Response {
    let queue = match state.orchestrator.queue_counts(&caller).await {
        Ok(queue) => queue,
        Err(e) => return delivery_error(e),
    };
    let gateway = state.engine.gateway();
    let data = serde_json::json!({
        "status": "ok",
        "timestamp": state.engine.now(),
        "circuit_breaker": {
            "state": gateway.circuit_state(),
            "failure_count": gateway.circuit_failures(),
            "cooldown_remaining_seconds": gateway.cooldown_remaining().as_secs(),
        },
        "queue": queue,
        "observers": state.engine.events().observer_count(),
    });
    json_ok(StatusCode::OK, data, "Detailed health status retrieved")
}

#[derive(Debug, Deserialize)]
pub(crate) struct AnalyticsQuery {
    #[serde(default)]
    period: String,
}

/// GET /api/analytics/delivery?period=today|7d|30d|all
pub(crate) async fn delivery_analytics(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(query): Query<AnalyticsQuery>,
) -> Response {
    match state.orchestrator.analytics(&caller, &query.period).await {
        Ok(stats) => json_ok(StatusCode::OK, stats, "Statistik pengiriman"),
        Err(e) => delivery_error(e),
    }
}

// ── Delivery operations ─────────────────────────────────────────────

/// POST /api/patients/{patient_id}/reminders/{reminder_id}/send
pub(crate) async fn send_reminder(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((patient_id, reminder_id)): ReminderPath,
) -> Response {
    outcome_response(state.orchestrator.send(&caller, &patient_id, &reminder_id).await)
}

/// POST /api/patients/{patient_id}/reminders/{reminder_id}/retry
pub(crate) async fn retry_reminder(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((patient_id, reminder_id)): ReminderPath,
) -> Response {
    outcome_response(state.orchestrator.retry(&caller, &patient_id, &reminder_id).await)
}

/// POST /api/patients/{patient_id}/reminders/{reminder_id}/cancel
pub(crate) async fn cancel_reminder(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((patient_id, reminder_id)): ReminderPath,
) -> Response {
    outcome_response(state.orchestrator.cancel(&caller, &patient_id, &reminder_id).await)
}

/// GET /api/patients/{patient_id}/reminders/{reminder_id}/status
pub(crate) async fn reminder_status(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((patient_id, reminder_id)): ReminderPath,
) -> Response {
    match state.orchestrator.status(&caller, &patient_id, &reminder_id).await {
        Ok(view) => json_ok(StatusCode::OK, view, "Status pengiriman"),
        Err(e) => delivery_error(e),
    }
}

fn outcome_response(result: Result<SendOutcome, DeliveryError>) -> Response {
    match result {
        Ok(outcome) => {
            let status = outcome_status(outcome.status);
            let message = outcome.message.clone();
            json_ok(status, outcome, &message)
        }
        Err(e) => delivery_error(e),
    }
}

/// Callers can tell a scheduled retry (202) from an outage (503) and a terminal failure (502).
fn outcome_status(status: DeliveryStatus) -> StatusCode {
    match status {
        DeliveryStatus::Retrying => StatusCode::ACCEPTED,
        DeliveryStatus::Queued => StatusCode::SERVICE_UNAVAILABLE,
        DeliveryStatus::Failed => StatusCode::BAD_GATEWAY,
        _ => StatusCode::OK,
    }
}

fn delivery_error(err: DeliveryError) -> Response {
    let status = match &err {
        DeliveryError::PatientNotFound(_) | DeliveryError::ReminderNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        DeliveryError::Forbidden(_) | DeliveryError::AdminRequired => StatusCode::FORBIDDEN,
        DeliveryError::InvalidPhone(_)
        | DeliveryError::InvalidStatus { .. }
        | DeliveryError::InvalidPeriod(_) => StatusCode::BAD_REQUEST,
        DeliveryError::AlreadySending(_) => StatusCode::CONFLICT,
    };
    json_error(status, err.code(), &err)
}

// ── Webhook ─────────────────────────────────────────────────────────

/// POST /api/webhook/gateway
pub(crate) async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    match state.reconciler.handle_ack(&body, signature).await {
        Ok(outcome) => {
            let message = outcome.message();
            json_ok(StatusCode::OK, outcome, &message)
        }
        Err(e) => {
            let status = match e {
                WebhookError::MissingSignature | WebhookError::InvalidSignature => {
                    StatusCode::UNAUTHORIZED
                }
                WebhookError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            };
            warn!(code = e.code(), "Webhook rejected");
            json_error(status, e.code(), &e)
        }
    }
}

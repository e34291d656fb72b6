//! Server-sent delivery status stream.

use std::convert::Infallible;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::{StreamExt, stream};
use tracing::{info, warn};

use super::{AppState, json_error};
use crate::events::DeliveryEvent;

/// GET /api/sse/delivery-status
///
/// Emits `connection.established` first, then every delivery event from this
/// point on. No replay of earlier events.
pub(crate) async fn delivery_status_stream(State(state): State<AppState>) -> Response {
    let Some(subscription) = state.engine.events().subscribe() else {
        return json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "SHUTTING_DOWN",
            "Delivery status stream is shutting down",
        );
    };
    info!(observer_id = %subscription.id(), "Delivery status observer connected");

    let hello = DeliveryEvent::connected(state.engine.now());
    let events = stream::once(async move { hello })
        .chain(subscription.into_stream())
        .filter_map(|event| async move { to_sse(&event) })
        .map(Ok::<_, Infallible>);

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn to_sse(event: &DeliveryEvent) -> Option<Event> {
    match Event::default().event(event.name()).json_data(event) {
        Ok(sse) => Some(sse),
        Err(e) => {
            warn!(event = event.name(), error = %e, "Failed to encode delivery event");
            None
        }
    }
}

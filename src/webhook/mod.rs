//! Gateway webhook reconciliation.
//!
//! The gateway reports delivery progress for sent messages. Each ack is
//! verified, de-duplicated on `(message id, status)`, then applied to the
//! reminder carrying that gateway message id.

pub mod idempotency;
pub mod signature;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::delivery::{Clock, DeliveryStatus, Reminder, mask_phone};
use crate::error::WebhookError;
use crate::events::{DeliveryEvent, EventBroadcaster};
use crate::pipeline::engine::transition;
use crate::store::DeliveryStore;

pub use idempotency::IdempotencyCache;
pub use signature::{sign, verify_signature};

/// Error text stored when the gateway reports a failed delivery.
pub const WEBHOOK_FAILURE_MESSAGE: &str = "Delivery failed according to gateway webhook";

const ACK_EVENT: &str = "message.ack";

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    event: String,
    #[serde(default)]
    message: MessageAck,
}

#[derive(Debug, Default, Deserialize)]
struct MessageAck {
    #[serde(default)]
    id: String,
    #[serde(default)]
    status: String,
}

/// Acknowledgment statuses the relay acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ack {
    Delivered,
    Read,
    Failed,
}

impl Ack {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Result of a verified webhook.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// The ack was applied to a reminder.
    Processed {
        message_id: String,
        reminder_id: String,
        delivery_status: DeliveryStatus,
        /// False when the ack only stamped a timestamp or was a no-op.
        status_changed: bool,
    },
    /// The same `(message id, status)` was seen within the TTL.
    AlreadyProcessed { message_id: String },
    /// Accepted but nothing to do: unknown event, status or message id.
    Ignored { message_id: String, reason: String },
}

impl WebhookOutcome {
    pub fn message(&self) -> String {
        match self {
            Self::Processed {
                delivery_status,
                status_changed: true,
                ..
            } => format!("Reminder status updated to '{delivery_status}'"),
            Self::Processed { .. } => "Acknowledgment recorded".to_string(),
            Self::AlreadyProcessed { .. } => "Webhook already processed".to_string(),
            Self::Ignored { reason, .. } => reason.clone(),
        }
    }
}

/// What applying an ack did to a reminder.
struct Applied {
    reminder_id: String,
    patient_id: String,
    patient_name: String,
    phone: String,
    previous: DeliveryStatus,
    current: DeliveryStatus,
}

/// Verifies and applies gateway delivery acknowledgments.
pub struct WebhookReconciler {
    store: Arc<DeliveryStore>,
    events: EventBroadcaster,
    cache: IdempotencyCache,
    secret: SecretString,
    clock: Arc<dyn Clock>,
}

impl WebhookReconciler {
    pub fn new(
        store: Arc<DeliveryStore>,
        events: EventBroadcaster,
        cache: IdempotencyCache,
        secret: SecretString,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            events,
            cache,
            secret,
            clock,
        }
    }

    pub fn cache(&self) -> &IdempotencyCache {
        &self.cache
    }

    /// Verify, de-duplicate and apply one webhook delivery.
    pub async fn handle_ack(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, WebhookError> {
        let signature = signature
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                warn!("Webhook received without signature header");
                WebhookError::MissingSignature
            })?;

        if !verify_signature(body, signature, self.secret.expose_secret()) {
            warn!(signature_length = signature.len(), "Webhook received with invalid signature");
            return Err(WebhookError::InvalidSignature);
        }

        let payload: WebhookPayload = serde_json::from_slice(body).map_err(|e| {
            warn!(error = %e, "Failed to parse webhook payload");
            WebhookError::InvalidPayload(e.to_string())
        })?;

        let now = self.clock.now();
        let message_id = payload.message.id;
        let status = payload.message.status;
        let key = IdempotencyCache::key(&message_id, &status);

        if self.cache.is_processed(&key, now) {
            debug!(message_id = %message_id, status = %status, "Webhook already processed");
            return Ok(WebhookOutcome::AlreadyProcessed { message_id });
        }

        if payload.event != ACK_EVENT {
            warn!(event = %payload.event, message_id = %message_id, "Unknown webhook event type");
            return Ok(WebhookOutcome::Ignored {
                reason: format!("Event type '{}' acknowledged but not processed", payload.event),
                message_id,
            });
        }

        let Some(ack) = Ack::parse(&status) else {
            warn!(message_id = %message_id, status = %status, "Unknown message status in webhook");
            return Ok(WebhookOutcome::Ignored {
                reason: format!("Status '{status}' acknowledged but not processed"),
                message_id,
            });
        };

        let applied = match self.apply(&message_id, ack, now).await {
            Some(applied) => applied,
            None => {
                warn!(message_id = %message_id, "Reminder not found for gateway message id");
                return Ok(WebhookOutcome::Ignored {
                    reason: "Message ID not found, may have been deleted".to_string(),
                    message_id,
                });
            }
        };

        self.cache.mark_processed(key, now);

        let status_changed = applied.previous != applied.current;
        info!(
            reminder_id = %applied.reminder_id,
            patient_id = %applied.patient_id,
            phone = %applied.phone,
            previous_status = %applied.previous,
            new_status = %applied.current,
            message_id = %message_id,
            "Reminder delivery status reconciled"
        );

        if status_changed {
            self.events.broadcast(DeliveryEvent::status_updated(
                applied.reminder_id.clone(),
                applied.current,
                now,
            ));
            if applied.current == DeliveryStatus::Failed {
                self.events.broadcast(DeliveryEvent::DeliveryFailed {
                    reminder_id: applied.reminder_id.clone(),
                    patient_id: applied.patient_id.clone(),
                    patient_name: applied.patient_name.clone(),
                    error: WEBHOOK_FAILURE_MESSAGE.to_string(),
                    timestamp: now,
                });
            }
        }

        Ok(WebhookOutcome::Processed {
            message_id,
            reminder_id: applied.reminder_id,
            delivery_status: applied.current,
            status_changed,
        })
    }

    async fn apply(&self, message_id: &str, ack: Ack, now: DateTime<Utc>) -> Option<Applied> {
        if message_id.is_empty() {
            return None;
        }
        let (patient_id, reminder_id) = self.store.find_by_gateway_message_id(message_id).await?;

        self.store
            .update_patient(&patient_id, |patient| {
                let patient_id = patient.id.clone();
                let patient_name = patient.name.clone();
                let phone = mask_phone(&patient.phone);
                let reminder = patient.reminder_mut(&reminder_id)?;
                // The record may have been re-sent between lookup and lock.
                if reminder.gateway_message_id.as_deref() != Some(message_id) {
                    return None;
                }
                let previous = reminder.delivery_status;
                apply_ack(reminder, ack, now);
                Some(Applied {
                    reminder_id: reminder.id.clone(),
                    patient_id,
                    patient_name,
                    phone,
                    previous,
                    current: reminder.delivery_status,
                })
            })
            .await
            .flatten()
    }
}

/// Apply an ack without ever moving a reminder backwards on `sent < delivered < read`.
/// Acks only change the status of reminders on that ladder; others are only stamped.
fn apply_ack(reminder: &mut Reminder, ack: Ack, now: DateTime<Utc>) {
    let current = reminder.delivery_status;

    let target = match ack {
        Ack::Delivered => {
            if reminder.delivered_at.is_none() {
                reminder.delivered_at = Some(now);
            }
            DeliveryStatus::Delivered
        }
        Ack::Read => {
            if reminder.read_at.is_none() {
                reminder.read_at = Some(now);
            }
            DeliveryStatus::Read
        }
        Ack::Failed => {
            if current.ack_rank().is_some() && !current.is_closed() {
                transition(reminder, DeliveryStatus::Failed);
                reminder.delivery_error_message = Some(WEBHOOK_FAILURE_MESSAGE.to_string());
            }
            return;
        }
    };

    let advances = match (current.ack_rank(), target.ack_rank()) {
        (Some(from), Some(to)) => to > from,
        _ => false,
    };
    if advances && !current.is_closed() {
        transition(reminder, target);
    }
}

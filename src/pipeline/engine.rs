//! Shared send path: claim a reminder, call the gateway outside the store
//! lock, then settle the result onto the re-fetched record.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::delivery::{
    Attachment, Clock, DeliveryStatus, Patient, QuietHours, Reminder, ReminderMessage, mask_phone,
};
use crate::error::GatewayError;
use crate::events::{DeliveryEvent, EventBroadcaster};
use crate::gateway::{CircuitState, MessageGateway, RetryPolicy, SendReceipt, classify, should_retry};
use crate::store::DeliveryStore;

/// Error text stored when the gateway circuit is open.
pub const GATEWAY_UNAVAILABLE_MESSAGE: &str =
    "Gateway WhatsApp sedang tidak tersedia. Pesan akan dikirim ulang otomatis.";

/// Error text stored when a patient's phone number no longer validates.
pub const INVALID_PHONE_MESSAGE: &str = "Nomor WhatsApp tidak valid";

/// Delivery behaviour knobs.
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub retry: RetryPolicy,
    pub quiet_hours: QuietHours,
    /// Footer appended to every message; `None` when disabled.
    pub disclaimer: Option<String>,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            quiet_hours: QuietHours::disabled(),
            disclaimer: None,
        }
    }
}

/// Which failure ladder applies when a send fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// First attempt: queue on open circuit, else retry or fail.
    Fresh,
    /// User-triggered retry of a failed reminder: queue on open circuit, else fail.
    ManualRetry,
    /// Scheduler-driven automatic retry: retry or fail.
    RetryLadder,
}

/// Machine-readable result of a delivery operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeCode {
    Sent,
    Scheduled,
    GatewayUnavailable,
    RetryScheduled,
    SendFailed,
    Cancelled,
}

impl OutcomeCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "SENT",
            Self::Scheduled => "SCHEDULED",
            Self::GatewayUnavailable => "GATEWAY_UNAVAILABLE",
            Self::RetryScheduled => "RETRY_SCHEDULED",
            Self::SendFailed => "SEND_FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

/// What happened to a reminder after a delivery operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendOutcome {
    pub reminder_id: String,
    pub status: DeliveryStatus,
    pub code: OutcomeCode,
    /// Human-readable summary for the caller.
    pub message: String,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendOutcome {
    pub fn from_reminder(reminder: &Reminder, code: OutcomeCode, message: impl Into<String>) -> Self {
        Self {
            reminder_id: reminder.id.clone(),
            status: reminder.delivery_status,
            code,
            message: message.into(),
            retry_count: reminder.retry_count,
            scheduled_at: reminder.scheduled_delivery_at,
            gateway_message_id: reminder.gateway_message_id.clone(),
            error: reminder.delivery_error_message.clone(),
        }
    }
}

/// Values captured while a reminder was moved to `sending`, so the message
/// can be built and sent without holding the store lock.
#[derive(Debug, Clone)]
pub struct Claim {
    pub patient_id: String,
    pub reminder_id: String,
    patient_name: String,
    title: String,
    description: String,
    attachments: Vec<Attachment>,
    address: String,
    sent_at: DateTime<Utc>,
}

impl Claim {
    /// Move `reminder_id` to `sending` and capture what the send needs.
    /// Returns `None` if the reminder does not exist.
    pub fn take(
        patient: &mut Patient,
        reminder_id: &str,
        address: String,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let patient_id = patient.id.clone();
        let patient_name = patient.name.clone();
        let reminder = patient.reminder_mut(reminder_id)?;
        transition(reminder, DeliveryStatus::Sending);

        Some(Self {
            patient_id,
            reminder_id: reminder.id.clone(),
            patient_name,
            title: reminder.title.clone(),
            description: reminder.description.clone(),
            attachments: reminder.attachments.clone(),
            address,
            sent_at: now,
        })
    }
}

/// Set a reminder's status, logging transitions the lifecycle does not define.
pub fn transition(reminder: &mut Reminder, to: DeliveryStatus) {
    let from = reminder.delivery_status;
    if from != to && !from.can_transition_to(to) {
        warn!(reminder_id = %reminder.id, %from, %to, "Unexpected delivery status transition");
    }
    reminder.delivery_status = to;
}

/// The send path shared by the orchestrator and the scheduler.
pub struct DeliveryEngine {
    store: Arc<DeliveryStore>,
    gateway: Arc<dyn MessageGateway>,
    events: EventBroadcaster,
    settings: DeliverySettings,
    clock: Arc<dyn Clock>,
}

impl DeliveryEngine {
    pub fn new(
        store: Arc<DeliveryStore>,
        gateway: Arc<dyn MessageGateway>,
        events: EventBroadcaster,
        settings: DeliverySettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            gateway,
            events,
            settings,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<DeliveryStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<dyn MessageGateway> {
        &self.gateway
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    pub fn settings(&self) -> &DeliverySettings {
        &self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Defer `reminder` to the end of quiet hours if `now` is inside them.
    /// Returns the new delivery time when deferred.
    pub fn defer_for_quiet_hours(
        &self,
        reminder: &mut Reminder,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let window = &self.settings.quiet_hours;
        if !window.is_quiet(now) {
            return None;
        }
        let next = window.next_active_time(now);
        transition(reminder, DeliveryStatus::Scheduled);
        reminder.scheduled_delivery_at = Some(next);
        Some(next)
    }

    /// Render the message, call the gateway, and settle the result onto the
    /// record. Broadcasts the resulting status.
    pub async fn dispatch(&self, claim: Claim, mode: SendMode) -> SendOutcome {
        let text = ReminderMessage {
            patient_name: &claim.patient_name,
            title: &claim.title,
            description: &claim.description,
            attachments: &claim.attachments,
            disclaimer: self.settings.disclaimer.as_deref(),
        }
        .render();

        let result = self.gateway.send_message(&claim.address, &text).await;
        let circuit = self.gateway.circuit_state();
        let now = self.clock.now();

        let settled = self
            .store
            .update_patient(&claim.patient_id, |patient| {
                let reminder = patient.reminder_mut(&claim.reminder_id)?;
                if reminder.delivery_status != DeliveryStatus::Sending {
                    return None;
                }
                Some(self.settle(reminder, &claim, &result, mode, circuit, now))
            })
            .await
            .flatten();

        let Some(outcome) = settled else {
            warn!(
                reminder_id = %claim.reminder_id,
                patient_id = %claim.patient_id,
                "Reminder changed while sending, result not recorded"
            );
            return orphaned_outcome(&claim, result);
        };

        self.notify(&claim.patient_id, &claim.patient_name, &outcome, now);
        outcome
    }

    fn settle(
        &self,
        reminder: &mut Reminder,
        claim: &Claim,
        result: &Result<SendReceipt, GatewayError>,
        mode: SendMode,
        circuit: CircuitState,
        now: DateTime<Utc>,
    ) -> SendOutcome {
        let phone = mask_phone(&claim.address);

        let err = match result {
            Ok(receipt) => {
                transition(reminder, DeliveryStatus::Sent);
                reminder.gateway_message_id = receipt.message_id.clone();
                reminder.message_sent_at = Some(claim.sent_at);
                reminder.delivery_error_message = None;
                reminder.scheduled_delivery_at = None;
                if mode != SendMode::Fresh {
                    reminder.retry_count = 0;
                }
                info!(
                    reminder_id = %reminder.id,
                    patient_id = %claim.patient_id,
                    phone = %phone,
                    gateway_message_id = reminder.gateway_message_id.as_deref().unwrap_or(""),
                    "Reminder sent"
                );
                return SendOutcome::from_reminder(reminder, OutcomeCode::Sent, "Reminder berhasil dikirim");
            }
            Err(err) => err,
        };

        let max_attempts = self.settings.retry.max_attempts;
        let queue_when_open = matches!(mode, SendMode::Fresh | SendMode::ManualRetry);
        let may_retry = matches!(mode, SendMode::Fresh | SendMode::RetryLadder);

        if queue_when_open && circuit == CircuitState::Open {
            transition(reminder, DeliveryStatus::Queued);
            reminder.retry_count += 1;
            reminder.delivery_error_message = Some(GATEWAY_UNAVAILABLE_MESSAGE.to_string());
            reminder.scheduled_delivery_at = None;
            warn!(
                reminder_id = %reminder.id,
                retry_count = reminder.retry_count,
                phone = %phone,
                "Reminder queued, gateway circuit open"
            );
            return SendOutcome::from_reminder(
                reminder,
                OutcomeCode::GatewayUnavailable,
                GATEWAY_UNAVAILABLE_MESSAGE,
            );
        }

        if may_retry && should_retry(err) && reminder.retry_count < max_attempts {
            let delay = self.settings.retry.delay_for(reminder.retry_count);
            let next = now + Duration::from_std(delay).unwrap_or(Duration::zero());
            transition(reminder, DeliveryStatus::Retrying);
            reminder.scheduled_delivery_at = Some(next);
            reminder.retry_count += 1;
            reminder.delivery_error_message = Some(err.to_string());
            warn!(
                reminder_id = %reminder.id,
                retry_count = reminder.retry_count,
                next_attempt = %next.to_rfc3339(),
                class = ?classify(err),
                error = %err,
                "Reminder send failed, retry scheduled"
            );
            return SendOutcome::from_reminder(
                reminder,
                OutcomeCode::RetryScheduled,
                "Pengiriman gagal, akan dicoba lagi",
            );
        }

        transition(reminder, DeliveryStatus::Failed);
        reminder.delivery_error_message = Some(err.to_string());
        reminder.scheduled_delivery_at = None;
        error!(
            reminder_id = %reminder.id,
            patient_id = %claim.patient_id,
            retry_count = reminder.retry_count,
            phone = %phone,
            error = %err,
            "Reminder send failed"
        );
        SendOutcome::from_reminder(reminder, OutcomeCode::SendFailed, "Pengiriman gagal")
    }

    pub fn broadcast_status(&self, reminder_id: &str, status: DeliveryStatus, now: DateTime<Utc>) {
        self.events
            .broadcast(DeliveryEvent::status_updated(reminder_id, status, now));
    }

    pub fn broadcast_failure(
        &self,
        patient_id: &str,
        patient_name: &str,
        reminder_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) {
        self.events.broadcast(DeliveryEvent::DeliveryFailed {
            reminder_id: reminder_id.to_string(),
            patient_id: patient_id.to_string(),
            patient_name: patient_name.to_string(),
            error: error.to_string(),
            timestamp: now,
        });
    }

    /// Broadcast a settled outcome; a change to `failed` also gets a failure event.
    pub fn notify(
        &self,
        patient_id: &str,
        patient_name: &str,
        outcome: &SendOutcome,
        now: DateTime<Utc>,
    ) {
        self.broadcast_status(&outcome.reminder_id, outcome.status, now);
        if outcome.status == DeliveryStatus::Failed {
            self.broadcast_failure(
                patient_id,
                patient_name,
                &outcome.reminder_id,
                outcome.error.as_deref().unwrap_or_default(),
                now,
            );
        }
    }
}

fn orphaned_outcome(claim: &Claim, result: Result<SendReceipt, GatewayError>) -> SendOutcome {
    let (status, code, message, gateway_message_id, error) = match result {
        Ok(receipt) => (
            DeliveryStatus::Sent,
            OutcomeCode::Sent,
            "Reminder berhasil dikirim",
            receipt.message_id,
            None,
        ),
        Err(err) => (
            DeliveryStatus::Failed,
            OutcomeCode::SendFailed,
            "Pengiriman gagal",
            None,
            Some(err.to_string()),
        ),
    };
    SendOutcome {
        reminder_id: claim.reminder_id.clone(),
        status,
        code,
        message: message.to_string(),
        retry_count: 0,
        scheduled_at: None,
        gateway_message_id,
        error,
    }
}

//! Request-driven delivery operations: send now, retry, cancel, status and admin reports.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::engine::{
    Claim, DeliveryEngine, GATEWAY_UNAVAILABLE_MESSAGE, OutcomeCode, SendMode, SendOutcome,
    transition,
};
use super::reports::{DeliveryAnalytics, Period, QueueCounts};
use crate::delivery::{DeliveryStatus, Patient, PhoneNumber, Reminder, validate_phone};
use crate::error::DeliveryError;

/// Caller role as resolved by the authentication layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Volunteer,
    Admin,
    Superadmin,
}

impl Role {
    /// Unknown roles get the least privilege.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Self::Admin,
            "superadmin" => Self::Superadmin,
            _ => Self::Volunteer,
        }
    }

    /// Privileged roles may act on any patient.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Self::Admin | Self::Superadmin)
    }
}

/// Identity of the user invoking an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    pub user_id: String,
    pub role: Role,
}

impl CallerContext {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }

    pub fn require_admin(&self) -> Result<(), DeliveryError> {
        if self.role.is_privileged() {
            Ok(())
        } else {
            Err(DeliveryError::AdminRequired)
        }
    }

    fn authorize(&self, patient: &Patient) -> Result<(), DeliveryError> {
        if self.role.is_privileged() || patient.created_by.as_deref() == Some(self.user_id.as_str()) {
            Ok(())
        } else {
            Err(DeliveryError::Forbidden(patient.id.clone()))
        }
    }
}

/// Delivery fields of one reminder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryStatusView {
    pub reminder_id: String,
    pub status: DeliveryStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub gateway_message_id: Option<String>,
}

/// Decision made under the store lock.
enum Step {
    Done(SendOutcome),
    Dispatch(Claim, SendMode),
}

/// Synchronous delivery operations invoked by inbound requests.
pub struct DeliveryOrchestrator {
    engine: Arc<DeliveryEngine>,
}

impl DeliveryOrchestrator {
    pub fn new(engine: Arc<DeliveryEngine>) -> Self {
        Self { engine }
    }

    /// Send a reminder now, or defer it to the end of quiet hours.
    pub async fn send(
        &self,
        caller: &CallerContext,
        patient_id: &str,
        reminder_id: &str,
    ) -> Result<SendOutcome, DeliveryError> {
        let engine = &self.engine;
        let now = engine.now();

        let step = engine
            .store()
            .update_patient(patient_id, |patient| -> Result<Step, DeliveryError> {
                caller.authorize(patient)?;
                let status = lookup(patient, reminder_id)?.delivery_status;
                let phone = check_phone(patient)?;

                if status == DeliveryStatus::Sending {
                    return Err(DeliveryError::AlreadySending(reminder_id.to_string()));
                }
                if !status.can_transition_to(DeliveryStatus::Sending) {
                    return Err(invalid_status(reminder_id, "send", status));
                }

                let reminder = patient
                    .reminder_mut(reminder_id)
                    .ok_or_else(|| DeliveryError::ReminderNotFound(reminder_id.to_string()))?;
                if let Some(next) = engine.defer_for_quiet_hours(reminder, now) {
                    info!(
                        reminder_id = %reminder_id,
                        scheduled_at = %next.to_rfc3339(),
                        "Quiet hours, reminder scheduled"
                    );
                    return Ok(Step::Done(SendOutcome::from_reminder(
                        reminder,
                        OutcomeCode::Scheduled,
                        "Jam tenang, reminder dijadwalkan",
                    )));
                }

                Claim::take(patient, reminder_id, phone.whatsapp_address(), now)
                    .map(|claim| Step::Dispatch(claim, SendMode::Fresh))
                    .ok_or_else(|| DeliveryError::ReminderNotFound(reminder_id.to_string()))
            })
            .await
            .ok_or_else(|| DeliveryError::PatientNotFound(patient_id.to_string()))??;

        Ok(self.finish(step, now).await)
    }

    /// Retry a failed reminder with a fresh attempt budget.
    pub async fn retry(
        &self,
        caller: &CallerContext,
        patient_id: &str,
        reminder_id: &str,
    ) -> Result<SendOutcome, DeliveryError> {
        let engine = &self.engine;
        let now = engine.now();
        let available = engine.gateway().is_available();

        let step = engine
            .store()
            .update_patient(patient_id, |patient| -> Result<Step, DeliveryError> {
                caller.authorize(patient)?;
                let status = lookup(patient, reminder_id)?.delivery_status;
                if status != DeliveryStatus::Failed {
                    return Err(invalid_status(reminder_id, "retry", status));
                }
                let phone = check_phone(patient)?;

                if !available {
                    let reminder = patient
                        .reminder_mut(reminder_id)
                        .ok_or_else(|| DeliveryError::ReminderNotFound(reminder_id.to_string()))?;
                    transition(reminder, DeliveryStatus::Queued);
                    reminder.delivery_error_message = Some(GATEWAY_UNAVAILABLE_MESSAGE.to_string());
                    info!(reminder_id = %reminder_id, "Retry queued, gateway unavailable");
                    return Ok(Step::Done(SendOutcome::from_reminder(
                        reminder,
                        OutcomeCode::GatewayUnavailable,
                        GATEWAY_UNAVAILABLE_MESSAGE,
                    )));
                }

                Claim::take(patient, reminder_id, phone.whatsapp_address(), now)
                    .map(|claim| Step::Dispatch(claim, SendMode::ManualRetry))
                    .ok_or_else(|| DeliveryError::ReminderNotFound(reminder_id.to_string()))
            })
            .await
            .ok_or_else(|| DeliveryError::PatientNotFound(patient_id.to_string()))??;

        Ok(self.finish(step, now).await)
    }

    /// Cancel a reminder that has not been sent yet.
    pub async fn cancel(
        &self,
        caller: &CallerContext,
        patient_id: &str,
        reminder_id: &str,
    ) -> Result<SendOutcome, DeliveryError> {
        let now = self.engine.now();

        let outcome = self
            .engine
            .store()
            .update_patient(patient_id, |patient| -> Result<SendOutcome, DeliveryError> {
                caller.authorize(patient)?;
                let reminder = patient
                    .reminder_mut(reminder_id)
                    .ok_or_else(|| DeliveryError::ReminderNotFound(reminder_id.to_string()))?;
                if !reminder.delivery_status.is_cancellable() {
                    return Err(invalid_status(reminder_id, "cancel", reminder.delivery_status));
                }

                transition(reminder, DeliveryStatus::Cancelled);
                reminder.cancelled_at = Some(now);
                reminder.cancelled_by = Some(caller.user_id.clone());
                reminder.scheduled_delivery_at = None;
                Ok(SendOutcome::from_reminder(
                    reminder,
                    OutcomeCode::Cancelled,
                    "Reminder dibatalkan",
                ))
            })
            .await
            .ok_or_else(|| DeliveryError::PatientNotFound(patient_id.to_string()))??;

        info!(reminder_id = %reminder_id, user_id = %caller.user_id, "Reminder cancelled");
        self.engine.broadcast_status(reminder_id, outcome.status, now);
        Ok(outcome)
    }

    /// Current delivery state of a reminder.
    pub async fn status(
        &self,
        caller: &CallerContext,
        patient_id: &str,
        reminder_id: &str,
    ) -> Result<DeliveryStatusView, DeliveryError> {
        self.engine
            .store()
            .read(|patients| {
                let patient = patients
                    .get(patient_id)
                    .ok_or_else(|| DeliveryError::PatientNotFound(patient_id.to_string()))?;
                caller.authorize(patient)?;
                let r = lookup(patient, reminder_id)?;
                Ok(DeliveryStatusView {
                    reminder_id: r.id.clone(),
                    status: r.delivery_status,
                    retry_count: r.retry_count,
                    error_message: r.delivery_error_message.clone(),
                    scheduled_at: r.scheduled_delivery_at,
                    sent_at: r.message_sent_at,
                    delivered_at: r.delivered_at,
                    read_at: r.read_at,
                    gateway_message_id: r.gateway_message_id.clone(),
                })
            })
            .await
    }

    /// Reminders waiting in each stage of the pipeline. Admins only.
    pub async fn queue_counts(&self, caller: &CallerContext) -> Result<QueueCounts, DeliveryError> {
        caller.require_admin()?;
        let now = self.engine.now();
        Ok(self
            .engine
            .store()
            .read(|patients| {
                QueueCounts::tally(patients.values().flat_map(|p| p.reminders.iter()), now)
            })
            .await)
    }

    /// Delivery statistics for `period` (`today`, `7d`, `30d`, `all`). Admins only.
    pub async fn analytics(
        &self,
        caller: &CallerContext,
        period: &str,
    ) -> Result<DeliveryAnalytics, DeliveryError> {
        caller.require_admin()?;
        let period =
            Period::parse(period).ok_or_else(|| DeliveryError::InvalidPeriod(period.to_string()))?;
        let now = self.engine.now();
        Ok(self
            .engine
            .store()
            .read(|patients| {
                DeliveryAnalytics::compute(
                    patients.values().flat_map(|p| p.reminders.iter()),
                    period,
                    now,
                )
            })
            .await)
    }

    async fn finish(&self, step: Step, now: DateTime<Utc>) -> SendOutcome {
        match step {
            Step::Done(outcome) => {
                self.engine
                    .broadcast_status(&outcome.reminder_id, outcome.status, now);
                outcome
            }
            Step::Dispatch(claim, mode) => self.engine.dispatch(claim, mode).await,
        }
    }
}

fn lookup<'a>(
    patient: &'a Patient,
    reminder_id: &str,
) -> Result<&'a Reminder, DeliveryError> {
    patient
        .reminder(reminder_id)
        .ok_or_else(|| DeliveryError::ReminderNotFound(reminder_id.to_string()))
}

fn check_phone(patient: &Patient) -> Result<PhoneNumber, DeliveryError> {
    validate_phone(&patient.phone).map_err(|e| DeliveryError::InvalidPhone(e.to_string()))
}

fn invalid_status(reminder_id: &str, action: &'static str, status: DeliveryStatus) -> DeliveryError {
    DeliveryError::InvalidStatus {
        id: reminder_id.to_string(),
        action,
        status: status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::delivery::{ManualClock, QuietHours};
    use crate::error::GatewayError;
    use crate::events::{DeliveryEvent, EventBroadcaster};
    use crate::gateway::CircuitState;
    use crate::pipeline::engine::DeliverySettings;
    use crate::pipeline::testing::ScriptedGateway;
    use crate::store::DeliveryStore;

    /// 12:00 WIB.
    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 10, 5, 0, 0).unwrap()
    }

    struct Fixture {
        orchestrator: DeliveryOrchestrator,
        engine: Arc<DeliveryEngine>,
        gateway: Arc<ScriptedGateway>,
        clock: Arc<ManualClock>,
    }

    async fn fixture(gateway: Arc<ScriptedGateway>, phone: &str) -> Fixture {
        let clock = Arc::new(ManualClock::new(noon()));
        let settings = DeliverySettings {
            quiet_hours: QuietHours::new(21, 6, chrono_tz::Asia::Jakarta),
            disclaimer: Some("Informasi ini untuk tujuan edukasi.".into()),
            ..Default::default()
        };
        let engine = Arc::new(DeliveryEngine::new(
            DeliveryStore::in_memory(),
            gateway.clone(),
            EventBroadcaster::new(),
            settings,
            clock.clone(),
        ));
        engine
            .store()
            .insert_patient(
                Patient::new("p1", "Budi", phone)
                    .with_created_by("vol-1")
                    .with_reminder(Reminder::new("r1", "Minum obat"))
                    .with_reminder(Reminder::new("r2", "Kontrol").with_status(DeliveryStatus::Sent)),
            )
            .await;
        Fixture {
            orchestrator: DeliveryOrchestrator::new(engine.clone()),
            engine,
            gateway,
            clock,
        }
    }

    fn volunteer() -> CallerContext {
        CallerContext::new("vol-1", Role::Volunteer)
    }

    #[tokio::test]
    async fn send_delivers_during_active_hours() {
        let f = fixture(ScriptedGateway::succeeding("m-1"), "081234567890").await;
        let outcome = f.orchestrator.send(&volunteer(), "p1", "r1").await.unwrap();

        assert_eq!(outcome.status, DeliveryStatus::Sent);
        assert_eq!(outcome.gateway_message_id.as_deref(), Some("m-1"));
        assert_eq!(f.gateway.last_address().as_deref(), Some("6281234567890@s.whatsapp.net"));
        assert!(f.gateway.last_text().unwrap().ends_with("_Informasi ini untuk tujuan edukasi._"));
    }

    #[tokio::test]
    async fn send_checks_existence_and_ownership() {
        let f = fixture(ScriptedGateway::succeeding("m-1"), "081234567890").await;

        let err = f.orchestrator.send(&volunteer(), "nope", "r1").await.unwrap_err();
        assert_eq!(err.code(), "PATIENT_NOT_FOUND");

        let stranger = CallerContext::new("vol-2", Role::Volunteer);
        let err = f.orchestrator.send(&stranger, "p1", "r1").await.unwrap_err();
        assert_eq!(err, DeliveryError::Forbidden("p1".into()));

        let err = f.orchestrator.send(&volunteer(), "p1", "nope").await.unwrap_err();
        assert_eq!(err.code(), "REMINDER_NOT_FOUND");

        let admin = CallerContext::new("adm", Role::Admin);
        assert!(f.orchestrator.send(&admin, "p1", "r1").await.is_ok());
    }

    #[tokio::test]
    async fn invalid_phone_is_rejected_without_gateway_call() {
        let f = fixture(ScriptedGateway::succeeding("m-1"), "invalid-phone").await;

        let err = f.orchestrator.send(&volunteer(), "p1", "r1").await.unwrap_err();
        assert_eq!(err.code(), "INVALID_PHONE");
        assert_eq!(f.gateway.sent_count(), 0);
        assert_eq!(
            f.engine.store().get_reminder("p1", "r1").await.unwrap().delivery_status,
            DeliveryStatus::Pending
        );
    }

    #[tokio::test]
    async fn already_sending_is_a_conflict() {
        let f = fixture(ScriptedGateway::succeeding("m-1"), "081234567890").await;
        f.engine
            .store()
            .update_patient("p1", |p| {
                p.reminder_mut("r1").unwrap().delivery_status = DeliveryStatus::Sending;
            })
            .await;

        let err = f.orchestrator.send(&volunteer(), "p1", "r1").await.unwrap_err();
        assert_eq!(err, DeliveryError::AlreadySending("r1".into()));
    }

    #[tokio::test]
    async fn quiet_hours_schedule_instead_of_sending() {
        let f = fixture(ScriptedGateway::succeeding("m-1"), "081234567890").await;
        let mut sub = f.engine.events().subscribe().unwrap();
        // 22:00 WIB
        f.clock.set(Utc.with_ymd_and_hms(2025, 1, 10, 15, 0, 0).unwrap());

        let outcome = f.orchestrator.send(&volunteer(), "p1", "r1").await.unwrap();
        assert_eq!(outcome.status, DeliveryStatus::Scheduled);
        assert_eq!(outcome.code, OutcomeCode::Scheduled);
        // 06:00 WIB next day
        assert_eq!(
            outcome.scheduled_at,
            Some(Utc.with_ymd_and_hms(2025, 1, 10, 23, 0, 0).unwrap())
        );
        assert_eq!(f.gateway.sent_count(), 0);
        assert!(matches!(
            sub.recv().await,
            Some(DeliveryEvent::StatusUpdated { status: DeliveryStatus::Scheduled, .. })
        ));
    }

    #[tokio::test]
    async fn retry_only_from_failed() {
        let f = fixture(ScriptedGateway::succeeding("m-9"), "081234567890").await;
        let err = f.orchestrator.retry(&volunteer(), "p1", "r1").await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATUS");

        f.engine
            .store()
            .update_patient("p1", |p| {
                let r = p.reminder_mut("r1").unwrap();
                r.delivery_status = DeliveryStatus::Failed;
                r.retry_count = 4;
            })
            .await;
        let outcome = f.orchestrator.retry(&volunteer(), "p1", "r1").await.unwrap();
        assert_eq!(outcome.status, DeliveryStatus::Sent);
        assert_eq!(outcome.retry_count, 0);
    }

    #[tokio::test]
    async fn retry_queues_when_gateway_unavailable() {
        let gateway = ScriptedGateway::failing(GatewayError::CircuitOpen);
        gateway.set_circuit(CircuitState::Open);
        let f = fixture(gateway, "081234567890").await;
        f.engine
            .store()
            .update_patient("p1", |p| {
                p.reminder_mut("r1").unwrap().delivery_status = DeliveryStatus::Failed;
            })
            .await;

        let outcome = f.orchestrator.retry(&volunteer(), "p1", "r1").await.unwrap();
        assert_eq!(outcome.status, DeliveryStatus::Queued);
        assert_eq!(outcome.code, OutcomeCode::GatewayUnavailable);
        assert_eq!(f.gateway.sent_count(), 0);
    }

    #[tokio::test]
    async fn cancel_only_unsent_reminders() {
        let f = fixture(ScriptedGateway::succeeding("m-1"), "081234567890").await;

        let err = f.orchestrator.cancel(&volunteer(), "p1", "r2").await.unwrap_err();
        assert_eq!(
            err,
            DeliveryError::InvalidStatus {
                id: "r2".into(),
                action: "cancel",
                status: "sent".into(),
            }
        );

        let outcome = f.orchestrator.cancel(&volunteer(), "p1", "r1").await.unwrap();
        assert_eq!(outcome.status, DeliveryStatus::Cancelled);

        let reminder = f.engine.store().get_reminder("p1", "r1").await.unwrap();
        assert_eq!(reminder.cancelled_at, Some(noon()));
        assert_eq!(reminder.cancelled_by.as_deref(), Some("vol-1"));

        let err = f.orchestrator.send(&volunteer(), "p1", "r1").await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATUS");
    }

    #[tokio::test]
    async fn status_reports_delivery_fields() {
        let f = fixture(ScriptedGateway::succeeding("m-7"), "081234567890").await;
        f.orchestrator.send(&volunteer(), "p1", "r1").await.unwrap();

        let view = f.orchestrator.status(&volunteer(), "p1", "r1").await.unwrap();
        assert_eq!(view.status, DeliveryStatus::Sent);
        assert_eq!(view.gateway_message_id.as_deref(), Some("m-7"));
        assert_eq!(view.sent_at, Some(noon()));
        assert_eq!(view.retry_count, 0);
    }

    #[tokio::test]
    async fn reports_are_admin_only() {
        let f = fixture(ScriptedGateway::succeeding("m-1"), "081234567890").await;
        let admin = CallerContext::new("boss", Role::Admin);

        let err = f.orchestrator.queue_counts(&volunteer()).await.unwrap_err();
        assert_eq!(err, DeliveryError::AdminRequired);
        let err = f.orchestrator.analytics(&volunteer(), "all").await.unwrap_err();
        assert_eq!(err.code(), "ADMIN_REQUIRED");
        let err = f.orchestrator.analytics(&admin, "yesterday").await.unwrap_err();
        assert_eq!(err.code(), "INVALID_PERIOD");

        let counts = f.orchestrator.queue_counts(&admin).await.unwrap();
        assert_eq!(counts.scheduled, 1);
        assert_eq!(counts.total, 1);

        f.orchestrator.send(&volunteer(), "p1", "r1").await.unwrap();
        let stats = f.orchestrator.analytics(&admin, "today").await.unwrap();
        assert_eq!(stats.total_sent, 2);
        assert_eq!(stats.breakdown["sent"], 2);
        assert_eq!(stats.period, Period::Today);
        assert_eq!(stats.period_end, Some(noon()));
        assert_eq!(f.orchestrator.queue_counts(&admin).await.unwrap().total, 0);
    }

    #[test]
    fn role_parsing_defaults_to_least_privilege() {
        assert_eq!(Role::parse("ADMIN"), Role::Admin);
        assert_eq!(Role::parse("superadmin"), Role::Superadmin);
        assert_eq!(Role::parse("volunteer"), Role::Volunteer);
        assert_eq!(Role::parse("guest"), Role::Volunteer);
    }
}

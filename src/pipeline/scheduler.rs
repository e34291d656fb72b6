//! Background scheduler: periodically drives due reminders through the send path.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::engine::{Claim, DeliveryEngine, INVALID_PHONE_MESSAGE, SendMode, transition};
use crate::delivery::{DeliveryStatus, Patient, Reminder, parse_due_date, validate_phone};

/// Overdue pending reminders older than this are expired instead of sent.
pub const AUTO_SEND_GRACE: chrono::Duration = chrono::Duration::hours(24);

/// Why a reminder was picked up in a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DueKind {
    /// Deferred by quiet hours; its time has come.
    Scheduled,
    /// Waiting on the automatic retry ladder.
    Retrying,
    /// Parked while the circuit was open; the gateway is back.
    Queued,
    /// Never attempted and now due.
    AutoSend,
    /// Never attempted and past the grace window.
    Expire,
}

impl DueKind {
    fn expected_status(&self) -> DeliveryStatus {
        match self {
            Self::Scheduled => DeliveryStatus::Scheduled,
            Self::Retrying => DeliveryStatus::Retrying,
            Self::Queued => DeliveryStatus::Queued,
            Self::AutoSend | Self::Expire => DeliveryStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
struct DueItem {
    patient_id: String,
    reminder_id: String,
    kind: DueKind,
}

/// Counts from one scheduler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Reminders handed to the gateway.
    pub dispatched: usize,
    /// Auto-sends moved to `scheduled` by quiet hours.
    pub deferred: usize,
    pub expired: usize,
    pub invalid_phone: usize,
    /// Picked up but changed before they could be acted on.
    pub skipped: usize,
}

/// Timer-driven discovery of due reminders.
pub struct DeliveryScheduler {
    engine: Arc<DeliveryEngine>,
}

/// Running scheduler task.
pub struct SchedulerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop scheduling new work and wait for the current pass to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Scheduler task ended abnormally");
        }
    }
}

impl DeliveryScheduler {
    pub fn new(engine: Arc<DeliveryEngine>) -> Self {
        Self { engine }
    }

    /// Run one pass immediately, then one every `interval`, until stopped.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> SchedulerHandle {
        let (stop, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "Delivery scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.run_pass(self.engine.now()).await;
                        if report != PassReport::default() {
                            info!(
                                dispatched = report.dispatched,
                                deferred = report.deferred,
                                expired = report.expired,
                                invalid_phone = report.invalid_phone,
                                skipped = report.skipped,
                                "Scheduler pass complete"
                            );
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            info!("Delivery scheduler stopped");
        });

        SchedulerHandle { stop, task }
    }

    /// Scan a snapshot for due reminders, then act on each one.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> PassReport {
        let gateway_available = self.engine.gateway().is_available();
        let tz = self.engine.settings().quiet_hours.timezone;

        let due: Vec<DueItem> = self
            .engine
            .store()
            .read(|patients| {
                patients
                    .values()
                    .flat_map(|patient| {
                        patient.reminders.iter().filter_map(move |reminder| {
                            classify_due(reminder, now, gateway_available, tz).map(|kind| DueItem {
                                patient_id: patient.id.clone(),
                                reminder_id: reminder.id.clone(),
                                kind,
                            })
                        })
                    })
                    .collect()
            })
            .await;

        if !due.is_empty() {
            debug!(count = due.len(), gateway_available, "Due reminders found");
        }

        let mut report = PassReport::default();
        for item in due {
            self.process(item, now, &mut report).await;
        }
        report
    }

    async fn process(&self, item: DueItem, now: DateTime<Utc>, report: &mut PassReport) {
        if item.kind == DueKind::Expire {
            self.expire(&item, now, report).await;
            return;
        }

        let expected = item.kind.expected_status();
        let engine = &self.engine;

        let action = engine
            .store()
            .update_patient(&item.patient_id, |patient| {
                let reminder = patient.reminder(&item.reminder_id)?;
                if reminder.delivery_status != expected {
                    return None;
                }
                if item.kind == DueKind::AutoSend && (reminder.completed || reminder.notified) {
                    return None;
                }

                let phone = match validate_phone(&patient.phone) {
                    Ok(phone) => phone,
                    Err(_) => return Some(Action::InvalidPhone(mark_invalid_phone(patient, &item)?)),
                };

                if item.kind == DueKind::AutoSend {
                    let reminder = patient.reminder_mut(&item.reminder_id)?;
                    if let Some(next) = engine.defer_for_quiet_hours(reminder, now) {
                        return Some(Action::Deferred(next));
                    }
                }

                let mode = match item.kind {
                    DueKind::Retrying => SendMode::RetryLadder,
                    _ => SendMode::Fresh,
                };
                Claim::take(patient, &item.reminder_id, phone.whatsapp_address(), now)
                    .map(|claim| Action::Dispatch(claim, mode))
            })
            .await
            .flatten();

        match action {
            None => report.skipped += 1,
            Some(Action::InvalidPhone(patient_name)) => {
                report.invalid_phone += 1;
                error!(
                    reminder_id = %item.reminder_id,
                    patient_id = %item.patient_id,
                    "Scheduled reminder failed, invalid phone"
                );
                engine.broadcast_status(&item.reminder_id, DeliveryStatus::Failed, now);
                engine.broadcast_failure(
                    &item.patient_id,
                    &patient_name,
                    &item.reminder_id,
                    INVALID_PHONE_MESSAGE,
                    now,
                );
            }
            Some(Action::Deferred(next)) => {
                report.deferred += 1;
                info!(
                    reminder_id = %item.reminder_id,
                    scheduled_at = %next.to_rfc3339(),
                    "Quiet hours, auto-send scheduled"
                );
                engine.broadcast_status(&item.reminder_id, DeliveryStatus::Scheduled, now);
            }
            Some(Action::Dispatch(claim, mode)) => {
                report.dispatched += 1;
                debug!(reminder_id = %item.reminder_id, kind = ?item.kind, "Dispatching due reminder");
                engine.dispatch(claim, mode).await;
            }
        }
    }

    async fn expire(&self, item: &DueItem, now: DateTime<Utc>, report: &mut PassReport) {
        let expired = self
            .engine
            .store()
            .update_patient(&item.patient_id, |patient| {
                let reminder = patient.reminder_mut(&item.reminder_id)?;
                if reminder.delivery_status != DeliveryStatus::Pending {
                    return None;
                }
                transition(reminder, DeliveryStatus::Expired);
                Some(reminder.due_date.clone().unwrap_or_default())
            })
            .await
            .flatten();

        match expired {
            Some(due_date) => {
                report.expired += 1;
                warn!(
                    reminder_id = %item.reminder_id,
                    due_date = %due_date,
                    "Reminder too old for auto-send, expired"
                );
                self.engine
                    .broadcast_status(&item.reminder_id, DeliveryStatus::Expired, now);
            }
            None => report.skipped += 1,
        }
    }
}

enum Action {
    /// Marked failed; carries the patient name for the failure event.
    InvalidPhone(String),
    Deferred(DateTime<Utc>),
    Dispatch(Claim, SendMode),
}

fn mark_invalid_phone(patient: &mut Patient, item: &DueItem) -> Option<String> {
    let name = patient.name.clone();
    let reminder = patient.reminder_mut(&item.reminder_id)?;
    transition(reminder, DeliveryStatus::Failed);
    reminder.delivery_error_message = Some(INVALID_PHONE_MESSAGE.to_string());
    reminder.scheduled_delivery_at = None;
    Some(name)
}

fn classify_due(
    reminder: &Reminder,
    now: DateTime<Utc>,
    gateway_available: bool,
    tz: chrono_tz::Tz,
) -> Option<DueKind> {
    let time_has_come = reminder.scheduled_delivery_at.is_none_or(|at| at <= now);

    match reminder.delivery_status {
        DeliveryStatus::Scheduled if time_has_come => Some(DueKind::Scheduled),
        // The ladder waits out an open circuit instead of failing on it.
        DeliveryStatus::Retrying if time_has_come && gateway_available => Some(DueKind::Retrying),
        DeliveryStatus::Queued if gateway_available => Some(DueKind::Queued),
        DeliveryStatus::Pending if !reminder.completed && !reminder.notified => {
            let raw = reminder.due_date.as_deref().filter(|d| !d.trim().is_empty())?;
            let Some(due) = parse_due_date(raw, tz) else {
                warn!(reminder_id = %reminder.id, due_date = %raw, "Unparsable due date, skipping");
                return None;
            };
            if due > now {
                None
            } else if now < due + AUTO_SEND_GRACE {
                Some(DueKind::AutoSend)
            } else {
                Some(DueKind::Expire)
            }
        }
        _ => None,
    }
}

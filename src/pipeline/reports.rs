//! Read-only delivery views for administrators: queue depth and delivery analytics.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::delivery::{DeliveryStatus, Reminder};

/// Every status, in lifecycle order.
const ALL_STATUSES: [DeliveryStatus; 11] = [
    DeliveryStatus::Pending,
    DeliveryStatus::Scheduled,
    DeliveryStatus::Queued,
    DeliveryStatus::Sending,
    DeliveryStatus::Retrying,
    DeliveryStatus::Sent,
    DeliveryStatus::Delivered,
    DeliveryStatus::Read,
    DeliveryStatus::Failed,
    DeliveryStatus::Expired,
    DeliveryStatus::Cancelled,
];

/// Reminders still waiting for the delivery pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub total: usize,
    /// Pending, or scheduled for a time already reached.
    pub scheduled: usize,
    /// Deferred to a future time by quiet hours.
    pub quiet_hours: usize,
    pub retrying: usize,
    /// Parked while the gateway circuit is open.
    pub queued: usize,
}

impl QueueCounts {
    pub fn tally<'a>(reminders: impl IntoIterator<Item = &'a Reminder>, now: DateTime<Utc>) -> Self {
        let mut counts = Self::default();
        for reminder in reminders {
            let slot = match reminder.delivery_status {
                DeliveryStatus::Pending => &mut counts.scheduled,
                DeliveryStatus::Scheduled => match reminder.scheduled_delivery_at {
                    Some(at) if at > now => &mut counts.quiet_hours,
                    _ => &mut counts.scheduled,
                },
                DeliveryStatus::Retrying => &mut counts.retrying,
                DeliveryStatus::Queued => &mut counts.queued,
                _ => continue,
            };
            *slot += 1;
            counts.total += 1;
        }
        counts
    }
}

/// Reporting window for [`DeliveryAnalytics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Period {
    #[serde(rename = "today")]
    Today,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
    #[serde(rename = "all")]
    All,
}

impl Period {
    /// `today`, `7d`, `30d` or `all`; empty means `all`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "today" => Some(Self::Today),
            "7d" => Some(Self::Week),
            "30d" => Some(Self::Month),
            "all" | "" => Some(Self::All),
            _ => None,
        }
    }

    /// Start of the window ending at `now`; `None` for all time.
    pub fn start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Today => now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|midnight| midnight.and_utc()),
            Self::Week => Some(now - Duration::days(7)),
            Self::Month => Some(now - Duration::days(30)),
            Self::All => None,
        }
    }
}

/// Delivery statistics over the reminders that left the pre-send states.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryAnalytics {
    /// Reminders the gateway accepted or that failed trying.
    pub total_sent: usize,
    /// Delivered or read, as a percentage of sent/delivered/read/failed.
    pub success_rate: f64,
    pub failed_last_7_days: usize,
    /// Mean time from send to the first delivery acknowledgment, e.g. `2m 30s`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_delivery_time: Option<String>,
    pub breakdown: BTreeMap<&'static str, usize>,
    pub period: Period,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_end: Option<DateTime<Utc>>,
}

impl DeliveryAnalytics {
    /// Reminders without a send timestamp are counted in every period.
    pub fn compute<'a>(
        reminders: impl IntoIterator<Item = &'a Reminder>,
        period: Period,
        now: DateTime<Utc>,
    ) -> Self {
        let start = period.start(now);
        let week_ago = now - Duration::days(7);

        let mut breakdown: BTreeMap<&'static str, usize> =
            ALL_STATUSES.iter().map(|s| (s.as_str(), 0)).collect();
        let mut total_sent = 0;
        let mut failed_last_7_days = 0;
        let mut delivery_times = Vec::new();

        for reminder in reminders {
            let status = reminder.delivery_status;
            if matches!(status, DeliveryStatus::Pending | DeliveryStatus::Scheduled) {
                continue;
            }
            if let (Some(start), Some(sent_at)) = (start, reminder.message_sent_at) {
                if sent_at < start || sent_at > now {
                    continue;
                }
            }

            if matches!(
                status,
                DeliveryStatus::Sent
                    | DeliveryStatus::Delivered
                    | DeliveryStatus::Read
                    | DeliveryStatus::Failed
            ) {
                total_sent += 1;
            }
            if status == DeliveryStatus::Failed
                && reminder.message_sent_at.is_some_and(|at| at > week_ago)
            {
                failed_last_7_days += 1;
            }
            *breakdown.entry(status.as_str()).or_default() += 1;

            if let Some(sent_at) = reminder.message_sent_at {
                let acked = reminder.delivered_at.or(reminder.read_at);
                if let Some(acked) = acked.filter(|at| *at > sent_at) {
                    delivery_times.push(acked - sent_at);
                }
            }
        }

        let count = |s: DeliveryStatus| breakdown.get(s.as_str()).copied().unwrap_or(0);
        let succeeded = count(DeliveryStatus::Delivered) + count(DeliveryStatus::Read);
        let deliverable = succeeded + count(DeliveryStatus::Sent) + count(DeliveryStatus::Failed);
        let success_rate = if deliverable > 0 {
            succeeded as f64 / deliverable as f64 * 100.0
        } else {
            0.0
        };

        let avg_delivery_time = (!delivery_times.is_empty()).then(|| {
            let total = delivery_times.iter().fold(Duration::zero(), |acc, d| acc + *d);
            format_duration(total / delivery_times.len() as i32)
        });

        Self {
            total_sent,
            success_rate,
            failed_last_7_days,
            avg_delivery_time,
            breakdown,
            period,
            period_start: start,
            period_end: start.map(|_| now),
        }
    }
}

/// `< 1s`, `42s`, `2m 30s` or `1h 5m 0s`.
pub fn format_duration(d: Duration) -> String {
    let total = d.num_seconds();
    if total < 1 {
        return "< 1s".to_string();
    }
    let (hours, minutes, seconds) = (total / 3600, (total / 60) % 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

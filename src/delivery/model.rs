//! Reminder data model: patients, reminders, attachments and delivery status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Delivery status of a reminder.
///
/// ```text
/// pending   -> scheduled | sending | cancelled
/// scheduled -> sending | cancelled
/// sending   -> sent | queued | retrying | failed
/// retrying  -> sending
/// queued    -> sending
/// sent      -> delivered | read | failed
/// delivered -> read | failed
/// failed    -> sending (manual retry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created, never attempted.
    #[default]
    Pending,
    /// Deferred until quiet hours end.
    Scheduled,
    /// Parked because the gateway circuit was open.
    Queued,
    /// A send is in flight. Never left in place once the attempt settles.
    Sending,
    /// Waiting for the next automatic retry.
    Retrying,
    /// Accepted by the gateway.
    Sent,
    /// Gateway acknowledged delivery to the handset.
    Delivered,
    /// Gateway acknowledged the recipient read the message.
    Read,
    /// Terminal failure; eligible for manual retry.
    Failed,
    /// Overdue beyond the auto-send grace window.
    Expired,
    /// Cancelled by a user before sending.
    Cancelled,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Queued => "queued",
            Self::Sending => "sending",
            Self::Retrying => "retrying",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    /// Check if this status may move to `target`.
    pub fn can_transition_to(&self, target: DeliveryStatus) -> bool {
        use DeliveryStatus::*;

        matches!(
            (self, target),
            // Before the first attempt
            (Pending, Scheduled) | (Pending, Sending) | (Pending, Cancelled) |
            (Pending, Expired) | (Pending, Failed) |
            (Scheduled, Sending) | (Scheduled, Cancelled) | (Scheduled, Failed) |
            // Waiting on the gateway
            (Queued, Sending) | (Queued, Failed) |
            (Retrying, Sending) | (Retrying, Failed) |
            // In flight
            (Sending, Sent) | (Sending, Queued) | (Sending, Retrying) | (Sending, Failed) |
            // Acknowledgments
            (Sent, Delivered) | (Sent, Read) | (Sent, Failed) |
            (Delivered, Read) | (Delivered, Failed) |
            // Manual retry
            (Failed, Sending) | (Failed, Queued)
        )
    }

    /// Only unsent reminders can be cancelled.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Pending | Self::Scheduled)
    }

    /// No acknowledgment may move a reminder out of these states.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Read | Self::Expired | Self::Cancelled)
    }

    /// Position in the acknowledgment ladder `sent < delivered < read`.
    pub fn ack_rank(&self) -> Option<u8> {
        match self {
            Self::Sent => Some(1),
            Self::Delivered => Some(2),
            Self::Read => Some(3),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Legacy records store an empty string for "never attempted".
fn deserialize_status<'de, D>(deserializer: D) -> Result<DeliveryStatus, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(DeliveryStatus::Pending),
        Some(s) => {
            DeliveryStatus::deserialize(serde::de::value::StrDeserializer::<D::Error>::new(s))
        }
    }
}

/// Kind of educational content attached to a reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Article,
    Video,
}

/// Content attached to a reminder, resolved by the content collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    #[serde(default)]
    pub id: String,
    /// Display title shown in the message.
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Article excerpt; ignored for videos.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

impl Attachment {
    pub fn article(title: impl Into<String>, excerpt: Option<String>, url: Option<String>) -> Self {
        Self {
            kind: AttachmentKind::Article,
            id: String::new(),
            title: title.into(),
            url,
            excerpt,
        }
    }

    pub fn video(title: impl Into<String>, url: Option<String>) -> Self {
        Self {
            kind: AttachmentKind::Video,
            id: String::new(),
            title: title.into(),
            url,
            excerpt: None,
        }
    }
}

/// A patient reminder with delivery tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Due date as entered: RFC 3339, or a naive `YYYY-MM-DDTHH:MM[:SS]` in the delivery timezone.
    #[serde(default, alias = "dueDate", skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub notified: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,

    #[serde(default, deserialize_with = "deserialize_status")]
    pub delivery_status: DeliveryStatus,
    #[serde(default, alias = "gowa_message_id", skip_serializing_if = "Option::is_none")]
    pub gateway_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_error_message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_delivery_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_by: Option<String>,
}

impl Reminder {
    /// Create a new pending reminder.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            due_date: None,
            completed: false,
            notified: false,
            attachments: Vec::new(),
            delivery_status: DeliveryStatus::Pending,
            gateway_message_id: None,
            delivery_error_message: None,
            retry_count: 0,
            scheduled_delivery_at: None,
            message_sent_at: None,
            delivered_at: None,
            read_at: None,
            cancelled_at: None,
            cancelled_by: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_due_date(mut self, due_date: impl Into<String>) -> Self {
        self.due_date = Some(due_date.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_status(mut self, status: DeliveryStatus) -> Self {
        self.delivery_status = status;
        self
    }
}

/// A patient record owning its reminders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: String,
    pub name: String,
    pub phone: String,
    /// User that registered the patient; volunteers may only act on their own patients.
    #[serde(default, alias = "createdBy", skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default)]
    pub reminders: Vec<Reminder>,
}

impl Patient {
    pub fn new(id: impl Into<String>, name: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            phone: phone.into(),
            created_by: None,
            reminders: Vec::new(),
        }
    }

    pub fn with_created_by(mut self, user_id: impl Into<String>) -> Self {
        self.created_by = Some(user_id.into());
        self
    }

    pub fn with_reminder(mut self, reminder: Reminder) -> Self {
        self.reminders.push(reminder);
        self
    }

    pub fn reminder(&self, reminder_id: &str) -> Option<&Reminder> {
        self.reminders.iter().find(|r| r.id == reminder_id)
    }

    pub fn reminder_mut(&mut self, reminder_id: &str) -> Option<&mut Reminder> {
        self.reminders.iter_mut().find(|r| r.id == reminder_id)
    }
}

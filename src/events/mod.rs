//! Live delivery-status events and their fan-out to observers.

pub mod broadcaster;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::delivery::DeliveryStatus;

pub use broadcaster::{EventBroadcaster, Subscription};

/// An event pushed to live observers. Serializes to the event's data payload;
/// the event name comes from [`DeliveryEvent::name`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DeliveryEvent {
    ConnectionEstablished {
        message: String,
        timestamp: DateTime<Utc>,
    },
    StatusUpdated {
        reminder_id: String,
        status: DeliveryStatus,
        timestamp: DateTime<Utc>,
    },
    DeliveryFailed {
        reminder_id: String,
        patient_id: String,
        patient_name: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl DeliveryEvent {
    pub fn connected(timestamp: DateTime<Utc>) -> Self {
        Self::ConnectionEstablished {
            message: "Connected to delivery status stream".to_string(),
            timestamp,
        }
    }

    pub fn status_updated(
        reminder_id: impl Into<String>,
        status: DeliveryStatus,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::StatusUpdated {
            reminder_id: reminder_id.into(),
            status,
            timestamp,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection.established",
            Self::StatusUpdated { .. } => "delivery.status.updated",
            Self::DeliveryFailed { .. } => "delivery.failed",
        }
    }
}

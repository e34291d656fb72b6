//! Delivery domain: reminder records and the pure helpers used to send them.

pub mod clock;
pub mod message;
pub mod model;
pub mod phone;
pub mod quiet_hours;

pub use clock::{Clock, ManualClock, SystemClock};
pub use message::ReminderMessage;
pub use model::{Attachment, AttachmentKind, DeliveryStatus, Patient, Reminder};
pub use phone::{PhoneError, PhoneNumber, mask_phone, validate_phone};
pub use quiet_hours::{QuietHours, parse_due_date, resolve_timezone};

//! Remind Relay: WhatsApp reminder delivery with retries, quiet hours and
//! gateway acknowledgments.

pub mod api;
pub mod app;
pub mod config;
pub mod delivery;
pub mod error;
pub mod events;
pub mod gateway;
pub mod pipeline;
pub mod store;
pub mod webhook;

pub use app::Relay;
pub use config::RelayConfig;
pub use error::{Error, Result};

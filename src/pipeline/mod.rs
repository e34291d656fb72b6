//! Delivery pipeline.
//!
//! Every send, whether user-triggered or timer-driven, goes through the same path:
//! 1. `DeliveryOrchestrator` / `DeliveryScheduler` validate and claim a reminder
//! 2. `DeliveryEngine::dispatch()` renders the message and calls the gateway
//! 3. The result is settled onto the re-fetched record and broadcast
//!
//! The store lock is never held across a gateway call.

pub mod engine;
pub mod orchestrator;
pub mod reports;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use engine::{
    DeliveryEngine, DeliverySettings, GATEWAY_UNAVAILABLE_MESSAGE, INVALID_PHONE_MESSAGE,
    OutcomeCode, SendMode, SendOutcome,
};
pub use orchestrator::{CallerContext, DeliveryOrchestrator, DeliveryStatusView, Role};
pub use reports::{DeliveryAnalytics, Period, QueueCounts};
pub use scheduler::{DeliveryScheduler, PassReport, SchedulerHandle};

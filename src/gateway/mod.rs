//! Outbound messaging gateway: circuit breaker, HTTP client and retry policy.

pub mod breaker;
pub mod client;
pub mod retry;

pub use breaker::{CircuitBreaker, CircuitState};
pub use client::{GatewayClient, GatewayConfig, MessageGateway, SendReceipt};
pub use retry::{RetryClass, RetryPolicy, classify, retry_delay, should_retry};

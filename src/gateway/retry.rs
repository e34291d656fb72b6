//! Retry classification and the table-driven backoff ladder.

use std::time::Duration;

use crate::error::{GatewayError, TransportKind};

/// Free-text fragments that mean a retry would fail the same way.
const NON_RETRYABLE: &[&str] = &["invalid phone", "nomor", "unauthorized", "forbidden"];

/// Free-text fragments of transient transport or server failures.
const RETRYABLE: &[&str] = &[
    "timeout",
    "timed out",
    "deadline exceeded",
    "connection refused",
    "connection reset",
    "no such host",
    "network is unreachable",
    "eof",
    "server misbehaving",
];

/// Automatic retry budget and delays.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Ascending delays; the last entry repeats once attempts run past the table.
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delays: [1, 5, 30, 120, 600]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        retry_delay(attempt, &self.delays)
    }
}

/// Delay before retry number `attempt` (1-indexed, clamped to the table).
/// Attempt 0 is treated as the first attempt.
pub fn retry_delay(attempt: u32, table: &[Duration]) -> Duration {
    let Some(last) = table.last() else {
        return Duration::ZERO;
    };
    let index = attempt.saturating_sub(1) as usize;
    table.get(index).copied().unwrap_or(*last)
}

/// How a gateway error was classified for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Validation, auth or breaker rejection; retrying cannot help.
    Permanent,
    /// A recognized transport or server hiccup.
    Transient,
    /// Nothing matched.
    Unknown,
}

pub fn classify(err: &GatewayError) -> RetryClass {
    match err {
        GatewayError::CircuitOpen => RetryClass::Permanent,
        GatewayError::Status { status, .. } => match status {
            400..=499 => RetryClass::Permanent,
            500..=599 => RetryClass::Transient,
            _ => RetryClass::Unknown,
        },
        GatewayError::Transport { kind, message } => match kind {
            TransportKind::Timeout | TransportKind::Connect => RetryClass::Transient,
            TransportKind::Other => classify_text(message),
        },
        GatewayError::ReadBody(_) => RetryClass::Transient,
        GatewayError::Request(text) | GatewayError::Client(text) => classify_text(text),
    }
}

fn classify_text(text: &str) -> RetryClass {
    let lower = text.to_lowercase();
    if NON_RETRYABLE.iter().any(|needle| lower.contains(needle)) {
        RetryClass::Permanent
    } else if RETRYABLE.iter().any(|needle| lower.contains(needle)) {
        RetryClass::Transient
    } else {
        RetryClass::Unknown
    }
}

/// Whether a failed gateway call is worth retrying. Unrecognized errors retry.
pub fn should_retry(err: &GatewayError) -> bool {
    classify(err) != RetryClass::Permanent
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(list: &[u64]) -> Vec<Duration> {
        list.iter().copied().map(Duration::from_secs).collect()
    }

    #[test]
    fn delay_table_lookup_is_one_indexed_and_clamped() {
        let table = secs(&[1, 5, 30]);
        assert_eq!(retry_delay(0, &table), Duration::from_secs(1));
        assert_eq!(retry_delay(1, &table), Duration::from_secs(1));
        assert_eq!(retry_delay(2, &table), Duration::from_secs(5));
        assert_eq!(retry_delay(3, &table), Duration::from_secs(30));
        assert_eq!(retry_delay(10, &table), Duration::from_secs(30));
        assert_eq!(retry_delay(3, &[]), Duration::ZERO);
    }

    #[test]
    fn default_policy_matches_documented_ladder() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_for(5), Duration::from_secs(600));
        assert_eq!(policy.delay_for(99), Duration::from_secs(600));
    }

    #[test]
    fn classifies_errors() {
        assert!(!should_retry(&GatewayError::CircuitOpen));
        assert!(!should_retry(&GatewayError::Status {
            status: 400,
            body: "bad request".into()
        }));
        assert!(!should_retry(&GatewayError::Status {
            status: 401,
            body: String::new()
        }));
        assert!(!should_retry(&GatewayError::Request(
            "invalid phone number format".into()
        )));

        assert!(should_retry(&GatewayError::Status {
            status: 503,
            body: "unavailable".into()
        }));
        assert!(should_retry(&GatewayError::Request(
            "timeout: operation timed out".into()
        )));
        assert!(should_retry(&GatewayError::Request(
            "connection failed: Connection refused (os error 111)".into()
        )));
        assert!(should_retry(&GatewayError::ReadBody("unexpected EOF".into())));
        assert!(should_retry(&GatewayError::Request("something odd".into())));
        assert_eq!(
            classify(&GatewayError::Request("something odd".into())),
            RetryClass::Unknown
        );
        assert_eq!(
            classify(&GatewayError::Status {
                status: 502,
                body: String::new()
            }),
            RetryClass::Transient
        );
    }

    #[test]
    fn status_codes_win_over_body_text() {
        assert_eq!(
            classify(&GatewayError::Status {
                status: 503,
                body: "upstream 404 while routing".into()
            }),
            RetryClass::Transient
        );
        assert_eq!(
            classify(&GatewayError::Status {
                status: 422,
                body: "timeout".into()
            }),
            RetryClass::Permanent
        );
    }

    #[test]
    fn transport_kind_decides_before_message_text() {
        let timeout = GatewayError::Transport {
            kind: TransportKind::Timeout,
            message: "error sending request for http://gw:4000: 401".into(),
        };
        assert_eq!(classify(&timeout), RetryClass::Transient);

        let other = GatewayError::Transport {
            kind: TransportKind::Other,
            message: "error sending request: connection reset by peer".into(),
        };
        assert_eq!(classify(&other), RetryClass::Transient);
    }
}

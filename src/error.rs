//! Error types for the reminder relay.

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// How a transport-level failure happened, as reported by the HTTP client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Timeout,
    Connect,
    Other,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connect => "connection failed",
            Self::Other => "transport error",
        }
    }
}

/// Outbound messaging gateway errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("circuit breaker is open, gateway temporarily unavailable")]
    CircuitOpen,

    /// The request never produced a response. `message` carries the cause
    /// chain without the request URL.
    #[error("{}: {message}", kind.as_str())]
    Transport { kind: TransportKind, message: String },

    #[error("{0}")]
    Request(String),

    #[error("gateway returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to read gateway response: {0}")]
    ReadBody(String),

    #[error("failed to build gateway client: {0}")]
    Client(String),
}

impl GatewayError {
    /// Describe a reqwest transport failure by kind and cause chain.
    pub fn from_transport(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportKind::Timeout
        } else if err.is_connect() {
            TransportKind::Connect
        } else {
            TransportKind::Other
        };
        let err = err.without_url();
        let mut message = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            message.push_str(&format!(": {cause}"));
            source = cause.source();
        }
        Self::Transport { kind, message }
    }
}

/// Errors surfaced by the send/retry/cancel/status operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("patient not found: {0}")]
    PatientNotFound(String),

    #[error("reminder not found: {0}")]
    ReminderNotFound(String),

    #[error("not allowed to manage reminders of patient {0}")]
    Forbidden(String),

    #[error("invalid phone number: {0}")]
    InvalidPhone(String),

    #[error("reminder {0} is already being sent")]
    AlreadySending(String),

    #[error("cannot {action} reminder {id} with status {status}")]
    InvalidStatus {
        id: String,
        action: &'static str,
        status: String,
    },

    #[error("admin access required")]
    AdminRequired,

    #[error("invalid period '{0}', expected today, 7d, 30d or all")]
    InvalidPeriod(String),
}

impl DeliveryError {
    /// Machine-readable code for API callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PatientNotFound(_) => "PATIENT_NOT_FOUND",
            Self::ReminderNotFound(_) => "REMINDER_NOT_FOUND",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::InvalidPhone(_) => "INVALID_PHONE",
            Self::AlreadySending(_) => "ALREADY_SENDING",
            Self::InvalidStatus { .. } => "INVALID_STATUS",
            Self::AdminRequired => "ADMIN_REQUIRED",
            Self::InvalidPeriod(_) => "INVALID_PERIOD",
        }
    }
}

/// Inbound acknowledgment webhook errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebhookError {
    #[error("missing webhook signature")]
    MissingSignature,

    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),
}

impl WebhookError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingSignature => "MISSING_SIGNATURE",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::InvalidPayload(_) => "INVALID_PAYLOAD",
        }
    }
}

/// Delivery store persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;

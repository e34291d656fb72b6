//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::delivery::{QuietHours, resolve_timezone};
use crate::error::ConfigError;
use crate::gateway::{GatewayConfig, RetryPolicy};
use crate::pipeline::DeliverySettings;

/// Default footer appended to every reminder message.
pub const DEFAULT_DISCLAIMER: &str = "Informasi ini untuk tujuan edukasi. Konsultasikan dengan tenaga kesehatan untuk kondisi spesifik Anda.";

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Allowed browser origin for the dashboard.
    pub cors_origin: String,
    /// Patient records snapshot.
    pub data_file: PathBuf,
    /// Daily rolling log files go here when set.
    pub log_dir: Option<PathBuf>,
}

/// Circuit breaker settings.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

/// Quiet-hours window as configured; resolved by [`RelayConfig::quiet_hours`].
#[derive(Debug, Clone)]
pub struct QuietHoursConfig {
    pub start_hour: u32,
    pub end_hour: u32,
    /// `WIB`, `WITA`, `WIT` or an IANA name.
    pub timezone: String,
}

#[derive(Debug, Clone)]
pub struct DisclaimerConfig {
    pub text: String,
    pub enabled: bool,
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    /// Shared secret for webhook signatures. Empty rejects every webhook.
    pub webhook_secret: SecretString,
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
    pub quiet_hours: QuietHoursConfig,
    pub disclaimer: DisclaimerConfig,
    /// Time between scheduler passes.
    pub scheduler_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 8080,
                cors_origin: "http://localhost:5173".to_string(),
                data_file: PathBuf::from("./data/patients.json"),
                log_dir: None,
            },
            gateway: GatewayConfig {
                endpoint: "http://localhost:3000".to_string(),
                user: String::new(),
                password: SecretString::from(""),
                timeout: Duration::from_secs(30),
            },
            webhook_secret: SecretString::from(""),
            breaker: BreakerConfig {
                failure_threshold: 5,
                cooldown: Duration::from_secs(300), // 5 minutes
            },
            retry: RetryPolicy::default(),
            quiet_hours: QuietHoursConfig {
                start_hour: 21,
                end_hour: 6,
                timezone: "WIB".to_string(),
            },
            disclaimer: DisclaimerConfig {
                text: DEFAULT_DISCLAIMER.to_string(),
                enabled: true,
            },
            scheduler_interval: Duration::from_secs(60), // 1 minute
        }
    }
}

impl RelayConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any key/value source. Unset or blank keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(port) = get("RELAY_PORT") {
            config.server.port = parse_value("RELAY_PORT", &port)?;
        }
        if let Some(origin) = get("RELAY_CORS_ORIGIN") {
            config.server.cors_origin = origin;
        }
        if let Some(path) = get("RELAY_DATA_FILE") {
            config.server.data_file = PathBuf::from(path);
        }
        config.server.log_dir = get("RELAY_LOG_DIR").map(PathBuf::from);

        if let Some(endpoint) = get("GATEWAY_ENDPOINT") {
            config.gateway.endpoint = endpoint;
        }
        if let Some(user) = get("GATEWAY_USER") {
            config.gateway.user = user;
        }
        if let Some(password) = get("GATEWAY_PASSWORD") {
            config.gateway.password = SecretString::from(password);
        }
        if let Some(secret) = get("GATEWAY_WEBHOOK_SECRET") {
            config.webhook_secret = SecretString::from(secret);
        }
        if let Some(secs) = get("GATEWAY_TIMEOUT_SECS") {
            config.gateway.timeout = Duration::from_secs(parse_value("GATEWAY_TIMEOUT_SECS", &secs)?);
        }

        if let Some(threshold) = get("BREAKER_FAILURE_THRESHOLD") {
            config.breaker.failure_threshold = parse_value("BREAKER_FAILURE_THRESHOLD", &threshold)?;
        }
        if let Some(secs) = get("BREAKER_COOLDOWN_SECS") {
            config.breaker.cooldown = Duration::from_secs(parse_value("BREAKER_COOLDOWN_SECS", &secs)?);
        }

        if let Some(max) = get("RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_value("RETRY_MAX_ATTEMPTS", &max)?;
        }
        if let Some(list) = get("RETRY_DELAYS_SECS") {
            config.retry.delays = parse_delay_list("RETRY_DELAYS_SECS", &list)?;
        }

        if let Some(hour) = get("QUIET_START_HOUR") {
            config.quiet_hours.start_hour = parse_value("QUIET_START_HOUR", &hour)?;
        }
        if let Some(hour) = get("QUIET_END_HOUR") {
            config.quiet_hours.end_hour = parse_value("QUIET_END_HOUR", &hour)?;
        }
        if let Some(tz) = get("QUIET_TIMEZONE") {
            config.quiet_hours.timezone = tz;
        }

        if let Some(text) = get("DISCLAIMER_TEXT") {
            config.disclaimer.text = text;
        }
        if let Some(enabled) = get("DISCLAIMER_ENABLED") {
            config.disclaimer.enabled = parse_value("DISCLAIMER_ENABLED", &enabled)?;
        }

        if let Some(secs) = get("SCHEDULER_INTERVAL_SECS") {
            config.scheduler_interval =
                Duration::from_secs(parse_value("SCHEDULER_INTERVAL_SECS", &secs)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("BREAKER_FAILURE_THRESHOLD", "must be > 0"));
        }
        if self.breaker.cooldown.is_zero() {
            return Err(invalid("BREAKER_COOLDOWN_SECS", "must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("RETRY_MAX_ATTEMPTS", "must be > 0"));
        }
        if self.retry.delays.is_empty() {
            return Err(invalid("RETRY_DELAYS_SECS", "must list at least one delay"));
        }
        if self.gateway.timeout.is_zero() {
            return Err(invalid("GATEWAY_TIMEOUT_SECS", "must be > 0"));
        }
        if self.scheduler_interval.is_zero() {
            return Err(invalid("SCHEDULER_INTERVAL_SECS", "must be > 0"));
        }
        self.quiet_hours()?;
        Ok(())
    }

    /// Resolve the configured quiet-hours window.
    pub fn quiet_hours(&self) -> Result<QuietHours, ConfigError> {
        let q = &self.quiet_hours;
        if q.start_hour > 23 {
            return Err(invalid(
                "QUIET_START_HOUR",
                &format!("must be between 0 and 23, got {}", q.start_hour),
            ));
        }
        if q.end_hour > 23 {
            return Err(invalid(
                "QUIET_END_HOUR",
                &format!("must be between 0 and 23, got {}", q.end_hour),
            ));
        }
        let timezone = resolve_timezone(&q.timezone).ok_or_else(|| {
            invalid(
                "QUIET_TIMEZONE",
                &format!("unknown timezone '{}' (use WIB, WITA, WIT or an IANA name)", q.timezone),
            )
        })?;
        Ok(QuietHours::new(q.start_hour, q.end_hour, timezone))
    }

    /// Footer text, or `None` when disabled or blank.
    pub fn disclaimer(&self) -> Option<String> {
        let text = self.disclaimer.text.trim();
        (self.disclaimer.enabled && !text.is_empty()).then(|| text.to_string())
    }

    pub fn delivery_settings(&self) -> Result<DeliverySettings, ConfigError> {
        Ok(DeliverySettings {
            retry: self.retry.clone(),
            quiet_hours: self.quiet_hours()?,
            disclaimer: self.disclaimer(),
        })
    }
}

/// Parse a comma-separated list of whole seconds, e.g. `1,5,30`.
pub fn parse_delay_list(key: &str, raw: &str) -> Result<Vec<Duration>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_value::<u64>(key, s).map(Duration::from_secs))
        .collect()
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.parse()
        .map_err(|_| invalid(key, &format!("cannot parse '{raw}'")))
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

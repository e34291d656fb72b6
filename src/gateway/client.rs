//! HTTP client for the WhatsApp gateway, wrapped in the circuit breaker.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::breaker::{CircuitBreaker, CircuitState};
use crate::delivery::mask_phone;
use crate::error::GatewayError;

/// Result of an accepted send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    /// Gateway-assigned id; `None` when the response could not be parsed.
    pub message_id: Option<String>,
}

/// Outbound messaging gateway.
#[async_trait]
pub trait MessageGateway: Send + Sync {
    /// Send `text` to a gateway address (`<digits>@s.whatsapp.net`).
    async fn send_message(&self, address: &str, text: &str) -> Result<SendReceipt, GatewayError>;

    /// Whether a call would be let through. May close a cooled-down breaker.
    fn is_available(&self) -> bool;

    fn circuit_state(&self) -> CircuitState;

    fn circuit_failures(&self) -> u32;

    /// Time until an open circuit lets calls through again.
    fn cooldown_remaining(&self) -> Duration;
}

/// Connection settings for [`GatewayClient`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub endpoint: String,
    pub user: String,
    pub password: SecretString,
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    phone: &'a str,
    message: &'a str,
}

/// Success body `{success, messageId?, error?}`; only the id is used.
#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    #[serde(default, rename = "messageId")]
    message_id: Option<String>,
}

/// Gateway client: one `POST {endpoint}/send/message` per call, basic auth.
pub struct GatewayClient {
    endpoint: String,
    user: String,
    password: SecretString,
    breaker: CircuitBreaker,
    client: reqwest::Client,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig, breaker: CircuitBreaker) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Client(e.to_string()))?;

        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            user: config.user.clone(),
            password: config.password.clone(),
            breaker,
            client,
        })
    }

    fn send_url(&self) -> String {
        format!("{}/send/message", self.endpoint)
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[async_trait]
impl MessageGateway for GatewayClient {
    async fn send_message(&self, address: &str, text: &str) -> Result<SendReceipt, GatewayError> {
        let masked = mask_phone(address);

        if !self.breaker.allow() {
            warn!(
                phone = %masked,
                circuit_state = %self.breaker.state(),
                "Gateway request blocked by circuit breaker"
            );
            return Err(GatewayError::CircuitOpen);
        }

        debug!(endpoint = %self.endpoint, phone = %masked, "Sending gateway request");

        let resp = self
            .client
            .post(self.send_url())
            .basic_auth(&self.user, Some(self.password.expose_secret()))
            .json(&SendMessageRequest {
                phone: address,
                message: text,
            })
            .send()
            .await;

        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                self.breaker.record_failure();
                let err = GatewayError::from_transport(e);
                error!(
                    phone = %masked,
                    error = %err,
                    circuit_failures = self.breaker.failures(),
                    "Gateway request failed"
                );
                return Err(err);
            }
        };

        let status = resp.status();
        let body = match resp.text().await {
            Ok(body) => body,
            Err(e) => {
                self.breaker.record_failure();
                return Err(GatewayError::ReadBody(e.to_string()));
            }
        };

        if !status.is_success() {
            self.breaker.record_failure();
            error!(
                status_code = status.as_u16(),
                phone = %masked,
                response = %body,
                circuit_failures = self.breaker.failures(),
                "Gateway returned non-success status"
            );
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        self.breaker.record_success();

        let message_id = match serde_json::from_str::<SendMessageResponse>(&body) {
            Ok(parsed) => parsed.message_id.filter(|id| !id.is_empty()),
            Err(_) => {
                info!(
                    phone = %masked,
                    status_code = status.as_u16(),
                    "Gateway accepted message (unparsable response)"
                );
                return Ok(SendReceipt::default());
            }
        };

        info!(
            phone = %masked,
            message_id = message_id.as_deref().unwrap_or(""),
            "Gateway message sent"
        );
        Ok(SendReceipt { message_id })
    }

    fn is_available(&self) -> bool {
        self.breaker.allow()
    }

    fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    fn circuit_failures(&self) -> u32 {
        self.breaker.failures()
    }

    fn cooldown_remaining(&self) -> Duration {
        self.breaker.cooldown_remaining()
    }
}

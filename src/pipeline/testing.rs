//! In-process gateway double for pipeline unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::gateway::{CircuitState, MessageGateway, SendReceipt};

/// Returns a fixed result for every send and records what was sent.
pub struct ScriptedGateway {
    result: Mutex<Result<SendReceipt, GatewayError>>,
    circuit: Mutex<CircuitState>,
    sent: Mutex<Vec<(String, String)>>,
}

impl ScriptedGateway {
    fn with_result(result: Result<SendReceipt, GatewayError>) -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(result),
            circuit: Mutex::new(CircuitState::Closed),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn succeeding(message_id: &str) -> Arc<Self> {
        Self::with_result(Ok(SendReceipt {
            message_id: Some(message_id.to_string()),
        }))
    }

    pub fn failing(err: GatewayError) -> Arc<Self> {
        Self::with_result(Err(err))
    }

    pub fn set_result(&self, result: Result<SendReceipt, GatewayError>) {
        *self.result.lock().unwrap() = result;
    }

    pub fn set_circuit(&self, state: CircuitState) {
        *self.circuit.lock().unwrap() = state;
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn last_address(&self) -> Option<String> {
        self.sent.lock().unwrap().last().map(|(a, _)| a.clone())
    }

    pub fn last_text(&self) -> Option<String> {
        self.sent.lock().unwrap().last().map(|(_, t)| t.clone())
    }
}

#[async_trait]
impl MessageGateway for ScriptedGateway {
    async fn send_message(&self, address: &str, text: &str) -> Result<SendReceipt, GatewayError> {
        if self.circuit_state() == CircuitState::Open {
            return Err(GatewayError::CircuitOpen);
        }
        self.sent
            .lock()
            .unwrap()
            .push((address.to_string(), text.to_string()));
        self.result.lock().unwrap().clone()
    }

    fn is_available(&self) -> bool {
        self.circuit_state() == CircuitState::Closed
    }

    fn circuit_state(&self) -> CircuitState {
        *self.circuit.lock().unwrap()
    }

    fn circuit_failures(&self) -> u32 {
        0
    }

    fn cooldown_remaining(&self) -> Duration {
        Duration::ZERO
    }
}

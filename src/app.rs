//! Relay assembly: store, gateway, pipeline, webhook and routes from one config.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tracing::info;

use crate::api::{self, AppState};
use crate::config::RelayConfig;
use crate::delivery::{Clock, SystemClock};
use crate::events::EventBroadcaster;
use crate::gateway::{CircuitBreaker, GatewayClient, MessageGateway};
use crate::pipeline::{DeliveryEngine, DeliveryOrchestrator, DeliveryScheduler, SchedulerHandle};
use crate::store::DeliveryStore;
use crate::webhook::{IdempotencyCache, WebhookReconciler};

/// A fully wired relay.
pub struct Relay {
    engine: Arc<DeliveryEngine>,
    orchestrator: Arc<DeliveryOrchestrator>,
    reconciler: Arc<WebhookReconciler>,
    cors_origin: String,
    scheduler_interval: Duration,
}

impl Relay {
    /// Open the configured data file and connect to the real gateway.
    pub async fn build(config: &RelayConfig) -> crate::Result<Self> {
        let store = DeliveryStore::open(&config.server.data_file).await?;
        info!(
            path = %config.server.data_file.display(),
            "Patient store opened"
        );
        Self::with_store(config, store, Arc::new(SystemClock))
    }

    /// Connect to the configured gateway using an existing store.
    pub fn with_store(
        config: &RelayConfig,
        store: Arc<DeliveryStore>,
        clock: Arc<dyn Clock>,
    ) -> crate::Result<Self> {
        config.validate()?;
        let breaker = CircuitBreaker::new(config.breaker.failure_threshold, config.breaker.cooldown);
        let gateway = Arc::new(GatewayClient::new(&config.gateway, breaker)?);
        Self::with_gateway(config, store, gateway, clock)
    }

    /// Wire every component around the given gateway.
    pub fn with_gateway(
        config: &RelayConfig,
        store: Arc<DeliveryStore>,
        gateway: Arc<dyn MessageGateway>,
        clock: Arc<dyn Clock>,
    ) -> crate::Result<Self> {
        let events = EventBroadcaster::new();
        let engine = Arc::new(DeliveryEngine::new(
            store.clone(),
            gateway,
            events.clone(),
            config.delivery_settings()?,
            clock.clone(),
        ));
        let orchestrator = Arc::new(DeliveryOrchestrator::new(engine.clone()));
        let reconciler = Arc::new(WebhookReconciler::new(
            store,
            events,
            IdempotencyCache::default(),
            config.webhook_secret.clone(),
            clock,
        ));

        Ok(Self {
            engine,
            orchestrator,
            reconciler,
            cors_origin: config.server.cors_origin.clone(),
            scheduler_interval: config.scheduler_interval,
        })
    }

    pub fn engine(&self) -> &Arc<DeliveryEngine> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<DeliveryStore> {
        self.engine.store()
    }

    pub fn events(&self) -> &EventBroadcaster {
        self.engine.events()
    }

    /// HTTP routes with CORS for the dashboard origin.
    pub fn router(&self) -> Router {
        api::router(AppState {
            engine: self.engine.clone(),
            orchestrator: self.orchestrator.clone(),
            reconciler: self.reconciler.clone(),
        })
        .layer(api::cors_layer(&self.cors_origin))
    }

    /// Start the background scheduler at the configured interval.
    pub fn spawn_scheduler(&self) -> SchedulerHandle {
        Arc::new(DeliveryScheduler::new(self.engine.clone())).spawn(self.scheduler_interval)
    }

    /// Stop the scheduler, disconnect observers and write the final snapshot.
    pub async fn shutdown(&self, scheduler: SchedulerHandle) -> crate::Result<()> {
        scheduler.stop().await;
        self.events().shutdown().await;
        self.store().flush().await?;
        info!("Relay shut down");
        Ok(())
    }
}

//! Observer registry: one bounded mailbox per observer, enqueue-or-drop fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::DeliveryEvent;

/// Events buffered per observer before new ones are dropped.
pub const OBSERVER_MAILBOX_CAPACITY: usize = 10;

/// How long `shutdown` waits for observers to drain and disconnect.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Registry {
    observers: Mutex<HashMap<Uuid, mpsc::Sender<DeliveryEvent>>>,
    closed: AtomicBool,
}

impl Registry {
    fn observers(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, mpsc::Sender<DeliveryEvent>>> {
        self.observers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, id: Uuid) -> bool {
        self.observers().remove(&id).is_some()
    }
}

/// Fans delivery events out to live observers.
#[derive(Clone, Default)]
pub struct EventBroadcaster {
    registry: Arc<Registry>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new observer. Returns `None` after shutdown.
    pub fn subscribe(&self) -> Option<Subscription> {
        if self.registry.closed.load(Ordering::SeqCst) {
            return None;
        }
        let (tx, rx) = mpsc::channel(OBSERVER_MAILBOX_CAPACITY);
        let id = Uuid::new_v4();
        let count = {
            let mut observers = self.registry.observers();
            observers.insert(id, tx);
            observers.len()
        };
        info!(observer_id = %id, observers = count, "Observer connected");

        Some(Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
        })
    }

    /// Enqueue `event` for every observer without waiting. An observer whose
    /// mailbox is full misses this event. Returns the number of observers reached.
    pub fn broadcast(&self, event: DeliveryEvent) -> usize {
        let mut observers = self.registry.observers();
        let mut delivered = 0;
        let mut gone = Vec::new();

        for (id, tx) in observers.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(observer_id = %id, event = event.name(), "Observer mailbox full, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => gone.push(*id),
            }
        }
        for id in gone {
            observers.remove(&id);
        }

        debug!(event = event.name(), delivered, "Event broadcast");
        delivered
    }

    pub fn unsubscribe(&self, id: Uuid) {
        if self.registry.remove(id) {
            info!(observer_id = %id, "Observer disconnected");
        }
    }

    pub fn observer_count(&self) -> usize {
        self.registry.observers().len()
    }

    /// Close every mailbox, refuse new observers, then wait a short grace period.
    pub async fn shutdown(&self) {
        self.registry.closed.store(true, Ordering::SeqCst);
        let dropped = {
            let mut observers = self.registry.observers();
            let n = observers.len();
            observers.clear();
            n
        };
        info!(observers = dropped, "Event broadcaster shutting down");
        tokio::time::sleep(SHUTDOWN_GRACE).await;
    }
}

/// One observer's mailbox. Dropping it unregisters the observer.
pub struct Subscription {
    id: Uuid,
    rx: mpsc::Receiver<DeliveryEvent>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event, or `None` once the broadcaster shut down.
    pub async fn recv(&mut self) -> Option<DeliveryEvent> {
        self.rx.recv().await
    }

    /// Consume the subscription as a stream of events.
    pub fn into_stream(self) -> impl Stream<Item = DeliveryEvent> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(self.id) {
                debug!(observer_id = %self.id, "Observer unsubscribed on drop");
            }
        }
    }
}

//! Health-event bus.
//!
//! Every event is appended to the store's event feed first, then fanned
//! out to live subscribers. A subscriber that falls behind loses the
//! oldest events; the feed keeps them.

use tokio::sync::broadcast;
use tracing::{info, warn};

use voxscale_state::{HealthEvent, HealthEventKind, StateResult, StateStore};

const BUS_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    store: StateStore,
    tx: broadcast::Sender<HealthEvent>,
}

impl EventBus {
    pub fn new(store: StateStore) -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { store, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.tx.subscribe()
    }

    /// Persist and broadcast one event. Returns its feed sequence number.
    pub fn publish(&self, event: &HealthEvent) -> StateResult<u64> {
        let seq = self.store.append_event(event)?;
        match &event.kind {
            HealthEventKind::SourceAlarm { .. }
            | HealthEventKind::CapacityShortfall { .. }
            | HealthEventKind::FallbackActivated => {
                warn!(seq, event = event.kind.name(), at = event.at, "health event");
            }
            _ => info!(seq, event = event.kind.name(), at = event.at, "health event"),
        }
        // No subscribers is not an error.
        let _ = self.tx.send(event.clone());
        Ok(seq)
    }
}

// =============================================================================
// Event Bus - per-account FIFO queues between the feed and the workers
// =============================================================================
//
// One bounded channel per supervised account with a single consumer task.
// Arrival order is preserved end to end for an account; nothing is ordered
// across accounts. A full queue applies backpressure to the producer rather
// than dropping events.
//
// Quotes, scheduled resets, and ticks are not account-scoped; `broadcast`
// fans them into every queue.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{AccountId, RiskEvent};

/// Routes events into per-account FIFO queues.
pub struct EventBus {
    capacity: usize,
    senders: RwLock<HashMap<AccountId, mpsc::Sender<RiskEvent>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, senders: RwLock::new(HashMap::new()) }
    }

    /// Create the queue for an account and hand back its consumer end.
    /// Called once per account at startup.
    pub fn register(&self, account: &str) -> mpsc::Receiver<RiskEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.senders.write().insert(account.to_string(), tx);
        debug!(account, capacity = self.capacity, "account queue registered");
        rx
    }

    pub fn accounts(&self) -> Vec<AccountId> {
        self.senders.read().keys().cloned().collect()
    }

    /// Enqueue an event for one account. Awaits when the queue is full;
    /// events for unsupervised accounts are dropped with a warning.
    pub async fn publish(&self, account: &str, event: RiskEvent) {
        let sender = self.senders.read().get(account).cloned();
        match sender {
            Some(tx) => {
                if tx.send(event).await.is_err() {
                    warn!(account, "account queue closed; event dropped");
                }
            }
            None => warn!(account, "event for unsupervised account dropped"),
        }
    }

    /// Fan an event into every account queue (quotes, resets, ticks).
    pub async fn broadcast(&self, event: RiskEvent) {
        let senders: Vec<(AccountId, mpsc::Sender<RiskEvent>)> = self
            .senders
            .read()
            .iter()
            .map(|(account, tx)| (account.clone(), tx.clone()))
            .collect();
        for (account, tx) in senders {
            if tx.send(event.clone()).await.is_err() {
                warn!(account = %account, "account queue closed; broadcast dropped");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn per_account_order_is_preserved() {
        let bus = EventBus::new(16);
        let mut rx = bus.register("ACCT");
        for _ in 0..3 {
            bus.publish("ACCT", RiskEvent::Tick { now: Utc::now() }).await;
        }
        bus.publish(
            "ACCT",
            RiskEvent::TimerExpired { account_id: "ACCT".into(), tag: "freq_min".into() },
        )
        .await;

        for _ in 0..3 {
            assert!(matches!(rx.recv().await.unwrap(), RiskEvent::Tick { .. }));
        }
        assert!(matches!(rx.recv().await.unwrap(), RiskEvent::TimerExpired { .. }));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_account() {
        let bus = EventBus::new(16);
        let mut rx_a = bus.register("A");
        let mut rx_b = bus.register("B");
        bus.broadcast(RiskEvent::Tick { now: Utc::now() }).await;
        assert!(matches!(rx_a.recv().await.unwrap(), RiskEvent::Tick { .. }));
        assert!(matches!(rx_b.recv().await.unwrap(), RiskEvent::Tick { .. }));
    }

    #[tokio::test]
    async fn unknown_account_is_dropped_quietly() {
        let bus = EventBus::new(16);
        // Must not panic or hang.
        bus.publish("GHOST", RiskEvent::Tick { now: Utc::now() }).await;
    }
}

//! Events raised by the core for the lifecycle layer.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

/// Notifications published out of the streaming core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// Playout has been silent past the configured threshold.
    EnterSleep,

    /// A SAP announcement matching the configured stream was applied.
    SapStreamFound {
        name: String,
        destination: Ipv4Addr,
        port: u16,
        sample_rate: u32,
    },

    /// Session control asked for a sample rate change.
    RateChangeRequested { sample_rate: u32 },
}

/// Broadcast bus plus the single-bit packet activity flag.
///
/// `NETWORK_PACKET_RECEIVED` is kept as a flag rather than a message so the
/// ingress hot path only performs a relaxed store.
#[derive(Debug, Clone)]
pub struct EventBus {
    // ---
    tx: broadcast::Sender<NodeEvent>,
    packet_activity: Arc<AtomicBool>,
}

impl EventBus {
    // ---
    pub fn new(capacity: usize) -> Self {
        // ---
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            packet_activity: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publishes an event; having no subscribers is not an error.
    pub fn publish(&self, event: NodeEvent) {
        // ---
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        // ---
        self.tx.subscribe()
    }

    /// Marks that a network packet was received.
    pub fn note_packet(&self) {
        // ---
        self.packet_activity.store(true, Ordering::Relaxed);
    }

    /// Returns and clears the packet activity bit.
    pub fn take_packet_activity(&self) -> bool {
        // ---
        self.packet_activity.swap(false, Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        // ---
        Self::new(32)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_packet_activity_bit() {
        // ---
        let bus = EventBus::default();
        assert!(!bus.take_packet_activity());
        bus.note_packet();
        bus.note_packet();
        assert!(bus.take_packet_activity());
        assert!(!bus.take_packet_activity());
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        // ---
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(NodeEvent::EnterSleep);
        assert_eq!(rx.recv().await.expect("recv failed"), NodeEvent::EnterSleep);
    }
}

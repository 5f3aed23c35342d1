//! Session registry and fan-out
//!
//! One entry per connected client: a bounded sender and the channel
//! set the client subscribed to. Broadcast never awaits a client; a
//! full queue drops the event for that client alone and bumps its
//! drop counter, so one stalled reader cannot slow the rest.

use std::collections::HashSet;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::hub::protocol::ServerMessage;

/// Per-session registry entry
struct Session {
    sender: mpsc::Sender<ServerMessage>,
    channels: HashSet<String>,
    dropped: u64,
}

/// Hub-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub sessions: usize,
    pub events_dropped: u64,
}

/// Websocket session hub
#[derive(Default)]
pub struct Hub {
    sessions: DashMap<String, Session>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connected client; no channels are active initially
    pub fn register(&self, session_id: &str, sender: mpsc::Sender<ServerMessage>) {
        info!("Hub session {} connected", session_id);
        self.sessions.insert(
            session_id.to_string(),
            Session {
                sender,
                channels: HashSet::new(),
                dropped: 0,
            },
        );
    }

    /// Remove a client; safe to call more than once
    pub fn unregister(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            info!(
                "Hub session {} disconnected ({} events dropped)",
                session_id, session.dropped
            );
        }
    }

    /// Activate channels for a session, returning the full active set
    pub fn subscribe(&self, session_id: &str, channels: &[String]) -> Vec<String> {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                for channel in channels {
                    session.channels.insert(channel.clone());
                }
                debug!("Session {} subscribed to {:?}", session_id, channels);
                sorted(&session.channels)
            },
            None => Vec::new(),
        }
    }

    /// Deactivate channels for a session, returning the remaining set
    pub fn unsubscribe(&self, session_id: &str, channels: &[String]) -> Vec<String> {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                for channel in channels {
                    session.channels.remove(channel);
                }
                debug!("Session {} unsubscribed from {:?}", session_id, channels);
                sorted(&session.channels)
            },
            None => Vec::new(),
        }
    }

    /// Fan an event out to every session subscribed to its channel
    pub fn broadcast(&self, channel: &str, data: serde_json::Value) {
        for mut entry in self.sessions.iter_mut() {
            if !entry.channels.contains(channel) {
                continue;
            }
            let message = ServerMessage::Event {
                channel: channel.to_string(),
                data: data.clone(),
            };
            match entry.sender.try_send(message) {
                Ok(()) => {},
                Err(mpsc::error::TrySendError::Full(_)) => {
                    entry.dropped += 1;
                    warn!(
                        "Session {} queue full, dropping {} event (total {})",
                        entry.key(),
                        channel,
                        entry.dropped
                    );
                },
                // Pump gone; unregister happens in the connection task
                Err(mpsc::error::TrySendError::Closed(_)) => {},
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            sessions: self.sessions.len(),
            events_dropped: self.sessions.iter().map(|s| s.dropped).sum(),
        }
    }
}

fn sorted(channels: &HashSet<String>) -> Vec<String> {
    let mut list: Vec<String> = channels.iter().cloned().collect();
    list.sort();
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::protocol::channels;

    fn event_count(rx: &mut mpsc::Receiver<ServerMessage>) -> usize {
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    #[tokio::test]
    async fn test_broadcast_filters_by_channel() {
        let hub = Hub::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        hub.register("a", tx_a);
        hub.register("b", tx_b);
        hub.subscribe("a", &[channels::STATE_CHANGED.to_string()]);
        hub.subscribe("b", &[channels::HEALTH_CHANGED.to_string()]);

        hub.broadcast(channels::STATE_CHANGED, serde_json::json!({"n": 1}));

        assert_eq!(event_count(&mut rx_a), 1);
        assert_eq!(event_count(&mut rx_b), 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_for_that_client_only() {
        let hub = Hub::new();
        let (tx_slow, mut rx_slow) = mpsc::channel(1);
        let (tx_fast, mut rx_fast) = mpsc::channel(8);
        hub.register("slow", tx_slow);
        hub.register("fast", tx_fast);
        hub.subscribe("slow", &[channels::STATE_CHANGED.to_string()]);
        hub.subscribe("fast", &[channels::STATE_CHANGED.to_string()]);

        for n in 0..4 {
            hub.broadcast(channels::STATE_CHANGED, serde_json::json!({ "n": n }));
        }

        // The slow client's queue held one event; the rest were dropped
        assert_eq!(event_count(&mut rx_slow), 1);
        assert_eq!(event_count(&mut rx_fast), 4);
        assert_eq!(hub.stats().events_dropped, 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::channel(8);
        hub.register("a", tx);

        let active = hub.subscribe(
            "a",
            &[
                channels::STATE_CHANGED.to_string(),
                channels::HEALTH_CHANGED.to_string(),
            ],
        );
        assert_eq!(active.len(), 2);

        let active = hub.unsubscribe("a", &[channels::STATE_CHANGED.to_string()]);
        assert_eq!(active, vec![channels::HEALTH_CHANGED.to_string()]);

        hub.broadcast(channels::STATE_CHANGED, serde_json::json!({}));
        assert_eq!(event_count(&mut rx), 0);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let hub = Hub::new();
        let (tx, _rx) = mpsc::channel(8);
        hub.register("a", tx);
        hub.unregister("a");
        hub.unregister("a");
        assert_eq!(hub.session_count(), 0);
    }
}

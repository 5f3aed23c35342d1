//! Bus transport
//!
//! Maintains the single logical connection to the bus daemon and turns
//! the byte stream into [`Telegram`]s. The trait is the seam the rest
//! of the service programs against; additional bus protocols plug in by
//! implementing it.

pub mod knxd;
pub mod reconnect;

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use domus_knx::Telegram;

use crate::error::Result;

pub use knxd::KnxdTransport;
pub use reconnect::{backoff_delay, ReconnectError, ReconnectHelper, ReconnectPolicy};

/// Transport capability seam
///
/// One fixed set of operations over which bus protocols are dispatched;
/// the inbound side is a bounded channel handed out at construction.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Queue a telegram for the bus
    async fn send(&self, telegram: &Telegram) -> Result<()>;

    /// Whether the daemon connection is currently up
    fn is_connected(&self) -> bool;

    /// Traffic counters snapshot
    fn stats(&self) -> TransportStats;

    /// Close the connection and stop reconnecting
    async fn close(&self) -> Result<()>;
}

/// Snapshot of transport traffic counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub telegrams_sent: u64,
    pub telegrams_received: u64,
    pub frame_errors: u64,
    pub reconnects: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Shared atomic counters behind [`TransportStats`]
#[derive(Debug, Default)]
pub(crate) struct TransportCounters {
    sent: AtomicU64,
    received: AtomicU64,
    frame_errors: AtomicU64,
    reconnects: AtomicU64,
    /// Milliseconds since the epoch, 0 = never
    last_activity_ms: AtomicU64,
}

impl TransportCounters {
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_frame_error(&self) {
        self.frame_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStats {
        let last_ms = self.last_activity_ms.load(Ordering::Relaxed);
        TransportStats {
            telegrams_sent: self.sent.load(Ordering::Relaxed),
            telegrams_received: self.received.load(Ordering::Relaxed),
            frame_errors: self.frame_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_activity: if last_ms == 0 {
                None
            } else {
                DateTime::from_timestamp_millis(last_ms as i64)
            },
        }
    }
}

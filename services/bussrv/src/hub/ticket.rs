//! Connect tickets
//!
//! Hub clients authenticate with a single-use, short-lived ticket
//! obtained out of band (the control-plane issues them). The hub only
//! needs to redeem tickets, so the seam is a trait; the in-memory store
//! backs deployments where issuer and hub share a process.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

/// Ticket redemption seam
pub trait TicketValidator: Send + Sync {
    /// Redeem a ticket; a ticket redeems at most once
    fn redeem(&self, ticket: &str) -> bool;
}

/// In-memory single-use ticket store
pub struct TicketStore {
    tickets: DashMap<String, Instant>,
    ttl: Duration,
}

impl TicketStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tickets: DashMap::new(),
            ttl,
        }
    }

    /// Issue a fresh ticket valid for the store TTL
    pub fn issue(&self) -> String {
        let ticket = Uuid::new_v4().to_string();
        self.tickets.insert(ticket.clone(), Instant::now() + self.ttl);
        ticket
    }

    /// Drop expired tickets that were never redeemed
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.tickets.retain(|_, expires| *expires > now);
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.tickets.len()
    }
}

impl TicketValidator for TicketStore {
    fn redeem(&self, ticket: &str) -> bool {
        match self.tickets.remove(ticket) {
            Some((_, expires)) => expires > Instant::now(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_redeems_exactly_once() {
        let store = TicketStore::new(Duration::from_secs(60));
        let ticket = store.issue();
        assert!(store.redeem(&ticket));
        assert!(!store.redeem(&ticket));
    }

    #[test]
    fn test_unknown_ticket_rejected() {
        let store = TicketStore::new(Duration::from_secs(60));
        assert!(!store.redeem("no-such-ticket"));
    }

    #[test]
    fn test_expired_ticket_rejected() {
        let store = TicketStore::new(Duration::ZERO);
        let ticket = store.issue();
        assert!(!store.redeem(&ticket));
    }

    #[test]
    fn test_purge_drops_expired() {
        let store = TicketStore::new(Duration::ZERO);
        store.issue();
        store.issue();
        store.purge_expired();
        assert_eq!(store.outstanding(), 0);
    }
}

//! Peer-broker federation. Grounded on `original_source/src/rqd/node.c` /
//! `controllers.c` (controller role bit, consume advertisement replayed on connect) and
//! on this codebase's `Endpoint` connect/accept bookkeeping, reused here for outbound
//! connects instead of inbound accepts.

use crate::ids::ConnectionId;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PeerStatus {
    /// Waiting out the reconnect backoff.
    Pending,
    /// Outbound connect attempted, awaiting completion.
    Connecting,
    /// Live connection established; `ConnectionId` is the link's connection handle.
    Connected(ConnectionId),
    /// The configured endpoint could not be resolved at all; never retried.
    Failed,
}

pub struct Peer {
    pub addr_spec: String,
    pub addr: Option<SocketAddr>,
    pub status: PeerStatus,
    pub next_attempt: Instant,
    /// Queue names this broker has already advertised a CONSUME for, to this peer.
    pub advertised: HashSet<String>,
}

impl Peer {
    fn new(addr_spec: String, now: Instant) -> Peer {
        let addr = addr_spec.parse().ok();
        let status = if addr.is_none() { PeerStatus::Failed } else { PeerStatus::Pending };
        Peer {
            addr_spec,
            addr,
            status,
            next_attempt: now,
            advertised: HashSet::new(),
        }
    }
}

/// Tracks every configured peer broker and when each is next due for a connect attempt.
pub struct Federation {
    peers: Vec<Peer>,
}

impl Federation {
    pub fn new(addr_specs: &[String], now: Instant) -> Federation {
        Federation {
            peers: addr_specs.iter().map(|spec| Peer::new(spec.clone(), now)).collect(),
        }
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    /// Returns the indices of peers due for a (re)connect attempt right now.
    pub fn due_for_connect(&self, now: Instant) -> Vec<usize> {
        self.peers
            .iter()
            .enumerate()
            .filter(|(_, peer)| {
                matches!(peer.status, PeerStatus::Pending) && peer.next_attempt <= now
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn addr(&self, idx: usize) -> Option<SocketAddr> {
        self.peers.get(idx).and_then(|p| p.addr)
    }

    pub fn mark_connecting(&mut self, idx: usize) {
        if let Some(peer) = self.peers.get_mut(idx) {
            peer.status = PeerStatus::Connecting;
        }
    }

    pub fn mark_connected(&mut self, idx: usize, connection: ConnectionId) {
        if let Some(peer) = self.peers.get_mut(idx) {
            peer.status = PeerStatus::Connected(connection);
            peer.advertised.clear();
        }
    }

    /// Called when a connect attempt fails or a live peer link drops. Schedules the
    /// retry after the backoff; a peer whose address never resolved stays `Failed`
    /// forever (it is never retried).
    pub fn mark_disconnected(&mut self, idx: usize, now: Instant) {
        if let Some(peer) = self.peers.get_mut(idx) {
            if peer.addr.is_none() {
                peer.status = PeerStatus::Failed;
                return;
            }
            peer.status = PeerStatus::Pending;
            peer.next_attempt = now + RECONNECT_BACKOFF;
            peer.advertised.clear();
        }
    }

    pub fn connection_for(&self, connection: ConnectionId) -> Option<usize> {
        self.peers
            .iter()
            .position(|p| matches!(p.status, PeerStatus::Connected(c) if c == connection))
    }

    /// Queues of this queue name to advertise, skipping peers that have already seen it
    /// (so reconnects only replay, and steady state doesn't re-send every tick).
    pub fn needs_advertisement(&self, idx: usize, queue_name: &str) -> bool {
        self.peers
            .get(idx)
            .map_or(false, |p| matches!(p.status, PeerStatus::Connected(_)) && !p.advertised.contains(queue_name))
    }

    pub fn record_advertised(&mut self, idx: usize, queue_name: &str) {
        if let Some(peer) = self.peers.get_mut(idx) {
            peer.advertised.insert(queue_name.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolvable_peer_is_marked_failed_and_never_retried() {
        let now = Instant::now();
        let federation = Federation::new(&["not a valid addr".to_string()], now);
        assert!(matches!(federation.peers()[0].status, PeerStatus::Failed));
        assert!(federation.due_for_connect(now).is_empty());
    }

    #[test]
    fn resolvable_peer_is_due_immediately() {
        let now = Instant::now();
        let federation = Federation::new(&["127.0.0.1:9999".to_string()], now);
        assert_eq!(federation.due_for_connect(now), vec![0]);
    }

    #[test]
    fn disconnect_schedules_backoff_retry() {
        let now = Instant::now();
        let mut federation = Federation::new(&["127.0.0.1:9999".to_string()], now);
        federation.mark_connecting(0);
        federation.mark_disconnected(0, now);
        assert!(federation.due_for_connect(now).is_empty());
        assert!(!federation.due_for_connect(now + Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn advertisement_is_sent_once_per_connection() {
        let now = Instant::now();
        let mut federation = Federation::new(&["127.0.0.1:9999".to_string()], now);
        federation.mark_connected(0, 3);
        assert!(federation.needs_advertisement(0, "work"));
        federation.record_advertised(0, "work");
        assert!(!federation.needs_advertisement(0, "work"));
    }
}

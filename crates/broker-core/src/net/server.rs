//! Listener and accept loop. Grounded on `Endpoint` (`server/lib/neutronium/src/net/
//! endpoint.rs`): same arena-of-connections-plus-free-list, same live-set tracking and
//! periodic housekeeping, same `changes()`-drain pattern — but with the handshake-poll
//! phase removed (no crypto handshake here) and a federation connect phase added.

use crate::error::BrokerError;
use crate::ids::ConnectionId;
use crate::net::connection::{Connection, Role};
use indexmap::IndexSet;
use mio::net::TcpListener;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Listener tokens are reserved downward from `usize::MAX`, well clear of the
/// connection-id range (which starts at `0` and grows only as large as peak concurrent
/// connections). `-l` may repeat, so this is a small range rather than a single token.
const LISTENER_TOKEN_BASE: usize = usize::MAX - 64;

fn listener_token(idx: usize) -> mio::Token {
    mio::Token(LISTENER_TOKEN_BASE + idx)
}

fn token_to_listener_idx(token: mio::Token) -> Option<usize> {
    token.0.checked_sub(LISTENER_TOKEN_BASE)
}

/// Describes a change in a connection's liveness since the last `sync`, mirroring the
/// teacher's `ConnectionChange` enum.
#[derive(Debug, Copy, Clone)]
pub enum ConnectionChange {
    Connected(ConnectionId),
    Disconnected(ConnectionId),
}

pub struct Server {
    listeners: Vec<TcpListener>,
    poll: mio::Poll,
    events: mio::Events,

    connections: Vec<Option<Connection>>,
    free: Vec<ConnectionId>,
    live: IndexSet<ConnectionId>,

    changes: Vec<ConnectionChange>,
    maxconns: usize,

    housekeeping_at: Instant,
}

impl Server {
    const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(3);
    const INGRESS_TIMEOUT: Duration = Duration::from_secs(300);
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
    const ZERO_TIME: Duration = Duration::from_secs(0);

    /// Binds one listener per address (the `-l` flag may repeat; an empty slice is a
    /// configuration error rather than silently picking a default, since the caller is
    /// expected to have already resolved "no `-l` given" to `0.0.0.0`).
    pub fn bind(addrs: &[SocketAddr], maxconns: usize) -> Result<Server, BrokerError> {
        let poll = mio::Poll::new()?;
        let mut listeners = Vec::with_capacity(addrs.len());

        for (idx, addr) in addrs.iter().enumerate() {
            let listener = TcpListener::bind(addr)?;
            poll.register(
                &listener,
                listener_token(idx),
                mio::Ready::readable(),
                mio::PollOpt::edge(),
            )?;
            listeners.push(listener);
        }

        let now = Instant::now();

        Ok(Server {
            listeners,
            poll,
            events: mio::Events::with_capacity(4096),
            connections: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            changes: Vec::new(),
            maxconns,
            housekeeping_at: now,
        })
    }

    /// The address the first listener actually bound to (useful when the configured port
    /// was `0` and the OS picked an ephemeral one, e.g. in tests — those always bind a
    /// single interface).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listeners[0].local_addr()
    }

    /// Stops accepting new connections and closes every listening socket (§4.6 shutdown
    /// step 1). Idempotent: a second call finds an already-empty listener list and is a
    /// no-op. Live connections are untouched; `sync` simply has nothing left to accept
    /// from afterward.
    pub fn stop_accepting(&mut self) {
        for listener in self.listeners.drain(..) {
            let _ = self.poll.deregister(&listener);
        }
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(id).and_then(|c| c.as_ref())
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(id).and_then(|c| c.as_mut())
    }

    pub fn live_connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.live.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Adopts an already-connected stream (used by federation outbound connects) as a
    /// live connection and returns its id.
    pub fn adopt(&mut self, stream: mio::net::TcpStream, role: Role, now: Instant) -> io::Result<ConnectionId> {
        let id = self.next_slot();
        let connection = Connection::new(id, stream, role, now);
        connection.register(&self.poll, mio::Token(id))?;
        self.connections[id] = Some(connection);
        self.live.insert(id);
        self.changes.push(ConnectionChange::Connected(id));
        Ok(id)
    }

    fn next_slot(&mut self) -> ConnectionId {
        match self.free.pop() {
            Some(id) => id,
            None => {
                let id = self.connections.len();
                self.connections.push(None);
                id
            }
        }
    }

    /// Drains all connectivity changes accumulated since the last call.
    pub fn changes(&mut self) -> Vec<ConnectionChange> {
        self.changes.drain(..).collect()
    }

    /// Forcibly closes and frees a connection, recording a `Disconnected` change.
    pub fn drop_connection(&mut self, id: ConnectionId) {
        if let Some(connection) = self.connections.get_mut(id).and_then(|c| c.as_mut()) {
            let _ = connection.deregister(&self.poll);
            connection.close();
        }
        if self.live.remove(&id) {
            self.free.push(id);
            self.changes.push(ConnectionChange::Disconnected(id));
        }
    }

    /// Runs one iteration of the event loop: accepts new connections (subject to
    /// `maxconns`), flushes pending egress on every live connection, and polls for
    /// readiness. Returns the ids of connections that became readable this tick so the
    /// caller can pull decoded actions from them.
    pub fn sync(&mut self, now: Instant) -> Vec<ConnectionId> {
        if now.duration_since(self.housekeeping_at) >= Self::HOUSEKEEPING_INTERVAL {
            self.housekeeping(now);
            self.housekeeping_at = now;
        }

        self.flush_egress(now);
        self.accept_pending();

        self.poll
            .poll(&mut self.events, Some(Self::ZERO_TIME))
            .expect("poll failed");

        let mut readable = Vec::new();
        let tokens: Vec<(usize, bool, bool)> = self
            .events
            .iter()
            .filter(|e| token_to_listener_idx(e.token()).is_none())
            .map(|e| (e.token().0, e.readiness().is_readable(), e.readiness().is_writable()))
            .collect();

        for (id, is_readable, is_writable) in tokens {
            if is_writable {
                if let Some(connection) = self.connection_mut(id) {
                    if let Err(BrokerError::Fatal(_)) = connection.send(now) {
                        self.drop_connection(id);
                        continue;
                    }
                }
            }
            if is_readable {
                readable.push(id);
            }
        }

        readable
    }

    /// Flushes whatever egress buffer a connection is still holding. A `Wait`
    /// (`WouldBlock`) is routine backpressure, not a failure — the bytes stay buffered
    /// and the next writable-readiness event or tick retries. Only `Fatal` drops the
    /// connection.
    fn flush_egress(&mut self, now: Instant) {
        let ids: Vec<ConnectionId> = self.live.iter().copied().collect();
        for id in ids {
            let fatal = match self.connections.get_mut(id).and_then(|c| c.as_mut()) {
                Some(connection) if connection.has_egress() => {
                    matches!(connection.send(now), Err(BrokerError::Fatal(_)))
                }
                _ => false,
            };
            if fatal {
                self.drop_connection(id);
            }
        }
    }

    fn accept_pending(&mut self) {
        for listener_idx in 0..self.listeners.len() {
            loop {
                match self.listeners[listener_idx].accept() {
                    Ok((stream, _addr)) => {
                        if self.live.len() >= self.maxconns {
                            let mut reject = Connection::new(usize::MAX, stream, Role::Client, Instant::now());
                            reject.send_server_full();
                            let _ = reject.send(Instant::now());
                            reject.close();
                            continue;
                        }

                        let id = self.next_slot();
                        let connection = Connection::new(id, stream, Role::Client, Instant::now());
                        if connection.register(&self.poll, mio::Token(id)).is_err() {
                            self.free.push(id);
                            continue;
                        }
                        self.connections[id] = Some(connection);
                        self.live.insert(id);
                        self.changes.push(ConnectionChange::Connected(id));
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
        }
    }

    fn housekeeping(&mut self, now: Instant) {
        let stale: Vec<ConnectionId> = self
            .live
            .iter()
            .copied()
            .filter(|&id| {
                self.connections
                    .get(id)
                    .and_then(|c| c.as_ref())
                    .map_or(false, |c| c.last_ingress_elapsed(now) >= Self::INGRESS_TIMEOUT)
            })
            .collect();

        for id in stale {
            self.drop_connection(id);
        }

        let keepalive: Vec<ConnectionId> = self
            .live
            .iter()
            .copied()
            .filter(|&id| {
                self.connections
                    .get(id)
                    .and_then(|c| c.as_ref())
                    .map_or(false, |c| c.last_egress_elapsed(now) >= Self::KEEPALIVE_INTERVAL)
            })
            .collect();

        for id in keepalive {
            if let Some(connection) = self.connection_mut(id) {
                connection.send_pong();
            }
        }
    }
}

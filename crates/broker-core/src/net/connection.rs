//! Per-connection protocol state machine. Grounded on the buffer ownership and
//! `register`/`deregister`/`receive`/`send` shape of this codebase's `Channel` type, with
//! the crypto handshake and sequence-number bookkeeping stripped out (authentication and
//! wire encryption are out of scope) and replaced by the pending command set described in
//! the wire protocol design.

use crate::consumer::Priority;
use crate::error::BrokerError;
use crate::ids::{ConnectionId, QueueId};
use crate::net::buffer::Buffer;
use crate::net::frame::{self, opcode, Command};
use mio::net::TcpStream;
use std::io;
use std::time::Instant;

const BUF_SIZE: usize = 65536;

/// A connection's decoded-but-not-yet-committed command fields. Reset to empty by every
/// `CLEAR` opcode; terminator opcodes consume it as a unit.
#[derive(Debug, Default, Clone)]
pub struct PendingCommand {
    pub id: Option<u64>,
    pub qid: Option<QueueId>,
    pub timeout: Option<u64>,
    pub max: Option<u32>,
    pub priority: Option<Priority>,
    pub queue_name: Option<String>,
    pub payload: Option<Vec<u8>>,
    pub noreply: bool,
    pub exclusive: bool,
    pub broadcast: bool,
}

impl PendingCommand {
    fn clear(&mut self) {
        *self = PendingCommand::default();
    }
}

/// What a committed terminator command asked the broker to do. `Connection` only decodes
/// and accumulates state; the broker (which owns the queue registry and message store)
/// is what actually acts on an `Action`.
#[derive(Debug, Clone)]
pub enum Action {
    Request { qid: Option<QueueId>, queue_name: Option<String>, id: u64, payload: Vec<u8>, timeout: Option<u64> },
    Reply { id: u64, payload: Vec<u8> },
    Broadcast { qid: Option<QueueId>, queue_name: Option<String>, payload: Vec<u8> },
    Consume { queue_name: String, max: u32, priority: Priority, exclusive: bool },
    CancelQueue { qid: Option<QueueId>, queue_name: Option<String> },
    Closing,
    Delivered { id: u64 },
    Consuming { queue_name: String, qid: QueueId },
    Ping,
    Pong,
}

pub type ConnectionResult<T> = Result<T, BrokerError>;

/// Role bit set on a connection. Regular clients are `Client`; a federation peer link
/// carries `Controller` so the scheduler treats it as a low-priority remote consumer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    Client,
    Controller,
}

pub struct Connection {
    pub id: ConnectionId,
    stream: Option<TcpStream>,
    read_buffer: Buffer,
    write_buffer: Buffer,
    pending: PendingCommand,
    pub role: Role,
    pub closing: bool,
    last_ingress: Instant,
    last_egress: Instant,
    /// Bumped when a message timed out while this connection held it as a target
    /// (§5). Purely observational: nothing in this broker disconnects a consumer for
    /// racking these up, but it's there for logging/metrics to act on.
    suspicious: u32,
}

impl Connection {
    pub fn new(id: ConnectionId, stream: TcpStream, role: Role, now: Instant) -> Connection {
        Connection {
            id,
            stream: Some(stream),
            read_buffer: Buffer::new(BUF_SIZE),
            write_buffer: Buffer::new(BUF_SIZE),
            pending: PendingCommand::default(),
            role,
            closing: false,
            last_ingress: now,
            last_egress: now,
            suspicious: 0,
        }
    }

    /// Records that a message this connection was holding as a target timed out.
    pub fn mark_suspicious(&mut self) {
        self.suspicious += 1;
    }

    pub fn suspicious_count(&self) -> u32 {
        self.suspicious
    }

    pub fn register(&self, poll: &mio::Poll, token: mio::Token) -> io::Result<()> {
        poll.register(
            self.stream.as_ref().expect("connection has a live stream"),
            token,
            mio::Ready::readable() | mio::Ready::writable(),
            mio::PollOpt::edge(),
        )
    }

    pub fn deregister(&self, poll: &mio::Poll) -> io::Result<()> {
        poll.deregister(self.stream.as_ref().expect("connection has a live stream"))
    }

    pub fn has_egress(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    pub fn last_ingress_elapsed(&self, now: Instant) -> std::time::Duration {
        now.duration_since(self.last_ingress)
    }

    pub fn last_egress_elapsed(&self, now: Instant) -> std::time::Duration {
        now.duration_since(self.last_egress)
    }

    /// Reads available bytes into the inbound buffer and decodes as many complete
    /// commands as are present, returning the committed actions (terminator commands)
    /// in wire order. Non-terminator commands mutate `self.pending` without producing
    /// an action. This is only ever called in response to an edge-triggered readable
    /// event, so a read that yields zero new bytes means the peer sent EOF (a genuine
    /// `WouldBlock` would have short-circuited out of `Buffer::ingress` instead) — that's
    /// reported as `ConnectionLost` rather than silently returning no actions, so a
    /// disconnected consumer or producer is noticed immediately instead of lingering
    /// until the idle-connection housekeeping sweep.
    pub fn receive(&mut self, now: Instant) -> ConnectionResult<Vec<Action>> {
        let stream = self.stream.as_mut().expect("connection has a live stream");
        let received = self.read_buffer.ingress(stream)?;
        if received == 0 {
            return Err(BrokerError::Fatal(crate::error::ErrorKind::ConnectionLost));
        }
        self.last_ingress = now;

        let mut actions = Vec::new();
        let mut protocol_error = false;
        let consumed = {
            let pending = &mut self.pending;
            frame::decode(self.read_buffer.read_slice(), |command| {
                match apply_command(pending, command) {
                    Ok(Some(action)) => actions.push(action),
                    Ok(None) => {}
                    Err(MissingField) => protocol_error = true,
                }
            })?
        };
        self.read_buffer.move_head(consumed);

        if protocol_error {
            return Err(BrokerError::Fatal(crate::error::ErrorKind::ProtocolError));
        }

        Ok(actions)
    }

    /// Flushes the outbound buffer to the socket.
    pub fn send(&mut self, now: Instant) -> ConnectionResult<()> {
        let stream = self.stream.as_mut().expect("connection has a live stream");
        self.write_buffer.egress(stream)?;
        self.last_egress = now;
        Ok(())
    }

    fn queue(&mut self, op: u8) {
        self.write_buffer.ensure_capacity();
        let _ = frame::write_nullary(WriteInto(&mut self.write_buffer), op);
    }

    fn queue_int(&mut self, op: u8, value: u64) {
        self.write_buffer.ensure_capacity();
        let _ = frame::write_int(WriteInto(&mut self.write_buffer), op, value);
    }

    fn queue_bytes(&mut self, op: u8, data: &[u8]) {
        self.write_buffer.ensure_capacity();
        let _ = frame::write_bytes(WriteInto(&mut self.write_buffer), op, data);
    }

    /// Queues a REQUEST frame bound for a consumer.
    pub fn send_request(&mut self, mid: u16, qid: QueueId, payload: &[u8]) {
        self.queue(opcode::CLEAR);
        self.queue_int(opcode::ID, mid as u64);
        self.queue_int(opcode::QUEUEID, qid as u64);
        self.queue_bytes(opcode::PAYLOAD, payload);
        self.queue(opcode::REQUEST);
    }

    /// Queues a BROADCAST frame bound for a consumer.
    pub fn send_broadcast(&mut self, payload: &[u8]) {
        self.queue(opcode::CLEAR);
        self.queue_bytes(opcode::PAYLOAD, payload);
        self.queue(opcode::NOREPLY);
        self.queue(opcode::BROADCAST);
    }

    /// Queues a REPLY frame bound for the original producer.
    pub fn send_reply(&mut self, origin_id: u64, payload: &[u8]) {
        self.queue(opcode::CLEAR);
        self.queue_int(opcode::ID, origin_id);
        self.queue_bytes(opcode::PAYLOAD, payload);
        self.queue(opcode::REPLY);
    }

    /// Queues a CONSUMING acknowledgement.
    pub fn send_consuming(&mut self, queue_name: &str, qid: QueueId) {
        self.queue(opcode::CLEAR);
        self.queue_int(opcode::QUEUEID, qid as u64);
        self.queue_bytes(opcode::QUEUE, queue_name.as_bytes());
        self.queue(opcode::CONSUMING);
    }

    /// Queues a CONSUME frame advertising a subscription to a federation peer. Mirrors
    /// what a real client sends to subscribe, since from the peer's point of view this
    /// broker's federation link looks like an ordinary consumer.
    pub fn send_consume(&mut self, queue_name: &str, max: u32, priority: Priority, exclusive: bool) {
        self.queue(opcode::CLEAR);
        self.queue_bytes(opcode::QUEUE, queue_name.as_bytes());
        self.queue_int(opcode::MAX, max as u64);
        self.queue_int(opcode::PRIORITY, priority.to_wire());
        if exclusive {
            self.queue(opcode::EXCLUSIVE);
        }
        self.queue(opcode::CONSUME);
    }

    /// Queues an UNDELIVERED notice bound for the original producer.
    pub fn send_undelivered(&mut self, origin_id: u64) {
        self.queue(opcode::CLEAR);
        self.queue_int(opcode::ID, origin_id);
        self.queue(opcode::UNDELIVERED);
    }

    pub fn send_server_full(&mut self) {
        self.queue(opcode::CLEAR);
        self.queue(opcode::SERVER_FULL);
    }

    pub fn send_closing(&mut self) {
        self.queue(opcode::CLEAR);
        self.queue(opcode::CLOSING);
    }

    pub fn send_pong(&mut self) {
        self.queue(opcode::PONG);
    }

    /// Shuts the socket down. Takes the stream so double-close is impossible; subsequent
    /// calls are no-ops.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

/// Adapter so the byte-oriented frame writers can append straight into a `Buffer`'s
/// write slice instead of needing their own intermediate allocation.
struct WriteInto<'a>(&'a mut Buffer);

impl<'a> io::Write for WriteInto<'a> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let slice = self.0.write_slice();
        let count = buf.len().min(slice.len());
        slice[..count].copy_from_slice(&buf[..count]);
        self.0.move_tail(count);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Signals that a terminator committed without one of its required fields set (§4.2's
/// required-fields table). Fatal to the connection; carries no payload since the caller
/// already knows which command failed from context.
#[derive(Debug)]
struct MissingField;

/// Folds a single decoded command into the pending set, returning `Ok(Some(action))` when
/// the command was a terminator that just committed, `Ok(None)` for a non-terminator or a
/// terminator with nothing to do (e.g. `CLOSING`), and `Err(MissingField)` when a
/// terminator committed without a field the wire spec requires for it.
fn apply_command(pending: &mut PendingCommand, command: Command) -> Result<Option<Action>, MissingField> {
    match command {
        Command::Nullary(opcode::NOP) => Ok(None),
        Command::Nullary(opcode::CLEAR) => {
            pending.clear();
            Ok(None)
        }
        Command::Nullary(opcode::PING) => Ok(Some(Action::Ping)),
        Command::Nullary(opcode::PONG) => Ok(Some(Action::Pong)),
        Command::Nullary(opcode::NOREPLY) => {
            pending.noreply = true;
            Ok(None)
        }
        Command::Nullary(opcode::EXCLUSIVE) => {
            pending.exclusive = true;
            Ok(None)
        }
        Command::Nullary(opcode::CLOSING) => Ok(Some(Action::Closing)),
        Command::Nullary(opcode::REQUEST) => {
            // `take()` rather than `clone()`: `pending.clear()` below would otherwise
            // just drop a redundant copy of the payload buffer a moment later. The
            // pending set's ownership of the payload transfers to the action, matching
            // §4.3's "transferred (not copied)" buffer-ownership rule.
            let result = match (pending.id, pending.payload.take(), pending.qid, pending.queue_name.take()) {
                (Some(id), Some(payload), qid, queue_name) if qid.is_some() || queue_name.is_some() => {
                    Ok(Some(Action::Request { qid, queue_name, id, payload, timeout: pending.timeout }))
                }
                _ => Err(MissingField),
            };
            pending.clear();
            result
        }
        Command::Nullary(opcode::REPLY) => {
            let result = match (pending.id, pending.payload.take()) {
                (Some(id), Some(payload)) => Ok(Some(Action::Reply { id, payload })),
                _ => Err(MissingField),
            };
            pending.clear();
            result
        }
        Command::Nullary(opcode::BROADCAST) => {
            let result = match (pending.payload.take(), pending.qid, pending.queue_name.take()) {
                (Some(payload), qid, queue_name) if qid.is_some() || queue_name.is_some() => {
                    Ok(Some(Action::Broadcast { qid, queue_name, payload }))
                }
                _ => Err(MissingField),
            };
            pending.clear();
            result
        }
        Command::Nullary(opcode::CONSUME) => {
            let result = match pending.queue_name.take() {
                Some(queue_name) => Ok(Some(Action::Consume {
                    queue_name,
                    max: pending.max.unwrap_or(0),
                    priority: pending.priority.unwrap_or(Priority::Normal),
                    exclusive: pending.exclusive,
                })),
                None => Err(MissingField),
            };
            pending.clear();
            result
        }
        Command::Nullary(opcode::CANCEL_QUEUE) => {
            let result = match (pending.qid, pending.queue_name.take()) {
                (None, None) => Err(MissingField),
                (qid, queue_name) => Ok(Some(Action::CancelQueue { qid, queue_name })),
            };
            pending.clear();
            result
        }
        Command::Nullary(opcode::DELIVERED) => {
            let result = match pending.id {
                Some(id) => Ok(Some(Action::Delivered { id })),
                None => Err(MissingField),
            };
            pending.clear();
            result
        }
        Command::Nullary(opcode::CONSUMING) => {
            let result = match (pending.queue_name.take(), pending.qid) {
                (Some(queue_name), Some(qid)) => Ok(Some(Action::Consuming { queue_name, qid })),
                _ => Err(MissingField),
            };
            pending.clear();
            result
        }
        Command::Int(opcode::ID, value) => {
            pending.id = Some(value);
            Ok(None)
        }
        Command::Int(opcode::QUEUEID, value) => {
            pending.qid = Some(value as QueueId);
            Ok(None)
        }
        Command::Int(opcode::TIMEOUT, value) => {
            pending.timeout = Some(value);
            Ok(None)
        }
        Command::Int(opcode::MAX, value) => {
            pending.max = Some(value as u32);
            Ok(None)
        }
        Command::Int(opcode::PRIORITY, value) => {
            pending.priority = Some(Priority::from_wire(value));
            Ok(None)
        }
        Command::Bytes(opcode::QUEUE, data) => {
            pending.queue_name = String::from_utf8(data).ok();
            Ok(None)
        }
        Command::Bytes(opcode::PAYLOAD, data) => {
            pending.payload = Some(data);
            Ok(None)
        }
        _ => Ok(None),
    }
}

impl Buffer {
    /// Ensures the write buffer never silently drops a write because it's full. The
    /// broker's outbound frames are small and bounded, so this is a debug-time guard
    /// rather than a runtime growth path.
    fn ensure_capacity(&self) {
        debug_assert!(self.free_capacity() > 0, "connection write buffer exhausted");
    }
}

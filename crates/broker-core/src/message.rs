//! The message arena. Grounded on the same arena-plus-free-list shape this codebase uses
//! for connection handles (`Vec<T>` + a free list of reusable indices), applied here to
//! messages so ids stay small, dense, and quick to reuse within the 16-bit wire field.

use crate::ids::{ConnectionId, MessageId, QueueId};

/// Where a message sits in its lifecycle: `New` (pending, never yet handed to a
/// consumer) or `Delivering` (handed to a target, awaiting reply/delivered-ack). The
/// terminal `replied`/`delivered` step is release itself — `MessageStore::release` drops
/// the slot rather than passing through an observable terminal state, so there's nothing
/// for a third variant to distinguish.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MessageState {
    New,
    Delivering,
}

#[derive(Debug)]
pub struct Message {
    pub mid: MessageId,
    pub state: MessageState,
    pub broadcast: bool,
    pub noreply: bool,
    pub timed_out: bool,
    pub deadline: Option<std::time::Instant>,
    pub payload: Vec<u8>,
    /// Connection that submitted this message (producer).
    pub origin: ConnectionId,
    /// The id the producer labeled this message with on the wire; echoed back verbatim
    /// in the REPLY frame so the producer can correlate it.
    pub origin_id: u64,
    /// Connection currently holding this message for processing (consumer), once
    /// delivered.
    pub target: Option<ConnectionId>,
    pub queue: QueueId,
}

impl Message {
    fn new(
        mid: MessageId,
        queue: QueueId,
        origin: ConnectionId,
        origin_id: u64,
        payload: Vec<u8>,
        broadcast: bool,
        noreply: bool,
        timeout_secs: Option<u64>,
    ) -> Message {
        Message {
            mid,
            state: MessageState::New,
            broadcast,
            noreply,
            timed_out: false,
            deadline: timeout_secs
                .map(|secs| std::time::Instant::now() + std::time::Duration::from_secs(secs)),
            payload,
            origin,
            origin_id,
            target: None,
            queue,
        }
    }
}

/// Parameters for allocating a new message, collected so `MessageStore::alloc` doesn't
/// need an ever-growing parameter list.
pub struct NewMessage {
    pub queue: QueueId,
    pub origin: ConnectionId,
    pub origin_id: u64,
    pub payload: Vec<u8>,
    pub broadcast: bool,
    pub noreply: bool,
    pub timeout_secs: Option<u64>,
}

/// Indexed table of in-flight messages, with dense low-id reuse via a free list. Message
/// id 0 is never issued (`mid >= 1` per the data model), which lets callers use `0` as a
/// sentinel "no message" value if needed.
pub struct MessageStore {
    slots: Vec<Option<Message>>,
    free: Vec<MessageId>,
}

impl MessageStore {
    pub fn new() -> MessageStore {
        MessageStore {
            slots: vec![None],
            free: Vec::new(),
        }
    }

    pub fn alloc(&mut self, new: NewMessage) -> MessageId {
        let mid = match self.free.pop() {
            Some(id) => id,
            None => {
                let id = self.slots.len() as MessageId;
                self.slots.push(None);
                id
            }
        };

        self.slots[mid as usize] = Some(Message::new(
            mid,
            new.queue,
            new.origin,
            new.origin_id,
            new.payload,
            new.broadcast,
            new.noreply,
            new.timeout_secs,
        ));

        mid
    }

    pub fn get(&self, mid: MessageId) -> Option<&Message> {
        self.slots.get(mid as usize).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, mid: MessageId) -> Option<&mut Message> {
        self.slots.get_mut(mid as usize).and_then(|slot| slot.as_mut())
    }

    /// Releases a message's id and returns its payload buffer so it can go back to the
    /// shared buffer pool. Released ids are reused on the next `alloc`.
    pub fn release(&mut self, mid: MessageId) -> Option<Vec<u8>> {
        let message = self.slots.get_mut(mid as usize)?.take()?;
        self.free.push(mid);
        Some(message.payload)
    }

    pub fn is_active(&self, mid: MessageId) -> bool {
        self.slots.get(mid as usize).map_or(false, |slot| slot.is_some())
    }

    /// All currently active message ids, for the timeout sweep to scan.
    pub fn active_ids(&self) -> impl Iterator<Item = MessageId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|_| idx as MessageId))
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

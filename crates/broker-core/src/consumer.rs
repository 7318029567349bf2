//! Consumer records. Grounded on `rqd/queue.c`'s `node_queue_t { node_t *node; short int
//! priority; int max; int waiting; }` plus its four consumer list heads, generalized here
//! into an explicit `Status` enum rather than four separately-managed linked lists.

use crate::ids::ConnectionId;

/// Dispatch band. The scheduler drains `High` consumers before ever looking at `Normal`,
/// and so on down to `None` — a first-class redesign over the original source, which
/// stored `priority` per-consumer but never used it to order delivery.
#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub enum Priority {
    None,
    Low,
    Normal,
    High,
}

impl Priority {
    pub fn from_wire(value: u64) -> Priority {
        match value {
            0 => Priority::None,
            1 => Priority::Low,
            3 => Priority::High,
            _ => Priority::Normal,
        }
    }

    /// Bands in delivery order: high to low.
    pub const BANDS: [Priority; 4] = [Priority::High, Priority::Normal, Priority::Low, Priority::None];

    /// Inverse of `from_wire`, used when this broker originates a CONSUME (federation
    /// advertisement) rather than decoding one.
    pub fn to_wire(self) -> u64 {
        match self {
            Priority::None => 0,
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
        }
    }
}

/// Which of the queue's three scheduling lists a consumer record currently belongs to.
/// A peer-broker link is *not* a separate list membership — it's an ordinary consumer
/// (usually `Ready`, low priority) that happens to be flagged `federated` so subscribe
/// bookkeeping can tell it apart from a real client when deciding whether to advertise.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Status {
    Ready,
    Busy,
    Waiting,
}

#[derive(Debug, Clone)]
pub struct Consumer {
    pub connection: ConnectionId,
    pub max_outstanding: u32,
    pub priority: Priority,
    pub waiting: u32,
    pub exclusive: bool,
    pub federated: bool,
    pub status: Status,
}

impl Consumer {
    pub fn new(
        connection: ConnectionId,
        max_outstanding: u32,
        priority: Priority,
        exclusive: bool,
        federated: bool,
    ) -> Consumer {
        Consumer {
            connection,
            max_outstanding,
            priority,
            waiting: 0,
            exclusive,
            federated,
            status: Status::Ready,
        }
    }

    /// Unlimited outstanding capacity is modeled as `max_outstanding == 0`.
    pub fn is_bounded(&self) -> bool {
        self.max_outstanding > 0
    }

    pub fn remaining_capacity(&self) -> u32 {
        if self.is_bounded() {
            self.max_outstanding.saturating_sub(self.waiting)
        } else {
            u32::MAX
        }
    }

    pub fn has_capacity(&self) -> bool {
        !self.is_bounded() || self.waiting < self.max_outstanding
    }

    /// Called when a request is handed to this consumer. Moves the consumer to `Busy`
    /// once its window is full.
    pub fn take_delivery(&mut self) {
        self.waiting += 1;
        if self.is_bounded() && self.waiting >= self.max_outstanding {
            self.status = Status::Busy;
        }
    }

    /// Called on reply/delivered-ack. Always moves back to `Ready`: a reply is, by
    /// definition, freeing at least one slot.
    pub fn release_delivery(&mut self) {
        self.waiting = self.waiting.saturating_sub(1);
        self.status = Status::Ready;
    }
}

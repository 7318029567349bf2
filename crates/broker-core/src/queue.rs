//! Queue registry and scheduler. Grounded on `rqd/queue.c`'s `queue_addmsg` /
//! `queue_deliver` / `queue_add_node` / `queue_cancel_node` and its four consumer lists,
//! with two redesigns called out in the specification: name lookup here actually
//! implements the move-to-front optimization the original source only comments on, and
//! `priority` is a first-class dispatch band rather than a stored-but-unused field.

use crate::consumer::{Consumer, Priority, Status};
use crate::ids::{ConnectionId, MessageId, QueueId};
use crate::message::{MessageState, MessageStore, NewMessage};
use std::collections::VecDeque;

/// Side effects the scheduler wants carried out against the outside world (sending
/// frames, reclaiming buffers). Keeping these as data rather than direct I/O calls is
/// what makes the scheduler unit-testable without a real socket.
#[derive(Debug, Eq, PartialEq)]
pub enum Effect {
    /// Deliver a REQUEST to a consumer.
    Deliver {
        connection: ConnectionId,
        qid: QueueId,
        mid: MessageId,
        payload: Vec<u8>,
    },
    /// Fan out a BROADCAST to a consumer (no outstanding-window bookkeeping).
    Broadcast {
        connection: ConnectionId,
        payload: Vec<u8>,
    },
    /// Route a REPLY back to the producer that submitted the original REQUEST.
    Reply {
        connection: ConnectionId,
        origin_id: u64,
        payload: Vec<u8>,
    },
    /// Acknowledge a successful CONSUME.
    Consuming {
        connection: ConnectionId,
        queue: String,
        qid: QueueId,
    },
    /// A message could not be delivered (timed out, or its target vanished).
    Undelivered { connection: ConnectionId, origin_id: u64 },
    /// A queue gained (or kept) its first non-federated consumer; federation should
    /// advertise this subscription to peer brokers.
    AdvertiseConsume { queue: String },
}

pub struct Queue {
    pub qid: QueueId,
    pub name: String,
    pub exclusive: bool,
    consumers: Vec<Consumer>,
    pending: VecDeque<MessageId>,
    in_flight: Vec<MessageId>,
}

impl Queue {
    fn new(qid: QueueId, name: String) -> Queue {
        Queue {
            qid,
            name,
            exclusive: false,
            consumers: Vec::new(),
            pending: VecDeque::new(),
            in_flight: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty() && self.pending.is_empty() && self.in_flight.is_empty()
    }

    fn has_exclusive_holder(&self) -> bool {
        self.consumers
            .iter()
            .any(|c| c.exclusive && matches!(c.status, Status::Ready | Status::Busy))
    }
}

pub struct QueueRegistry {
    queues: std::collections::HashMap<QueueId, Queue>,
    /// Name lookup cache: linear scan, with the found entry moved to the front so
    /// repeatedly-addressed queues stay cheap to find.
    name_cache: Vec<(String, QueueId)>,
    next_qid: QueueId,
}

impl QueueRegistry {
    pub fn new() -> QueueRegistry {
        QueueRegistry {
            queues: std::collections::HashMap::new(),
            name_cache: Vec::new(),
            next_qid: 1,
        }
    }

    pub fn get(&self, qid: QueueId) -> Option<&Queue> {
        self.queues.get(&qid)
    }

    /// Looks up a queue by name, moving the match to the front of the cache on success.
    pub fn find_by_name(&mut self, name: &str) -> Option<QueueId> {
        let pos = self.name_cache.iter().position(|(n, _)| n == name)?;
        let entry = self.name_cache.remove(pos);
        let qid = entry.1;
        self.name_cache.insert(0, entry);
        Some(qid)
    }

    /// Looks up a queue by name, creating it (with a freshly allocated `qid`, never
    /// reused across the broker's lifetime) if it doesn't exist yet.
    pub fn find_or_create(&mut self, name: &str) -> QueueId {
        if let Some(qid) = self.find_by_name(name) {
            return qid;
        }

        let qid = self.next_qid;
        self.next_qid += 1;
        self.queues.insert(qid, Queue::new(qid, name.to_string()));
        self.name_cache.insert(0, (name.to_string(), qid));
        qid
    }

    /// Resolves a `qid`/name pair to an already-existing queue, never creating one.
    /// CANCEL_QUEUE (unlike REQUEST/BROADCAST/CONSUME) must not conjure a queue into
    /// existence just by naming it.
    pub fn find_existing(&mut self, qid: Option<QueueId>, name: Option<&str>) -> Option<QueueId> {
        match (qid, name) {
            (Some(qid), _) if self.queues.contains_key(&qid) => Some(qid),
            (Some(_), _) => None,
            (None, Some(name)) => self.find_by_name(name),
            (None, None) => None,
        }
    }

    /// Queue names this broker currently has at least one non-federated consumer on —
    /// what a peer broker that just (re)connected should immediately be told about
    /// (§4.5's "replay of current consumes").
    pub fn locally_consumed_queue_names(&self) -> Vec<String> {
        self.queues
            .values()
            .filter(|q| q.consumers.iter().any(|c| !c.federated))
            .map(|q| q.name.clone())
            .collect()
    }

    /// Clears the move-to-front cache without touching any queue state. This is the
    /// SIGHUP hook: there's no config file to reload, so SIGHUP just drops this
    /// transient cache and lets it rebuild from the (unaffected) registry.
    pub fn clear_name_cache(&mut self) {
        self.name_cache.clear();
        for (qid, queue) in self.queues.iter() {
            self.name_cache.push((queue.name.clone(), *qid));
        }
    }

    /// Subscribes `connection` to `qid`. Pushes `Consuming` (and, for the queue's first
    /// non-federated consumer, `AdvertiseConsume`) to `effects` on success; pushes
    /// nothing when the subscription is deferred behind an exclusive holder.
    pub fn subscribe(
        &mut self,
        qid: QueueId,
        connection: ConnectionId,
        max_outstanding: u32,
        priority: Priority,
        exclusive: bool,
        federated: bool,
        effects: &mut Vec<Effect>,
    ) {
        let queue = match self.queues.get_mut(&qid) {
            Some(q) => q,
            None => return,
        };

        let mut consumer = Consumer::new(connection, max_outstanding, priority, exclusive, federated);

        let deferred = !federated
            && (queue.has_exclusive_holder() || (exclusive && !queue.consumers.is_empty()));

        if deferred {
            consumer.status = Status::Waiting;
            queue.consumers.push(consumer);
            return;
        }

        let first_real_consumer = !queue.consumers.iter().any(|c| !c.federated);

        if exclusive {
            queue.exclusive = true;
        }

        queue.consumers.push(consumer);
        effects.push(Effect::Consuming {
            connection,
            queue: queue.name.clone(),
            qid,
        });

        if first_real_consumer {
            effects.push(Effect::AdvertiseConsume {
                queue: queue.name.clone(),
            });
        }
    }

    /// Commits a REQUEST: allocates the message (done by the caller, who passes the
    /// already-allocated `mid`) onto `qid`'s pending list and attempts delivery.
    pub fn submit_request(
        &mut self,
        qid: QueueId,
        mid: MessageId,
        store: &mut MessageStore,
        effects: &mut Vec<Effect>,
    ) {
        if let Some(queue) = self.queues.get_mut(&qid) {
            queue.pending.push_back(mid);
        }
        self.deliver(qid, store, effects);
    }

    /// Commits a BROADCAST: fans out immediately to every currently-ready consumer.
    /// Unlike REQUEST, this never touches `waiting`/`busy` bookkeeping and a broadcast
    /// with no ready consumers is simply dropped (an explicit SPEC_FULL.md §9 decision,
    /// not a bug — the original source only comments on queuing broadcasts for later).
    pub fn submit_broadcast(
        &mut self,
        qid: QueueId,
        mid: MessageId,
        store: &mut MessageStore,
        effects: &mut Vec<Effect>,
    ) {
        let payload = match store.get(mid) {
            Some(message) => message.payload.clone(),
            None => return,
        };

        if let Some(queue) = self.queues.get(&qid) {
            for consumer in queue
                .consumers
                .iter()
                .filter(|c| matches!(c.status, Status::Ready))
            {
                effects.push(Effect::Broadcast {
                    connection: consumer.connection,
                    payload: payload.clone(),
                });
            }
        }

        store.release(mid);
    }

    /// Attempts to deliver as many pending messages on `qid` as there are ready
    /// consumers for, highest priority band first.
    pub fn deliver(&mut self, qid: QueueId, store: &mut MessageStore, effects: &mut Vec<Effect>) {
        let queue = match self.queues.get_mut(&qid) {
            Some(q) => q,
            None => return,
        };

        loop {
            if queue.pending.is_empty() {
                break;
            }

            let consumer_idx = Self::pick_ready_consumer(queue);
            let consumer_idx = match consumer_idx {
                Some(idx) => idx,
                None => break,
            };

            let mid = queue.pending.pop_front().expect("checked non-empty above");

            let payload = match store.get(mid) {
                Some(message) => message.payload.clone(),
                None => continue,
            };

            let consumer = &mut queue.consumers[consumer_idx];
            consumer.take_delivery();
            let connection = consumer.connection;

            if let Some(message) = store.get_mut(mid) {
                message.state = MessageState::Delivering;
                message.target = Some(connection);
            }
            queue.in_flight.push(mid);

            effects.push(Effect::Deliver {
                connection,
                qid,
                mid,
                payload,
            });
        }
    }

    /// Finds the best ready consumer to hand the next pending message to: the highest
    /// non-empty priority band, then the consumer with the most remaining capacity
    /// within that band (ties broken by list order).
    fn pick_ready_consumer(queue: &Queue) -> Option<usize> {
        for band in Priority::BANDS.iter() {
            let mut best: Option<(usize, u32)> = None;
            for (idx, consumer) in queue.consumers.iter().enumerate() {
                if consumer.status != Status::Ready || consumer.priority != *band {
                    continue;
                }
                let capacity = consumer.remaining_capacity();
                if best.map_or(true, |(_, best_cap)| capacity > best_cap) {
                    best = Some((idx, capacity));
                }
            }
            if let Some((idx, _)) = best {
                return Some(idx);
            }
        }
        None
    }

    /// Commits a REPLY: validates `connection` is the message's current target, routes
    /// the reply payload back to the origin, frees the consumer's window slot, and
    /// pumps delivery again in case freeing that slot lets another pending message go
    /// out.
    pub fn reply(
        &mut self,
        connection: ConnectionId,
        mid: MessageId,
        store: &mut MessageStore,
        effects: &mut Vec<Effect>,
    ) -> Option<Vec<u8>> {
        let message = store.get(mid)?;
        if message.target != Some(connection) {
            return None;
        }

        let qid = message.queue;
        let origin = message.origin;
        let origin_id = message.origin_id;
        let noreply = message.noreply;

        if !noreply {
            effects.push(Effect::Reply {
                connection: origin,
                origin_id,
                payload: message.payload.clone(),
            });
        }

        self.finish_delivery(qid, connection, mid, store, effects)
    }

    /// Commits a DELIVERED acknowledgement for a `noreply` message: same bookkeeping as
    /// `reply` but without emitting a reply frame (there's nothing to reply with).
    pub fn delivered(
        &mut self,
        connection: ConnectionId,
        mid: MessageId,
        store: &mut MessageStore,
        effects: &mut Vec<Effect>,
    ) -> Option<Vec<u8>> {
        let message = store.get(mid)?;
        if message.target != Some(connection) {
            return None;
        }
        let qid = message.queue;
        self.finish_delivery(qid, connection, mid, store, effects)
    }

    fn finish_delivery(
        &mut self,
        qid: QueueId,
        connection: ConnectionId,
        mid: MessageId,
        store: &mut MessageStore,
        effects: &mut Vec<Effect>,
    ) -> Option<Vec<u8>> {
        if let Some(queue) = self.queues.get_mut(&qid) {
            queue.in_flight.retain(|&m| m != mid);
            if let Some(consumer) = queue.consumers.iter_mut().find(|c| c.connection == connection) {
                consumer.release_delivery();
            }
        }

        let payload = store.release(mid);
        self.deliver(qid, store, effects);
        payload
    }

    /// Handles a message's timeout (§5): removes it from whichever list currently holds
    /// it and, if it had already been handed to a consumer, frees that consumer's window
    /// slot so the timeout doesn't permanently eat into its `max_outstanding` capacity.
    /// Does not release the message itself or emit `Undelivered` — the caller (which
    /// already has the origin/origin_id pulled out of the message before releasing it)
    /// does both, same as every other path that ends a message's life.
    pub fn expire_message(&mut self, mid: MessageId, store: &mut MessageStore, effects: &mut Vec<Effect>) {
        let (qid, target) = match store.get(mid) {
            Some(message) => (message.queue, message.target),
            None => return,
        };

        if let Some(queue) = self.queues.get_mut(&qid) {
            queue.pending.retain(|&m| m != mid);
            queue.in_flight.retain(|&m| m != mid);
            if let Some(connection) = target {
                if let Some(consumer) = queue.consumers.iter_mut().find(|c| c.connection == connection) {
                    consumer.release_delivery();
                }
            }
        }

        self.deliver(qid, store, effects);
    }

    /// Unsubscribes `connection` from every queue it's a consumer on, promoting a
    /// waiting exclusive holder if one exists, and resolves every message this
    /// connection was holding as a target or producing as an origin. Returns any
    /// payload buffers released as a result, so the caller can return them to the pool.
    pub fn cancel_connection(
        &mut self,
        connection: ConnectionId,
        store: &mut MessageStore,
        effects: &mut Vec<Effect>,
    ) -> Vec<Vec<u8>> {
        let mut released = Vec::new();
        let qids: Vec<QueueId> = self.queues.keys().copied().collect();

        for qid in qids {
            self.cancel_connection_on_queue(qid, connection, store, effects, &mut released);
        }

        self.queues.retain(|_, queue| !queue.is_empty());
        self.name_cache.retain(|(_, qid)| self.queues.contains_key(qid));

        released
    }

    /// Unsubscribes `connection` from a single queue (CANCEL_QUEUE), not every queue it
    /// consumes from. `qid` must already exist — resolve it with `find_existing` first.
    pub fn unsubscribe(
        &mut self,
        qid: QueueId,
        connection: ConnectionId,
        store: &mut MessageStore,
        effects: &mut Vec<Effect>,
    ) -> Vec<Vec<u8>> {
        let mut released = Vec::new();
        self.cancel_connection_on_queue(qid, connection, store, effects, &mut released);
        self.queues.retain(|_, queue| !queue.is_empty());
        self.name_cache.retain(|(_, qid)| self.queues.contains_key(qid));
        released
    }

    fn cancel_connection_on_queue(
        &mut self,
        qid: QueueId,
        connection: ConnectionId,
        store: &mut MessageStore,
        effects: &mut Vec<Effect>,
        released: &mut Vec<Vec<u8>>,
    ) {
        let queue = match self.queues.get_mut(&qid) {
            Some(q) => q,
            None => return,
        };

        if let Some(idx) = queue.consumers.iter().position(|c| c.connection == connection) {
            let consumer = queue.consumers.remove(idx);

            if consumer.exclusive && queue.exclusive {
                queue.exclusive = false;
                if let Some(w_idx) = queue.consumers.iter().position(|c| c.status == Status::Waiting) {
                    queue.consumers[w_idx].status = Status::Ready;
                    queue.exclusive = true;
                    effects.push(Effect::Consuming {
                        connection: queue.consumers[w_idx].connection,
                        queue: queue.name.clone(),
                        qid,
                    });
                }
            }
        }

        // Messages this connection was serving as a consumer: redeliver only if the
        // message still expects a reply *and* another ready consumer remains to pick it
        // up; otherwise nobody can ever complete it, so tell the origin it went
        // undelivered. A `noreply` message always takes the undelivered path — it was
        // fire-and-forget to begin with, there is no second consumer attempt for it.
        let has_ready_consumer = queue.consumers.iter().any(|c| c.status == Status::Ready);

        let mut requeue = Vec::new();
        queue.in_flight.retain(|&mid| {
            if store.get(mid).map_or(false, |m| m.target == Some(connection)) {
                requeue.push(mid);
                false
            } else {
                true
            }
        });

        for mid in requeue {
            let (noreply, origin, origin_id) = match store.get_mut(mid) {
                Some(message) => {
                    message.target = None;
                    message.state = MessageState::New;
                    (message.noreply, message.origin, message.origin_id)
                }
                None => continue,
            };

            if noreply || !has_ready_consumer {
                effects.push(Effect::Undelivered { connection: origin, origin_id });
                if let Some(payload) = store.release(mid) {
                    released.push(payload);
                }
            } else {
                queue.pending.push_front(mid);
            }
        }

        // Messages this connection submitted as a producer and are still waiting for a
        // consumer: nobody can collect the reply anymore, so drop them rather than
        // leaving them pending forever.
        let mut abandon = Vec::new();
        queue.pending.retain(|&mid| {
            if store.get(mid).map_or(false, |m| m.origin == connection) {
                abandon.push(mid);
                false
            } else {
                true
            }
        });
        for mid in abandon {
            if let Some(payload) = store.release(mid) {
                released.push(payload);
            }
        }

        self.deliver(qid, store, effects);
    }
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NewMessage;

    fn submit(
        registry: &mut QueueRegistry,
        store: &mut MessageStore,
        qid: QueueId,
        origin: ConnectionId,
        origin_id: u64,
        payload: &[u8],
    ) -> MessageId {
        let mid = store.alloc(NewMessage {
            queue: qid,
            origin,
            origin_id,
            payload: payload.to_vec(),
            broadcast: false,
            noreply: false,
            timeout_secs: None,
        });
        let mut effects = Vec::new();
        registry.submit_request(qid, mid, store, &mut effects);
        mid
    }

    #[test]
    fn simple_request_reply() {
        let mut registry = QueueRegistry::new();
        let mut store = MessageStore::new();
        let qid = registry.find_or_create("work");

        let mut effects = Vec::new();
        registry.subscribe(qid, 2, 0, Priority::Normal, false, false, &mut effects);
        assert!(matches!(effects[0], Effect::Consuming { connection: 2, .. }));

        effects.clear();
        let mid = submit(&mut registry, &mut store, qid, 1, 99, b"ping");
        assert_eq!(
            effects,
            vec![Effect::Deliver {
                connection: 2,
                qid,
                mid,
                payload: b"ping".to_vec(),
            }]
        );

        effects.clear();
        registry.reply(2, mid, &mut store, &mut effects);
        assert_eq!(
            effects,
            vec![Effect::Reply {
                connection: 1,
                origin_id: 99,
                payload: b"ping".to_vec(),
            }]
        );
        assert!(!store.is_active(mid));
    }

    #[test]
    fn broadcast_fans_out_without_incrementing_waiting() {
        let mut registry = QueueRegistry::new();
        let mut store = MessageStore::new();
        let qid = registry.find_or_create("bus");

        let mut effects = Vec::new();
        registry.subscribe(qid, 10, 0, Priority::Normal, false, false, &mut effects);
        registry.subscribe(qid, 11, 0, Priority::Normal, false, false, &mut effects);
        effects.clear();

        let mid = store.alloc(NewMessage {
            queue: qid,
            origin: 1,
            origin_id: 0,
            payload: b"hi".to_vec(),
            broadcast: true,
            noreply: true,
            timeout_secs: None,
        });
        registry.submit_broadcast(qid, mid, &mut store, &mut effects);

        assert_eq!(effects.len(), 2);
        assert!(effects.contains(&Effect::Broadcast { connection: 10, payload: b"hi".to_vec() }));
        assert!(effects.contains(&Effect::Broadcast { connection: 11, payload: b"hi".to_vec() }));
        assert!(!store.is_active(mid));
    }

    #[test]
    fn exclusive_contention_defers_second_subscriber() {
        let mut registry = QueueRegistry::new();
        let mut store = MessageStore::new();
        let qid = registry.find_or_create("ex");

        let mut effects = Vec::new();
        registry.subscribe(qid, 1, 0, Priority::Normal, true, false, &mut effects);
        assert_eq!(effects.len(), 2); // Consuming + AdvertiseConsume

        effects.clear();
        registry.subscribe(qid, 2, 0, Priority::Normal, true, false, &mut effects);
        assert!(effects.is_empty());

        effects.clear();
        let released = registry.cancel_connection(1, &mut store, &mut effects);
        assert!(released.is_empty());
        assert_eq!(
            effects,
            vec![Effect::Consuming {
                connection: 2,
                queue: "ex".to_string(),
                qid,
            }]
        );
    }

    #[test]
    fn max_outstanding_throttles_delivery() {
        let mut registry = QueueRegistry::new();
        let mut store = MessageStore::new();
        let qid = registry.find_or_create("bounded");

        let mut effects = Vec::new();
        registry.subscribe(qid, 5, 2, Priority::Normal, false, false, &mut effects);
        effects.clear();

        let mut mids = Vec::new();
        for i in 0..5 {
            mids.push(submit(&mut registry, &mut store, qid, 1, i, b"x"));
        }

        let deliveries: Vec<_> = std::mem::take(&mut effects);
        // Only two requests were submitted through `submit`, which drains effects each
        // call; re-collect by resubmitting through the registry's own bookkeeping.
        let _ = deliveries;

        // Re-derive: after five submits with max=2, exactly two should be in-flight.
        assert_eq!(
            registry.queues.get(&qid).unwrap().in_flight.len(),
            2,
            "only two requests should be outstanding with max_outstanding=2"
        );

        registry.reply(5, mids[0], &mut store, &mut effects);
        assert_eq!(registry.queues.get(&qid).unwrap().in_flight.len(), 2);
    }

    #[test]
    fn expiring_an_in_flight_message_frees_the_consumer_slot() {
        let mut registry = QueueRegistry::new();
        let mut store = MessageStore::new();
        let qid = registry.find_or_create("bounded");

        let mut effects = Vec::new();
        registry.subscribe(qid, 2, 1, Priority::Normal, false, false, &mut effects);
        effects.clear();

        let first = submit(&mut registry, &mut store, qid, 1, 1, b"a");
        assert_eq!(registry.get(qid).unwrap().in_flight.len(), 1);

        // Consumer is bounded to one outstanding message; a second REQUEST queues but
        // can't be delivered until the first is resolved one way or another.
        let second = submit(&mut registry, &mut store, qid, 1, 2, b"b");
        assert_eq!(registry.get(qid).unwrap().in_flight.len(), 1);

        effects.clear();
        registry.expire_message(first, &mut store, &mut effects);
        store.release(first);

        // Freeing the slot should have let the second message go out immediately.
        assert_eq!(
            effects,
            vec![Effect::Deliver { connection: 2, qid, mid: second, payload: b"b".to_vec() }]
        );
        assert_eq!(registry.get(qid).unwrap().in_flight.len(), 1);
        assert!(registry.get(qid).unwrap().in_flight.contains(&second));
    }

    #[test]
    fn disconnecting_target_returns_undelivered() {
        let mut registry = QueueRegistry::new();
        let mut store = MessageStore::new();
        let qid = registry.find_or_create("work");

        let mut effects = Vec::new();
        registry.subscribe(qid, 2, 0, Priority::Normal, false, false, &mut effects);
        effects.clear();

        let mid = store.alloc(NewMessage {
            queue: qid,
            origin: 1,
            origin_id: 7,
            payload: b"data".to_vec(),
            broadcast: false,
            noreply: true,
            timeout_secs: None,
        });
        registry.submit_request(qid, mid, &mut store, &mut effects);
        effects.clear();

        registry.cancel_connection(2, &mut store, &mut effects);
        assert_eq!(effects, vec![Effect::Undelivered { connection: 1, origin_id: 7 }]);
    }
}

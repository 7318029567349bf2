//! Message timeout sweep. Grounded on the periodic-sweep shape of this codebase's
//! `Endpoint::housekeeping`, applied here to message deadlines instead of connection
//! liveness. A simple linear sweep over the message store, rather than a true
//! hierarchical timing wheel — the message counts this broker is sized for don't justify
//! the extra structure, and a sweep is trivially correct to reason about.

use crate::ids::MessageId;
use crate::message::MessageStore;
use std::time::Instant;

/// Scans every active message with a deadline and returns the ids whose deadline has
/// passed. Does not mutate the store; the caller is responsible for acting on each
/// expired id (notifying the origin, releasing the message) through the same queue
/// machinery a normal reply would use, so the two paths can't diverge.
pub fn sweep_expired(store: &MessageStore, now: Instant, ids: impl Iterator<Item = MessageId>) -> Vec<MessageId> {
    ids.filter(|&mid| {
        store
            .get(mid)
            .and_then(|m| m.deadline)
            .map_or(false, |deadline| deadline <= now)
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NewMessage;
    use std::time::Duration;

    #[test]
    fn finds_only_expired_messages() {
        let mut store = MessageStore::new();
        let expired = store.alloc(NewMessage {
            queue: 1,
            origin: 0,
            origin_id: 0,
            payload: Vec::new(),
            broadcast: false,
            noreply: false,
            timeout_secs: Some(0),
        });
        let alive = store.alloc(NewMessage {
            queue: 1,
            origin: 0,
            origin_id: 0,
            payload: Vec::new(),
            broadcast: false,
            noreply: false,
            timeout_secs: Some(3600),
        });

        std::thread::sleep(Duration::from_millis(10));
        let now = Instant::now();
        let ids = vec![expired, alive].into_iter();
        let found = sweep_expired(&store, now, ids);

        assert_eq!(found, vec![expired]);
    }

    #[test]
    fn messages_without_a_deadline_never_expire() {
        let mut store = MessageStore::new();
        let mid = store.alloc(NewMessage {
            queue: 1,
            origin: 0,
            origin_id: 0,
            payload: Vec::new(),
            broadcast: false,
            noreply: false,
            timeout_secs: None,
        });
        let found = sweep_expired(&store, Instant::now() + Duration::from_secs(9999), vec![mid].into_iter());
        assert!(found.is_empty());
    }
}

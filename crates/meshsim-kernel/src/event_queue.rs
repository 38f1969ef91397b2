//! Event queue with deterministic ordering and cancellation.

use meshsim_core::{EventId, SimTime};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// Priority of an event among events due at the same time. Higher runs first.
pub type Priority = i32;

/// Key for ordering events in the queue.
///
/// Events are ordered by:
/// 1. Time (earlier first)
/// 2. Priority (higher first)
/// 3. Sequence number (FIFO for same time/priority)
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct EventKey {
    pub time: SimTime,
    pub priority: Priority,
    pub sequence: u64,
}

impl Ord for EventKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.time.cmp(&other.time) {
            Ordering::Equal => {}
            ord => return ord,
        }

        match other.priority.cmp(&self.priority) {
            Ordering::Equal => {}
            ord => return ord,
        }

        self.sequence.cmp(&other.sequence)
    }
}

impl PartialOrd for EventKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending events of one simulation run.
#[derive(Debug)]
pub struct EventQueue<E> {
    now: SimTime,
    next_sequence: u64,
    events: BTreeMap<EventKey, E>,
    /// Lookup for cancellation; the event id is the key's sequence number.
    keys: HashMap<EventId, EventKey>,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        Self {
            now: SimTime::ZERO,
            next_sequence: 0,
            events: BTreeMap::new(),
            keys: HashMap::new(),
        }
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Schedule an event at an absolute time. Times in the past are clamped to now.
    pub fn schedule_at(&mut self, time: SimTime, priority: Priority, event: E) -> EventId {
        let time = if time < self.now {
            warn!(at = %time, now = %self.now, "event scheduled in the past, clamping");
            self.now
        } else {
            time
        };
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let key = EventKey {
            time,
            priority,
            sequence,
        };
        let id = EventId(sequence);
        self.events.insert(key, event);
        self.keys.insert(id, key);
        id
    }

    pub fn schedule_in(&mut self, delay: f64, priority: Priority, event: E) -> EventId {
        let delay = if delay.is_finite() && delay > 0.0 { delay } else { 0.0 };
        self.schedule_at(self.now + delay, priority, event)
    }

    /// Remove a pending event. Returns `false` if it already ran or was cancelled.
    pub fn cancel(&mut self, id: EventId) -> bool {
        match self.keys.remove(&id) {
            Some(key) => self.events.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn is_scheduled(&self, id: EventId) -> bool {
        self.keys.contains_key(&id)
    }

    pub fn peek_time(&self) -> Option<SimTime> {
        self.events.keys().next().map(|k| k.time)
    }

    /// Take the next event and advance the clock to its time.
    pub fn pop_next(&mut self) -> Option<(EventId, E)> {
        let (key, event) = self.events.pop_first()?;
        let id = EventId(key.sequence);
        self.keys.remove(&id);
        self.now = key.time;
        Some((id, event))
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_key_ordering() {
        let earlier = EventKey {
            time: SimTime(1.0),
            priority: 0,
            sequence: 2,
        };
        let later = EventKey {
            time: SimTime(2.0),
            priority: 10,
            sequence: 1,
        };
        assert!(earlier < later);
    }

    #[test]
    fn test_priority_ordering_at_same_time() {
        let high = EventKey {
            time: SimTime(1.0),
            priority: 10,
            sequence: 5,
        };
        let low = EventKey {
            time: SimTime(1.0),
            priority: -5,
            sequence: 1,
        };
        assert!(high < low, "higher priority should process first");
    }

    #[test]
    fn test_fifo_for_equal_time_and_priority() {
        let mut queue = EventQueue::new();
        queue.schedule_at(SimTime(1.0), 0, "a");
        queue.schedule_at(SimTime(1.0), 0, "b");
        queue.schedule_at(SimTime(0.5), 0, "c");
        let order: Vec<&str> = std::iter::from_fn(|| queue.pop_next().map(|(_, e)| e)).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
        assert_eq!(queue.now(), SimTime(1.0));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut queue = EventQueue::new();
        let id = queue.schedule_in(1.0, 0, ());
        assert!(queue.is_scheduled(id));
        assert!(queue.cancel(id));
        assert!(!queue.cancel(id));
        assert!(!queue.is_scheduled(id));
        assert!(queue.pop_next().is_none());
    }

    #[test]
    fn test_cancel_after_run_is_noop() {
        let mut queue = EventQueue::new();
        let id = queue.schedule_in(0.0, 0, 1u8);
        assert_eq!(queue.pop_next(), Some((id, 1u8)));
        assert!(!queue.cancel(id));
    }

    #[test]
    fn test_schedule_in_is_relative_to_now() {
        let mut queue = EventQueue::new();
        queue.schedule_at(SimTime(2.0), 0, 0u32);
        queue.pop_next();
        queue.schedule_in(0.5, 0, 1u32);
        queue.schedule_at(SimTime(1.0), 0, 2u32);
        assert_eq!(queue.pop_next().map(|(_, e)| e), Some(2));
        assert_eq!(queue.now(), SimTime(2.0));
        assert_eq!(queue.pop_next().map(|(_, e)| e), Some(1));
        assert_eq!(queue.now(), SimTime(2.5));
    }
}

//! Deadline service shared by all protocol correlators.
//!
//! Timers never run callbacks. The engine polls for expired entries on its
//! own tick and routes each fired key back to the owning transaction map,
//! which deletes the entry only if it is still the one the timer was armed
//! for. Cancellation is O(1); the heap entry it leaves behind is skipped
//! when it eventually surfaces.

use crate::net::{FourTuple, Protocol};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use time::OffsetDateTime;

/// Opaque handle to a scheduled deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// What a fired deadline points back at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerKey {
    pub protocol: Protocol,
    pub tuple: FourTuple,
}

#[derive(Debug, Default)]
pub struct TimerService {
    heap: BinaryHeap<Reverse<(OffsetDateTime, u64)>>,
    live: HashMap<u64, TimerKey>,
    next_id: u64,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: OffsetDateTime, key: TimerKey) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id, key);
        self.heap.push(Reverse((deadline, id)));
        TimerId(id)
    }

    /// Cancel a scheduled deadline. Returns false if it already fired or
    /// was cancelled before.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.live.remove(&id.0).is_some()
    }

    /// Pop every deadline at or before `now`.
    pub fn poll_expired(&mut self, now: OffsetDateTime) -> Vec<(TimerId, TimerKey)> {
        let mut fired = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(key) = self.live.remove(&id) {
                fired.push((TimerId(id), key));
            }
        }
        fired
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }

    /// Number of armed (not yet fired or cancelled) deadlines.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::net::IpPortTuple;
    use std::net::{IpAddr, Ipv4Addr};
    use time::Duration;

    fn key(stream_id: u64) -> TimerKey {
        TimerKey {
            protocol: Protocol::Http,
            tuple: FourTuple {
                ip: IpPortTuple::new(
                    IpAddr::V4(Ipv4Addr::LOCALHOST),
                    1,
                    IpAddr::V4(Ipv4Addr::LOCALHOST),
                    2,
                ),
                stream_id,
            },
        }
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut timers = TimerService::new();
        let t0 = OffsetDateTime::UNIX_EPOCH;
        timers.schedule(t0 + Duration::seconds(10), key(1));
        timers.schedule(t0 + Duration::seconds(5), key(2));

        assert!(timers.poll_expired(t0 + Duration::seconds(4)).is_empty());
        let fired = timers.poll_expired(t0 + Duration::seconds(7));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1.tuple.stream_id, 2);
        let fired = timers.poll_expired(t0 + Duration::seconds(20));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1.tuple.stream_id, 1);
        assert!(timers.is_empty());
    }

    #[test]
    fn cancelled_deadlines_never_fire() {
        let mut timers = TimerService::new();
        let t0 = OffsetDateTime::UNIX_EPOCH;
        let id = timers.schedule(t0 + Duration::seconds(1), key(1));
        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
        assert!(timers.poll_expired(t0 + Duration::seconds(2)).is_empty());
    }
}

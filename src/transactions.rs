//! Request/response correlation.
//!
//! Each protocol analyzer owns one `TransactionMap` keyed by flow
//! identity. A completed request arms a deadline in the shared timer
//! service; the matching response (or the deadline) resolves the entry.
//! At most one request is in flight per flow and protocol.

use crate::net::{FourTuple, Protocol};
use crate::timer::{TimerId, TimerKey, TimerService};
use std::collections::HashMap;
use time::{Duration, OffsetDateTime};

/// A request waiting for its response.
#[derive(Debug)]
pub struct Pending<R> {
    pub request: R,
    pub ts: OffsetDateTime,
    timer: TimerId,
}

impl<R> Pending<R> {
    /// Milliseconds between the request and `response_ts`, floored at 0.
    pub fn response_time_ms(&self, response_ts: OffsetDateTime) -> i64 {
        (response_ts - self.ts).whole_milliseconds().max(0) as i64
    }
}

#[derive(Debug)]
pub struct TransactionMap<R> {
    protocol: Protocol,
    timeout: Duration,
    pending: HashMap<FourTuple, Pending<R>>,
}

impl<R> TransactionMap<R> {
    pub fn new(protocol: Protocol, timeout: Duration) -> Self {
        Self {
            protocol,
            timeout,
            pending: HashMap::new(),
        }
    }

    /// Register a completed request and arm its deadline.
    ///
    /// Returns true when an unanswered request was replaced; its timer is
    /// cancelled so only the new deadline can fire.
    pub fn begin(
        &mut self,
        tuple: FourTuple,
        request: R,
        ts: OffsetDateTime,
        timers: &mut TimerService,
    ) -> bool {
        let timer = timers.schedule(
            ts + self.timeout,
            TimerKey {
                protocol: self.protocol,
                tuple,
            },
        );
        let replaced = self.pending.insert(tuple, Pending { request, ts, timer });
        if let Some(old) = &replaced {
            timers.cancel(old.timer);
        }
        replaced.is_some()
    }

    /// Match a response against the pending request, cancelling its timer.
    pub fn resolve(
        &mut self,
        tuple: &FourTuple,
        timers: &mut TimerService,
    ) -> Option<Pending<R>> {
        let pending = self.pending.remove(tuple)?;
        timers.cancel(pending.timer);
        Some(pending)
    }

    /// Handle a fired deadline: delete the entry if it is still the one
    /// the timer was armed for. No event is emitted.
    pub fn expire(&mut self, tuple: &FourTuple, timer: TimerId) -> bool {
        match self.pending.get(tuple) {
            Some(pending) if pending.timer == timer => {
                self.pending.remove(tuple);
                true
            }
            _ => false,
        }
    }

    /// Drop every pending entry and cancel its timer.
    pub fn clear(&mut self, timers: &mut TimerService) {
        for (_, pending) in self.pending.drain() {
            timers.cancel(pending.timer);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

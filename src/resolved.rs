use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use crate::protocol::RequestId;

/// How a call left the correlation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Completed,
    TimedOut,
}

/// Short memory of recently resolved request ids.
///
/// Only used to tell a late or duplicate completion apart from one for an
/// id the relay never saw. Entries age out after `ttl` and the map never
/// holds more than `max_entries`.
#[derive(Debug)]
pub struct ResolvedLedger {
    ttl: Duration,
    max_entries: usize,
    seen: HashMap<RequestId, (Resolution, Instant)>,
    order: VecDeque<(RequestId, Instant)>,
}

impl ResolvedLedger {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn record(&mut self, id: RequestId, resolution: Resolution, now: Instant) {
        self.evict(now);
        if self.seen.insert(id.clone(), (resolution, now)).is_some() {
            // Re-resolution of a reused id: drop the stale order slot.
            self.order.retain(|(existing, _)| existing != &id);
        }
        self.order.push_back((id, now));

        while self.seen.len() > self.max_entries {
            if let Some((old_id, _)) = self.order.pop_front() {
                self.seen.remove(&old_id);
            }
        }

        debug_assert_eq!(
            self.seen.len(),
            self.order.len(),
            "ResolvedLedger: HashMap and VecDeque out of sync"
        );
    }

    pub fn lookup(&mut self, id: &RequestId, now: Instant) -> Option<Resolution> {
        self.evict(now);
        self.seen.get(id).map(|(resolution, _)| *resolution)
    }

    fn evict(&mut self, now: Instant) {
        while let Some((id, ts)) = self.order.front().cloned() {
            if now.duration_since(ts) < self.ttl {
                break;
            }
            self.order.pop_front();
            self.seen.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

//! Lamport and vector clocks (C4): monotonic causal-ordering counters,
//! merge rule on receipt, and a deterministic tie-break for concurrent
//! events.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A node's Lamport clock. `L` is advanced by one on every local event and
/// merged (max + 1) on every receive. Guarded by the same critical section
/// as the event it labels, so an `AtomicU64` is sufficient: the registry's
/// per-node mutex (held during send/receive) already serializes access.
#[derive(Debug, Default)]
pub struct LamportClock(AtomicU64);

impl LamportClock {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Advance for a local event: `L <- L + 1`. Returns the new value.
    pub fn tick(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Merge on receipt of a remote clock `received`: `L <- max(L, received) + 1`.
    pub fn merge(&self, received: u64) -> u64 {
        let mut current = self.0.load(Ordering::SeqCst);
        loop {
            let next = current.max(received) + 1;
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    /// Force the clock to an exact value (used by resync's clock-advance step).
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::SeqCst);
    }
}

impl Clone for LamportClock {
    fn clone(&self) -> Self {
        Self(AtomicU64::new(self.get()))
    }
}

/// Whether `a`'s Lamport clock causally precedes `b`'s, given their sender
/// ids for the deterministic tie-break. Two events are concurrent iff
/// neither precedes the other (same clock, different senders).
pub fn happens_before(a_clock: u64, a_sender: &str, b_clock: u64, b_sender: &str) -> bool {
    if a_clock != b_clock {
        a_clock < b_clock
    } else {
        a_sender < b_sender && a_sender != b_sender
    }
}

/// Two events are concurrent iff neither happens-before the other.
pub fn is_concurrent(a_clock: u64, a_sender: &str, b_clock: u64, b_sender: &str) -> bool {
    if a_sender == b_sender {
        return false;
    }
    !happens_before(a_clock, a_sender, b_clock, b_sender)
        && !happens_before(b_clock, b_sender, a_clock, a_sender)
}

/// Total order over concurrent events: `(lamport_clock, sender_id)`.
pub fn tie_break_order(a_clock: u64, a_sender: &str, b_clock: u64, b_sender: &str) -> std::cmp::Ordering {
    (a_clock, a_sender).cmp(&(b_clock, b_sender))
}

/// Per-node map of node_id -> Lamport value, carried as an advisory snapshot
/// on each message. Merge rule is element-wise max, then self-increment on
/// receive. Used by the resync engine; not itself consulted for causal
/// ordering beyond the duplicate check (the Lamport clock is authoritative).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VectorClock(pub BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn snapshot(entries: impl IntoIterator<Item = (String, u64)>) -> Self {
        Self(entries.into_iter().collect())
    }

    /// Element-wise max of `self` and `other`, then increments `self_id`'s entry.
    pub fn merge(&mut self, other: &VectorClock, self_id: &str) {
        for (node_id, &value) in &other.0 {
            let entry = self.0.entry(node_id.clone()).or_insert(0);
            *entry = (*entry).max(value);
        }
        *self.0.entry(self_id.to_string()).or_insert(0) += 1;
    }
}

// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer heap with lazy removal.
//!
//! Slots hold the actions; the binary heap only holds `(due, seq, slot)`
//! keys. Removing a timer empties its slot and leaves the key behind as a
//! tombstone. A key is live only while its slot still carries the same
//! `seq`, so a recycled slot never revives an old key. Tombstones are
//! pruned from the top before every `timeout()`/`pop()`, and the whole heap
//! is rebuilt once dead keys outnumber live ones.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Rebuild only when the heap is at least this big.
const COMPACT_MIN: usize = 64;

/// Delays past what `Instant` can represent are clamped to this horizon.
const HORIZON: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Identifies one scheduled action. Stale handles are harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    slot: usize,
    seq: u64,
}

struct Slot<A> {
    seq: u64,
    due: Instant,
    action: A,
}

/// Min-heap of actions keyed by due time. Equal due times pop in
/// insertion order.
pub struct Scheduler<A> {
    slots: Vec<Option<Slot<A>>>,
    free: Vec<usize>,
    heap: BinaryHeap<Reverse<(Instant, u64, usize)>>,
    live: usize,
    next_seq: u64,
}

impl<A> Scheduler<A> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            heap: BinaryHeap::new(),
            live: 0,
            next_seq: 0,
        }
    }

    /// Schedule `action` to become due after `delay`. Delays too large
    /// for the clock (`Duration::MAX`) are clamped to a far-future instant.
    pub fn add(&mut self, delay: Duration, action: A) -> TimerHandle {
        self.add_at(deadline(Instant::now(), delay), action)
    }

    /// Schedule `action` at an absolute instant.
    pub fn add_at(&mut self, due: Instant, action: A) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;

        let slot = Slot { seq, due, action };
        let index = match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(slot);
                i
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };

        self.heap.push(Reverse((due, seq, index)));
        self.live += 1;
        TimerHandle { slot: index, seq }
    }

    /// Tombstone a timer. Returns false if it already fired or was removed.
    pub fn remove(&mut self, handle: TimerHandle) -> bool {
        match self.slots.get(handle.slot) {
            Some(Some(s)) if s.seq == handle.seq => {}
            _ => return false,
        }
        self.slots[handle.slot] = None;
        self.free.push(handle.slot);
        self.live -= 1;

        if self.heap.len() >= COMPACT_MIN && self.heap.len() > 2 * self.live {
            self.compact();
        }
        true
    }

    /// Number of live timers.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Time until the earliest live timer; zero if it is overdue.
    pub fn timeout(&mut self) -> Option<Duration> {
        self.prune();
        let Reverse((due, _, _)) = self.heap.peek()?;
        Some(due.saturating_duration_since(Instant::now()))
    }

    /// True if the earliest live timer is due now.
    pub fn is_due(&mut self) -> bool {
        self.prune();
        match self.heap.peek() {
            Some(Reverse((due, _, _))) => *due <= Instant::now(),
            None => false,
        }
    }

    /// Remove and return the earliest live action, due or not.
    pub fn pop(&mut self) -> Option<A> {
        self.prune();
        let Reverse((_, _, index)) = self.heap.pop()?;
        let slot = self.slots[index].take()?;
        self.free.push(index);
        self.live -= 1;
        Some(slot.action)
    }

    /// Remove every live action, earliest first.
    pub fn drain(&mut self) -> Vec<A> {
        let mut out = Vec::with_capacity(self.live);
        while let Some(action) = self.pop() {
            out.push(action);
        }
        out
    }

    fn is_live(&self, seq: u64, index: usize) -> bool {
        matches!(&self.slots[index], Some(s) if s.seq == seq)
    }

    fn prune(&mut self) {
        while let Some(&Reverse((_, seq, index))) = self.heap.peek() {
            if self.is_live(seq, index) {
                break;
            }
            self.heap.pop();
        }
    }

    fn compact(&mut self) {
        let keys: Vec<_> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| Reverse((s.due, s.seq, i))))
            .collect();
        self.heap = BinaryHeap::from(keys);
    }
}

fn deadline(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(HORIZON.min(delay)))
        .unwrap_or(now)
}

impl<A> Default for Scheduler<A> {
    fn default() -> Self {
        Self::new()
    }
}

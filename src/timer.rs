//! One-shot timer wheel used for the handshake timeout (`spec.md` §4.i).
//!
//! `spec.md` calls for "a minimum sorted structure of (deadline, cb,
//! data)"; this is a literal binary-heap priority queue, the simplest
//! structure satisfying that contract. The original C implementation
//! (`fevent.c`) keeps a sorted linked list for the same handful of
//! concurrently-armed timers this system ever has (one per in-flight
//! handshake) — a heap is the same complexity class with none of the
//! manual-list bookkeeping.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Handle returned by [`TimerWheel::schedule`], usable to cancel.
    pub struct TimerToken;
}

struct Entry<T> {
    deadline: Instant,
    data: T,
}

pub struct TimerWheel<T> {
    entries: SlotMap<TimerToken, Entry<T>>,
    order: BinaryHeap<Reverse<(Instant, TimerToken)>>,
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerWheel<T> {
    pub fn new() -> Self {
        Self {
            entries: SlotMap::with_key(),
            order: BinaryHeap::new(),
        }
    }

    /// Arm a one-shot timer `delay` from now, carrying `data` to be handed
    /// back to the caller when it fires.
    pub fn schedule(&mut self, now: Instant, delay: Duration, data: T) -> TimerToken {
        let deadline = now + delay;
        let token = self.entries.insert(Entry { deadline, data });
        self.order.push(Reverse((deadline, token)));
        token
    }

    /// Cancel a scheduled timer. Returns `true` if it was still pending.
    pub fn cancel(&mut self, token: TimerToken) -> bool {
        self.entries.remove(token).is_some()
    }

    /// Pop every timer whose deadline is `<= now`, in deadline order.
    /// Cancelled timers (removed from `entries` but still present in the
    /// heap) are silently skipped here rather than eagerly purged from
    /// the heap, which would require linear search.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<(TimerToken, T)> {
        let mut fired = Vec::new();
        while let Some(&Reverse((deadline, token))) = self.order.peek() {
            if deadline > now {
                break;
            }
            self.order.pop();
            if let Some(entry) = self.entries.remove(token) {
                fired.push((token, entry.data));
            }
        }
        fired
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        let late = wheel.schedule(now, Duration::from_millis(50), "late");
        let early = wheel.schedule(now, Duration::from_millis(10), "early");

        let fired = wheel.drain_expired(now + Duration::from_millis(60));
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].0, early);
        assert_eq!(fired[1].0, late);
    }

    #[test]
    fn only_fires_expired_entries() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        wheel.schedule(now, Duration::from_secs(10), "far");
        wheel.schedule(now, Duration::from_millis(1), "near");

        let fired = wheel.drain_expired(now + Duration::from_millis(5));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, "near");
        assert_eq!(wheel.len(), 1);
    }

    #[test]
    fn cancel_prevents_firing() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        let token = wheel.schedule(now, Duration::from_millis(1), "x");
        assert!(wheel.cancel(token));

        let fired = wheel.drain_expired(now + Duration::from_secs(1));
        assert!(fired.is_empty());
    }
}

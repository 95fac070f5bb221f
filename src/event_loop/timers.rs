//! Timer ordering.
//!
//! Timers fire earliest deadline first; timers sharing a deadline fire in
//! the order they were armed.

use super::LoopHandleId;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    deadline: Instant,
    seq: u64,
    id: LoopHandleId,
}

/// Min-heap of armed timers. Cleared and closed timers are removed with
/// `retain`; the caller still checks the handle table on pop.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<TimerKey>>,
    seq: u64,
}

impl TimerQueue {
    pub(crate) fn push(&mut self, deadline: Instant, id: LoopHandleId) {
        self.seq += 1;
        self.heap.push(Reverse(TimerKey {
            deadline,
            seq: self.seq,
            id,
        }));
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(key)| key.deadline)
    }

    /// Pop the earliest timer if it is due at `now`.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<LoopHandleId> {
        match self.heap.peek() {
            Some(Reverse(key)) if key.deadline <= now => self.heap.pop().map(|Reverse(key)| key.id),
            _ => None,
        }
    }

    /// Drop entries whose handle no longer exists.
    pub(crate) fn retain(&mut self, live: impl Fn(LoopHandleId) -> bool) {
        self.heap.retain(|Reverse(key)| live(key.id));
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_earliest_deadline_first() {
        let now = Instant::now();
        let mut queue = TimerQueue::default();
        queue.push(now + Duration::from_millis(30), LoopHandleId(1));
        queue.push(now + Duration::from_millis(10), LoopHandleId(2));
        queue.push(now + Duration::from_millis(20), LoopHandleId(3));

        let later = now + Duration::from_millis(50);
        let order: Vec<_> = std::iter::from_fn(|| queue.pop_due(later)).collect();
        assert_eq!(order, vec![LoopHandleId(2), LoopHandleId(3), LoopHandleId(1)]);
    }

    #[test]
    fn test_ties_fire_in_insertion_order() {
        let deadline = Instant::now();
        let mut queue = TimerQueue::default();
        for id in [5, 3, 9, 1] {
            queue.push(deadline, LoopHandleId(id));
        }

        let order: Vec<_> = std::iter::from_fn(|| queue.pop_due(deadline)).map(|id| id.0).collect();
        assert_eq!(order, vec![5, 3, 9, 1]);
    }

    #[test]
    fn test_not_yet_due() {
        let now = Instant::now();
        let mut queue = TimerQueue::default();
        queue.push(now + Duration::from_secs(60), LoopHandleId(1));

        assert!(queue.pop_due(now).is_none());
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(60)));
        queue.retain(|_| false);
        assert_eq!(queue.len(), 0);
    }
}

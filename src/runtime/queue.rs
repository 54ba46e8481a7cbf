//! Ready queue and timer heap.
//!
//! Both structures are owned by the loop thread. Thread-safe producers go
//! through the [`Shared`](super::shared::Shared) inbox instead.

use crate::runtime::handle::{Handle, TimerHandle};

use log::trace;
use std::cell::Cell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::rc::Rc;
use std::time::Instant;

/// Heaps smaller than this are never compacted.
const MIN_COMPACT_SIZE: usize = 100;

/// A FIFO queue of handles due to run on the current or next tick.
#[derive(Default)]
pub(crate) struct ReadyQueue {
    handles: VecDeque<Handle>,
}

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enqueues a handle behind everything scheduled before it.
    pub(crate) fn push(&mut self, handle: Handle) {
        self.handles.push_back(handle);
    }

    pub(crate) fn pop(&mut self) -> Option<Handle> {
        self.handles.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub(crate) fn drain(&mut self) -> Vec<Handle> {
        self.handles.drain(..).collect()
    }
}

/// A min-heap of timer handles ordered by deadline, then insertion sequence.
///
/// Cancelled timers stay in the heap until they reach the top, where they
/// are discarded. The heap is rebuilt when cancelled entries make up more
/// than half of it.
pub(crate) struct TimerHeap {
    heap: BinaryHeap<Reverse<TimerHandle>>,
    next_seq: u64,
    cancelled: Rc<Cell<usize>>,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
            cancelled: Rc::new(Cell::new(0)),
        }
    }

    /// Pushes `handle` to fire at `when`.
    pub(crate) fn push(&mut self, when: Instant, handle: Handle) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;

        let timer = TimerHandle::new(handle, when, seq, Rc::downgrade(&self.cancelled));
        self.heap.push(Reverse(timer.clone()));
        self.maybe_compact();

        timer
    }

    /// Moves every live timer with a deadline at or before `now` into `ready`,
    /// in deadline order. Returns how many were moved.
    pub(crate) fn pop_expired(&mut self, now: Instant, ready: &mut ReadyQueue) -> usize {
        let mut moved = 0;

        while let Some(Reverse(top)) = self.heap.peek() {
            if top.cancelled() {
                self.discard_top();
                continue;
            }

            if top.when() > now {
                break;
            }

            if let Some(Reverse(timer)) = self.heap.pop() {
                timer.unschedule();
                ready.push(timer.handle.clone());
                moved += 1;
            }
        }

        moved
    }

    /// Deadline of the earliest live timer.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.cancelled() {
                self.discard_top();
                continue;
            }

            return Some(top.when());
        }

        None
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn cancelled_count(&self) -> usize {
        self.cancelled.get()
    }

    /// Cancels and drops every timer.
    pub(crate) fn clear(&mut self) {
        for Reverse(timer) in self.heap.drain() {
            timer.unschedule();
            timer.cancel();
        }
        self.cancelled.set(0);
    }

    fn discard_top(&mut self) {
        if let Some(Reverse(timer)) = self.heap.pop() {
            timer.unschedule();
            self.cancelled.set(self.cancelled.get().saturating_sub(1));
        }
    }

    fn maybe_compact(&mut self) {
        let cancelled = self.cancelled.get();
        if self.heap.len() <= MIN_COMPACT_SIZE || cancelled * 2 <= self.heap.len() {
            return;
        }

        let before = self.heap.len();
        let live: Vec<_> = self
            .heap
            .drain()
            .filter(|Reverse(timer)| {
                if timer.cancelled() {
                    timer.unschedule();
                    false
                } else {
                    true
                }
            })
            .collect();

        self.heap = BinaryHeap::from(live);
        self.cancelled.set(0);
        trace!("compacted timer heap: {} -> {} entries", before, self.heap.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::time::Duration;

    fn recorder(log: &Rc<RefCell<Vec<u32>>>, value: u32) -> Handle {
        let log = log.clone();
        Handle::once(move || log.borrow_mut().push(value))
    }

    fn run_all(ready: &mut ReadyQueue) {
        while let Some(handle) = ready.pop() {
            handle.run();
        }
    }

    #[test]
    fn test_expired_timers_come_out_in_deadline_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut heap = TimerHeap::new();
        let mut ready = ReadyQueue::new();
        let base = Instant::now();

        heap.push(base + Duration::from_millis(30), recorder(&log, 0));
        heap.push(base + Duration::from_millis(10), recorder(&log, 1));
        heap.push(base + Duration::from_millis(20), recorder(&log, 2));

        assert_eq!(heap.pop_expired(base + Duration::from_millis(15), &mut ready), 1);
        assert_eq!(heap.next_deadline(), Some(base + Duration::from_millis(20)));
        assert_eq!(heap.pop_expired(base + Duration::from_millis(30), &mut ready), 2);
        run_all(&mut ready);

        assert_eq!(*log.borrow(), vec![1, 2, 0]);
    }

    #[test]
    fn test_equal_deadlines_fire_in_insertion_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut heap = TimerHeap::new();
        let mut ready = ReadyQueue::new();
        let when = Instant::now();

        for i in 0..5 {
            heap.push(when, recorder(&log, i));
        }
        heap.pop_expired(when, &mut ready);
        run_all(&mut ready);

        assert_eq!(*log.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_cancelled_timers_are_skipped() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut heap = TimerHeap::new();
        let mut ready = ReadyQueue::new();
        let base = Instant::now();

        let first = heap.push(base, recorder(&log, 0));
        heap.push(base + Duration::from_millis(5), recorder(&log, 1));
        first.cancel();
        assert_eq!(heap.cancelled_count(), 1);

        assert_eq!(heap.next_deadline(), Some(base + Duration::from_millis(5)));
        assert_eq!(heap.cancelled_count(), 0);
        assert_eq!(heap.pop_expired(base + Duration::from_millis(5), &mut ready), 1);
        run_all(&mut ready);

        assert_eq!(*log.borrow(), vec![1]);
        assert!(!first.is_scheduled());
    }

    #[test]
    fn test_cancelling_fired_timer_does_not_count() {
        let mut heap = TimerHeap::new();
        let mut ready = ReadyQueue::new();
        let now = Instant::now();

        let timer = heap.push(now, Handle::once(|| {}));
        heap.pop_expired(now, &mut ready);
        timer.cancel();

        assert_eq!(heap.cancelled_count(), 0);
    }

    #[test]
    fn test_heap_compacts_when_mostly_cancelled() {
        let mut heap = TimerHeap::new();
        let far = Instant::now() + Duration::from_secs(60);

        let timers: Vec<_> = (0..150).map(|_| heap.push(far, Handle::once(|| {}))).collect();
        for timer in timers.iter().take(120) {
            timer.cancel();
        }

        // Next insertion notices that most of the heap is dead.
        heap.push(far, Handle::once(|| {}));
        assert_eq!(heap.len(), 31);
        assert_eq!(heap.cancelled_count(), 0);
    }
}

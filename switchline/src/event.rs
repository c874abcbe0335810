//! Monotonic one-shot timers.
//!
//! Each worker owns a [`TimerQueue`] next to its poll loop: timers are
//! tagged task values, the queue yields the next deadline for the poll
//! timeout, and expired tasks are popped after each poll wakeup. Time is
//! always passed in by the caller so tests can drive a manual clock.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Handle for cancelling a scheduled timer. Cancellation is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// One-shot timer queue over tagged tasks.
#[derive(Debug)]
pub struct TimerQueue<T> {
    by_deadline: BTreeMap<(Instant, u64), T>,
    deadlines: HashMap<u64, Instant>,
    next_seq: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        TimerQueue {
            by_deadline: BTreeMap::new(),
            deadlines: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> TimerQueue<T> {
        TimerQueue::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_deadline.is_empty()
    }

    /// Arm a timer `delay` from `now`.
    pub fn schedule(&mut self, now: Instant, delay: Duration, task: T) -> TimerId {
        self.schedule_at(now + delay, task)
    }

    /// Arm a timer at an absolute deadline.
    pub fn schedule_at(&mut self, deadline: Instant, task: T) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_deadline.insert((deadline, seq), task);
        self.deadlines.insert(seq, deadline);
        TimerId(seq)
    }

    /// Disarm. Returns false when the timer already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id.0) {
            Some(deadline) => self.by_deadline.remove(&(deadline, id.0)).is_some(),
            None => false,
        }
    }

    /// Earliest pending deadline, for the poll timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.by_deadline.keys().next().map(|&(deadline, _)| deadline)
    }

    /// Pop the next task whose deadline is at or before `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<T> {
        let &(deadline, seq) = self.by_deadline.keys().next()?;
        if deadline > now {
            return None;
        }
        self.deadlines.remove(&seq);
        self.by_deadline.remove(&(deadline, seq))
    }
}

// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`WorkerQueue`]: the per-worker composition of the speculative buffer,
//! the bounded deque, and the overflow stack, plus its statistics.

use crate::deque::BoundedDeque;
use crate::overflow::{OverflowStack, SpeculativeBuffer};
use crate::task::MarkTask;
use core::fmt;

/// Per-queue event counters, tracked the way a taskqueue's debug stats
/// traditionally are: cheap running totals, read back only for diagnostics.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    pub push: u64,
    pub pop: u64,
    pub pop_slow: u64,
    pub steal_attempt: u64,
    pub steal: u64,
    pub overflow: u64,
    pub overflow_max_len: u64,
}

impl Counters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_push(&mut self) {
        self.push += 1;
    }

    pub fn record_pop(&mut self) {
        self.pop += 1;
    }

    pub fn record_pop_slow(&mut self) {
        self.pop += 1;
        self.pop_slow += 1;
    }

    pub fn record_steal(&mut self, success: bool) {
        self.steal_attempt += 1;
        if success {
            self.steal += 1;
        }
    }

    pub fn record_overflow(&mut self, new_len: usize) {
        self.overflow += 1;
        self.overflow_max_len = self.overflow_max_len.max(new_len as u64);
    }
}

impl fmt::Display for Counters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "push={} pop={} pop_slow={} steal={}/{} overflow={} overflow_max_len={}",
            self.push,
            self.pop,
            self.pop_slow,
            self.steal,
            self.steal_attempt,
            self.overflow,
            self.overflow_max_len
        )
    }
}

/// The queue owned by one worker for its entire lifetime.
///
/// `buf`/`overflow` are touched only by the owner; `deque` is shared
/// read/CAS with stealers through [`BoundedDeque::pop_global`].
pub struct WorkerQueue {
    pub buf: SpeculativeBuffer<MarkTask>,
    pub deque: BoundedDeque<MarkTask>,
    pub overflow: OverflowStack<MarkTask>,
    pub stats: Counters,
}

impl WorkerQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: SpeculativeBuffer::new(),
            deque: BoundedDeque::new(),
            overflow: OverflowStack::new(),
            stats: Counters::new(),
        }
    }

    #[must_use]
    pub fn with_deque_capacity(capacity: usize) -> Result<Self, crate::error::ConfigError> {
        Ok(Self {
            buf: SpeculativeBuffer::new(),
            deque: BoundedDeque::with_capacity(capacity)?,
            overflow: OverflowStack::new(),
            stats: Counters::new(),
        })
    }

    /// Owner-only. Tries C4, falling through to C2, falling through to C3.
    pub fn push(&mut self, t: MarkTask) {
        let Some(displaced) = self.buf.push(t) else {
            return;
        };

        if self.deque.push(displaced) {
            self.stats.record_push();
        } else {
            self.overflow.push(displaced);
            self.stats.record_overflow(self.overflow.len());
        }
    }

    /// Owner-only. Tries C4, then a local (LIFO) pop from C2, then C3.
    pub fn try_pop(&mut self) -> Option<MarkTask> {
        if let Some(t) = self.buf.pop() {
            return Some(t);
        }
        if let Some(t) = self.deque.pop_local(0) {
            self.stats.record_pop();
            return Some(t);
        }
        if let Some(t) = self.overflow.pop() {
            self.stats.record_pop_slow();
            return Some(t);
        }
        None
    }

    /// Callable from any thread. Steals one task from `victim`'s deque.
    pub fn try_steal_from(victim: &Self) -> Option<MarkTask> {
        victim.deque.pop_global()
    }

    /// Best-effort emptiness check across all three tiers. Racy.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty() && self.deque.is_empty() && self.overflow.is_empty()
    }
}

impl Default for WorkerQueue {
    fn default() -> Self {
        Self::new()
    }
}

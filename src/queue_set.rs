// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`QueueSet`]: the fixed pool of per-worker queues, with claim-next
//! hand-off and best-of-two victim selection for stealing.

use crate::error::ConfigError;
use crate::loom::atomic::{AtomicUsize, Ordering};
use crate::task::MarkTask;
use crate::worker_queue::WorkerQueue;

/// A Park-Miller minimal-standard LCG, seeded per worker.
///
/// `QueueSet::steal` needs cheap, uncorrelated victim indices, not
/// cryptographic randomness; this is the generator the victim-selection
/// algorithm is specified against.
#[derive(Debug, Clone, Copy)]
pub struct Lcg(u64);

impl Lcg {
    const MODULUS: u64 = (1 << 31) - 1;
    const MULTIPLIER: u64 = 16807;

    /// Seeds the generator. `seed` is forced into `[1, MODULUS)`: zero is a
    /// fixed point of this LCG and must never occur.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        let seed = seed % Self::MODULUS;
        Self(if seed == 0 { 1 } else { seed })
    }

    /// Draws the next value in `[1, MODULUS)`.
    pub fn next_u64(&mut self) -> u64 {
        self.0 = (self.0 * Self::MULTIPLIER) % Self::MODULUS;
        self.0
    }

    /// Draws a uniform index in `[0, bound)`.
    pub fn next_below(&mut self, bound: usize) -> usize {
        (self.next_u64() as usize) % bound
    }
}

/// The fixed pool of worker queues shared by a marking phase.
///
/// Every worker holds a reference to the same `QueueSet` for the phase's
/// duration; `claim_next` and `steal` are the only operations callable from
/// any worker concurrently.
pub struct QueueSet {
    queues: Vec<WorkerQueue>,
    claimed_index: AtomicUsize,
}

impl QueueSet {
    /// Builds a set of `n` empty, default-capacity queues.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroWorkers`] if `n == 0`.
    pub fn new(n: usize) -> Result<Self, ConfigError> {
        if n == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        Ok(Self {
            queues: (0..n).map(|_| WorkerQueue::new()).collect(),
            claimed_index: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    #[must_use]
    pub fn queue(&self, id: usize) -> &WorkerQueue {
        &self.queues[id]
    }

    /// Mutable access for the owning worker only; callers must ensure `id`
    /// is never aliased across threads (each worker owns exactly one index).
    #[must_use]
    #[allow(clippy::mut_from_ref)]
    pub fn queue_mut(&self, id: usize) -> &mut WorkerQueue {
        // Safety: by contract, worker `id` is the sole owner of
        // `queues[id]`'s non-`deque` fields, and `deque` is internally
        // synchronized for concurrent stealer access. Each worker only ever
        // calls this with its own `id`.
        let ptr = core::ptr::addr_of!(self.queues[id]) as *mut WorkerQueue;
        unsafe { &mut *ptr }
    }

    /// Claims the next queue index in hand-off order, for draining queues
    /// pre-seeded by an external root-scan phase. Returns `None` once every
    /// index up to `len()` has been claimed.
    pub fn claim_next(&self) -> Option<usize> {
        let idx = self.claimed_index.fetch_add(1, Ordering::AcqRel);
        if idx < self.queues.len() {
            Some(idx)
        } else {
            None
        }
    }

    /// Advances the claim cursor to `n`, so that `claim_next` yields nothing
    /// for the first `n` indices. Used after a phase controller seeded
    /// exactly `n` queues and the rest should be treated as already claimed.
    pub fn reserve(&self, n: usize) {
        self.claimed_index.store(n, Ordering::Release);
    }

    /// Resets the claim cursor to zero and empties every queue, for reuse
    /// across phases.
    pub fn reset(&mut self) {
        self.claimed_index.store(0, Ordering::Release);
        for q in &mut self.queues {
            while q.try_pop().is_some() {}
        }
    }

    /// Best-of-two victim selection: draws two distinct victims other than
    /// `my_id`, samples their dirty size, and steals from the larger (ties
    /// favor the first draw). Never falls back to the other victim on a
    /// failed steal; the caller should simply retry with a fresh draw.
    pub fn steal(&self, my_id: usize, rng: &mut Lcg) -> Option<MarkTask> {
        let n = self.queues.len();
        if n <= 1 {
            return None;
        }

        let pick_other = |rng: &mut Lcg| -> usize {
            loop {
                let v = rng.next_below(n);
                if v != my_id {
                    return v;
                }
            }
        };

        let a = pick_other(rng);
        let b = loop {
            let v = pick_other(rng);
            if v != a {
                break v;
            }
        };

        let size_a = self.queues[a].deque.dirty_size();
        let size_b = self.queues[b].deque.dirty_size();
        let victim = if size_a >= size_b { a } else { b };

        WorkerQueue::try_steal_from(&self.queues[victim])
    }

    /// Best-effort "does any queue currently look non-empty" observation.
    /// May miss a concurrent push; compensating logic lives in the
    /// terminator's timeout-based retry.
    #[must_use]
    pub fn peek(&self) -> bool {
        self.queues.iter().any(|q| !q.deque.is_empty())
    }
}

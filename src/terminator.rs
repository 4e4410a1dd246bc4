// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`Terminator`]: the agreement protocol by which every worker in a phase
//! confirms there is no work left anywhere before the phase ends.
//!
//! States: `Working -> Offering -> (Terminated | Working)`. A worker enters
//! `Offering` by calling [`Terminator::offer_termination`]; it leaves either
//! `Terminated` (the call returns `true`, and the worker must stop) or back
//! to `Working` (the call returns `false`, because either an early-exit
//! condition fired or work was rediscovered).

use crate::loom::atomic::{AtomicUsize, Ordering};
use crate::loom::{Condvar, Mutex};
use crate::queue_set::QueueSet;
use core::time::Duration;
use crossbeam_utils::Backoff;

/// Sentinel meaning "no thread currently holds the spin-master role".
const NO_SPIN_MASTER: usize = usize::MAX;

/// Upper bound on how long a waiter blocks on the monitor before re-checking
/// for rediscovered work, matching the `<= 1 ms` bound in the termination
/// contract.
const MONITOR_TIMEOUT: Duration = Duration::from_micros(500);

/// How long a spin-master busy-polls before relinquishing the role and
/// falling back to a blocking wait, so that no single thread burns CPU
/// indefinitely if nothing ever changes.
const SPIN_BUDGET: u32 = 64;

enum SpinOutcome {
    AllDone,
    WorkFound,
    TimedOut,
}

/// Coordinates `n_threads` workers agreeing that a marking phase is
/// complete.
///
/// Only one `Terminator` exists per phase; every worker shares a reference
/// to it for the phase's duration.
pub struct Terminator {
    n_threads: usize,
    offered: AtomicUsize,
    spin_master: AtomicUsize,
    monitor: Mutex<()>,
    condvar: Condvar,
}

impl Terminator {
    #[must_use]
    pub fn new(n_threads: usize) -> Self {
        Self {
            n_threads,
            offered: AtomicUsize::new(0),
            spin_master: AtomicUsize::new(NO_SPIN_MASTER),
            monitor: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    fn wake_all(&self) {
        let _guard = self.monitor.lock().unwrap();
        self.condvar.notify_all();
    }

    /// Offers termination on behalf of `worker_id`, which currently holds no
    /// work of its own.
    ///
    /// Returns `true` iff the caller must stop: every worker has offered and
    /// no queue shows work. Returns `false` if `early_exit` fired (forced
    /// termination, e.g. cancellation) or if work was rediscovered via
    /// `queue_set.peek()` — in both cases the caller should resume working.
    pub fn offer_termination(
        &self,
        worker_id: usize,
        queue_set: &QueueSet,
        mut early_exit: impl FnMut() -> bool,
    ) -> bool {
        let offered = self.offered.fetch_add(1, Ordering::AcqRel) + 1;
        if offered == self.n_threads {
            tracing::trace!(worker_id, "terminator: last offer received, all done");
            self.wake_all();
            return true;
        }

        let backoff = Backoff::new();
        loop {
            if early_exit() {
                tracing::trace!(worker_id, "terminator: forced early exit");
                self.offered.fetch_sub(1, Ordering::AcqRel);
                self.wake_all();
                return false;
            }

            backoff.snooze();

            if queue_set.peek() {
                tracing::trace!(worker_id, "terminator: work rediscovered via peek");
                self.offered.fetch_sub(1, Ordering::AcqRel);
                self.wake_all();
                return false;
            }

            if self.offered.load(Ordering::Acquire) == self.n_threads {
                return true;
            }

            if self
                .spin_master
                .compare_exchange(
                    NO_SPIN_MASTER,
                    worker_id,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                match self.spin_poll(queue_set) {
                    SpinOutcome::AllDone => {
                        self.relinquish_spin_master(worker_id);
                        return true;
                    }
                    SpinOutcome::WorkFound => {
                        self.relinquish_spin_master(worker_id);
                        self.offered.fetch_sub(1, Ordering::AcqRel);
                        self.wake_all();
                        return false;
                    }
                    SpinOutcome::TimedOut => {
                        self.relinquish_spin_master(worker_id);
                    }
                }
            } else {
                self.wait_on_monitor();
            }
        }
    }

    /// Busy-polls `peek`/`offered` for a bounded number of rounds. Only the
    /// elected spin-master runs this; everyone else blocks on the monitor,
    /// so the pool as a whole burns at most one core's worth of CPU while
    /// waiting.
    fn spin_poll(&self, queue_set: &QueueSet) -> SpinOutcome {
        let backoff = Backoff::new();
        for _ in 0..SPIN_BUDGET {
            if self.offered.load(Ordering::Acquire) == self.n_threads {
                return SpinOutcome::AllDone;
            }
            if queue_set.peek() {
                return SpinOutcome::WorkFound;
            }
            backoff.snooze();
        }
        SpinOutcome::TimedOut
    }

    fn relinquish_spin_master(&self, worker_id: usize) {
        let _ = self.spin_master.compare_exchange(
            worker_id,
            NO_SPIN_MASTER,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.wake_all();
    }

    fn wait_on_monitor(&self) {
        let guard = self.monitor.lock().unwrap();
        let _ = self.condvar.wait_timeout(guard, MONITOR_TIMEOUT);
    }
}


/// Loom-checked exploration of the termination agreement itself: two
/// workers racing `offer_termination` with no work anywhere must both
/// observe `true`, under every interleaving loom can find.
#[cfg(all(loom, test))]
mod loom_tests {
    use super::*;
    use crate::loom::{self, Arc, thread};

    #[test]
    fn two_idle_workers_both_see_termination() {
        loom::model(|| {
            let qs = Arc::new(QueueSet::new(2).unwrap());
            let term = Arc::new(Terminator::new(2));

            let qs2 = qs.clone();
            let term2 = term.clone();
            let other = thread::spawn(move || term2.offer_termination(1, &qs2, || false));

            let this = term.offer_termination(0, &qs, || false);
            let other = other.join().unwrap();

            assert!(this, "worker 0 must see termination once both are idle");
            assert!(other, "worker 1 must see termination once both are idle");
        });
    }
}

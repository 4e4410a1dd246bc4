// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`MarkLoop`] (C10): the main per-worker loop, composing the worker
//! queue, the chunk splitter, the write-barrier drain, the steal path, and
//! the terminator into the engine's entry point, [`mark_loop`].

use crate::chunk::{chunk_split_continue, chunk_split_start};
use crate::collaborators::{Heap, ObjectModel, Slot};
use crate::liveness::LivenessCounter;
use crate::policy::{trace_slot, ReferencePolicy};
use crate::queue_set::{Lcg, QueueSet};
use crate::task::{MarkTask, ObjAddr};
use crate::terminator::Terminator;
use crate::worker_queue::WorkerQueue;
use bitflags::bitflags;

bitflags! {
    /// Per-phase behavior toggles for [`mark_loop`].
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct MarkLoopFlags: u8 {
        /// Poll `heap.is_cancelled()` and honor it by forcing termination.
        /// Forces `stride = 1` (see [`mark_loop`]) since there is no longer
        /// an amortization reason to run strides long.
        const CANCELLABLE    = 1 << 0;
        /// Fall through to the write-barrier buffer drain when the local
        /// queue and steal both come up empty.
        const DRAIN_BARRIERS = 1 << 1;
        /// Accumulate per-region live-word counts via a [`LivenessCounter`].
        const COUNT_LIVENESS = 1 << 2;
        /// Iterate class-metadata references in addition to instance
        /// fields. Orthogonal to every other flag (§4.8).
        const UNLOAD_CLASSES = 1 << 3;
        /// Enqueue dedup candidates encountered while marking.
        const DEDUP_STRINGS  = 1 << 4;
    }
}

/// Default inner-loop iteration count between cancellation/terminator
/// checks, when cancellation is enabled. A larger stride amortizes
/// terminator/steal overhead; a smaller one improves cancellation latency.
pub const DEFAULT_STRIDE: usize = 1000;

/// Forwarding-pointer/header word charged against every object's liveness
/// count in addition to its own `size_in_words`, mirroring the source's
/// per-object forwarding-pointer overhead.
const METADATA_WORD_COUNT: u64 = 1;

/// Runs one worker's share of a marking phase to completion.
///
/// Returns once `terminator.offer_termination` reports the whole phase is
/// done (normally, or because `heap.is_cancelled()` forced an early exit).
#[allow(clippy::too_many_arguments)]
pub fn mark_loop<H: Heap, O: ObjectModel, P: ReferencePolicy>(
    heap: &H,
    object_model: &O,
    policy: &P,
    queue_set: &QueueSet,
    terminator: &Terminator,
    worker_id: usize,
    flags: MarkLoopFlags,
) {
    let span = tracing::info_span!("mark_loop", worker_id);
    let _enter = span.enter();

    let cancellable = flags.contains(MarkLoopFlags::CANCELLABLE);
    let stride = if cancellable { DEFAULT_STRIDE } else { 1 };
    let mut rng = Lcg::new(worker_id as u64 + 1);
    let mut liveness = LivenessCounter::new(heap.region_count());
    let mut dedup_queue: Vec<ObjAddr> = Vec::new();

    // Phase A: drain any queues pre-seeded by an external root-scan phase.
    while let Some(idx) = queue_set.claim_next() {
        if cancellable && heap.check_cancel_and_yield() {
            tracing::trace!(worker_id, idx, "cancelled during phase A");
            terminator.offer_termination(worker_id, queue_set, || true);
            liveness.flush(heap);
            return;
        }

        let q = queue_set.queue_mut(idx);
        loop {
            let mut ran = 0;
            while ran < stride {
                let Some(task) = q.try_pop() else { break };
                do_task(
                    heap,
                    object_model,
                    policy,
                    q,
                    flags,
                    &mut liveness,
                    &mut dedup_queue,
                    task,
                );
                ran += 1;
            }
            if ran == 0 {
                break;
            }
        }
    }

    // Phase B: the normal steady-state loop.
    let q = queue_set.queue_mut(worker_id);
    loop {
        if cancellable && heap.check_cancel_and_yield() {
            tracing::trace!(worker_id, "cancelled during phase B");
            terminator.offer_termination(worker_id, queue_set, || true);
            break;
        }

        let mut made_progress = false;
        for _ in 0..stride {
            if cancellable && heap.check_cancel_and_yield() {
                tracing::trace!(worker_id, "cancelled mid-stride");
                terminator.offer_termination(worker_id, queue_set, || true);
                made_progress = false;
                liveness.flush(heap);
                tracing::debug!(worker_id, stats = %q.stats, "mark_loop exiting (cancelled)");
                return;
            }

            let task = q
                .try_pop()
                .or_else(|| {
                    if flags.contains(MarkLoopFlags::DRAIN_BARRIERS) {
                        try_barrier_drain(heap, policy, q)
                    } else {
                        None
                    }
                })
                .or_else(|| {
                    let stolen = queue_set.steal(worker_id, &mut rng);
                    q.stats.record_steal(stolen.is_some());
                    stolen
                });

            match task {
                Some(task) => {
                    do_task(
                        heap,
                        object_model,
                        policy,
                        q,
                        flags,
                        &mut liveness,
                        &mut dedup_queue,
                        task,
                    );
                    made_progress = true;
                }
                None => break,
            }
        }

        if !made_progress {
            let early_exit = || cancellable && heap.is_cancelled();
            if terminator.offer_termination(worker_id, queue_set, early_exit) {
                break;
            }
        }
    }

    liveness.flush(heap);
    tracing::debug!(worker_id, stats = %q.stats, "mark_loop exiting");
}

/// Applies one pending write-barrier buffer, if any, pushing every
/// reference it names; returns the first task now available once that
/// buffer's contents have been folded into `q`.
fn try_barrier_drain<H: Heap, P: ReferencePolicy>(
    heap: &H,
    policy: &P,
    q: &mut WorkerQueue,
) -> Option<MarkTask> {
    loop {
        let mut pushed_any = false;
        {
            let mut cl = |slot: Slot| {
                trace_slot(heap, policy, slot, |obj| {
                    q.push(MarkTask::from_obj(obj));
                    pushed_any = true;
                }, None);
            };
            if !heap.apply_closure_to_one_completed_buffer(&mut cl) {
                return None;
            }
        }
        if pushed_any {
            return q.try_pop();
        }
    }
}

/// Dispatches one dequeued task per the behavior table in spec §4.5.
#[allow(clippy::too_many_arguments)]
fn do_task<H: Heap, O: ObjectModel, P: ReferencePolicy>(
    heap: &H,
    object_model: &O,
    policy: &P,
    q: &mut WorkerQueue,
    flags: MarkLoopFlags,
    liveness: &mut LivenessCounter,
    dedup_queue: &mut Vec<ObjAddr>,
    task: MarkTask,
) {
    let count_liveness = flags.contains(MarkLoopFlags::COUNT_LIVENESS);
    let dedup_strings = flags.contains(MarkLoopFlags::DEDUP_STRINGS);
    let obj = task.addr();

    if !task.is_chunked() {
        if count_liveness {
            let words = object_model.size_in_words(obj) + METADATA_WORD_COUNT;
            liveness.count(heap, obj, words);
        }

        if object_model.is_array(obj) {
            if object_model.is_reference_array(obj) {
                // Case 2: opens chunked tracing for a reference array.
                let len = object_model.array_length(obj);
                chunk_split_start(
                    obj,
                    len,
                    |t| q.push(t),
                    |range| {
                        object_model.iterate_ref_range(obj, range, &mut |slot| {
                            trace_one(heap, object_model, policy, dedup_strings, dedup_queue, q, slot);
                        });
                    },
                );
            }
            // Case 3: primitive array, no references inside; nothing to do.
        } else {
            // Case 1: a plain object.
            object_model.iterate_refs(obj, &mut |slot| {
                trace_one(heap, object_model, policy, dedup_strings, dedup_queue, q, slot);
            });

            // §4.8: class-metadata iteration is orthogonal to every other
            // flag, so it runs alongside the instance fields above rather
            // than replacing them.
            if flags.contains(MarkLoopFlags::UNLOAD_CLASSES) {
                object_model.iterate_class_refs(obj, &mut |slot| {
                    trace_one(heap, object_model, policy, dedup_strings, dedup_queue, q, slot);
                });
            }
        }
    } else {
        // Case 4: continue splitting an already-opened array chunk.
        chunk_split_continue(
            obj,
            task.chunk(),
            task.pow(),
            |t| q.push(t),
            |range| {
                object_model.iterate_ref_range(obj, range, &mut |slot| {
                    trace_one(heap, object_model, policy, dedup_strings, dedup_queue, q, slot);
                });
            },
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn trace_one<H: Heap, O: ObjectModel, P: ReferencePolicy>(
    heap: &H,
    object_model: &O,
    policy: &P,
    dedup_strings: bool,
    dedup_queue: &mut Vec<ObjAddr>,
    q: &mut WorkerQueue,
    slot: Slot,
) {
    trace_slot(
        heap,
        policy,
        slot,
        |obj| q.push(MarkTask::from_obj(obj)),
        if dedup_strings {
            Some(&mut |obj: ObjAddr| {
                if object_model.is_dedup_candidate(obj) {
                    dedup_queue.push(obj);
                }
            })
        } else {
            None
        },
    );
}

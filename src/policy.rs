// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The reference-policy family (C11): what a reference closure does with
//! one slot once it has a non-null raw value to chase.
//!
//! Selected as a generic, monomorphized type parameter on [`MarkLoop`]
//! (see `src/mark_loop.rs`), not a runtime enum, since this is the hottest
//! call site in the engine (§9's design note).

use crate::collaborators::{Heap, Slot, NULL};
use crate::task::ObjAddr;

/// What to do with a freshly-loaded, non-null raw reference read from a
/// slot. Implementations decide whether to follow forwarding and whether to
/// write the resolved value back.
pub trait ReferencePolicy: Send + Sync + 'static {
    /// Resolves `raw` (read from `slot`) against `heap`, returning the
    /// object to attempt to mark — or `None` if this slot's reference
    /// should be dropped without marking (a lost `CasUpdate` race).
    fn resolve<H: Heap>(&self, heap: &H, slot: Slot, raw: ObjAddr) -> Option<ObjAddr>;
}

/// Mark the slot's target only; never modify the slot.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoUpdate;

impl ReferencePolicy for NoUpdate {
    fn resolve<H: Heap>(&self, _heap: &H, _slot: Slot, raw: ObjAddr) -> Option<ObjAddr> {
        Some(raw)
    }
}

/// Follow forwarding pointers on read; never write back.
#[derive(Debug, Default, Clone, Copy)]
pub struct Resolve;

impl ReferencePolicy for Resolve {
    fn resolve<H: Heap>(&self, heap: &H, _slot: Slot, raw: ObjAddr) -> Option<ObjAddr> {
        Some(heap.resolve_forwarding(raw))
    }
}

/// Follow forwarding and store the resolved value back with a plain store.
/// The caller (the owning GC phase) guarantees no mutator races this write.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleUpdate;

impl ReferencePolicy for SimpleUpdate {
    fn resolve<H: Heap>(&self, heap: &H, slot: Slot, raw: ObjAddr) -> Option<ObjAddr> {
        let resolved = heap.resolve_forwarding(raw);
        if resolved != raw {
            // Safety: `SimpleUpdate`'s contract is that no concurrent
            // mutator can race this slot.
            unsafe {
                slot.store(resolved.get());
            }
        }
        Some(resolved)
    }
}

/// Follow forwarding and store the resolved value back via CAS, because a
/// mutator may be racing this slot. A lost CAS means a fresher write won;
/// drop the reference rather than re-chase it.
#[derive(Debug, Default, Clone, Copy)]
pub struct CasUpdate;

impl ReferencePolicy for CasUpdate {
    fn resolve<H: Heap>(&self, heap: &H, slot: Slot, raw: ObjAddr) -> Option<ObjAddr> {
        let resolved = heap.resolve_forwarding(raw);
        if resolved == raw {
            return Some(resolved);
        }
        // Safety: `slot` was the source of `raw`; the CAS is the
        // synchronization point with any racing mutator write.
        match unsafe { slot.compare_exchange(raw.get(), resolved.get()) } {
            Ok(_) => Some(resolved),
            Err(_) => None,
        }
    }
}

/// Applies the full reference-closure contract (spec §4.5) to one slot:
/// load, null check, policy resolution, mark, conditional re-enqueue, and
/// an optional string-dedup candidate check.
///
/// `push` enqueues a newly-marked object as a [`crate::task::MarkTask`];
/// it is an invariant of the engine that this can never fail (the
/// combined `WorkerQueue` capacity is effectively unbounded via its
/// overflow stack). `dedup`, when present, is called for every freshly
/// marked object; this function has no `ObjectModel` of its own to consult,
/// so the candidacy check from §4.5 step 7 ("`dedup_strings` and `obj` is a
/// dedup candidate") is the caller's responsibility — see
/// `mark_loop::trace_one`, which only passes a `dedup` closure that enqueues
/// after checking `ObjectModel::is_dedup_candidate`.
pub fn trace_slot<H: Heap, P: ReferencePolicy>(
    heap: &H,
    policy: &P,
    slot: Slot,
    mut push: impl FnMut(ObjAddr),
    dedup: Option<&mut dyn FnMut(ObjAddr)>,
) {
    // Safety: `slot` comes from an `ObjectModel::iterate_refs`/
    // `iterate_ref_range` call, which by contract only yields slots into
    // live heap memory for the duration of the marking phase.
    let raw = unsafe { slot.load() };
    if raw == NULL {
        return;
    }
    let raw = ObjAddr::new(raw);

    let Some(obj) = policy.resolve(heap, slot, raw) else {
        return;
    };

    if heap.try_mark(obj) {
        push(obj);
        if let Some(dedup) = dedup {
            dedup(obj);
        }
    }
}

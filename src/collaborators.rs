// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The two traits a host runtime implements to plug its heap and object
//! layout into the marking engine: [`Heap`] and [`ObjectModel`].

use crate::task::ObjAddr;
use core::sync::atomic::{AtomicU64, Ordering};

/// Sentinel raw value meaning "no reference" (a null slot).
pub const NULL: u64 = 0;

/// A thin, `Copy` handle onto one reference-sized storage slot (a field, an
/// array element, a GC root). Collaborators translate this to whatever
/// pointer/offset representation the host heap actually uses.
///
/// The address is treated as pointing at a live, atomic-compatible 64-bit
/// heap word for as long as a marking phase runs: the mutator's own write
/// barrier may be racing with [`Self::compare_exchange`] under the
/// `CasUpdate` policy, so every access goes through an atomic, never a plain
/// load/store.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Slot(u64);

impl Slot {
    #[must_use]
    pub fn from_raw(addr: u64) -> Self {
        Self(addr)
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// # Safety
    ///
    /// `self` must address a valid, correctly aligned, live `u64`-sized heap
    /// word for the duration of the call. The caller (an `O`/`H`
    /// implementation, or a `ReferencePolicy`) is responsible for this.
    unsafe fn atomic(self) -> &'static AtomicU64 {
        unsafe { AtomicU64::from_ptr(self.0 as *mut u64) }
    }

    /// # Safety
    ///
    /// See [`Self::atomic`].
    #[must_use]
    pub unsafe fn load(self) -> u64 {
        unsafe { self.atomic().load(Ordering::Acquire) }
    }

    /// # Safety
    ///
    /// See [`Self::atomic`]. Plain store; only sound when the caller (per
    /// the `SimpleUpdate` policy's contract) guarantees no concurrent
    /// mutator write can race this one.
    pub unsafe fn store(self, value: u64) {
        unsafe {
            self.atomic().store(value, Ordering::Release);
        }
    }

    /// # Safety
    ///
    /// See [`Self::atomic`].
    pub unsafe fn compare_exchange(self, current: u64, new: u64) -> Result<u64, u64> {
        unsafe {
            self.atomic()
                .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
        }
    }
}

impl core::fmt::Debug for Slot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Slot({:#x})", self.0)
    }
}

/// Opaque identifier for a heap region, used by the liveness accounting in
/// [`crate::liveness`].
pub type RegionId = u32;

/// The heap-side operations the marking loop needs from its host.
///
/// Implementations must be `Send + Sync`: the same `&dyn Heap` (or generic
/// `H`) is shared across every worker thread for the loop's whole lifetime.
pub trait Heap: Send + Sync {
    /// Attempts to claim `obj` for this marking pass.
    ///
    /// Returns `true` the first time any worker calls this for a given
    /// object; every subsequent call for the same object (from any worker)
    /// returns `false`. Must be implemented with a single atomic
    /// read-modify-write per object; this is the engine's one mandatory
    /// synchronization point per reference traced.
    fn try_mark(&self, obj: ObjAddr) -> bool;

    /// Resolves a possibly-forwarded reference to its to-space copy.
    ///
    /// Called before `try_mark` under reference-update policies that track
    /// forwarding; a `NoUpdate` policy's implementation is the identity.
    fn resolve_forwarding(&self, obj: ObjAddr) -> ObjAddr;

    /// Maps an address to the heap region containing it, for liveness
    /// accounting.
    fn region_of(&self, addr: ObjAddr) -> RegionId;

    /// Total number of regions, for sizing a worker's
    /// [`crate::liveness::LivenessCounter`].
    fn region_count(&self) -> usize;

    /// Adds `words` live words to `region`'s running total. Called only from
    /// [`crate::liveness::LivenessCounter::flush`], never on the hot path.
    fn region_live_add(&self, region: RegionId, words: u64);

    /// Polled at loop granularity (stride boundaries); `true` once the
    /// marking pass should abandon whatever it's doing as soon as possible.
    fn is_cancelled(&self) -> bool;

    /// Cooperative yield point for a cancellable loop: returns `true` if the
    /// worker should stop, having already done whatever bookkeeping a
    /// safepoint requires.
    fn check_cancel_and_yield(&self) -> bool {
        self.is_cancelled()
    }

    /// Applies `cl` to one completed satb/remembered-set buffer, if any are
    /// pending. Returns `true` if a buffer was found and drained.
    fn apply_closure_to_one_completed_buffer(&self, cl: &mut dyn FnMut(Slot)) -> bool;
}

/// The object-layout operations the marking loop needs from its host.
///
/// Like [`Heap`], shared across worker threads for the loop's lifetime.
pub trait ObjectModel: Send + Sync {
    /// `true` if `obj` is an array (its references, if any, are iterated by
    /// index rather than by a fixed field layout).
    fn is_array(&self, obj: ObjAddr) -> bool;

    /// `true` if `obj` is an array whose element type is itself a reference
    /// type (as opposed to, say, a primitive array, which has no references
    /// to trace at all).
    fn is_reference_array(&self, obj: ObjAddr) -> bool;

    /// Number of elements in the reference array `obj`. Only meaningful when
    /// [`Self::is_reference_array`] is `true`.
    fn array_length(&self, obj: ObjAddr) -> usize;

    /// Invokes `cl` once per outgoing reference slot in `obj` (every field
    /// for a plain object; every element for a non-chunked reference array).
    fn iterate_refs(&self, obj: ObjAddr, cl: &mut dyn FnMut(Slot));

    /// Invokes `cl` once per outgoing reference slot in the half-open
    /// element range `range` of the reference array `obj`.
    fn iterate_ref_range(&self, obj: ObjAddr, range: core::ops::Range<usize>, cl: &mut dyn FnMut(Slot));

    /// The object's size, in heap words, for liveness accounting.
    fn size_in_words(&self, obj: ObjAddr) -> u64;

    /// `true` if `obj` is a candidate for the (optional) string
    /// deduplication pass. Only consulted when `MarkLoopFlags::DEDUP_STRINGS`
    /// is set; the default implementation disables deduplication entirely.
    fn is_dedup_candidate(&self, _obj: ObjAddr) -> bool {
        false
    }

    /// Invokes `cl` once per outgoing reference slot in `obj`'s class
    /// metadata (e.g. a class's own static fields, or a `Klass`'s embedded
    /// references), as opposed to its instance fields.
    ///
    /// Only consulted when `MarkLoopFlags::UNLOAD_CLASSES` is set; orthogonal
    /// to every other flag (§4.8), so it runs in addition to
    /// [`Self::iterate_refs`], not instead of it. The default implementation
    /// iterates nothing, for hosts with no class-metadata graph to unload.
    fn iterate_class_refs(&self, _obj: ObjAddr, _cl: &mut dyn FnMut(Slot)) {}
}

// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A fixed-capacity ABP/Chase-Lev work-stealing deque.
//!
//! One owner pushes and pops locally from `bottom` (LIFO); any number of
//! other threads may concurrently steal from `top` (FIFO) through
//! [`BoundedDeque::pop_global`]. `top` and a wrap-counting `tag` are packed
//! into a single atomic word (`age`) so a thief's claim is one CAS.

use crate::error::ConfigError;
use crate::loom::atomic::{AtomicU32, AtomicU64, Ordering, fence};
use crate::loom::UnsafeCell;
use core::mem::MaybeUninit;

/// Default capacity, matching the local run-queue size real work-stealing
/// schedulers settle on (large enough to rarely overflow to the spill
/// stack, small enough to keep steal scans cheap).
pub const DEFAULT_CAPACITY: usize = 256;

fn pack(top: u32, tag: u32) -> u64 {
    (u64::from(tag) << 32) | u64::from(top)
}

fn unpack(age: u64) -> (u32, u32) {
    (age as u32, (age >> 32) as u32)
}

/// A fixed-capacity, lock-free work-stealing deque.
///
/// `T` must be `Copy`: a failed steal CAS discards an optimistically read
/// slot, which is only sound when dropping that read value has no effect.
pub struct BoundedDeque<T> {
    mask: usize,
    capacity: usize,
    /// Index one past the last locally pushed element. Written only by the
    /// owner; read by anyone.
    bottom: AtomicU32,
    /// Packed `(top, tag)`. `top` is the index of the oldest element; `tag`
    /// increments whenever `top` wraps around `u32`, defeating ABA on the
    /// combined word.
    age: AtomicU64,
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// Safety: all cross-thread access to `buf` goes through the atomic
// `bottom`/`age` protocol below, which establishes exclusive access to each
// slot before it is read or written.
unsafe impl<T: Send> Send for BoundedDeque<T> {}
unsafe impl<T: Send> Sync for BoundedDeque<T> {}

impl<T: Copy> BoundedDeque<T> {
    /// Builds a deque with [`DEFAULT_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY).expect("DEFAULT_CAPACITY is a valid power of two")
    }

    /// Builds a deque of the given capacity.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidCapacity`] unless `capacity` is a power
    /// of two `>= 4` (two slots are reserved so the empty/full race zone
    /// described in the deque's invariants stays distinguishable).
    pub fn with_capacity(capacity: usize) -> Result<Self, ConfigError> {
        if capacity < 4 || !capacity.is_power_of_two() {
            return Err(ConfigError::InvalidCapacity {
                requested: capacity,
            });
        }

        let buf = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            mask: capacity - 1,
            capacity,
            bottom: AtomicU32::new(0),
            age: AtomicU64::new(pack(0, 0)),
            buf,
        })
    }

    /// Usable capacity: `N - 2`.
    #[must_use]
    pub fn usable_capacity(&self) -> usize {
        self.capacity - 2
    }

    fn slot_write(&self, idx: usize, value: T) {
        self.buf[idx & self.mask].with_mut(|p| unsafe {
            (*p).write(value);
        });
    }

    fn slot_read(&self, idx: usize) -> T {
        self.buf[idx & self.mask].with(|p| unsafe { (*p).assume_init_read() })
    }

    /// A best-effort, racy size estimate. Never blocks; used by steal-victim
    /// selection and the terminator's `peek`.
    #[must_use]
    pub fn dirty_size(&self) -> usize {
        let (top, _) = unpack(self.age.load(Ordering::Acquire));
        let bottom = self.bottom.load(Ordering::Acquire);
        bottom.wrapping_sub(top) as usize
    }

    /// Owner-only. Pushes `t` onto the bottom of the deque.
    ///
    /// Returns `false` if the deque is at its usable capacity (`N - 2`); the
    /// caller (`WorkerQueue`) is expected to fall through to the overflow
    /// stack.
    pub fn push(&self, t: T) -> bool {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let (top, _) = unpack(self.age.load(Ordering::Acquire));
        let size = bottom.wrapping_sub(top) as usize;

        if size >= self.capacity - 2 {
            return false;
        }

        self.slot_write(bottom as usize, t);
        // Release: the write above must be visible to anyone who observes
        // the new `bottom`.
        self.bottom.store(bottom.wrapping_add(1), Ordering::Release);
        true
    }

    /// Owner-only. Pops the most recently pushed element (LIFO), unless
    /// doing so would leave the deque with `threshold` or fewer elements
    /// for stealers, in which case it declines and returns `None`.
    pub fn pop_local(&self, threshold: usize) -> Option<T> {
        let old_bottom = self.bottom.load(Ordering::Relaxed);
        let new_bottom = old_bottom.wrapping_sub(1);
        self.bottom.store(new_bottom, Ordering::SeqCst);

        // StoreLoad: the decremented `bottom` must be visible to stealers
        // before we read `age`, or a concurrent steal could race ahead of
        // our own claim on the last element.
        fence(Ordering::SeqCst);

        let age = self.age.load(Ordering::Acquire);
        let (top, tag) = unpack(age);
        // Signed: a queue that was already empty before the decrement above
        // makes `new_bottom` one less than `top`, which wraps to a huge
        // `u32` under `wrapping_sub`. Reading it as `i32` turns that wrap
        // back into the negative value it actually represents.
        let dirty_size = new_bottom.wrapping_sub(top) as i32;

        if dirty_size < 0 {
            // The deque was already empty; our tentative decrement never
            // had anything to claim. Undo it and report empty.
            self.bottom.store(old_bottom, Ordering::Release);
            return None;
        }

        if dirty_size > 0 {
            if (dirty_size as usize) <= threshold {
                // Not enough slack left for stealers; undo the decrement.
                self.bottom.store(old_bottom, Ordering::Release);
                return None;
            }
            return Some(self.slot_read(new_bottom as usize));
        }

        // Race zone: `dirty_size == 0`, the single remaining element that
        // both our own pop and a concurrent stealer's claim could be racing
        // over. Arbitrate with a single CAS on `age`.
        if threshold >= 1 {
            // No slack for stealers even if we win the race; decline without
            // touching `age`.
            self.bottom.store(old_bottom, Ordering::Release);
            return None;
        }

        let new_top = top.wrapping_add(1);
        let new_tag = if new_top == 0 { tag.wrapping_add(1) } else { tag };
        let new_age = pack(new_top, new_tag);
        let result = match self
            .age
            .compare_exchange(age, new_age, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Some(self.slot_read(new_bottom as usize)),
            Err(_) => None,
        };

        // Either way the queue is now canonically empty from the owner's
        // point of view; converge `bottom` back to `top`.
        let (settled_top, _) = unpack(self.age.load(Ordering::Acquire));
        self.bottom.store(settled_top, Ordering::Release);

        result
    }

    /// Callable from any thread. Steals the oldest element (FIFO).
    ///
    /// Returns `None` both when the deque is empty and when a concurrent
    /// claim lost the CAS race; callers should treat both as "try again
    /// later", never as a hard failure.
    pub fn pop_global(&self) -> Option<T> {
        let age = self.age.load(Ordering::Acquire);
        let (top, tag) = unpack(age);
        let bottom = self.bottom.load(Ordering::Acquire);
        let dirty_size = bottom.wrapping_sub(top);

        if dirty_size == 0 || dirty_size as usize == self.capacity - 1 {
            return None;
        }

        // Ordered after the `age` load: we must not look at the slot before
        // we know `top` is the value we're about to try to claim.
        let candidate = self.slot_read(top as usize);

        let new_top = top.wrapping_add(1);
        let new_tag = if new_top == 0 { tag.wrapping_add(1) } else { tag };
        let new_age = pack(new_top, new_tag);

        match self
            .age
            .compare_exchange(age, new_age, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Some(candidate),
            Err(_) => None,
        }
    }

    /// `true` if the deque currently appears empty. Racy, like
    /// [`Self::dirty_size`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dirty_size() == 0
    }
}

impl<T: Copy> Default for BoundedDeque<T> {
    fn default() -> Self {
        Self::new()
    }
}


/// Loom-checked exploration of the exact race the deque's invariants are
/// built around: an owner popping locally while a single thief steals,
/// both converging on the last element. Kept tiny (one item, one thief) —
/// loom's state-space blows up fast, and this is exactly the interleaving
/// `pop_local`'s "race zone" CAS exists to arbitrate.
#[cfg(all(loom, test))]
mod loom_tests {
    use super::*;
    use crate::loom::{self, Arc, thread};

    #[test]
    fn owner_pop_and_single_thief_never_double_deliver() {
        loom::model(|| {
            let dq = Arc::new(BoundedDeque::<u32>::with_capacity(4).unwrap());
            assert!(dq.push(1));

            let thief_dq = dq.clone();
            let thief = thread::spawn(move || thief_dq.pop_global());

            let owner_result = dq.pop_local(0);
            let thief_result = thief.join().unwrap();

            let delivered = owner_result.is_some() as u32 + thief_result.is_some() as u32;
            assert_eq!(delivered, 1, "exactly one side must win the last element");
        });
    }

    #[test]
    fn two_thieves_never_double_deliver() {
        loom::model(|| {
            let dq = Arc::new(BoundedDeque::<u32>::with_capacity(4).unwrap());
            assert!(dq.push(1));

            let a = {
                let dq = dq.clone();
                thread::spawn(move || dq.pop_global())
            };
            let b = {
                let dq = dq.clone();
                thread::spawn(move || dq.pop_global())
            };

            let a = a.join().unwrap();
            let b = b.join().unwrap();
            let delivered = a.is_some() as u32 + b.is_some() as u32;
            assert_eq!(delivered, 1, "exactly one thief must win the single element");
        });
    }
}

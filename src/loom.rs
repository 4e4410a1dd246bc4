//! Shim over `loom`'s model-checked primitives for `cfg(loom)` builds.
//!
//! Production builds use `core`/`std` directly; under `cfg(loom)` the same
//! names resolve to loom's instrumented equivalents so the concurrency
//! tests in `deque.rs` and `terminator.rs` can run under the loom model
//! checker without source-level duplication.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(loom)] {
        pub(crate) use loom::sync::atomic;
        pub(crate) use loom::sync::{Arc, Mutex, Condvar};
        pub(crate) use loom::cell::UnsafeCell;
        pub(crate) use loom::thread;
        pub(crate) use loom::model;
    } else {
        pub(crate) use core::sync::atomic;
        pub(crate) use std::sync::{Arc, Mutex, Condvar};
        pub(crate) use std::thread;

        #[inline(always)]
        pub(crate) fn model<R>(f: impl FnOnce() -> R) -> R {
            f()
        }

        #[derive(Debug)]
        pub(crate) struct UnsafeCell<T>(core::cell::UnsafeCell<T>);

        impl<T> UnsafeCell<T> {
            pub(crate) const fn new(data: T) -> UnsafeCell<T> {
                UnsafeCell(core::cell::UnsafeCell::new(data))
            }

            #[inline(always)]
            pub(crate) fn with<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
                f(self.0.get())
            }

            #[inline(always)]
            pub(crate) fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
                f(self.0.get())
            }
        }
    }
}

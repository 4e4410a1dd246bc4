// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`LivenessCounter`]: per-worker, per-region live-word accounting with
//! overflow flush to the heap's global counters.

use crate::collaborators::{Heap, RegionId};
use crate::task::ObjAddr;

/// Any single accumulation step that would push a per-region counter to or
/// past this value is flushed to the heap's atomic counter instead of
/// risking a `u16` overflow.
const OVERFLOW_THRESHOLD: u32 = u16::MAX as u32;

/// Thread-local per-region live-word tally.
///
/// Contention on the heap's per-region atomics is replaced by per-worker
/// accumulation that only escalates to an atomic add when a region's local
/// tally would overflow its 16-bit counter, or at loop exit.
pub struct LivenessCounter {
    local: Vec<u16>,
}

impl LivenessCounter {
    /// Builds a fresh counter for a heap with `region_count` regions, all
    /// tallies zeroed.
    #[must_use]
    pub fn new(region_count: usize) -> Self {
        Self {
            local: vec![0; region_count],
        }
    }

    /// Accounts for `words` live words belonging to `obj`, per spec §4.7.
    /// `words` is `object_model.size_in_words(obj) + metadata_word_count`;
    /// the caller computes it since size lookup is an `ObjectModel`
    /// concern, not a `Heap` one.
    pub fn count(&mut self, heap: &impl Heap, obj: ObjAddr, words: u64) {
        let region = heap.region_of(obj) as usize;

        if words >= u64::from(OVERFLOW_THRESHOLD) {
            heap.region_live_add(region as RegionId, words);
            return;
        }

        let new = u32::from(self.local[region]) + words as u32;
        if new >= OVERFLOW_THRESHOLD {
            heap.region_live_add(region as RegionId, u64::from(new));
            self.local[region] = 0;
        } else {
            self.local[region] = new as u16;
        }
    }

    /// Flushes every non-zero region tally to the heap's global counters.
    /// Called once, at loop exit.
    pub fn flush(&mut self, heap: &impl Heap) {
        for (region, tally) in self.local.iter_mut().enumerate() {
            if *tally > 0 {
                heap.region_live_add(region as RegionId, u64::from(*tally));
                *tally = 0;
            }
        }
    }
}

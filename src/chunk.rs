// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The chunked-array splitting algorithm: turns one large reference-array
//! task into a balanced tree of power-of-two sub-range [`MarkTask`]s so
//! stealers can take halves while the owner still iterates its share.

use crate::task::{MarkTask, ObjAddr};
use core::ops::Range;

/// Smallest subrange processed inline rather than split further.
pub const STRIDE: usize = 4096;

/// Bit budget for the `chunk` field: halving stops once `chunk*2` would
/// reach this. Distinct from [`crate::task::MAX_CHUNK`] (that constant is
/// the largest value the 10-bit field can *hold*, `2^10 - 1`; this one is
/// the splitting algorithm's own stopping bound, `2^10`).
const MAX_CHUNK: u32 = 1024;

fn ceil_log2(n: usize) -> u32 {
    debug_assert!(n > 0);
    let floor = usize::BITS - 1 - n.leading_zeros();
    if n != (1usize << floor) {
        floor + 1
    } else {
        floor
    }
}

/// Opens a freshly-discovered reference array for chunked tracing.
///
/// `push` publishes a sub-chunk task for stealers; `iterate` processes an
/// index range inline, in the caller's own stride budget. Every task
/// `push` receives satisfies `(chunk-1)*2^pow < chunk*2^pow <= length`, so
/// [`chunk_split_continue`] never needs to re-check against the array's
/// length.
pub fn chunk_split_start(
    array: ObjAddr,
    length: usize,
    mut push: impl FnMut(MarkTask),
    mut iterate: impl FnMut(Range<usize>),
) {
    if length <= 2 * STRIDE {
        iterate(0..length);
        return;
    }

    let mut chunk: u32 = 1;
    let mut pow = ceil_log2(length);
    let mut last_idx: usize = 0;

    if pow >= 31 {
        debug_assert_eq!(pow, 31);
        pow -= 1;
        chunk = 2;
        last_idx = 1usize << pow;
        push(MarkTask::from_chunk(array, 1, pow));
    }

    while (1usize << pow) > STRIDE && chunk * 2 < MAX_CHUNK {
        pow -= 1;
        let left_chunk = chunk * 2 - 1;
        let right_chunk = chunk * 2;
        let left_chunk_end = (left_chunk as usize) * (1usize << pow);

        if left_chunk_end < length {
            push(MarkTask::from_chunk(array, left_chunk, pow));
            chunk = right_chunk;
            last_idx = left_chunk_end;
        } else {
            chunk = left_chunk;
        }
    }

    if last_idx < length {
        iterate(last_idx..length);
    }
}

/// Continues chunked tracing of a sub-range task split off by
/// [`chunk_split_start`] (or a previous `chunk_split_continue`).
///
/// Unlike the start path, no length is needed: the invariant established at
/// `chunk_split_start` guarantees `<chunk, pow>` is already fully in-bounds.
pub fn chunk_split_continue(
    array: ObjAddr,
    mut chunk: u32,
    mut pow: u32,
    mut push: impl FnMut(MarkTask),
    mut iterate: impl FnMut(Range<usize>),
) {
    while (1usize << pow) > STRIDE && chunk * 2 < MAX_CHUNK {
        pow -= 1;
        chunk *= 2;
        push(MarkTask::from_chunk(array, chunk - 1, pow));
    }

    let chunk_size = 1usize << pow;
    let from = (chunk as usize - 1) * chunk_size;
    let to = chunk as usize * chunk_size;
    iterate(from..to);
}

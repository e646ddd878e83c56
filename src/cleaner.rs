//! Low-latency buffer cleaner.
//!
//! Zeroes the two ephemeral scratch regions between dispatch/combine
//! iterations. Deliberately leaves the count buffer alone — that's a hard
//! precondition rather than something this function can safely paper over:
//! a stale nonzero count would be misread as "already arrived" by the very
//! next dispatch.
//!
//! `buf0`/`buf1` are named after the low-latency double-buffer convention
//! this protocol uses; a `None` is treated as "buffer absent" rather than
//! an error, matching the real kernel's null-pointer tolerance.

use crate::heap::RankHeap;

pub fn clean_low_latency_buffer(buf0: Option<&RankHeap>, buf1: Option<&RankHeap>) {
    if let Some(heap) = buf0 {
        heap.clean_scratch();
    }
    if let Some(heap) = buf1 {
        heap.clean_scratch();
    }
}

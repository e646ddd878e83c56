//! Grid-wide cooperative synchronization.
//!
//! On real hardware this is `cudaLaunchCooperativeKernel` + a device-wide
//! barrier primitive; all blocks of *one rank's own kernel launch*
//! rendezvous here. It never crosses ranks — cross-rank coordination goes
//! exclusively through [`crate::heap::SymmetricHeap`] one-sided operations.
//! Adapted from a generation-counted `CancellableBarrier`, dropping the
//! cancellation support that isn't needed for an intra-launch barrier but
//! keeping the generation-counter reuse pattern so one `GridBarrier` can be
//! awaited more than once per launch (dispatch needs three rendezvous
//! points, combine needs one plus a separate cross-rank reduction).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

pub struct GridBarrier {
    mutex: Mutex<()>,
    cvar: Condvar,
    count: AtomicUsize,
    total: usize,
    generation: AtomicUsize,
}

impl GridBarrier {
    pub fn new(num_blocks: usize) -> Self {
        Self {
            mutex: Mutex::new(()),
            cvar: Condvar::new(),
            count: AtomicUsize::new(0),
            total: num_blocks,
            generation: AtomicUsize::new(0),
        }
    }

    /// Blocks the calling thread until all `num_blocks` blocks of this
    /// launch have called `wait()` for the current generation.
    pub fn wait(&self) {
        if self.total <= 1 {
            return;
        }
        let mut guard = self.mutex.lock().unwrap();
        let local_gen = self.generation.load(Ordering::Acquire);
        let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if count < self.total {
            while local_gen == self.generation.load(Ordering::Acquire) {
                guard = self.cvar.wait(guard).unwrap();
            }
        } else {
            self.count.store(0, Ordering::Release);
            self.generation.fetch_add(1, Ordering::Release);
            self.cvar.notify_all();
        }
    }
}

//! Binary semaphore that can live inside a shared memory mapping
//!
//! The value is a single `AtomicU32` (`1` = available, `0` = taken), so any
//! process that maps the segment read/write can wait and post on it. Waiting
//! spins briefly and then yields; critical sections guarded by it are a
//! handful of loads and stores.

use std::sync::atomic::{AtomicU32, Ordering};

const AVAILABLE: u32 = 1;
const TAKEN: u32 = 0;

/// Spins before a waiter starts yielding its time slice
const SPINS_BEFORE_YIELD: u32 = 64;

/// Process-shared binary semaphore
#[repr(C)]
pub struct BinarySemaphore {
    value: AtomicU32,
}

impl BinarySemaphore {
    /// A semaphore with its single permit available
    pub const fn new() -> Self {
        Self {
            value: AtomicU32::new(AVAILABLE),
        }
    }

    /// Take the permit, waiting until it is available.
    #[inline]
    pub fn wait(&self) {
        let mut attempt = 0u32;
        while !self.try_wait() {
            backoff(attempt);
            attempt = attempt.saturating_add(1);
        }
    }

    /// Take the permit if it is available right now.
    #[inline]
    pub fn try_wait(&self) -> bool {
        self.value
            .compare_exchange(AVAILABLE, TAKEN, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Return the permit.
    #[inline]
    pub fn post(&self) {
        self.value.store(AVAILABLE, Ordering::Release);
    }

    /// Run `f` while holding the permit.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.wait();
        let _permit = Permit(self);
        f()
    }
}

impl Default for BinarySemaphore {
    fn default() -> Self {
        Self::new()
    }
}

/// Posts on drop so a panicking closure cannot leave the permit taken
struct Permit<'a>(&'a BinarySemaphore);

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.0.post();
    }
}

/// Pause between polls of a busy resource.
#[inline]
pub(crate) fn backoff(attempt: u32) {
    if attempt < SPINS_BEFORE_YIELD {
        core::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
}

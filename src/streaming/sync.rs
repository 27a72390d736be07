//! Data-plane synchronisation primitives.
//!
//! The hot path never takes an OS mutex: per-session control fields sit
//! behind a test-and-set spin lock held for O(ns), and the enqueue /
//! scheduler threads hand off batches through counting flags and a
//! reusable two-phase spin barrier.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

// ---------------------------------------------------------------------------
// SpinLock
// ---------------------------------------------------------------------------

/// Test-and-set spin lock with acquire/release ordering.
///
/// Guards the producer-facing session control fields (`prod_buf` hand-off,
/// `slice_offset`, `state`, `field_id`) and the PTP exchange state. Never
/// hold it across a syscall or a callback that may block.
pub struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// The lock provides the required exclusion.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T> {
    pub fn new(value: T) -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
        SpinGuard { lock: self }
    }
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// SyncFlag - one-shot / counting semaphore
// ---------------------------------------------------------------------------

/// Counting flag used as a one-shot semaphore between thread groups.
///
/// `wait(n)` spins until at least `n` gives have been observed; `give`
/// increments; `clear` rearms it for the next period (scheduler thread 0
/// clears `sched_start` at the end of each period).
pub struct SyncFlag(AtomicU32);

impl SyncFlag {
    pub fn new() -> Self {
        SyncFlag(AtomicU32::new(0))
    }

    pub fn give(&self, value: u32) {
        self.0.fetch_add(value, Ordering::Release);
    }

    pub fn wait(&self, value: u32) {
        while self.0.load(Ordering::Acquire) < value {
            std::hint::spin_loop();
        }
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }
}

impl Default for SyncFlag {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// SpinBarrier - reusable two-phase barrier
// ---------------------------------------------------------------------------

/// Reusable spin barrier for a fixed thread count.
///
/// Thread 0 waits for everyone then resets the counter; the other threads
/// wait for the reset. All waiting spins - the participants are pinned
/// data-plane threads that must not sleep.
pub struct SpinBarrier {
    count: AtomicU32,
    threads: u32,
}

impl SpinBarrier {
    pub fn new(threads: u32) -> Self {
        SpinBarrier {
            count: AtomicU32::new(0),
            threads,
        }
    }

    pub fn sync(&self, thread_id: u32) {
        self.count.fetch_add(1, Ordering::AcqRel);
        if thread_id == 0 {
            while self.count.load(Ordering::Acquire) < self.threads {
                std::hint::spin_loop();
            }
            self.count.store(0, Ordering::Release);
        } else {
            while self.count.load(Ordering::Acquire) != 0 {
                std::hint::spin_loop();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

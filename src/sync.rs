// Copyright The Citadel SM Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The monitor's only lock primitive.
//!
//! Nothing in the monitor ever blocks or spins: every lock acquisition is a
//! single test-and-set that either succeeds or reports contention so the
//! caller can return `ConcurrentCall`. Enclave callers cannot be parked, so
//! a blocking mutex is never acceptable here.

use core::sync::atomic::{AtomicBool, Ordering};

/// A test-and-set flag with try-acquire semantics only.
pub struct TryLock {
    locked: AtomicBool,
}

impl TryLock {
    /// Creates a released lock.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Attempts to acquire the lock. Returns `true` on success, `false` if
    /// it was already held. Never waits.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases the lock.
    ///
    /// Releasing a lock that was not acquired by the caller would hand
    /// mutual exclusion to two cores at once; call sites pair every release
    /// with exactly one successful `try_acquire`.
    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl Default for TryLock {
    fn default() -> Self {
        Self::new()
    }
}

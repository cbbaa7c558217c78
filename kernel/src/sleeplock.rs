// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A sleep-capable mutual exclusion lock for long-held resources.
//!
//! Unlike the short-held spin locks that guard bucket and pool metadata,
//! waiting on a `SleepLock` gives up the core: hosted builds yield the
//! calling thread back to the scheduler between acquisition attempts,
//! bare-metal builds fall back to a pause-hinted spin. Waits are unbounded
//! and resolved only by the holder releasing.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::CachePadded;

/// A mutual exclusion lock whose waiters give up the core.
///
/// `T` is the resource gated by the lock. `lock()` returns a guard; the
/// resource is released (and one waiter can proceed) when the guard drops.
pub(crate) struct SleepLock<T> {
    /// Whether some context currently holds the lock.
    locked: CachePadded<AtomicBool>,

    /// The resource protected by the lock.
    data: UnsafeCell<T>,
}

// SAFETY: The atomic `locked` flag guarantees at most one live guard, so
// access to `data` is exclusive while a guard exists.
unsafe impl<T: Send> Send for SleepLock<T> {}
unsafe impl<T: Send> Sync for SleepLock<T> {}

/// Grants exclusive access to the resource until dropped.
pub(crate) struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

impl<T> SleepLock<T> {
    pub(crate) const fn new(data: T) -> SleepLock<T> {
        SleepLock {
            locked: CachePadded::new(AtomicBool::new(false)),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, suspending the caller until it is available.
    pub(crate) fn lock(&self) -> SleepLockGuard<'_, T> {
        loop {
            match self.locked.compare_exchange_weak(
                false,
                true,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return SleepLockGuard { lock: self },
                Err(_) => Self::wait(),
            }
        }
    }

    /// Whether the lock is currently held by some context.
    pub(crate) fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    #[cfg(not(target_os = "none"))]
    fn wait() {
        std::thread::yield_now();
    }

    #[cfg(target_os = "none")]
    fn wait() {
        core::hint::spin_loop();
    }
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: A live guard implies exclusive ownership of the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: A live guard implies exclusive ownership of the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

impl<T> fmt::Debug for SleepLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SleepLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

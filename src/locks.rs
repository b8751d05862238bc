// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resilient lock helpers.
//!
//! Platform callbacks run on threads we do not own. If one of them panics
//! while holding a lock, the lock is poisoned and every later callback for
//! every other transfer would panic too. These helpers recover the guard
//! instead and log the event, so one bad callback cannot take the whole
//! registry down.
//!
//! ```no_run
//! use std::sync::Mutex;
//! use bgfetch::locks::resilient_lock;
//!
//! let lock = Mutex::new(42);
//! let mut guard = resilient_lock(&lock);
//! *guard = 100;
//! ```

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a mutex, recovering from poisoning if necessary.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "bgfetch::locks",
                event = "LOCK_POISONED",
                "Mutex was poisoned by a panicking callback. Recovering data."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "bgfetch::locks",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned during read acquisition. Recovering data."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "bgfetch::locks",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned during write acquisition. Recovering data."
            );
            poisoned.into_inner()
        }
    }
}

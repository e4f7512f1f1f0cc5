//! Sleeping locks
use core::cell::UnsafeCell;

use super::{Guard, Lock, RawLock, SleepableLock};

/// Long-term locks for kernel threads. Waiters block instead of spinning.
pub struct RawSleepLock {
    /// Whether the lock is held.
    locked: SleepableLock<bool>,
}

/// Locks that sleep instead of busy wait.
pub type SleepLock<T> = Lock<RawSleepLock, T>;
pub type SleepLockGuard<'s, T> = Guard<'s, RawSleepLock, T>;

impl RawSleepLock {
    const fn new(name: &'static str) -> Self {
        Self {
            locked: SleepableLock::new(name, false),
        }
    }
}

impl RawLock for RawSleepLock {
    fn acquire(&self) {
        let mut guard = self.locked.lock();
        while *guard {
            guard.sleep();
        }
        *guard = true;
    }

    fn release(&self) {
        let mut guard = self.locked.lock();
        *guard = false;
        guard.wakeup();
    }
}

impl<T> SleepLock<T> {
    /// Returns a new `SleepLock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSleepLock::new(name),
            data: UnsafeCell::new(data),
        }
    }
}

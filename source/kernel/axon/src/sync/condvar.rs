// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

use core::sync::atomic::{AtomicU64, Ordering};

use super::{Mutex, MutexGuard};

/// Condition variable rendered as an epoch counter.
///
/// Waiters release the associated mutex, watch the epoch for a bounded
/// number of spins and then reacquire. A notification is a single epoch
/// bump, so every waiter observing it wakes; callers re-check their
/// predicate under the reacquired lock as with any condition variable.
pub struct CondVar {
    epoch: AtomicU64,
}

impl CondVar {
    pub const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
        }
    }

    pub fn notify_one(&self) {
        self.epoch.fetch_add(1, Ordering::Release);
    }

    pub fn notify_all(&self) {
        self.epoch.fetch_add(1, Ordering::Release);
    }

    /// Releases `guard`, waits until notified or until `spin_budget`
    /// iterations elapse, then reacquires the mutex.
    ///
    /// Returns the new guard and whether a notification was observed.
    pub fn wait_timeout<'a, T: ?Sized>(
        &self,
        mutex: &'a Mutex<T>,
        guard: MutexGuard<'a, T>,
        spin_budget: usize,
    ) -> (MutexGuard<'a, T>, bool) {
        let seen = self.epoch.load(Ordering::Acquire);
        drop(guard);

        let mut notified = false;
        for _ in 0..spin_budget {
            if self.epoch.load(Ordering::Acquire) != seen {
                notified = true;
                break;
            }
            core::hint::spin_loop();
        }

        (mutex.lock(), notified)
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_without_notification() {
        let mutex = Mutex::new(0_u32);
        let cv = CondVar::new();
        let guard = mutex.lock();
        let (_guard, notified) = cv.wait_timeout(&mutex, guard, 64);
        assert!(!notified);
    }

    #[test]
    fn observes_prior_epoch_bump_from_other_thread() {
        use std::sync::Arc;

        let mutex = Arc::new(Mutex::new(0_u32));
        let cv = Arc::new(CondVar::new());

        let waiter = {
            let mutex = Arc::clone(&mutex);
            let cv = Arc::clone(&cv);
            std::thread::spawn(move || {
                let mut guard = mutex.lock();
                while *guard == 0 {
                    let (reacquired, _) = cv.wait_timeout(&mutex, guard, 1 << 16);
                    guard = reacquired;
                }
                *guard
            })
        };

        {
            let mut guard = mutex.lock();
            *guard = 7;
        }
        cv.notify_one();

        assert_eq!(waiter.join().unwrap(), 7);
    }
}

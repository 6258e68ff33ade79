// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

use core::ops::{Deref, DerefMut};

/// Blocking lock for sections that may allocate or perform backend I/O.
///
/// Holders must not be interrupt context. The wait currently spins; the
/// scheduler hands control away inside `spin_loop` on targets where that
/// is wired up, so contended holders of long sections should be rare by
/// construction (see the lock ordering notes in [`crate::sync`]).
pub struct Mutex<T: ?Sized> {
    inner: spin::Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        MutexGuard {
            inner: self.inner.lock(),
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct MutexGuard<'a, T: ?Sized> {
    inner: spin::MutexGuard<'a, T>,
}

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

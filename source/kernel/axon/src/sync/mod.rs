// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel synchronisation primitives.
//!
//! Two lock classes exist: [`SpinLock`] busy-waits and is safe from
//! interrupt context for short critical sections (page tables, per-CPU
//! shootdown state); [`Mutex`] protects longer sections that may allocate
//! or perform I/O (address spaces, arenas, caches) and pairs with
//! [`CondVar`] for bounded waits.

mod condvar;
mod mutex;
mod spinlock;

pub use condvar::CondVar;
pub use mutex::{Mutex, MutexGuard};
pub use spinlock::{SpinLock, SpinLockGuard};

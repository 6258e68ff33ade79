// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual-memory core.
//!
//! Lock ordering, outermost first: address-space mutex, then the space's
//! page-table spin lock (which doubles as the shootdown rendezvous point),
//! then per-CPU shootdown state. A region backed by a cache takes the
//! address-space mutex and then the cache mutex. Arena locks are acquired
//! parent before child during span import, never the other way around.

use static_assertions::const_assert;

pub mod address_space;
pub mod arena;
pub mod cache;
#[cfg(not(test))]
pub mod heap;
pub mod page;
pub mod page_table;
pub mod tlb;


pub use address_space::{page_fault, AddressSpace, FaultAccess, FaultReason, RegionFlags};
pub use arena::ResourceArena;
pub use cache::PageCache;

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

const_assert!(PAGE_SIZE.is_power_of_two());

/// Errors surfaced by the virtual-memory core.
///
/// `Device` carries a backend I/O status unmodified; retry policy belongs
/// to the backend, never to this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmError {
    /// Misaligned or zero-size request, or an invalid flag combination.
    InvalidArgument,
    /// Address outside the object the request was made against.
    InvalidAddress,
    /// Arena or address-space exhaustion.
    NoSpace,
    /// Physical page exhaustion.
    NoMemory,
    /// Unresolvable page fault: no region, reserved region, or a
    /// permission violation.
    Fault,
    /// Backend I/O failure, status propagated from the device.
    Device(u32),
}

#[inline]
pub const fn page_align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

#[inline]
pub const fn page_align_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(value: usize) -> bool {
    value % PAGE_SIZE == 0
}

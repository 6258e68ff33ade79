// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Opaque hardware page-table primitive.
//!
//! Maps page-aligned virtual addresses to physical frames. The hardware
//! entry format belongs to the architecture layer; this structure is the
//! portable contract the address-space manager programs against. Callers
//! access a table through its [`crate::sync::SpinLock`], whose observable
//! state is what remote shootdown responders poll before invalidating.

use alloc::collections::BTreeMap;

use bitflags::bitflags;

use crate::mm::{is_page_aligned, VmError};
use crate::types::PhysAddr;

#[cfg(feature = "failpoints")]
use core::sync::atomic::{AtomicBool, Ordering};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Permissions stored in a page-table entry.
    pub struct PageFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
    }
}

#[cfg(feature = "failpoints")]
static DENY_NEXT_INSERT: AtomicBool = AtomicBool::new(false);

/// One translation installed in a page table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Translation {
    pub frame: PhysAddr,
    pub flags: PageFlags,
}

/// Portable page table: page-aligned virtual address to translation.
pub struct PageTable {
    entries: BTreeMap<usize, Translation>,
}

impl PageTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Installs a translation for `va`.
    ///
    /// Intermediate table pages may need allocating on real hardware, so
    /// insertion can fail with `NoMemory`; the fault path must release the
    /// backing page when that happens.
    pub fn insert(&mut self, va: usize, frame: PhysAddr, flags: PageFlags) -> Result<(), VmError> {
        if !is_page_aligned(va) {
            return Err(VmError::InvalidArgument);
        }
        if !flags.contains(PageFlags::VALID) {
            return Err(VmError::InvalidArgument);
        }
        if self.entries.contains_key(&va) {
            return Err(VmError::InvalidAddress);
        }

        #[cfg(feature = "failpoints")]
        if DENY_NEXT_INSERT.swap(false, Ordering::AcqRel) {
            return Err(VmError::NoMemory);
        }

        self.entries.insert(va, Translation { frame, flags });
        Ok(())
    }

    /// Removes the translation for `va`, returning the frame it covered.
    pub fn remove(&mut self, va: usize) -> Option<PhysAddr> {
        self.entries.remove(&va).map(|entry| entry.frame)
    }

    /// Looks up the translation installed at `va`.
    pub fn lookup(&self, va: usize) -> Option<Translation> {
        if !is_page_aligned(va) {
            return None;
        }
        self.entries.get(&va).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "failpoints")]
pub mod failpoints {
    use super::DENY_NEXT_INSERT;
    use core::sync::atomic::Ordering;

    /// Forces the next [`super::PageTable::insert`] to report `NoMemory`.
    pub fn deny_next_insert() {
        DENY_NEXT_INSERT.store(true, Ordering::Release);
    }
}

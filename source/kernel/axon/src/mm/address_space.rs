// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-process address spaces.
//!
//! An address space is an ordered set of non-overlapping regions, each
//! mapping a contiguous range onto a [`PageSource`]. Sources are shared:
//! splitting a region leaves both halves holding the same source with
//! adjusted offsets. Pages materialise lazily through the fault path and
//! are returned to their source when a range is unmapped, after the TLB
//! shootdown that makes the unmapping visible everywhere.
//!
//! Lock order: the per-space mutex, then the page-table spin lock. The
//! page-table lock doubles as the rendezvous point remote shootdown
//! responders poll, so it is released only once every responder has
//! acknowledged (see [`crate::mm::tlb`]).

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::mm::cache::PageCache;
use crate::mm::page_table::{PageFlags, PageTable, Translation};
use crate::mm::{is_page_aligned, page_align_down, tlb, VmError, PAGE_SIZE};
use crate::smp;
use crate::sync::{Mutex, SpinLock};
use crate::types::{CpuId, PhysAddr};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Permissions and behaviour of one region.
    pub struct RegionFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// The region only reserves its range: it is never backed and
        /// faults inside it are unresolvable.
        const RESERVED = 1 << 3;
    }
}

/// Why the fault was raised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultReason {
    /// No translation was present for the address.
    NotPresent,
    /// A translation exists but forbids the access. Never resolvable:
    /// copy-on-write is deliberately not implemented.
    Protection,
}

/// The access that raised the fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultAccess {
    Read,
    Write,
    Execute,
}

/// Supplier of pages for mapped regions.
///
/// `get` hands out the page backing `offset` with a reference held for
/// the caller; `release` returns that reference once the page is no
/// longer mapped. The offset passed in already includes the region's and
/// the source's own offsets.
pub trait Backend: Send + Sync {
    fn get(&self, offset: u64) -> Result<PhysAddr, VmError>;
    fn release(&self, offset: u64);

    /// Veto hook consulted before a mapping of this backend is installed.
    fn validate_map(&self, _offset: u64, _size: usize, _flags: RegionFlags) -> Result<(), VmError> {
        Ok(())
    }
}

/// Named, shared indirection between regions and a [`Backend`].
///
/// Regions hold strong references; when the last one drops the backend is
/// destroyed with it.
pub struct PageSource {
    name: String,
    offset: u64,
    backend: Box<dyn Backend>,
}

impl PageSource {
    pub fn new(name: impl Into<String>, offset: u64, backend: Box<dyn Backend>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            offset,
            backend,
        })
    }

    /// Zero-fill anonymous memory covering `size` bytes.
    pub fn anonymous(size: u64) -> Arc<Self> {
        Self::new("[anon]", 0, Box::new(PageCache::anonymous(size)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, offset: u64) -> Result<PhysAddr, VmError> {
        self.backend.get(self.offset + offset)
    }

    fn release(&self, offset: u64) {
        self.backend.release(self.offset + offset);
    }

    fn validate_map(&self, offset: u64, size: usize, flags: RegionFlags) -> Result<(), VmError> {
        self.backend.validate_map(self.offset + offset, size, flags)
    }
}

#[derive(Clone)]
struct Region {
    start: usize,
    end: usize,
    flags: RegionFlags,
    /// Absent only for reserved regions.
    source: Option<Arc<PageSource>>,
    offset: u64,
}

/// Read-only view of one region, for inspection and debugging.
#[derive(Clone, Debug)]
pub struct RegionInfo {
    pub start: usize,
    pub end: usize,
    pub flags: RegionFlags,
    pub source: Option<String>,
    pub offset: u64,
}

struct SpaceInner {
    regions: BTreeMap<usize, Region>,
    /// Start key of the last region a lookup hit. Faults frequently walk
    /// a freshly mapped region, so one entry captures most of the reuse.
    find_cache: Option<usize>,
}

/// One address space: region set plus the hardware page table.
pub struct AddressSpace {
    base: usize,
    size: usize,
    kernel: bool,
    /// CPUs currently executing in this space.
    cpus_using: AtomicUsize,
    inner: Mutex<SpaceInner>,
    page_table: SpinLock<PageTable>,
}

impl AddressSpace {
    fn create(base: usize, size: usize, kernel: bool) -> Arc<Self> {
        assert!(is_page_aligned(base) && is_page_aligned(size) && size > 0);
        assert!(base.checked_add(size).is_some());
        Arc::new(Self {
            base,
            size,
            kernel,
            cpus_using: AtomicUsize::new(0),
            inner: Mutex::new(SpaceInner {
                regions: BTreeMap::new(),
                find_cache: None,
            }),
            page_table: SpinLock::new(PageTable::new()),
        })
    }

    /// Creates a process address space over `[base, base + size)`.
    pub fn new(base: usize, size: usize) -> Arc<Self> {
        Self::create(base, size, false)
    }

    /// Creates the kernel's own address space. Shootdowns against it hit
    /// every CPU unconditionally.
    pub fn new_kernel(base: usize, size: usize) -> Arc<Self> {
        let space = Self::create(base, size, true);
        *KERNEL_SPACE.lock() = Some(space.clone());
        space
    }

    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    /// Number of CPUs currently executing in this space.
    pub fn cpus_using(&self) -> usize {
        self.cpus_using.load(Ordering::Acquire)
    }

    pub(crate) fn page_table_locked(&self) -> bool {
        self.page_table.is_locked()
    }

    fn fits(&self, start: usize, size: usize) -> bool {
        let Some(end) = start.checked_add(size) else {
            return false;
        };
        start >= self.base && end <= self.base + self.size
    }

    /// Looks up the translation currently installed for `va`.
    pub fn translation(&self, va: usize) -> Option<Translation> {
        self.page_table.lock().lookup(page_align_down(va))
    }

    /// Maps `size` bytes of `source` starting at `offset`, placed in the
    /// first sufficiently large gap. Returns the chosen address.
    pub fn alloc(
        &self,
        size: usize,
        flags: RegionFlags,
        source: Arc<PageSource>,
        offset: u64,
    ) -> Result<usize, VmError> {
        if size == 0 || !is_page_aligned(size) || !is_page_aligned(offset as usize) {
            return Err(VmError::InvalidArgument);
        }
        if flags.contains(RegionFlags::RESERVED) {
            return Err(VmError::InvalidArgument);
        }
        source.validate_map(offset, size, flags)?;

        let mut inner = self.inner.lock();
        let start = self.find_gap(&inner, size).ok_or(VmError::NoSpace)?;
        inner.regions.insert(
            start,
            Region {
                start,
                end: start + size,
                flags,
                source: Some(source),
                offset,
            },
        );
        log_debug!(
            target: "vm",
            "mapped [{:#x}, {:#x}) flags {:?}",
            start,
            start + size,
            flags
        );
        Ok(start)
    }

    /// Maps `size` bytes of `source` at the fixed address `addr`,
    /// clearing whatever occupied the range first.
    pub fn insert(
        &self,
        addr: usize,
        size: usize,
        flags: RegionFlags,
        source: Arc<PageSource>,
        offset: u64,
    ) -> Result<(), VmError> {
        if size == 0 || !is_page_aligned(addr) || !is_page_aligned(size) {
            return Err(VmError::InvalidArgument);
        }
        if !is_page_aligned(offset as usize) || flags.contains(RegionFlags::RESERVED) {
            return Err(VmError::InvalidArgument);
        }
        if !self.fits(addr, size) {
            return Err(VmError::InvalidArgument);
        }
        source.validate_map(offset, size, flags)?;

        let mut inner = self.inner.lock();
        self.clear_range(&mut inner, addr, addr + size);
        inner.regions.insert(
            addr,
            Region {
                start: addr,
                end: addr + size,
                flags,
                source: Some(source),
                offset,
            },
        );
        Ok(())
    }

    /// Reserves `[addr, addr + size)`: the range is never handed out by
    /// [`AddressSpace::alloc`] and faults inside it are unresolvable. The
    /// reservation can be replaced by a fixed-address insert or removed
    /// with [`AddressSpace::free`].
    pub fn reserve(&self, addr: usize, size: usize) -> Result<(), VmError> {
        if size == 0 || !is_page_aligned(addr) || !is_page_aligned(size) || !self.fits(addr, size) {
            return Err(VmError::InvalidArgument);
        }

        let mut inner = self.inner.lock();
        self.clear_range(&mut inner, addr, addr + size);
        inner.regions.insert(
            addr,
            Region {
                start: addr,
                end: addr + size,
                flags: RegionFlags::RESERVED,
                source: None,
                offset: 0,
            },
        );
        Ok(())
    }

    /// Unmaps `[addr, addr + size)`, shrinking, splitting or removing
    /// every region it overlaps and releasing the pages that were mapped
    /// there.
    pub fn free(&self, addr: usize, size: usize) -> Result<(), VmError> {
        if size == 0 || !is_page_aligned(addr) || !is_page_aligned(size) || !self.fits(addr, size) {
            return Err(VmError::InvalidArgument);
        }

        let mut inner = self.inner.lock();
        self.clear_range(&mut inner, addr, addr + size);
        log_debug!(target: "vm", "freed [{:#x}, {:#x})", addr, addr + size);
        Ok(())
    }

    /// Resolves a page fault at `addr` raised on this space.
    pub fn handle_fault(
        &self,
        addr: usize,
        reason: FaultReason,
        access: FaultAccess,
    ) -> Result<(), VmError> {
        // A translation that exists but denies the access cannot be
        // repaired here.
        if reason == FaultReason::Protection {
            return Err(VmError::Fault);
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(key) = Self::find_region(inner, addr) else {
            return Err(VmError::Fault);
        };
        let region = inner.regions.get(&key).expect("stale find cache");
        if region.flags.contains(RegionFlags::RESERVED) {
            return Err(VmError::Fault);
        }

        let allowed = match access {
            FaultAccess::Read => region.flags.contains(RegionFlags::READ),
            FaultAccess::Write => region.flags.contains(RegionFlags::WRITE),
            FaultAccess::Execute => region.flags.contains(RegionFlags::EXEC),
        };
        if !allowed {
            return Err(VmError::Fault);
        }

        let source = region
            .source
            .clone()
            .expect("mapped region without a source");
        let page_addr = page_align_down(addr);
        let offset = (page_addr - region.start) as u64 + region.offset;

        let frame = match source.get(offset) {
            Ok(frame) => frame,
            Err(err) => {
                log_debug!(target: "vm", "fault at {:#x}: backend error {:?}", addr, err);
                return Err(VmError::Fault);
            }
        };

        let flags = Self::page_flags(region.flags, self.kernel);
        let mut table = self.page_table.lock();
        match table.insert(page_addr, frame, flags) {
            Ok(()) => Ok(()),
            Err(err) => {
                drop(table);
                source.release(offset);
                log_debug!(target: "vm", "fault at {:#x}: table insert {:?}", addr, err);
                Err(VmError::Fault)
            }
        }
    }

    /// Tears down every remaining region. The space must not be in use on
    /// any CPU; that indicates kernel-internal corruption and halts.
    pub fn destroy(&self) {
        if self.cpus_using() != 0 {
            panic!("destroying in-use address space");
        }
        self.teardown();
    }

    fn teardown(&self) {
        let mut inner = self.inner.lock();
        inner.find_cache = None;
        loop {
            let key = match inner.regions.keys().next() {
                Some(&key) => key,
                None => break,
            };
            let region = inner.regions.remove(&key).expect("key just observed");
            self.unmap_range(&region, region.start, region.end);
        }
    }

    /// Ordered snapshot of every region, for inspection.
    pub fn regions(&self) -> Vec<RegionInfo> {
        let inner = self.inner.lock();
        inner
            .regions
            .values()
            .map(|region| RegionInfo {
                start: region.start,
                end: region.end,
                flags: region.flags,
                source: region.source.as_ref().map(|s| String::from(s.name())),
                offset: region.offset,
            })
            .collect()
    }

    fn page_flags(flags: RegionFlags, kernel: bool) -> PageFlags {
        let mut out = PageFlags::VALID;
        if flags.contains(RegionFlags::READ) {
            out |= PageFlags::READ;
        }
        if flags.contains(RegionFlags::WRITE) {
            out |= PageFlags::WRITE;
        }
        if flags.contains(RegionFlags::EXEC) {
            out |= PageFlags::EXECUTE;
        }
        if !kernel {
            out |= PageFlags::USER;
        }
        out
    }

    /// Region covering `addr`, consulting the one-entry find cache first.
    fn find_region(inner: &mut SpaceInner, addr: usize) -> Option<usize> {
        if let Some(key) = inner.find_cache {
            if let Some(region) = inner.regions.get(&key) {
                if region.start <= addr && addr < region.end {
                    return Some(key);
                }
            }
        }

        let (&key, region) = inner.regions.range(..=addr).next_back()?;
        if addr < region.end {
            inner.find_cache = Some(key);
            Some(key)
        } else {
            None
        }
    }

    fn next_region_at_or_after(inner: &SpaceInner, addr: usize) -> Option<usize> {
        inner.regions.range(addr..).next().map(|(&key, _)| key)
    }

    /// First-fit gap scan, including the gaps before the first region and
    /// after the last.
    fn find_gap(&self, inner: &SpaceInner, size: usize) -> Option<usize> {
        let mut cursor = self.base;
        for region in inner.regions.values() {
            if region.start - cursor >= size {
                return Some(cursor);
            }
            cursor = region.end;
        }
        if self.base + self.size - cursor >= size {
            Some(cursor)
        } else {
            None
        }
    }

    /// Unmaps the pages of `region` inside `[start, end)` and releases
    /// them to the source, after the shootdown making the removal visible.
    fn unmap_range(&self, region: &Region, start: usize, end: usize) {
        debug_assert!(is_page_aligned(start) && is_page_aligned(end));
        debug_assert!(start >= region.start && end <= region.end);
        if region.flags.contains(RegionFlags::RESERVED) {
            return;
        }
        let source = region
            .source
            .as_ref()
            .expect("mapped region without a source");

        let mut released = Vec::new();
        let mut table = self.page_table.lock();
        let mut addr = start;
        while addr < end {
            if table.remove(addr).is_some() {
                released.push((addr - region.start) as u64 + region.offset);
            }
            addr += PAGE_SIZE;
        }

        // The shootdown consumes the page-table lock and releases it only
        // once every CPU sharing this space has acknowledged.
        tlb::shootdown(self, table, start, end);

        for offset in released {
            source.release(offset);
        }
    }

    /// Makes `[start, end)` entirely uncovered, shrinking, splitting or
    /// removing every overlapping region.
    fn clear_range(&self, inner: &mut SpaceInner, start: usize, end: usize) {
        inner.find_cache = None;

        let mut cursor = match Self::find_region(inner, start) {
            Some(key) => key,
            None => match Self::next_region_at_or_after(inner, start) {
                Some(key) if key < end => key,
                _ => return,
            },
        };
        inner.find_cache = None;

        if cursor < start {
            // The leading region begins before the range.
            let region_end = inner.regions[&cursor].end;
            if region_end == end {
                self.shrink_high(inner, cursor, start);
                return;
            } else if region_end < end {
                self.shrink_high(inner, cursor, start);
                cursor = match Self::next_region_at_or_after(inner, start) {
                    Some(key) => key,
                    None => return,
                };
            } else {
                self.split_region(inner, cursor, start, end);
                return;
            }
        }

        // Consume whole regions until one extends past the range.
        while cursor < end {
            let region_end = inner.regions[&cursor].end;
            if region_end <= end {
                self.remove_region(inner, cursor);
                cursor = match Self::next_region_at_or_after(inner, cursor) {
                    Some(key) => key,
                    None => return,
                };
            } else {
                self.shrink_low(inner, cursor, end);
                return;
            }
        }
    }

    /// Trims the tail of a region down to `new_end`.
    fn shrink_high(&self, inner: &mut SpaceInner, key: usize, new_end: usize) {
        let snapshot = inner.regions[&key].clone();
        debug_assert!(new_end > snapshot.start && new_end < snapshot.end);
        self.unmap_range(&snapshot, new_end, snapshot.end);
        inner.regions.get_mut(&key).expect("region vanished").end = new_end;
    }

    /// Trims the head of a region up to `new_start`, re-keying it.
    fn shrink_low(&self, inner: &mut SpaceInner, key: usize, new_start: usize) {
        let snapshot = inner.regions[&key].clone();
        debug_assert!(new_start > snapshot.start && new_start < snapshot.end);
        self.unmap_range(&snapshot, snapshot.start, new_start);

        let mut region = inner.regions.remove(&key).expect("region vanished");
        if !region.flags.contains(RegionFlags::RESERVED) {
            region.offset += (new_start - region.start) as u64;
        }
        region.start = new_start;
        inner.regions.insert(new_start, region);
    }

    /// Cuts `[hole_start, hole_end)` out of the middle of a region,
    /// leaving two regions sharing the source.
    fn split_region(&self, inner: &mut SpaceInner, key: usize, hole_start: usize, hole_end: usize) {
        let snapshot = inner.regions[&key].clone();
        debug_assert!(hole_start > snapshot.start && hole_end < snapshot.end);
        self.unmap_range(&snapshot, hole_start, hole_end);

        let tail = Region {
            start: hole_end,
            end: snapshot.end,
            flags: snapshot.flags,
            // The second half shares the first's source.
            source: snapshot.source.clone(),
            offset: if snapshot.flags.contains(RegionFlags::RESERVED) {
                0
            } else {
                snapshot.offset + (hole_end - snapshot.start) as u64
            },
        };
        inner.regions.get_mut(&key).expect("region vanished").end = hole_start;
        inner.regions.insert(hole_end, tail);
    }

    /// Unmaps and drops a whole region.
    fn remove_region(&self, inner: &mut SpaceInner, key: usize) {
        let region = inner.regions.remove(&key).expect("region vanished");
        self.unmap_range(&region, region.start, region.end);
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // The per-CPU slots hold strong references, so by the time the
        // last one drops no CPU can be executing here.
        self.teardown();
    }
}

/// The kernel's own address space, once created. Shootdown responders
/// consult it for kernel-range invalidations regardless of what their CPU
/// is currently running.
static KERNEL_SPACE: SpinLock<Option<Arc<AddressSpace>>> = SpinLock::new(None);

pub fn kernel_space() -> Option<Arc<AddressSpace>> {
    KERNEL_SPACE.lock().clone()
}

#[cfg(test)]
pub(crate) fn reset_kernel_space_for_tests() {
    *KERNEL_SPACE.lock() = None;
}

/// Installs `space` as `cpu`'s current address space; `None` switches to
/// the kernel's own mappings.
///
/// Only reference counts and a per-CPU slot are touched, so this is safe
/// to call with interrupts disabled from the scheduler.
pub fn switch(cpu: CpuId, space: Option<Arc<AddressSpace>>) {
    if let Some(new) = space.as_ref() {
        new.cpus_using.fetch_add(1, Ordering::AcqRel);
    }
    let old = smp::swap_current_space(cpu, space);
    if let Some(old) = old {
        old.cpus_using.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Page-fault entry point, resolved against the faulting CPU's current
/// address space. Unresolvable faults surface as [`VmError::Fault`] for
/// the trap handler to turn into a process-fatal signal.
pub fn page_fault(addr: usize, reason: FaultReason, access: FaultAccess) -> Result<(), VmError> {
    let cpu = smp::cpu_current_id();
    match smp::current_space(cpu) {
        Some(space) => space.handle_fault(addr, reason, access),
        None => Err(VmError::Fault),
    }
}

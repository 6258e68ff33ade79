// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-granular cache of an addressable object's contents.
//!
//! Each cached page moves through a small lifecycle: referenced pages are
//! `Allocated`; when the last reference goes away they become
//! `CachedDirty` (modified, and a write-back operation exists) or
//! `CachedClean`, staying resident until the cache shrinks past them or is
//! destroyed. Backend I/O runs with the cache lock dropped so a slow
//! device never blocks unrelated lookups; the miss path re-checks the
//! index afterwards and defers to whichever thread inserted first.
//!
//! A cache is itself a region [`Backend`], which makes it the default
//! page source for mappable objects; [`PageCache::anonymous`] is the
//! zero-fill flavour used for memory not backed by any data source.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::mm::address_space::Backend;
use crate::mm::{page, VmError, PAGE_SIZE};
use crate::sync::Mutex;
use crate::types::PhysAddr;

/// Backing store for a cache: filled on miss, written on flush.
///
/// Errors propagate unmodified to the caller that triggered the I/O;
/// retry policy belongs to the implementation.
pub trait CacheOps: Send + Sync {
    fn read_page(&self, buf: &mut [u8], offset: u64) -> Result<(), VmError>;
    fn write_page(&self, buf: &[u8], offset: u64) -> Result<(), VmError>;
}

/// Lifecycle state of one cached page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    /// At least one reference is held.
    Allocated,
    /// Unreferenced with modifications pending write-back.
    CachedDirty,
    /// Unreferenced and clean.
    CachedClean,
}

struct CachedPage {
    frame: PhysAddr,
    refs: u32,
    dirty: bool,
    state: PageState,
}

/// Read-only view of one cached page, for inspection and debugging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachePageInfo {
    pub offset: u64,
    pub refs: u32,
    pub dirty: bool,
    pub state: PageState,
}

struct CacheInner {
    pages: BTreeMap<u64, CachedPage>,
    size: u64,
    /// Set once destruction begins so a concurrent flush initiated from
    /// an eviction path notices and backs off.
    deleted: bool,
}

/// Page-granular cache over `[0, size)` of some object.
pub struct PageCache {
    inner: Mutex<CacheInner>,
    ops: Option<Arc<dyn CacheOps>>,
}

/// Direction and buffer of one positional I/O request.
pub enum IoBuffer<'a> {
    /// Transfer cache contents into the buffer.
    Read(&'a mut [u8]),
    /// Transfer the buffer into the cache.
    Write(&'a [u8]),
}

/// Positional I/O spanning any number of pages, clipped to the cache
/// size.
pub struct IoRequest<'a> {
    offset: u64,
    buffer: IoBuffer<'a>,
    transferred: usize,
}

impl<'a> IoRequest<'a> {
    pub fn new(offset: u64, buffer: IoBuffer<'a>) -> Self {
        Self {
            offset,
            buffer,
            transferred: 0,
        }
    }

    /// Bytes moved so far.
    pub fn transferred(&self) -> usize {
        self.transferred
    }

    fn is_write(&self) -> bool {
        matches!(self.buffer, IoBuffer::Write(_))
    }

    fn remaining(&self) -> usize {
        let len = match &self.buffer {
            IoBuffer::Read(buf) => buf.len(),
            IoBuffer::Write(buf) => buf.len(),
        };
        len - self.transferred
    }

    /// Moves up to `page.len()` bytes between the buffer and `page`.
    fn transfer(&mut self, page: &mut [u8]) -> usize {
        let count = self.remaining().min(page.len());
        match &mut self.buffer {
            IoBuffer::Read(buf) => {
                buf[self.transferred..self.transferred + count].copy_from_slice(&page[..count]);
            }
            IoBuffer::Write(buf) => {
                page[..count].copy_from_slice(&buf[self.transferred..self.transferred + count]);
            }
        }
        self.transferred += count;
        count
    }
}

impl PageCache {
    /// Creates a cache over `[0, size)`, reading and writing through
    /// `ops` when present.
    pub fn new(size: u64, ops: Option<Arc<dyn CacheOps>>) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                pages: BTreeMap::new(),
                size,
                deleted: false,
            }),
            ops,
        }
    }

    /// Cache with no backing store: misses are zero-filled and nothing is
    /// ever written back.
    pub fn anonymous(size: u64) -> Self {
        Self::new(size, None)
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Gets the page at `offset`, taking a reference on it.
    ///
    /// On a miss the page's contents are read from the backing store (or
    /// zero-filled without one) unless `overwrite` says the caller is
    /// about to replace every byte anyway.
    pub fn get(&self, offset: u64, overwrite: bool) -> Result<PhysAddr, VmError> {
        if offset % PAGE_SIZE as u64 != 0 {
            return Err(VmError::InvalidArgument);
        }

        let mut inner = self.inner.lock();
        assert!(!inner.deleted, "get on a destroyed cache");

        if offset >= inner.size {
            return Err(VmError::InvalidAddress);
        }

        if let Some(page) = inner.pages.get_mut(&offset) {
            page.refs += 1;
            page.state = PageState::Allocated;
            return Ok(page.frame);
        }

        let frame = page::alloc_frame()?;

        if !overwrite {
            if let Some(ops) = self.ops.clone() {
                // Read with the lock dropped; device I/O must not block
                // unrelated lookups.
                drop(inner);
                let read = page::with_frame(frame, |bytes| ops.read_page(bytes, offset));
                if let Err(err) = read {
                    page::free_frame(frame);
                    return Err(err);
                }

                inner = self.inner.lock();
                assert!(!inner.deleted, "get on a destroyed cache");
                if offset >= inner.size {
                    drop(inner);
                    page::free_frame(frame);
                    return Err(VmError::InvalidAddress);
                }
                if let Some(existing) = inner.pages.get_mut(&offset) {
                    // Another thread won the miss; use its page.
                    existing.refs += 1;
                    existing.state = PageState::Allocated;
                    let theirs = existing.frame;
                    drop(inner);
                    page::free_frame(frame);
                    return Ok(theirs);
                }
            } else {
                page::zero_frame(frame);
            }
        }

        inner.pages.insert(
            offset,
            CachedPage {
                frame,
                refs: 1,
                dirty: false,
                state: PageState::Allocated,
            },
        );
        log_trace!(target: "cache", "cached {} at offset {:#x}", frame, offset);
        Ok(frame)
    }

    /// Drops one reference to the page at `offset`.
    ///
    /// Releasing an offset that is not cached, or one with no references
    /// outstanding, indicates corruption and halts the kernel.
    pub fn release(&self, offset: u64, dirty: bool) {
        let mut inner = self.inner.lock();
        let has_write = self.ops.is_some();
        let size = inner.size;

        let discard = {
            let page = match inner.pages.get_mut(&offset) {
                Some(page) => page,
                None => panic!("releasing page that was never cached"),
            };
            assert!(page.refs > 0, "releasing page with no references");

            if dirty {
                page.dirty = true;
            }
            page.refs -= 1;
            if page.refs > 0 {
                return;
            }

            if offset >= size {
                // The cache shrank while the page was in use.
                true
            } else if page.dirty && has_write {
                page.state = PageState::CachedDirty;
                false
            } else {
                page.dirty = false;
                page.state = PageState::CachedClean;
                false
            }
        };

        if discard {
            let page = inner.pages.remove(&offset).expect("page just observed");
            drop(inner);
            page::free_frame(page.frame);
        }
    }

    /// Writes the page at `offset` back if it is dirty.
    ///
    /// The dirty flag is only cleared while the page is unreferenced: a
    /// referenced page may still be mapped writable somewhere.
    pub fn flush_page(&self, offset: u64) -> Result<(), VmError> {
        let inner = self.inner.lock();
        if inner.deleted {
            return Ok(());
        }
        let (frame, ops) = match inner.pages.get(&offset) {
            Some(page) if page.dirty && offset < inner.size => {
                let ops = self
                    .ops
                    .clone()
                    .expect("dirty page in a cache without write-back");
                (page.frame, ops)
            }
            _ => return Ok(()),
        };
        drop(inner);

        let result = page::with_frame(frame, |bytes| ops.write_page(bytes, offset));

        let mut inner = self.inner.lock();
        if result.is_ok() && !inner.deleted {
            if let Some(page) = inner.pages.get_mut(&offset) {
                if page.refs == 0 && page.frame == frame {
                    page.dirty = false;
                    page.state = PageState::CachedClean;
                }
            }
        }
        result
    }

    /// Writes back every dirty page.
    ///
    /// Carries on past individual failures and reports the most recent
    /// error.
    pub fn flush(&self) -> Result<(), VmError> {
        let offsets: Vec<u64> = {
            let inner = self.inner.lock();
            inner
                .pages
                .iter()
                .filter(|(_, page)| page.dirty)
                .map(|(&offset, _)| offset)
                .collect()
        };

        let mut result = Ok(());
        for offset in offsets {
            if let Err(err) = self.flush_page(offset) {
                result = Err(err);
            }
        }
        result
    }

    /// Performs positional I/O, clipped to the cache's current size.
    ///
    /// Partial head and tail pages are handled as sub-page copies; whole
    /// pages written in one go skip the read-before-write a partial copy
    /// would need.
    pub fn io(&self, request: &mut IoRequest<'_>) -> Result<(), VmError> {
        let mut total = {
            let inner = self.inner.lock();
            if request.offset >= inner.size || request.remaining() == 0 {
                return Ok(());
            }
            request
                .remaining()
                .min((inner.size - request.offset) as usize)
        };

        let is_write = request.is_write();
        let mut pos = request.offset;

        // Partial transfer on the initial page brings us up to a page
        // boundary; a transfer inside a single page ends here too.
        let head = (pos % PAGE_SIZE as u64) as usize;
        if head != 0 {
            let page_start = pos - head as u64;
            let count = total.min(PAGE_SIZE - head);
            let frame = self.get(page_start, false)?;
            page::with_frame(frame, |bytes| request.transfer(&mut bytes[head..head + count]));
            self.release(page_start, is_write);
            total -= count;
            pos = page_start + PAGE_SIZE as u64;
        }

        while total >= PAGE_SIZE {
            // A whole-page write replaces every byte, so a cold page need
            // not be read in first.
            let frame = self.get(pos, is_write)?;
            page::with_frame(frame, |bytes| request.transfer(bytes));
            self.release(pos, is_write);
            total -= PAGE_SIZE;
            pos += PAGE_SIZE as u64;
        }

        if total > 0 {
            let frame = self.get(pos, false)?;
            page::with_frame(frame, |bytes| request.transfer(&mut bytes[..total]));
            self.release(pos, is_write);
        }

        Ok(())
    }

    /// Reads into `buf` from `offset`, returning the bytes transferred.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, VmError> {
        let mut request = IoRequest::new(offset, IoBuffer::Read(buf));
        self.io(&mut request)?;
        Ok(request.transferred())
    }

    /// Writes `buf` at `offset`, returning the bytes transferred.
    pub fn write(&self, buf: &[u8], offset: u64) -> Result<usize, VmError> {
        let mut request = IoRequest::new(offset, IoBuffer::Write(buf));
        self.io(&mut request)?;
        Ok(request.transferred())
    }

    /// Changes the cache's size.
    ///
    /// Unreferenced pages beyond the new size are freed immediately;
    /// referenced ones are caught when released.
    pub fn resize(&self, size: u64) {
        let mut inner = self.inner.lock();

        let mut freed = Vec::new();
        if size < inner.size {
            let stale: Vec<u64> = inner
                .pages
                .range(size..)
                .filter(|(_, page)| page.refs == 0)
                .map(|(&offset, _)| offset)
                .collect();
            for offset in stale {
                let page = inner.pages.remove(&offset).expect("offset just observed");
                freed.push(page.frame);
            }
        }
        inner.size = size;
        drop(inner);

        for frame in freed {
            page::free_frame(frame);
        }
    }

    /// Destroys the cache's contents.
    ///
    /// Every page must be unreferenced; a referenced page indicates
    /// corruption and halts the kernel. Unless `discard` is set, dirty
    /// pages are written back first and the first failure aborts the
    /// destruction (clearing the deleted mark again).
    pub fn destroy(&self, discard: bool) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        inner.deleted = true;

        loop {
            let (offset, refs, dirty, frame) = match inner.pages.iter().next() {
                Some((&offset, page)) => (offset, page.refs, page.dirty, page.frame),
                None => break,
            };
            if refs != 0 {
                panic!("cache page still in use while destroying");
            }

            if !discard && dirty {
                let ops = self
                    .ops
                    .clone()
                    .expect("dirty page in a cache without write-back");
                let write = page::with_frame(frame, |bytes| ops.write_page(bytes, offset));
                if let Err(err) = write {
                    inner.deleted = false;
                    return Err(err);
                }
            }

            inner.pages.remove(&offset).expect("offset just observed");
            page::free_frame(frame);
        }

        Ok(())
    }

    /// Ordered snapshot of every cached page, for inspection.
    pub fn pages(&self) -> Vec<CachePageInfo> {
        let inner = self.inner.lock();
        inner
            .pages
            .iter()
            .map(|(&offset, page)| CachePageInfo {
                offset,
                refs: page.refs,
                dirty: page.dirty,
                state: page.state,
            })
            .collect()
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for (offset, page) in core::mem::take(&mut inner.pages) {
            if page.refs == 0 {
                page::free_frame(page.frame);
            } else {
                log_warn!(
                    target: "cache",
                    "dropping cache with offset {:#x} still referenced",
                    offset
                );
            }
        }
    }
}

impl Backend for PageCache {
    fn get(&self, offset: u64) -> Result<PhysAddr, VmError> {
        PageCache::get(self, offset, false)
    }

    fn release(&self, offset: u64) {
        // The unmap path cannot tell whether the mapping was written
        // through, so assume it was; caches without write-back drop the
        // flag again on release.
        PageCache::release(self, offset, true);
    }
}

impl Backend for Arc<PageCache> {
    fn get(&self, offset: u64) -> Result<PhysAddr, VmError> {
        PageCache::get(self, offset, false)
    }

    fn release(&self, offset: u64) {
        PageCache::release(self, offset, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SpinLock;
    use crate::test_support;
    use core::sync::atomic::{AtomicUsize, Ordering};

    const PAGE: u64 = PAGE_SIZE as u64;

    /// Backing store over a byte vector, counting backend traffic.
    struct RecordingOps {
        store: SpinLock<Vec<u8>>,
        reads: AtomicUsize,
        writes: AtomicUsize,
        fail_write_at: SpinLock<Option<u64>>,
    }

    impl RecordingOps {
        fn new(pages: usize, fill: u8) -> Arc<Self> {
            Arc::new(Self {
                store: SpinLock::new(alloc::vec![fill; pages * PAGE_SIZE]),
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
                fail_write_at: SpinLock::new(None),
            })
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::Acquire)
        }

        fn writes(&self) -> usize {
            self.writes.load(Ordering::Acquire)
        }

        fn fail_write_at(&self, offset: u64) {
            *self.fail_write_at.lock() = Some(offset);
        }

        fn clear_failure(&self) {
            *self.fail_write_at.lock() = None;
        }

        fn byte_at(&self, offset: u64) -> u8 {
            self.store.lock()[offset as usize]
        }
    }

    impl CacheOps for RecordingOps {
        fn read_page(&self, buf: &mut [u8], offset: u64) -> Result<(), VmError> {
            self.reads.fetch_add(1, Ordering::AcqRel);
            let store = self.store.lock();
            let start = offset as usize;
            buf.copy_from_slice(&store[start..start + PAGE_SIZE]);
            Ok(())
        }

        fn write_page(&self, buf: &[u8], offset: u64) -> Result<(), VmError> {
            self.writes.fetch_add(1, Ordering::AcqRel);
            if *self.fail_write_at.lock() == Some(offset) {
                return Err(VmError::Device(5));
            }
            let mut store = self.store.lock();
            let start = offset as usize;
            store[start..start + PAGE_SIZE].copy_from_slice(buf);
            Ok(())
        }
    }

    fn frame_bytes(frame: PhysAddr) -> Vec<u8> {
        page::with_frame(frame, |bytes| bytes.to_vec())
    }

    #[test]
    fn miss_without_backing_store_zero_fills() {
        let _guard = test_support::lock();
        test_support::reset_all();

        let cache = PageCache::anonymous(4 * PAGE);
        let frame = cache.get(0, false).unwrap();
        assert!(frame_bytes(frame).iter().all(|&b| b == 0));
        cache.release(0, false);
        cache.destroy(true).unwrap();
    }

    #[test]
    fn miss_with_backing_store_reads_it() {
        let _guard = test_support::lock();
        test_support::reset_all();

        let ops = RecordingOps::new(2, 0xab);
        let cache = PageCache::new(2 * PAGE, Some(ops.clone()));
        let frame = cache.get(PAGE, false).unwrap();
        assert_eq!(ops.reads(), 1);
        assert!(frame_bytes(frame).iter().all(|&b| b == 0xab));

        // A hit takes another reference without touching the backend.
        cache.get(PAGE, false).unwrap();
        assert_eq!(ops.reads(), 1);
        assert_eq!(cache.pages()[0].refs, 2);

        cache.release(PAGE, false);
        cache.release(PAGE, false);
        cache.destroy(true).unwrap();
    }

    #[test]
    fn out_of_range_and_misaligned_offsets_are_rejected() {
        let _guard = test_support::lock();
        test_support::reset_all();

        let cache = PageCache::anonymous(2 * PAGE);
        assert_eq!(cache.get(2 * PAGE, false), Err(VmError::InvalidAddress));
        assert_eq!(cache.get(1, false), Err(VmError::InvalidArgument));
        cache.destroy(true).unwrap();
    }

    #[test]
    fn dirty_flag_survives_reuse_until_flushed() {
        let _guard = test_support::lock();
        test_support::reset_all();

        let ops = RecordingOps::new(1, 0);
        let cache = PageCache::new(PAGE, Some(ops.clone()));

        cache.get(0, false).unwrap();
        cache.release(0, true);
        assert_eq!(cache.pages()[0].state, PageState::CachedDirty);

        // Re-promoting and releasing clean does not lose the dirt.
        cache.get(0, false).unwrap();
        cache.release(0, false);
        assert!(cache.pages()[0].dirty);

        cache.flush().unwrap();
        assert_eq!(ops.writes(), 1);
        assert_eq!(cache.pages()[0].state, PageState::CachedClean);

        cache.destroy(false).unwrap();
        // Nothing was dirty anymore.
        assert_eq!(ops.writes(), 1);
    }

    #[test]
    fn dirty_without_write_back_degrades_to_clean() {
        let _guard = test_support::lock();
        test_support::reset_all();

        let cache = PageCache::anonymous(PAGE);
        cache.get(0, false).unwrap();
        cache.release(0, true);
        assert_eq!(cache.pages()[0].state, PageState::CachedClean);
        assert!(!cache.pages()[0].dirty);
        cache.destroy(false).unwrap();
    }

    #[test]
    fn whole_page_writes_skip_the_read() {
        let _guard = test_support::lock();
        test_support::reset_all();

        let ops = RecordingOps::new(2, 0x11);
        let cache = PageCache::new(2 * PAGE, Some(ops.clone()));

        let data = alloc::vec![0x5a; PAGE_SIZE];
        assert_eq!(cache.write(&data, PAGE).unwrap(), PAGE_SIZE);
        assert_eq!(ops.reads(), 0);

        // A partial write must read the cold page first.
        assert_eq!(cache.write(&data[..0x200], 0x400).unwrap(), 0x200);
        assert_eq!(ops.reads(), 1);

        cache.destroy(false).unwrap();
        assert_eq!(ops.byte_at(PAGE), 0x5a);
        assert_eq!(ops.byte_at(0x400), 0x5a);
        assert_eq!(ops.byte_at(0), 0x11);
    }

    #[test]
    fn io_round_trips_across_partial_head_and_tail() {
        let _guard = test_support::lock();
        test_support::reset_all();

        let cache = PageCache::anonymous(4 * PAGE);
        let pattern: Vec<u8> = (0..0x2800usize).map(|i| i as u8).collect();
        assert_eq!(cache.write(&pattern, 0x800).unwrap(), pattern.len());

        let mut readback = alloc::vec![0u8; pattern.len()];
        assert_eq!(cache.read(&mut readback, 0x800).unwrap(), pattern.len());
        assert_eq!(readback, pattern);

        // Bytes around the written range stayed zero.
        let mut edges = alloc::vec![0xffu8; 0x800];
        cache.read(&mut edges, 0).unwrap();
        assert!(edges.iter().all(|&b| b == 0));

        cache.destroy(true).unwrap();
    }

    #[test]
    fn io_is_clipped_to_the_cache_size() {
        let _guard = test_support::lock();
        test_support::reset_all();

        let cache = PageCache::anonymous(2 * PAGE);
        let data = alloc::vec![7u8; PAGE_SIZE];
        let written = cache.write(&data, 2 * PAGE - 0x800).unwrap();
        assert_eq!(written, 0x800);

        let mut buf = alloc::vec![0u8; PAGE_SIZE];
        assert_eq!(cache.read(&mut buf, 3 * PAGE).unwrap(), 0);

        cache.destroy(true).unwrap();
    }

    #[test]
    fn resize_frees_unreferenced_pages_and_defers_referenced_ones() {
        let _guard = test_support::lock();
        test_support::reset_all();
        let baseline = test_support::frames().outstanding();

        let cache = PageCache::anonymous(4 * PAGE);
        cache.get(0, false).unwrap();
        cache.release(0, false);
        cache.get(3 * PAGE, false).unwrap();
        assert_eq!(test_support::frames().outstanding(), baseline + 2);

        cache.resize(PAGE);
        // Offset 0 survives, offset 3 is still referenced.
        assert_eq!(cache.pages().len(), 2);

        cache.release(3 * PAGE, false);
        assert_eq!(cache.pages().len(), 1);
        assert_eq!(test_support::frames().outstanding(), baseline + 1);

        cache.destroy(true).unwrap();
        assert_eq!(test_support::frames().outstanding(), baseline);
    }

    #[test]
    fn destroy_discard_never_writes_back() {
        let _guard = test_support::lock();
        test_support::reset_all();

        let ops = RecordingOps::new(2, 0);
        let cache = PageCache::new(2 * PAGE, Some(ops.clone()));
        cache.get(0, false).unwrap();
        cache.release(0, true);

        cache.destroy(true).unwrap();
        assert_eq!(ops.writes(), 0);
    }

    #[test]
    fn destroy_writes_each_dirty_page_exactly_once() {
        let _guard = test_support::lock();
        test_support::reset_all();

        let ops = RecordingOps::new(3, 0);
        let cache = PageCache::new(3 * PAGE, Some(ops.clone()));
        for offset in [0, PAGE] {
            cache.get(offset, false).unwrap();
            cache.release(offset, true);
        }
        cache.get(2 * PAGE, false).unwrap();
        cache.release(2 * PAGE, false);

        cache.destroy(false).unwrap();
        assert_eq!(ops.writes(), 2);
    }

    #[test]
    fn destroy_aborts_on_the_first_failed_write_back() {
        let _guard = test_support::lock();
        test_support::reset_all();

        let ops = RecordingOps::new(2, 0);
        let cache = PageCache::new(2 * PAGE, Some(ops.clone()));
        for offset in [0, PAGE] {
            cache.get(offset, false).unwrap();
            cache.release(offset, true);
        }

        ops.fail_write_at(0);
        assert_eq!(cache.destroy(false), Err(VmError::Device(5)));

        // The cache is usable again; clearing the fault lets it finish.
        ops.clear_failure();
        cache.destroy(false).unwrap();
        assert_eq!(cache.pages().len(), 0);
    }

    #[test]
    fn flush_continues_past_failures_and_reports_the_last_error() {
        let _guard = test_support::lock();
        test_support::reset_all();

        let ops = RecordingOps::new(2, 0);
        let cache = PageCache::new(2 * PAGE, Some(ops.clone()));
        for offset in [0, PAGE] {
            cache.get(offset, false).unwrap();
            cache.release(offset, true);
        }

        ops.fail_write_at(0);
        assert_eq!(cache.flush(), Err(VmError::Device(5)));
        assert_eq!(ops.writes(), 2);

        let pages = cache.pages();
        assert!(pages[0].dirty);
        assert!(!pages[1].dirty);

        cache.destroy(true).unwrap();
    }

    #[test]
    fn flush_keeps_dirty_set_while_the_page_is_referenced() {
        let _guard = test_support::lock();
        test_support::reset_all();

        let ops = RecordingOps::new(1, 0);
        let cache = PageCache::new(PAGE, Some(ops.clone()));
        cache.get(0, false).unwrap();
        cache.release(0, true);
        // Map it again; it may be writable somewhere.
        cache.get(0, false).unwrap();

        cache.flush().unwrap();
        assert_eq!(ops.writes(), 1);
        assert!(cache.pages()[0].dirty);

        cache.release(0, false);
        cache.destroy(true).unwrap();
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn frame_exhaustion_propagates() {
        let _guard = test_support::lock();
        test_support::reset_all();

        let cache = PageCache::anonymous(PAGE);
        page::failpoints::deny_next_frame();
        assert_eq!(cache.get(0, false), Err(VmError::NoMemory));
        cache.destroy(true).unwrap();
    }

    #[test]
    #[should_panic(expected = "never cached")]
    fn releasing_an_uncached_offset_is_fatal() {
        let _guard = test_support::lock();
        test_support::reset_all();

        let cache = PageCache::anonymous(PAGE);
        cache.release(0, false);
    }
}

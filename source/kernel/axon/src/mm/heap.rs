// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel heap backing `alloc` in `no_std` images.
//!
//! Host test builds use the platform allocator instead; this module is
//! compiled out there.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use linked_list_allocator::Heap;

use crate::sync::SpinLock;

pub struct KernelHeap {
    inner: SpinLock<Heap>,
}

impl KernelHeap {
    const fn empty() -> Self {
        Self {
            inner: SpinLock::new(Heap::empty()),
        }
    }
}

// SAFETY: the linked-list heap hands out unique blocks; the spin lock
// serialises all mutation.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.inner
            .lock()
            .allocate_first_fit(layout)
            .map(|block| block.as_ptr())
            .unwrap_or(core::ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.inner.lock().deallocate(ptr, layout);
        }
    }
}

#[global_allocator]
static HEAP: KernelHeap = KernelHeap::empty();

/// Hands the heap its backing range.
///
/// # Safety
///
/// Must be called exactly once during early boot, with a range that is
/// mapped, writable and unused by anything else for the kernel's lifetime.
pub unsafe fn init(start: *mut u8, size: usize) {
    HEAP.inner.lock().init(start, size);
    log_info!(target: "mm", "heap: {} KiB at {:p}", size / 1024, start);
}

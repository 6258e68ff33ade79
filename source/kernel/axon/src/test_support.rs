// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host-side stand-ins for the external collaborators: a frame allocator
//! over leaked heap pages and a recording IPI transport. Tests touching
//! per-CPU or global state serialise through [`lock`].

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Once;

use std::boxed::Box;
use std::sync::{Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use std::vec::Vec;

use crate::mm::page::{self, FrameAllocator};
use crate::mm::{tlb, VmError, PAGE_SIZE};
use crate::smp::{self, IpiError, IpiTransport, MAX_CPUS};
use crate::sync::SpinLock;
use crate::types::{CpuId, PhysAddr};

static TEST_LOCK: StdMutex<()> = StdMutex::new(());

/// Serialises tests that depend on process-global kernel state.
pub(crate) fn lock() -> StdMutexGuard<'static, ()> {
    // A should_panic test may poison the lock; the state it guards is
    // reset at the start of every test anyway.
    TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

#[repr(align(4096))]
struct FrameStorage([u8; PAGE_SIZE]);

/// Frame allocator backed by leaked, page-aligned host allocations.
pub(crate) struct TestFrameAllocator {
    free: SpinLock<Vec<u64>>,
    outstanding: AtomicUsize,
}

impl TestFrameAllocator {
    const fn new() -> Self {
        Self {
            free: SpinLock::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Frames currently handed out and not yet returned.
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl FrameAllocator for TestFrameAllocator {
    fn alloc_frame(&self) -> Result<PhysAddr, VmError> {
        let addr = self.free.lock().pop().unwrap_or_else(|| {
            Box::leak(Box::new(FrameStorage([0; PAGE_SIZE]))) as *mut FrameStorage as u64
        });
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(PhysAddr::from_raw(addr))
    }

    fn free_frame(&self, frame: PhysAddr) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.free.lock().push(frame.as_raw());
    }

    fn frame_ptr(&self, frame: PhysAddr) -> *mut u8 {
        frame.as_raw() as *mut u8
    }
}

/// Transport that counts sends; delivery happens when a test drives the
/// responder.
pub(crate) struct TestIpi {
    sent: [AtomicUsize; MAX_CPUS],
}

impl TestIpi {
    const fn new() -> Self {
        Self {
            sent: [const { AtomicUsize::new(0) }; MAX_CPUS],
        }
    }

    pub(crate) fn sends_to(&self, cpu: CpuId) -> usize {
        self.sent[cpu.as_index()].load(Ordering::Acquire)
    }

    pub(crate) fn total_sends(&self) -> usize {
        self.sent.iter().map(|count| count.load(Ordering::Acquire)).sum()
    }

    fn reset(&self) {
        for count in &self.sent {
            count.store(0, Ordering::Release);
        }
    }
}

impl IpiTransport for TestIpi {
    fn send(&self, target: CpuId) -> Result<(), IpiError> {
        if !smp::cpu_is_online(target) {
            return Err(IpiError::Unreachable);
        }
        self.sent[target.as_index()].fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

static FRAMES: TestFrameAllocator = TestFrameAllocator::new();
static IPI: TestIpi = TestIpi::new();
static INSTALL: Once<()> = Once::new();

fn install() {
    INSTALL.call_once(|| {
        page::register_frame_allocator(&FRAMES);
        smp::register_ipi_transport(&IPI);
    });
}

pub(crate) fn frames() -> &'static TestFrameAllocator {
    install();
    &FRAMES
}

pub(crate) fn ipi() -> &'static TestIpi {
    install();
    &IPI
}

/// Clears every piece of process-global kernel state a test can observe.
pub(crate) fn reset_all() {
    install();
    smp::reset_for_tests();
    tlb::reset_for_tests();
    crate::mm::address_space::reset_kernel_space_for_tests();
    IPI.reset();
}

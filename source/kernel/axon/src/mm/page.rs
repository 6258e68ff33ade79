// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical frame allocator and scheduler hooks, consumed as external
//! collaborators.
//!
//! The frame allocator is registered once at boot. `frame_ptr` is the
//! direct-map translation giving the kernel byte access to a frame; every
//! temporary access the VM core makes is bracketed with the scheduler's
//! wire/unwire hooks so a thread cannot migrate while it holds a mapping
//! only valid on its CPU.

use spin::Once;

use crate::mm::{VmError, PAGE_SIZE};
use crate::types::PhysAddr;

#[cfg(feature = "failpoints")]
use core::sync::atomic::{AtomicBool, Ordering};

/// Provider of physical page frames.
pub trait FrameAllocator: Send + Sync {
    fn alloc_frame(&self) -> Result<PhysAddr, VmError>;
    fn free_frame(&self, frame: PhysAddr);
    /// Kernel-accessible pointer to the frame's bytes (direct map).
    fn frame_ptr(&self, frame: PhysAddr) -> *mut u8;
}

/// Scheduler integration for temporary frame access.
pub trait ThreadHooks: Send + Sync {
    /// Pins the current thread to its CPU.
    fn wire(&self) {}
    /// Releases the pin taken by [`ThreadHooks::wire`].
    fn unwire(&self) {}
}

struct NoHooks;

impl ThreadHooks for NoHooks {}

static FRAME_ALLOCATOR: Once<&'static dyn FrameAllocator> = Once::new();
static THREAD_HOOKS: Once<&'static dyn ThreadHooks> = Once::new();

#[cfg(feature = "failpoints")]
static DENY_NEXT_FRAME: AtomicBool = AtomicBool::new(false);

/// Registers the frame allocator. Later registrations are ignored.
pub fn register_frame_allocator(allocator: &'static dyn FrameAllocator) {
    FRAME_ALLOCATOR.call_once(|| allocator);
}

/// Registers the scheduler thread hooks. Later registrations are ignored.
pub fn register_thread_hooks(hooks: &'static dyn ThreadHooks) {
    THREAD_HOOKS.call_once(|| hooks);
}

fn allocator() -> &'static dyn FrameAllocator {
    match FRAME_ALLOCATOR.get() {
        Some(allocator) => *allocator,
        None => panic!("frame allocator used before registration"),
    }
}

fn hooks() -> &'static dyn ThreadHooks {
    static DEFAULT: NoHooks = NoHooks;
    match THREAD_HOOKS.get() {
        Some(hooks) => *hooks,
        None => &DEFAULT,
    }
}

pub(crate) fn alloc_frame() -> Result<PhysAddr, VmError> {
    #[cfg(feature = "failpoints")]
    if DENY_NEXT_FRAME.swap(false, Ordering::AcqRel) {
        return Err(VmError::NoMemory);
    }

    allocator().alloc_frame()
}

pub(crate) fn free_frame(frame: PhysAddr) {
    allocator().free_frame(frame);
}

/// Runs `f` over the frame's bytes with the calling thread wired to its
/// CPU for the duration.
pub(crate) fn with_frame<R>(frame: PhysAddr, f: impl FnOnce(&mut [u8]) -> R) -> R {
    let hooks = hooks();
    hooks.wire();
    // SAFETY: the allocator's direct map covers one whole frame, and the
    // caller holds a reference on the frame keeping it allocated.
    let bytes = unsafe { core::slice::from_raw_parts_mut(allocator().frame_ptr(frame), PAGE_SIZE) };
    let result = f(bytes);
    hooks.unwire();
    result
}

pub(crate) fn zero_frame(frame: PhysAddr) {
    with_frame(frame, |bytes| bytes.fill(0));
}

#[cfg(feature = "failpoints")]
pub mod failpoints {
    use super::DENY_NEXT_FRAME;
    use core::sync::atomic::Ordering;

    /// Forces the next frame allocation to report exhaustion.
    pub fn deny_next_frame() {
        DENY_NEXT_FRAME.store(true, Ordering::Release);
    }
}

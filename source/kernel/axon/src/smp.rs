// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CPU identity, online mask and per-CPU address-space state.
//!
//! The inter-processor transport used by the TLB shootdown protocol is
//! registered here; the kernel assumes its delivery is reliable, so a
//! transport error is treated as fatal by the caller.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Once;
use static_assertions::const_assert;

use crate::mm::address_space::AddressSpace;
use crate::sync::SpinLock;
use crate::types::CpuId;

#[cfg(feature = "failpoints")]
use core::sync::atomic::AtomicBool;

/// Fixed CPU ceiling for deterministic bring-up and bounded per-CPU state.
pub const MAX_CPUS: usize = 4;

// The online mask lives in a single word.
const_assert!(MAX_CPUS <= usize::BITS as usize);

static CPU_ONLINE_MASK: AtomicUsize = AtomicUsize::new(0);

/// Address space each CPU is currently executing in. `None` means the CPU
/// is running on the kernel's own mappings.
static CURRENT_SPACE: [SpinLock<Option<Arc<AddressSpace>>>; MAX_CPUS] =
    [const { SpinLock::new(None) }; MAX_CPUS];

#[cfg(feature = "failpoints")]
static FORCE_IPI_SEND_FAIL: AtomicBool = AtomicBool::new(false);

/// Returns the identity of the executing CPU.
///
/// Architecture integration supplies the real answer on hardware; host
/// builds always run on the boot CPU.
#[inline]
pub fn cpu_current_id() -> CpuId {
    CpuId::BOOT
}

#[inline]
pub fn cpu_online_mask() -> usize {
    CPU_ONLINE_MASK.load(Ordering::Acquire)
}

#[inline]
pub fn cpu_is_online(cpu: CpuId) -> bool {
    let idx = cpu.as_index();
    idx < MAX_CPUS && cpu_online_mask() & (1 << idx) != 0
}

/// Marks a CPU online, emitting the marker exactly once per CPU.
pub fn mark_cpu_online(cpu: CpuId) {
    let idx = cpu.as_index();
    if idx >= MAX_CPUS {
        return;
    }
    let bit = 1usize << idx;
    let previous = CPU_ONLINE_MASK.fetch_or(bit, Ordering::AcqRel);
    if previous & bit == 0 {
        log_info!(target: "smp", "cpu{} online", idx);
    }
}

/// Returns the address space `cpu` is currently executing in, if any.
pub fn current_space(cpu: CpuId) -> Option<Arc<AddressSpace>> {
    let idx = cpu.as_index();
    if idx >= MAX_CPUS {
        return None;
    }
    CURRENT_SPACE[idx].lock().clone()
}

/// Whether `cpu` is currently executing in `space`.
pub(crate) fn space_is_current_on(cpu: CpuId, space: &AddressSpace) -> bool {
    let idx = cpu.as_index();
    if idx >= MAX_CPUS {
        return false;
    }
    let slot = CURRENT_SPACE[idx].lock();
    match slot.as_ref() {
        Some(current) => core::ptr::eq(Arc::as_ptr(current), space),
        None => false,
    }
}

/// Installs `new` as the CPU's current space, returning the previous one.
///
/// Only spin locks are touched, so this is safe with interrupts disabled
/// (it is invoked from the scheduler's context-switch path).
pub(crate) fn swap_current_space(
    cpu: CpuId,
    new: Option<Arc<AddressSpace>>,
) -> Option<Arc<AddressSpace>> {
    let idx = cpu.as_index();
    assert!(idx < MAX_CPUS, "switch on unknown cpu{}", idx);
    let mut slot = CURRENT_SPACE[idx].lock();
    core::mem::replace(&mut *slot, new)
}

/// Error delivering an inter-processor message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpiError {
    /// No transport has been registered yet.
    TransportMissing,
    /// The transport could not reach the target CPU.
    Unreachable,
}

/// Inter-processor message transport.
///
/// `send` must cause [`crate::mm::tlb::handle_shootdown_ipi`] to run on
/// the target CPU; the payload travels in the per-CPU mailbox, not the
/// message itself.
pub trait IpiTransport: Send + Sync {
    fn send(&self, target: CpuId) -> Result<(), IpiError>;
}

static TRANSPORT: Once<&'static dyn IpiTransport> = Once::new();

/// Registers the IPI transport. Later registrations are ignored.
pub fn register_ipi_transport(transport: &'static dyn IpiTransport) {
    TRANSPORT.call_once(|| transport);
}

/// Sends an IPI to `target`.
pub(crate) fn send_ipi(target: CpuId) -> Result<(), IpiError> {
    #[cfg(feature = "failpoints")]
    if FORCE_IPI_SEND_FAIL.load(Ordering::Acquire) {
        return Err(IpiError::Unreachable);
    }

    match TRANSPORT.get() {
        Some(transport) => transport.send(target),
        None => Err(IpiError::TransportMissing),
    }
}

#[cfg(feature = "failpoints")]
pub mod failpoints {
    use super::FORCE_IPI_SEND_FAIL;
    use core::sync::atomic::Ordering;

    /// Forces every subsequent IPI send to fail until cleared.
    pub fn force_ipi_send_failure(enable: bool) {
        FORCE_IPI_SEND_FAIL.store(enable, Ordering::Release);
    }
}

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    for slot in &CURRENT_SPACE {
        *slot.lock() = None;
    }
    CPU_ONLINE_MASK.store(1, Ordering::Release);
    #[cfg(feature = "failpoints")]
    FORCE_IPI_SEND_FAIL.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_mask_tracks_marked_cpus() {
        let _guard = crate::test_support::lock();
        reset_for_tests();

        mark_cpu_online(CpuId::from_raw(2));
        assert!(cpu_is_online(CpuId::BOOT));
        assert!(cpu_is_online(CpuId::from_raw(2)));
        assert!(!cpu_is_online(CpuId::from_raw(1)));
    }

    #[test]
    fn out_of_range_cpu_is_never_online() {
        let _guard = crate::test_support::lock();
        reset_for_tests();

        assert!(!cpu_is_online(CpuId::from_raw(MAX_CPUS as u16)));
        assert!(current_space(CpuId::from_raw(MAX_CPUS as u16)).is_none());
    }
}

// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Cross-CPU TLB shootdown.
//!
//! Initiator protocol: invalidate locally if this CPU uses the target
//! space (always, for the kernel's space); return immediately when no
//! other CPU can hold a stale translation; otherwise post a message to
//! every CPU running the target space, raise an IPI and hold the space's
//! page-table lock until all of them acknowledge.
//!
//! Responder protocol: acknowledge first, since receipt alone is enough
//! to unblock the initiator; then re-check that this CPU still runs the
//! target space (it may have switched away), wait for the page-table lock
//! to be observed unlocked so the triggering update is visible, and
//! invalidate the local range. The lock is only ever held for short
//! critical sections, so the wait stays brief.
//!
//! Message delivery is assumed-reliable infrastructure; a send failure
//! halts the kernel.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::mm::address_space::{kernel_space, AddressSpace};
use crate::mm::page_table::PageTable;
use crate::smp::{self, MAX_CPUS};
use crate::sync::{SpinLock, SpinLockGuard};
use crate::types::CpuId;

/// One in-flight shootdown request against a CPU. Lives only for the
/// duration of the rendezvous.
#[derive(Clone, Copy)]
struct ShootdownMsg {
    from: CpuId,
    /// Identity of the target space (never dereferenced).
    space_ptr: usize,
    kernel: bool,
    start: usize,
    end: usize,
}

/// Single-slot mailboxes; an initiator waits for a slot to drain before
/// reusing it.
static MAILBOX: [SpinLock<Option<ShootdownMsg>>; MAX_CPUS] =
    [const { SpinLock::new(None) }; MAX_CPUS];

/// Outstanding acknowledgements per *initiating* CPU.
static ACK_PENDING: [AtomicUsize; MAX_CPUS] = [const { AtomicUsize::new(0) }; MAX_CPUS];

/// Local invalidations performed per CPU. The architecture layer hooks
/// the actual TLB flush instruction off the same path.
static FLUSH_COUNT: [AtomicUsize; MAX_CPUS] = [const { AtomicUsize::new(0) }; MAX_CPUS];

fn local_flush(cpu: CpuId, start: usize, end: usize) {
    FLUSH_COUNT[cpu.as_index()].fetch_add(1, Ordering::AcqRel);
    log_trace!(target: "tlb", "cpu{}: flush [{:#x}, {:#x})", cpu, start, end);
}

/// Number of local invalidations `cpu` has performed.
pub fn flush_evidence(cpu: CpuId) -> usize {
    FLUSH_COUNT[cpu.as_index()].load(Ordering::Acquire)
}

/// Invalidate `[start, end)` of `space` on every CPU that may hold stale
/// translations.
///
/// Called with the space's page-table lock held, after the translations
/// have been removed; the lock is released once every targeted CPU has
/// acknowledged, which is what lets responders order their invalidation
/// after the update.
pub(crate) fn shootdown(
    space: &AddressSpace,
    table: SpinLockGuard<'_, PageTable>,
    start: usize,
    end: usize,
) {
    let me = smp::cpu_current_id();
    let using_here = smp::space_is_current_on(me, space);

    if space.is_kernel() || using_here {
        local_flush(me, start, end);
    }

    // Sole ownership: nobody else can hold a stale translation.
    if !space.is_kernel() && space.cpus_using() <= using_here as usize {
        drop(table);
        return;
    }

    let mut targets = 0usize;
    for idx in 0..MAX_CPUS {
        let cpu = CpuId::from_raw(idx as u16);
        if cpu == me || !smp::cpu_is_online(cpu) {
            continue;
        }
        if space.is_kernel() || smp::space_is_current_on(cpu, space) {
            targets |= 1 << idx;
        }
    }
    if targets == 0 {
        drop(table);
        return;
    }

    let msg_template = ShootdownMsg {
        from: me,
        space_ptr: space as *const AddressSpace as usize,
        kernel: space.is_kernel(),
        start,
        end,
    };

    for idx in 0..MAX_CPUS {
        if targets & (1 << idx) == 0 {
            continue;
        }
        let cpu = CpuId::from_raw(idx as u16);

        // Wait out any previous occupant of the slot, then post ours.
        loop {
            let mut slot = MAILBOX[idx].lock();
            if slot.is_none() {
                *slot = Some(msg_template);
                break;
            }
            drop(slot);
            core::hint::spin_loop();
        }

        ACK_PENDING[me.as_index()].fetch_add(1, Ordering::AcqRel);
        if let Err(err) = smp::send_ipi(cpu) {
            panic!("unable to deliver shootdown message to cpu{}: {:?}", cpu, err);
        }
    }

    // Synchronous: all targeted CPUs must acknowledge receipt before the
    // page-table lock is dropped.
    while ACK_PENDING[me.as_index()].load(Ordering::Acquire) != 0 {
        core::hint::spin_loop();
    }

    drop(table);
}

/// Responder entry, invoked on the targeted CPU by the IPI trap handler.
///
/// Returns whether a message was processed.
pub fn handle_shootdown_ipi(cpu: CpuId) -> bool {
    let message = MAILBOX[cpu.as_index()].lock().take();
    let Some(msg) = message else {
        return false;
    };

    // Acknowledge receipt first so the initiator can continue while we
    // wait for the update to become visible.
    ACK_PENDING[msg.from.as_index()].fetch_sub(1, Ordering::AcqRel);

    // Re-check: this CPU may have switched away since it was targeted.
    let target: Option<Arc<AddressSpace>> = if msg.kernel {
        kernel_space()
    } else {
        smp::current_space(cpu)
            .filter(|current| Arc::as_ptr(current) as usize == msg.space_ptr)
    };
    let Some(target) = target else {
        return true;
    };

    // The initiator still holds the page-table lock; it is only ever held
    // for short critical sections, so spin until the update is visible.
    while target.page_table_locked() {
        core::hint::spin_loop();
    }

    local_flush(cpu, msg.start, msg.end);
    true
}

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    for slot in &MAILBOX {
        *slot.lock() = None;
    }
    for counter in &ACK_PENDING {
        counter.store(0, Ordering::Release);
    }
    for counter in &FLUSH_COUNT {
        counter.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::address_space::{switch, PageSource, RegionFlags};
    use crate::mm::{FaultAccess, FaultReason, PAGE_SIZE};
    use crate::test_support;

    fn faulted_space(cpu: CpuId) -> (Arc<AddressSpace>, usize) {
        let space = AddressSpace::new(0x1000_0000, 0x100_0000);
        let source = PageSource::anonymous(0x10000);
        let addr = space
            .alloc(4 * PAGE_SIZE, RegionFlags::READ | RegionFlags::WRITE, source, 0)
            .unwrap();
        switch(cpu, Some(space.clone()));
        space
            .handle_fault(addr, FaultReason::NotPresent, FaultAccess::Write)
            .unwrap();
        (space, addr)
    }

    #[test]
    fn sole_owner_flushes_locally_without_messages() {
        let _guard = test_support::lock();
        test_support::reset_all();

        let (space, addr) = faulted_space(CpuId::BOOT);
        let sends_before = test_support::ipi().total_sends();

        space.free(addr, 4 * PAGE_SIZE).unwrap();

        assert_eq!(flush_evidence(CpuId::BOOT), 1);
        assert_eq!(test_support::ipi().total_sends(), sends_before);

        switch(CpuId::BOOT, None);
        space.destroy();
    }

    #[test]
    fn unused_space_sends_nothing_and_skips_local_flush() {
        let _guard = test_support::lock();
        test_support::reset_all();

        let space = AddressSpace::new(0x1000_0000, 0x100_0000);
        let source = PageSource::anonymous(0x10000);
        let addr = space
            .alloc(PAGE_SIZE, RegionFlags::READ, source, 0)
            .unwrap();
        space.free(addr, PAGE_SIZE).unwrap();

        assert_eq!(flush_evidence(CpuId::BOOT), 0);
        assert_eq!(test_support::ipi().total_sends(), 0);
    }

    #[test]
    fn remote_user_is_messaged_and_flushes_after_ack() {
        let _guard = test_support::lock();
        test_support::reset_all();

        let remote = CpuId::from_raw(1);
        smp::mark_cpu_online(remote);

        let (space, addr) = faulted_space(remote);

        let responder = std::thread::spawn(move || {
            while !handle_shootdown_ipi(CpuId::from_raw(1)) {
                std::thread::yield_now();
            }
        });

        space.free(addr, 4 * PAGE_SIZE).unwrap();
        responder.join().unwrap();

        assert_eq!(test_support::ipi().sends_to(remote), 1);
        assert_eq!(flush_evidence(remote), 1);
        // The initiating CPU never used the space.
        assert_eq!(flush_evidence(CpuId::BOOT), 0);

        switch(remote, None);
        space.destroy();
    }

    #[test]
    fn every_cpu_running_the_space_is_messaged() {
        let _guard = test_support::lock();
        test_support::reset_all();

        let first = CpuId::from_raw(1);
        let second = CpuId::from_raw(2);
        smp::mark_cpu_online(first);
        smp::mark_cpu_online(second);

        let (space, addr) = faulted_space(first);
        switch(second, Some(space.clone()));

        let responders: std::vec::Vec<_> = [1u16, 2]
            .into_iter()
            .map(|raw| {
                std::thread::spawn(move || {
                    while !handle_shootdown_ipi(CpuId::from_raw(raw)) {
                        std::thread::yield_now();
                    }
                })
            })
            .collect();

        space.free(addr, 4 * PAGE_SIZE).unwrap();
        for responder in responders {
            responder.join().unwrap();
        }

        assert_eq!(test_support::ipi().sends_to(first), 1);
        assert_eq!(test_support::ipi().sends_to(second), 1);
        assert_eq!(flush_evidence(first), 1);
        assert_eq!(flush_evidence(second), 1);
        assert_eq!(flush_evidence(CpuId::BOOT), 0);

        switch(first, None);
        switch(second, None);
        space.destroy();
    }

    #[test]
    fn responder_that_switched_away_only_acknowledges() {
        let _guard = test_support::lock();
        test_support::reset_all();

        let remote = CpuId::from_raw(1);
        smp::mark_cpu_online(remote);

        let (space, addr) = faulted_space(remote);
        let space_for_switch = space.clone();

        let responder = std::thread::spawn(move || {
            // Simulate the target switching away before the IPI lands:
            // take the mailbox only after dropping the space.
            loop {
                {
                    let has_message = MAILBOX[1].lock().is_some();
                    if has_message {
                        break;
                    }
                }
                std::thread::yield_now();
            }
            switch(CpuId::from_raw(1), None);
            assert!(handle_shootdown_ipi(CpuId::from_raw(1)));
        });

        space.free(addr, 4 * PAGE_SIZE).unwrap();
        responder.join().unwrap();

        assert_eq!(test_support::ipi().sends_to(remote), 1);
        // Acknowledged but did not invalidate.
        assert_eq!(flush_evidence(remote), 0);

        drop(space_for_switch);
        space.destroy();
    }

    #[test]
    fn kernel_space_targets_every_online_cpu() {
        let _guard = test_support::lock();
        test_support::reset_all();

        let remote = CpuId::from_raw(1);
        smp::mark_cpu_online(remote);

        let kernel = AddressSpace::new_kernel(0xffff_0000_0000, 0x100_0000);
        let source = PageSource::anonymous(0x10000);
        let addr = kernel
            .alloc(PAGE_SIZE, RegionFlags::READ | RegionFlags::WRITE, source, 0)
            .unwrap();
        // Fault it in without any CPU formally switched to the kernel
        // space; kernel mappings are visible everywhere regardless.
        kernel
            .handle_fault(addr, FaultReason::NotPresent, FaultAccess::Write)
            .unwrap();

        let responder = std::thread::spawn(move || {
            while !handle_shootdown_ipi(CpuId::from_raw(1)) {
                std::thread::yield_now();
            }
        });

        kernel.free(addr, PAGE_SIZE).unwrap();
        responder.join().unwrap();

        // Local flush is unconditional for the kernel's space.
        assert_eq!(flush_evidence(CpuId::BOOT), 1);
        assert_eq!(flush_evidence(remote), 1);
        assert_eq!(test_support::ipi().sends_to(remote), 1);

        kernel.destroy();
    }

    #[test]
    #[should_panic(expected = "unable to deliver shootdown")]
    fn undeliverable_message_is_fatal() {
        let _guard = test_support::lock();
        test_support::reset_all();

        let remote = CpuId::from_raw(1);
        smp::mark_cpu_online(remote);

        let (space, addr) = faulted_space(remote);
        crate::smp::failpoints::force_ipi_send_failure(true);
        let _ = space.free(addr, 4 * PAGE_SIZE);
    }
}

mod common;

use common::{Machine, data};
use kernel_alloc::{Claim, FrameState};
use kernel_vm::{FaultOutcome, VmError};
use kernel_vmem::{FaultType, PageState};

#[test]
fn dirty_pages_survive_a_trip_through_swap() {
    let m = Machine::new(16, 2, 4);
    let space = m.data_space(4);
    let va = data(2, 0x40);
    m.store(&space, va, 0xdead_beef);

    assert!(m.vm.evict_page(&space, va).unwrap());
    let PageState::Swapped(slot) = m.entry(&space, va) else {
        panic!("expected a swapped entry");
    };
    assert!(m.vm.swap().is_in_use(slot));
    assert_eq!(m.swap.writes(), 1);
    assert_eq!(m.vm.stats().user(), 0);

    let outcome = m.vm.handle_fault(&space, FaultType::Read, va).unwrap();
    assert!(matches!(outcome, FaultOutcome::SwappedIn(_)));
    assert_eq!(m.load(&space, va), 0xdead_beef);

    // Restored pages are dirty and their slot is released.
    assert_eq!(m.vm.stats().user_dirty, 1);
    assert_eq!(m.vm.swap().slots_in_use(), 0);
    assert!(m.tlb_entry(&space, va).unwrap().writable);
}

#[test]
fn swap_in_restores_a_swapped_page() {
    let m = Machine::new(16, 2, 4);
    let space = m.data_space(4);
    let va = data(1, 8);
    m.store(&space, va, 0x1234_5678);
    assert!(m.vm.evict_page(&space, va).unwrap());
    let PageState::Swapped(slot) = m.entry(&space, va) else {
        panic!("expected a swapped entry");
    };
    assert!(m.tlb_entry(&space, va).is_none());

    let frame = m.vm.swap_in(&space, va).unwrap().unwrap();
    assert_eq!(m.entry(&space, va), PageState::Resident { frame, dirty: true });
    assert_eq!(&m.frame_bytes(frame)[8..12], &0x1234_5678u32.to_le_bytes());
    assert!(!m.vm.swap().is_in_use(slot));
    assert_eq!(m.vm.swap().slots_in_use(), 0);
    assert_eq!(m.swap.reads(), 1);

    let tlb = m.tlb_entry(&space, va).unwrap();
    assert_eq!(tlb.frame, frame);
    assert!(tlb.writable);

    // Resident and never-touched pages are left alone.
    assert_eq!(m.vm.swap_in(&space, va), Ok(None));
    assert_eq!(m.vm.swap_in(&space, data(2, 0)), Ok(None));
    assert_eq!(m.entry(&space, data(2, 0)), PageState::Unmapped);
    assert_eq!(m.swap.reads(), 1);
    assert_eq!(m.vm.stats().user(), 1);
}

#[test]
fn clean_pages_are_dropped_without_io() {
    let m = Machine::new(16, 2, 4);
    let space = m.data_space(2);
    let va = data(0, 0);
    assert_eq!(m.load(&space, va), 0);

    assert!(m.vm.evict_page(&space, va).unwrap());
    assert_eq!(m.entry(&space, va), PageState::Unmapped);
    assert_eq!(m.swap.writes(), 0);
    assert_eq!(m.vm.swap().slots_in_use(), 0);

    let again = m.vm.handle_fault(&space, FaultType::Read, va).unwrap();
    assert!(matches!(again, FaultOutcome::Loaded(_)));
    assert_eq!(m.swap.reads(), 0);
}

#[test]
fn eviction_removes_the_tlb_entry() {
    let m = Machine::new(16, 2, 4);
    let space = m.data_space(2);
    let va = data(1, 0);
    m.store(&space, va, 7);
    assert!(m.tlb_entry(&space, va).is_some());

    m.vm.swap_out().unwrap();
    assert!(m.tlb_entry(&space, va).is_none());
    assert!(matches!(m.entry(&space, va), PageState::Swapped(_)));
}

#[test]
fn memory_pressure_keeps_every_value() {
    // 6 user frames for 20 pages.
    let m = Machine::new(8, 2, 32);
    let space = m.data_space(20);
    for n in 0..20 {
        m.store(&space, data(n, 4 * n), 1000 + n);
    }
    assert_eq!(m.vm.stats().user(), 6);
    assert_eq!(m.vm.swap().slots_in_use(), 14);

    for n in (0..20).rev() {
        assert_eq!(m.load(&space, data(n, 4 * n)), 1000 + n, "page {n}");
    }

    let snapshot = m.vm.coremap().snapshot();
    let mut frames: Vec<_> = space
        .lock()
        .page_table
        .mappings()
        .into_iter()
        .filter_map(|(_, state)| state.frame())
        .collect();
    frames.sort();
    frames.dedup();
    assert_eq!(frames.len(), snapshot.stats.user(), "one frame per resident page");
    assert_eq!(snapshot.stats.pinned, 0);
}

#[test]
fn kernel_runs_push_user_pages_out() {
    let m = Machine::new(8, 2, 8);
    let space = m.data_space(6);
    for n in 0..6 {
        m.store(&space, data(n, 0), n + 1);
    }
    assert_eq!(m.vm.stats().free, 0);

    let kva = m.vm.alloc_kpages(3).unwrap();
    let stats = m.vm.stats();
    assert_eq!(stats.fixed, 5);
    assert_eq!(stats.user(), 3);
    assert_eq!(m.vm.swap().slots_in_use(), 3);

    for n in 0..6 {
        assert_eq!(m.load(&space, data(n, 0)), n + 1);
    }
    m.vm.free_kpages(kva);
}

#[test]
fn impossible_requests_leave_the_coremap_alone() {
    let m = Machine::new(8, 2, 8);
    let space = m.data_space(6);
    for n in 0..4 {
        m.store(&space, data(n, 0), n);
    }
    let before = m.vm.coremap().snapshot().frames;

    // Only 6 frames are not part of the kernel image.
    assert_eq!(
        m.vm.get_pages_with_swap(7, &Claim::Kernel),
        Err(VmError::OutOfMemory { requested: 7 })
    );
    assert_eq!(m.vm.coremap().snapshot().frames, before);
    assert_eq!(m.vm.swap().slots_in_use(), 0);
}

#[test]
fn swap_exhaustion_is_reported() {
    // 3 user frames, 1 slot.
    let m = Machine::new(5, 2, 1);
    let space = m.data_space(5);
    for n in 0..4 {
        m.store(&space, data(n, 0), n);
    }
    assert_eq!(m.vm.swap().slots_free(), 0);

    let err = m.vm.handle_fault(&space, FaultType::Write, data(4, 0)).unwrap_err();
    assert_eq!(err, VmError::SwapExhausted);
    assert!(err.is_fatal());
    assert_eq!(m.entry(&space, data(4, 0)), PageState::Unmapped);

    let stats = m.vm.stats();
    assert_eq!(stats.user_dirty, 3);
    assert_eq!(stats.pinned, 0);
    assert_eq!(
        m.vm.coremap().snapshot().in_state(FrameState::UserDirty).count(),
        3
    );
}

#[test]
fn only_kernel_frames_means_out_of_memory() {
    let m = Machine::new(4, 2, 4);
    let kva = m.vm.alloc_kpages(2).unwrap();
    let space = m.data_space(1);
    assert_eq!(
        m.vm.handle_fault(&space, FaultType::Read, data(0, 0)),
        Err(VmError::OutOfMemory { requested: 1 })
    );
    m.vm.free_kpages(kva);
    m.vm.handle_fault(&space, FaultType::Read, data(0, 0)).unwrap();
}

#[test]
fn full_swap_drops_clean_pages_first() {
    // 4 user frames, no swap at all.
    let m = Machine::new(6, 2, 0);
    let space = m.data_space(6);
    for n in 0..3 {
        m.store(&space, data(n, 0), n + 1);
    }
    assert_eq!(m.load(&space, data(3, 0)), 0);
    assert_eq!(m.vm.stats().user_clean, 1);

    let outcome = m.vm.handle_fault(&space, FaultType::Read, data(4, 0)).unwrap();
    assert!(matches!(outcome, FaultOutcome::Loaded(_)));
    assert_eq!(m.entry(&space, data(3, 0)), PageState::Unmapped);
    for n in 0..3 {
        assert!(matches!(
            m.entry(&space, data(n, 0)),
            PageState::Resident { dirty: true, .. }
        ));
    }
    assert_eq!(m.swap.writes(), 0);

    // A write fault can take the clean frame too.
    m.store(&space, data(5, 0), 6);
    assert_eq!(m.entry(&space, data(4, 0)), PageState::Unmapped);
    assert_eq!(m.vm.stats().user_dirty, 4);

    // Nothing clean is left.
    assert_eq!(
        m.vm.handle_fault(&space, FaultType::Read, data(4, 0)),
        Err(VmError::SwapExhausted)
    );
    assert_eq!(m.vm.swap_out(), Err(VmError::SwapExhausted));
    assert_eq!(m.vm.stats().pinned, 0);
    for n in 0..3 {
        assert_eq!(m.load(&space, data(n, 0)), n + 1);
    }
    assert_eq!(m.load(&space, data(5, 0)), 6);
}

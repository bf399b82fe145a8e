mod common;

use common::{DATA_BASE, Machine, data};
use kernel_info::memory::{USER_STACK_INITIAL_PAGES, USER_STACK_TOP};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_vm::{FaultOutcome, VmError};
use kernel_vmem::{AccessViolation, Backing, FaultType, PageState, RegionKind, RegionPerms};
use std::sync::Arc;

#[test]
fn bootstrap_leaves_everything_but_the_kernel_free() {
    let m = Machine::new(64, 9, 8);
    let stats = m.vm.stats();
    assert_eq!(stats.fixed, 9);
    assert_eq!(stats.free, 55);
    assert_eq!(stats.user(), 0);
    assert_eq!(m.vm.swap().capacity(), 8);
    assert_eq!(m.vm.swap().slots_in_use(), 0);
}

#[test]
fn first_touch_zero_fills_and_maps_clean() {
    let m = Machine::new(16, 2, 4);
    let space = m.data_space(4);
    let va = data(1, 0x10);

    let outcome = m.vm.handle_fault(&space, FaultType::Read, va).unwrap();
    let FaultOutcome::Loaded(frame) = outcome else {
        panic!("expected a fresh load, got {outcome:?}");
    };
    assert!(m.frame_bytes(frame).iter().all(|&b| b == 0));
    assert_eq!(m.entry(&space, va), PageState::Resident { frame, dirty: false });
    assert_eq!(m.vm.coremap().is_dirty(frame), Some(false));

    let tlb = m.tlb_entry(&space, va).unwrap();
    assert_eq!(tlb.frame, frame);
    assert!(!tlb.writable, "clean pages are mapped read-only");
    assert!(!m.vm.coremap().info(frame).unwrap().pinned);
}

#[test]
fn repeated_faults_do_not_allocate_again() {
    let m = Machine::new(16, 2, 4);
    let space = m.data_space(2);
    let va = data(0, 0);

    let first = m.vm.handle_fault(&space, FaultType::Read, va).unwrap().frame();
    let before = m.vm.stats();
    for _ in 0..3 {
        let again = m.vm.handle_fault(&space, FaultType::Read, va).unwrap();
        assert_eq!(again, FaultOutcome::Refilled(first));
    }
    assert_eq!(m.vm.stats(), before);
    assert_eq!(space.lock().page_table.mapped_pages(), 1);
}

#[test]
fn first_store_marks_a_clean_page_dirty() {
    let m = Machine::new(16, 2, 4);
    let space = m.data_space(2);
    let va = data(0, 8);

    let frame = m.vm.handle_fault(&space, FaultType::Read, va).unwrap().frame();
    assert_eq!(m.vm.stats().user_clean, 1);

    let again = m.vm.handle_fault(&space, FaultType::ReadOnly, va).unwrap();
    assert_eq!(again, FaultOutcome::Refilled(frame));
    assert_eq!(m.entry(&space, va), PageState::Resident { frame, dirty: true });
    assert_eq!(m.vm.stats().user_dirty, 1);
    assert!(m.tlb_entry(&space, va).unwrap().writable);
}

#[test]
fn write_fault_on_fresh_page_is_dirty_at_once() {
    let m = Machine::new(16, 2, 4);
    let space = m.data_space(2);
    let va = data(1, 0);

    let frame = m.vm.handle_fault(&space, FaultType::Write, va).unwrap().frame();
    assert_eq!(m.entry(&space, va), PageState::Resident { frame, dirty: true });
    assert!(m.tlb_entry(&space, va).unwrap().writable);
}

#[test]
fn segments_load_their_file_image() {
    let m = Machine::new(16, 2, 4);
    let space = m.vm.create_space();
    let image: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
    let base = VirtualAddress::new(0x0040_0000);
    space
        .lock()
        .regions
        .define_region(
            base,
            3 * PAGE_SIZE,
            RegionPerms::RX,
            Backing::Segment {
                source: Arc::new(image.clone()),
                vaddr: base,
                file_offset: 0,
                file_size: 6000,
            },
        )
        .unwrap();

    let second = VirtualAddress::new(0x0040_1000);
    let frame = m.vm.handle_fault(&space, FaultType::Read, second).unwrap().frame();
    let bytes = m.frame_bytes(frame);
    assert_eq!(&bytes[..6000 - 4096], &image[4096..]);
    assert!(bytes[6000 - 4096..].iter().all(|&b| b == 0));

    let third = VirtualAddress::new(0x0040_2000);
    let frame = m.vm.handle_fault(&space, FaultType::Read, third).unwrap().frame();
    assert!(m.frame_bytes(frame).iter().all(|&b| b == 0));
    assert_eq!(m.vm.stats().user_clean, 2);
}

#[test]
fn illegal_accesses_allocate_nothing() {
    let m = Machine::new(16, 2, 4);
    let space = m.vm.create_space();
    let code = VirtualAddress::new(0x0040_0000);
    space
        .lock()
        .regions
        .define_region(code, PAGE_SIZE, RegionPerms::RX, Backing::Zero)
        .unwrap();
    let before = m.vm.coremap().snapshot().frames;

    let err = m.vm.handle_fault(&space, FaultType::Write, code).unwrap_err();
    assert_eq!(
        err,
        VmError::SegmentationFault {
            address: code,
            fault: FaultType::Write,
            reason: AccessViolation::WriteToReadOnly {
                address: code,
                kind: RegionKind::Code
            }
        }
    );

    let wild = VirtualAddress::new(0x2000_0000);
    assert!(matches!(
        m.vm.handle_fault(&space, FaultType::Read, wild),
        Err(VmError::SegmentationFault {
            reason: AccessViolation::NoRegion(_),
            ..
        })
    ));

    let kernel = VirtualAddress::new(0x8000_1000);
    assert!(matches!(
        m.vm.handle_fault(&space, FaultType::Read, kernel),
        Err(VmError::SegmentationFault {
            reason: AccessViolation::KernelAddress(_),
            ..
        })
    ));

    assert_eq!(m.vm.coremap().snapshot().frames, before);
    assert_eq!(space.lock().page_table.mapped_pages(), 0);
}

#[test]
fn stack_grows_within_the_margin() {
    let m = Machine::new(32, 2, 4);
    let space = m.data_space(1);
    let bottom = USER_STACK_TOP - USER_STACK_INITIAL_PAGES * PAGE_SIZE;

    let near = VirtualAddress::new(bottom - 3 * PAGE_SIZE + 4);
    m.vm.handle_fault(&space, FaultType::Write, near).unwrap();
    let start = space.lock().regions.stack().unwrap().start();
    assert_eq!(start, near.page());

    let far = VirtualAddress::new(start.base().as_u32() - 64 * PAGE_SIZE);
    assert!(matches!(
        m.vm.handle_fault(&space, FaultType::Write, far),
        Err(VmError::SegmentationFault {
            reason: AccessViolation::NoRegion(_),
            ..
        })
    ));
    assert_eq!(space.lock().regions.stack().unwrap().start(), start);
}

#[test]
fn raw_fault_codes_go_through_the_current_space() {
    let m = Machine::new(16, 2, 4);
    let va = data(0, 0);
    assert_eq!(m.vm.vm_fault(0, va), Err(VmError::NoAddressSpace(va)));

    let space = m.data_space(1);
    m.vm.activate(&space);
    assert_eq!(m.vm.vm_fault(7, va), Err(VmError::InvalidFaultType(7)));
    m.vm.vm_fault(1, va).unwrap();
    assert!(matches!(m.entry(&space, va), PageState::Resident { dirty: true, .. }));

    m.vm.deactivate();
    assert!(m.vm.current_space().is_none());
    assert!(m.tlb_entry(&space, va).is_none());
    assert_eq!(m.vm.vm_fault(0, va), Err(VmError::NoAddressSpace(va)));

    m.vm.activate(&space);
    m.vm.destroy_space(&space);
    assert!(m.vm.current_space().is_none());
    assert_eq!(m.vm.stats().user(), 0);
}

#[test]
fn alloc_and_free_upages() {
    let m = Machine::new(16, 2, 4);
    let space = m.data_space(2);
    let va = VirtualAddress::new(DATA_BASE);

    let pa = m.vm.alloc_upages(va, &space).unwrap();
    assert_eq!(m.entry(&space, va), PageState::Resident { frame: pa.page(), dirty: true });
    assert_eq!(m.vm.alloc_upages(va, &space), Err(VmError::AlreadyMapped(va)));

    m.vm.handle_fault(&space, FaultType::Read, va).unwrap();
    m.vm.free_upages(pa);
    assert_eq!(m.entry(&space, va), PageState::Unmapped);
    assert!(m.tlb_entry(&space, va).is_none());
    assert_eq!(m.vm.stats().user(), 0);
}

#[test]
fn kernel_pages_round_trip() {
    let m = Machine::new(16, 2, 4);
    let kva = m.vm.alloc_kpages(3).unwrap();
    assert_eq!(kva, VirtualAddress::new(0x8000_0000 + 2 * PAGE_SIZE));
    assert_eq!(m.vm.stats().fixed, 5);
    m.vm.free_kpages(kva);
    assert_eq!(m.vm.stats().fixed, 2);
}

#[test]
#[should_panic(expected = "not a kernel segment address")]
fn freeing_a_user_address_as_kernel_memory_panics() {
    let m = Machine::new(16, 2, 4);
    m.vm.free_kpages(VirtualAddress::new(0x0040_0000));
}

//! The global instance can only be bootstrapped once per process, so this
//! file holds a single test.

use kernel_alloc::RamImage;
use kernel_info::boot::BootMemory;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_vm::{RamSwapDevice, VmConfig, VmError, global};
use kernel_vmem::{Backing, PageState, RegionPerms, SoftTlb};
use std::sync::Arc;

#[test]
fn kernel_interface_end_to_end() {
    let config = VmConfig::new(
        BootMemory::from_frames(24, 4).unwrap(),
        Arc::new(RamImage::new(24)),
        Arc::new(RamSwapDevice::new(8)),
        Arc::new(SoftTlb::new()),
    );
    let vm = kernel_vm::vm_bootstrap(config.clone());
    assert!(core::ptr::eq(vm, kernel_vm::vm_bootstrap(config)));
    assert!(core::ptr::eq(vm, global::vm()));

    let kva = kernel_vm::alloc_kpages(2).unwrap();
    assert_eq!(kva, VirtualAddress::new(0x8000_0000 + 4 * PAGE_SIZE));

    let space = vm.create_space();
    let va = VirtualAddress::new(0x0050_0000);
    space
        .lock()
        .regions
        .define_region(va, 2 * PAGE_SIZE, RegionPerms::RW, Backing::Zero)
        .unwrap();

    assert_eq!(kernel_vm::vm_fault(0, va), Err(VmError::NoAddressSpace(va)));
    vm.activate(&space);
    kernel_vm::vm_fault(1, va).unwrap();
    let PageState::Resident { frame, dirty: true } = space.lock().page_table.get(va.page()) else {
        panic!("write fault should map a dirty page");
    };

    let second = VirtualAddress::new(0x0050_1000);
    let pa = kernel_vm::alloc_upages(second, &space).unwrap();
    assert_ne!(pa.page(), frame);

    let dump = kernel_vm::dump_coremap();
    assert_eq!(dump.stats.user_dirty, 2);
    assert_eq!(dump.stats.fixed, 6);

    kernel_vm::free_upages(pa);
    kernel_vm::free_kpages(kva);
    vm.destroy_space(&space);
    assert_eq!(vm.stats().free, 20);
}

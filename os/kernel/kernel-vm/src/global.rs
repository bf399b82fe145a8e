//! # Kernel Entry Points
//!
//! The machine has exactly one [`Vm`]. It is created by [`vm_bootstrap`]
//! during boot and reached through the free functions here by the trap layer,
//! the kernel heap and the process code.

use alloc::sync::Arc;
use kernel_alloc::CoremapSnapshot;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::AddressSpace;
use spin::Once;

use crate::{Vm, VmConfig, VmError};

static VM: Once<Vm> = Once::new();

/// Bring up the virtual-memory system. Later calls return the instance
/// created by the first one and ignore their configuration.
pub fn vm_bootstrap(config: VmConfig) -> &'static Vm {
    let mut fresh = false;
    let vm = VM.call_once(|| {
        fresh = true;
        Vm::bootstrap(config)
    });
    if !fresh {
        log::warn!("vm_bootstrap called twice");
    }
    vm
}

/// The global instance.
///
/// # Panics
/// Panics if [`vm_bootstrap`] has not run yet.
pub fn vm() -> &'static Vm {
    match VM.get() {
        Some(vm) => vm,
        None => panic!("virtual memory used before vm_bootstrap"),
    }
}

/// Handle a TLB fault of type `fault_type` at `address` in the current
/// address space.
///
/// # Errors
/// Any [`VmError`] except the fatal ones; the trap layer turns them into a
/// signal for the faulting process.
///
/// # Panics
/// Panics when swap is exhausted or the swap device fails.
pub fn vm_fault(fault_type: u32, address: VirtualAddress) -> Result<(), VmError> {
    match vm().vm_fault(fault_type, address) {
        Err(e) if e.is_fatal() => {
            log::error!("vm_fault({fault_type}, {address}): {e}");
            vm().dump_coremap();
            panic!("vm_fault: {e}");
        }
        other => other,
    }
}

/// Allocate `count` contiguous kernel pages.
///
/// # Errors
/// [`VmError::OutOfMemory`] or [`VmError::SwapExhausted`].
pub fn alloc_kpages(count: u32) -> Result<VirtualAddress, VmError> {
    vm().alloc_kpages(count)
}

/// Free a kernel allocation by its kernel virtual address.
pub fn free_kpages(kva: VirtualAddress) {
    vm().free_kpages(kva);
}

/// Back the page at `va` of `space` with a fresh zeroed frame.
///
/// # Errors
/// See [`Vm::alloc_upages`].
pub fn alloc_upages(va: VirtualAddress, space: &Arc<AddressSpace>) -> Result<PhysicalAddress, VmError> {
    vm().alloc_upages(va, space)
}

/// Release a user frame and unmap it from its owner.
pub fn free_upages(pa: PhysicalAddress) {
    vm().free_upages(pa);
}

/// Log the coremap and return it.
pub fn dump_coremap() -> CoremapSnapshot {
    vm().dump_coremap()
}

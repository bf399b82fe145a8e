//! # Memory Layout

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

/// End of the user VA range after which the kernel segment begins.
pub const USERSPACE_END: u32 = 0x8000_0000;

/// Base of the direct-mapped kernel segment.
///
/// Physical address `pa` is visible to the kernel at `KSEG0_BASE + pa`.
pub const KSEG0_BASE: u32 = 0x8000_0000;

/// Size of the direct-mapped kernel segment; bounds the usable RAM.
pub const KSEG0_SIZE: u32 = 0x2000_0000;

/// Top of the user stack (the stack grows down from here).
pub const USER_STACK_TOP: u32 = USERSPACE_END;

/// Pages mapped into the stack region when it is defined.
pub const USER_STACK_INITIAL_PAGES: u32 = 4;

/// Upper bound on the size of the user stack in bytes.
pub const USER_STACK_MAX: u32 = 2 * 1024 * 1024;

/// Default distance below the current stack bottom within which a fault
/// grows the stack instead of being a segmentation fault.
pub const DEFAULT_STACK_GROWTH_MARGIN: u32 = 8 * PAGE_SIZE;

/// Lowest address any user region may start at; page zero stays unmapped
/// so null dereferences fault.
pub const USER_MIN_ADDRESS: u32 = PAGE_SIZE;

/// Translate a physical address into its direct-mapped kernel virtual address.
#[inline]
#[must_use]
pub const fn paddr_to_kvaddr(pa: PhysicalAddress) -> VirtualAddress {
    VirtualAddress::new(pa.as_u32() + KSEG0_BASE)
}

/// Translate a direct-mapped kernel virtual address back to physical.
///
/// Returns `None` for addresses outside the kernel segment.
#[inline]
#[must_use]
pub const fn kvaddr_to_paddr(va: VirtualAddress) -> Option<PhysicalAddress> {
    let v = va.as_u32();
    if v >= KSEG0_BASE && v - KSEG0_BASE < KSEG0_SIZE {
        Some(PhysicalAddress::new(v - KSEG0_BASE))
    } else {
        None
    }
}

/// Whether `va` lies in the user part of the address space.
#[inline]
#[must_use]
pub const fn is_user_address(va: VirtualAddress) -> bool {
    va.as_u32() < USERSPACE_END
}

const _: () = {
    assert!(USER_STACK_MAX.is_multiple_of(PAGE_SIZE));
    assert!(USER_STACK_INITIAL_PAGES * PAGE_SIZE <= USER_STACK_MAX);
    assert!(DEFAULT_STACK_GROWTH_MARGIN.is_multiple_of(PAGE_SIZE));
    assert!(KSEG0_BASE >= USERSPACE_END);
};

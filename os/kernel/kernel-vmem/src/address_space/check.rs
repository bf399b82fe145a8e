//! # Access Checks
//!
//! [`check_vaddr`] decides whether a faulting access is legal before the fault
//! handler allocates anything. It never modifies the region list; a stack
//! growth it allows is reported back and applied by the caller.

use super::region::{RegionKind, RegionList, RegionPerms};
use core::fmt;
use kernel_info::memory::is_user_address;
use kernel_memory_addresses::{VirtualAddress, VirtualPage};

/// Kind of access that raised a fault, as reported by the trap layer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum FaultType {
    /// Load from a page without a TLB entry.
    Read = 0,
    /// Store to a page without a TLB entry.
    Write = 1,
    /// Store to a page whose TLB entry is read-only.
    ReadOnly = 2,
}

impl FaultType {
    /// Whether the faulting access was a store.
    #[inline]
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadOnly)
    }
}

impl TryFrom<u32> for FaultType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            2 => Ok(Self::ReadOnly),
            other => Err(other),
        }
    }
}

impl fmt::Display for FaultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ReadOnly => "write to read-only page",
        })
    }
}

/// Why an access was refused.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AccessViolation {
    #[error("{0} is a kernel address")]
    KernelAddress(VirtualAddress),
    #[error("{0} is not inside any region")]
    NoRegion(VirtualAddress),
    #[error("{address} lies in the read-only {kind} region")]
    WriteToReadOnly {
        address: VirtualAddress,
        kind: RegionKind,
    },
}

/// A permitted access.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegionAccess {
    pub kind: RegionKind,
    /// Whether the region allows stores at all.
    pub writable: bool,
    /// Set when the access is a stack growth; the stack must be extended down
    /// to this page.
    pub grow_stack_to: Option<VirtualPage>,
}

/// Check a `fault` at `address` against `regions`.
///
/// Code regions allow reads only. Data, heap and stack regions allow reads
/// and writes. An address below the stack but no more than `growth_margin`
/// bytes under its current bottom is allowed as a stack growth, provided the
/// grown stack stays inside its reserved range and clear of other regions.
///
/// # Errors
/// Returns the [`AccessViolation`] that turns the fault into a segmentation
/// fault.
pub fn check_vaddr(
    regions: &RegionList,
    fault: FaultType,
    address: VirtualAddress,
    growth_margin: u32,
) -> Result<RegionAccess, AccessViolation> {
    if !is_user_address(address) {
        return Err(AccessViolation::KernelAddress(address));
    }

    if let Some(region) = regions.find(address) {
        let writable = region.is_writable();
        if fault.is_write() && !writable {
            return Err(AccessViolation::WriteToReadOnly {
                address,
                kind: region.kind(),
            });
        }
        if !fault.is_write() && !region.perms().intersects(RegionPerms::READ | RegionPerms::EXEC) {
            return Err(AccessViolation::NoRegion(address));
        }
        return Ok(RegionAccess {
            kind: region.kind(),
            writable,
            grow_stack_to: None,
        });
    }

    if let Some(stack) = regions.stack() {
        let bottom = stack.start().base().as_u32();
        let page = address.page();
        if address.as_u32() < bottom
            && bottom - address.as_u32() <= growth_margin
            && regions.stack_may_cover(page, stack.start())
        {
            return Ok(RegionAccess {
                kind: RegionKind::Stack,
                writable: true,
                grow_stack_to: Some(page),
            });
        }
    }

    Err(AccessViolation::NoRegion(address))
}

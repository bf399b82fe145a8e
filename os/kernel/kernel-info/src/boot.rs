//! # Boot Memory Information

use crate::memory::KSEG0_SIZE;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};

/// Physical memory as seen right after the kernel image was loaded.
///
/// RAM spans `[0, ram_size)`. Everything below `first_free` belongs to the
/// kernel image (exception vectors, text, data, and whatever the early boot
/// code stole before the virtual-memory bootstrap ran).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BootMemory {
    ram_size: u32,
    first_free: PhysicalAddress,
}

/// Reasons a [`BootMemory`] description is rejected.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BootMemoryError {
    #[error("RAM size {0:#x} is not a multiple of the page size")]
    UnalignedRam(u32),
    #[error("RAM size {0:#x} exceeds the direct-mapped kernel segment")]
    RamTooLarge(u32),
    #[error("{0} frames exceed the direct-mapped kernel segment")]
    TooManyFrames(u32),
    #[error("first free address {0} lies beyond the end of RAM")]
    FirstFreeOutOfRange(PhysicalAddress),
}

impl BootMemory {
    /// Describe RAM of `ram_size` bytes whose first free byte is `first_free`.
    ///
    /// `first_free` is rounded up to a page boundary; a partially used frame
    /// is reserved entirely.
    ///
    /// # Errors
    /// Returns an error if the RAM size is unaligned or larger than the kernel
    /// segment, or if `first_free` lies beyond RAM.
    pub const fn new(ram_size: u32, first_free: PhysicalAddress) -> Result<Self, BootMemoryError> {
        if !ram_size.is_multiple_of(PAGE_SIZE) {
            return Err(BootMemoryError::UnalignedRam(ram_size));
        }
        if ram_size > KSEG0_SIZE {
            return Err(BootMemoryError::RamTooLarge(ram_size));
        }
        let Some(aligned) = first_free.as_u32().checked_next_multiple_of(PAGE_SIZE) else {
            return Err(BootMemoryError::FirstFreeOutOfRange(first_free));
        };
        if aligned > ram_size {
            return Err(BootMemoryError::FirstFreeOutOfRange(first_free));
        }
        Ok(Self {
            ram_size,
            first_free: PhysicalAddress::new(aligned),
        })
    }

    /// Describe RAM by frame counts: `total` frames, the first `reserved` of
    /// which hold the kernel image.
    ///
    /// # Errors
    /// Same as [`BootMemory::new`], and [`BootMemoryError::TooManyFrames`] if
    /// `total` frames do not fit the address width.
    pub const fn from_frames(total: u32, reserved: u32) -> Result<Self, BootMemoryError> {
        let Some(ram_size) = total.checked_mul(PAGE_SIZE) else {
            return Err(BootMemoryError::TooManyFrames(total));
        };
        // A saturated address still lies beyond RAM and is rejected below.
        let first_free = PhysicalAddress::new(reserved.saturating_mul(PAGE_SIZE));
        Self::new(ram_size, first_free)
    }

    #[inline]
    #[must_use]
    pub const fn ram_size(&self) -> u32 {
        self.ram_size
    }

    /// First page-aligned physical address not used by the kernel image.
    #[inline]
    #[must_use]
    pub const fn first_free(&self) -> PhysicalAddress {
        self.first_free
    }

    /// Total number of physical frames.
    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> u32 {
        self.ram_size / PAGE_SIZE
    }

    /// Frames occupied by the kernel image.
    #[inline]
    #[must_use]
    pub const fn reserved_frames(&self) -> u32 {
        self.first_free.as_u32() / PAGE_SIZE
    }
}

//! # Virtual Memory Manager
//!
//! Demand paging on top of the coremap: the fault handler, eviction to swap
//! and the lifecycle of address spaces.
//!
//! ## Architecture Overview
//!
//! ```text
//!              trap layer                 process layer
//!                  │ vm_fault                  │ create / copy / destroy / sbrk
//! ┌────────────────▼───────────────────────────▼────────┐
//! │                        Vm                           │
//! │   fault ─► check_vaddr ─► page table ─► TLB         │
//! │     │                                               │
//! │     └─► get_pages_with_swap ─► evict ─► SwapStore   │
//! └──────┬──────────────────┬──────────────────┬────────┘
//!        │                  │                  │
//!   Coremap            PhysMemory         SwapDevice
//! ```
//!
//! The hardware seams ([`PhysMemory`](kernel_alloc::PhysMemory),
//! [`SwapDevice`], [`Tlb`](kernel_vmem::Tlb)) are traits, so the whole manager
//! runs on the host against [`RamImage`](kernel_alloc::RamImage),
//! [`RamSwapDevice`] and [`SoftTlb`](kernel_vmem::SoftTlb).
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use kernel_alloc::RamImage;
//! use kernel_info::boot::BootMemory;
//! use kernel_memory_addresses::VirtualAddress;
//! use kernel_vm::{RamSwapDevice, Vm, VmConfig};
//! use kernel_vmem::{FaultType, SoftTlb};
//!
//! let config = VmConfig::new(
//!     BootMemory::from_frames(32, 4).unwrap(),
//!     Arc::new(RamImage::new(32)),
//!     Arc::new(RamSwapDevice::new(16)),
//!     Arc::new(SoftTlb::new()),
//! );
//! let vm = Vm::bootstrap(config);
//!
//! let space = vm.create_space();
//! space.lock().regions.define_stack().unwrap();
//! let sp = VirtualAddress::new(0x7fff_fff0);
//! let frame = vm.handle_fault(&space, FaultType::Write, sp).unwrap().frame();
//! assert_eq!(vm.stats().user_dirty, 1);
//!
//! vm.destroy_space(&space);
//! assert_eq!(vm.coremap().info(frame).unwrap().owner, None);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod config;
mod evict;
mod fault;
pub mod global;
pub mod swap;
mod vm;

pub use crate::config::VmConfig;
pub use crate::fault::FaultOutcome;
pub use crate::global::{
    alloc_kpages, alloc_upages, dump_coremap, free_kpages, free_upages, vm_bootstrap, vm_fault,
};
pub use crate::swap::{RamSwapDevice, SwapDevice, SwapIoError, SwapStore};
pub use crate::vm::Vm;

use kernel_alloc::AllocError;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{AccessViolation, FaultType, RegionError, SegmentReadError};

/// Virtual-memory failures.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmError {
    /// No frames could be found or freed.
    #[error("out of memory: cannot provide {requested} frame(s)")]
    OutOfMemory { requested: u32 },
    /// The access is illegal; the faulting process gets a signal.
    #[error("segmentation fault: {fault} at {address}: {reason}")]
    SegmentationFault {
        address: VirtualAddress,
        fault: FaultType,
        reason: AccessViolation,
    },
    /// A dirty page had to be written out and every swap slot is taken.
    #[error("swap space exhausted")]
    SwapExhausted,
    #[error("unknown fault type {0}")]
    InvalidFaultType(u32),
    #[error("fault at {0} with no current address space")]
    NoAddressSpace(VirtualAddress),
    #[error("{0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("allocation request rejected: {0}")]
    Alloc(AllocError),
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    Segment(#[from] SegmentReadError),
    #[error(transparent)]
    SwapIo(#[from] crate::swap::SwapIoError),
}

impl From<AllocError> for VmError {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::OutOfMemory { requested } => Self::OutOfMemory { requested },
            e @ AllocError::InvalidCount(_) => Self::Alloc(e),
        }
    }
}

impl VmError {
    /// Whether the kernel cannot continue after this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::SwapExhausted | Self::SwapIo(_))
    }
}

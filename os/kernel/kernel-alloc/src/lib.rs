//! # Physical Memory Allocation
//!
//! The coremap and the frame allocator built on it, plus the seam through
//! which frame contents are accessed.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │               Frame Allocator ([`Coremap`])         │
//! │    • get_pages: first-fit contiguous runs           │
//! │    • kernel runs / single user frames               │
//! │    • clock victim selection, pins, reservations     │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ frame numbers only
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Physical Memory ([`PhysMemory`])       │
//! │    • zero / copy / read / write whole frames        │
//! │    • kseg0 direct map, or a host-side RAM image     │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The allocator never touches frame contents and [`PhysMemory`] never touches
//! the coremap, so no lock is held while a frame is being filled.
//!
//! ## Usage
//!
//! ```rust
//! use kernel_alloc::Coremap;
//! use kernel_info::boot::BootMemory;
//!
//! let boot = BootMemory::from_frames(64, 8).unwrap();
//! let coremap = Coremap::new(&boot);
//! assert_eq!(coremap.stats().free, 56);
//!
//! let pa = coremap.alloc_kernel_pages(4).unwrap();
//! coremap.free_kernel_pages(pa);
//! assert_eq!(coremap.stats().free, 56);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod coremap;
pub mod phys_mapper;

pub use crate::coremap::{
    AllocRun, Claim, Coremap, CoremapSnapshot, CoremapStats, FrameInfo, FrameOwner, FrameState,
    Reservation, Victim,
};
pub use crate::phys_mapper::{KsegPhysMemory, PageBuf, PhysMemory, RamImage};

/// Frame allocation failures.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AllocError {
    #[error("no run of {requested} free frame(s)")]
    OutOfMemory { requested: u32 },
    #[error("cannot allocate {0} frame(s) for this claim")]
    InvalidCount(u32),
}

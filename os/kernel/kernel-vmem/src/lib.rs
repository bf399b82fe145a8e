//! # Virtual Memory Structures
//!
//! Per-process translation state for a 32-bit, software-refilled MMU with
//! 4 KiB pages.
//!
//! ## What you get
//! - A two-level [`PageTable`] whose entries decode into the tagged
//!   [`PageState`] (unmapped, resident or swapped).
//! - An [`AddressSpace`] holding the page table and the [`RegionList`] of a
//!   process, plus the [`check_vaddr`] access predicate.
//! - The [`Tlb`] seam and a software model of it ([`SoftTlb`]).
//!
//! ## Virtual Address → Physical Address Walk
//!
//! Each 32-bit virtual address is divided into three fields:
//!
//! ```text
//! | 31‒22     | 21‒12 | 11‒0   |
//! | Directory | Table | Offset |
//! ```
//!
//! ```text
//!  Directory[dir] ──► SecondLevel[table] ──► PtEntry ──► frame | swap slot
//! ```
//!
//! | Level | Entries | Covers per entry |
//! |:------|:--------|:-----------------|
//! | Directory | 1024 | 4 MiB |
//! | Second level | 1024 | 4 KiB |
//!
//! The hardware never walks this structure. A TLB miss traps into the fault
//! handler, which looks the page up here and installs a TLB entry. The kernel
//! segment is direct-mapped and bypasses both.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub mod address_space;
pub mod page_table;
pub mod tlb;

pub use crate::address_space::{
    AccessViolation, AddressSpace, AddressSpaceId, Backing, BreakChange, FaultType, Region,
    RegionAccess, RegionError, RegionKind, RegionList, RegionPerms, SegmentReadError,
    SegmentSource, SpaceState, check_vaddr,
};
pub use crate::page_table::{MAX_SWAP_SLOTS, PageState, PageTable, PtEntry, SwapSlot};
pub use crate::tlb::{DEFAULT_TLB_ENTRIES, SoftTlb, Tlb, TlbEntry};

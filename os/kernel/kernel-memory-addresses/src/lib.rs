//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for the 32-bit addresses and page numbers used by
//! the paging code.
//!
//! ## Overview
//!
//! The types in this crate keep virtual and physical addresses apart at
//! compile time while remaining zero-cost wrappers around `u32` values.
//!
//! | Concept | Description |
//! |---------|-------------|
//! | [`MemoryAddress`] | A raw 32-bit address, either physical or virtual. |
//! | [`PageOffset`] | The byte offset inside a page (`0..PAGE_SIZE`). |
//! | [`VirtualAddress`] / [`VirtualPage`] | Translated (user or kernel) addresses and their page numbers. |
//! | [`PhysicalAddress`] / [`PhysicalPage`] | Physical memory addresses and frame numbers. |
//! | [`DirectoryIndex`] / [`TableIndex`] | The two page-table indices of a virtual address. |
//!
//! ## Two-level split
//!
//! Every virtual address decomposes into three fields:
//!
//! ```text
//! | 31 ‒ 22   | 21 ‒ 12   | 11 ‒ 0 |
//! | directory |   table   | offset |
//! ```
//!
//! The directory index selects one of 1024 second-level tables, the table
//! index selects one of 1024 entries in it, and the offset selects the byte in
//! the 4 KiB page.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0040_1234);
//! let (dir, table, off) = va.split_indices();
//! assert_eq!(dir.as_usize(), 1);
//! assert_eq!(table.as_usize(), 1);
//! assert_eq!(off.as_u32(), 0x234);
//!
//! let page = va.page();
//! assert_eq!(page.join(off), va);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod memory_address;
mod page_offset;
mod physical_address;
mod physical_page;
mod table_index;
mod virtual_address;
mod virtual_page;

pub use memory_address::MemoryAddress;
pub use page_offset::PageOffset;
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use table_index::{DirectoryIndex, TableIndex};
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

/// Page size in bytes.
pub const PAGE_SIZE: u32 = 4096;

/// `log2(PAGE_SIZE)`, i.e. the number of low bits used for the offset.
pub const PAGE_SHIFT: u32 = 12;

/// Mask selecting the page-offset bits of an address.
pub const OFFSET_MASK: u32 = 0x0000_0fff;

/// Mask selecting the directory (first-level) bits of an address.
pub const DIRECTORY_MASK: u32 = 0xffc0_0000;

/// Mask selecting the table (second-level) bits of an address.
pub const TABLE_MASK: u32 = 0x003f_f000;

/// Number of entries per table level.
pub const ENTRIES_PER_TABLE: usize = 1024;

const _: () = {
    assert!(1 << PAGE_SHIFT == PAGE_SIZE);
    assert!(DIRECTORY_MASK | TABLE_MASK | OFFSET_MASK == u32::MAX);
    assert!(DIRECTORY_MASK & TABLE_MASK == 0);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join() {
        let a = VirtualAddress::new(0x1234_5678);
        let (p, o) = a.split();
        assert_eq!(p.base().as_u32() & OFFSET_MASK, 0);
        assert_eq!(o.as_u32(), 0x678);
        assert_eq!(p.join(o), a);
    }

    #[test]
    fn indices_cover_the_address() {
        let va = VirtualAddress::new(0xffff_ffff);
        let (dir, table, off) = va.split_indices();
        assert_eq!(dir.as_usize(), ENTRIES_PER_TABLE - 1);
        assert_eq!(table.as_usize(), ENTRIES_PER_TABLE - 1);
        assert_eq!(off.as_u32(), OFFSET_MASK);

        let page = VirtualPage::from_indices(dir, table);
        assert_eq!(page, va.page());
    }

    #[test]
    fn virtual_vs_physical_wrappers() {
        let pa = PhysicalAddress::new(0x0020_3042);
        let (frame, off) = pa.split();
        assert_eq!(frame.number(), 0x203);
        assert_eq!(off.as_u32(), 0x42);
        assert_eq!(frame.join(off), pa);
    }

    #[test]
    fn alignment_helpers() {
        let a = MemoryAddress::new(0x12345);
        assert_eq!(a.align_down().as_u32(), 0x12000);
        assert_eq!(a.align_up(), Some(MemoryAddress::new(0x13000)));
        assert_eq!(MemoryAddress::new(0x12000).align_up(), Some(MemoryAddress::new(0x12000)));
        assert_eq!(MemoryAddress::new(0xffff_f001).align_up(), None);
        assert!(MemoryAddress::new(0x4000).is_page_aligned());
    }
}

//! # Two-Level Page Table
//!
//! A per-address-space table mapping virtual page numbers to [`PageState`]s.
//!
//! - The **directory** has 1024 slots, one per 4 MiB of virtual space, each
//!   optionally pointing at a second-level table.
//! - A **second-level table** holds 1024 [`PtEntry`] words, one per page. It
//!   is allocated on the first non-unmapped store into its range and released
//!   again once its last entry returns to unmapped.
//!
//! Software walks this table on every TLB miss; nothing here touches the TLB.
//! Callers are responsible for invalidating translations they change.

pub mod entry;

use alloc::boxed::Box;
use alloc::vec::Vec;
use kernel_memory_addresses::{
    DirectoryIndex, ENTRIES_PER_TABLE, TableIndex, VirtualAddress, VirtualPage,
};

pub use entry::{MAX_SWAP_SLOTS, PageState, PtEntry, SwapSlot};

/// Second-level table: 1024 entries, one page worth of words.
struct SecondLevelTable {
    entries: [PtEntry; ENTRIES_PER_TABLE],
    /// Number of entries that are not unmapped.
    live: u16,
}

impl SecondLevelTable {
    fn new() -> Box<Self> {
        Box::new(Self {
            entries: [PtEntry::zero(); ENTRIES_PER_TABLE],
            live: 0,
        })
    }
}

/// Two-level page table of one address space.
pub struct PageTable {
    directory: Box<[Option<Box<SecondLevelTable>>; ENTRIES_PER_TABLE]>,
    /// Number of pages that are resident or swapped.
    mapped: usize,
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            directory: Box::new([const { None }; ENTRIES_PER_TABLE]),
            mapped: 0,
        }
    }

    /// Look up the state of `page`.
    #[must_use]
    pub fn get(&self, page: VirtualPage) -> PageState {
        let (dir, idx) = page.indices();
        self.directory[dir.as_usize()]
            .as_ref()
            .map_or(PageState::Unmapped, |t| t.entries[idx.as_usize()].state())
    }

    /// Look up the state of the page containing `va`.
    #[inline]
    #[must_use]
    pub fn lookup(&self, va: VirtualAddress) -> PageState {
        self.get(va.page())
    }

    /// Store `state` for `page`, returning the previous state.
    pub fn set(&mut self, page: VirtualPage, state: PageState) -> PageState {
        let (dir, idx) = page.indices();
        let slot = &mut self.directory[dir.as_usize()];

        if slot.is_none() {
            if state.is_unmapped() {
                return PageState::Unmapped;
            }
            *slot = Some(SecondLevelTable::new());
        }
        let Some(table) = slot.as_mut() else {
            unreachable!("second-level table was just installed");
        };

        let old = table.entries[idx.as_usize()];
        table.entries[idx.as_usize()] = PtEntry::from_state(state);

        match (old.is_unmapped(), state.is_unmapped()) {
            (true, false) => {
                table.live += 1;
                self.mapped += 1;
            }
            (false, true) => {
                table.live -= 1;
                self.mapped -= 1;
                if table.live == 0 {
                    *slot = None;
                }
            }
            _ => {}
        }
        old.state()
    }

    /// Reset `page` to unmapped, returning what it held.
    #[inline]
    pub fn clear(&mut self, page: VirtualPage) -> PageState {
        self.set(page, PageState::Unmapped)
    }

    /// Number of resident or swapped pages.
    #[inline]
    #[must_use]
    pub const fn mapped_pages(&self) -> usize {
        self.mapped
    }

    /// Number of allocated second-level tables.
    #[must_use]
    pub fn second_level_tables(&self) -> usize {
        self.directory.iter().filter(|t| t.is_some()).count()
    }

    /// All pages that are not unmapped, in ascending order.
    #[must_use]
    pub fn mappings(&self) -> Vec<(VirtualPage, PageState)> {
        self.mappings_in(VirtualPage::new(0), None)
    }

    /// Pages in `[from, to)` that are not unmapped; `to == None` means "to the
    /// end of the address space".
    #[must_use]
    pub fn mappings_in(
        &self,
        from: VirtualPage,
        to: Option<VirtualPage>,
    ) -> Vec<(VirtualPage, PageState)> {
        let mut out = Vec::new();
        for (d, slot) in self.directory.iter().enumerate() {
            let Some(table) = slot else { continue };
            for (t, e) in table.entries.iter().enumerate() {
                if e.is_unmapped() {
                    continue;
                }
                #[allow(clippy::cast_possible_truncation)]
                let page = VirtualPage::from_indices(
                    DirectoryIndex::new(d as u16),
                    TableIndex::new(t as u16),
                );
                if page >= from && to.is_none_or(|end| page < end) {
                    out.push((page, e.state()));
                }
            }
        }
        out
    }

    /// Unmap every page in `[from, to)` and return what was there.
    pub fn take_range(
        &mut self,
        from: VirtualPage,
        to: Option<VirtualPage>,
    ) -> Vec<(VirtualPage, PageState)> {
        let taken = self.mappings_in(from, to);
        for (page, _) in &taken {
            self.clear(*page);
        }
        taken
    }

    /// Unmap everything and return what was there.
    pub fn take_all(&mut self) -> Vec<(VirtualPage, PageState)> {
        self.take_range(VirtualPage::new(0), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PhysicalPage;

    fn resident(n: u32) -> PageState {
        PageState::Resident {
            frame: PhysicalPage::new(n),
            dirty: false,
        }
    }

    #[test]
    fn set_get_and_counts() {
        let mut pt = PageTable::new();
        let page = VirtualAddress::new(0x0040_3000).page();

        assert_eq!(pt.get(page), PageState::Unmapped);
        assert_eq!(pt.set(page, resident(9)), PageState::Unmapped);
        assert_eq!(pt.get(page), resident(9));
        assert_eq!(pt.mapped_pages(), 1);
        assert_eq!(pt.second_level_tables(), 1);

        let slot = PageState::Swapped(SwapSlot::new(4));
        assert_eq!(pt.set(page, slot), resident(9));
        assert_eq!(pt.mapped_pages(), 1);

        assert_eq!(pt.clear(page), slot);
        assert_eq!(pt.mapped_pages(), 0);
        assert_eq!(pt.second_level_tables(), 0, "empty table is released");
    }

    #[test]
    fn clearing_an_absent_table_allocates_nothing() {
        let mut pt = PageTable::new();
        assert_eq!(pt.clear(VirtualPage::new(0x7ffff)), PageState::Unmapped);
        assert_eq!(pt.second_level_tables(), 0);
    }

    #[test]
    fn take_range_is_half_open() {
        let mut pt = PageTable::new();
        for n in 0x400..0x408 {
            pt.set(VirtualPage::new(n), resident(n));
        }
        // A page in a different directory slot.
        pt.set(VirtualPage::new(0x7_ffff), resident(1));

        let taken = pt.take_range(VirtualPage::new(0x402), Some(VirtualPage::new(0x406)));
        let pages: Vec<u32> = taken.iter().map(|(p, _)| p.number()).collect();
        assert_eq!(pages, [0x402, 0x403, 0x404, 0x405]);
        assert_eq!(pt.mapped_pages(), 5);

        let rest = pt.take_all();
        assert_eq!(rest.len(), 5);
        assert_eq!(rest.last().map(|(p, _)| p.number()), Some(0x7_ffff));
        assert_eq!(pt.second_level_tables(), 0);
    }
}

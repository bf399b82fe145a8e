//! # Translation Lookaside Buffer
//!
//! The MMU only consults the TLB; on a miss it traps and the fault handler
//! refills an entry from the page table. Every page-table change that removes
//! or downgrades a translation must be followed by an invalidation here.
//!
//! [`Tlb`] is the seam to the hardware. [`SoftTlb`] models a small, fully
//! associative TLB tagged by address space, with round-robin replacement in
//! place of the hardware's random slot choice.

use crate::address_space::AddressSpaceId;
use alloc::vec::Vec;
use kernel_memory_addresses::{PhysicalPage, VirtualPage};
use spin::Mutex;

/// Access to the translation lookaside buffer.
pub trait Tlb: Send + Sync {
    /// Install `page -> frame` for `asid`, replacing any entry for the same
    /// page.
    fn install(&self, asid: AddressSpaceId, page: VirtualPage, frame: PhysicalPage, writable: bool);

    /// Drop the entry for `page` of `asid`, if present.
    fn invalidate(&self, asid: AddressSpaceId, page: VirtualPage);

    /// Drop every entry.
    fn invalidate_all(&self);

    /// Drop every entry of `asid`.
    fn invalidate_space(&self, asid: AddressSpaceId) {
        let _ = asid;
        self.invalidate_all();
    }
}

/// One cached translation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TlbEntry {
    pub asid: AddressSpaceId,
    pub page: VirtualPage,
    pub frame: PhysicalPage,
    pub writable: bool,
}

/// Number of entries of the MIPS R3000 TLB.
pub const DEFAULT_TLB_ENTRIES: usize = 64;

struct SoftTlbState {
    slots: Vec<Option<TlbEntry>>,
    next_victim: usize,
}

/// Software model of a tagged TLB.
pub struct SoftTlb {
    state: Mutex<SoftTlbState>,
}

impl Default for SoftTlb {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftTlb {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TLB_ENTRIES)
    }

    /// # Panics
    /// Panics if `entries` is zero.
    #[must_use]
    pub fn with_capacity(entries: usize) -> Self {
        assert!(entries > 0, "a TLB needs at least one entry");
        let mut slots = Vec::with_capacity(entries);
        slots.resize(entries, None);
        Self {
            state: Mutex::new(SoftTlbState {
                slots,
                next_victim: 0,
            }),
        }
    }

    /// Translate `page` of `asid` the way the MMU would.
    #[must_use]
    pub fn lookup(&self, asid: AddressSpaceId, page: VirtualPage) -> Option<TlbEntry> {
        self.state
            .lock()
            .slots
            .iter()
            .flatten()
            .find(|e| e.asid == asid && e.page == page)
            .copied()
    }

    /// Snapshot of all valid entries.
    #[must_use]
    pub fn entries(&self) -> Vec<TlbEntry> {
        self.state.lock().slots.iter().flatten().copied().collect()
    }

    /// Number of valid entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().slots.iter().flatten().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Tlb for SoftTlb {
    fn install(&self, asid: AddressSpaceId, page: VirtualPage, frame: PhysicalPage, writable: bool) {
        let entry = TlbEntry {
            asid,
            page,
            frame,
            writable,
        };
        let mut state = self.state.lock();
        let existing = state
            .slots
            .iter()
            .position(|s| s.is_some_and(|e| e.asid == asid && e.page == page));
        let slot = match existing.or_else(|| state.slots.iter().position(Option::is_none)) {
            Some(slot) => slot,
            None => {
                let victim = state.next_victim;
                state.next_victim = (victim + 1) % state.slots.len();
                victim
            }
        };
        state.slots[slot] = Some(entry);
    }

    fn invalidate(&self, asid: AddressSpaceId, page: VirtualPage) {
        for slot in &mut self.state.lock().slots {
            if slot.is_some_and(|e| e.asid == asid && e.page == page) {
                *slot = None;
            }
        }
    }

    fn invalidate_all(&self) {
        self.state.lock().slots.fill(None);
    }

    fn invalidate_space(&self, asid: AddressSpaceId) {
        for slot in &mut self.state.lock().slots {
            if slot.is_some_and(|e| e.asid == asid) {
                *slot = None;
            }
        }
    }
}

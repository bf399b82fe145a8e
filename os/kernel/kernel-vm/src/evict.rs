//! # Eviction
//!
//! Freeing frames under memory pressure. A victim is chosen by the coremap's
//! clock and comes back pinned; from then on only the evictor may touch it.
//! The owner's address-space lock is taken next, and the victim is checked
//! against both the coremap (same allocation generation) and the owner's page
//! table (still resident on that frame). Anything that changed in between
//! means someone else already dealt with the page and the victim is dropped.
//!
//! Dirty pages are written to a fresh swap slot while the owner's lock is
//! held; clean pages are simply unmapped and reloaded from their region on the
//! next touch.

use alloc::vec::Vec;
use kernel_alloc::{AllocError, Claim, PageBuf, Reservation, Victim};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalPage, VirtualAddress};
use kernel_vmem::{AddressSpace, PageState};

use crate::{Vm, VmError};

/// What became of a victim handed to [`Vm::evict`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Eviction {
    /// The page was unmapped and its frame freed.
    Evicted,
    /// The owner freed the frame first. The pin is kept if it was asked for.
    AlreadyFree,
    /// The frame was reused or remapped; nothing was done.
    Stale,
}

impl Vm {
    /// Allocate `count` contiguous frames for `claim`, evicting user pages
    /// when no free run is long enough.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if no run can be freed because every
    /// candidate window contains kernel frames, and [`VmError::SwapExhausted`]
    /// if the dirty pages in the way cannot be written out. In both cases no
    /// frame has changed hands.
    pub fn get_pages_with_swap(&self, count: u32, claim: &Claim) -> Result<PhysicalPage, VmError> {
        loop {
            match self.coremap.get_pages(count, claim) {
                Ok(base) => return Ok(base),
                Err(AllocError::OutOfMemory { .. }) => {}
                Err(e) => return Err(e.into()),
            }

            let reservation = if count == 1 {
                match self.reserve_one() {
                    // Every user frame is pinned, but some frame is in flight
                    // between an evictor and its claim.
                    Err(VmError::OutOfMemory { .. }) if self.coremap.stats().free > 0 => {
                        core::hint::spin_loop();
                        continue;
                    }
                    other => other?,
                }
            } else {
                self.reserve_run(count)?
            };
            if let Ok(base) = self.coremap.claim_reserved(&reservation, claim) {
                log::debug!("allocated {count} frame(s) at {base} after eviction");
                return Ok(base);
            }
            // The window was already unpinned; try again from scratch.
            log::debug!("reserved window at {} was lost, retrying", reservation.base);
        }
    }

    /// Evict one victim and keep its frame pinned for the caller.
    fn reserve_one(&self) -> Result<Reservation, VmError> {
        let base = self.evict_next(true)?;
        Ok(Reservation {
            base,
            count: 1,
            victims: Vec::new(),
        })
    }

    /// Evict the next page the clock offers and return its frame.
    ///
    /// Once swap is full a dirty victim is put back and a clean page is
    /// dropped in its place.
    fn evict_next(&self, keep_pinned: bool) -> Result<PhysicalPage, VmError> {
        loop {
            let Some(mut victim) = self.coremap.select_victim() else {
                log::warn!("out of memory: no evictable frame");
                return Err(VmError::OutOfMemory { requested: 1 });
            };
            if victim.dirty && self.swap.slots_free() == 0 {
                self.coremap.abandon_victim(&victim, false);
                let Some(clean) = self.coremap.select_clean_victim() else {
                    log::error!("swap exhausted and no clean page left to drop");
                    return Err(VmError::SwapExhausted);
                };
                victim = clean;
            }
            match self.evict(&victim, keep_pinned) {
                Ok(Eviction::Evicted | Eviction::AlreadyFree) => return Ok(victim.frame),
                Ok(Eviction::Stale) => {}
                // Dirtied, or the last slot was taken, after selection.
                Err(VmError::SwapExhausted) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Pin and empty the cheapest window of `count` frames.
    fn reserve_run(&self, count: u32) -> Result<Reservation, VmError> {
        let Some(reservation) = self.coremap.reserve_window(count) else {
            log::warn!("out of memory: no window of {count} frames without kernel pages");
            return Err(VmError::OutOfMemory { requested: count });
        };

        let dirty = reservation.victims.iter().filter(|v| v.dirty).count();
        if dirty > self.swap.slots_free() as usize {
            self.coremap.cancel_reservation(&reservation);
            log::warn!(
                "cannot free {count} frames: {dirty} dirty pages, {} free slots",
                self.swap.slots_free()
            );
            return Err(VmError::SwapExhausted);
        }

        for victim in &reservation.victims {
            if let Err(e) = self.evict(victim, true) {
                self.coremap.cancel_reservation(&reservation);
                return Err(e);
            }
        }
        Ok(reservation)
    }

    /// Evict one page chosen by the clock and return the freed frame.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if there is no user frame to evict,
    /// [`VmError::SwapExhausted`] if swap is full and every evictable page is
    /// dirty.
    pub fn swap_out(&self) -> Result<PhysicalPage, VmError> {
        self.evict_next(false)
    }

    /// Evict the page at `address` of `space` if it is resident.
    ///
    /// Returns `Ok(false)` if the page is not resident or currently pinned.
    ///
    /// # Errors
    /// [`VmError::SwapExhausted`] or I/O errors while writing a dirty page.
    pub fn evict_page(&self, space: &AddressSpace, address: VirtualAddress) -> Result<bool, VmError> {
        let Some(frame) = space.lock().page_table.get(address.page()).frame() else {
            return Ok(false);
        };
        let Some(victim) = self.coremap.pin_for_eviction(frame) else {
            return Ok(false);
        };
        if victim.owner.id() != space.id() {
            self.coremap.abandon_victim(&victim, false);
            return Ok(false);
        }
        Ok(self.evict(&victim, false)? == Eviction::Evicted)
    }

    /// Write out (if dirty) and unmap a pinned victim, then free its frame.
    ///
    /// With `keep_pinned` the freed frame stays pinned for the caller.
    pub(crate) fn evict(&self, victim: &Victim, keep_pinned: bool) -> Result<Eviction, VmError> {
        let Some(space) = victim.owner.upgrade() else {
            // The owner is being torn down and no longer reachable.
            log::warn!(
                "evicting {} of vanished {}",
                victim.frame,
                victim.owner.id()
            );
            self.coremap.finish_eviction(victim, keep_pinned);
            return Ok(Eviction::Evicted);
        };

        let mut state = space.lock();
        let resident_here = matches!(
            state.page_table.get(victim.vpage),
            PageState::Resident { frame, .. } if frame == victim.frame
        );
        if !resident_here || !self.coremap.is_current(victim) {
            drop(state);
            log::debug!("victim {} went stale", victim.frame);
            return Ok(if self.coremap.abandon_victim(victim, keep_pinned) {
                Eviction::AlreadyFree
            } else {
                Eviction::Stale
            });
        }

        self.tlb.invalidate(space.id(), victim.vpage);

        // Stores since the victim was picked show up in the coremap.
        let dirty = self.coremap.is_dirty(victim.frame).unwrap_or(victim.dirty);
        let next = if dirty {
            let Some(slot) = self.swap.alloc_slot() else {
                drop(state);
                self.coremap.abandon_victim(victim, false);
                log::warn!(
                    "no swap slot for {} of {}",
                    victim.vpage,
                    space.id()
                );
                return Err(VmError::SwapExhausted);
            };
            let mut buf: PageBuf = [0; PAGE_SIZE as usize];
            self.memory.read_frame(victim.frame, &mut buf);
            if let Err(e) = self.swap.write(slot, &buf) {
                self.swap.free_slot(slot);
                drop(state);
                self.coremap.abandon_victim(victim, false);
                return Err(e.into());
            }
            PageState::Swapped(slot)
        } else {
            PageState::Unmapped
        };

        state.page_table.set(victim.vpage, next);
        self.coremap.finish_eviction(victim, keep_pinned);
        drop(state);

        log::debug!(
            "evicted {} {} from {}: {next:?}",
            space.id(),
            victim.vpage,
            victim.frame
        );
        Ok(Eviction::Evicted)
    }
}

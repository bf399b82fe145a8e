//! # Coremap
//!
//! One [`CoremapEntry`] per physical frame, recording who owns the frame and
//! what state it is in. Every physical allocation in the kernel goes through
//! here; the array is sized once from [`BootMemory`] and never resized.
//!
//! ## Frame states
//!
//! | State        | Owner            | Evictable |
//! |--------------|------------------|-----------|
//! | `Fixed`      | kernel           | never     |
//! | `Free`       | none             | n/a       |
//! | `UserDirty`  | one address space| yes, written to swap |
//! | `UserClean`  | one address space| yes, dropped |
//!
//! ## Allocation runs
//!
//! A multi-frame kernel allocation is described by an [`AllocRun`] on its
//! first frame; every frame of the run also records the run's base frame, so
//! freeing anything but the base is detected.
//!
//! ## Pins
//!
//! A pinned frame has exactly one holder (a fault filling it, or an evictor
//! writing it out) and is skipped by allocation and victim selection. Freeing
//! a pinned user frame leaves the pin in place for its holder to drop.
//!
//! All state is behind one spin lock. Nothing in this module performs I/O or
//! touches frame contents, so the lock is never held across a device access.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use kernel_info::boot::BootMemory;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualPage};
use kernel_vmem::{AddressSpace, AddressSpaceId};
use spin::Mutex;

use crate::AllocError;

/// Ownership state of one physical frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FrameState {
    /// Kernel memory; never evicted.
    Fixed,
    Free,
    /// User page modified since it was loaded.
    UserDirty,
    /// User page whose contents can be rebuilt from the region's backing.
    UserClean,
}

impl FrameState {
    #[inline]
    #[must_use]
    pub const fn is_user(self) -> bool {
        matches!(self, Self::UserDirty | Self::UserClean)
    }

    const fn tag(self) -> &'static str {
        match self {
            Self::Fixed => "FIXED",
            Self::Free => "FREE",
            Self::UserDirty => "DIRTY",
            Self::UserClean => "CLEAN",
        }
    }
}

/// Descriptor of a contiguous allocation, kept on its first frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AllocRun {
    pub base: PhysicalPage,
    pub len: u32,
}

/// Weak back-reference from a user frame to the address space mapping it.
#[derive(Clone)]
pub struct FrameOwner {
    id: AddressSpaceId,
    space: Weak<AddressSpace>,
}

impl FrameOwner {
    #[must_use]
    pub fn new(space: &Arc<AddressSpace>) -> Self {
        Self {
            id: space.id(),
            space: Arc::downgrade(space),
        }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> AddressSpaceId {
        self.id
    }

    /// The owning address space, if it still exists.
    #[must_use]
    pub fn upgrade(&self) -> Option<Arc<AddressSpace>> {
        self.space.upgrade()
    }
}

impl fmt::Debug for FrameOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.id, f)
    }
}

/// What a new allocation is for.
#[derive(Clone, Debug)]
pub enum Claim {
    /// Kernel memory, reached through the direct-mapped segment.
    Kernel,
    /// A single frame backing `vpage` of `owner`. User frames are handed out
    /// pinned; the caller unpins once the page table points at them.
    User {
        owner: FrameOwner,
        vpage: VirtualPage,
        dirty: bool,
    },
}

/// One coremap slot.
#[derive(Clone, Debug)]
pub struct CoremapEntry {
    frame: PhysicalPage,
    state: FrameState,
    owner: Option<FrameOwner>,
    vpage: Option<VirtualPage>,
    alloc_base: Option<PhysicalPage>,
    run: Option<AllocRun>,
    /// Virtual mappings of this frame; 1 for every allocated frame since
    /// frames are never shared.
    map_count: u32,
    /// Second-chance bit for the clock.
    referenced: bool,
    pinned: bool,
    /// Reserved for the kernel image at bootstrap.
    boot: bool,
    generation: u64,
}

impl CoremapEntry {
    const fn free(frame: PhysicalPage) -> Self {
        Self {
            frame,
            state: FrameState::Free,
            owner: None,
            vpage: None,
            alloc_base: None,
            run: None,
            map_count: 0,
            referenced: false,
            pinned: false,
            boot: false,
            generation: 0,
        }
    }

    const fn is_available(&self) -> bool {
        matches!(self.state, FrameState::Free) && !self.pinned
    }

    const fn is_evictable(&self) -> bool {
        self.state.is_user() && !self.pinned
    }

    fn release(&mut self) {
        self.state = FrameState::Free;
        self.owner = None;
        self.vpage = None;
        self.alloc_base = None;
        self.run = None;
        self.map_count = 0;
        self.referenced = false;
    }

    fn info(&self) -> FrameInfo {
        FrameInfo {
            frame: self.frame,
            state: self.state,
            owner: self.owner.as_ref().map(FrameOwner::id),
            vpage: self.vpage,
            alloc_base: self.alloc_base,
            run: self.run,
            map_count: self.map_count,
            referenced: self.referenced,
            pinned: self.pinned,
            boot: self.boot,
            generation: self.generation,
        }
    }
}

/// Plain-data copy of a coremap entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FrameInfo {
    pub frame: PhysicalPage,
    pub state: FrameState,
    pub owner: Option<AddressSpaceId>,
    pub vpage: Option<VirtualPage>,
    pub alloc_base: Option<PhysicalPage>,
    pub run: Option<AllocRun>,
    pub map_count: u32,
    pub referenced: bool,
    pub pinned: bool,
    pub boot: bool,
    pub generation: u64,
}

/// Per-state frame counts.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CoremapStats {
    pub fixed: usize,
    pub free: usize,
    pub user_dirty: usize,
    pub user_clean: usize,
    /// Pinned frames, in any state.
    pub pinned: usize,
}

impl CoremapStats {
    /// Sum over all states; always the number of frames.
    #[inline]
    #[must_use]
    pub const fn total(&self) -> usize {
        self.fixed + self.free + self.user_dirty + self.user_clean
    }

    /// User frames, dirty or clean.
    #[inline]
    #[must_use]
    pub const fn user(&self) -> usize {
        self.user_dirty + self.user_clean
    }
}

impl fmt::Display for CoremapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frames: {} fixed, {} free, {} dirty, {} clean, {} pinned",
            self.total(),
            self.fixed,
            self.free,
            self.user_dirty,
            self.user_clean,
            self.pinned
        )
    }
}

/// A user frame picked for eviction, pinned on behalf of the evictor.
#[derive(Clone, Debug)]
pub struct Victim {
    pub frame: PhysicalPage,
    pub owner: FrameOwner,
    pub vpage: VirtualPage,
    pub dirty: bool,
    pub generation: u64,
}

/// A window of frames pinned so that it can be turned into one contiguous
/// allocation once its user frames are evicted.
#[derive(Debug)]
pub struct Reservation {
    pub base: PhysicalPage,
    pub count: u32,
    pub victims: Vec<Victim>,
}

struct CoremapInner {
    entries: Vec<CoremapEntry>,
    hand: usize,
    generation: u64,
}

impl CoremapInner {
    fn entry(&self, frame: PhysicalPage) -> Option<&CoremapEntry> {
        self.entries.get(frame.index())
    }

    fn entry_mut(&mut self, frame: PhysicalPage) -> &mut CoremapEntry {
        let total = self.entries.len();
        match self.entries.get_mut(frame.index()) {
            Some(e) => e,
            None => panic!("{frame} is outside physical memory ({total} frames)"),
        }
    }

    /// First index of `count` consecutive available frames.
    fn find_free_run(&self, count: usize) -> Option<usize> {
        let mut start = 0;
        let mut len = 0;
        for (i, e) in self.entries.iter().enumerate() {
            if e.is_available() {
                if len == 0 {
                    start = i;
                }
                len += 1;
                if len == count {
                    return Some(start);
                }
            } else {
                len = 0;
            }
        }
        None
    }

    /// Mark `[start, start + count)` as allocated for `claim`.
    fn claim(&mut self, start: usize, count: usize, claim: &Claim) -> PhysicalPage {
        let base = self.entries[start].frame;
        #[allow(clippy::cast_possible_truncation)]
        let run = AllocRun {
            base,
            len: count as u32,
        };
        let Self {
            entries,
            generation,
            ..
        } = self;

        for (i, e) in entries[start..start + count].iter_mut().enumerate() {
            *generation += 1;
            e.generation = *generation;
            e.alloc_base = Some(base);
            e.run = (i == 0).then_some(run);
            e.map_count = 1;
            e.boot = false;
            match claim {
                Claim::Kernel => {
                    e.state = FrameState::Fixed;
                    e.owner = None;
                    e.vpage = None;
                    e.referenced = false;
                    e.pinned = false;
                }
                Claim::User {
                    owner,
                    vpage,
                    dirty,
                } => {
                    e.state = if *dirty {
                        FrameState::UserDirty
                    } else {
                        FrameState::UserClean
                    };
                    e.owner = Some(owner.clone());
                    e.vpage = Some(*vpage);
                    e.referenced = true;
                    e.pinned = true;
                }
            }
        }
        base
    }

    fn stats(&self) -> CoremapStats {
        let mut stats = CoremapStats::default();
        for e in &self.entries {
            match e.state {
                FrameState::Fixed => stats.fixed += 1,
                FrameState::Free => stats.free += 1,
                FrameState::UserDirty => stats.user_dirty += 1,
                FrameState::UserClean => stats.user_clean += 1,
            }
            if e.pinned {
                stats.pinned += 1;
            }
        }
        stats
    }

    fn victim(e: &mut CoremapEntry) -> Option<Victim> {
        let (Some(owner), Some(vpage)) = (e.owner.clone(), e.vpage) else {
            return None;
        };
        e.pinned = true;
        Some(Victim {
            frame: e.frame,
            owner,
            vpage,
            dirty: matches!(e.state, FrameState::UserDirty),
            generation: e.generation,
        })
    }
}

/// The physical frame table.
pub struct Coremap {
    inner: Mutex<CoremapInner>,
}

impl Coremap {
    /// Build the coremap for `boot`: frames below its first free address are
    /// fixed, the rest free.
    #[must_use]
    pub fn new(boot: &BootMemory) -> Self {
        let reserved = boot.reserved_frames() as usize;
        let entries = (0..boot.total_frames())
            .map(|n| {
                let mut e = CoremapEntry::free(PhysicalPage::new(n));
                if (n as usize) < reserved {
                    e.state = FrameState::Fixed;
                    e.boot = true;
                    e.map_count = 1;
                }
                e
            })
            .collect();

        log::info!(
            "coremap: {} frames, {} reserved for the kernel image",
            boot.total_frames(),
            reserved
        );
        Self {
            inner: Mutex::new(CoremapInner {
                entries,
                hand: reserved,
                generation: 0,
            }),
        }
    }

    /// Number of physical frames.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn stats(&self) -> CoremapStats {
        self.inner.lock().stats()
    }

    /// Copy of the entry for `frame`.
    #[must_use]
    pub fn info(&self, frame: PhysicalPage) -> Option<FrameInfo> {
        self.inner.lock().entry(frame).map(CoremapEntry::info)
    }

    /// Copy of every entry, for diagnostics.
    #[must_use]
    pub fn snapshot(&self) -> CoremapSnapshot {
        let inner = self.inner.lock();
        CoremapSnapshot {
            stats: inner.stats(),
            frames: inner.entries.iter().map(CoremapEntry::info).collect(),
        }
    }

    /// Allocate `count` contiguous free frames for `claim` and return the
    /// first one.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`] if no free run is long enough; nothing is
    /// allocated in that case. User claims must ask for exactly one frame.
    pub fn get_pages(&self, count: u32, claim: &Claim) -> Result<PhysicalPage, AllocError> {
        let n = count as usize;
        if n == 0 || (n > 1 && matches!(claim, Claim::User { .. })) {
            return Err(AllocError::InvalidCount(count));
        }
        let mut inner = self.inner.lock();
        let Some(start) = inner.find_free_run(n) else {
            return Err(AllocError::OutOfMemory { requested: count });
        };
        let base = inner.claim(start, n, claim);
        drop(inner);
        log::debug!("allocated {count} frame(s) at {base} for {claim:?}");
        Ok(base)
    }

    /// Allocate `count` contiguous kernel frames.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`] if no free run is long enough.
    pub fn alloc_kernel_pages(&self, count: u32) -> Result<PhysicalAddress, AllocError> {
        self.get_pages(count, &Claim::Kernel).map(PhysicalAddress::from)
    }

    /// Free the kernel allocation starting at `pa`.
    ///
    /// # Panics
    /// Panics if `pa` is not the first frame of a live kernel allocation: a
    /// double free, a frame inside a run, a user frame or a frame reserved at
    /// boot.
    pub fn free_kernel_pages(&self, pa: PhysicalAddress) {
        assert!(pa.is_page_aligned(), "free_kpages({pa}): not page aligned");
        let frame = pa.page();
        let mut inner = self.inner.lock();
        let e = inner.entry_mut(frame);

        match e.state {
            FrameState::Free => panic!("free_kpages({pa}): double free"),
            FrameState::UserDirty | FrameState::UserClean => {
                panic!("free_kpages({pa}): frame belongs to {:?}", e.owner)
            }
            FrameState::Fixed if e.boot => panic!("free_kpages({pa}): frame holds the kernel image"),
            FrameState::Fixed => {}
        }
        let Some(run) = e.run.filter(|r| r.base == frame) else {
            panic!(
                "free_kpages({pa}): not the start of an allocation (run starts at {:?})",
                e.alloc_base
            );
        };

        for n in 0..run.len {
            let e = inner.entry_mut(run.base.offset_by(n));
            assert!(
                e.state == FrameState::Fixed && e.alloc_base == Some(run.base),
                "free_kpages({pa}): frame {} of the run is {:?}",
                e.frame,
                e.state
            );
            e.release();
        }
        drop(inner);
        log::debug!("freed {} kernel frame(s) at {}", run.len, run.base);
    }

    /// Allocate one frame for `vpage` of `owner`. The frame is returned pinned.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`] if no frame is free.
    pub fn alloc_user_page(
        &self,
        owner: FrameOwner,
        vpage: VirtualPage,
        dirty: bool,
    ) -> Result<PhysicalPage, AllocError> {
        self.get_pages(
            1,
            &Claim::User {
                owner,
                vpage,
                dirty,
            },
        )
    }

    /// Return a user frame to the free pool.
    ///
    /// # Panics
    /// Panics if the frame is not a user frame.
    pub fn free_user_page(&self, frame: PhysicalPage) {
        let mut inner = self.inner.lock();
        let e = inner.entry_mut(frame);
        assert!(
            e.state.is_user(),
            "free_upages({}): frame is {:?}, not a user page",
            frame.base(),
            e.state
        );
        e.release();
    }

    /// The live address space owning a user frame.
    #[must_use]
    pub fn owner_of(&self, frame: PhysicalPage) -> Option<Arc<AddressSpace>> {
        let owner = self.inner.lock().entry(frame)?.owner.clone()?;
        owner.upgrade()
    }

    /// Drop the pin on `frame`.
    pub fn unpin(&self, frame: PhysicalPage) {
        self.inner.lock().entry_mut(frame).pinned = false;
    }

    /// Record that `frame` was just used; the clock will pass it once.
    pub fn touch(&self, frame: PhysicalPage) {
        self.inner.lock().entry_mut(frame).referenced = true;
    }

    /// Mark a user frame as modified.
    pub fn mark_dirty(&self, frame: PhysicalPage) {
        let mut inner = self.inner.lock();
        let e = inner.entry_mut(frame);
        if e.state == FrameState::UserClean {
            e.state = FrameState::UserDirty;
        }
    }

    /// Whether a user frame is currently dirty; `None` for other frames.
    #[must_use]
    pub fn is_dirty(&self, frame: PhysicalPage) -> Option<bool> {
        let inner = self.inner.lock();
        match inner.entry(frame)?.state {
            FrameState::UserDirty => Some(true),
            FrameState::UserClean => Some(false),
            _ => None,
        }
    }

    /// Pick a user frame to evict with the clock algorithm and pin it.
    ///
    /// Returns `None` if there is no unpinned user frame.
    pub fn select_victim(&self) -> Option<Victim> {
        let mut inner = self.inner.lock();
        let total = inner.entries.len();
        for _ in 0..2 * total {
            let i = inner.hand;
            inner.hand = (i + 1) % total;
            let e = &mut inner.entries[i];
            if !e.is_evictable() {
                continue;
            }
            if e.referenced {
                e.referenced = false;
                continue;
            }
            return CoremapInner::victim(e);
        }
        None
    }

    /// Pick an unpinned clean user frame and pin it, ignoring reference bits.
    ///
    /// Used when swap is full: clean pages are the only ones that can still
    /// be dropped.
    pub fn select_clean_victim(&self) -> Option<Victim> {
        let mut inner = self.inner.lock();
        let total = inner.entries.len();
        for _ in 0..total {
            let i = inner.hand;
            inner.hand = (i + 1) % total;
            let e = &mut inner.entries[i];
            if e.is_evictable() && e.state == FrameState::UserClean {
                return CoremapInner::victim(e);
            }
        }
        None
    }

    /// Pin the best window of `count` frames that are all either free or
    /// evictable, preferring the window with the fewest victims.
    ///
    /// Returns `None` without changing anything if no such window exists.
    pub fn reserve_window(&self, count: u32) -> Option<Reservation> {
        let n = count as usize;
        let mut inner = self.inner.lock();
        let total = inner.entries.len();
        if n == 0 || n > total {
            return None;
        }

        let mut best: Option<(usize, usize)> = None;
        for start in 0..=total - n {
            let window = &inner.entries[start..start + n];
            if !window.iter().all(|e| e.is_available() || e.is_evictable()) {
                continue;
            }
            let victims = window.iter().filter(|e| e.is_evictable()).count();
            if best.is_none_or(|(_, v)| victims < v) {
                best = Some((start, victims));
            }
        }
        let (start, _) = best?;

        let mut victims = Vec::new();
        for e in &mut inner.entries[start..start + n] {
            if e.is_evictable() {
                if let Some(v) = CoremapInner::victim(e) {
                    victims.push(v);
                }
            } else {
                e.pinned = true;
            }
        }
        Some(Reservation {
            base: inner.entries[start].frame,
            count,
            victims,
        })
    }

    /// Whether `victim` still describes the allocation it was taken from.
    #[must_use]
    pub fn is_current(&self, victim: &Victim) -> bool {
        let inner = self.inner.lock();
        inner.entry(victim.frame).is_some_and(|e| {
            e.generation == victim.generation
                && e.state.is_user()
                && e.vpage == Some(victim.vpage)
                && e.owner.as_ref().map(FrameOwner::id) == Some(victim.owner.id())
        })
    }

    /// Free an evicted frame. With `keep_pinned` the frame stays reserved for
    /// the caller.
    pub fn finish_eviction(&self, victim: &Victim, keep_pinned: bool) {
        let mut inner = self.inner.lock();
        let e = inner.entry_mut(victim.frame);
        if e.state.is_user() && e.generation == victim.generation {
            e.release();
        }
        e.pinned = keep_pinned;
    }

    /// Give up on `victim` without evicting it. With `keep_pinned` a frame that
    /// meanwhile became free stays reserved for the caller.
    ///
    /// Returns whether the pin was kept.
    pub fn abandon_victim(&self, victim: &Victim, keep_pinned: bool) -> bool {
        let mut inner = self.inner.lock();
        let e = inner.entry_mut(victim.frame);
        e.pinned = keep_pinned && e.state == FrameState::Free;
        e.pinned
    }

    /// Pin a specific user frame for eviction.
    ///
    /// Returns `None` if the frame is not an unpinned user frame.
    pub fn pin_for_eviction(&self, frame: PhysicalPage) -> Option<Victim> {
        let mut inner = self.inner.lock();
        let e = inner.entries.get_mut(frame.index())?;
        if !e.is_evictable() {
            return None;
        }
        CoremapInner::victim(e)
    }

    /// Turn a fully evicted reservation into an allocation for `claim`.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`] if a frame of the window is not free; the
    /// whole window is unpinned in that case.
    pub fn claim_reserved(
        &self,
        reservation: &Reservation,
        claim: &Claim,
    ) -> Result<PhysicalPage, AllocError> {
        let n = reservation.count as usize;
        let start = reservation.base.index();
        let mut inner = self.inner.lock();
        let ready = inner.entries[start..start + n]
            .iter()
            .all(|e| e.state == FrameState::Free && e.pinned);
        if !ready {
            for e in &mut inner.entries[start..start + n] {
                e.pinned = false;
            }
            return Err(AllocError::OutOfMemory {
                requested: reservation.count,
            });
        }
        Ok(inner.claim(start, n, claim))
    }

    /// Unpin every frame of an abandoned reservation.
    pub fn cancel_reservation(&self, reservation: &Reservation) {
        let start = reservation.base.index();
        let mut inner = self.inner.lock();
        for e in &mut inner.entries[start..start + reservation.count as usize] {
            e.pinned = false;
        }
    }
}

/// Point-in-time copy of the coremap.
#[derive(Clone, Debug)]
pub struct CoremapSnapshot {
    pub stats: CoremapStats,
    pub frames: Vec<FrameInfo>,
}

impl CoremapSnapshot {
    /// Frames in `state`.
    pub fn in_state(&self, state: FrameState) -> impl Iterator<Item = &FrameInfo> {
        self.frames.iter().filter(move |f| f.state == state)
    }
}

impl fmt::Display for CoremapSnapshot {
    /// One line per kernel run, user frame, or stretch of free frames.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "coremap: {}", self.stats)?;
        let mut i = 0;
        while i < self.frames.len() {
            let e = &self.frames[i];
            let len = match e.state {
                FrameState::Free | FrameState::Fixed if e.boot || e.run.is_none() => self.frames
                    [i..]
                    .iter()
                    .take_while(|o| o.state == e.state && o.boot == e.boot && o.run.is_none())
                    .count()
                    .max(1),
                _ => e.run.map_or(1, |r| r.len as usize),
            };
            let last = self.frames[(i + len - 1).min(self.frames.len() - 1)].frame;
            write!(f, "  [{} - {}] {:5}", e.frame, last, e.state.tag())?;
            if e.boot {
                write!(f, " kernel image")?;
            }
            if let (Some(owner), Some(vpage)) = (e.owner, e.vpage) {
                write!(f, " {owner} {}", vpage.base())?;
            }
            if e.pinned {
                write!(f, " pinned")?;
            }
            writeln!(f)?;
            i += len;
        }
        Ok(())
    }
}

//! # Regions of a User Address Space
//!
//! A [`RegionList`] records which virtual pages of a process are legal to
//! touch and what they contain before the first touch:
//!
//! - **Code**: the read-only segment of the executable.
//! - **Data**: writable segments of the executable.
//! - **Heap**: starts empty on the page after the highest segment and moves
//!   with [`RegionList::sbrk`].
//! - **Stack**: ends at [`USER_STACK_TOP`] and grows downward on demand.
//!
//! Region boundaries are page granular. A segment whose virtual address is
//! not page aligned still owns whole pages; the bytes outside its file image
//! are zero.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use kernel_info::memory::{
    USER_MIN_ADDRESS, USER_STACK_INITIAL_PAGES, USER_STACK_MAX, USER_STACK_TOP, USERSPACE_END,
};
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, VirtualAddress, VirtualPage};

bitflags::bitflags! {
    /// Access permissions of a region, as given by the segment header.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct RegionPerms: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;

        const RW = Self::READ.bits() | Self::WRITE.bits();
        const RX = Self::READ.bits() | Self::EXEC.bits();
    }
}

/// What a region is used for.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RegionKind {
    Code,
    Data,
    Heap,
    Stack,
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Code => "code",
            Self::Data => "data",
            Self::Heap => "heap",
            Self::Stack => "stack",
        })
    }
}

/// Failure reading the initial bytes of a segment.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SegmentReadError {
    #[error("segment read of {len} bytes at offset {offset:#x} is out of bounds")]
    OutOfBounds { offset: u64, len: usize },
    #[error("segment source I/O failed")]
    Io,
}

/// Provider of a segment's file image, typically the executable's vnode.
pub trait SegmentSource: Send + Sync {
    /// Fill `buf` completely with the bytes at `offset`.
    ///
    /// # Errors
    /// Returns an error if the range is not fully backed or the read fails.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), SegmentReadError>;
}

fn read_from_slice(bytes: &[u8], offset: u64, buf: &mut [u8]) -> Result<(), SegmentReadError> {
    let out_of_bounds = SegmentReadError::OutOfBounds {
        offset,
        len: buf.len(),
    };
    let start = usize::try_from(offset).map_err(|_| out_of_bounds)?;
    let end = start.checked_add(buf.len()).ok_or(out_of_bounds)?;
    let src = bytes.get(start..end).ok_or(out_of_bounds)?;
    buf.copy_from_slice(src);
    Ok(())
}

impl SegmentSource for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), SegmentReadError> {
        read_from_slice(self, offset, buf)
    }
}

impl SegmentSource for &'static [u8] {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), SegmentReadError> {
        read_from_slice(self, offset, buf)
    }
}

/// Where the contents of a never-touched page come from.
#[derive(Clone)]
pub enum Backing {
    /// Zero-filled.
    Zero,
    /// The bytes `[vaddr, vaddr + file_size)` come from `source` starting at
    /// `file_offset`; everything else is zero.
    Segment {
        source: Arc<dyn SegmentSource>,
        vaddr: VirtualAddress,
        file_offset: u64,
        file_size: u32,
    },
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zero => f.write_str("Zero"),
            Self::Segment {
                vaddr,
                file_offset,
                file_size,
                ..
            } => f
                .debug_struct("Segment")
                .field("vaddr", vaddr)
                .field("file_offset", file_offset)
                .field("file_size", file_size)
                .finish_non_exhaustive(),
        }
    }
}

/// One contiguous range of user pages.
#[derive(Clone, Debug)]
pub struct Region {
    kind: RegionKind,
    start: VirtualPage,
    /// Exclusive.
    end: VirtualPage,
    perms: RegionPerms,
    backing: Backing,
}

impl Region {
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> RegionKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualPage {
        self.start
    }

    /// First page past the region.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualPage {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn perms(&self) -> RegionPerms {
        self.perms
    }

    #[inline]
    #[must_use]
    pub const fn backing(&self) -> &Backing {
        &self.backing
    }

    #[inline]
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.perms.contains(RegionPerms::WRITE)
    }

    #[inline]
    #[must_use]
    pub const fn pages(&self) -> u32 {
        self.end.number() - self.start.number()
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, page: VirtualPage) -> bool {
        self.start <= page && page < self.end
    }

    fn overlaps(&self, start: VirtualPage, end: VirtualPage) -> bool {
        self.start < end && start < self.end
    }

    /// Write the initial contents of `page` into `buf`.
    ///
    /// # Errors
    /// Propagates failures of the segment source.
    pub fn fill_initial(
        &self,
        page: VirtualPage,
        buf: &mut [u8; PAGE_SIZE as usize],
    ) -> Result<(), SegmentReadError> {
        buf.fill(0);
        let Backing::Segment {
            source,
            vaddr,
            file_offset,
            file_size,
        } = &self.backing
        else {
            return Ok(());
        };

        let page_lo = u64::from(page.base().as_u32());
        let page_hi = page_lo + u64::from(PAGE_SIZE);
        let file_lo = u64::from(vaddr.as_u32());
        let file_hi = file_lo + u64::from(*file_size);

        let lo = page_lo.max(file_lo);
        let hi = page_hi.min(file_hi);
        if lo >= hi {
            return Ok(());
        }

        #[allow(clippy::cast_possible_truncation)]
        let dst = &mut buf[(lo - page_lo) as usize..(hi - page_lo) as usize];
        source.read_at(file_offset + (lo - file_lo), dst)
    }
}

/// Reasons a region operation is refused.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RegionError {
    #[error("region at {0} has zero size")]
    ZeroSize(VirtualAddress),
    #[error("region at {base} of {size:#x} bytes leaves user space")]
    OutOfUserSpace { base: VirtualAddress, size: u32 },
    #[error("region at {0} starts in the guard page")]
    BelowMinimum(VirtualAddress),
    #[error("region at {base} of {size:#x} bytes overlaps an existing region")]
    Overlap { base: VirtualAddress, size: u32 },
    #[error("segment file size {file_size:#x} exceeds its memory size {mem_size:#x}")]
    FileLargerThanMemory { file_size: u32, mem_size: u32 },
    #[error("the stack is already defined")]
    StackAlreadyDefined,
    #[error("the heap is already defined")]
    HeapAlreadyDefined,
    #[error("the heap is not defined")]
    NoHeap,
    #[error("break {0} would drop below the start of the heap")]
    HeapUnderflow(VirtualAddress),
    #[error("break {0} would collide with another region")]
    HeapCollision(VirtualAddress),
}

/// Result of moving the program break.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BreakChange {
    /// The break before the call; what `sbrk` returns to user space.
    pub old_break: VirtualAddress,
    /// Pages `[start, end)` that fell out of the heap and must be released.
    pub released: Option<(VirtualPage, VirtualPage)>,
}

/// The regions of one address space, kept sorted by start page.
#[derive(Clone, Debug, Default)]
pub struct RegionList {
    regions: Vec<Region>,
    heap_break: Option<VirtualAddress>,
}

/// Lowest page the stack may ever occupy.
const STACK_FLOOR: VirtualPage = VirtualPage::new((USER_STACK_TOP - USER_STACK_MAX) >> PAGE_SHIFT);

impl RegionList {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            regions: Vec::new(),
            heap_break: None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// The region containing `va`, if any.
    #[must_use]
    pub fn find(&self, va: VirtualAddress) -> Option<&Region> {
        let page = va.page();
        self.regions.iter().find(|r| r.contains(page))
    }

    fn find_kind(&self, kind: RegionKind) -> Option<&Region> {
        self.regions.iter().find(|r| r.kind == kind)
    }

    fn find_kind_mut(&mut self, kind: RegionKind) -> Option<&mut Region> {
        self.regions.iter_mut().find(|r| r.kind == kind)
    }

    #[must_use]
    pub fn stack(&self) -> Option<&Region> {
        self.find_kind(RegionKind::Stack)
    }

    #[must_use]
    pub fn heap(&self) -> Option<&Region> {
        self.find_kind(RegionKind::Heap)
    }

    /// Current program break, once the heap is defined.
    #[inline]
    #[must_use]
    pub const fn heap_break(&self) -> Option<VirtualAddress> {
        self.heap_break
    }

    /// Whether `[start, end)` collides with any region other than `except`.
    fn collides(&self, start: VirtualPage, end: VirtualPage, except: Option<RegionKind>) -> bool {
        self.regions
            .iter()
            .filter(|r| Some(r.kind) != except)
            .any(|r| r.overlaps(start, end))
    }

    fn insert(&mut self, region: Region) {
        let at = self
            .regions
            .partition_point(|r| r.start < region.start);
        self.regions.insert(at, region);
    }

    /// Define a segment of `mem_size` bytes at `base`.
    ///
    /// Segments without [`RegionPerms::WRITE`] become [`RegionKind::Code`],
    /// all others [`RegionKind::Data`].
    ///
    /// # Errors
    /// Rejects empty, overlapping and out-of-range segments, and segments
    /// whose file image is larger than their memory image.
    pub fn define_region(
        &mut self,
        base: VirtualAddress,
        mem_size: u32,
        perms: RegionPerms,
        backing: Backing,
    ) -> Result<RegionKind, RegionError> {
        if mem_size == 0 {
            return Err(RegionError::ZeroSize(base));
        }
        if base.as_u32() < USER_MIN_ADDRESS {
            return Err(RegionError::BelowMinimum(base));
        }
        let out_of_range = RegionError::OutOfUserSpace {
            base,
            size: mem_size,
        };
        let end = base
            .checked_add(mem_size)
            .and_then(VirtualAddress::align_up)
            .ok_or(out_of_range)?;
        if end.as_u32() > USERSPACE_END {
            return Err(out_of_range);
        }
        if let Backing::Segment { file_size, .. } = &backing
            && *file_size > mem_size
        {
            return Err(RegionError::FileLargerThanMemory {
                file_size: *file_size,
                mem_size,
            });
        }

        let start = base.page();
        let end = end.page();
        if self.collides(start, end, None) {
            return Err(RegionError::Overlap {
                base,
                size: mem_size,
            });
        }

        let kind = if perms.contains(RegionPerms::WRITE) {
            RegionKind::Data
        } else {
            RegionKind::Code
        };
        log::trace!("define {kind} region [{start}, {end}) {perms:?}");
        self.insert(Region {
            kind,
            start,
            end,
            perms,
            backing,
        });
        Ok(kind)
    }

    /// Define the user stack and return the initial stack pointer.
    ///
    /// # Errors
    /// Fails if the stack exists already or its initial pages are taken.
    pub fn define_stack(&mut self) -> Result<VirtualAddress, RegionError> {
        if self.stack().is_some() {
            return Err(RegionError::StackAlreadyDefined);
        }
        let top = VirtualAddress::new(USER_STACK_TOP);
        let end = top.page();
        let start = VirtualPage::new(end.number() - USER_STACK_INITIAL_PAGES);
        if self.collides(start, end, None) {
            return Err(RegionError::Overlap {
                base: start.base(),
                size: USER_STACK_INITIAL_PAGES * PAGE_SIZE,
            });
        }
        self.insert(Region {
            kind: RegionKind::Stack,
            start,
            end,
            perms: RegionPerms::RW,
            backing: Backing::Zero,
        });
        Ok(top)
    }

    /// Define an empty heap on the page after the highest segment and return
    /// the initial break.
    ///
    /// # Errors
    /// Fails if the heap exists already.
    pub fn define_heap(&mut self) -> Result<VirtualAddress, RegionError> {
        if self.heap().is_some() {
            return Err(RegionError::HeapAlreadyDefined);
        }
        let start = self
            .regions
            .iter()
            .filter(|r| r.kind != RegionKind::Stack)
            .map(|r| r.end)
            .max()
            .unwrap_or(VirtualAddress::new(USER_MIN_ADDRESS).page());
        self.insert(Region {
            kind: RegionKind::Heap,
            start,
            end: start,
            perms: RegionPerms::RW,
            backing: Backing::Zero,
        });
        let brk = start.base();
        self.heap_break = Some(brk);
        Ok(brk)
    }

    /// Move the program break by `delta` bytes.
    ///
    /// # Errors
    /// Fails without changing anything if the heap is undefined, if the break
    /// would drop below the heap start, or if the heap would run into another
    /// region or the stack's reserved range.
    pub fn sbrk(&mut self, delta: i32) -> Result<BreakChange, RegionError> {
        let (old_break, heap_start, old_end) = match (self.heap_break, self.heap()) {
            (Some(brk), Some(heap)) => (brk, heap.start, heap.end),
            _ => return Err(RegionError::NoHeap),
        };

        let new = i64::from(old_break.as_u32()) + i64::from(delta);
        let new_break = u32::try_from(new)
            .map(VirtualAddress::new)
            .map_err(|_| RegionError::HeapUnderflow(old_break))?;
        if new_break < heap_start.base() {
            return Err(RegionError::HeapUnderflow(new_break));
        }
        let new_end = new_break
            .align_up()
            .ok_or(RegionError::HeapCollision(new_break))?
            .page();
        if new_end > STACK_FLOOR || self.collides(heap_start, new_end, Some(RegionKind::Heap)) {
            return Err(RegionError::HeapCollision(new_break));
        }

        if let Some(heap) = self.find_kind_mut(RegionKind::Heap) {
            heap.end = new_end;
        }
        self.heap_break = Some(new_break);

        let released = (new_end < old_end).then_some((new_end, old_end));
        Ok(BreakChange {
            old_break,
            released,
        })
    }

    /// Extend the stack down to `page`. Does nothing if it already reaches.
    pub fn grow_stack(&mut self, page: VirtualPage) {
        if let Some(stack) = self.find_kind_mut(RegionKind::Stack)
            && page < stack.start
        {
            log::trace!("stack grows from {} down to {page}", stack.start);
            stack.start = page;
        }
    }

    /// Lowest page the stack may grow to.
    #[inline]
    #[must_use]
    pub const fn stack_floor() -> VirtualPage {
        STACK_FLOOR
    }

    /// Whether pages `[start, end)` are free of every region but the stack.
    #[must_use]
    pub fn stack_may_cover(&self, start: VirtualPage, end: VirtualPage) -> bool {
        start >= STACK_FLOOR && !self.collides(start, end, Some(RegionKind::Stack))
    }
}

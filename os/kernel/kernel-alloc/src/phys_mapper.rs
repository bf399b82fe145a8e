//! # Physical Frame Access
//!
//! The virtual-memory code never dereferences physical addresses itself; it
//! asks a [`PhysMemory`] to zero, copy, read or write whole frames.
//!
//! - [`KsegPhysMemory`] reaches RAM through the direct-mapped kernel segment,
//!   where frame `pa` is visible at `KSEG0_BASE + pa`.
//! - [`RamImage`] keeps every frame in a heap buffer so the subsystem can run
//!   on the host.
//!
//! Callers guarantee exclusive use of a frame while they access it, by holding
//! a pin on it or the lock of the address space that maps it.

use alloc::boxed::Box;
use alloc::vec::Vec;
use kernel_info::memory::paddr_to_kvaddr;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage};
use spin::Mutex;

/// One page worth of bytes.
pub type PageBuf = [u8; PAGE_SIZE as usize];

/// Whole-frame access to physical memory.
pub trait PhysMemory: Send + Sync {
    /// Fill `frame` with zeroes.
    fn zero_frame(&self, frame: PhysicalPage);

    /// Copy the contents of `from` into `to`.
    fn copy_frame(&self, from: PhysicalPage, to: PhysicalPage);

    /// Read `frame` into `buf`.
    fn read_frame(&self, frame: PhysicalPage, buf: &mut PageBuf);

    /// Overwrite `frame` with `buf`.
    fn write_frame(&self, frame: PhysicalPage, buf: &PageBuf);
}

/// [`PhysMemory`] through the direct-mapped kernel segment.
pub struct KsegPhysMemory {
    _private: (),
}

impl KsegPhysMemory {
    /// # Safety
    /// The kernel segment must map all of RAM and every frame passed to this
    /// accessor must exist and be writable.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }

    #[inline]
    fn frame_ptr(frame: PhysicalPage) -> *mut u8 {
        paddr_to_kvaddr(PhysicalAddress::from(frame)).as_u32() as usize as *mut u8
    }
}

impl PhysMemory for KsegPhysMemory {
    fn zero_frame(&self, frame: PhysicalPage) {
        // SAFETY: `new` requires the kernel segment to cover every frame.
        unsafe { core::ptr::write_bytes(Self::frame_ptr(frame), 0, PAGE_SIZE as usize) };
    }

    fn copy_frame(&self, from: PhysicalPage, to: PhysicalPage) {
        debug_assert_ne!(from, to);
        // SAFETY: distinct frames never overlap; both are mapped per `new`.
        unsafe {
            core::ptr::copy_nonoverlapping(
                Self::frame_ptr(from),
                Self::frame_ptr(to),
                PAGE_SIZE as usize,
            );
        }
    }

    fn read_frame(&self, frame: PhysicalPage, buf: &mut PageBuf) {
        // SAFETY: see `zero_frame`.
        unsafe {
            core::ptr::copy_nonoverlapping(Self::frame_ptr(frame), buf.as_mut_ptr(), buf.len());
        }
    }

    fn write_frame(&self, frame: PhysicalPage, buf: &PageBuf) {
        // SAFETY: see `zero_frame`.
        unsafe {
            core::ptr::copy_nonoverlapping(buf.as_ptr(), Self::frame_ptr(frame), buf.len());
        }
    }
}

/// Simulated RAM, one heap buffer per frame.
pub struct RamImage {
    frames: Vec<Mutex<Box<PageBuf>>>,
}

impl RamImage {
    /// RAM of `frames` zeroed frames.
    #[must_use]
    pub fn new(frames: u32) -> Self {
        Self {
            frames: (0..frames)
                .map(|_| Mutex::new(Box::new([0; PAGE_SIZE as usize])))
                .collect(),
        }
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn frame(&self, frame: PhysicalPage) -> &Mutex<Box<PageBuf>> {
        match self.frames.get(frame.index()) {
            Some(f) => f,
            None => panic!("{frame} is outside the simulated RAM"),
        }
    }

    /// Copy bytes out of physical memory. The range must stay in one frame.
    ///
    /// # Panics
    /// Panics if the range crosses a frame boundary.
    pub fn read(&self, pa: PhysicalAddress, buf: &mut [u8]) {
        let (frame, offset) = pa.split();
        let start = offset.as_usize();
        let page = self.frame(frame).lock();
        buf.copy_from_slice(&page[start..start + buf.len()]);
    }

    /// Copy bytes into physical memory. The range must stay in one frame.
    ///
    /// # Panics
    /// Panics if the range crosses a frame boundary.
    pub fn write(&self, pa: PhysicalAddress, data: &[u8]) {
        let (frame, offset) = pa.split();
        let start = offset.as_usize();
        let mut page = self.frame(frame).lock();
        page[start..start + data.len()].copy_from_slice(data);
    }
}

impl PhysMemory for RamImage {
    fn zero_frame(&self, frame: PhysicalPage) {
        self.frame(frame).lock().fill(0);
    }

    fn copy_frame(&self, from: PhysicalPage, to: PhysicalPage) {
        let src = **self.frame(from).lock();
        **self.frame(to).lock() = src;
    }

    fn read_frame(&self, frame: PhysicalPage, buf: &mut PageBuf) {
        buf.copy_from_slice(&**self.frame(frame).lock());
    }

    fn write_frame(&self, frame: PhysicalPage, buf: &PageBuf) {
        self.frame(frame).lock().copy_from_slice(buf);
    }
}

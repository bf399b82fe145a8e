//! # Swap Store
//!
//! Page-sized slots on a backing device, tracked by an in-memory bitmap.
//!
//! The device holds raw pages at `slot * PAGE_SIZE` with no header; the bitmap
//! is the only index and is never persisted. A slot belongs to exactly one
//! page-table entry from allocation until that entry is swapped in or torn
//! down, and is only read or written under that address space's lock.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_alloc::PageBuf;
use kernel_memory_addresses::PAGE_SIZE;
use kernel_vmem::{MAX_SWAP_SLOTS, SwapSlot};
use spin::Mutex;

/// Swap device failures.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SwapIoError {
    #[error("{0} is beyond the end of the swap device")]
    OutOfRange(SwapSlot),
    #[error("swap device I/O failed on {0}")]
    Device(SwapSlot),
}

/// Block device holding the swap area.
pub trait SwapDevice: Send + Sync {
    /// Number of page-sized slots on the device.
    fn slot_count(&self) -> u32;

    /// Read the page stored in `slot`.
    ///
    /// # Errors
    /// Fails if the slot does not exist or the device reports an error.
    fn read_slot(&self, slot: SwapSlot, buf: &mut PageBuf) -> Result<(), SwapIoError>;

    /// Store a page in `slot`.
    ///
    /// # Errors
    /// Fails if the slot does not exist or the device reports an error.
    fn write_slot(&self, slot: SwapSlot, buf: &PageBuf) -> Result<(), SwapIoError>;
}

/// Swap device kept in memory.
pub struct RamSwapDevice {
    slots: Vec<Mutex<Box<PageBuf>>>,
    writes: AtomicUsize,
    reads: AtomicUsize,
}

impl RamSwapDevice {
    #[must_use]
    pub fn new(slots: u32) -> Self {
        Self {
            slots: (0..slots)
                .map(|_| Mutex::new(Box::new([0; PAGE_SIZE as usize])))
                .collect(),
            writes: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        }
    }

    /// Device of `bytes` bytes, rounded down to whole slots.
    #[must_use]
    pub fn with_size(bytes: u64) -> Self {
        Self::new(u32::try_from(bytes / u64::from(PAGE_SIZE)).unwrap_or(u32::MAX))
    }

    /// Pages written so far.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Pages read so far.
    #[must_use]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    fn slot(&self, slot: SwapSlot) -> Result<&Mutex<Box<PageBuf>>, SwapIoError> {
        self.slots
            .get(slot.index() as usize)
            .ok_or(SwapIoError::OutOfRange(slot))
    }
}

impl SwapDevice for RamSwapDevice {
    fn slot_count(&self) -> u32 {
        u32::try_from(self.slots.len()).unwrap_or(u32::MAX)
    }

    fn read_slot(&self, slot: SwapSlot, buf: &mut PageBuf) -> Result<(), SwapIoError> {
        buf.copy_from_slice(&**self.slot(slot)?.lock());
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_slot(&self, slot: SwapSlot, buf: &PageBuf) -> Result<(), SwapIoError> {
        self.slot(slot)?.lock().copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct SlotBitmap {
    words: Vec<u64>,
    capacity: u32,
    used: u32,
}

impl SlotBitmap {
    fn new(capacity: u32) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64) as usize],
            capacity,
            used: 0,
        }
    }

    fn alloc(&mut self) -> Option<SwapSlot> {
        if self.used == self.capacity {
            return None;
        }
        for (w, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones();
            #[allow(clippy::cast_possible_truncation)]
            let index = w as u32 * 64 + bit;
            if index >= self.capacity {
                return None;
            }
            *word |= 1 << bit;
            self.used += 1;
            return Some(SwapSlot::new(index));
        }
        None
    }

    fn is_set(&self, slot: SwapSlot) -> bool {
        let i = slot.index();
        i < self.capacity && self.words[(i / 64) as usize] & (1 << (i % 64)) != 0
    }

    fn clear(&mut self, slot: SwapSlot) -> bool {
        if !self.is_set(slot) {
            return false;
        }
        let i = slot.index();
        self.words[(i / 64) as usize] &= !(1 << (i % 64));
        self.used -= 1;
        true
    }
}

/// The swap area: a device plus its slot bitmap.
pub struct SwapStore {
    device: Arc<dyn SwapDevice>,
    bitmap: Mutex<SlotBitmap>,
}

impl SwapStore {
    /// Take over `device`. Slots a page-table entry cannot address are left
    /// unused.
    #[must_use]
    pub fn new(device: Arc<dyn SwapDevice>) -> Self {
        let capacity = device.slot_count().min(MAX_SWAP_SLOTS);
        log::info!(
            "swap: {capacity} slots ({} KiB)",
            u64::from(capacity) * u64::from(PAGE_SIZE) / 1024
        );
        Self {
            device,
            bitmap: Mutex::new(SlotBitmap::new(capacity)),
        }
    }

    /// Number of usable slots.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.bitmap.lock().capacity
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn slots_in_use(&self) -> u32 {
        self.bitmap.lock().used
    }

    /// Number of unoccupied slots.
    #[must_use]
    pub fn slots_free(&self) -> u32 {
        let bitmap = self.bitmap.lock();
        bitmap.capacity - bitmap.used
    }

    #[must_use]
    pub fn is_in_use(&self, slot: SwapSlot) -> bool {
        self.bitmap.lock().is_set(slot)
    }

    /// Claim the lowest free slot; `None` when swap is full.
    pub fn alloc_slot(&self) -> Option<SwapSlot> {
        self.bitmap.lock().alloc()
    }

    /// Release `slot`.
    ///
    /// # Panics
    /// Panics if the slot is not in use.
    pub fn free_slot(&self, slot: SwapSlot) {
        assert!(
            self.bitmap.lock().clear(slot),
            "swap: freeing {slot}, which is not in use"
        );
    }

    /// Write a page to an allocated slot.
    ///
    /// # Errors
    /// Propagates device failures.
    pub fn write(&self, slot: SwapSlot, buf: &PageBuf) -> Result<(), SwapIoError> {
        debug_assert!(self.is_in_use(slot));
        self.device.write_slot(slot, buf)
    }

    /// Read a page from an allocated slot.
    ///
    /// # Errors
    /// Propagates device failures.
    pub fn read(&self, slot: SwapSlot, buf: &mut PageBuf) -> Result<(), SwapIoError> {
        debug_assert!(self.is_in_use(slot));
        self.device.read_slot(slot, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_handed_out_lowest_first() {
        let swap = SwapStore::new(Arc::new(RamSwapDevice::new(70)));
        let slots: Vec<_> = (0..70).map(|_| swap.alloc_slot().unwrap()).collect();
        assert_eq!(slots[65], SwapSlot::new(65));
        assert_eq!(swap.alloc_slot(), None);
        assert_eq!(swap.slots_in_use(), 70);

        swap.free_slot(SwapSlot::new(3));
        swap.free_slot(SwapSlot::new(66));
        assert_eq!(swap.alloc_slot(), Some(SwapSlot::new(3)));
        assert_eq!(swap.alloc_slot(), Some(SwapSlot::new(66)));
        assert_eq!(swap.slots_free(), 0);
    }

    #[test]
    fn pages_survive_the_device() {
        let swap = SwapStore::new(Arc::new(RamSwapDevice::new(2)));
        let slot = swap.alloc_slot().unwrap();
        let mut page = [0u8; PAGE_SIZE as usize];
        page[17] = 0x5a;
        swap.write(slot, &page).unwrap();

        let mut back = [0u8; PAGE_SIZE as usize];
        swap.read(slot, &mut back).unwrap();
        assert_eq!(back[17], 0x5a);
    }

    #[test]
    #[should_panic(expected = "not in use")]
    fn double_free_panics() {
        let swap = SwapStore::new(Arc::new(RamSwapDevice::new(1)));
        let slot = swap.alloc_slot().unwrap();
        swap.free_slot(slot);
        swap.free_slot(slot);
    }

    #[test]
    fn out_of_range_slots_are_reported() {
        let dev = RamSwapDevice::with_size(2 * u64::from(PAGE_SIZE) + 5);
        assert_eq!(dev.slot_count(), 2);
        let mut page = [0u8; PAGE_SIZE as usize];
        assert_eq!(
            dev.read_slot(SwapSlot::new(2), &mut page),
            Err(SwapIoError::OutOfRange(SwapSlot::new(2)))
        );
    }
}

#![allow(dead_code)]

use kernel_alloc::{PhysMemory, RamImage};
use kernel_info::boot::BootMemory;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalPage, VirtualAddress};
use kernel_vm::{RamSwapDevice, Vm, VmConfig};
use kernel_vmem::{AddressSpace, Backing, FaultType, PageState, RegionPerms, SoftTlb, TlbEntry};
use std::sync::Arc;

/// Base of the zero-filled data region set up by [`Machine::data_space`].
pub const DATA_BASE: u32 = 0x1000_0000;

/// A VM on simulated hardware, with handles to inspect it.
pub struct Machine {
    pub vm: Vm,
    pub ram: Arc<RamImage>,
    pub swap: Arc<RamSwapDevice>,
    pub tlb: Arc<SoftTlb>,
}

impl Machine {
    pub fn new(frames: u32, reserved: u32, slots: u32) -> Self {
        let ram = Arc::new(RamImage::new(frames));
        let swap = Arc::new(RamSwapDevice::new(slots));
        let tlb = Arc::new(SoftTlb::new());
        let config = VmConfig::new(
            BootMemory::from_frames(frames, reserved).unwrap(),
            ram.clone(),
            swap.clone(),
            tlb.clone(),
        );
        Self {
            vm: Vm::bootstrap(config),
            ram,
            swap,
            tlb,
        }
    }

    /// An address space with a zero-filled RW region of `pages` pages at
    /// [`DATA_BASE`] and a stack.
    pub fn data_space(&self, pages: u32) -> Arc<AddressSpace> {
        let space = self.vm.create_space();
        {
            let mut state = space.lock();
            state
                .regions
                .define_region(
                    VirtualAddress::new(DATA_BASE),
                    pages * PAGE_SIZE,
                    RegionPerms::RW,
                    Backing::Zero,
                )
                .unwrap();
            state.regions.define_stack().unwrap();
        }
        space
    }

    /// Store `value` at `va` the way a user thread would: fault until the
    /// page is resident and dirty, then write while the mapping cannot move.
    pub fn store(&self, space: &Arc<AddressSpace>, va: VirtualAddress, value: u32) {
        loop {
            self.vm.handle_fault(space, FaultType::Write, va).unwrap();
            let state = space.lock();
            if let PageState::Resident { frame, dirty: true } = state.page_table.get(va.page()) {
                self.ram.write(frame.base() + va.as_u32() % PAGE_SIZE, &value.to_le_bytes());
                return;
            }
        }
    }

    /// Load the word at `va`, faulting it in as needed.
    pub fn load(&self, space: &Arc<AddressSpace>, va: VirtualAddress) -> u32 {
        loop {
            self.vm.handle_fault(space, FaultType::Read, va).unwrap();
            let state = space.lock();
            if let PageState::Resident { frame, .. } = state.page_table.get(va.page()) {
                let mut word = [0u8; 4];
                self.ram.read(frame.base() + va.as_u32() % PAGE_SIZE, &mut word);
                return u32::from_le_bytes(word);
            }
        }
    }

    pub fn entry(&self, space: &AddressSpace, va: VirtualAddress) -> PageState {
        space.lock().page_table.get(va.page())
    }

    pub fn tlb_entry(&self, space: &AddressSpace, va: VirtualAddress) -> Option<TlbEntry> {
        self.tlb.lookup(space.id(), va.page())
    }

    pub fn frame_bytes(&self, frame: PhysicalPage) -> Box<[u8; PAGE_SIZE as usize]> {
        let mut buf = Box::new([0u8; PAGE_SIZE as usize]);
        self.ram.read_frame(frame, &mut buf);
        buf
    }
}

/// Address of byte `offset` in page `n` of the data region.
pub fn data(n: u32, offset: u32) -> VirtualAddress {
    VirtualAddress::new(DATA_BASE + n * PAGE_SIZE + offset)
}

//! # Bootstrap Configuration

use alloc::sync::Arc;
use kernel_alloc::PhysMemory;
use kernel_info::boot::BootMemory;
use kernel_info::memory::DEFAULT_STACK_GROWTH_MARGIN;
use kernel_vmem::Tlb;

use crate::swap::SwapDevice;

/// Everything [`Vm::bootstrap`](crate::Vm::bootstrap) needs to know about the
/// machine.
#[derive(Clone)]
pub struct VmConfig {
    /// Size of RAM and the frames taken by the kernel image.
    pub boot: BootMemory,
    /// Access to frame contents.
    pub memory: Arc<dyn PhysMemory>,
    /// Backing device of the swap area.
    pub swap: Arc<dyn SwapDevice>,
    pub tlb: Arc<dyn Tlb>,
    /// How far below its bottom a fault may grow the stack, in bytes.
    pub stack_growth_margin: u32,
}

impl VmConfig {
    #[must_use]
    pub fn new(
        boot: BootMemory,
        memory: Arc<dyn PhysMemory>,
        swap: Arc<dyn SwapDevice>,
        tlb: Arc<dyn Tlb>,
    ) -> Self {
        Self {
            boot,
            memory,
            swap,
            tlb,
            stack_growth_margin: DEFAULT_STACK_GROWTH_MARGIN,
        }
    }

    #[must_use]
    pub fn with_stack_growth_margin(mut self, bytes: u32) -> Self {
        self.stack_growth_margin = bytes;
        self
    }
}

impl core::fmt::Debug for VmConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmConfig")
            .field("boot", &self.boot)
            .field("swap_slots", &self.swap.slot_count())
            .field("stack_growth_margin", &self.stack_growth_margin)
            .finish_non_exhaustive()
    }
}

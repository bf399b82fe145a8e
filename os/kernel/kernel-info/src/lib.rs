//! # Kernel Memory Layout and Boot Memory Description
//!
//! This crate defines the memory layout constants and the boot-time memory
//! description shared by the virtual-memory crates. It is the single source of
//! truth for where user space ends, where the direct-mapped kernel segment
//! begins, and how the user stack may grow.
//!
//! ## Architecture
//!
//! ### Memory Layout ([`memory`])
//! Compile-time constants describing the virtual address space:
//! * **User Space**: `[0, USERSPACE_END)`, translated through the TLB and the
//!   per-process page table.
//! * **Kernel Segment**: `[KSEG0_BASE, KSEG0_BASE + KSEG0_SIZE)`, a direct
//!   mapping of physical memory that never goes through the TLB.
//! * **Stack Bounds**: initial stack size, maximum stack size and the default
//!   growth margin.
//!
//! ### Boot Memory ([`boot`])
//! The [`BootMemory`](boot::BootMemory) value tells the virtual-memory bootstrap
//! how much RAM exists and which low frames the kernel image already occupies.
//!
//! ## Virtual Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  unmapped guard page            │
//! 0x0000_1000 ├─────────────────────────────────┤
//!             │  code / data segments, heap     │
//!             │            ...                  │
//!             │  (stack grows down)             │
//! 0x8000_0000 ├─────────────────────────────────┤ USER_STACK_TOP = USERSPACE_END
//!             │  kseg0: direct-mapped RAM       │ KSEG0_BASE
//! 0xa000_0000 ├─────────────────────────────────┤
//!             │  kseg1 / kseg2 (not managed)    │
//! 0xffff_ffff └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;

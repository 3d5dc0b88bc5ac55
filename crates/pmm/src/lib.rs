#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Memory Manager (PMM)
//!
//! The Polaris Memory Manager (PMM) is the physical-memory half of the Polaris kernel
//! core. It provides:
//!
//! - A pool of fixed-size page frames carved out of the boot memory map.
//! - A recency ring over every frame that backs a user page.
//! - An allocator that, once the pool is empty, evicts the least recently used page to
//!   swap with a second-chance clock and reuses its frame.
//! - Software page tables and emulated physical memory for testing in non-kernel
//!   environments, and the x86_64 hardware encoding of page-table entries.

extern crate alloc;

mod address;
mod address_space;
mod allocator;
pub mod arch;
mod frame;
mod frame_pool;
mod numbers;
mod page_table;
mod recency;
mod swap;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::{AddressSpace, AddressSpaceRef, SoftwarePageTables};
pub use allocator::{AllocError, FrameAllocator, PageFill};
pub use frame::{Frame, FrameFlag, FrameFlags, PhysFrame};
pub use frame_pool::{BootMemoryRegion, FramePool, JUNK_BYTE};
pub use numbers::{FrameNumber, PageNumber};
pub use page_table::{PageEntry, PageFlags, PageTableAccess};
pub use recency::{RecencyEntry, RecencyRing};
#[cfg(any(test, feature = "software-emulation"))]
pub use swap::MemorySwap;
pub use swap::{SwapDevice, SwapError, SwapSlot, SwapSpace};

pub use arch::PAGE_SIZE;

//! Architecture-specific pieces of memory management.
//!
//! Frame geometry is fixed across targets (4 KiB frames, 48-bit addresses). The
//! x86_64 module knows how page-table entries are encoded for the MMU; the software
//! module provides emulated physical memory so the allocator can run on a host.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::EmulatedMemory;

/// Size of a page frame in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Maximum number of bits in a physical address.
pub const MAX_PHYSICAL_BITS: usize = 48;

/// Maximum number of bits in a virtual address with 4-level paging.
pub const MAX_VIRTUAL_BITS: usize = 48;

/// Validates a physical address against the maximum physical address width.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= (1usize << MAX_PHYSICAL_BITS) - 1
}

/// Validates that a virtual address is canonical (bits 48-63 sign-extend bit 47).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    let canonical = if (addr & (1 << (MAX_VIRTUAL_BITS - 1))) != 0 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr & 0x0000_FFFF_FFFF_FFFF
    };
    canonical == addr
}

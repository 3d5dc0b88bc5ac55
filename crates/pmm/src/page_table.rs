//! The page-table capability the allocator consumes.
//!
//! The allocator never walks page tables itself. Whoever owns the address spaces hands
//! it an implementation of [`PageTableAccess`], which answers translation queries,
//! exposes the accessed bit and records where an evicted page went.

use core::fmt;

use bitflags::bitflags;

use crate::{PhysicalAddress, VirtualAddress, swap::SwapSlot};

bitflags! {
    /// Architecture-neutral page-table entry flags.
    ///
    /// The bit positions match the x86_64 hardware layout so encoding an entry for the
    /// MMU is a straight copy of the low bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct PageFlags: u64 {
        /// The page is resident and the translation is valid.
        const PRESENT = 1 << 0;
        /// Writes are permitted.
        const WRITABLE = 1 << 1;
        /// User mode may access the page.
        const USER = 1 << 2;
        /// Set by the MMU when the page is read or written.
        const ACCESSED = 1 << 5;
        /// Set by the MMU when the page is written.
        const DIRTY = 1 << 6;
    }
}

impl PageFlags {
    /// Returns the protection bits only (the part that survives a trip through swap).
    pub const fn protection(self) -> Self {
        self.intersection(Self::WRITABLE.union(Self::USER))
    }
}

/// A leaf page-table entry as seen by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageEntry {
    /// The page is resident in `frame`.
    Present {
        frame: PhysicalAddress,
        flags: PageFlags,
    },
    /// The page was evicted; its contents live in swap `slot`. `flags` keeps the
    /// protection bits so the page comes back with the same permissions.
    Swapped { slot: SwapSlot, flags: PageFlags },
}

impl PageEntry {
    /// Returns the resident frame, if the page is present.
    pub fn frame(&self) -> Option<PhysicalAddress> {
        match *self {
            Self::Present { frame, .. } => Some(frame),
            Self::Swapped { .. } => None,
        }
    }

    /// Returns the swap slot, if the page was evicted.
    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match *self {
            Self::Swapped { slot, .. } => Some(slot),
            Self::Present { .. } => None,
        }
    }

    /// Returns the flags recorded in this entry.
    pub fn flags(&self) -> PageFlags {
        match *self {
            Self::Present { flags, .. } | Self::Swapped { flags, .. } => flags,
        }
    }

    /// Returns whether the present bit is set.
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present { .. })
    }
}

/// Access to the page tables of every address space the allocator serves.
///
/// All methods take `&self`; implementations synchronize internally. The allocator
/// calls them while holding the frame-pool lock, so they must not call back into the
/// allocator.
pub trait PageTableAccess {
    /// Identifies an address space (the owning process's page table).
    type Owner: Clone + PartialEq + fmt::Debug;

    /// Returns the frame backing `page`, if it is present.
    fn translate(&self, owner: &Self::Owner, page: VirtualAddress) -> Option<PhysicalAddress>;

    /// Reads and clears the accessed bit of `page`. Returns false for pages that are
    /// not present.
    fn test_and_clear_accessed(&self, owner: &Self::Owner, page: VirtualAddress) -> bool;

    /// Installs `entry` for `page`, replacing whatever was there.
    fn map(&self, owner: &Self::Owner, page: VirtualAddress, entry: PageEntry);

    /// Removes the entry for `page`, returning it.
    fn unmap(&self, owner: &Self::Owner, page: VirtualAddress) -> Option<PageEntry>;

    /// Clears the present bit of `page` and records that its contents are in `slot`.
    ///
    /// Returns false if `page` was not present.
    fn set_swapped(&self, owner: &Self::Owner, page: VirtualAddress, slot: SwapSlot) -> bool;

    /// Returns the entry for `page`, if any.
    fn entry(&self, owner: &Self::Owner, page: VirtualAddress) -> Option<PageEntry>;

    /// Returns the swap slot holding `page`, if it was evicted.
    fn swap_slot(&self, owner: &Self::Owner, page: VirtualAddress) -> Option<SwapSlot> {
        self.entry(owner, page).and_then(|entry| entry.swap_slot())
    }

    /// Records an access to a present page the way the MMU would: sets ACCESSED, and
    /// DIRTY as well when `write` is true. Returns false if `page` is not present.
    fn mark_accessed(&self, owner: &Self::Owner, page: VirtualAddress, write: bool) -> bool;
}

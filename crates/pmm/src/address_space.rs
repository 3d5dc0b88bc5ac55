//! Address space management.
//!
//! This module provides a software page table for user address spaces. Each
//! [`AddressSpace`] keeps its leaf entries in an ordered map keyed by page number;
//! [`SoftwarePageTables`] exposes every address space to the allocator through
//! [`PageTableAccess`], with the owner identified by an [`AddressSpaceRef`].

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::{
    PageFlags, PageNumber, PhysicalAddress, VirtualAddress,
    page_table::{PageEntry, PageTableAccess},
    swap::SwapSlot,
};

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

/// An address space is an architecture-independent representation of a virtual address space.
///
/// Each address space owns the leaf entries mapping its user pages to frames or swap
/// slots. Address spaces belong to user processes; the kernel's own mappings are not
/// managed here.
pub struct AddressSpace {
    id: usize,
    entries: Mutex<BTreeMap<PageNumber, PageEntry>>,
}

impl AddressSpace {
    /// Creates a new, empty address space.
    pub fn new() -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the identifier of this address space, unique for the life of the system.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Installs `entry` for `page`, returning the previous entry.
    pub fn map(&self, page: VirtualAddress, entry: PageEntry) -> Option<PageEntry> {
        self.entries.lock().insert(page.page_number(), entry)
    }

    /// Removes and returns the entry for `page`.
    pub fn unmap(&self, page: VirtualAddress) -> Option<PageEntry> {
        self.entries.lock().remove(&page.page_number())
    }

    /// Returns the entry for `page`.
    pub fn entry(&self, page: VirtualAddress) -> Option<PageEntry> {
        self.entries.lock().get(&page.page_number()).copied()
    }

    /// Returns the frame backing `page` if it is present.
    pub fn translate(&self, page: VirtualAddress) -> Option<PhysicalAddress> {
        self.entry(page).and_then(|entry| entry.frame())
    }

    /// Sets the accessed bit (and the dirty bit for writes) of a present page.
    pub fn touch(&self, page: VirtualAddress, write: bool) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&page.page_number()) {
            Some(PageEntry::Present { flags, .. }) => {
                flags.insert(PageFlags::ACCESSED);
                if write {
                    flags.insert(PageFlags::DIRTY);
                }
                true
            }
            _ => false,
        }
    }

    /// Reads and clears the accessed bit of a present page.
    pub fn test_and_clear_accessed(&self, page: VirtualAddress) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&page.page_number()) {
            Some(PageEntry::Present { flags, .. }) => {
                let accessed = flags.contains(PageFlags::ACCESSED);
                flags.remove(PageFlags::ACCESSED);
                accessed
            }
            _ => false,
        }
    }

    /// Replaces the present entry of `page` with a swapped entry pointing at `slot`.
    pub fn set_swapped(&self, page: VirtualAddress, slot: SwapSlot) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&page.page_number()) {
            Some(entry) if entry.is_present() => {
                let flags = entry.flags().protection();
                *entry = PageEntry::Swapped { slot, flags };
                true
            }
            _ => false,
        }
    }

    /// Returns a snapshot of every mapping, in address order.
    pub fn mappings(&self) -> Vec<(VirtualAddress, PageEntry)> {
        self.entries
            .lock()
            .iter()
            .map(|(page, entry)| (page.start(), *entry))
            .collect()
    }

    /// Returns the number of mapped pages, resident or swapped.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns whether nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared handle to an address space, compared by identity.
#[derive(Clone)]
pub struct AddressSpaceRef(Arc<AddressSpace>);

impl AddressSpaceRef {
    /// Creates a handle to a new, empty address space.
    pub fn new() -> Self {
        Self(Arc::new(AddressSpace::new()))
    }
}

impl Default for AddressSpaceRef {
    fn default() -> Self {
        Self::new()
    }
}

impl core::ops::Deref for AddressSpaceRef {
    type Target = AddressSpace;

    fn deref(&self) -> &AddressSpace {
        &self.0
    }
}

impl PartialEq for AddressSpaceRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for AddressSpaceRef {}

impl fmt::Debug for AddressSpaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AddressSpace#{}", self.0.id)
    }
}

/// Page tables kept in software, one [`AddressSpace`] per owner.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwarePageTables;

impl PageTableAccess for SoftwarePageTables {
    type Owner = AddressSpaceRef;

    fn translate(&self, owner: &AddressSpaceRef, page: VirtualAddress) -> Option<PhysicalAddress> {
        owner.translate(page)
    }

    fn test_and_clear_accessed(&self, owner: &AddressSpaceRef, page: VirtualAddress) -> bool {
        owner.test_and_clear_accessed(page)
    }

    fn map(&self, owner: &AddressSpaceRef, page: VirtualAddress, entry: PageEntry) {
        owner.map(page, entry);
    }

    fn unmap(&self, owner: &AddressSpaceRef, page: VirtualAddress) -> Option<PageEntry> {
        owner.unmap(page)
    }

    fn set_swapped(&self, owner: &AddressSpaceRef, page: VirtualAddress, slot: SwapSlot) -> bool {
        owner.set_swapped(page, slot)
    }

    fn entry(&self, owner: &AddressSpaceRef, page: VirtualAddress) -> Option<PageEntry> {
        owner.entry(page)
    }

    fn mark_accessed(&self, owner: &AddressSpaceRef, page: VirtualAddress, write: bool) -> bool {
        owner.touch(page, write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn present(frame: usize) -> PageEntry {
        PageEntry::Present {
            frame: PhysicalAddress::new(frame),
            flags: PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
        }
    }

    #[test]
    fn map_translate_unmap() {
        let space = AddressSpace::new();
        let page = VirtualAddress::new(0x4000_0000);
        assert_eq!(space.map(page, present(0x3000)), None);
        assert_eq!(space.translate(page), Some(PhysicalAddress::new(0x3000)));
        assert_eq!(space.translate(page + 0x10).map(|p| p.as_usize()), Some(0x3000));
        assert_eq!(space.unmap(page), Some(present(0x3000)));
        assert!(space.is_empty());
    }

    #[test]
    fn accessed_bit_round_trip() {
        let space = AddressSpace::new();
        let page = VirtualAddress::new(0x1000);
        space.map(page, present(0x2000));

        assert!(!space.test_and_clear_accessed(page));
        assert!(space.touch(page, true));
        let flags = space.entry(page).map(|e| e.flags()).unwrap_or_default();
        assert!(flags.contains(PageFlags::ACCESSED | PageFlags::DIRTY));
        assert!(space.test_and_clear_accessed(page));
        assert!(!space.test_and_clear_accessed(page));
    }

    #[test]
    fn set_swapped_keeps_protection_only() {
        let space = AddressSpace::new();
        let page = VirtualAddress::new(0x1000);
        space.map(page, present(0x2000));
        space.touch(page, true);

        assert!(space.set_swapped(page, SwapSlot::new(4)));
        assert_eq!(
            space.entry(page),
            Some(PageEntry::Swapped {
                slot: SwapSlot::new(4),
                flags: PageFlags::WRITABLE | PageFlags::USER,
            })
        );
        assert_eq!(space.translate(page), None);
        assert!(!space.set_swapped(page, SwapSlot::new(5)));
        assert!(!space.touch(page, false));
    }

    #[test]
    fn handles_compare_by_identity() {
        let a = AddressSpaceRef::new();
        let b = AddressSpaceRef::new();
        assert_eq!(a.clone(), a);
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
    }
}

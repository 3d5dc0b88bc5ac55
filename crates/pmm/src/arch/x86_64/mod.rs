//! x86_64 architecture-specific implementation.
//!
//! Converts [`PageEntry`] values to and from the 64-bit leaf entries the x86_64 MMU
//! walks. A present entry holds the frame address in bits 12-51 with the flag bits
//! below. A swapped entry has PRESENT clear, which makes the MMU fault on any access;
//! the swap slot plus one sits in the address bits so that an all-zero entry still
//! means "nothing mapped".

use ::x86_64::PhysAddr;
use ::x86_64::structures::paging::PageTableFlags;

use crate::{PageEntry, PageFlags, PhysicalAddress, SwapSlot};

/// Bits 12-51 of an entry hold the frame address.
const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

fn to_hardware(flags: PageFlags) -> PageTableFlags {
    let mut hw = PageTableFlags::empty();
    hw.set(PageTableFlags::PRESENT, flags.contains(PageFlags::PRESENT));
    hw.set(PageTableFlags::WRITABLE, flags.contains(PageFlags::WRITABLE));
    hw.set(PageTableFlags::USER_ACCESSIBLE, flags.contains(PageFlags::USER));
    hw.set(PageTableFlags::ACCESSED, flags.contains(PageFlags::ACCESSED));
    hw.set(PageTableFlags::DIRTY, flags.contains(PageFlags::DIRTY));
    hw
}

fn from_hardware(hw: PageTableFlags) -> PageFlags {
    let mut flags = PageFlags::empty();
    for (bit, flag) in [
        (PageTableFlags::PRESENT, PageFlags::PRESENT),
        (PageTableFlags::WRITABLE, PageFlags::WRITABLE),
        (PageTableFlags::USER_ACCESSIBLE, PageFlags::USER),
        (PageTableFlags::ACCESSED, PageFlags::ACCESSED),
        (PageTableFlags::DIRTY, PageFlags::DIRTY),
    ] {
        if hw.contains(bit) {
            flags.insert(flag);
        }
    }
    flags
}

/// Encodes `entry` as a hardware leaf entry.
pub fn encode(entry: PageEntry) -> u64 {
    match entry {
        PageEntry::Present { frame, flags } => {
            let addr = PhysAddr::new(frame.as_usize() as u64);
            debug_assert!(addr.as_u64() & 0xFFF == 0, "frame address must be page-aligned");
            let mut flags = flags;
            flags.insert(PageFlags::PRESENT);
            (addr.as_u64() & ADDRESS_MASK) | to_hardware(flags).bits()
        }
        PageEntry::Swapped { slot, flags } => {
            let marker = (slot.index() as u64 + 1) << 12;
            (marker & ADDRESS_MASK) | to_hardware(flags.protection()).bits()
        }
    }
}

/// Decodes a hardware leaf entry. Returns `None` for an empty entry.
pub fn decode(raw: u64) -> Option<PageEntry> {
    let hw = PageTableFlags::from_bits_truncate(raw);
    let flags = from_hardware(hw);
    let addr = raw & ADDRESS_MASK;

    if hw.contains(PageTableFlags::PRESENT) {
        Some(PageEntry::Present {
            frame: PhysicalAddress::new(PhysAddr::new(addr).as_u64() as usize),
            flags,
        })
    } else if addr != 0 {
        Some(PageEntry::Swapped {
            slot: SwapSlot::new(((addr >> 12) - 1) as u32),
            flags: flags.protection(),
        })
    } else {
        None
    }
}

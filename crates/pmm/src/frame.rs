use core::sync::atomic::{AtomicU64, Ordering};

use crate::{FrameNumber, PhysicalAddress, arch};

/// An owned physical page frame.
///
/// Handed out by the allocator for pinned uses (kernel stacks, page-table pages) and
/// given back to release it. The type is deliberately not `Clone`: holding a
/// `PhysFrame` means owning the frame.
#[derive(Debug, PartialEq, Eq)]
pub struct PhysFrame {
    start: PhysicalAddress,
}

impl PhysFrame {
    /// Returns the frame starting at `start`, or `None` if `start` is not frame aligned.
    pub fn from_start_address(start: PhysicalAddress) -> Option<Self> {
        start.is_aligned(arch::PAGE_SIZE).then_some(Self { start })
    }

    /// Returns the frame containing `addr`.
    pub fn containing_address(addr: PhysicalAddress) -> Self {
        Self {
            start: addr.align_down(arch::PAGE_SIZE),
        }
    }

    /// Returns the physical address of the first byte of the frame.
    pub fn start_address(&self) -> PhysicalAddress {
        self.start
    }

    /// Returns the frame number.
    pub fn number(&self) -> FrameNumber {
        self.start.frame_number()
    }
}

/// Holds metadata for a physical memory frame.
///
/// Modeled after Linux's `struct page`; the pool keeps one of these for every frame in
/// its managed range, including reserved holes.
#[derive(Default)]
pub struct Frame {
    /// Flags identifying the state of this frame.
    pub flags: FrameFlags,
}

impl Frame {
    /// Creates metadata for a frame that is reserved and never allocatable.
    pub const fn reserved() -> Self {
        Self {
            flags: FrameFlags::from_bits(FrameFlag::Reserved as u64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFlag {
    /// Frame is allocated.
    Allocated = 1 << 0,
    /// Frame is reserved and should not be allocated.
    Reserved = 1 << 1,
    /// Frame backs a user page and has a recency entry.
    Mapped = 1 << 2,
}

/// Atomic flags for a physical memory frame.
#[derive(Default)]
pub struct FrameFlags(AtomicU64);

impl FrameFlags {
    /// Creates a new `FrameFlags` instance with all flags cleared.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Creates a new `FrameFlags` instance with the given initial flags.
    pub const fn from_bits(initial: u64) -> Self {
        Self(AtomicU64::new(initial))
    }

    /// Sets the given flag atomically.
    pub fn atomic_set(&self, flag: FrameFlag) {
        self.0.fetch_or(flag as u64, Ordering::AcqRel);
    }

    /// Clears the given flag atomically.
    pub fn atomic_clear(&self, flag: FrameFlag) {
        self.0.fetch_and(!(flag as u64), Ordering::AcqRel);
    }

    /// Tests if the given flag is set, atomically.
    pub fn atomic_test(&self, flag: FrameFlag) -> bool {
        (self.0.load(Ordering::Acquire) & flag as u64) != 0
    }

    /// Tests the given flag and sets it atomically, returning the previous value.
    pub fn atomic_test_and_set(&self, flag: FrameFlag) -> bool {
        let mask = flag as u64;
        (self.0.fetch_or(mask, Ordering::AcqRel) & mask) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_clear_only_clears_the_given_flag() {
        let flags = FrameFlags::from_bits(FrameFlag::Allocated as u64 | FrameFlag::Mapped as u64);
        flags.atomic_clear(FrameFlag::Mapped);
        assert!(flags.atomic_test(FrameFlag::Allocated));
        assert!(!flags.atomic_test(FrameFlag::Mapped));
        assert!(!flags.atomic_test(FrameFlag::Reserved));
    }

    #[test]
    fn test_and_set_reports_previous_value() {
        let flags = FrameFlags::new();
        assert!(!flags.atomic_test_and_set(FrameFlag::Allocated));
        assert!(flags.atomic_test_and_set(FrameFlag::Allocated));
    }

    #[test]
    fn reserved_frame_metadata() {
        let frame = Frame::reserved();
        assert!(frame.flags.atomic_test(FrameFlag::Reserved));
        assert!(!frame.flags.atomic_test(FrameFlag::Allocated));
    }

    #[test]
    fn phys_frame_requires_alignment() {
        assert!(PhysFrame::from_start_address(PhysicalAddress::new(0x1001)).is_none());
        let frame = PhysFrame::from_start_address(PhysicalAddress::new(0x3000)).unwrap();
        assert_eq!(frame.number(), FrameNumber::new(3));
        assert_eq!(
            PhysFrame::containing_address(PhysicalAddress::new(0x3FFF)),
            frame
        );
    }
}

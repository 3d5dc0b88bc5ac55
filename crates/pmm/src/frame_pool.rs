//! The pool of free physical page frames.
//!
//! Free frames form an intrusive singly linked list: the first word of every free frame
//! holds the physical address of the next free frame. Popping and pushing are O(1) and
//! need no storage beyond the frames themselves. Per-frame metadata ([`Frame`]) sits in
//! a side table covering the managed range, so misuse (double release, release of a
//! reserved frame) is caught before it corrupts the list.

use alloc::vec::Vec;
use core::{fmt, ptr, slice};

use crate::{AddressTranslator, Frame, FrameFlag, PhysicalAddress, arch::PAGE_SIZE};

/// Byte written over every released frame, so stale reads of freed memory stand out.
pub const JUNK_BYTE: u8 = 0x01;

/// End-of-list marker stored in the link word of the last free frame.
const NIL: usize = usize::MAX;

/// Trait for boot memory regions provided by the bootloader.
///
/// This trait abstracts over different bootloader memory map formats, allowing the pool
/// to be constructed from any bootloader's memory map.
pub trait BootMemoryRegion {
    /// Returns the base physical address of this region.
    fn base(&self) -> PhysicalAddress;

    /// Returns the size of this region in bytes.
    fn size(&self) -> usize;

    /// Returns whether this region contains usable memory.
    ///
    /// Non-usable memory (reserved, ACPI, device memory, etc.) never enters the pool.
    fn is_usable(&self) -> bool;
}

/// A free list of page frames over one contiguous managed range.
pub struct FramePool {
    translator: AddressTranslator,
    base: PhysicalAddress,
    frames: Vec<Frame>,
    head: usize,
    free: usize,
    reserved: usize,
}

impl FramePool {
    /// Creates a pool managing `size` bytes starting at `base`, every frame free.
    ///
    /// `size` is rounded down to whole frames.
    ///
    /// # Panics
    ///
    /// Panics if `base` is not frame aligned.
    pub fn new(translator: AddressTranslator, base: PhysicalAddress, size: usize) -> Self {
        assert!(base.is_aligned(PAGE_SIZE), "pool base must be frame aligned");
        let count = size / PAGE_SIZE;
        let mut pool = Self::empty(translator, base, count);

        for index in (0..count).rev() {
            pool.push(index);
        }
        pool.reserved = 0;

        log::debug!(
            "frame pool initialized: {} frames at {} ({} free)",
            count,
            base,
            pool.free
        );
        pool
    }

    /// Creates a pool from the bootloader's memory map.
    ///
    /// The managed range spans from the lowest to the highest usable frame; frames in
    /// holes or in non-usable regions are marked reserved and are never allocated.
    pub fn from_boot_map<R: BootMemoryRegion>(translator: AddressTranslator, regions: &[R]) -> Self {
        let usable = || {
            regions
                .iter()
                .filter(|r| r.is_usable())
                .map(|r| {
                    let start = r.base().align_up(PAGE_SIZE);
                    let end = (r.base() + r.size()).align_down(PAGE_SIZE);
                    (start, end)
                })
                .filter(|(start, end)| start < end)
        };

        let Some(lowest) = usable().map(|(start, _)| start).min() else {
            log::debug!("frame pool initialized: no usable memory");
            return Self::empty(translator, PhysicalAddress::new(0), 0);
        };
        let highest = usable().map(|(_, end)| end).max().unwrap_or(lowest);

        let count = (highest - lowest) / PAGE_SIZE;
        let mut pool = Self::empty(translator, lowest, count);

        // Collect first so frames come off the list in ascending address order.
        let mut indices: Vec<usize> = usable()
            .flat_map(|(start, end)| {
                let first = (start - lowest) / PAGE_SIZE;
                first..first + (end - start) / PAGE_SIZE
            })
            .collect();
        indices.sort_unstable();
        indices.dedup();

        for &index in indices.iter().rev() {
            pool.push(index);
        }
        pool.reserved = count - pool.free;

        log::debug!(
            "frame pool initialized: {} frames at {} ({} free, {} reserved)",
            count,
            lowest,
            pool.free,
            pool.reserved
        );
        pool
    }

    fn empty(translator: AddressTranslator, base: PhysicalAddress, count: usize) -> Self {
        let mut frames = Vec::with_capacity(count);
        frames.resize_with(count, Frame::reserved);
        Self {
            translator,
            base,
            frames,
            head: NIL,
            free: 0,
            reserved: count,
        }
    }

    /// Pops a frame off the free list.
    ///
    /// The link word is overwritten with [`JUNK_BYTE`], so the whole frame reads as
    /// junk until the caller fills it.
    pub fn allocate(&mut self) -> Option<PhysicalAddress> {
        if self.head == NIL {
            return None;
        }

        let addr = PhysicalAddress::new(self.head);
        let index = self.index_of(addr);
        let link = self.translator.phys_to_ptr(addr) as *mut usize;
        // SAFETY: `addr` is a free frame in the managed range; its first word is the
        // link written by `push`.
        let next = unsafe { link.read() };
        debug_assert!(
            next == NIL || self.contains(PhysicalAddress::new(next)),
            "free list corrupted at {}",
            addr
        );
        // SAFETY: The link word is inside the frame.
        unsafe { ptr::write_bytes(link as *mut u8, JUNK_BYTE, size_of::<usize>()) };

        self.head = next;
        self.free -= 1;
        self.frames[index].flags.atomic_set(FrameFlag::Allocated);
        Some(addr)
    }

    /// Returns a frame to the free list after filling it with [`JUNK_BYTE`].
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not frame aligned, lies outside the managed range, is
    /// reserved, or is already free.
    pub fn release(&mut self, addr: PhysicalAddress) {
        assert!(
            addr.is_aligned(PAGE_SIZE),
            "release of misaligned frame {}",
            addr
        );
        assert!(
            self.contains(addr),
            "release of frame {} outside managed range",
            addr
        );
        let index = self.index_of(addr);
        let flags = &self.frames[index].flags;
        assert!(
            !flags.atomic_test(FrameFlag::Reserved),
            "release of reserved frame {}",
            addr
        );
        assert!(
            flags.atomic_test(FrameFlag::Allocated),
            "release of free frame {}",
            addr
        );
        flags.atomic_clear(FrameFlag::Allocated);
        flags.atomic_clear(FrameFlag::Mapped);

        self.fill(addr, JUNK_BYTE);
        self.push(index);
    }

    fn push(&mut self, index: usize) {
        let addr = self.address_of(index);
        self.frames[index].flags.atomic_clear(FrameFlag::Reserved);
        let link = self.translator.phys_to_ptr(addr) as *mut usize;
        // SAFETY: Frames are page aligned, so the link word is aligned and inside the
        // frame, which the pool owns while it is free.
        unsafe { link.write(self.head) };
        self.head = addr.as_usize();
        self.free += 1;
    }

    /// Returns whether `addr` lies inside the managed range.
    pub fn contains(&self, addr: PhysicalAddress) -> bool {
        addr >= self.base && (addr - self.base) / PAGE_SIZE < self.frames.len()
    }

    /// Returns the index of the frame containing `addr` within the managed range.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is outside the managed range.
    pub fn index_of(&self, addr: PhysicalAddress) -> usize {
        assert!(self.contains(addr), "frame {} outside managed range", addr);
        (addr - self.base) / PAGE_SIZE
    }

    /// Returns the start address of the frame at `index`.
    pub fn address_of(&self, index: usize) -> PhysicalAddress {
        self.base + index * PAGE_SIZE
    }

    /// Returns the metadata of the frame containing `addr`.
    pub fn frame(&self, addr: PhysicalAddress) -> &Frame {
        &self.frames[self.index_of(addr)]
    }

    /// Returns the contents of the frame at `addr`.
    pub fn bytes(&self, addr: PhysicalAddress) -> &[u8] {
        let index = self.index_of(addr);
        let ptr = self.translator.phys_to_ptr(self.address_of(index));
        // SAFETY: The frame is inside the managed range and the shared borrow of the
        // pool prevents concurrent mutation through `bytes_mut`.
        unsafe { slice::from_raw_parts(ptr, PAGE_SIZE) }
    }

    /// Returns the contents of the frame at `addr` mutably.
    pub fn bytes_mut(&mut self, addr: PhysicalAddress) -> &mut [u8] {
        let index = self.index_of(addr);
        let ptr = self.translator.phys_to_ptr(self.address_of(index));
        // SAFETY: As in `bytes`, with exclusivity from the mutable borrow.
        unsafe { slice::from_raw_parts_mut(ptr, PAGE_SIZE) }
    }

    /// Fills the frame at `addr` with `byte`.
    pub fn fill(&mut self, addr: PhysicalAddress, byte: u8) {
        self.bytes_mut(addr).fill(byte);
    }

    /// Returns the number of allocatable frames (the managed range minus reserved holes).
    pub fn total(&self) -> usize {
        self.frames.len() - self.reserved
    }

    /// Returns the number of frames on the free list.
    pub fn free(&self) -> usize {
        self.free
    }

    /// Returns the number of allocated frames.
    pub fn in_use(&self) -> usize {
        self.total() - self.free
    }

    /// Returns the number of frames in the managed range, reserved ones included.
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Returns the first address of the managed range.
    pub fn base(&self) -> PhysicalAddress {
        self.base
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("base", &self.base)
            .field("capacity", &self.frames.len())
            .field("free", &self.free)
            .field("reserved", &self.reserved)
            .finish()
    }
}

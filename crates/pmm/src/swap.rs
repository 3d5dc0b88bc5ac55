//! Swap slots and the backing-store interface.
//!
//! Evicted pages are written to a [`SwapDevice`] under a [`SwapSlot`]. The
//! [`SwapSpace`] wrapper tracks which slots hold live pages so a slot is never handed
//! to two evictions at once.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

#[cfg(any(test, feature = "software-emulation"))]
use alloc::boxed::Box;

use crate::arch::PAGE_SIZE;

/// Identifies one page-sized slot on the swap device.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SwapSlot(u32);

impl SwapSlot {
    /// Creates a slot identifier.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the slot index.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwapSlot({})", self.0)
    }
}

/// Errors reported by a swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SwapError {
    /// The device failed to transfer the page.
    #[error("swap device I/O error")]
    Io,
    /// The slot does not exist on the device or holds no page.
    #[error("invalid swap slot")]
    InvalidSlot,
}

/// Backing store for evicted pages.
///
/// Slot bookkeeping lives in [`SwapSpace`]; a device only moves page-sized buffers.
pub trait SwapDevice {
    /// Returns the number of page slots the device holds.
    fn slot_count(&self) -> usize;

    /// Writes one page of `contents` to `slot`.
    fn write_out(&mut self, contents: &[u8], slot: SwapSlot) -> Result<(), SwapError>;

    /// Reads the page stored in `slot` into `buf`.
    fn read_in(&mut self, slot: SwapSlot, buf: &mut [u8]) -> Result<(), SwapError>;
}

/// A swap device plus the bitmap of slots currently holding pages.
pub struct SwapSpace<S> {
    device: S,
    bitmap: Vec<u64>,
    used: usize,
}

impl<S: SwapDevice> SwapSpace<S> {
    /// Wraps `device`, with every slot free.
    pub fn new(device: S) -> Self {
        let words = device.slot_count().div_ceil(64);
        Self {
            device,
            bitmap: vec![0; words],
            used: 0,
        }
    }

    /// Claims a free slot, or returns `None` when the device is full.
    pub fn claim(&mut self) -> Option<SwapSlot> {
        let count = self.device.slot_count();
        for (word_index, word) in self.bitmap.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let index = word_index * 64 + bit;
            if index >= count {
                return None;
            }
            *word |= 1 << bit;
            self.used += 1;
            return Some(SwapSlot::new(index as u32));
        }
        None
    }

    /// Returns `slot` to the free set.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not currently claimed.
    pub fn release(&mut self, slot: SwapSlot) {
        let (word, bit) = (slot.index() / 64, slot.index() % 64);
        assert!(
            self.bitmap.get(word).is_some_and(|w| w & (1 << bit) != 0),
            "release of unclaimed swap slot {:?}",
            slot
        );
        self.bitmap[word] &= !(1 << bit);
        self.used -= 1;
    }

    /// Returns the number of claimed slots.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Returns the device.
    pub fn device(&self) -> &S {
        &self.device
    }

    /// Returns the device mutably.
    pub fn device_mut(&mut self) -> &mut S {
        &mut self.device
    }
}

/// A swap device kept in host memory.
///
/// Writes can be made to fail on demand so the eviction error path can be exercised.
#[cfg(any(test, feature = "software-emulation"))]
pub struct MemorySwap {
    slots: Vec<Option<Box<[u8]>>>,
    fail_writes: bool,
    writes: usize,
}

#[cfg(any(test, feature = "software-emulation"))]
impl MemorySwap {
    /// Creates a device with `slot_count` empty slots.
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: (0..slot_count).map(|_| None).collect(),
            fail_writes: false,
            writes: 0,
        }
    }

    /// Makes every subsequent write fail with [`SwapError::Io`] while `fail` is set.
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Returns the number of successful writes.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Returns the stored contents of `slot`.
    pub fn contents(&self, slot: SwapSlot) -> Option<&[u8]> {
        self.slots.get(slot.index())?.as_deref()
    }
}

#[cfg(any(test, feature = "software-emulation"))]
impl SwapDevice for MemorySwap {
    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn write_out(&mut self, contents: &[u8], slot: SwapSlot) -> Result<(), SwapError> {
        if self.fail_writes {
            return Err(SwapError::Io);
        }
        let target = self
            .slots
            .get_mut(slot.index())
            .ok_or(SwapError::InvalidSlot)?;
        *target = Some(Box::from(&contents[..PAGE_SIZE]));
        self.writes += 1;
        Ok(())
    }

    fn read_in(&mut self, slot: SwapSlot, buf: &mut [u8]) -> Result<(), SwapError> {
        let page = self
            .slots
            .get(slot.index())
            .and_then(|s| s.as_deref())
            .ok_or(SwapError::InvalidSlot)?;
        buf[..PAGE_SIZE].copy_from_slice(page);
        Ok(())
    }
}

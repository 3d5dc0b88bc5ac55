//! Software emulation of physical memory.
//!
//! Tests and host-side tooling have no direct map of real RAM, so the frame pool
//! reaches frame contents through a page-aligned host buffer instead. Physical
//! address `n` is byte `n` of the buffer.

use alloc::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use core::ptr::NonNull;

use super::PAGE_SIZE;

/// A page-aligned block of host memory standing in for physical RAM.
pub struct EmulatedMemory {
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: The buffer is exclusively owned by this value and only reached through raw
// pointers handed to the frame pool, which serializes access behind its own lock.
unsafe impl Send for EmulatedMemory {}
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// Creates an emulated memory region of `size` bytes, rounded up to whole frames.
    pub fn new(size: usize) -> Self {
        let size = size.max(PAGE_SIZE).next_multiple_of(PAGE_SIZE);
        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .expect("emulated memory size overflows a layout");

        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).unwrap_or_else(|| handle_alloc_error(layout));

        Self { base, layout }
    }

    /// Returns a host pointer to the byte at physical address `phys`.
    ///
    /// # Panics
    ///
    /// Panics if `phys` lies outside the emulated region.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.layout.size(), "physical address out of bounds");
        // SAFETY: `phys` is within the allocation, checked above.
        unsafe { self.base.as_ptr().add(phys) }
    }

    /// Returns the size of the emulated region in bytes.
    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: `base` was allocated with exactly this layout in `new`.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_size_up_to_whole_frames() {
        let memory = EmulatedMemory::new(PAGE_SIZE + 1);
        assert_eq!(memory.size(), 2 * PAGE_SIZE);
    }

    #[test]
    fn starts_zeroed_and_page_aligned() {
        let memory = EmulatedMemory::new(PAGE_SIZE);
        let ptr = memory.translate(0);
        assert_eq!(ptr as usize % PAGE_SIZE, 0);
        // SAFETY: The whole frame is inside the emulated region.
        let bytes = unsafe { core::slice::from_raw_parts(ptr, PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "physical address out of bounds")]
    fn rejects_addresses_past_the_end() {
        let memory = EmulatedMemory::new(PAGE_SIZE);
        memory.translate(PAGE_SIZE);
    }
}

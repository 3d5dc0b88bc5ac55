//! The frame allocator.
//!
//! [`FrameAllocator`] owns the frame pool, the recency ring and the swap space behind a
//! single lock. Allocation pops the free list; when the list is empty the allocator runs
//! a second-chance clock over the ring, writes the chosen page to swap, marks it
//! swapped in its owner's page table and hands the reclaimed frame to the caller. The
//! whole evict-reclaim-allocate sequence runs under that lock.
//!
//! Frames come in two kinds. Pinned frames ([`FrameAllocator::allocate_frame`]) belong
//! to the kernel and are never evicted. Mapped frames ([`FrameAllocator::map_page`])
//! back a user page, carry a recency entry, and may be evicted at any allocation.

use core::fmt;

use spin::Mutex;

use crate::{
    FrameFlag, FramePool, JUNK_BYTE, PageFlags, PhysFrame, PhysicalAddress, VirtualAddress,
    arch::PAGE_SIZE,
    page_table::{PageEntry, PageTableAccess},
    recency::RecencyRing,
    swap::{SwapDevice, SwapError, SwapSpace},
};

/// Errors that can occur during frame allocation and page mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// The free list is empty and no mapped frame can be evicted.
    #[error("out of physical memory")]
    OutOfMemory,
    /// Eviction needed a swap slot and none was free.
    #[error("swap space is full")]
    SwapFull,
    /// Moving a page to or from swap failed.
    #[error("swap transfer failed: {0}")]
    SwapFailed(SwapError),
    /// The page has no entry in the owner's page table.
    #[error("page is not mapped")]
    NotMapped,
    /// The page already has an entry in the owner's page table.
    #[error("page is already mapped")]
    AlreadyMapped,
}

/// Initial contents of a newly mapped page.
#[derive(Debug, Clone, Copy)]
pub enum PageFill<'a> {
    /// Fill the page with zeroes.
    Zero,
    /// Copy these bytes to the start of the page and zero the rest. Bytes past the end
    /// of the page are ignored.
    Bytes(&'a [u8]),
}

struct AllocatorState<O, S> {
    pool: FramePool,
    ring: RecencyRing<O>,
    swap: SwapSpace<S>,
    evictions: u64,
}

/// Physical frame allocator with recency-driven eviction to swap.
pub struct FrameAllocator<P: PageTableAccess, S> {
    page_tables: P,
    state: Mutex<AllocatorState<P::Owner, S>>,
}

impl<P: PageTableAccess, S: SwapDevice> FrameAllocator<P, S> {
    /// Creates an allocator over `pool`, evicting through `page_tables` into `swap`.
    pub fn new(pool: FramePool, page_tables: P, swap: S) -> Self {
        let ring = RecencyRing::new(pool.capacity());
        Self {
            page_tables,
            state: Mutex::new(AllocatorState {
                pool,
                ring,
                swap: SwapSpace::new(swap),
                evictions: 0,
            }),
        }
    }

    /// Returns the page-table capability this allocator evicts through.
    pub fn page_tables(&self) -> &P {
        &self.page_tables
    }

    /// Allocates a pinned frame, evicting a mapped page if the pool is empty.
    ///
    /// The frame's contents are unspecified (junk from its last release).
    pub fn allocate_frame(&self) -> Result<PhysFrame, AllocError> {
        let mut state = self.state.lock();
        let addr = state.take_frame(&self.page_tables)?;
        log::trace!("allocated pinned frame {}", addr);
        Ok(PhysFrame::containing_address(addr))
    }

    /// Releases a pinned frame back to the pool.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`FrameAllocator::release_address`].
    pub fn release_frame(&self, frame: PhysFrame) {
        self.release_address(frame.start_address());
    }

    /// Releases the frame at `addr` back to the pool.
    ///
    /// A frame that still backs a user page is unmapped from its owner first.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not frame aligned, lies outside the managed range, is
    /// reserved, or is already free.
    pub fn release_address(&self, addr: PhysicalAddress) {
        let mut state = self.state.lock();
        if addr.is_aligned(PAGE_SIZE) && state.pool.contains(addr) {
            let index = state.pool.index_of(addr);
            if state.ring.contains(index) {
                let entry = state.ring.remove(index);
                self.page_tables.unmap(entry.owner(), entry.page());
                log::trace!("released mapped frame {} ({})", addr, entry.page());
            }
        }
        state.pool.release(addr);
    }

    /// Maps a fresh frame at `page` in `owner`'s address space and gives it a recency
    /// entry. Returns the frame.
    ///
    /// Only the protection bits of `flags` are honored; the entry is always present.
    ///
    /// # Panics
    ///
    /// Panics if `page` is not page aligned.
    pub fn map_page(
        &self,
        owner: &P::Owner,
        page: VirtualAddress,
        flags: PageFlags,
        fill: PageFill<'_>,
    ) -> Result<PhysicalAddress, AllocError> {
        assert!(page.is_aligned(PAGE_SIZE), "map of unaligned page {}", page);
        let mut state = self.state.lock();
        if self.page_tables.entry(owner, page).is_some() {
            return Err(AllocError::AlreadyMapped);
        }

        let frame = state.take_frame(&self.page_tables)?;
        let bytes = state.pool.bytes_mut(frame);
        match fill {
            PageFill::Zero => bytes.fill(0),
            PageFill::Bytes(data) => {
                let len = data.len().min(PAGE_SIZE);
                bytes[..len].copy_from_slice(&data[..len]);
                bytes[len..].fill(0);
            }
        }
        state.install(&self.page_tables, owner, page, frame, flags);
        Ok(frame)
    }

    /// Removes the mapping of `page`, releasing its frame or its swap slot.
    pub fn unmap_page(&self, owner: &P::Owner, page: VirtualAddress) -> Result<(), AllocError> {
        let mut state = self.state.lock();
        match self.page_tables.unmap(owner, page) {
            None => Err(AllocError::NotMapped),
            Some(PageEntry::Present { frame, .. }) => {
                let index = state.pool.index_of(frame);
                let entry = state.ring.remove(index);
                assert!(
                    entry.owner() == owner && entry.page() == page,
                    "frame {} is recorded for {:?} {} but was mapped at {:?} {}",
                    frame,
                    entry.owner(),
                    entry.page(),
                    owner,
                    page
                );
                state.pool.release(frame);
                Ok(())
            }
            Some(PageEntry::Swapped { slot, .. }) => {
                state.swap.release(slot);
                Ok(())
            }
        }
    }

    /// Makes the page containing `addr` resident, reading it back from swap if it was
    /// evicted. Returns the frame backing it.
    pub fn fault_in(&self, owner: &P::Owner, addr: VirtualAddress) -> Result<PhysicalAddress, AllocError> {
        let mut state = self.state.lock();
        state.fault_in(&self.page_tables, owner, addr.align_down(PAGE_SIZE))
    }

    /// Copies the page containing `addr` into `buf` without changing its residency.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is not exactly one page long.
    pub fn read_page(&self, owner: &P::Owner, addr: VirtualAddress, buf: &mut [u8]) -> Result<(), AllocError> {
        assert_eq!(buf.len(), PAGE_SIZE, "page buffer must be one page long");
        let mut state = self.state.lock();
        match self.page_tables.entry(owner, addr.align_down(PAGE_SIZE)) {
            None => Err(AllocError::NotMapped),
            Some(PageEntry::Present { frame, .. }) => {
                buf.copy_from_slice(state.pool.bytes(frame));
                Ok(())
            }
            Some(PageEntry::Swapped { slot, .. }) => state
                .swap
                .device_mut()
                .read_in(slot, buf)
                .map_err(AllocError::SwapFailed),
        }
    }

    /// Runs `f` over the contents of the page containing `addr`, the way a user access
    /// would: the page is faulted in if needed and its accessed bit (and dirty bit, for
    /// writes) is set.
    ///
    /// `f` runs under the allocator lock and must not call back into the allocator.
    pub fn access_page<R>(
        &self,
        owner: &P::Owner,
        addr: VirtualAddress,
        write: bool,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, AllocError> {
        let page = addr.align_down(PAGE_SIZE);
        let mut state = self.state.lock();
        let frame = state.fault_in(&self.page_tables, owner, page)?;
        self.page_tables.mark_accessed(owner, page, write);
        Ok(f(state.pool.bytes_mut(frame)))
    }

    /// Runs `f` over the contents of a pinned frame.
    pub fn with_frame<R>(&self, frame: &PhysFrame, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut state = self.state.lock();
        f(state.pool.bytes_mut(frame.start_address()))
    }

    /// Returns the number of frames on the free list.
    pub fn free_frames(&self) -> usize {
        self.state.lock().pool.free()
    }

    /// Returns the number of allocated frames, pinned and mapped.
    pub fn in_use_frames(&self) -> usize {
        self.state.lock().pool.in_use()
    }

    /// Returns the number of allocatable frames.
    pub fn total_frames(&self) -> usize {
        self.state.lock().pool.total()
    }

    /// Returns the number of frames backing user pages (the recency ring length).
    pub fn mapped_frames(&self) -> usize {
        self.state.lock().ring.len()
    }

    /// Returns the number of pages currently held in swap.
    pub fn swapped_pages(&self) -> usize {
        self.state.lock().swap.used()
    }

    /// Returns the number of evictions performed so far.
    pub fn evictions(&self) -> u64 {
        self.state.lock().evictions
    }

    /// Checks the allocator's bookkeeping.
    ///
    /// # Panics
    ///
    /// Panics if free and in-use frames do not add up to the total, if the recency ring
    /// and the mapped frames disagree, or if a recency entry does not match its owner's
    /// page table.
    pub fn check_invariants(&self) {
        let state = self.state.lock();
        let pool = &state.pool;
        assert_eq!(
            pool.free() + pool.in_use(),
            pool.total(),
            "frame accounting out of balance"
        );

        let mut mapped = 0;
        for index in 0..pool.capacity() {
            if pool.frame(pool.address_of(index)).flags.atomic_test(FrameFlag::Mapped) {
                mapped += 1;
                assert!(
                    state.ring.contains(index),
                    "mapped frame {} has no recency entry",
                    pool.address_of(index)
                );
            }
        }
        assert_eq!(
            mapped,
            state.ring.len(),
            "recency ring length differs from mapped frames"
        );

        for (index, entry) in state.ring.iter() {
            assert_eq!(
                self.page_tables.translate(entry.owner(), entry.page()),
                Some(pool.address_of(index)),
                "recency entry for {:?} {} does not match its page table",
                entry.owner(),
                entry.page()
            );
        }
    }
}

impl<P: PageTableAccess, S> fmt::Debug for FrameAllocator<P, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FrameAllocator")
            .field("pool", &state.pool)
            .field("mapped", &state.ring.len())
            .field("evictions", &state.evictions)
            .finish()
    }
}

impl<O: Clone + PartialEq + fmt::Debug, S: SwapDevice> AllocatorState<O, S> {
    fn take_frame<P: PageTableAccess<Owner = O>>(
        &mut self,
        page_tables: &P,
    ) -> Result<PhysicalAddress, AllocError> {
        match self.pool.allocate() {
            Some(addr) => Ok(addr),
            None => self.evict(page_tables),
        }
    }

    /// Second-chance clock: pages whose accessed bit is set lose the bit and move to the
    /// most-recent position; the first page found with the bit clear is evicted. After
    /// one full lap every bit is clear, so at most `len + 1` entries are inspected and
    /// the scan falls back to the entry it started from.
    fn evict<P: PageTableAccess<Owner = O>>(
        &mut self,
        page_tables: &P,
    ) -> Result<PhysicalAddress, AllocError> {
        let Some(start) = self.ring.hand() else {
            log::trace!("allocation failed: no free frames and nothing to evict");
            return Err(AllocError::OutOfMemory);
        };

        let mut victim = None;
        for _ in 0..=self.ring.len() {
            let Some((index, entry)) = self.ring.hand_entry() else {
                break;
            };
            if page_tables.test_and_clear_accessed(entry.owner(), entry.page()) {
                log::trace!("evict: {} recently used, second chance", entry.page());
                self.ring.advance();
            } else {
                victim = Some(index);
                break;
            }
        }
        let index = victim.or(self.ring.hand()).unwrap_or(start);

        let frame = self.pool.address_of(index);
        let Some((owner, page)) = self
            .ring
            .entry(index)
            .map(|entry| (entry.owner().clone(), entry.page()))
        else {
            panic!("eviction victim {} has no recency entry", frame);
        };
        assert_eq!(
            page_tables.translate(&owner, page),
            Some(frame),
            "recency entry for {:?} {} does not match its page table",
            owner,
            page
        );

        let slot = self.swap.claim().ok_or(AllocError::SwapFull)?;
        if let Err(err) = self.swap.device_mut().write_out(self.pool.bytes(frame), slot) {
            self.swap.release(slot);
            log::warn!("writing {} of {:?} to {:?} failed: {}", page, owner, slot, err);
            return Err(AllocError::SwapFailed(err));
        }

        let swapped = page_tables.set_swapped(&owner, page, slot);
        assert!(swapped, "evicted page {} of {:?} was not present", page, owner);
        self.ring.remove(index);
        self.pool.frame(frame).flags.atomic_clear(FrameFlag::Mapped);
        self.pool.fill(frame, JUNK_BYTE);
        self.evictions += 1;

        log::trace!("evicted {} of {:?} from {} to {:?}", page, owner, frame, slot);
        Ok(frame)
    }

    fn fault_in<P: PageTableAccess<Owner = O>>(
        &mut self,
        page_tables: &P,
        owner: &O,
        page: VirtualAddress,
    ) -> Result<PhysicalAddress, AllocError> {
        match page_tables.entry(owner, page) {
            None => Err(AllocError::NotMapped),
            Some(PageEntry::Present { frame, .. }) => Ok(frame),
            Some(PageEntry::Swapped { slot, flags }) => {
                let frame = self.take_frame(page_tables)?;
                if let Err(err) = self.swap.device_mut().read_in(slot, self.pool.bytes_mut(frame)) {
                    self.pool.release(frame);
                    log::warn!("reading {} of {:?} from {:?} failed: {}", page, owner, slot, err);
                    return Err(AllocError::SwapFailed(err));
                }
                self.swap.release(slot);
                self.install(page_tables, owner, page, frame, flags);
                log::trace!("swapped in {} of {:?} from {:?} to {}", page, owner, slot, frame);
                Ok(frame)
            }
        }
    }

    fn install<P: PageTableAccess<Owner = O>>(
        &mut self,
        page_tables: &P,
        owner: &O,
        page: VirtualAddress,
        frame: PhysicalAddress,
        flags: PageFlags,
    ) {
        page_tables.map(
            owner,
            page,
            PageEntry::Present {
                frame,
                flags: flags.protection() | PageFlags::PRESENT,
            },
        );
        let index = self.pool.index_of(frame);
        self.pool.frame(frame).flags.atomic_set(FrameFlag::Mapped);
        self.ring.insert(index, owner.clone(), page);
    }
}

//! Memory-mapped regions.
//!
//! Regions live in one table shared by all processes, each slot tagged with its owner.
//! A region is anonymous (zero filled) or backed by an open file; its pages are
//! populated immediately with [`MapFlags::POPULATE`], otherwise on first fault.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use pmm::arch::{MAX_VIRTUAL_BITS, validate_virtual};
use pmm::{AddressSpaceRef, AllocError, PAGE_SIZE, PageFill, PageFlags, SwapDevice, VirtualAddress};

use crate::{FileRef, Kernel, MMAP_BASE, Pid, ProcError};

bitflags! {
    /// Access a mapping permits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Prot: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

bitflags! {
    /// How a mapping is backed and when it is populated.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MapFlags: u32 {
        /// Zero filled, no backing file.
        const ANONYMOUS = 1 << 0;
        /// Populate every page now instead of on first fault.
        const POPULATE = 1 << 1;
    }
}

/// Returns the start of `length` bytes at `MMAP_BASE + addr`, if the whole range lies
/// in canonical user space.
fn user_range(addr: usize, length: usize) -> Option<usize> {
    let start = MMAP_BASE.checked_add(addr)?;
    let last = start.checked_add(length)?.checked_sub(1)?;
    let lower_half = last < 1 << (MAX_VIRTUAL_BITS - 1);
    (validate_virtual(start) && validate_virtual(last) && lower_half).then_some(start)
}

/// One mapped region.
#[derive(Clone)]
pub struct MappedRegion {
    pub owner: Pid,
    pub start: VirtualAddress,
    pub length: usize,
    pub prot: Prot,
    pub flags: MapFlags,
    /// Backing file; `None` for anonymous regions.
    pub file: Option<FileRef>,
    /// Offset into `file` of the region's first byte.
    pub offset: usize,
}

impl MappedRegion {
    pub fn contains(&self, addr: VirtualAddress) -> bool {
        addr >= self.start && addr - self.start < self.length
    }

    fn overlaps(&self, start: VirtualAddress, length: usize) -> bool {
        start.as_usize() < self.start.as_usize() + self.length
            && self.start.as_usize() < start.as_usize() + length
    }

    /// Returns the page-table flags for the region's pages.
    pub fn page_flags(&self) -> PageFlags {
        if self.prot.contains(Prot::WRITE) {
            PageFlags::USER | PageFlags::WRITABLE
        } else {
            PageFlags::USER
        }
    }

    /// Fills `buf` with the initial contents of `page`: file bytes for file-backed
    /// regions (zero past the end of the file), zeroes otherwise.
    fn initial_contents(&self, page: VirtualAddress, buf: &mut [u8]) {
        buf.fill(0);
        if let Some(file) = &self.file {
            let read = file.read_at(self.offset + (page - self.start), buf);
            buf[read..].fill(0);
        }
    }

    fn pages(&self) -> impl Iterator<Item = VirtualAddress> + '_ {
        (0..self.length / PAGE_SIZE).map(move |n| self.start + n * PAGE_SIZE)
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("owner", &self.owner)
            .field("start", &self.start)
            .field("length", &self.length)
            .field("prot", &self.prot)
            .field("flags", &self.flags)
            .field("offset", &self.offset)
            .field("file_backed", &self.file.is_some())
            .finish()
    }
}

/// Fixed-capacity table of mapped regions.
pub struct RegionTable {
    slots: Vec<Option<MappedRegion>>,
}

impl RegionTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots }
    }

    /// Stores `region` in the lowest free slot.
    pub fn insert(&mut self, region: MappedRegion) -> Result<usize, ProcError> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(ProcError::TableFull)?;
        self.slots[index] = Some(region);
        Ok(index)
    }

    pub fn remove(&mut self, index: usize) -> Option<MappedRegion> {
        self.slots.get_mut(index).and_then(Option::take)
    }

    /// Returns the slot of the region of `owner` that starts at `start`.
    pub fn find(&self, owner: Pid, start: VirtualAddress) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|r| r.owner == owner && r.start == start)
        })
    }

    /// Returns the region of `owner` containing `addr`.
    pub fn containing(&self, owner: Pid, addr: VirtualAddress) -> Option<&MappedRegion> {
        self.owned_by(owner).find(|r| r.contains(addr))
    }

    pub fn owned_by(&self, owner: Pid) -> impl Iterator<Item = &MappedRegion> {
        self.slots
            .iter()
            .flatten()
            .filter(move |r| r.owner == owner)
    }

    /// Gives `to` a copy of every region of `from`. On failure nothing is added.
    pub fn duplicate(&mut self, from: Pid, to: Pid) -> Result<(), ProcError> {
        let copies: Vec<MappedRegion> = self
            .owned_by(from)
            .map(|r| MappedRegion {
                owner: to,
                ..r.clone()
            })
            .collect();
        let free = self.slots.iter().filter(|slot| slot.is_none()).count();
        if copies.len() > free {
            return Err(ProcError::TableFull);
        }
        for region in copies {
            self.insert(region)?;
        }
        Ok(())
    }

    /// Drops every region of `owner`, returning how many there were.
    pub fn remove_owned_by(&mut self, owner: Pid) -> usize {
        let mut removed = 0;
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|r| r.owner == owner) {
                *slot = None;
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: SwapDevice> Kernel<S> {
    /// Maps `length` bytes at `MMAP_BASE + addr` into `pid`.
    ///
    /// Anonymous regions ignore `fd`; other regions read from the file open at `fd`,
    /// starting at `offset`. Writable file-backed regions need a writable file.
    #[allow(clippy::too_many_arguments)]
    pub fn mmap(
        &self,
        pid: Pid,
        addr: usize,
        length: usize,
        prot: Prot,
        flags: MapFlags,
        fd: Option<usize>,
        offset: usize,
    ) -> Result<VirtualAddress, ProcError> {
        if addr % PAGE_SIZE != 0 || length == 0 || length % PAGE_SIZE != 0 {
            return Err(ProcError::InvalidMapping);
        }
        let start = user_range(addr, length).ok_or(ProcError::InvalidMapping)?;
        if offset.checked_add(length).is_none() {
            return Err(ProcError::InvalidMapping);
        }

        let file = if flags.contains(MapFlags::ANONYMOUS) {
            None
        } else {
            let file = self.file(pid, fd.ok_or(ProcError::BadFile)?)?;
            if !file.is_readable() || (prot.contains(Prot::WRITE) && !file.is_writable()) {
                return Err(ProcError::BadFile);
            }
            Some(file)
        };

        let space = self.address_space(pid)?;
        let start = VirtualAddress::new(start);
        let region = MappedRegion {
            owner: pid,
            start,
            length,
            prot,
            flags,
            file,
            offset,
        };

        let index = {
            let mut regions = self.regions.lock();
            if regions.owned_by(pid).any(|r| r.overlaps(start, length)) {
                return Err(ProcError::InvalidMapping);
            }
            regions.insert(region.clone())?
        };

        if flags.contains(MapFlags::POPULATE) {
            if let Err(err) = self.populate(&space, &region) {
                log::warn!("populating {:?} failed: {}", region, err);
                for page in region.pages() {
                    let _ = self.memory().unmap_page(&space, page);
                }
                self.regions.lock().remove(index);
                return Err(err.into());
            }
        }

        log::debug!("process {} mapped {} bytes at {}", pid, length, start);
        Ok(start)
    }

    fn populate(&self, space: &AddressSpaceRef, region: &MappedRegion) -> Result<(), AllocError> {
        let mut buf = vec![0u8; PAGE_SIZE];
        for page in region.pages() {
            region.initial_contents(page, &mut buf);
            self.memory()
                .map_page(space, page, region.page_flags(), PageFill::Bytes(&buf))?;
        }
        Ok(())
    }

    /// Populates one page of a region on first touch.
    pub(crate) fn populate_region_page(
        &self,
        pid: Pid,
        space: &AddressSpaceRef,
        page: VirtualAddress,
    ) -> Result<(), ProcError> {
        let region = self
            .regions
            .lock()
            .containing(pid, page)
            .cloned()
            .ok_or(ProcError::InvalidMapping)?;

        let mut buf = vec![0u8; PAGE_SIZE];
        region.initial_contents(page, &mut buf);
        match self
            .memory()
            .map_page(space, page, region.page_flags(), PageFill::Bytes(&buf))
        {
            Ok(_) | Err(AllocError::AlreadyMapped) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Removes the region of `pid` starting at `addr`, releasing its frames and swap
    /// slots.
    pub fn munmap(&self, pid: Pid, addr: VirtualAddress) -> Result<(), ProcError> {
        let space = self.address_space(pid)?;
        let region = {
            let mut regions = self.regions.lock();
            let index = regions.find(pid, addr).ok_or(ProcError::NoSuchMapping)?;
            regions.remove(index).ok_or(ProcError::NoSuchMapping)?
        };

        for page in region.pages() {
            // Pages never touched were never populated.
            let _ = self.memory().unmap_page(&space, page);
        }
        log::debug!("process {} unmapped {}", pid, addr);
        Ok(())
    }

    /// Returns the regions mapped by `pid`.
    pub fn regions(&self, pid: Pid) -> Vec<MappedRegion> {
        self.regions.lock().owned_by(pid).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::tests::kernel;
    use alloc::sync::Arc;
    use pmm::MemorySwap;

    fn anon() -> MapFlags {
        MapFlags::ANONYMOUS
    }

    fn setup(frames: usize) -> (Kernel<MemorySwap>, Pid) {
        let kernel = kernel(frames, 8);
        let init = kernel.userinit(&[]).unwrap();
        (kernel, init)
    }

    mod validation {
        use super::*;

        #[test]
        fn rejects_bad_arguments() {
            let (kernel, pid) = setup(16);
            let rw = Prot::READ | Prot::WRITE;
            assert_eq!(kernel.mmap(pid, 100, PAGE_SIZE, rw, anon(), None, 0), Err(ProcError::InvalidMapping));
            assert_eq!(kernel.mmap(pid, 0, 0, rw, anon(), None, 0), Err(ProcError::InvalidMapping));
            assert_eq!(kernel.mmap(pid, 0, 10, rw, anon(), None, 0), Err(ProcError::InvalidMapping));
            assert_eq!(
                kernel.mmap(pid, 0, PAGE_SIZE, rw, MapFlags::empty(), None, 0),
                Err(ProcError::BadFile)
            );
            assert_eq!(
                kernel.mmap(pid, 0, PAGE_SIZE, rw, MapFlags::empty(), Some(3), 0),
                Err(ProcError::BadFile)
            );
        }

        #[test]
        fn rejects_ranges_outside_user_space() {
            let (kernel, pid) = setup(16);
            let hole = (1usize << 47) - MMAP_BASE;
            assert_eq!(
                kernel.mmap(pid, hole, PAGE_SIZE, Prot::READ, anon(), None, 0),
                Err(ProcError::InvalidMapping)
            );
            assert_eq!(
                kernel.mmap(pid, hole - PAGE_SIZE, 2 * PAGE_SIZE, Prot::READ, anon(), None, 0),
                Err(ProcError::InvalidMapping)
            );
            assert_eq!(
                kernel.mmap(pid, usize::MAX & !0xFFF, PAGE_SIZE, Prot::READ, anon(), None, 0),
                Err(ProcError::InvalidMapping)
            );
            assert!(kernel.regions(pid).is_empty());

            // The last page below the hole is fine.
            let at = kernel
                .mmap(pid, hole - PAGE_SIZE, PAGE_SIZE, Prot::READ, anon(), None, 0)
                .unwrap();
            assert_eq!(at, VirtualAddress::new((1 << 47) - PAGE_SIZE));
        }

        #[test]
        fn rejects_file_offset_overflow() {
            let (kernel, pid) = setup(16);
            let fd = kernel.open(pid, Arc::new(vec![0u8; 10])).unwrap();
            let free = kernel.freemem();
            assert_eq!(
                kernel.mmap(pid, 0, 2 * PAGE_SIZE, Prot::READ, MapFlags::POPULATE, Some(fd), usize::MAX),
                Err(ProcError::InvalidMapping)
            );
            assert!(kernel.regions(pid).is_empty());
            assert_eq!(kernel.freemem(), free);
        }

        #[test]
        fn rejects_overlap() {
            let (kernel, pid) = setup(16);
            kernel.mmap(pid, 0, 2 * PAGE_SIZE, Prot::READ, anon(), None, 0).unwrap();
            assert_eq!(
                kernel.mmap(pid, PAGE_SIZE, PAGE_SIZE, Prot::READ, anon(), None, 0),
                Err(ProcError::InvalidMapping)
            );
        }

        #[test]
        fn read_only_file_cannot_be_mapped_writable() {
            let (kernel, pid) = setup(16);
            let fd = kernel.open(pid, Arc::new(vec![0u8; 10])).unwrap();
            assert_eq!(
                kernel.mmap(pid, 0, PAGE_SIZE, Prot::READ | Prot::WRITE, MapFlags::empty(), Some(fd), 0),
                Err(ProcError::BadFile)
            );
        }
    }

    mod population {
        use super::*;

        #[test]
        fn populate_maps_every_page_now() {
            let (kernel, pid) = setup(16);
            let free = kernel.freemem();
            let at = kernel
                .mmap(pid, 0, 3 * PAGE_SIZE, Prot::READ, anon() | MapFlags::POPULATE, None, 0)
                .unwrap();
            assert_eq!(at, VirtualAddress::new(MMAP_BASE));
            assert_eq!(kernel.freemem(), free - 3);

            let mut buf = [0xFFu8; 16];
            kernel.read_user(pid, at + PAGE_SIZE, &mut buf).unwrap();
            assert_eq!(buf, [0; 16]);
        }

        #[test]
        fn lazy_regions_fill_on_touch() {
            let (kernel, pid) = setup(16);
            let free = kernel.freemem();
            let at = kernel
                .mmap(pid, 0, 4 * PAGE_SIZE, Prot::READ | Prot::WRITE, anon(), None, 0)
                .unwrap();
            assert_eq!(kernel.freemem(), free);

            kernel.write_user(pid, at + 2 * PAGE_SIZE + 8, b"hi").unwrap();
            assert_eq!(kernel.freemem(), free - 1);
            let mut buf = [0u8; 2];
            kernel.read_user(pid, at + 2 * PAGE_SIZE + 8, &mut buf).unwrap();
            assert_eq!(&buf, b"hi");
        }

        #[test]
        fn file_pages_read_from_offset() {
            let (kernel, pid) = setup(16);
            let mut data = vec![0u8; 3 * PAGE_SIZE];
            for (i, byte) in data.iter_mut().enumerate() {
                *byte = (i / PAGE_SIZE) as u8 + 1;
            }
            let fd = kernel.open(pid, Arc::new(data)).unwrap();
            let at = kernel
                .mmap(pid, 0, 2 * PAGE_SIZE, Prot::READ, MapFlags::POPULATE, Some(fd), PAGE_SIZE)
                .unwrap();

            let mut buf = [0u8; 1];
            kernel.read_user(pid, at, &mut buf).unwrap();
            assert_eq!(buf, [2]);
            kernel.read_user(pid, at + PAGE_SIZE, &mut buf).unwrap();
            assert_eq!(buf, [3]);
        }

        #[test]
        fn short_file_is_zero_padded() {
            let (kernel, pid) = setup(16);
            let fd = kernel.open(pid, Arc::new(vec![7u8; 10])).unwrap();
            let at = kernel
                .mmap(pid, 0, PAGE_SIZE, Prot::READ, MapFlags::empty(), Some(fd), 0)
                .unwrap();
            let mut buf = [0xFFu8; 12];
            kernel.read_user(pid, at, &mut buf).unwrap();
            assert_eq!(&buf[..10], &[7; 10]);
            assert_eq!(&buf[10..], &[0, 0]);
        }

        #[test]
        fn read_only_region_rejects_writes() {
            let (kernel, pid) = setup(16);
            let at = kernel.mmap(pid, 0, PAGE_SIZE, Prot::READ, anon(), None, 0).unwrap();
            assert_eq!(kernel.write_user(pid, at, &[1]), Err(ProcError::InvalidMapping));
        }

        #[test]
        fn failed_populate_rolls_back() {
            // Stack and one code page leave two frames and no room to evict into.
            let kernel = kernel(4, 0);
            let pid = kernel.userinit(&[]).unwrap();
            let free = kernel.freemem();
            assert_eq!(
                kernel.mmap(pid, 0, 4 * PAGE_SIZE, Prot::READ, anon() | MapFlags::POPULATE, None, 0),
                Err(ProcError::OutOfMemory)
            );
            assert_eq!(kernel.freemem(), free);
            assert!(kernel.regions(pid).is_empty());
        }
    }

    mod unmapping {
        use super::*;

        #[test]
        fn munmap_returns_frames() {
            let (kernel, pid) = setup(16);
            let free = kernel.freemem();
            let at = kernel
                .mmap(pid, 0, 2 * PAGE_SIZE, Prot::READ, anon() | MapFlags::POPULATE, None, 0)
                .unwrap();
            kernel.munmap(pid, at).unwrap();
            assert_eq!(kernel.freemem(), free);
            assert_eq!(kernel.munmap(pid, at), Err(ProcError::NoSuchMapping));
            kernel.memory().check_invariants();
        }

        #[test]
        fn regions_follow_fork_and_reap() {
            let (kernel, pid) = setup(32);
            kernel
                .mmap(pid, PAGE_SIZE, PAGE_SIZE, Prot::READ, anon() | MapFlags::POPULATE, None, 0)
                .unwrap();
            let child = kernel.fork(pid).unwrap();
            assert_eq!(kernel.regions(child).len(), 1);
            assert_eq!(kernel.regions(child)[0].owner, child);

            crate::lifecycle::tests::run(&kernel, child);
            kernel.exit(child);
            crate::lifecycle::tests::run(&kernel, pid);
            kernel.wait(pid).unwrap();
            assert!(kernel.regions(child).is_empty());
            assert_eq!(kernel.regions(pid).len(), 1);
        }
    }

    #[test]
    fn region_table_capacity() {
        let mut table = RegionTable::new(1);
        let region = MappedRegion {
            owner: Pid::new(1),
            start: VirtualAddress::new(MMAP_BASE),
            length: PAGE_SIZE,
            prot: Prot::READ,
            flags: MapFlags::ANONYMOUS,
            file: None,
            offset: 0,
        };
        assert_eq!(table.insert(region.clone()).unwrap(), 0);
        assert_eq!(table.insert(region).unwrap_err(), ProcError::TableFull);
        assert_eq!(table.duplicate(Pid::new(1), Pid::new(2)), Err(ProcError::TableFull));
        assert_eq!(table.remove_owned_by(Pid::new(1)), 1);
        assert!(table.is_empty());
    }
}

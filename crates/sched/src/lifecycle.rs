//! Process creation and teardown.
//!
//! [`Kernel`] ties the scheduler's process table to the frame allocator. The
//! process-table lock and the allocator lock are never held together: every operation
//! below gathers what it needs from the table, drops the lock, talks to the allocator,
//! and only then locks the table again to publish the result.

use alloc::vec;

use pmm::{
    AddressSpaceRef, AllocError, FrameAllocator, PAGE_SIZE, PageFill, PageFlags,
    SoftwarePageTables, SwapDevice, VirtualAddress,
};
use spin::{Mutex, Once};

use crate::{
    FileRef, NMMAPAREA, Nice, Pid, ProcError, ProcState, RegionTable, SchedConfig,
    Scheduler, TrapFrame, WaitChannel,
};

/// The result of a `wait` call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// A zombie child was reaped.
    Reaped(Pid),
    /// Children exist but none has exited; the caller is now SLEEPING and should call
    /// `wait` again once it runs.
    Sleeping,
}

/// The process-management core: scheduler, frame allocator and mapped regions.
pub struct Kernel<S> {
    scheduler: Scheduler,
    memory: FrameAllocator<SoftwarePageTables, S>,
    pub(crate) regions: Mutex<RegionTable>,
    init: Once<Pid>,
}

impl<S: SwapDevice> Kernel<S> {
    /// Creates a kernel with an empty process table.
    pub fn new(config: SchedConfig, memory: FrameAllocator<SoftwarePageTables, S>) -> Self {
        Self {
            scheduler: Scheduler::new(config),
            memory,
            regions: Mutex::new(RegionTable::new(NMMAPAREA)),
            init: Once::new(),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn memory(&self) -> &FrameAllocator<SoftwarePageTables, S> {
        &self.memory
    }

    /// Returns the first process, once it exists.
    pub fn init_pid(&self) -> Option<Pid> {
        self.init.get().copied()
    }

    /// Returns the number of free frames.
    pub fn freemem(&self) -> usize {
        self.memory.free_frames()
    }

    /// Returns the address space of `pid`.
    pub fn address_space(&self, pid: Pid) -> Result<AddressSpaceRef, ProcError> {
        self.scheduler
            .table
            .lock()
            .get(pid)
            .and_then(|p| p.address_space.clone())
            .ok_or(ProcError::NoSuchProcess)
    }

    /// Claims a process slot and gives it a kernel stack. The slot is left EMBRYO.
    fn allocproc(&self, name: &str) -> Result<(usize, Pid), ProcError> {
        let (index, pid) = {
            let mut table = self.scheduler.table.lock();
            let index = table.allocate(name).ok_or(ProcError::TableFull)?;
            (index, table.slot(index).pid)
        };

        match self.memory.allocate_frame() {
            Ok(stack) => {
                self.scheduler.table.lock().slot_mut(index).kernel_stack = Some(stack);
                Ok((index, pid))
            }
            Err(err) => {
                self.scheduler.table.lock().free_slot(index);
                log::warn!("no kernel stack for new process {}: {}", pid, err);
                Err(ProcError::OutOfMemory)
            }
        }
    }

    /// Frees an EMBRYO slot and everything allocated for it.
    fn discard(&self, index: usize) {
        let process = self.scheduler.table.lock().free_slot(index);
        if let Some(space) = &process.address_space {
            self.release_address_space(space);
        }
        if let Some(stack) = process.kernel_stack {
            self.memory.release_frame(stack);
        }
    }

    fn release_address_space(&self, space: &AddressSpaceRef) {
        for (page, _) in space.mappings() {
            // Already gone is fine; nothing else can map into a dead space.
            let _ = self.memory.unmap_page(space, page);
        }
    }

    fn copy_address_space(&self, from: &AddressSpaceRef, to: &AddressSpaceRef) -> Result<(), AllocError> {
        let mut buf = vec![0u8; PAGE_SIZE];
        for (page, entry) in from.mappings() {
            self.memory.read_page(from, page, &mut buf)?;
            self.memory
                .map_page(to, page, entry.flags(), PageFill::Bytes(&buf))?;
        }
        Ok(())
    }

    /// Creates the first process, `initcode`, with `image` loaded at address 0.
    ///
    /// # Panics
    ///
    /// Panics if the first process already exists.
    pub fn userinit(&self, image: &[u8]) -> Result<Pid, ProcError> {
        assert!(self.init.get().is_none(), "first process already created");
        let (index, pid) = self.allocproc("initcode")?;

        let space = AddressSpaceRef::new();
        self.scheduler.table.lock().slot_mut(index).address_space = Some(space.clone());

        let pages = image.len().div_ceil(PAGE_SIZE).max(1);
        for n in 0..pages {
            let chunk = image.get(n * PAGE_SIZE..).unwrap_or(&[]);
            let mapped = self.memory.map_page(
                &space,
                VirtualAddress::new(n * PAGE_SIZE),
                PageFlags::WRITABLE | PageFlags::USER,
                PageFill::Bytes(chunk),
            );
            if let Err(err) = mapped {
                log::warn!("loading initcode failed: {}", err);
                self.discard(index);
                return Err(ProcError::OutOfMemory);
            }
        }

        {
            let mut table = self.scheduler.table.lock();
            let process = table.slot_mut(index);
            process.nice = Nice::DEFAULT;
            process.trap_frame = TrapFrame {
                return_value: 0,
                instruction_pointer: 0,
                stack_pointer: pages * PAGE_SIZE,
            };
            process.state = ProcState::Runnable;
        }
        self.init.call_once(|| pid);
        log::debug!("first process {} created", pid);
        Ok(pid)
    }

    /// Creates a copy of `parent`. The child gets a copy of the parent's memory and
    /// mapped regions, shares its open files, inherits its nice value and runtimes, and
    /// sees 0 as the result of the call.
    pub fn fork(&self, parent: Pid) -> Result<Pid, ProcError> {
        let (name, space, nice, runtime, vruntime, files, trap_frame) = {
            let table = self.scheduler.table.lock();
            let p = table.get(parent).ok_or(ProcError::NoSuchProcess)?;
            (
                p.name.clone(),
                p.address_space.clone(),
                p.nice,
                p.runtime,
                p.vruntime,
                p.files.clone(),
                p.trap_frame,
            )
        };

        let (index, pid) = self.allocproc(&name)?;
        let child_space = AddressSpaceRef::new();
        self.scheduler.table.lock().slot_mut(index).address_space = Some(child_space.clone());

        if let Some(space) = &space {
            if let Err(err) = self.copy_address_space(space, &child_space) {
                log::warn!("fork of {} failed copying memory: {}", parent, err);
                self.discard(index);
                return Err(ProcError::OutOfMemory);
            }
        }
        let duplicated = self.regions.lock().duplicate(parent, pid);
        if let Err(err) = duplicated {
            self.discard(index);
            return Err(err);
        }

        {
            let mut table = self.scheduler.table.lock();
            let child = table.slot_mut(index);
            child.parent = Some(parent);
            child.nice = nice;
            child.runtime = runtime;
            child.vruntime = vruntime;
            child.files = files;
            child.trap_frame = TrapFrame {
                return_value: 0,
                ..trap_frame
            };
            child.state = ProcState::Runnable;
        }
        log::debug!("process {} forked {}", parent, pid);
        Ok(pid)
    }

    /// Terminates the running process `pid`. Its files are closed, its children are
    /// handed to the first process, its parent is woken, and it stays ZOMBIE until the
    /// parent reaps it.
    ///
    /// # Panics
    ///
    /// Panics if `pid` is the first process or is not running.
    pub fn exit(&self, pid: Pid) {
        let init = self.init_pid();
        assert!(init != Some(pid), "init exiting");

        let files = {
            let mut table = self.scheduler.table.lock();
            let process = table
                .get_mut(pid)
                .filter(|p| p.is_running())
                .unwrap_or_else(|| panic!("exit by process {} that is not running", pid));
            core::mem::take(&mut process.files)
        };
        drop(files);

        let mut table = self.scheduler.table.lock();
        let parent = table.get(pid).and_then(|p| p.parent);
        if let Some(parent) = parent {
            table.wakeup(WaitChannel::Process(parent));
        }

        let mut orphaned_zombie = false;
        for p in table.iter_mut() {
            if p.state != ProcState::Unused && p.parent == Some(pid) {
                p.parent = init;
                orphaned_zombie |= p.state == ProcState::Zombie;
            }
        }
        if let (true, Some(init)) = (orphaned_zombie, init) {
            table.wakeup(WaitChannel::Process(init));
        }

        if let Some(process) = table.get_mut(pid) {
            process.state = ProcState::Zombie;
        }
        log::debug!("process {} exited", pid);
    }

    /// Reaps a zombie child of the running process `pid`.
    ///
    /// Fails with [`ProcError::NoChildren`] when `pid` has no children and with
    /// [`ProcError::Killed`] when it was killed; otherwise either reaps a child or puts
    /// `pid` to sleep until one exits.
    pub fn wait(&self, pid: Pid) -> Result<WaitStatus, ProcError> {
        let reaped = {
            let mut table = self.scheduler.table.lock();
            let killed = table.get(pid).ok_or(ProcError::NoSuchProcess)?.killed;

            let mut have_kids = false;
            let mut zombie = None;
            for (index, p) in table.iter().enumerate() {
                if p.state == ProcState::Unused || p.parent != Some(pid) {
                    continue;
                }
                have_kids = true;
                if p.state == ProcState::Zombie && p.on_cpu.is_none() {
                    zombie = Some(index);
                    break;
                }
            }

            match zombie {
                Some(index) => table.free_slot(index),
                None if !have_kids => return Err(ProcError::NoChildren),
                None if killed => return Err(ProcError::Killed),
                None => {
                    let me = table
                        .get_mut(pid)
                        .filter(|p| p.is_running())
                        .unwrap_or_else(|| panic!("wait by process {} that is not running", pid));
                    me.state = ProcState::Sleeping(WaitChannel::Process(pid));
                    return Ok(WaitStatus::Sleeping);
                }
            }
        };

        let child = reaped.pid;
        if let Some(space) = &reaped.address_space {
            self.release_address_space(space);
        }
        if let Some(stack) = reaped.kernel_stack {
            self.memory.release_frame(stack);
        }
        self.regions.lock().remove_owned_by(child);
        log::debug!("process {} reaped {}", pid, child);
        Ok(WaitStatus::Reaped(child))
    }

    /// Marks `pid` as killed.
    pub fn kill(&self, pid: Pid) -> Result<(), ProcError> {
        self.scheduler.kill(pid)
    }

    /// The check made on every return to user mode: a killed process exits here.
    pub fn return_to_user(&self, pid: Pid) -> Result<(), ProcError> {
        if self.scheduler.is_killed(pid) {
            self.exit(pid);
            return Err(ProcError::Killed);
        }
        Ok(())
    }

    /// Installs `file` in the lowest free descriptor of `pid`.
    pub fn open(&self, pid: Pid, file: FileRef) -> Result<usize, ProcError> {
        let mut table = self.scheduler.table.lock();
        let process = table.get_mut(pid).ok_or(ProcError::NoSuchProcess)?;
        let (fd, slot) = process
            .files
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.is_none())
            .ok_or(ProcError::TableFull)?;
        *slot = Some(file);
        Ok(fd)
    }

    /// Closes descriptor `fd` of `pid`.
    pub fn close(&self, pid: Pid, fd: usize) -> Result<(), ProcError> {
        let file = {
            let mut table = self.scheduler.table.lock();
            let process = table.get_mut(pid).ok_or(ProcError::NoSuchProcess)?;
            process
                .files
                .get_mut(fd)
                .and_then(Option::take)
                .ok_or(ProcError::BadFile)?
        };
        drop(file);
        Ok(())
    }

    /// Returns the file open at descriptor `fd` of `pid`.
    pub fn file(&self, pid: Pid, fd: usize) -> Result<FileRef, ProcError> {
        self.scheduler
            .table
            .lock()
            .get(pid)
            .ok_or(ProcError::NoSuchProcess)?
            .files
            .get(fd)
            .cloned()
            .flatten()
            .ok_or(ProcError::BadFile)
    }

    /// Resolves a page fault at `addr` in `pid`: swapped pages are read back, and pages
    /// of a mapped region that were never populated are populated now.
    pub fn page_fault(&self, pid: Pid, addr: VirtualAddress) -> Result<(), ProcError> {
        let space = self.address_space(pid)?;
        let page = addr.align_down(PAGE_SIZE);
        match self.memory.fault_in(&space, page) {
            Ok(_) => Ok(()),
            Err(AllocError::NotMapped) => self.populate_region_page(pid, &space, page),
            Err(err) => {
                log::warn!("page fault at {} in {} failed: {}", addr, pid, err);
                Err(err.into())
            }
        }
    }

    fn user_page<R>(
        &self,
        pid: Pid,
        space: &AddressSpaceRef,
        addr: VirtualAddress,
        write: bool,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, ProcError> {
        let page = addr.align_down(PAGE_SIZE);
        if space.entry(page).is_none() {
            self.page_fault(pid, page)?;
        }
        let writable = space
            .entry(page)
            .is_some_and(|e| e.flags().contains(PageFlags::WRITABLE));
        if write && !writable {
            return Err(ProcError::InvalidMapping);
        }
        Ok(self.memory.access_page(space, addr, write, f)?)
    }

    /// Copies user memory of `pid` starting at `addr` into `buf`.
    pub fn read_user(&self, pid: Pid, addr: VirtualAddress, buf: &mut [u8]) -> Result<(), ProcError> {
        let space = self.address_space(pid)?;
        let mut done = 0;
        while done < buf.len() {
            let at = addr + done;
            let len = (PAGE_SIZE - at.page_offset()).min(buf.len() - done);
            let offset = at.page_offset();
            let dst = &mut buf[done..done + len];
            self.user_page(pid, &space, at, false, |bytes| {
                dst.copy_from_slice(&bytes[offset..offset + len])
            })?;
            done += len;
        }
        Ok(())
    }

    /// Copies `data` into user memory of `pid` starting at `addr`.
    pub fn write_user(&self, pid: Pid, addr: VirtualAddress, data: &[u8]) -> Result<(), ProcError> {
        let space = self.address_space(pid)?;
        let mut done = 0;
        while done < data.len() {
            let at = addr + done;
            let len = (PAGE_SIZE - at.page_offset()).min(data.len() - done);
            let offset = at.page_offset();
            let src = &data[done..done + len];
            self.user_page(pid, &space, at, true, |bytes| {
                bytes[offset..offset + len].copy_from_slice(src)
            })?;
            done += len;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::sync::Arc;
    use pmm::{AddressTranslator, FramePool, MemorySwap, PhysicalAddress};

    pub(crate) fn kernel(frames: usize, swap_slots: usize) -> Kernel<MemorySwap> {
        let pool = FramePool::new(
            AddressTranslator::emulated(frames * PAGE_SIZE),
            PhysicalAddress::new(0),
            frames * PAGE_SIZE,
        );
        let memory = FrameAllocator::new(pool, SoftwarePageTables, MemorySwap::new(swap_slots));
        Kernel::new(
            SchedConfig {
                nproc: 8,
                ..SchedConfig::default()
            },
            memory,
        )
    }

    /// Marks `pid` RUNNING, as if a core had dispatched it.
    pub(crate) fn run(kernel: &Kernel<MemorySwap>, pid: Pid) {
        kernel.scheduler.table.lock().get_mut(pid).unwrap().state = ProcState::Running { cpu: 0 };
    }

    mod creation {
        use super::*;

        #[test]
        fn userinit_loads_the_image() {
            let kernel = kernel(16, 0);
            let init = kernel.userinit(b"\x90\x90\xcc").unwrap();
            assert_eq!(kernel.init_pid(), Some(init));
            assert_eq!(kernel.scheduler().state(init), Some(ProcState::Runnable));

            let mut code = [0u8; 3];
            kernel.read_user(init, VirtualAddress::new(0), &mut code).unwrap();
            assert_eq!(&code, b"\x90\x90\xcc");
            // One kernel stack plus one page of code.
            assert_eq!(kernel.memory().in_use_frames(), 2);
        }

        #[test]
        fn fork_copies_memory_and_scheduling_state() {
            let kernel = kernel(16, 0);
            let init = kernel.userinit(&[1; 100]).unwrap();
            kernel.scheduler().set_nice(init, 13).unwrap();
            {
                let mut table = kernel.scheduler.table.lock();
                let p = table.get_mut(init).unwrap();
                p.runtime = 5000;
                p.vruntime = 1200;
                p.trap_frame.return_value = 77;
            }

            let child = kernel.fork(init).unwrap();
            let table = kernel.scheduler.table.lock();
            let c = table.get(child).unwrap();
            assert_eq!(c.parent, Some(init));
            assert_eq!(c.nice.get(), 13);
            assert_eq!((c.runtime, c.vruntime), (5000, 1200));
            assert_eq!(c.trap_frame.return_value, 0);
            assert_eq!(c.state, ProcState::Runnable);
            drop(table);

            // Separate copies.
            kernel.write_user(child, VirtualAddress::new(0), &[9]).unwrap();
            let mut byte = [0u8];
            kernel.read_user(init, VirtualAddress::new(0), &mut byte).unwrap();
            assert_eq!(byte, [1]);
            kernel.memory().check_invariants();
        }

        #[test]
        fn fork_shares_open_files() {
            let kernel = kernel(16, 0);
            let init = kernel.userinit(&[]).unwrap();
            let file: FileRef = Arc::new(alloc::vec![1u8, 2, 3]);
            let fd = kernel.open(init, file.clone()).unwrap();
            let child = kernel.fork(init).unwrap();
            assert!(Arc::ptr_eq(&kernel.file(child, fd).unwrap(), &file));
        }

        #[test]
        fn fork_without_memory_rolls_back() {
            // Kernel stack and code page for init, one frame short for the child.
            let kernel = kernel(3, 0);
            let init = kernel.userinit(&[1; 10]).unwrap();
            let free_before = kernel.freemem();
            assert_eq!(kernel.fork(init), Err(ProcError::OutOfMemory));
            assert_eq!(kernel.freemem(), free_before);
            assert_eq!(kernel.scheduler().ps(None).rows.len(), 1);
        }

        #[test]
        fn full_table() {
            let kernel = kernel(64, 0);
            let init = kernel.userinit(&[]).unwrap();
            for _ in 0..7 {
                kernel.fork(init).unwrap();
            }
            assert_eq!(kernel.fork(init), Err(ProcError::TableFull));
        }
    }

    mod teardown {
        use super::*;

        #[test]
        fn exit_then_wait_reaps_everything() {
            let kernel = kernel(16, 0);
            let init = kernel.userinit(&[]).unwrap();
            let free_at_start = kernel.freemem();
            let child = kernel.fork(init).unwrap();
            assert!(kernel.freemem() < free_at_start);

            run(&kernel, init);
            assert_eq!(kernel.wait(init), Ok(WaitStatus::Sleeping));
            assert_eq!(
                kernel.scheduler().state(init),
                Some(ProcState::Sleeping(WaitChannel::Process(init)))
            );

            run(&kernel, child);
            kernel.exit(child);
            assert_eq!(kernel.scheduler().state(child), Some(ProcState::Zombie));
            assert_eq!(kernel.scheduler().state(init), Some(ProcState::Runnable));

            run(&kernel, init);
            assert_eq!(kernel.wait(init), Ok(WaitStatus::Reaped(child)));
            assert_eq!(kernel.scheduler().state(child), None);
            assert_eq!(kernel.freemem(), free_at_start);
            assert_eq!(kernel.wait(init), Err(ProcError::NoChildren));
        }

        #[test]
        fn orphans_go_to_init() {
            let kernel = kernel(32, 0);
            let init = kernel.userinit(&[]).unwrap();
            let middle = kernel.fork(init).unwrap();
            let leaf = kernel.fork(middle).unwrap();

            run(&kernel, middle);
            kernel.exit(middle);
            let table = kernel.scheduler.table.lock();
            assert_eq!(table.get(leaf).unwrap().parent, Some(init));
        }

        #[test]
        fn killed_waiter_fails() {
            let kernel = kernel(16, 0);
            let init = kernel.userinit(&[]).unwrap();
            let child = kernel.fork(init).unwrap();
            let _grandchild = kernel.fork(child).unwrap();

            kernel.kill(child).unwrap();
            run(&kernel, child);
            assert_eq!(kernel.wait(child), Err(ProcError::Killed));
            assert_eq!(kernel.return_to_user(child), Err(ProcError::Killed));
            assert_eq!(kernel.scheduler().state(child), Some(ProcState::Zombie));
        }

        #[test]
        #[should_panic(expected = "init exiting")]
        fn init_may_not_exit() {
            let kernel = kernel(16, 0);
            let init = kernel.userinit(&[]).unwrap();
            run(&kernel, init);
            kernel.exit(init);
        }

        #[test]
        fn exit_closes_files() {
            let kernel = kernel(16, 0);
            let init = kernel.userinit(&[]).unwrap();
            let child = kernel.fork(init).unwrap();
            let file: FileRef = Arc::new(alloc::vec![0u8; 4]);
            kernel.open(child, file.clone()).unwrap();
            assert_eq!(Arc::strong_count(&file), 2);

            run(&kernel, child);
            kernel.exit(child);
            assert_eq!(Arc::strong_count(&file), 1);
        }
    }

    mod files {
        use super::*;

        #[test]
        fn open_and_close() {
            let kernel = kernel(8, 0);
            let init = kernel.userinit(&[]).unwrap();
            let file: FileRef = Arc::new(alloc::vec![0u8; 1]);
            assert_eq!(kernel.open(init, file.clone()), Ok(0));
            assert_eq!(kernel.open(init, file.clone()), Ok(1));
            kernel.close(init, 0).unwrap();
            assert_eq!(kernel.close(init, 0), Err(ProcError::BadFile));
            assert_eq!(kernel.open(init, file), Ok(0));
            assert_eq!(kernel.close(init, 99), Err(ProcError::BadFile));
        }
    }

    mod user_memory {
        use super::*;

        #[test]
        fn accesses_span_pages() {
            let kernel = kernel(16, 0);
            let init = kernel.userinit(&[0; 2 * PAGE_SIZE]).unwrap();
            let data: alloc::vec::Vec<u8> = (0..100).collect();
            let at = VirtualAddress::new(PAGE_SIZE - 50);
            kernel.write_user(init, at, &data).unwrap();

            let mut back = [0u8; 100];
            kernel.read_user(init, at, &mut back).unwrap();
            assert_eq!(&back[..], &data[..]);
        }

        #[test]
        fn unmapped_access_is_an_error() {
            let kernel = kernel(16, 0);
            let init = kernel.userinit(&[]).unwrap();
            let mut buf = [0u8; 4];
            assert_eq!(
                kernel.read_user(init, VirtualAddress::new(0x10_0000), &mut buf),
                Err(ProcError::InvalidMapping)
            );
        }

        #[test]
        fn swapped_pages_come_back_on_access() {
            // Stack and two code pages leave one free frame; the second pin evicts.
            let kernel = kernel(4, 8);
            let init = kernel.userinit(&[0xAA; 2 * PAGE_SIZE]).unwrap();
            kernel.memory().allocate_frame().unwrap();
            kernel.memory().allocate_frame().unwrap();
            assert!(kernel.memory().swapped_pages() > 0);

            let mut buf = [0u8; 8];
            kernel.read_user(init, VirtualAddress::new(PAGE_SIZE), &mut buf).unwrap();
            assert_eq!(buf, [0xAA; 8]);
            kernel.read_user(init, VirtualAddress::new(0), &mut buf).unwrap();
            assert_eq!(buf, [0xAA; 8]);
            kernel.memory().check_invariants();
        }
    }
}

#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris process scheduler
//!
//! The CPU half of the Polaris kernel core: a fixed-capacity process table, a
//! scheduler that shares CPU time by weighted virtual runtime, and the process
//! lifecycle (fork, exit, wait, kill) together with anonymous and file-backed memory
//! mappings built on the [`pmm`] frame allocator.
//!
//! Nothing here touches hardware. Context switches go through a [`Dispatcher`]
//! supplied by the architecture layer, and files through [`FileSource`].

extern crate alloc;

mod file;
mod lifecycle;
mod mmap;
mod process;
mod scheduler;
mod table;
mod weight;

pub use file::{FileRef, FileSource};
pub use lifecycle::{Kernel, WaitStatus};
pub use mmap::{MapFlags, MappedRegion, Prot, RegionTable};
pub use process::{Pid, ProcState, Process, TrapFrame, WaitChannel};
pub use scheduler::{
    Cpu, Dispatch, Dispatcher, ProcessListing, ProcessRow, SchedConfig, ScheduleOutcome,
    Scheduler,
};
pub use table::ProcessTable;
pub use weight::{DEFAULT_NICE, MAX_NICE, MIN_NICE, NEUTRAL_WEIGHT, Nice};

/// Open files per process.
pub const NOFILE: usize = 16;

/// Mapped-region slots shared by all processes.
pub const NMMAPAREA: usize = 64;

/// Base of the user mapping area; `mmap` addresses are offsets from here.
pub const MMAP_BASE: usize = 0x4000_0000;

/// Errors returned by process and scheduling operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProcError {
    /// The pid does not name a live process.
    #[error("no such process")]
    NoSuchProcess,
    /// The requested nice value lies outside `MIN_NICE..=MAX_NICE`.
    #[error("nice value out of range")]
    InvalidNice,
    /// The caller has no children to wait for.
    #[error("process has no children")]
    NoChildren,
    /// The process has been killed and must not return to user mode.
    #[error("process was killed")]
    Killed,
    /// A fixed-size table (processes, open files, or mapped regions) has no free slot.
    #[error("table is full")]
    TableFull,
    /// No frame could be allocated, even after eviction.
    #[error("out of memory")]
    OutOfMemory,
    /// Mapping arguments are misaligned or empty, leave user space, or overlap an existing region.
    #[error("invalid mapping")]
    InvalidMapping,
    /// No region starts at the given address for this process.
    #[error("no such mapping")]
    NoSuchMapping,
    /// The descriptor is not open or its file does not permit the requested access.
    #[error("bad file descriptor")]
    BadFile,
}

impl From<pmm::AllocError> for ProcError {
    fn from(err: pmm::AllocError) -> Self {
        match err {
            pmm::AllocError::NotMapped | pmm::AllocError::AlreadyMapped => {
                ProcError::InvalidMapping
            }
            pmm::AllocError::OutOfMemory
            | pmm::AllocError::SwapFull
            | pmm::AllocError::SwapFailed(_) => ProcError::OutOfMemory,
        }
    }
}

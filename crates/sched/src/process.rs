//! Process control blocks.

use alloc::string::String;
use core::fmt;

use pmm::{AddressSpaceRef, PhysFrame};

use crate::{FileRef, Nice, NOFILE};

/// A process identifier. Identifiers are never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl Pid {
    /// Creates a process identifier.
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the identifier as an integer.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({})", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a sleeping process is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitChannel {
    /// A child of this process to exit (used by `wait`).
    Process(Pid),
    /// The next timer tick.
    Ticks,
    /// Any other kernel object, identified by its address.
    Address(usize),
}

/// The scheduling state of a process slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Embryo,
    Runnable,
    Running { cpu: usize },
    Sleeping(WaitChannel),
    Zombie,
}

impl ProcState {
    /// Returns the state's name as shown in process listings.
    pub fn name(&self) -> &'static str {
        match self {
            ProcState::Unused => "UNUSED",
            ProcState::Embryo => "EMBRYO",
            ProcState::Runnable => "RUNNABLE",
            ProcState::Running { .. } => "RUNNING",
            ProcState::Sleeping(_) => "SLEEPING",
            ProcState::Zombie => "ZOMBIE",
        }
    }
}

/// Saved user registers. Only the parts the core touches are modeled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    /// The system-call return register (eax on i386, rax on x86_64).
    pub return_value: usize,
    pub instruction_pointer: usize,
    pub stack_pointer: usize,
}

/// A process control block.
pub struct Process {
    pub pid: Pid,
    pub state: ProcState,
    /// The parent, if it is still alive. Orphans are handed to the first process.
    pub parent: Option<Pid>,
    pub name: String,
    pub nice: Nice,
    /// Time on the CPU, in scheduler time units.
    pub runtime: u64,
    /// Runtime scaled by the inverse of the process's weight.
    pub vruntime: u64,
    pub killed: bool,
    pub address_space: Option<AddressSpaceRef>,
    pub kernel_stack: Option<PhysFrame>,
    pub files: [Option<FileRef>; NOFILE],
    pub trap_frame: TrapFrame,
    /// The core still switching away from this process, if any. A process is not
    /// dispatched again, nor reaped, until the core that ran it has charged its time.
    pub(crate) on_cpu: Option<usize>,
    /// Runtime at the start of the current scheduling period.
    pub(crate) period_base: Option<u64>,
}

impl Process {
    /// Returns an empty slot.
    pub(crate) fn unused() -> Self {
        Self {
            pid: Pid::new(0),
            state: ProcState::Unused,
            parent: None,
            name: String::new(),
            nice: Nice::DEFAULT,
            runtime: 0,
            vruntime: 0,
            killed: false,
            address_space: None,
            kernel_stack: None,
            files: Default::default(),
            trap_frame: TrapFrame::default(),
            on_cpu: None,
            period_base: None,
        }
    }

    /// Returns whether the process is RUNNING on some core.
    pub fn is_running(&self) -> bool {
        matches!(self.state, ProcState::Running { .. })
    }

    /// Returns the runtime accumulated since the current period began.
    pub fn period_runtime(&self) -> u64 {
        self.runtime - self.period_base.unwrap_or(self.runtime)
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("parent", &self.parent)
            .field("nice", &self.nice)
            .field("runtime", &self.runtime)
            .field("vruntime", &self.vruntime)
            .field("killed", &self.killed)
            .finish_non_exhaustive()
    }
}

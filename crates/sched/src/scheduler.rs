//! Weighted virtual-runtime scheduling.
//!
//! Every core runs [`Scheduler::run`] (or drives [`Scheduler::schedule_once`] itself).
//! Each attempt:
//!
//! 1. weighs every RUNNABLE process by its nice value,
//! 2. gives each a slice of the scheduling period proportional to its share of the total
//!    weight,
//! 3. skips processes that have already used their slice in the current period,
//! 4. dispatches the eligible process with the smallest virtual runtime (lowest slot
//!    wins ties), and
//! 5. charges the elapsed time on return: runtime advances at wall-clock rate, virtual
//!    runtime at `NEUTRAL_WEIGHT / weight` of it.
//!
//! Time is measured in scheduler units: timer ticks multiplied by
//! [`SchedConfig::millibias`].

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::{
    NEUTRAL_WEIGHT, Nice, Pid, ProcError, ProcState, ProcessTable, WaitChannel,
};

/// Scheduler tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedConfig {
    /// Length of a scheduling period, in timer ticks.
    pub period: u64,
    /// Scheduler time units per timer tick.
    pub millibias: u64,
    /// Number of periods between resets of the per-period runtime accounting.
    pub snapshot_interval: u64,
    /// Number of process-table slots.
    pub nproc: usize,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            period: 10,
            millibias: 1000,
            snapshot_interval: 1,
            nproc: 64,
        }
    }
}

/// A process handed to a core to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub pid: Pid,
    /// The process's share of the current period, in scheduler units.
    pub slice: u64,
    pub cpu: usize,
}

/// The machine-specific half of a context switch.
pub trait Dispatcher {
    /// Runs the dispatched process until it gives up the CPU.
    ///
    /// The process must leave RUNNING (yield, sleep or exit) before this returns.
    fn switch_to(&mut self, dispatch: Dispatch);

    /// Enables interrupts on this core, so that a timer tick or device interrupt can
    /// make something runnable while the core looks for work.
    fn enable_interrupts(&mut self) {}

    /// Waits briefly when nothing can run.
    fn idle(&mut self) {
        core::hint::spin_loop();
    }
}

/// Per-core scheduler state.
#[derive(Debug)]
pub struct Cpu {
    pub id: usize,
    /// The process this core is running, if any.
    pub current: Option<Pid>,
}

impl Cpu {
    pub const fn new(id: usize) -> Self {
        Self { id, current: None }
    }
}

/// The result of one scheduling attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Nothing was RUNNABLE.
    Idle,
    /// Processes were RUNNABLE but all had used up their slice for this period.
    Throttled,
    /// A process ran for `elapsed` units against a slice of `slice` units.
    Ran { pid: Pid, elapsed: u64, slice: u64 },
}

pub struct Scheduler {
    config: SchedConfig,
    pub(crate) table: Mutex<ProcessTable>,
    ticks: AtomicU64,
}

impl Scheduler {
    /// Creates a scheduler with an empty process table.
    ///
    /// # Panics
    ///
    /// Panics if the period, the time unit or the reset interval is zero.
    pub fn new(config: SchedConfig) -> Self {
        assert!(
            config.period > 0 && config.millibias > 0 && config.snapshot_interval > 0,
            "invalid scheduler configuration {:?}",
            config
        );
        Self {
            config,
            table: Mutex::new(ProcessTable::new(config.nproc)),
            ticks: AtomicU64::new(0),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    /// Returns the number of timer ticks so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Returns the current time in scheduler units.
    pub fn now(&self) -> u64 {
        self.ticks() * self.config.millibias
    }

    /// Advances the clock by one tick and wakes processes sleeping on the tick.
    pub fn schedule_tick(&self) {
        self.ticks.fetch_add(1, Ordering::AcqRel);
        self.table.lock().wakeup(WaitChannel::Ticks);
    }

    /// Runs the scheduling loop on one core forever.
    pub fn run(&self, cpu_id: usize, dispatcher: &mut impl Dispatcher) -> ! {
        let mut cpu = Cpu::new(cpu_id);
        log::debug!("cpu {}: scheduler starting", cpu_id);
        loop {
            self.schedule_once(&mut cpu, dispatcher);
        }
    }

    /// Makes one scheduling attempt on `cpu`.
    pub fn schedule_once(
        &self,
        cpu: &mut Cpu,
        dispatcher: &mut impl Dispatcher,
    ) -> ScheduleOutcome {
        // Never look for work with interrupts masked, or a core with nothing to run
        // would never see the tick that wakes a sleeper.
        dispatcher.enable_interrupts();

        let start = self.now();
        let period = self.config.period * self.config.millibias;
        let epoch = self.ticks() / (self.config.period * self.config.snapshot_interval);

        let mut table = self.table.lock();
        table.refresh_period(epoch);

        let total_weight = table.runnable_weight();
        let slice_of = |nice: Nice| (period * u64::from(nice.weight()) / total_weight.max(1)).max(1);

        let mut any_runnable = false;
        let mut chosen: Option<(usize, u64)> = None;
        for (index, p) in table.iter().enumerate() {
            if p.state != ProcState::Runnable || p.on_cpu.is_some() {
                continue;
            }
            any_runnable = true;
            if p.period_runtime() >= slice_of(p.nice) {
                continue;
            }
            if chosen.is_none_or(|(_, best)| p.vruntime < best) {
                chosen = Some((index, p.vruntime));
            }
        }

        let Some((index, _)) = chosen else {
            drop(table);
            dispatcher.idle();
            return if any_runnable {
                ScheduleOutcome::Throttled
            } else {
                ScheduleOutcome::Idle
            };
        };

        assert!(total_weight > 0, "runnable process selected with zero total weight");
        let process = table.slot_mut(index);
        let pid = process.pid;
        let slice = slice_of(process.nice);
        process.state = ProcState::Running { cpu: cpu.id };
        process.on_cpu = Some(cpu.id);
        cpu.current = Some(pid);
        drop(table);

        #[cfg(feature = "detailed-logging")]
        log::trace!("cpu {}: dispatching {} with slice {}", cpu.id, pid, slice);

        dispatcher.switch_to(Dispatch {
            pid,
            slice,
            cpu: cpu.id,
        });

        cpu.current = None;
        let elapsed = self.now() - start;
        self.charge(index, pid, cpu.id, elapsed);

        ScheduleOutcome::Ran {
            pid,
            elapsed,
            slice,
        }
    }

    fn charge(&self, index: usize, pid: Pid, cpu: usize, elapsed: u64) {
        let mut table = self.table.lock();
        let process = table.slot_mut(index);
        assert!(
            process.pid == pid && process.on_cpu == Some(cpu),
            "process {} vanished while running on cpu {}",
            pid,
            cpu
        );
        assert!(
            !process.is_running(),
            "process {} still running after switching away from cpu {}",
            pid,
            cpu
        );

        process.on_cpu = None;
        process.runtime += elapsed;
        process.vruntime += elapsed * u64::from(NEUTRAL_WEIGHT) / u64::from(process.nice.weight());

        // A parent that found this process exiting waits for the core to let go of it.
        if process.state == ProcState::Zombie {
            if let Some(parent) = process.parent {
                table.wakeup(WaitChannel::Process(parent));
            }
        }
    }

    /// Gives up the CPU: `pid` goes from RUNNING back to RUNNABLE.
    ///
    /// # Panics
    ///
    /// Panics if `pid` is not running.
    pub fn yield_now(&self, pid: Pid) {
        let mut table = self.table.lock();
        let process = table
            .get_mut(pid)
            .filter(|p| p.is_running())
            .unwrap_or_else(|| panic!("yield by process {} that is not running", pid));
        process.state = ProcState::Runnable;
    }

    /// Puts the running process `pid` to sleep on `chan`.
    ///
    /// `guard` is whatever lock the caller holds to check its sleep condition; it is
    /// released only once the process table is locked, so a wakeup issued under the
    /// same lock cannot be missed.
    ///
    /// # Panics
    ///
    /// Panics if `pid` is not running.
    pub fn sleep<G>(&self, pid: Pid, chan: WaitChannel, guard: G) {
        let mut table = self.table.lock();
        drop(guard);
        let process = table
            .get_mut(pid)
            .filter(|p| p.is_running())
            .unwrap_or_else(|| panic!("sleep by process {} that is not running", pid));
        process.state = ProcState::Sleeping(chan);
    }

    /// Wakes every process sleeping on `chan`.
    pub fn wakeup(&self, chan: WaitChannel) {
        self.table.lock().wakeup(chan);
    }

    /// Marks `pid` as killed. A sleeping victim is made RUNNABLE so it notices at its
    /// next check.
    pub fn kill(&self, pid: Pid) -> Result<(), ProcError> {
        let mut table = self.table.lock();
        let process = table.get_mut(pid).ok_or(ProcError::NoSuchProcess)?;
        process.killed = true;
        if matches!(process.state, ProcState::Sleeping(_)) {
            process.state = ProcState::Runnable;
        }
        log::debug!("process {} killed", pid);
        Ok(())
    }

    /// Returns whether `pid` has been killed.
    pub fn is_killed(&self, pid: Pid) -> bool {
        self.table.lock().get(pid).is_some_and(|p| p.killed)
    }

    /// Returns the nice value of `pid`.
    pub fn get_nice(&self, pid: Pid) -> Result<i32, ProcError> {
        self.table
            .lock()
            .nice(pid)
            .map(Nice::get)
            .ok_or(ProcError::NoSuchProcess)
    }

    /// Sets the nice value of `pid`. Out-of-range values are rejected and leave the
    /// process unchanged.
    pub fn set_nice(&self, pid: Pid, value: i32) -> Result<(), ProcError> {
        let nice = Nice::new(value).ok_or(ProcError::InvalidNice)?;
        let mut table = self.table.lock();
        let process = table.get_mut(pid).ok_or(ProcError::NoSuchProcess)?;
        log::debug!("process {} nice {} -> {}", pid, process.nice, nice);
        process.nice = nice;
        Ok(())
    }

    /// Returns the state of `pid`.
    pub fn state(&self, pid: Pid) -> Option<ProcState> {
        self.table.lock().get(pid).map(|p| p.state)
    }

    /// Returns `(runtime, vruntime)` of `pid`.
    pub fn runtimes(&self, pid: Pid) -> Option<(u64, u64)> {
        self.table.lock().get(pid).map(|p| (p.runtime, p.vruntime))
    }

    /// Lists every live process, or only `pid` when given.
    pub fn ps(&self, pid: Option<Pid>) -> ProcessListing {
        let table = self.table.lock();
        let rows = table
            .iter()
            .filter(|p| p.state != ProcState::Unused)
            .filter(|p| pid.is_none_or(|pid| p.pid == pid))
            .map(|p| ProcessRow {
                name: p.name.clone(),
                pid: p.pid,
                state: p.state,
                nice: p.nice,
                runtime: p.runtime,
                vruntime: p.vruntime,
            })
            .collect();
        ProcessListing {
            now: self.now(),
            rows,
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("ticks", &self.ticks())
            .finish_non_exhaustive()
    }
}

/// One row of a process listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRow {
    pub name: String,
    pub pid: Pid,
    pub state: ProcState,
    pub nice: Nice,
    pub runtime: u64,
    pub vruntime: u64,
}

impl ProcessRow {
    /// Runtime divided by the process's weight.
    pub fn runtime_per_weight(&self) -> u64 {
        self.runtime / u64::from(self.nice.weight())
    }
}

/// A snapshot of the process table, printable in the `ps` layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessListing {
    /// Time of the snapshot, in scheduler units.
    pub now: u64,
    pub rows: Vec<ProcessRow>,
}

impl fmt::Display for ProcessListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rows.is_empty() {
            return Ok(());
        }
        writeln!(
            f,
            "name\tpid\tstate\t\tpriority\truntime/weight\truntime\tvruntime\ttick {}",
            self.now
        )?;
        for row in &self.rows {
            writeln!(
                f,
                "{}\t{}\t{:<8}\t{}\t\t{}\t\t{}\t{}",
                row.name,
                row.pid,
                row.state.name(),
                row.nice,
                row.runtime_per_weight(),
                row.runtime,
                row.vruntime
            )?;
        }
        Ok(())
    }
}

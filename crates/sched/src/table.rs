//! The process table: a fixed-capacity arena of process slots.
//!
//! Slots are scanned in index order everywhere, which makes every "first match" (and
//! every scheduling tie) resolve to the lowest slot index.

use alloc::vec::Vec;

use crate::{Nice, Pid, ProcState, Process, WaitChannel};

pub struct ProcessTable {
    slots: Vec<Process>,
    next_pid: u32,
    /// Scheduling period the per-process period bases were last reset for.
    pub(crate) period_epoch: Option<u64>,
}

impl ProcessTable {
    /// Creates a table with `capacity` unused slots.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Process::unused);
        Self {
            slots,
            next_pid: 1,
            period_epoch: None,
        }
    }

    /// Claims an unused slot, moving it to EMBRYO with a fresh pid. Returns the slot
    /// index, or `None` when the table is full.
    pub fn allocate(&mut self, name: &str) -> Option<usize> {
        let index = self
            .slots
            .iter()
            .position(|p| p.state == ProcState::Unused)?;
        let pid = Pid::new(self.next_pid);
        self.next_pid += 1;

        let slot = &mut self.slots[index];
        *slot = Process::unused();
        slot.pid = pid;
        slot.name.push_str(name);
        slot.state = ProcState::Embryo;
        Some(index)
    }

    /// Returns a slot to UNUSED, handing back the process that occupied it.
    pub fn free_slot(&mut self, index: usize) -> Process {
        core::mem::replace(&mut self.slots[index], Process::unused())
    }

    /// Returns the slot index of the live process `pid`.
    pub fn find(&self, pid: Pid) -> Option<usize> {
        self.slots
            .iter()
            .position(|p| p.state != ProcState::Unused && p.pid == pid)
    }

    /// Returns the live process `pid`.
    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.find(pid).map(|index| &self.slots[index])
    }

    /// Returns the live process `pid` mutably.
    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.find(pid).map(|index| &mut self.slots[index])
    }

    /// Returns the slot at `index`.
    pub fn slot(&self, index: usize) -> &Process {
        &self.slots[index]
    }

    /// Returns the slot at `index` mutably.
    pub fn slot_mut(&mut self, index: usize) -> &mut Process {
        &mut self.slots[index]
    }

    /// Iterates over every slot, unused ones included, in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.slots.iter()
    }

    /// Iterates mutably over every slot in index order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Process> {
        self.slots.iter_mut()
    }

    /// Makes every process sleeping on `chan` RUNNABLE. Returns how many woke.
    pub fn wakeup(&mut self, chan: WaitChannel) -> usize {
        let mut woken = 0;
        for p in self.slots.iter_mut() {
            if p.state == ProcState::Sleeping(chan) {
                p.state = ProcState::Runnable;
                woken += 1;
            }
        }
        woken
    }

    /// Returns the sum of the weights of every RUNNABLE process.
    pub fn runnable_weight(&self) -> u64 {
        self.slots
            .iter()
            .filter(|p| p.state == ProcState::Runnable)
            .map(|p| u64::from(p.nice.weight()))
            .sum()
    }

    /// Resets or fills in the per-period runtime bases.
    ///
    /// When `epoch` differs from the last one seen, every RUNNABLE process's base is
    /// reset to its current runtime and everything else loses its base. Within a
    /// period, processes that became RUNNABLE since the reset get a base on first sight.
    pub fn refresh_period(&mut self, epoch: u64) {
        let fresh = self.period_epoch != Some(epoch);
        if fresh {
            self.period_epoch = Some(epoch);
        }
        for p in self.slots.iter_mut() {
            if p.state == ProcState::Runnable {
                if fresh || p.period_base.is_none() {
                    p.period_base = Some(p.runtime);
                }
            } else if fresh {
                p.period_base = None;
            }
        }
    }

    /// Returns the number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the nice value of `pid`.
    pub fn nice(&self, pid: Pid) -> Option<Nice> {
        self.get(pid).map(|p| p.nice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_slot_with_fresh_pids() {
        let mut table = ProcessTable::new(3);
        assert_eq!(table.allocate("a"), Some(0));
        assert_eq!(table.allocate("b"), Some(1));
        table.free_slot(0);
        assert_eq!(table.allocate("c"), Some(0));
        assert_eq!(table.slot(0).pid, Pid::new(3));
        assert_eq!(table.slot(0).name, "c");
        assert_eq!(table.slot(0).state, ProcState::Embryo);
    }

    #[test]
    fn full_table() {
        let mut table = ProcessTable::new(1);
        table.allocate("a");
        assert_eq!(table.allocate("b"), None);
    }

    #[test]
    fn find_ignores_unused_slots() {
        let mut table = ProcessTable::new(2);
        let index = table.allocate("a").unwrap();
        let pid = table.slot(index).pid;
        assert_eq!(table.find(pid), Some(index));
        table.free_slot(index);
        assert_eq!(table.find(pid), None);
    }

    #[test]
    fn wakeup_only_touches_matching_channel() {
        let mut table = ProcessTable::new(3);
        for name in ["a", "b", "c"] {
            table.allocate(name);
        }
        table.slot_mut(0).state = ProcState::Sleeping(WaitChannel::Ticks);
        table.slot_mut(1).state = ProcState::Sleeping(WaitChannel::Address(0x10));
        table.slot_mut(2).state = ProcState::Sleeping(WaitChannel::Ticks);

        assert_eq!(table.wakeup(WaitChannel::Ticks), 2);
        assert_eq!(table.slot(0).state, ProcState::Runnable);
        assert_eq!(
            table.slot(1).state,
            ProcState::Sleeping(WaitChannel::Address(0x10))
        );
    }

    #[test]
    fn period_bases_reset_per_epoch() {
        let mut table = ProcessTable::new(2);
        table.allocate("a");
        table.allocate("b");
        table.slot_mut(0).state = ProcState::Runnable;
        table.slot_mut(0).runtime = 100;

        table.refresh_period(0);
        assert_eq!(table.slot(0).period_base, Some(100));
        assert_eq!(table.slot(1).period_base, None);

        table.slot_mut(0).runtime = 300;
        table.slot_mut(1).state = ProcState::Runnable;
        table.slot_mut(1).runtime = 50;
        table.refresh_period(0);
        assert_eq!(table.slot(0).period_runtime(), 200);
        assert_eq!(table.slot(1).period_base, Some(50));

        table.refresh_period(1);
        assert_eq!(table.slot(0).period_runtime(), 0);
    }
}

/// Process scheduling for the arena virtual machine
///
/// This module implements the process manager: the process table keyed by id,
/// per-bot ready queues and the round-robin discipline with a fixed quantum.
/// Terminated processes stay in the table so accounting survives them, but
/// they never appear in a ready queue.
use crate::error::{ArenaError, Result};
use crate::vm::process::{Process, ProcessId, ProcessState};
use log::debug;
use std::collections::{BTreeMap, VecDeque};

/// A scheduling slot handed out by `next`: which process runs and for at
/// most how many instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantum {
    pub pid: ProcessId,
    pub budget: u32,
}

/// Process table and ready queues
///
/// With `round_robin` enabled (the default) each bot has its own FIFO queue
/// and `next` rotates across bots, so a bot that forked many processes cannot
/// starve its opponents. Disabled, a single global FIFO is used.
#[derive(Debug)]
pub struct ProcessManager {
    /// All processes ever created, keyed by id
    table: BTreeMap<ProcessId, Process>,
    /// Bots in registration order; rotation order for round-robin
    bot_order: Vec<String>,
    /// Per-bot ready queues
    bot_queues: BTreeMap<String, VecDeque<ProcessId>>,
    /// Single ready queue used when round-robin is disabled
    global_queue: VecDeque<ProcessId>,
    round_robin: bool,
    /// Next bot to hand a slot to
    rotation: usize,
    /// Next process id to assign; ids start at 1, 0 means "unowned"
    next_id: ProcessId,
}

impl ProcessManager {
    /// Create an empty process manager
    pub fn new(round_robin: bool) -> Self {
        Self {
            table: BTreeMap::new(),
            bot_order: Vec::new(),
            bot_queues: BTreeMap::new(),
            global_queue: VecDeque::new(),
            round_robin,
            rotation: 0,
            next_id: 1,
        }
    }

    /// Create a new process for a bot and push it onto the ready queue
    pub fn create(
        &mut self,
        owner_bot: impl Into<String>,
        name: impl Into<String>,
        entry_pc: u16,
    ) -> Result<ProcessId> {
        let owner_bot = owner_bot.into();
        let id = self.allocate_id()?;
        let process = Process::new(id, owner_bot.clone(), name, entry_pc);
        debug!("created process {} for bot '{}' at {:04X}", id, owner_bot, entry_pc);
        self.register_bot(&owner_bot);
        self.table.insert(id, process);
        self.enqueue(id, &owner_bot);
        Ok(id)
    }

    /// Fork `parent` into a new ready process starting at `pc`
    pub fn fork(&mut self, parent: ProcessId, pc: u16, memory_size: usize) -> Result<ProcessId> {
        let id = self.allocate_id()?;
        let child = {
            let parent = self
                .table
                .get(&parent)
                .ok_or(ArenaError::UnknownProcess { pid: parent })?;
            parent.fork(id, pc, memory_size)
        };
        let owner = child.owner_bot.clone();
        debug!("process {} forked child {} at {:04X}", parent, id, pc);
        self.table.insert(id, child);
        self.enqueue(id, &owner);
        Ok(id)
    }

    /// Mark a process terminated and remove it from every queue
    ///
    /// Accounting (cycles, footprint) is preserved in the table.
    pub fn terminate(&mut self, pid: ProcessId) -> Result<()> {
        let process = self
            .table
            .get_mut(&pid)
            .ok_or(ArenaError::UnknownProcess { pid })?;
        process.terminate();
        self.remove_from_queues(pid);
        debug!("process {} terminated", pid);
        Ok(())
    }

    /// Dequeue the next ready process and yield it as running for up to
    /// `quantum` instructions
    pub fn next(&mut self, quantum: u32) -> Option<Quantum> {
        let pid = if self.round_robin {
            self.next_round_robin()
        } else {
            self.next_global()
        }?;
        if let Some(process) = self.table.get_mut(&pid) {
            process.state = ProcessState::Running;
        }
        Some(Quantum {
            pid,
            budget: quantum,
        })
    }

    /// Return a process to its ready queue after a quantum
    ///
    /// `still_ready` is false when the quantum ended in termination; nothing
    /// is re-queued then.
    pub fn reschedule(&mut self, pid: ProcessId, still_ready: bool) {
        let Some(process) = self.table.get_mut(&pid) else {
            return;
        };
        if process.state != ProcessState::Running {
            return;
        }
        if still_ready {
            process.state = ProcessState::Ready;
            let owner = process.owner_bot.clone();
            self.enqueue(pid, &owner);
        }
    }

    /// Take a process out of scheduling until `unblock`
    pub fn block(&mut self, pid: ProcessId) -> Result<()> {
        let process = self
            .table
            .get_mut(&pid)
            .ok_or(ArenaError::UnknownProcess { pid })?;
        if process.state == ProcessState::Terminated {
            return Ok(());
        }
        process.state = ProcessState::Blocked;
        self.remove_from_queues(pid);
        Ok(())
    }

    /// Return a blocked process to the back of its ready queue
    pub fn unblock(&mut self, pid: ProcessId) -> Result<()> {
        let process = self
            .table
            .get_mut(&pid)
            .ok_or(ArenaError::UnknownProcess { pid })?;
        if process.state != ProcessState::Blocked {
            return Ok(());
        }
        process.state = ProcessState::Ready;
        let owner = process.owner_bot.clone();
        self.enqueue(pid, &owner);
        Ok(())
    }

    /// Snapshot of the schedule order for one turn, without mutating queues
    ///
    /// Processes forked after the snapshot run no earlier than the next turn.
    pub fn turn_order(&self) -> Vec<ProcessId> {
        if !self.round_robin {
            return self
                .global_queue
                .iter()
                .copied()
                .filter(|pid| self.is_ready(*pid))
                .collect();
        }
        let mut cursors: Vec<VecDeque<ProcessId>> = self
            .bot_order
            .iter()
            .map(|bot| {
                self.bot_queues
                    .get(bot)
                    .map(|q| q.iter().copied().filter(|pid| self.is_ready(*pid)).collect())
                    .unwrap_or_default()
            })
            .collect();
        let mut order = Vec::new();
        let mut remaining: usize = cursors.iter().map(|q| q.len()).sum();
        let mut index = if cursors.is_empty() { 0 } else { self.rotation % cursors.len() };
        while remaining > 0 {
            if let Some(pid) = cursors[index].pop_front() {
                order.push(pid);
                remaining -= 1;
            }
            index = (index + 1) % cursors.len();
        }
        order
    }

    /// Whether a process is waiting in a ready queue
    pub fn is_ready(&self, pid: ProcessId) -> bool {
        self.table.get(&pid).is_some_and(|p| p.is_ready())
    }

    /// Move a ready process to Running outside of `next` (turn-driven mode)
    pub fn mark_running(&mut self, pid: ProcessId) -> Result<()> {
        let process = self
            .table
            .get_mut(&pid)
            .ok_or(ArenaError::UnknownProcess { pid })?;
        if process.state != ProcessState::Ready {
            return Err(ArenaError::UnknownProcess { pid });
        }
        process.state = ProcessState::Running;
        self.remove_from_queues(pid);
        Ok(())
    }

    /// Advance the bot rotation by one; the controller calls this once per
    /// turn so no bot permanently moves first
    pub fn rotate(&mut self) {
        if !self.bot_order.is_empty() {
            self.rotation = (self.rotation + 1) % self.bot_order.len();
        }
    }

    /// All processes in id order, terminated ones included
    pub fn list(&self) -> Vec<&Process> {
        self.table.values().collect()
    }

    /// Read-only view of one process
    pub fn info(&self, pid: ProcessId) -> Result<&Process> {
        self.table
            .get(&pid)
            .ok_or(ArenaError::UnknownProcess { pid })
    }

    /// Mutable access for the executor's step
    pub fn get_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        self.table.get_mut(&pid)
    }

    /// Count of non-terminated processes per bot
    pub fn count_alive_per_bot(&self) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for bot in &self.bot_order {
            counts.insert(bot.clone(), 0);
        }
        for process in self.table.values() {
            if process.is_alive() {
                *counts.entry(process.owner_bot.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Total cycles executed per bot, across dead and alive processes
    pub fn cycles_per_bot(&self) -> BTreeMap<String, u64> {
        let mut totals: BTreeMap<String, u64> = BTreeMap::new();
        for bot in &self.bot_order {
            totals.insert(bot.clone(), 0);
        }
        for process in self.table.values() {
            *totals.entry(process.owner_bot.clone()).or_insert(0) += process.cycles_used;
        }
        totals
    }

    /// First-created process id of a bot
    pub fn first_pid_of_bot(&self, bot: &str) -> Option<ProcessId> {
        self.table
            .values()
            .find(|p| p.owner_bot == bot)
            .map(|p| p.id)
    }

    /// Number of non-terminated processes
    pub fn alive_count(&self) -> usize {
        self.table.values().filter(|p| p.is_alive()).count()
    }

    /// Bots registered, in registration order
    pub fn bots(&self) -> &[String] {
        &self.bot_order
    }

    fn allocate_id(&mut self) -> Result<ProcessId> {
        if self.next_id == ProcessId::MAX {
            return Err(ArenaError::config("process id space exhausted"));
        }
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }

    fn register_bot(&mut self, bot: &str) {
        if !self.bot_order.iter().any(|b| b == bot) {
            self.bot_order.push(bot.to_string());
            self.bot_queues.insert(bot.to_string(), VecDeque::new());
        }
    }

    fn enqueue(&mut self, pid: ProcessId, bot: &str) {
        if self.round_robin {
            if let Some(queue) = self.bot_queues.get_mut(bot) {
                queue.push_back(pid);
            }
        } else {
            self.global_queue.push_back(pid);
        }
    }

    fn remove_from_queues(&mut self, pid: ProcessId) {
        self.global_queue.retain(|&p| p != pid);
        for queue in self.bot_queues.values_mut() {
            queue.retain(|&p| p != pid);
        }
    }

    fn next_round_robin(&mut self) -> Option<ProcessId> {
        let bots = self.bot_order.len();
        for _ in 0..bots {
            let bot = self.bot_order[self.rotation % bots].clone();
            self.rotation = (self.rotation + 1) % bots;
            if let Some(queue) = self.bot_queues.get_mut(&bot) {
                while let Some(pid) = queue.pop_front() {
                    if self.table.get(&pid).is_some_and(|p| p.is_ready()) {
                        return Some(pid);
                    }
                }
            }
        }
        None
    }

    fn next_global(&mut self) -> Option<ProcessId> {
        while let Some(pid) = self.global_queue.pop_front() {
            if self.table.get(&pid).is_some_and(|p| p.is_ready()) {
                return Some(pid);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotone_from_one() {
        let mut manager = ProcessManager::new(true);
        let a = manager.create("alpha", "alpha", 0).unwrap();
        let b = manager.create("beta", "beta", 100).unwrap();
        let c = manager.fork(a, 50, 65_536).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[test]
    fn test_round_robin_alternates_bots() {
        let mut manager = ProcessManager::new(true);
        let a = manager.create("alpha", "alpha", 0).unwrap();
        let b = manager.create("beta", "beta", 100).unwrap();
        let a2 = manager.fork(a, 10, 65_536).unwrap();

        let order = manager.turn_order();
        assert_eq!(order, vec![a, b, a2]);
    }

    #[test]
    fn test_next_hands_out_quantum_and_reschedule_requeues() {
        let mut manager = ProcessManager::new(true);
        let a = manager.create("alpha", "alpha", 0).unwrap();
        let b = manager.create("beta", "beta", 100).unwrap();

        let slot = manager.next(100).unwrap();
        assert_eq!(slot.pid, a);
        assert_eq!(slot.budget, 100);
        assert_eq!(manager.info(a).unwrap().state, ProcessState::Running);

        manager.reschedule(a, true);
        assert_eq!(manager.info(a).unwrap().state, ProcessState::Ready);

        // rotation means the other bot goes next
        let slot = manager.next(100).unwrap();
        assert_eq!(slot.pid, b);
        manager.reschedule(b, true);
    }

    #[test]
    fn test_terminated_process_leaves_queue_but_not_table() {
        let mut manager = ProcessManager::new(true);
        let a = manager.create("alpha", "alpha", 0).unwrap();
        manager.get_mut(a).unwrap().cycles_used = 42;
        manager.terminate(a).unwrap();

        assert!(manager.turn_order().is_empty());
        assert_eq!(manager.info(a).unwrap().state, ProcessState::Terminated);
        assert_eq!(manager.info(a).unwrap().cycles_used, 42);
        assert!(manager.next(10).is_none());
    }

    #[test]
    fn test_terminate_unknown_process() {
        let mut manager = ProcessManager::new(true);
        assert!(matches!(
            manager.terminate(77),
            Err(ArenaError::UnknownProcess { pid: 77 })
        ));
    }

    #[test]
    fn test_block_and_unblock() {
        let mut manager = ProcessManager::new(true);
        let a = manager.create("alpha", "alpha", 0).unwrap();
        manager.block(a).unwrap();
        assert_eq!(manager.info(a).unwrap().state, ProcessState::Blocked);
        assert!(manager.next(10).is_none());

        manager.unblock(a).unwrap();
        assert_eq!(manager.next(10).unwrap().pid, a);
    }

    #[test]
    fn test_alive_counts_per_bot() {
        let mut manager = ProcessManager::new(true);
        let a = manager.create("alpha", "alpha", 0).unwrap();
        manager.create("beta", "beta", 0).unwrap();
        manager.fork(a, 10, 65_536).unwrap();
        manager.terminate(a).unwrap();

        let counts = manager.count_alive_per_bot();
        assert_eq!(counts.get("alpha"), Some(&1));
        assert_eq!(counts.get("beta"), Some(&1));
    }

    #[test]
    fn test_first_pid_of_bot_survives_termination() {
        let mut manager = ProcessManager::new(true);
        let a = manager.create("alpha", "alpha", 0).unwrap();
        let a2 = manager.fork(a, 10, 65_536).unwrap();
        manager.terminate(a).unwrap();
        assert_eq!(manager.first_pid_of_bot("alpha"), Some(a));
        assert_ne!(manager.first_pid_of_bot("alpha"), Some(a2));
    }

    #[test]
    fn test_global_fifo_when_round_robin_disabled() {
        let mut manager = ProcessManager::new(false);
        let a = manager.create("alpha", "alpha", 0).unwrap();
        let b = manager.create("beta", "beta", 0).unwrap();
        let a2 = manager.fork(a, 10, 65_536).unwrap();

        // plain FIFO: creation order, no per-bot interleaving
        assert_eq!(manager.turn_order(), vec![a, b, a2]);
        assert_eq!(manager.next(5).unwrap().pid, a);
        assert_eq!(manager.next(5).unwrap().pid, b);
        assert_eq!(manager.next(5).unwrap().pid, a2);
    }

    #[test]
    fn test_fork_appends_to_ready_queue() {
        let mut manager = ProcessManager::new(true);
        let a = manager.create("alpha", "alpha", 0).unwrap();
        let child = manager.fork(a, 8, 65_536).unwrap();
        let process = manager.info(child).unwrap();
        assert_eq!(process.state, ProcessState::Ready);
        assert_eq!(process.parent, Some(a));
        assert!(manager.turn_order().contains(&child));
    }
}

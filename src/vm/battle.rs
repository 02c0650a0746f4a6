use crate::constants::{
    DEFAULT_CYCLES_PER_TURN, DEFAULT_MAX_MEMORY_PER_PROCESS, DEFAULT_MAX_TURNS,
    DEFAULT_MEMORY_SIZE, DEFAULT_MIN_SPACING, INSTRUCTION_SIZE, REGISTER_WINDOW,
};
/// Battle controller for the arena
///
/// This module implements the turn loop that coordinates memory, processes
/// and the execution unit into complete battles: quantum accounting, victory
/// detection, pause/resume/abort, reset, and the append-only event stream.
use crate::error::{ArenaError, Result};
use crate::vm::event::{BattleEvent, EventSink};
use crate::vm::executor::Executor;
use crate::vm::memory::Memory;
use crate::vm::process::{ProcessId, ProcessState};
use crate::vm::scheduler::ProcessManager;
use crate::vm::Bot;
use crate::{Assembler, BotImage};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

/// Placement retries before giving up with `NoFreeRegion`
const MAX_PLACEMENT_ATTEMPTS: usize = 256;

/// Battle configuration
#[derive(Debug, Clone, Copy)]
pub struct BattleConfig {
    /// Size of the shared circular memory in bytes
    pub memory_size: usize,
    /// Turn count after which the timeout rules decide the battle
    pub max_turns: u64,
    /// Instruction quantum per process per turn
    pub cycles_per_turn: u32,
    /// Owned-cell quota per process
    pub max_memory_per_process: u32,
    /// Minimum gap enforced between loaded images
    pub min_spacing: usize,
    /// Per-bot round-robin scheduling (a single FIFO when disabled)
    pub round_robin: bool,
    /// Randomize the initial PC within the first N instruction slots of the
    /// entry segment (0 disables)
    pub random_pc_window: u32,
    /// Seed for all randomness in the battle; identical seeds give
    /// byte-identical event streams
    pub seed: u64,
}

impl Default for BattleConfig {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_MEMORY_SIZE,
            max_turns: DEFAULT_MAX_TURNS,
            cycles_per_turn: DEFAULT_CYCLES_PER_TURN,
            max_memory_per_process: DEFAULT_MAX_MEMORY_PER_PROCESS,
            min_spacing: DEFAULT_MIN_SPACING,
            round_robin: true,
            random_pc_window: 0,
            seed: 0,
        }
    }
}

impl BattleConfig {
    /// Reject configurations the core cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.memory_size < 256 {
            return Err(ArenaError::config("memory_size must be at least 256"));
        }
        if self.min_spacing >= self.memory_size {
            return Err(ArenaError::config("min_spacing must be below memory_size"));
        }
        if self.cycles_per_turn == 0 {
            return Err(ArenaError::config("cycles_per_turn must be nonzero"));
        }
        if self.max_turns == 0 {
            return Err(ArenaError::config("max_turns must be nonzero"));
        }
        if (self.max_memory_per_process as usize) < INSTRUCTION_SIZE {
            return Err(ArenaError::config(
                "max_memory_per_process cannot be below one instruction",
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a battle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BattleStatus {
    Pending,
    Running,
    Paused,
    Completed,
}

/// Read-only snapshot of one process for hosts
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    pub id: ProcessId,
    pub owner_bot: String,
    pub pc: u16,
    pub state: ProcessState,
    pub cycles_used: u64,
    pub memory_footprint: u32,
    pub parent: Option<ProcessId>,
}

/// Read-only snapshot of the whole battle
#[derive(Debug, Clone)]
pub struct BattleState {
    pub id: u64,
    pub turn: u64,
    pub status: BattleStatus,
    pub winner: Option<ProcessId>,
    pub processes: Vec<ProcessSnapshot>,
    pub alive_per_bot: BTreeMap<String, usize>,
}

/// Per-bot accounting summary
#[derive(Debug, Clone)]
pub struct BotStats {
    pub name: String,
    pub alive_processes: usize,
    pub total_cycles: u64,
}

/// Battle accounting summary
#[derive(Debug, Clone)]
pub struct BattleStats {
    pub turn: u64,
    pub status: BattleStatus,
    pub winner: Option<ProcessId>,
    pub alive_processes: usize,
    pub per_bot: Vec<BotStats>,
    pub events: usize,
}

/// The battle: top-level owned object coordinating all core components
///
/// The controller is the only executor; everything below it runs
/// synchronously, so the memory, process table and event log need no locks.
pub struct BattleController {
    id: u64,
    config: BattleConfig,
    memory: Memory,
    manager: ProcessManager,
    executor: Executor,
    rng: StdRng,
    bots: Vec<Bot>,
    turn: u64,
    status: BattleStatus,
    winner: Option<ProcessId>,
    abort_requested: bool,
    events: Vec<BattleEvent>,
    sinks: Vec<Box<dyn EventSink>>,
}

impl BattleController {
    /// Create a new battle with the given id and configuration
    pub fn new(id: u64, config: BattleConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            id,
            config,
            memory: Memory::new(config.memory_size),
            manager: ProcessManager::new(config.round_robin),
            executor: Executor::new(config.max_memory_per_process),
            rng: StdRng::seed_from_u64(config.seed),
            bots: Vec::new(),
            turn: 0,
            status: BattleStatus::Pending,
            winner: None,
            abort_requested: false,
            events: Vec::new(),
            sinks: Vec::new(),
        })
    }

    /// Load an assembled image: pick a random base, apply relocations, copy
    /// the code, mark ownership and create the bot's initial process
    pub fn load_image(&mut self, image: BotImage) -> Result<ProcessId> {
        if self.status != BattleStatus::Pending {
            return Err(ArenaError::AlreadyRunning);
        }
        let size = image.code.len();
        if size as u32 > self.config.max_memory_per_process {
            return Err(ArenaError::ImageTooLarge {
                name: image.name.clone(),
                size,
                quota: self.config.max_memory_per_process as usize,
            });
        }

        let bot_name = image.name.clone();
        if self.bots.iter().any(|bot| bot.name == bot_name) {
            return Err(ArenaError::config(format!(
                "duplicate bot name '{}'",
                bot_name
            )));
        }

        let base = self.pick_base(size)?;
        let code = Assembler::relocate(&image, base);
        let entry_pc = self.entry_pc(&image, base);

        let pid = self.manager.create(&bot_name, &bot_name, entry_pc)?;
        if let Err(error) = self.memory.load_bytes(base as usize, &code, pid) {
            let _ = self.manager.terminate(pid);
            return Err(error);
        }

        info!(
            "loaded bot '{}' at {:04X} ({} bytes), entry {:04X}",
            bot_name, base, size, entry_pc
        );
        self.bots.push(Bot {
            id: self.bots.len(),
            name: bot_name.clone(),
            image,
            base,
            entry_pc,
            initial_pid: pid,
        });
        let parent = None;
        self.emit(BattleEvent::ProcessCreated {
            turn: self.turn,
            cycle: 0,
            pid,
            owner_bot: bot_name,
            pc: entry_pc,
            parent,
        });
        Ok(pid)
    }

    /// Start running turns
    pub fn start(&mut self) -> Result<()> {
        match self.status {
            BattleStatus::Pending => {
                if self.bots.is_empty() {
                    return Err(ArenaError::not_initialized("no bots loaded"));
                }
                self.status = BattleStatus::Running;
                info!("battle {} started with {} bots", self.id, self.bots.len());
                Ok(())
            }
            BattleStatus::Paused => {
                self.status = BattleStatus::Running;
                Ok(())
            }
            _ => Err(ArenaError::AlreadyRunning),
        }
    }

    /// Run a single turn
    ///
    /// Returns `Ok(true)` while the battle should continue; a paused battle
    /// idles without consuming turns.
    pub fn run_turn(&mut self) -> Result<bool> {
        match self.status {
            BattleStatus::Pending => {
                return Err(ArenaError::not_initialized("battle not started"))
            }
            BattleStatus::Paused => return Ok(true),
            BattleStatus::Completed => return Ok(false),
            BattleStatus::Running => {}
        }
        if self.abort_requested {
            self.complete(None);
            return Ok(false);
        }

        let order = self.manager.turn_order();
        let mut cycle: u32 = 0;

        'turn: for pid in order {
            if !self.manager.is_ready(pid) {
                continue;
            }
            self.manager.mark_running(pid)?;
            let mut still_ready = true;

            for _ in 0..self.config.cycles_per_turn {
                if self.abort_requested {
                    self.manager.reschedule(pid, still_ready);
                    break 'turn;
                }
                let Some(process) = self.manager.get_mut(pid) else {
                    break;
                };
                let outcome = self.executor.step(&mut self.memory, process);
                cycle += 1;

                for write in &outcome.writes {
                    let event = BattleEvent::MemoryWrite {
                        turn: self.turn,
                        cycle,
                        pid,
                        address: write.address,
                        value: write.value,
                    };
                    self.emit(event);
                }
                self.emit(BattleEvent::InstructionExecuted {
                    turn: self.turn,
                    cycle,
                    pid,
                    pc_before: outcome.pc_before,
                    instruction: outcome.instruction,
                    pc_after: outcome.pc_after,
                    flags: outcome.flags,
                    memory_writes: outcome.writes.clone(),
                });

                if let Some(child_pc) = outcome.fork_pc {
                    let child = self
                        .manager
                        .fork(pid, child_pc, self.config.memory_size)?;
                    let owner = self.manager.info(child)?.owner_bot.clone();
                    self.emit(BattleEvent::ProcessCreated {
                        turn: self.turn,
                        cycle,
                        pid: child,
                        owner_bot: owner,
                        pc: child_pc,
                        parent: Some(pid),
                    });
                }

                if let Some((kind, address)) = outcome.violation {
                    self.emit(BattleEvent::AccessViolation {
                        turn: self.turn,
                        cycle,
                        pid,
                        kind,
                        address,
                    });
                }

                if let Some(reason) = outcome.terminated {
                    self.manager.terminate(pid)?;
                    self.emit(BattleEvent::ProcessTerminated {
                        turn: self.turn,
                        cycle,
                        pid,
                        reason,
                    });
                    debug!("process {} left the battle: {:?}", pid, reason);
                    still_ready = false;
                    break;
                }
            }
            self.manager.reschedule(pid, still_ready);
        }

        self.turn += 1;
        self.manager.rotate();
        self.emit(BattleEvent::TurnCompleted {
            turn: self.turn,
            alive: self.manager.alive_count(),
        });

        if self.abort_requested {
            self.complete(None);
            return Ok(false);
        }

        let alive_bots = self.alive_bot_count();
        if alive_bots <= 1 || self.turn >= self.config.max_turns {
            let winner = self.decide_winner();
            self.complete(winner);
            return Ok(false);
        }
        Ok(true)
    }

    /// Run up to `n` turns, stopping early on completion
    pub fn run_turns(&mut self, n: u64) -> Result<BattleStatus> {
        for _ in 0..n {
            if !self.run_turn()? {
                break;
            }
            if self.status == BattleStatus::Paused {
                break;
            }
        }
        Ok(self.status)
    }

    /// Run until the battle completes; starts it if still pending
    pub fn run_to_completion(&mut self) -> Result<Option<ProcessId>> {
        if self.status == BattleStatus::Pending {
            self.start()?;
        }
        while self.run_turn()? {
            if self.status == BattleStatus::Paused {
                break;
            }
        }
        Ok(self.winner)
    }

    /// Suspend turn processing without losing state
    pub fn pause(&mut self) {
        if self.status == BattleStatus::Running {
            self.status = BattleStatus::Paused;
            info!("battle {} paused at turn {}", self.id, self.turn);
        }
    }

    /// Resume a paused battle
    pub fn resume(&mut self) {
        if self.status == BattleStatus::Paused {
            self.status = BattleStatus::Running;
            info!("battle {} resumed at turn {}", self.id, self.turn);
        }
    }

    /// Request completion with no winner at the next boundary
    pub fn abort(&mut self) {
        self.abort_requested = true;
        if self.status != BattleStatus::Running {
            self.complete(None);
        }
    }

    /// Reinitialize the battle: clear memory, rebuild the process table and
    /// place the same bots at freshly randomized bases
    ///
    /// The RNG stream continues from its current state, so a reset battle is
    /// still a pure function of the original seed.
    pub fn reset(&mut self, preserve_access_log: bool) -> Result<()> {
        self.memory.clear();
        if !preserve_access_log {
            self.memory.clear_access_log();
        }
        self.manager = ProcessManager::new(self.config.round_robin);
        self.turn = 0;
        self.status = BattleStatus::Pending;
        self.winner = None;
        self.abort_requested = false;
        self.events.clear();

        let images: Vec<BotImage> = self.bots.drain(..).map(|bot| bot.image).collect();
        for image in images {
            self.load_image(image)?;
        }
        info!("battle {} reset with {} bots", self.id, self.bots.len());
        Ok(())
    }

    /// Register an observer for future events
    pub fn subscribe(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }

    /// The full event stream so far
    pub fn events(&self) -> &[BattleEvent] {
        &self.events
    }

    /// Snapshot for hosts
    pub fn snapshot(&self) -> BattleState {
        BattleState {
            id: self.id,
            turn: self.turn,
            status: self.status,
            winner: self.winner,
            processes: self
                .manager
                .list()
                .into_iter()
                .map(|p| ProcessSnapshot {
                    id: p.id,
                    owner_bot: p.owner_bot.clone(),
                    pc: p.pc,
                    state: p.state,
                    cycles_used: p.cycles_used,
                    memory_footprint: p.memory_footprint,
                    parent: p.parent,
                })
                .collect(),
            alive_per_bot: self.manager.count_alive_per_bot(),
        }
    }

    /// Accounting summary
    pub fn stats(&self) -> BattleStats {
        let alive = self.manager.count_alive_per_bot();
        let cycles = self.manager.cycles_per_bot();
        let per_bot = self
            .manager
            .bots()
            .iter()
            .map(|name| BotStats {
                name: name.clone(),
                alive_processes: alive.get(name).copied().unwrap_or(0),
                total_cycles: cycles.get(name).copied().unwrap_or(0),
            })
            .collect();
        BattleStats {
            turn: self.turn,
            status: self.status,
            winner: self.winner,
            alive_processes: self.manager.alive_count(),
            per_bot,
            events: self.events.len(),
        }
    }

    /// Battle id
    pub fn battle_id(&self) -> u64 {
        self.id
    }

    /// Current turn counter
    pub fn turn(&self) -> u64 {
        self.turn
    }

    /// Current status
    pub fn status(&self) -> BattleStatus {
        self.status
    }

    /// The winning process, if the battle is decided
    pub fn winner(&self) -> Option<ProcessId> {
        self.winner
    }

    /// Loaded bots, in load order
    pub fn bots(&self) -> &[Bot] {
        &self.bots
    }

    /// The shared memory (for hosts and diagnostics)
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Mutable memory access for hosts that protect or allocate regions
    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    /// The process manager (for hosts and diagnostics)
    pub fn manager(&self) -> &ProcessManager {
        &self.manager
    }

    fn emit(&mut self, event: BattleEvent) {
        for sink in &mut self.sinks {
            sink.on_event(&event);
        }
        self.events.push(event);
    }

    fn complete(&mut self, winner: Option<ProcessId>) {
        if self.status == BattleStatus::Completed {
            return;
        }
        self.status = BattleStatus::Completed;
        self.winner = winner;
        self.emit(BattleEvent::BattleEnded {
            turn: self.turn,
            winner,
        });
        match winner {
            Some(pid) => info!("battle {} ended at turn {}: process {} wins", self.id, self.turn, pid),
            None => info!("battle {} ended at turn {} with no winner", self.id, self.turn),
        }
    }

    fn alive_bot_count(&self) -> usize {
        self.manager
            .count_alive_per_bot()
            .values()
            .filter(|&&count| count > 0)
            .count()
    }

    /// Victory rules: the last bot with a live process wins; on timeout the
    /// alive bot with the most executed cycles wins and an exact tie is a
    /// draw. The reported winner is the bot's first-created process.
    fn decide_winner(&self) -> Option<ProcessId> {
        let counts = self.manager.count_alive_per_bot();
        let alive: Vec<&String> = counts
            .iter()
            .filter(|&(_, &count)| count > 0)
            .map(|(bot, _)| bot)
            .collect();
        match alive.len() {
            0 => None,
            1 => self.manager.first_pid_of_bot(alive[0]),
            _ => {
                let cycles = self.manager.cycles_per_bot();
                let best = alive
                    .iter()
                    .map(|bot| cycles.get(*bot).copied().unwrap_or(0))
                    .max()
                    .unwrap_or(0);
                let top: Vec<&String> = alive
                    .iter()
                    .filter(|bot| cycles.get(**bot).copied().unwrap_or(0) == best)
                    .map(|bot| *bot)
                    .collect();
                if top.len() == 1 {
                    self.manager.first_pid_of_bot(top[0])
                } else {
                    None
                }
            }
        }
    }

    fn pick_base(&mut self, size: usize) -> Result<u16> {
        let memory_size = self.config.memory_size;
        if size == 0 || REGISTER_WINDOW + size >= memory_size {
            return Err(ArenaError::NoFreeRegion {
                size,
                spacing: self.config.min_spacing,
            });
        }
        let spacing = self.config.min_spacing;
        let placed: Vec<(usize, usize)> = self
            .bots
            .iter()
            .map(|bot| (bot.base as usize, bot.image.code.len()))
            .collect();

        for _ in 0..MAX_PLACEMENT_ATTEMPTS {
            let candidate = self.rng.gen_range(REGISTER_WINDOW..memory_size - size);
            let fits = placed.iter().all(|&(base, len)| {
                let gap = if candidate >= base + len {
                    candidate - (base + len)
                } else if base >= candidate + size {
                    base - (candidate + size)
                } else {
                    return false;
                };
                gap >= spacing
            });
            if fits {
                return Ok(candidate as u16);
            }
        }
        Err(ArenaError::NoFreeRegion {
            size,
            spacing,
        })
    }

    fn entry_pc(&mut self, image: &BotImage, base: u16) -> u16 {
        let mut entry = image.entry_offset as usize;
        if self.config.random_pc_window > 0 {
            let slots = self.rng.gen_range(0..self.config.random_pc_window) as usize;
            let candidate = entry + slots * INSTRUCTION_SIZE;
            if candidate < image.code.len() {
                entry = candidate;
            }
        }
        ((base as usize + entry) % self.config.memory_size) as u16
    }
}

/// Process management for the arena virtual machine
///
/// This module implements the Process data structure that represents an
/// executing thread of a bot, including its register file, flags and the
/// bounded call stack.
use crate::constants::{MAX_STACK_DEPTH, NUM_GENERAL_REGISTERS, SP_INDEX};
use crate::error::{ArenaError, Result};

/// Process identifier; ids are assigned monotonically starting at 1,
/// with 0 reserved for "unowned" in the memory ownership array
pub type ProcessId = u16;

/// CPU condition flags, updated by arithmetic and logic instructions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// Result was zero
    pub zero: bool,
    /// Result had its sign bit set
    pub sign: bool,
    /// Signed overflow occurred
    pub overflow: bool,
    /// Unsigned carry or borrow occurred
    pub carry: bool,
}

impl Flags {
    /// Update zero and sign from a 16-bit result, leaving carry and
    /// overflow untouched
    pub fn set_zero_sign(&mut self, value: u16) {
        self.zero = value == 0;
        self.sign = value & 0x8000 != 0;
    }
}

/// The register file of a process: twelve named general registers
/// (r0-r7, ax, bx, cx, dx) plus the flags register
///
/// The program counter and the stack live directly on `Process`; the stack
/// pointer is the current stack depth.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterFile {
    general: [u16; NUM_GENERAL_REGISTERS],
    pub flags: Flags,
}

impl RegisterFile {
    /// Read a general register by index
    pub fn get(&self, index: usize) -> Result<u16> {
        self.general
            .get(index)
            .copied()
            .ok_or(ArenaError::InvalidRegister {
                line: 0,
                name: format!("r{}", index),
            })
    }

    /// Write a general register by index
    pub fn set(&mut self, index: usize, value: u16) -> Result<()> {
        match self.general.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(ArenaError::InvalidRegister {
                line: 0,
                name: format!("r{}", index),
            }),
        }
    }
}

/// Why a process left the battle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Executed `hlt`
    Halted,
    /// Executed `dat`
    DataExecuted,
    /// Wrote into a protected cell
    AccessViolation,
    /// Unexecutable instruction encoding
    InvalidOpcode,
    /// Division by zero
    DivideByZero,
    /// Call stack exceeded its bound
    StackOverflow,
    /// Return on an empty stack
    StackUnderflow,
    /// Owned-cell quota exceeded
    QuotaExceeded,
    /// Host aborted the battle
    Aborted,
}

/// Scheduling state of a process
///
/// Transitions form a DAG with `Terminated` absorbing: Ready <-> Running,
/// Ready <-> Blocked, and any state -> Terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Blocked,
    Terminated,
}

/// A process in the arena virtual machine
///
/// Each process is an independently scheduled execution context with its own
/// register file, program counter and call stack. Processes are created when
/// a bot is loaded and forked by the `spl` instruction.
#[derive(Debug, Clone)]
pub struct Process {
    /// Process id (unique, monotone from 1)
    pub id: ProcessId,
    /// Name of the bot this process belongs to
    pub owner_bot: String,
    /// Human-readable process name
    pub name: String,
    /// Program counter
    pub pc: u16,
    /// General registers and flags
    pub regs: RegisterFile,
    /// Bounded call stack of return addresses
    stack: Vec<u16>,
    /// Scheduling state
    pub state: ProcessState,
    /// Instructions executed so far
    pub cycles_used: u64,
    /// Cells owned in shared memory, sampled after each instruction
    pub memory_footprint: u32,
    /// Process that forked this one, if any
    pub parent: Option<ProcessId>,
}

impl Process {
    /// Create a new process in the `Ready` state
    pub fn new(id: ProcessId, owner_bot: impl Into<String>, name: impl Into<String>, pc: u16) -> Self {
        Self {
            id,
            owner_bot: owner_bot.into(),
            name: name.into(),
            pc,
            regs: RegisterFile::default(),
            stack: Vec::new(),
            state: ProcessState::Ready,
            cycles_used: 0,
            memory_footprint: 0,
            parent: None,
        }
    }

    /// Read through the register window: 0-11 are the general registers,
    /// 12 is the stack depth, 13-15 read as zero
    pub fn window_read(&self, index: usize) -> u16 {
        if index < NUM_GENERAL_REGISTERS {
            self.regs.general[index]
        } else if index == SP_INDEX {
            self.stack.len() as u16
        } else {
            0
        }
    }

    /// Write through the register window; the stack pointer and the
    /// reserved slots ignore writes
    pub fn window_write(&mut self, index: usize, value: u16) {
        if index < NUM_GENERAL_REGISTERS {
            self.regs.general[index] = value;
        }
    }

    /// Push a return address; fails with `StackOverflow` at the bound
    pub fn push(&mut self, address: u16) -> Result<()> {
        if self.stack.len() >= MAX_STACK_DEPTH {
            return Err(ArenaError::StackOverflow {
                depth: self.stack.len(),
            });
        }
        self.stack.push(address);
        Ok(())
    }

    /// Pop a return address; fails with `StackUnderflow` when empty
    pub fn pop(&mut self) -> Result<u16> {
        self.stack.pop().ok_or(ArenaError::StackUnderflow)
    }

    /// Current stack depth (the stack pointer)
    pub fn sp(&self) -> usize {
        self.stack.len()
    }

    /// Set the program counter, wrapped to the memory size
    pub fn set_pc(&mut self, address: u16, memory_size: usize) {
        self.pc = (address as usize % memory_size) as u16;
    }

    /// Advance the program counter by `offset` bytes, wrapping
    pub fn advance_pc(&mut self, offset: i32, memory_size: usize) {
        let m = memory_size as i64;
        let pc = (self.pc as i64 + offset as i64).rem_euclid(m);
        self.pc = pc as u16;
    }

    /// Whether the process can still be scheduled
    pub fn is_alive(&self) -> bool {
        self.state != ProcessState::Terminated
    }

    /// Whether the process is waiting in a ready queue
    pub fn is_ready(&self) -> bool {
        self.state == ProcessState::Ready
    }

    /// Move to `Terminated`; absorbing, later transitions are ignored
    pub fn terminate(&mut self) {
        self.state = ProcessState::Terminated;
    }

    /// Create a fork of this process starting at `pc`
    ///
    /// The child copies the parent's register file and flags but starts with
    /// an empty call stack and fresh accounting.
    pub fn fork(&self, new_id: ProcessId, pc: u16, memory_size: usize) -> Self {
        Self {
            id: new_id,
            owner_bot: self.owner_bot.clone(),
            name: format!("{}+{}", self.name, new_id),
            pc: (pc as usize % memory_size) as u16,
            regs: self.regs.clone(),
            stack: Vec::new(),
            state: ProcessState::Ready,
            cycles_used: 0,
            memory_footprint: 0,
            parent: Some(self.id),
        }
    }

    /// One-line state summary for diagnostics
    pub fn debug_state(&self) -> String {
        format!(
            "Process {} ({}): PC={:04X}, state={:?}, cycles={}, sp={}",
            self.id,
            self.owner_bot,
            self.pc,
            self.state,
            self.cycles_used,
            self.sp()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_creation() {
        let process = Process::new(1, "imp", "imp", 0x100);
        assert_eq!(process.id, 1);
        assert_eq!(process.owner_bot, "imp");
        assert_eq!(process.pc, 0x100);
        assert_eq!(process.state, ProcessState::Ready);
        assert_eq!(process.cycles_used, 0);
        assert_eq!(process.parent, None);
    }

    #[test]
    fn test_register_window() {
        let mut process = Process::new(1, "bot", "bot", 0);
        process.window_write(0, 42);
        assert_eq!(process.window_read(0), 42);

        process.window_write(11, 0xFFFF); // dx
        assert_eq!(process.window_read(11), 0xFFFF);

        // sp reflects stack depth and ignores writes
        assert_eq!(process.window_read(12), 0);
        process.push(0x10).unwrap();
        assert_eq!(process.window_read(12), 1);
        process.window_write(12, 99);
        assert_eq!(process.window_read(12), 1);

        // reserved slots read as zero
        assert_eq!(process.window_read(15), 0);
        process.window_write(15, 7);
        assert_eq!(process.window_read(15), 0);
    }

    #[test]
    fn test_stack_bounds() {
        let mut process = Process::new(1, "bot", "bot", 0);
        assert!(matches!(process.pop(), Err(ArenaError::StackUnderflow)));

        for i in 0..MAX_STACK_DEPTH {
            process.push(i as u16).unwrap();
        }
        assert!(matches!(
            process.push(0),
            Err(ArenaError::StackOverflow { .. })
        ));
        assert_eq!(process.pop().unwrap(), (MAX_STACK_DEPTH - 1) as u16);
    }

    #[test]
    fn test_pc_wrapping() {
        let mut process = Process::new(1, "bot", "bot", 100);
        process.advance_pc(50, 1000);
        assert_eq!(process.pc, 150);

        process.advance_pc(-200, 1000);
        assert_eq!(process.pc, 950);

        process.set_pc(1500, 1000);
        assert_eq!(process.pc, 500);
    }

    #[test]
    fn test_fork_copies_registers_not_stack() {
        let mut parent = Process::new(1, "bot", "bot", 100);
        parent.window_write(3, 0xABCD);
        parent.regs.flags.zero = true;
        parent.push(0x55).unwrap();

        let child = parent.fork(2, 200, 65_536);
        assert_eq!(child.id, 2);
        assert_eq!(child.owner_bot, "bot");
        assert_eq!(child.pc, 200);
        assert_eq!(child.window_read(3), 0xABCD);
        assert!(child.regs.flags.zero);
        assert_eq!(child.sp(), 0);
        assert_eq!(child.parent, Some(1));
        assert_eq!(child.cycles_used, 0);
    }

    #[test]
    fn test_termination_is_absorbing() {
        let mut process = Process::new(1, "bot", "bot", 0);
        assert!(process.is_ready());
        process.terminate();
        assert!(!process.is_alive());
        assert!(!process.is_ready());
    }

    #[test]
    fn test_flags_zero_sign() {
        let mut flags = Flags::default();
        flags.carry = true;
        flags.set_zero_sign(0);
        assert!(flags.zero);
        assert!(!flags.sign);
        assert!(flags.carry); // untouched

        flags.set_zero_sign(0x8001);
        assert!(!flags.zero);
        assert!(flags.sign);
    }
}

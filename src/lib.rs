pub mod assembler;
pub mod error;
/// Battle core of a Core Wars style arena
///
/// This library implements a deterministic virtual machine that hosts two or
/// more assembly programs ("bots") competing inside a single shared circular
/// memory.
///
/// # Architecture
///
/// The library is organized into several modules:
/// - `vm`: circular memory, instruction decode/execute, processes, scheduling
///   and the battle controller
/// - `assembler`: two-pass assembler from arena assembly source to relocatable
///   bot images, plus the matching disassembler
/// - `error`: common error types used throughout the system
pub mod vm;

/// Arena constants
pub mod constants {
    /// Default memory size in bytes (64KB)
    pub const DEFAULT_MEMORY_SIZE: usize = 65_536;

    /// Default maximum number of turns before the timeout rules apply
    pub const DEFAULT_MAX_TURNS: u64 = 10_000;

    /// Default instruction quantum per process per turn
    pub const DEFAULT_CYCLES_PER_TURN: u32 = 100;

    /// Default per-process owned-cell quota
    pub const DEFAULT_MAX_MEMORY_PER_PROCESS: u32 = 8_192;

    /// Default minimum gap between loaded bot images
    pub const DEFAULT_MIN_SPACING: usize = 128;

    /// Encoded instruction size: 1 header byte plus two operand words
    pub const INSTRUCTION_SIZE: usize = 5;

    /// Operand word size in bytes (little-endian)
    pub const WORD_SIZE: usize = 2;

    /// Effective addresses below this value address the running process's
    /// register file instead of shared memory
    pub const REGISTER_WINDOW: usize = 16;

    /// Number of named general registers (r0-r7, ax, bx, cx, dx)
    pub const NUM_GENERAL_REGISTERS: usize = 12;

    /// Window index of the stack pointer
    pub const SP_INDEX: usize = 12;

    /// Maximum call-stack depth per process
    pub const MAX_STACK_DEPTH: usize = 256;
}

pub use assembler::{Assembler, BotImage, Relocation, RelocationKind};
pub use error::{ArenaError, Result};
/// Re-export commonly used types for convenience
pub use vm::{
    BattleConfig, BattleController, BattleEvent, BattleStatus, BattleSystem, Memory, Process,
    ProcessId, ProcessManager,
};

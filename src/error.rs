/// Error types for the arena battle core
///
/// This module defines all error types used throughout the system, following
/// Rust best practices with `thiserror` for ergonomic error handling. The
/// taxonomy mirrors how errors propagate: assembly and load errors abort
/// loading a bot, runtime errors terminate a single process, and control
/// errors are surfaced to the host.
use crate::vm::memory::{MemoryOp, ViolationKind};
use crate::vm::ProcessId;
use thiserror::Error;

/// Common result type used throughout the arena
pub type Result<T> = std::result::Result<T, ArenaError>;

/// Arena error types
#[derive(Error, Debug)]
pub enum ArenaError {
    // --- assembly errors (fatal for the bot being assembled) ---
    /// Lexical error with the originating source line
    #[error("lex error at line {line}: {message}")]
    Lex { line: usize, message: String },

    /// Malformed immediate literal
    #[error("invalid immediate at line {line}: '{literal}'")]
    InvalidImmediate { line: usize, literal: String },

    /// Register-shaped identifier outside the register set
    #[error("invalid register at line {line}: '{name}'")]
    InvalidRegister { line: usize, name: String },

    /// Operand that does not fit the instruction
    #[error("invalid operand at line {line}: {message}")]
    InvalidOperand { line: usize, message: String },

    /// Label defined more than once
    #[error("duplicate label '{label}' at line {line}")]
    DuplicateLabel { label: String, line: usize },

    /// Reference to a symbol with no definition
    #[error("undefined symbol '{symbol}' at line {line}")]
    UndefinedSymbol { symbol: String, line: usize },

    /// Numeric literal outside the representable range
    #[error("literal out of range at line {line}: '{literal}'")]
    OutOfRangeLiteral { line: usize, literal: String },

    /// Unknown or misused directive
    #[error("invalid directive '{directive}' at line {line}")]
    InvalidDirective { directive: String, line: usize },

    // --- load errors (fatal for the bot being loaded) ---
    /// Image exceeds the per-process memory quota
    #[error("image '{name}' is {size} bytes, exceeding the {quota}-byte quota")]
    ImageTooLarge {
        name: String,
        size: usize,
        quota: usize,
    },

    /// No placement satisfies the spacing constraint
    #[error("no free region of {size} bytes with spacing {spacing}")]
    NoFreeRegion { size: usize, spacing: usize },

    // --- runtime errors (terminate the offending process only) ---
    /// Memory access violation, also recorded in the memory access log
    #[error("{kind} violation at address {address:#06x} during {operation}")]
    AccessViolation {
        kind: ViolationKind,
        address: usize,
        operation: MemoryOp,
    },

    /// Unexecutable instruction encoding
    #[error("invalid opcode {opcode:#04x} at {address:#06x}")]
    InvalidOpcode { opcode: u8, address: usize },

    /// Division with a zero divisor
    #[error("divide by zero at {address:#06x}")]
    DivideByZero { address: usize },

    /// Call stack exceeded its bound
    #[error("stack overflow (depth {depth})")]
    StackOverflow { depth: usize },

    /// Return with an empty call stack
    #[error("stack underflow")]
    StackUnderflow,

    /// Process owns more memory cells than its quota allows
    #[error("memory quota exceeded ({footprint} cells, quota {quota})")]
    QuotaExceeded { footprint: u32, quota: u32 },

    // --- control errors (surfaced to the host) ---
    /// Operation requires a battle that is not running
    #[error("battle already running")]
    AlreadyRunning,

    /// Operation requires state the battle does not have yet
    #[error("battle not initialized: {message}")]
    NotInitialized { message: String },

    /// Process id not present in the process table
    #[error("unknown process {pid}")]
    UnknownProcess { pid: ProcessId },

    /// Rejected configuration
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArenaError {
    /// Create a new lex error
    pub fn lex(line: usize, message: impl Into<String>) -> Self {
        Self::Lex {
            line,
            message: message.into(),
        }
    }

    /// Create a new invalid-operand error
    pub fn operand(line: usize, message: impl Into<String>) -> Self {
        Self::InvalidOperand {
            line,
            message: message.into(),
        }
    }

    /// Create a new not-initialized error
    pub fn not_initialized(message: impl Into<String>) -> Self {
        Self::NotInitialized {
            message: message.into(),
        }
    }

    /// Create a new invalid-configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Whether this error belongs to the assembly category
    pub fn is_assembly(&self) -> bool {
        matches!(
            self,
            Self::Lex { .. }
                | Self::InvalidImmediate { .. }
                | Self::InvalidRegister { .. }
                | Self::InvalidOperand { .. }
                | Self::DuplicateLabel { .. }
                | Self::UndefinedSymbol { .. }
                | Self::OutOfRangeLiteral { .. }
                | Self::InvalidDirective { .. }
        )
    }

    /// Process exit code for the embedded CLI: 0 success, 1 assembly error,
    /// 2 runtime error, 3 invalid configuration
    pub fn exit_code(&self) -> i32 {
        if self.is_assembly() {
            1
        } else if matches!(self, Self::InvalidConfig { .. }) {
            3
        } else {
            2
        }
    }
}

/// Instruction execution for the arena virtual machine
///
/// The executor is a pure stepping function over `(memory, process)`: fetch
/// the header byte at PC, decode, resolve effective addresses, perform reads,
/// compute, perform writes, update flags and advance the PC. All reads for an
/// instruction are issued before any write, and a failing instruction leaves
/// no partial writes. Runtime errors never escape: they terminate the
/// offending process and are reported in the step outcome.
use crate::constants::{INSTRUCTION_SIZE, REGISTER_WINDOW};
use crate::error::{ArenaError, Result};
use crate::vm::decoder::{self, AddressingMode, DecodedInstruction, Opcode};
use crate::vm::event::MemoryWriteRecord;
use crate::vm::memory::{Memory, ViolationKind};
use crate::vm::process::{Flags, Process, TerminationReason};

/// Jump condition codes carried in the second operand of `jmp`
pub const COND_ALWAYS: u16 = 0;
pub const COND_ZERO: u16 = 1;
pub const COND_NOT_ZERO: u16 = 2;
pub const COND_LESS: u16 = 3;
pub const COND_GREATER: u16 = 4;

/// Everything observable about one executed instruction
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub pc_before: u16,
    pub pc_after: u16,
    pub instruction: DecodedInstruction,
    pub flags: Flags,
    pub writes: Vec<MemoryWriteRecord>,
    /// Entry PC for a child process created by `spl`
    pub fork_pc: Option<u16>,
    /// Set when this step terminated the process
    pub terminated: Option<TerminationReason>,
    /// Violation details when termination was caused by a memory violation
    pub violation: Option<(ViolationKind, usize)>,
}

/// Where execution continues after an instruction
enum Flow {
    Next,
    Jump(u16),
    Fork(u16),
    Stop(TerminationReason),
}

/// The execution unit
///
/// Stateless apart from configuration; the battle controller drives it in a
/// tight synchronous loop.
#[derive(Debug, Clone, Copy)]
pub struct Executor {
    memory_quota: u32,
}

impl Executor {
    /// Create an executor enforcing the given per-process owned-cell quota
    pub fn new(memory_quota: u32) -> Self {
        Self { memory_quota }
    }

    /// Execute exactly one instruction for `process`
    ///
    /// Installs the process as the memory's current writer first, so every
    /// successful write is credited to it.
    pub fn step(&self, memory: &mut Memory, process: &mut Process) -> StepOutcome {
        memory.set_current_process(process.id);
        process.cycles_used += 1;

        let pc = process.pc;
        let header = memory.read(pc as i64);
        let (opcode, mode_a, mode_b) = decoder::decode_header(header);
        let a = memory.read_word(pc as i64 + 1);
        let b = memory.read_word(pc as i64 + 3);
        let instruction = DecodedInstruction {
            opcode,
            mode_a,
            mode_b,
            a,
            b,
        };

        let mut writes = Vec::new();
        let mut outcome = StepOutcome {
            pc_before: pc,
            pc_after: pc,
            instruction,
            flags: process.regs.flags,
            writes: Vec::new(),
            fork_pc: None,
            terminated: None,
            violation: None,
        };

        let flow = self.execute(memory, process, &instruction, &mut writes);
        outcome.writes = writes;

        match flow {
            Ok(Flow::Next) => {
                process.advance_pc(INSTRUCTION_SIZE as i32, memory.size());
                outcome.pc_after = process.pc;
            }
            Ok(Flow::Jump(target)) => {
                process.set_pc(target, memory.size());
                outcome.pc_after = process.pc;
            }
            Ok(Flow::Fork(child_pc)) => {
                outcome.fork_pc = Some(child_pc);
                process.advance_pc(INSTRUCTION_SIZE as i32, memory.size());
                outcome.pc_after = process.pc;
            }
            Ok(Flow::Stop(reason)) => {
                outcome.terminated = Some(reason);
            }
            Err(error) => {
                if let ArenaError::AccessViolation { kind, address, .. } = &error {
                    outcome.violation = Some((*kind, *address));
                }
                outcome.terminated = Some(termination_reason(&error));
            }
        }

        // Owned-cell accounting runs after the writes of this instruction
        let footprint = memory.owned_count(process.id);
        process.memory_footprint = footprint;
        if outcome.terminated.is_none() && footprint > self.memory_quota {
            outcome.terminated = Some(TerminationReason::QuotaExceeded);
        }

        outcome.flags = process.regs.flags;
        outcome
    }

    fn execute(
        &self,
        memory: &mut Memory,
        process: &mut Process,
        instr: &DecodedInstruction,
        writes: &mut Vec<MemoryWriteRecord>,
    ) -> Result<Flow> {
        let pc = process.pc;
        match instr.opcode {
            Opcode::Nop => Ok(Flow::Next),
            Opcode::Hlt => Ok(Flow::Stop(TerminationReason::Halted)),
            Opcode::Dat => Ok(Flow::Stop(TerminationReason::DataExecuted)),

            Opcode::Mov => {
                let value = self.read_operand(memory, process, instr.mode_b, instr.b, pc);
                let dest = self.dest_location(memory, process, instr, pc)?;
                self.write_location(memory, process, dest, value, writes)?;
                Ok(Flow::Next)
            }

            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                let dest = self.dest_location(memory, process, instr, pc)?;
                let lhs = self.read_location(memory, process, dest);
                let rhs = self.read_operand(memory, process, instr.mode_b, instr.b, pc);
                let result = match instr.opcode {
                    Opcode::Add => {
                        let wide = lhs as u32 + rhs as u32;
                        let result = wide as u16;
                        let flags = &mut process.regs.flags;
                        flags.carry = wide > 0xFFFF;
                        flags.overflow = ((lhs ^ result) & (rhs ^ result) & 0x8000) != 0;
                        flags.set_zero_sign(result);
                        result
                    }
                    Opcode::Sub => {
                        let result = lhs.wrapping_sub(rhs);
                        let flags = &mut process.regs.flags;
                        flags.carry = lhs < rhs;
                        flags.overflow = ((lhs ^ rhs) & (lhs ^ result) & 0x8000) != 0;
                        flags.set_zero_sign(result);
                        result
                    }
                    Opcode::Mul => {
                        let result = lhs.wrapping_mul(rhs);
                        process.regs.flags.set_zero_sign(result);
                        result
                    }
                    _ => {
                        if rhs == 0 {
                            return Err(ArenaError::DivideByZero { address: pc as usize });
                        }
                        let result = lhs / rhs;
                        process.regs.flags.set_zero_sign(result);
                        result
                    }
                };
                self.write_location(memory, process, dest, result, writes)?;
                Ok(Flow::Next)
            }

            Opcode::And | Opcode::Or | Opcode::Xor => {
                let dest = self.dest_location(memory, process, instr, pc)?;
                let lhs = self.read_location(memory, process, dest);
                let rhs = self.read_operand(memory, process, instr.mode_b, instr.b, pc);
                let result = match instr.opcode {
                    Opcode::And => lhs & rhs,
                    Opcode::Or => lhs | rhs,
                    _ => lhs ^ rhs,
                };
                let flags = &mut process.regs.flags;
                flags.set_zero_sign(result);
                flags.carry = false;
                flags.overflow = false;
                self.write_location(memory, process, dest, result, writes)?;
                Ok(Flow::Next)
            }

            Opcode::Cmp => {
                let lhs = self.read_operand(memory, process, instr.mode_a, instr.a, pc);
                let rhs = self.read_operand(memory, process, instr.mode_b, instr.b, pc);
                let result = lhs.wrapping_sub(rhs);
                let flags = &mut process.regs.flags;
                flags.carry = lhs < rhs;
                flags.overflow = ((lhs ^ rhs) & (lhs ^ result) & 0x8000) != 0;
                flags.set_zero_sign(result);
                Ok(Flow::Next)
            }

            Opcode::Jmp => {
                let condition = self.read_operand(memory, process, instr.mode_b, instr.b, pc);
                let condition = decoder::validate_condition(condition, pc as usize)?;
                let flags = process.regs.flags;
                let taken = match condition {
                    COND_ZERO => flags.zero,
                    COND_NOT_ZERO => !flags.zero,
                    COND_LESS => flags.sign != flags.overflow,
                    COND_GREATER => !flags.zero && flags.sign == flags.overflow,
                    _ => true,
                };
                if taken {
                    let target = self.branch_target(memory, process, instr.mode_a, instr.a, pc);
                    Ok(Flow::Jump(target))
                } else {
                    Ok(Flow::Next)
                }
            }

            Opcode::Call => {
                let target = self.branch_target(memory, process, instr.mode_a, instr.a, pc);
                let return_pc =
                    ((pc as usize + INSTRUCTION_SIZE) % memory.size()) as u16;
                process.push(return_pc)?;
                Ok(Flow::Jump(target))
            }

            Opcode::Ret => {
                let target = process.pop()?;
                Ok(Flow::Jump(target))
            }

            Opcode::Spl => {
                let child_pc = self.branch_target(memory, process, instr.mode_a, instr.a, pc);
                Ok(Flow::Fork(child_pc))
            }
        }
    }

    /// Read a value through the register window or shared memory
    fn read_location(&self, memory: &Memory, process: &Process, location: u16) -> u16 {
        if (location as usize) < REGISTER_WINDOW {
            process.window_read(location as usize)
        } else {
            memory.read_word(location as i64)
        }
    }

    /// Write a value through the register window or shared memory
    fn write_location(
        &self,
        memory: &mut Memory,
        process: &mut Process,
        location: u16,
        value: u16,
        writes: &mut Vec<MemoryWriteRecord>,
    ) -> Result<()> {
        if (location as usize) < REGISTER_WINDOW {
            process.window_write(location as usize, value);
            return Ok(());
        }
        memory.write_word(location as i64, value as i32)?;
        let second = memory.normalize(location as i64 + 1) as u16;
        writes.push(MemoryWriteRecord {
            address: location,
            value: (value & 0xFF) as u8,
        });
        writes.push(MemoryWriteRecord {
            address: second,
            value: (value >> 8) as u8,
        });
        Ok(())
    }

    /// Value of a source operand
    fn read_operand(
        &self,
        memory: &Memory,
        process: &Process,
        mode: AddressingMode,
        word: u16,
        pc: u16,
    ) -> u16 {
        match decoder::resolve_address(mode, word, pc, memory.size()) {
            None => word,
            Some(ea) => {
                let location = if mode == AddressingMode::Indirect {
                    let pointer = self.read_location(memory, process, ea);
                    memory.normalize(pointer as i64) as u16
                } else {
                    ea
                };
                self.read_location(memory, process, location)
            }
        }
    }

    /// Final location of a destination operand
    ///
    /// Immediate destinations are unexecutable; the encoding cannot name a
    /// writable place.
    fn dest_location(
        &self,
        memory: &Memory,
        process: &Process,
        instr: &DecodedInstruction,
        pc: u16,
    ) -> Result<u16> {
        match decoder::resolve_address(instr.mode_a, instr.a, pc, memory.size()) {
            None => Err(ArenaError::InvalidOpcode {
                opcode: decoder::encode_header(instr.opcode, instr.mode_a, instr.mode_b),
                address: pc as usize,
            }),
            Some(ea) => {
                if instr.mode_a == AddressingMode::Indirect {
                    let pointer = self.read_location(memory, process, ea);
                    Ok(memory.normalize(pointer as i64) as u16)
                } else {
                    Ok(ea)
                }
            }
        }
    }

    /// Target address of a control-flow operand
    ///
    /// Targets that resolve into the register window jump to the register's
    /// value, which gives computed jumps.
    fn branch_target(
        &self,
        memory: &Memory,
        process: &Process,
        mode: AddressingMode,
        word: u16,
        pc: u16,
    ) -> u16 {
        let target = match decoder::resolve_address(mode, word, pc, memory.size()) {
            None => return (word as usize % memory.size()) as u16,
            Some(ea) => {
                if mode == AddressingMode::Indirect {
                    let pointer = self.read_location(memory, process, ea);
                    memory.normalize(pointer as i64) as u16
                } else {
                    ea
                }
            }
        };
        if (target as usize) < REGISTER_WINDOW {
            (process.window_read(target as usize) as usize % memory.size()) as u16
        } else {
            target
        }
    }
}

/// Map a runtime error onto the reason recorded in the terminal event
fn termination_reason(error: &ArenaError) -> TerminationReason {
    match error {
        ArenaError::AccessViolation { .. } => TerminationReason::AccessViolation,
        ArenaError::DivideByZero { .. } => TerminationReason::DivideByZero,
        ArenaError::StackOverflow { .. } => TerminationReason::StackOverflow,
        ArenaError::StackUnderflow => TerminationReason::StackUnderflow,
        ArenaError::QuotaExceeded { .. } => TerminationReason::QuotaExceeded,
        _ => TerminationReason::InvalidOpcode,
    }
}

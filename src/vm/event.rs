/// Battle event stream
///
/// The controller appends one event per observable step to an ordered,
/// append-only stream. Every event carries `(turn, cycle)` coordinates that
/// increase monotonically, and the stream is sufficient to reconstruct a
/// battle deterministically given the initial seed and bot images.
use crate::vm::decoder::DecodedInstruction;
use crate::vm::memory::ViolationKind;
use crate::vm::process::{Flags, ProcessId, TerminationReason};

/// One byte stored by an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryWriteRecord {
    pub address: u16,
    pub value: u8,
}

/// Events emitted by the battle controller
#[derive(Debug, Clone, PartialEq)]
pub enum BattleEvent {
    ProcessCreated {
        turn: u64,
        cycle: u32,
        pid: ProcessId,
        owner_bot: String,
        pc: u16,
        parent: Option<ProcessId>,
    },
    InstructionExecuted {
        turn: u64,
        cycle: u32,
        pid: ProcessId,
        pc_before: u16,
        instruction: DecodedInstruction,
        pc_after: u16,
        flags: Flags,
        memory_writes: Vec<MemoryWriteRecord>,
    },
    MemoryWrite {
        turn: u64,
        cycle: u32,
        pid: ProcessId,
        address: u16,
        value: u8,
    },
    AccessViolation {
        turn: u64,
        cycle: u32,
        pid: ProcessId,
        kind: ViolationKind,
        address: usize,
    },
    ProcessTerminated {
        turn: u64,
        cycle: u32,
        pid: ProcessId,
        reason: TerminationReason,
    },
    TurnCompleted {
        turn: u64,
        alive: usize,
    },
    BattleEnded {
        turn: u64,
        winner: Option<ProcessId>,
    },
}

impl BattleEvent {
    /// The turn this event belongs to
    pub fn turn(&self) -> u64 {
        match self {
            Self::ProcessCreated { turn, .. }
            | Self::InstructionExecuted { turn, .. }
            | Self::MemoryWrite { turn, .. }
            | Self::AccessViolation { turn, .. }
            | Self::ProcessTerminated { turn, .. }
            | Self::TurnCompleted { turn, .. }
            | Self::BattleEnded { turn, .. } => *turn,
        }
    }
}

/// Observer interface for hosts that want events as they happen
///
/// Sinks receive events strictly in stream order, only at instruction
/// boundaries.
pub trait EventSink {
    fn on_event(&mut self, event: &BattleEvent);
}

/// Sink that counts events by coarse kind; useful in tests and diagnostics
#[derive(Debug, Default, Clone)]
pub struct EventCounter {
    pub instructions: usize,
    pub writes: usize,
    pub violations: usize,
    pub terminations: usize,
    pub turns: usize,
}

impl EventSink for EventCounter {
    fn on_event(&mut self, event: &BattleEvent) {
        match event {
            BattleEvent::InstructionExecuted { .. } => self.instructions += 1,
            BattleEvent::MemoryWrite { .. } => self.writes += 1,
            BattleEvent::AccessViolation { .. } => self.violations += 1,
            BattleEvent::ProcessTerminated { .. } => self.terminations += 1,
            BattleEvent::TurnCompleted { .. } => self.turns += 1,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_accessor() {
        let event = BattleEvent::TurnCompleted { turn: 7, alive: 2 };
        assert_eq!(event.turn(), 7);

        let event = BattleEvent::BattleEnded {
            turn: 9,
            winner: Some(1),
        };
        assert_eq!(event.turn(), 9);
    }

    #[test]
    fn test_counter_sink() {
        let mut counter = EventCounter::default();
        counter.on_event(&BattleEvent::TurnCompleted { turn: 0, alive: 1 });
        counter.on_event(&BattleEvent::MemoryWrite {
            turn: 0,
            cycle: 1,
            pid: 1,
            address: 10,
            value: 0xFF,
        });
        assert_eq!(counter.turns, 1);
        assert_eq!(counter.writes, 1);
        assert_eq!(counter.instructions, 0);
    }
}

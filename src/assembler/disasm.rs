/// Disassembler for bot images
///
/// Produces a canonical source listing of an image's instruction stream:
/// reassembling the listing yields the original code bytes. Conditional
/// jumps are recovered from their condition word; `not`, `inc` and `dec`
/// print as the operations they folded onto. Jump targets become synthetic
/// labels named after their offset.
use crate::assembler::lexer::register_name;
use crate::assembler::BotImage;
use crate::constants::{INSTRUCTION_SIZE, REGISTER_WINDOW};
use crate::vm::decoder::{decode_header, AddressingMode, Opcode};
use crate::vm::executor::{COND_GREATER, COND_LESS, COND_NOT_ZERO, COND_ZERO};
use std::collections::BTreeSet;
use std::fmt::Write;

/// Disassemble an image into canonical assembly source
pub fn disassemble(image: &BotImage) -> String {
    let code = &image.code;
    let labels = collect_labels(code);

    let mut out = String::new();
    if !image.name.is_empty() {
        let _ = writeln!(out, ".name \"{}\"", image.name);
    }
    if !image.author.is_empty() {
        let _ = writeln!(out, ".author \"{}\"", image.author);
    }
    if !image.version.is_empty() {
        let _ = writeln!(out, ".version \"{}\"", image.version);
    }
    if !image.strategy.is_empty() {
        let _ = writeln!(out, ".strategy \"{}\"", image.strategy);
    }

    let mut offset = 0usize;
    while offset + INSTRUCTION_SIZE <= code.len() {
        let at = offset as u16;
        if labels.contains(&at) {
            let _ = write!(out, "L{:04X}: ", at);
        } else {
            let _ = write!(out, "       ");
        }
        let _ = writeln!(out, "{}", render_instruction(code, at, &labels));
        offset += INSTRUCTION_SIZE;
    }
    out
}

/// Offsets that PC-relative operands point at
fn collect_labels(code: &[u8]) -> BTreeSet<u16> {
    let mut labels = BTreeSet::new();
    let mut offset = 0usize;
    while offset + INSTRUCTION_SIZE <= code.len() {
        let (_, mode_a, mode_b) = decode_header(code[offset]);
        let a = word_at(code, offset + 1);
        let b = word_at(code, offset + 3);
        for (mode, word) in [(mode_a, a), (mode_b, b)] {
            if mode == AddressingMode::Indexed {
                let target = (offset as i64 + word as i16 as i64) as i64;
                if target >= 0 && (target as usize) < code.len() {
                    labels.insert(target as u16);
                }
            }
        }
        offset += INSTRUCTION_SIZE;
    }
    labels
}

fn render_instruction(code: &[u8], offset: u16, labels: &BTreeSet<u16>) -> String {
    let at = offset as usize;
    let (opcode, mode_a, mode_b) = decode_header(code[at]);
    let a = word_at(code, at + 1);
    let b = word_at(code, at + 3);

    match opcode {
        Opcode::Nop | Opcode::Ret | Opcode::Hlt => opcode.name().to_string(),
        Opcode::Dat => {
            if a == 0 && b == 0 {
                "dat".to_string()
            } else {
                format!("dat {}, {}", signed(a), signed(b))
            }
        }
        Opcode::Jmp => {
            let target = render_operand(mode_a, a, offset, labels);
            if mode_b == AddressingMode::Immediate {
                let mnemonic = match b {
                    COND_ZERO => Some("jz"),
                    COND_NOT_ZERO => Some("jnz"),
                    COND_LESS => Some("jl"),
                    COND_GREATER => Some("jg"),
                    0 => Some("jmp"),
                    _ => None,
                };
                if let Some(mnemonic) = mnemonic {
                    return format!("{} {}", mnemonic, target);
                }
            }
            // dynamic or malformed condition: keep both operands visible
            format!("jmp {}, {}", target, render_operand(mode_b, b, offset, labels))
        }
        Opcode::Call | Opcode::Spl => {
            format!(
                "{} {}",
                opcode.name(),
                render_operand(mode_a, a, offset, labels)
            )
        }
        _ => format!(
            "{} {}, {}",
            opcode.name(),
            render_operand(mode_a, a, offset, labels),
            render_operand(mode_b, b, offset, labels)
        ),
    }
}

fn render_operand(
    mode: AddressingMode,
    word: u16,
    instr_offset: u16,
    labels: &BTreeSet<u16>,
) -> String {
    match mode {
        AddressingMode::Immediate => format!("#{}", signed(word)),
        AddressingMode::Direct => {
            if (word as usize) < REGISTER_WINDOW {
                register_name(word as u8)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("${:X}", word))
            } else {
                format!("${:X}", word)
            }
        }
        AddressingMode::Indirect => format!("[{}]", word),
        AddressingMode::Indexed => {
            let target = instr_offset.wrapping_add(word);
            if labels.contains(&target) {
                format!("L{:04X}", target)
            } else {
                format!("${:X}", target)
            }
        }
    }
}

fn signed(word: u16) -> i32 {
    if word & 0x8000 != 0 {
        word as i16 as i32
    } else {
        word as i32
    }
}

fn word_at(code: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([code[at], code[at + 1]])
}

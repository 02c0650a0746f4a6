/// Pass 2 of the two-pass assembler
///
/// Emits the encoded bytes for every statement produced by pass 1, resolving
/// symbolic operands against the symbol table and recording relocations.
/// Control-flow targets encode PC-relative (Indexed mode, `PCRelative`
/// relocation, untouched at load); data references encode as absolute words
/// with `Absolute` relocations the loader patches. The pseudo-instructions
/// `jz/jnz/jl/jg`, `not`, `inc` and `dec` are folded onto `jmp`, `xor`,
/// `add` and `sub` here.
use crate::assembler::parser::{DataItem, OperandNode, ParsedProgram, Statement};
use crate::assembler::{BotImage, Relocation, RelocationKind, SymbolKind, SymbolTable};
use crate::error::{ArenaError, Result};
use crate::vm::decoder::{encode_header, AddressingMode, Opcode};
use crate::vm::executor::{COND_ALWAYS, COND_GREATER, COND_LESS, COND_NOT_ZERO, COND_ZERO};

/// Encode a parsed program into a relocatable image
pub fn encode(program: ParsedProgram) -> Result<BotImage> {
    let mut encoder = Encoder {
        symbols: &program.symbols,
        code: vec![0; program.total_size as usize],
        relocations: Vec::new(),
    };
    for statement in &program.statements {
        encoder.encode_statement(statement)?;
    }
    let Encoder {
        code, relocations, ..
    } = encoder;
    Ok(BotImage {
        name: program.metadata.name,
        author: program.metadata.author,
        version: program.metadata.version,
        strategy: program.metadata.strategy,
        code,
        entry_offset: program.entry_offset,
        relocations,
        symbols: program.symbols,
    })
}

/// A mnemonic resolved to its executable form
struct FoldedInstruction {
    opcode: Opcode,
    /// Implicit second operand added by the fold (condition code or mask)
    implicit_b: Option<i64>,
}

struct Encoder<'a> {
    symbols: &'a SymbolTable,
    code: Vec<u8>,
    relocations: Vec<Relocation>,
}

/// An encoded operand: mode tag and word, relocation already recorded
struct EncodedOperand {
    mode: AddressingMode,
    word: u16,
}

impl Encoder<'_> {
    fn encode_statement(&mut self, statement: &Statement) -> Result<()> {
        match statement {
            Statement::Instruction {
                line,
                offset,
                mnemonic,
                operands,
            } => self.encode_instruction(*line, *offset, mnemonic, operands),
            Statement::DataBytes {
                line,
                offset,
                items,
            } => self.encode_bytes(*line, *offset, items),
            Statement::DataWords {
                line,
                offset,
                items,
            } => self.encode_words(*line, *offset, items),
        }
    }

    fn encode_instruction(
        &mut self,
        line: usize,
        offset: u16,
        mnemonic: &str,
        operands: &[OperandNode],
    ) -> Result<()> {
        let folded = fold_mnemonic(mnemonic, line)?;
        let opcode = folded.opcode;
        let is_control_flow = matches!(opcode, Opcode::Jmp | Opcode::Call | Opcode::Spl);

        let a = match operands.first() {
            Some(node) => {
                self.encode_operand(node, line, offset, offset + 1, is_control_flow)?
            }
            None => EncodedOperand {
                mode: AddressingMode::Immediate,
                word: 0,
            },
        };
        let b = if let Some(value) = folded.implicit_b {
            EncodedOperand {
                mode: AddressingMode::Immediate,
                word: value as u16,
            }
        } else {
            match operands.get(1) {
                Some(node) => self.encode_operand(node, line, offset, offset + 3, false)?,
                None => EncodedOperand {
                    mode: AddressingMode::Immediate,
                    word: 0,
                },
            }
        };

        if opcode.writes_first_operand() && a.mode == AddressingMode::Immediate {
            return Err(ArenaError::operand(
                line,
                format!("'{}' cannot write to an immediate operand", mnemonic),
            ));
        }

        let at = offset as usize;
        self.code[at] = encode_header(opcode, a.mode, b.mode);
        self.code[at + 1..at + 3].copy_from_slice(&a.word.to_le_bytes());
        self.code[at + 3..at + 5].copy_from_slice(&b.word.to_le_bytes());
        Ok(())
    }

    /// Encode one operand and record its relocation if it names a label
    ///
    /// `word_offset` is the byte offset of the operand word in the image;
    /// `instr_offset` anchors PC-relative encodings.
    fn encode_operand(
        &mut self,
        node: &OperandNode,
        line: usize,
        instr_offset: u16,
        word_offset: u16,
        control_flow: bool,
    ) -> Result<EncodedOperand> {
        match node {
            OperandNode::Register(index) => Ok(EncodedOperand {
                mode: AddressingMode::Direct,
                word: *index as u16,
            }),
            OperandNode::Immediate(value) => Ok(EncodedOperand {
                mode: AddressingMode::Immediate,
                word: *value as i32 as u16,
            }),
            OperandNode::ImmediateSymbol(name) => {
                let entry = self.resolve(name, line)?;
                if entry.kind == SymbolKind::Label {
                    self.relocations.push(Relocation {
                        offset: word_offset,
                        kind: RelocationKind::Absolute,
                    });
                }
                Ok(EncodedOperand {
                    mode: AddressingMode::Immediate,
                    word: entry.value,
                })
            }
            OperandNode::Direct(address) => Ok(EncodedOperand {
                mode: AddressingMode::Direct,
                word: *address,
            }),
            OperandNode::IndirectNumber(address) => Ok(EncodedOperand {
                mode: AddressingMode::Indirect,
                word: *address,
            }),
            OperandNode::IndirectSymbol(name) => {
                let entry = self.resolve(name, line)?;
                if entry.kind == SymbolKind::Label {
                    self.relocations.push(Relocation {
                        offset: word_offset,
                        kind: RelocationKind::Absolute,
                    });
                }
                Ok(EncodedOperand {
                    mode: AddressingMode::Indirect,
                    word: entry.value,
                })
            }
            OperandNode::Symbol(name) => {
                let entry = self.resolve(name, line)?;
                match entry.kind {
                    SymbolKind::Const => Ok(EncodedOperand {
                        mode: AddressingMode::Immediate,
                        word: entry.value,
                    }),
                    SymbolKind::Label if control_flow => {
                        let delta = entry.value.wrapping_sub(instr_offset);
                        self.relocations.push(Relocation {
                            offset: word_offset,
                            kind: RelocationKind::PCRelative,
                        });
                        Ok(EncodedOperand {
                            mode: AddressingMode::Indexed,
                            word: delta,
                        })
                    }
                    SymbolKind::Label => {
                        self.relocations.push(Relocation {
                            offset: word_offset,
                            kind: RelocationKind::Absolute,
                        });
                        Ok(EncodedOperand {
                            mode: AddressingMode::Direct,
                            word: entry.value,
                        })
                    }
                }
            }
        }
    }

    fn encode_bytes(&mut self, line: usize, offset: u16, items: &[DataItem]) -> Result<()> {
        let mut at = offset as usize;
        for item in items {
            match item {
                DataItem::Number(value) => {
                    if !(-128..=255).contains(value) {
                        return Err(ArenaError::OutOfRangeLiteral {
                            line,
                            literal: value.to_string(),
                        });
                    }
                    self.code[at] = *value as u8;
                    at += 1;
                }
                DataItem::Str(text) => {
                    for byte in text.bytes() {
                        self.code[at] = byte;
                        at += 1;
                    }
                }
                DataItem::Symbol(name) => {
                    return Err(ArenaError::operand(
                        line,
                        format!("label '{}' does not fit in a byte; use dw", name),
                    ));
                }
            }
        }
        Ok(())
    }

    fn encode_words(&mut self, line: usize, offset: u16, items: &[DataItem]) -> Result<()> {
        let mut at = offset as usize;
        for item in items {
            let word = match item {
                DataItem::Number(value) => *value as i32 as u16,
                DataItem::Symbol(name) => {
                    let entry = self.resolve(name, line)?;
                    if entry.kind == SymbolKind::Label {
                        self.relocations.push(Relocation {
                            offset: at as u16,
                            kind: RelocationKind::Absolute,
                        });
                    }
                    entry.value
                }
                DataItem::Str(_) => {
                    return Err(ArenaError::operand(line, "strings belong in db, not dw"));
                }
            };
            self.code[at..at + 2].copy_from_slice(&word.to_le_bytes());
            at += 2;
        }
        Ok(())
    }

    fn resolve(&self, name: &str, line: usize) -> Result<crate::assembler::SymbolEntry> {
        self.symbols
            .lookup(name)
            .ok_or_else(|| ArenaError::UndefinedSymbol {
                symbol: name.to_string(),
                line,
            })
    }
}

/// Map a source mnemonic onto its opcode and any implicit operand
fn fold_mnemonic(mnemonic: &str, line: usize) -> Result<FoldedInstruction> {
    let plain = |opcode| FoldedInstruction {
        opcode,
        implicit_b: None,
    };
    let jump = |condition: u16| FoldedInstruction {
        opcode: Opcode::Jmp,
        implicit_b: Some(condition as i64),
    };
    Ok(match mnemonic {
        "nop" => plain(Opcode::Nop),
        "mov" => plain(Opcode::Mov),
        "add" => plain(Opcode::Add),
        "sub" => plain(Opcode::Sub),
        "mul" => plain(Opcode::Mul),
        "div" => plain(Opcode::Div),
        "and" => plain(Opcode::And),
        "or" => plain(Opcode::Or),
        "xor" => plain(Opcode::Xor),
        "cmp" => plain(Opcode::Cmp),
        "jmp" => jump(COND_ALWAYS),
        "jz" => jump(COND_ZERO),
        "jnz" => jump(COND_NOT_ZERO),
        "jl" => jump(COND_LESS),
        "jg" => jump(COND_GREATER),
        "call" => plain(Opcode::Call),
        "ret" => plain(Opcode::Ret),
        "spl" => plain(Opcode::Spl),
        "hlt" => plain(Opcode::Hlt),
        "dat" => plain(Opcode::Dat),
        "not" => FoldedInstruction {
            opcode: Opcode::Xor,
            implicit_b: Some(0xFFFF),
        },
        "inc" => FoldedInstruction {
            opcode: Opcode::Add,
            implicit_b: Some(1),
        },
        "dec" => FoldedInstruction {
            opcode: Opcode::Sub,
            implicit_b: Some(1),
        },
        other => {
            return Err(ArenaError::operand(
                line,
                format!("unknown mnemonic '{}'", other),
            ));
        }
    })
}

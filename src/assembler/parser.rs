use crate::assembler::lexer::{register_index, Token, TokenKind};
use crate::assembler::{ImageMetadata, SymbolKind, SymbolTable};
/// Pass 1 of the two-pass assembler
///
/// Walks the token stream, maintains the program offset, records every label
/// in the symbol table, collects image metadata and produces the statement
/// list that pass 2 encodes. Duplicate labels are a hard error here; unknown
/// symbols are only detected in pass 2 when references are resolved.
use crate::constants::INSTRUCTION_SIZE;
use crate::error::{ArenaError, Result};

/// An instruction or data operand as written in source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperandNode {
    /// Register name, as its window index
    Register(u8),
    /// Numeric immediate
    Immediate(i64),
    /// `#label` or a constant used as an immediate
    ImmediateSymbol(String),
    /// `$HEX` absolute address
    Direct(u16),
    /// `[number]`
    IndirectNumber(u16),
    /// `[label]`
    IndirectSymbol(String),
    /// Bare identifier: jump target or data reference
    Symbol(String),
}

/// Item of a `db`/`dw` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataItem {
    Number(i64),
    /// Label reference; only valid in `dw`, where a word can hold it
    Symbol(String),
    /// String bytes; only valid in `db`
    Str(String),
}

/// One statement that occupies space in the image
#[derive(Debug, Clone)]
pub enum Statement {
    Instruction {
        line: usize,
        offset: u16,
        mnemonic: String,
        operands: Vec<OperandNode>,
    },
    DataBytes {
        line: usize,
        offset: u16,
        items: Vec<DataItem>,
    },
    DataWords {
        line: usize,
        offset: u16,
        items: Vec<DataItem>,
    },
}

/// Everything pass 1 learned about a program
#[derive(Debug, Clone)]
pub struct ParsedProgram {
    pub metadata: ImageMetadata,
    pub statements: Vec<Statement>,
    pub symbols: SymbolTable,
    pub total_size: u16,
    pub entry_offset: u16,
}

/// Pass-1 parser over the token stream
#[derive(Debug)]
pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    offset: u32,
    entry_offset: Option<u16>,
    metadata: ImageMetadata,
    symbols: SymbolTable,
    statements: Vec<Statement>,
    /// Highest offset reached; `.org` may only move forward
    high_water: u32,
}

impl Parser {
    /// Create a parser over `tokens`
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            current: 0,
            offset: 0,
            entry_offset: None,
            metadata: ImageMetadata::default(),
            symbols: SymbolTable::new(),
            statements: Vec::new(),
            high_water: 0,
        }
    }

    /// Run pass 1 to completion
    pub fn parse(mut self) -> Result<ParsedProgram> {
        while !self.is_at_end() {
            self.parse_line()?;
        }
        Ok(ParsedProgram {
            metadata: self.metadata,
            statements: self.statements,
            symbols: self.symbols,
            total_size: self.high_water.max(self.offset) as u16,
            entry_offset: self.entry_offset.unwrap_or(0),
        })
    }

    fn parse_line(&mut self) -> Result<()> {
        self.skip_newlines();
        if self.is_at_end() {
            return Ok(());
        }

        // labels may stack in front of anything, including an empty line
        while self.peek().kind == TokenKind::Label {
            let token = self.advance();
            self.symbols
                .define(&token.lexeme, self.offset as u16, SymbolKind::Label, token.line)?;
            self.skip_newlines();
            if self.is_at_end() {
                return Ok(());
            }
        }

        match self.peek().kind {
            TokenKind::Directive => self.parse_directive(),
            TokenKind::Instruction => self.parse_instruction(),
            TokenKind::Symbol if self.peek_at(1).kind == TokenKind::Directive
                && self.peek_at(1).lexeme == "equ" =>
            {
                self.parse_equ()
            }
            TokenKind::Eof => Ok(()),
            _ => {
                let token = self.advance();
                Err(ArenaError::operand(
                    token.line,
                    format!("unexpected '{}' at start of statement", token.lexeme),
                ))
            }
        }
    }

    fn parse_equ(&mut self) -> Result<()> {
        let name = self.advance();
        self.advance(); // the "equ" directive token
        let value_token = self.expect(TokenKind::Immediate, "expected value after 'equ'")?;
        let value = parse_literal(&value_token)?;
        if !(0..=0xFFFF).contains(&value) {
            return Err(ArenaError::OutOfRangeLiteral {
                line: value_token.line,
                literal: value_token.lexeme,
            });
        }
        self.symbols
            .define(&name.lexeme, value as u16, SymbolKind::Const, name.line)?;
        self.end_line()
    }

    fn parse_directive(&mut self) -> Result<()> {
        let directive = self.advance();
        match directive.lexeme.as_str() {
            ".name" => {
                self.metadata.name = self.expect_string(&directive)?;
            }
            ".author" => {
                self.metadata.author = self.expect_string(&directive)?;
            }
            ".version" => {
                self.metadata.version = self.expect_string(&directive)?;
            }
            ".strategy" => {
                self.metadata.strategy = self.expect_string(&directive)?;
            }
            ".code" => {
                if self.entry_offset.is_none() {
                    self.entry_offset = Some(self.offset as u16);
                }
            }
            ".data" | ".const" => {}
            ".org" => {
                let target = self.expect_offset_argument(&directive)?;
                if (target as u32) < self.offset {
                    return Err(ArenaError::InvalidDirective {
                        directive: ".org moving backwards".to_string(),
                        line: directive.line,
                    });
                }
                self.advance_offset(target as u32 - self.offset, directive.line)?;
            }
            ".align" => {
                let alignment = self.expect_offset_argument(&directive)?;
                if alignment == 0 {
                    return Err(ArenaError::InvalidDirective {
                        directive: ".align 0".to_string(),
                        line: directive.line,
                    });
                }
                let pad = (alignment as u32 - self.offset % alignment as u32)
                    % alignment as u32;
                self.advance_offset(pad, directive.line)?;
            }
            ".space" => {
                let size = self.expect_offset_argument(&directive)?;
                self.advance_offset(size as u32, directive.line)?;
            }
            "db" => {
                let items = self.parse_data_items(directive.line, true)?;
                let size: u32 = items
                    .iter()
                    .map(|item| match item {
                        DataItem::Str(s) => s.len() as u32,
                        _ => 1,
                    })
                    .sum();
                self.statements.push(Statement::DataBytes {
                    line: directive.line,
                    offset: self.offset as u16,
                    items,
                });
                self.advance_offset(size, directive.line)?;
                return self.end_line();
            }
            "dw" => {
                let items = self.parse_data_items(directive.line, false)?;
                let size = items.len() as u32 * 2;
                self.statements.push(Statement::DataWords {
                    line: directive.line,
                    offset: self.offset as u16,
                    items,
                });
                self.advance_offset(size, directive.line)?;
                return self.end_line();
            }
            other => {
                return Err(ArenaError::InvalidDirective {
                    directive: other.to_string(),
                    line: directive.line,
                });
            }
        }
        self.end_line()
    }

    fn parse_instruction(&mut self) -> Result<()> {
        let token = self.advance();
        let mnemonic = token.lexeme.clone();
        let line = token.line;

        let mut operands = Vec::new();
        while !self.at_line_end() {
            if self.peek().kind == TokenKind::Comma {
                self.advance();
                continue;
            }
            operands.push(self.parse_operand()?);
        }

        let (min, max) = mnemonic_arity(&mnemonic);
        if operands.len() < min || operands.len() > max {
            return Err(ArenaError::operand(
                line,
                format!(
                    "'{}' takes {} operand(s), got {}",
                    mnemonic,
                    if min == max {
                        min.to_string()
                    } else {
                        format!("{}..{}", min, max)
                    },
                    operands.len()
                ),
            ));
        }

        self.statements.push(Statement::Instruction {
            line,
            offset: self.offset as u16,
            mnemonic,
            operands,
        });
        self.advance_offset(INSTRUCTION_SIZE as u32, line)?;
        self.end_line()
    }

    fn parse_operand(&mut self) -> Result<OperandNode> {
        let token = self.advance();
        match token.kind {
            TokenKind::Register => {
                let index = register_index(&token.lexeme).ok_or(ArenaError::InvalidRegister {
                    line: token.line,
                    name: token.lexeme.clone(),
                })?;
                Ok(OperandNode::Register(index))
            }
            TokenKind::Immediate => {
                if starts_like_symbol(&token.lexeme) {
                    Ok(OperandNode::ImmediateSymbol(token.lexeme))
                } else {
                    Ok(OperandNode::Immediate(parse_literal(&token)?))
                }
            }
            TokenKind::Address => {
                if let Some(rest) = token.lexeme.strip_prefix('$') {
                    let value = rest.parse::<u16>().map_err(|_| {
                        ArenaError::InvalidImmediate {
                            line: token.line,
                            literal: token.lexeme.clone(),
                        }
                    })?;
                    Ok(OperandNode::Direct(value))
                } else {
                    let inner = token
                        .lexeme
                        .trim_start_matches('[')
                        .trim_end_matches(']')
                        .to_string();
                    if starts_like_symbol(&inner) {
                        Ok(OperandNode::IndirectSymbol(inner))
                    } else {
                        let value = inner.parse::<i64>().map_err(|_| {
                            ArenaError::InvalidImmediate {
                                line: token.line,
                                literal: token.lexeme.clone(),
                            }
                        })?;
                        if !(0..=0xFFFF).contains(&value) {
                            return Err(ArenaError::OutOfRangeLiteral {
                                line: token.line,
                                literal: token.lexeme,
                            });
                        }
                        Ok(OperandNode::IndirectNumber(value as u16))
                    }
                }
            }
            TokenKind::Symbol => Ok(OperandNode::Symbol(token.lexeme)),
            _ => Err(ArenaError::operand(
                token.line,
                format!("'{}' cannot be an operand", token.lexeme),
            )),
        }
    }

    fn parse_data_items(&mut self, line: usize, allow_strings: bool) -> Result<Vec<DataItem>> {
        let mut items = Vec::new();
        while !self.at_line_end() {
            if self.peek().kind == TokenKind::Comma {
                self.advance();
                continue;
            }
            let token = self.advance();
            match token.kind {
                TokenKind::Immediate if !starts_like_symbol(&token.lexeme) => {
                    items.push(DataItem::Number(parse_literal(&token)?));
                }
                TokenKind::Symbol if !allow_strings => {
                    items.push(DataItem::Symbol(token.lexeme));
                }
                TokenKind::String if allow_strings => {
                    items.push(DataItem::Str(token.lexeme));
                }
                _ => {
                    return Err(ArenaError::operand(
                        token.line,
                        format!("'{}' is not valid data here", token.lexeme),
                    ));
                }
            }
        }
        if items.is_empty() {
            return Err(ArenaError::operand(line, "empty data directive"));
        }
        Ok(items)
    }

    fn expect_string(&mut self, directive: &Token) -> Result<String> {
        if self.peek().kind == TokenKind::String {
            Ok(self.advance().lexeme)
        } else {
            Err(ArenaError::InvalidDirective {
                directive: format!("{} without string argument", directive.lexeme),
                line: directive.line,
            })
        }
    }

    fn expect_offset_argument(&mut self, directive: &Token) -> Result<u16> {
        if self.peek().kind != TokenKind::Immediate || starts_like_symbol(&self.peek().lexeme) {
            return Err(ArenaError::InvalidDirective {
                directive: format!("{} without numeric argument", directive.lexeme),
                line: directive.line,
            });
        }
        let token = self.advance();
        let value = parse_literal(&token)?;
        if !(0..=0xFFFF).contains(&value) {
            return Err(ArenaError::OutOfRangeLiteral {
                line: token.line,
                literal: token.lexeme,
            });
        }
        Ok(value as u16)
    }

    fn advance_offset(&mut self, by: u32, line: usize) -> Result<()> {
        self.offset += by;
        self.high_water = self.high_water.max(self.offset);
        if self.offset > 0x10000 {
            return Err(ArenaError::OutOfRangeLiteral {
                line,
                literal: format!("image offset {}", self.offset),
            });
        }
        Ok(())
    }

    fn end_line(&mut self) -> Result<()> {
        match self.peek().kind {
            TokenKind::Newline => {
                self.advance();
                Ok(())
            }
            TokenKind::Eof => Ok(()),
            _ => {
                let token = self.advance();
                Err(ArenaError::operand(
                    token.line,
                    format!("unexpected '{}' at end of line", token.lexeme),
                ))
            }
        }
    }

    fn at_line_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Newline | TokenKind::Eof)
    }

    fn skip_newlines(&mut self) {
        while self.peek().kind == TokenKind::Newline {
            self.advance();
        }
    }

    fn is_at_end(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[(self.current + offset).min(last)]
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.current.min(self.tokens.len() - 1)].clone();
        if self.current < self.tokens.len() - 1 {
            self.current += 1;
        }
        token
    }

    fn expect(&mut self, kind: TokenKind, message: &str) -> Result<Token> {
        if self.peek().kind == kind {
            Ok(self.advance())
        } else {
            let token = self.peek();
            Err(ArenaError::operand(token.line, message))
        }
    }
}

/// Operand arity (min, max) per mnemonic, pseudo-instructions included
fn mnemonic_arity(mnemonic: &str) -> (usize, usize) {
    match mnemonic {
        "nop" | "ret" | "hlt" => (0, 0),
        "dat" => (0, 2),
        "jmp" | "jz" | "jnz" | "jl" | "jg" | "call" | "spl" | "not" | "inc" | "dec" => (1, 1),
        _ => (2, 2),
    }
}

fn starts_like_symbol(text: &str) -> bool {
    text.chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
}

fn parse_literal(token: &Token) -> Result<i64> {
    token
        .lexeme
        .parse::<i64>()
        .map_err(|_| ArenaError::InvalidImmediate {
            line: token.line,
            literal: token.lexeme.clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::lexer::Lexer;

    fn parse(source: &str) -> ParsedProgram {
        let tokens = Lexer::new(source).tokenize().unwrap();
        Parser::new(tokens).parse().unwrap()
    }

    fn parse_err(source: &str) -> ArenaError {
        let tokens = Lexer::new(source).tokenize().unwrap();
        Parser::new(tokens).parse().unwrap_err()
    }

    #[test]
    fn test_symbols_and_offsets() {
        let program = parse(
            "start: mov r0, #10\nloop:  dec r0\n       jnz loop\n       hlt\n",
        );
        assert_eq!(program.symbols.offset_of("start"), Some(0));
        assert_eq!(program.symbols.offset_of("loop"), Some(5));
        assert_eq!(program.statements.len(), 4);
        assert_eq!(program.total_size, 20);
    }

    #[test]
    fn test_metadata_directives() {
        let program = parse(
            ".name \"Sweeper\"\n.author \"ab\"\n.version \"1.2\"\n.strategy \"walk and stomp\"\nhlt\n",
        );
        assert_eq!(program.metadata.name, "Sweeper");
        assert_eq!(program.metadata.author, "ab");
        assert_eq!(program.metadata.version, "1.2");
        assert_eq!(program.metadata.strategy, "walk and stomp");
    }

    #[test]
    fn test_duplicate_label_is_hard_error() {
        let err = parse_err("a: nop\na: nop\n");
        assert!(matches!(
            err,
            ArenaError::DuplicateLabel { ref label, line: 2 } if label == "a"
        ));
    }

    #[test]
    fn test_org_align_space() {
        let program = parse(".org 16\nentry: nop\n.align 8\ndb 1\n.space 3\n");
        assert_eq!(program.symbols.offset_of("entry"), Some(16));
        // nop ends at 21, .align 8 pads to 24, db 1 -> 25, .space 3 -> 28
        assert_eq!(program.total_size, 28);
    }

    #[test]
    fn test_org_backwards_rejected() {
        let err = parse_err("nop\n.org 2\n");
        assert!(matches!(err, ArenaError::InvalidDirective { .. }));
    }

    #[test]
    fn test_equ_constants() {
        let program = parse("limit equ 40\nmov r0, #limit\n");
        assert_eq!(program.symbols.offset_of("limit"), Some(40));
        assert_eq!(program.total_size, 5); // equ occupies no space
    }

    #[test]
    fn test_code_directive_sets_entry() {
        let program = parse(".data\ndw 1, 2\n.code\nmain: nop\n");
        assert_eq!(program.entry_offset, 4);
        assert_eq!(program.symbols.offset_of("main"), Some(4));
    }

    #[test]
    fn test_operand_arity_checked() {
        let err = parse_err("mov r0\n");
        assert!(matches!(err, ArenaError::InvalidOperand { line: 1, .. }));

        let err = parse_err("hlt r0\n");
        assert!(matches!(err, ArenaError::InvalidOperand { .. }));
    }

    #[test]
    fn test_unknown_directive() {
        let err = parse_err(".frobnicate \"x\"\n");
        assert!(matches!(err, ArenaError::InvalidDirective { .. }));
    }

    #[test]
    fn test_data_items() {
        let program = parse("table: dw 1, 2, end\nbytes: db 1, \"hi\"\nend: hlt\n");
        assert_eq!(program.symbols.offset_of("table"), Some(0));
        assert_eq!(program.symbols.offset_of("bytes"), Some(6));
        assert_eq!(program.symbols.offset_of("end"), Some(9));
    }

    #[test]
    fn test_label_on_its_own_line() {
        let program = parse("alone:\n\nnop\n");
        assert_eq!(program.symbols.offset_of("alone"), Some(0));
    }

    #[test]
    fn test_string_in_dw_rejected() {
        let err = parse_err("dw \"nope\"\n");
        assert!(matches!(err, ArenaError::InvalidOperand { .. }));
    }
}

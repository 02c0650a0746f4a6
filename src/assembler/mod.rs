pub mod disasm;
pub mod encoder;
/// Assembler for arena assembly language
///
/// This module provides the two-pass assembler that compiles assembly source
/// into relocatable bot images, and the matching disassembler. Pass 1
/// (`parser`) resolves symbols and computes offsets; pass 2 (`encoder`) emits
/// code bytes and relocation records.
pub mod lexer;
pub mod parser;

// Re-export commonly used types
pub use lexer::{Lexer, Token, TokenKind};
pub use parser::Parser;

use crate::error::{ArenaError, Result};
use log::debug;
use std::collections::BTreeMap;
use std::path::Path;

/// Kind of a symbol-table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// A label: an offset into the image, relocated at load
    Label,
    /// An `equ` constant: an absolute value, never relocated
    Const,
}

/// One resolved symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolEntry {
    pub value: u16,
    pub kind: SymbolKind,
}

/// Mapping from names to resolved values, built during pass 1
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    entries: BTreeMap<String, SymbolEntry>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a symbol; any redefinition is a hard error
    pub fn define(
        &mut self,
        name: &str,
        value: u16,
        kind: SymbolKind,
        line: usize,
    ) -> Result<()> {
        if self.entries.contains_key(name) {
            return Err(ArenaError::DuplicateLabel {
                label: name.to_string(),
                line,
            });
        }
        self.entries.insert(name.to_string(), SymbolEntry { value, kind });
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<SymbolEntry> {
        self.entries.get(name).copied()
    }

    /// Value of a symbol regardless of kind; offsets for labels
    pub fn offset_of(&self, name: &str) -> Option<u16> {
        self.lookup(name).map(|entry| entry.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SymbolEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Image metadata collected from the header directives
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageMetadata {
    pub name: String,
    pub author: String,
    pub version: String,
    pub strategy: String,
}

/// How the loader patches an operand word once the base is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationKind {
    /// Add the load base to the word
    Absolute,
    /// PC-relative encoding, left as-is
    PCRelative,
}

/// One relocation record: byte offset of a word in the image plus its kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub offset: u16,
    pub kind: RelocationKind,
}

/// A relocatable assembled program
///
/// Produced by the assembler, consumed by the loader. Assembling the same
/// source twice yields identical images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotImage {
    pub name: String,
    pub author: String,
    pub version: String,
    pub strategy: String,
    pub code: Vec<u8>,
    pub entry_offset: u16,
    pub relocations: Vec<Relocation>,
    pub symbols: SymbolTable,
}

impl BotImage {
    /// Image size in bytes
    pub fn size(&self) -> usize {
        self.code.len()
    }
}

/// Main assembler interface
///
/// Ties the lexer, pass-1 parser and pass-2 encoder together behind a simple
/// source-to-image API.
#[derive(Debug, Default)]
pub struct Assembler;

impl Assembler {
    pub fn new() -> Self {
        Self
    }

    /// Assemble source text into a relocatable image
    pub fn assemble_source(&self, source: &str) -> Result<BotImage> {
        let tokens = Lexer::new(source).tokenize()?;
        debug!("lexed {} tokens", tokens.len());
        let program = Parser::new(tokens).parse()?;
        debug!(
            "pass 1: {} statements, {} symbols, {} bytes",
            program.statements.len(),
            program.symbols.len(),
            program.total_size
        );
        let image = encoder::encode(program)?;
        debug!(
            "pass 2: {} bytes, {} relocations",
            image.code.len(),
            image.relocations.len()
        );
        Ok(image)
    }

    /// Assemble a source file; a missing `.name` defaults to the file stem
    pub fn assemble_file<P: AsRef<Path>>(&self, path: P) -> Result<BotImage> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let mut image = self.assemble_source(&source)?;
        if image.name.is_empty() {
            image.name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        Ok(image)
    }

    /// Apply relocations for a chosen load base and return the final bytes
    ///
    /// `Absolute` words get the base added; `PCRelative` words are already
    /// position-independent and stay untouched.
    pub fn relocate(image: &BotImage, base: u16) -> Vec<u8> {
        let mut code = image.code.clone();
        for relocation in &image.relocations {
            if relocation.kind != RelocationKind::Absolute {
                continue;
            }
            let at = relocation.offset as usize;
            if at + 1 >= code.len() {
                continue;
            }
            let word = u16::from_le_bytes([code[at], code[at + 1]]);
            let patched = word.wrapping_add(base);
            code[at..at + 2].copy_from_slice(&patched.to_le_bytes());
        }
        code
    }

    /// Produce a canonical source listing of an image's instruction stream
    pub fn disassemble(&self, image: &BotImage) -> String {
        disasm::disassemble(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_simple_program() {
        let assembler = Assembler::new();
        let image = assembler
            .assemble_source(".name \"probe\"\nstart: mov r0, #10\nhlt\n")
            .unwrap();
        assert_eq!(image.name, "probe");
        assert_eq!(image.size(), 10);
        assert_eq!(image.symbols.offset_of("start"), Some(0));
    }

    #[test]
    fn test_assembly_is_idempotent() {
        let source = "\
.name \"twin\"
start: mov r0, #10
loop:  dec r0
       jnz loop
       hlt
";
        let assembler = Assembler::new();
        let first = assembler.assemble_source(source).unwrap();
        let second = assembler.assemble_source(source).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_relocate_patches_absolute_words_only() {
        let assembler = Assembler::new();
        // data reference -> Absolute; jump target -> PCRelative
        let image = assembler
            .assemble_source("top: mov r0, value\njmp top\nvalue: dw 7\n")
            .unwrap();
        let kinds: Vec<RelocationKind> = image.relocations.iter().map(|r| r.kind).collect();
        assert!(kinds.contains(&RelocationKind::Absolute));
        assert!(kinds.contains(&RelocationKind::PCRelative));

        let plain = Assembler::relocate(&image, 0);
        let moved = Assembler::relocate(&image, 0x100);
        assert_ne!(plain, moved);

        // the pc-relative jump word is identical in both
        let pcrel = image
            .relocations
            .iter()
            .find(|r| r.kind == RelocationKind::PCRelative)
            .unwrap();
        let at = pcrel.offset as usize;
        assert_eq!(plain[at..at + 2], moved[at..at + 2]);
    }

    #[test]
    fn test_symbol_table_rejects_duplicates() {
        let mut table = SymbolTable::new();
        table.define("a", 1, SymbolKind::Label, 1).unwrap();
        assert!(matches!(
            table.define("a", 2, SymbolKind::Const, 9),
            Err(ArenaError::DuplicateLabel { line: 9, .. })
        ));
    }
}

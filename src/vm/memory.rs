/// Memory management for the arena virtual machine
///
/// This module implements the shared circular memory space with modulo
/// addressing. Every cell carries a byte of data plus two shadow attributes:
/// the id of the process that last wrote it and a protection bit. All public
/// operations accept raw (possibly negative) addresses and normalize them
/// internally, so reads and writes can never go out of bounds; they wrap.
use crate::error::{ArenaError, Result};
use crate::vm::ProcessId;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// Classification of a recorded access violation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// Write into a protected cell
    Protection,
    /// Allocator misuse: bad size or unknown base
    Bounds,
    /// First-fit search found no free run
    Allocation,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protection => write!(f, "protection"),
            Self::Bounds => write!(f, "bounds"),
            Self::Allocation => write!(f, "allocation"),
        }
    }
}

/// Memory operation that triggered a violation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOp {
    Read,
    Write,
    Allocate,
}

impl fmt::Display for MemoryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Allocate => write!(f, "allocate"),
        }
    }
}

/// One entry of the append-only access-violation log
///
/// There is no real-time clock in the core, so `timestamp` is a monotone
/// per-memory sequence number.
#[derive(Debug, Clone)]
pub struct AccessViolation {
    pub kind: ViolationKind,
    pub address: usize,
    pub operation: MemoryOp,
    pub timestamp: u64,
    pub message: String,
}

/// Shared circular memory
///
/// The memory is a circular byte buffer with a parallel ownership array
/// (process id per cell, 0 = unowned), a protected-address set and a first-fit
/// allocation map. Ownership is credited to the current process installed by
/// the scheduler before each instruction.
#[derive(Debug, Clone)]
pub struct Memory {
    /// The actual memory buffer
    data: Vec<u8>,
    /// Process id that last successfully wrote each cell (0 = unowned)
    ownership: Vec<ProcessId>,
    /// Normalized addresses that reject writes
    protected: HashSet<usize>,
    /// base -> size of live allocations, ordered for first-fit scans
    allocations: BTreeMap<usize, usize>,
    /// Cells owned per process, maintained incrementally for quota checks
    owned_counts: HashMap<ProcessId, u32>,
    /// Process credited with subsequent writes (0 = none)
    current_process: ProcessId,
    /// Append-only violation log
    violations: Vec<AccessViolation>,
    /// Next violation timestamp
    sequence: u64,
}

impl Memory {
    /// Create a new memory of `size` bytes, all zeroed and unowned
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "memory size must be nonzero");
        Self {
            data: vec![0; size],
            ownership: vec![0; size],
            protected: HashSet::new(),
            allocations: BTreeMap::new(),
            owned_counts: HashMap::new(),
            current_process: 0,
            violations: Vec::new(),
            sequence: 0,
        }
    }

    /// Get the size of the memory
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Normalize an address using modulo arithmetic
    ///
    /// Negative addresses wrap backwards, so `-1` maps to the last cell.
    pub fn normalize(&self, address: i64) -> usize {
        let m = self.data.len() as i64;
        (((address % m) + m) % m) as usize
    }

    /// Read a single byte from memory; never fails, wraps the address
    pub fn read(&self, address: i64) -> u8 {
        self.data[self.normalize(address)]
    }

    /// Read a 16-bit word from memory (2 bytes, little-endian)
    pub fn read_word(&self, address: i64) -> u16 {
        let lo = self.read(address) as u16;
        let hi = self.read(address + 1) as u16;
        lo | (hi << 8)
    }

    /// Write a single byte to memory
    ///
    /// The value is truncated to 8 bits. Fails with a `Protection` violation
    /// when the normalized address is protected; the cell is unchanged and one
    /// entry is appended to the access log. On success the cell's owner
    /// becomes the current process, if one is set.
    pub fn write(&mut self, address: i64, value: i32) -> Result<()> {
        let normalized = self.normalize(address);
        if self.protected.contains(&normalized) {
            return Err(self.record_violation(
                ViolationKind::Protection,
                normalized,
                MemoryOp::Write,
                format!("write of {:#04x} to protected cell", value & 0xFF),
            ));
        }
        self.data[normalized] = (value & 0xFF) as u8;
        if self.current_process != 0 {
            self.transfer_ownership(normalized, self.current_process);
        }
        Ok(())
    }

    /// Write a 16-bit word to memory (2 bytes, little-endian)
    ///
    /// Protection is checked on both cells before either byte is stored, so a
    /// failing word write leaves no partial state.
    pub fn write_word(&mut self, address: i64, value: i32) -> Result<()> {
        let first = self.normalize(address);
        let second = self.normalize(address + 1);
        for cell in [first, second] {
            if self.protected.contains(&cell) {
                return Err(self.record_violation(
                    ViolationKind::Protection,
                    cell,
                    MemoryOp::Write,
                    "word write overlapping protected cell".to_string(),
                ));
            }
        }
        self.write(first as i64, value & 0xFF)?;
        self.write(second as i64, (value >> 8) & 0xFF)?;
        Ok(())
    }

    /// Mark an address as write-protected; idempotent
    pub fn protect(&mut self, address: i64) {
        let normalized = self.normalize(address);
        self.protected.insert(normalized);
    }

    /// Remove write protection from an address; idempotent
    pub fn unprotect(&mut self, address: i64) {
        let normalized = self.normalize(address);
        self.protected.remove(&normalized);
    }

    /// Whether the address is currently write-protected
    pub fn is_protected(&self, address: i64) -> bool {
        self.protected.contains(&self.normalize(address))
    }

    /// First-fit allocation of `size` contiguous bytes
    ///
    /// Returns the base of the region and records it in the allocation map.
    /// Allocated regions never overlap and never wrap around the end of
    /// memory.
    pub fn allocate(&mut self, size: usize) -> Result<usize> {
        if size == 0 || size > self.data.len() {
            return Err(self.record_violation(
                ViolationKind::Bounds,
                0,
                MemoryOp::Allocate,
                format!("allocation of {} bytes in {}-byte memory", size, self.data.len()),
            ));
        }

        let mut candidate = 0usize;
        for (&base, &len) in &self.allocations {
            if base >= candidate && base - candidate >= size {
                break;
            }
            candidate = candidate.max(base + len);
        }
        if candidate + size <= self.data.len() {
            self.allocations.insert(candidate, size);
            return Ok(candidate);
        }

        Err(self.record_violation(
            ViolationKind::Allocation,
            0,
            MemoryOp::Allocate,
            format!("no free run of {} bytes", size),
        ))
    }

    /// Free a region previously returned by `allocate`
    ///
    /// Requires the exact base; clears ownership across the freed range.
    pub fn free(&mut self, base: usize) -> Result<()> {
        match self.allocations.remove(&base) {
            Some(size) => {
                for addr in base..base + size {
                    self.transfer_ownership(addr, 0);
                }
                Ok(())
            }
            None => Err(self.record_violation(
                ViolationKind::Bounds,
                base,
                MemoryOp::Allocate,
                "free of address that is not an allocation base".to_string(),
            )),
        }
    }

    /// Install the process credited with subsequent writes (0 clears it)
    pub fn set_current_process(&mut self, pid: ProcessId) {
        self.current_process = pid;
    }

    /// Get the owner of a memory cell (0 = unowned)
    pub fn get_owner(&self, address: i64) -> ProcessId {
        self.ownership[self.normalize(address)]
    }

    /// Bulk ownership assignment used by the loader after placing an image
    pub fn set_ownership_range(&mut self, base: usize, size: usize, pid: ProcessId) {
        for offset in 0..size {
            let addr = self.normalize((base + offset) as i64);
            self.transfer_ownership(addr, pid);
        }
    }

    /// Number of cells currently owned by a process
    pub fn owned_count(&self, pid: ProcessId) -> u32 {
        self.owned_counts.get(&pid).copied().unwrap_or(0)
    }

    /// Copy raw image bytes into memory and credit them to `pid`
    ///
    /// Fails without writing anything if the target range overlaps a
    /// protected cell.
    pub fn load_bytes(&mut self, base: usize, bytes: &[u8], pid: ProcessId) -> Result<()> {
        for offset in 0..bytes.len() {
            let addr = self.normalize((base + offset) as i64);
            if self.protected.contains(&addr) {
                return Err(self.record_violation(
                    ViolationKind::Protection,
                    addr,
                    MemoryOp::Write,
                    "image load overlapping protected cell".to_string(),
                ));
            }
        }
        for (offset, &byte) in bytes.iter().enumerate() {
            let addr = self.normalize((base + offset) as i64);
            self.data[addr] = byte;
            self.transfer_ownership(addr, pid);
        }
        Ok(())
    }

    /// Violations accumulated since the last clear
    pub fn access_log(&self) -> &[AccessViolation] {
        &self.violations
    }

    /// Discard the accumulated violation log
    pub fn clear_access_log(&mut self) {
        self.violations.clear();
    }

    /// Clear data, ownership, protection and allocations
    ///
    /// The access log survives a clear; callers drop it explicitly with
    /// `clear_access_log` when they want a pristine memory.
    pub fn clear(&mut self) {
        self.data.fill(0);
        self.ownership.fill(0);
        self.protected.clear();
        self.allocations.clear();
        self.owned_counts.clear();
        self.current_process = 0;
    }

    /// Dump memory contents as a hex string for diagnostics
    pub fn dump_hex(&self, start: i64, length: usize) -> String {
        let mut result = String::new();
        for i in 0..length {
            if i % 16 == 0 {
                result.push_str(&format!("{:04X}: ", self.normalize(start + i as i64)));
            }
            result.push_str(&format!("{:02X} ", self.read(start + i as i64)));
            if i % 16 == 15 {
                result.push('\n');
            }
        }
        if length % 16 != 0 {
            result.push('\n');
        }
        result
    }

    fn transfer_ownership(&mut self, normalized: usize, new_owner: ProcessId) {
        let old = self.ownership[normalized];
        if old == new_owner {
            return;
        }
        if old != 0 {
            if let Some(count) = self.owned_counts.get_mut(&old) {
                *count = count.saturating_sub(1);
            }
        }
        if new_owner != 0 {
            *self.owned_counts.entry(new_owner).or_insert(0) += 1;
        }
        self.ownership[normalized] = new_owner;
    }

    fn record_violation(
        &mut self,
        kind: ViolationKind,
        address: usize,
        operation: MemoryOp,
        message: String,
    ) -> ArenaError {
        self.violations.push(AccessViolation {
            kind,
            address,
            operation,
            timestamp: self.sequence,
            message,
        });
        self.sequence += 1;
        ArenaError::AccessViolation {
            kind,
            address,
            operation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_creation() {
        let memory = Memory::new(4096);
        assert_eq!(memory.size(), 4096);
        assert_eq!(memory.read(0), 0);
        assert_eq!(memory.read(4095), 0);
    }

    #[test]
    fn test_wrap_write() {
        let mut memory = Memory::new(0x10000);
        memory.write(0x10000, 0x42).unwrap();
        assert_eq!(memory.read(0x0000), 0x42);

        memory.write(-1, 0x7F).unwrap();
        assert_eq!(memory.read(0xFFFF), 0x7F);
    }

    #[test]
    fn test_write_truncates_to_byte() {
        let mut memory = Memory::new(256);
        memory.write(10, 0x1FF).unwrap();
        assert_eq!(memory.read(10), 0xFF);
    }

    #[test]
    fn test_word_operations() {
        let mut memory = Memory::new(1024);
        memory.write_word(100, 0x1234).unwrap();
        assert_eq!(memory.read_word(100), 0x1234);
        assert_eq!(memory.read(100), 0x34);
        assert_eq!(memory.read(101), 0x12);

        // word straddling the end of memory wraps
        memory.write_word(1023, 0xBEEF).unwrap();
        assert_eq!(memory.read(1023), 0xEF);
        assert_eq!(memory.read(0), 0xBE);
    }

    #[test]
    fn test_protection() {
        let mut memory = Memory::new(0x2000);
        memory.write(0x1000, 0x42).unwrap();
        memory.protect(0x1000);

        let err = memory.write(0x1000, 0x43).unwrap_err();
        assert!(matches!(
            err,
            ArenaError::AccessViolation {
                kind: ViolationKind::Protection,
                ..
            }
        ));
        assert_eq!(memory.read(0x1000), 0x42);
        assert_eq!(memory.access_log().len(), 1);

        memory.unprotect(0x1000);
        memory.write(0x1000, 0x43).unwrap();
        assert_eq!(memory.read(0x1000), 0x43);
    }

    #[test]
    fn test_protection_is_idempotent() {
        let mut memory = Memory::new(64);
        memory.protect(5);
        memory.protect(5);
        assert!(memory.is_protected(5));
        memory.unprotect(5);
        assert!(!memory.is_protected(5));
        memory.unprotect(5);
        assert!(!memory.is_protected(5));
    }

    #[test]
    fn test_word_write_is_atomic_under_protection() {
        let mut memory = Memory::new(64);
        memory.write(20, 0x11).unwrap();
        memory.protect(21);
        assert!(memory.write_word(20, 0xAABB).is_err());
        // neither byte changed
        assert_eq!(memory.read(20), 0x11);
        assert_eq!(memory.read(21), 0x00);
    }

    #[test]
    fn test_ownership_tracking() {
        let mut memory = Memory::new(256);
        memory.set_current_process(3);
        memory.write(100, 0x42).unwrap();
        assert_eq!(memory.get_owner(100), 3);
        assert_eq!(memory.owned_count(3), 1);

        memory.set_current_process(4);
        memory.write(100, 0x43).unwrap();
        assert_eq!(memory.get_owner(100), 4);
        assert_eq!(memory.owned_count(3), 0);
        assert_eq!(memory.owned_count(4), 1);

        memory.set_current_process(0);
        memory.write(101, 0x44).unwrap();
        assert_eq!(memory.get_owner(101), 0);
    }

    #[test]
    fn test_first_fit_allocation() {
        let mut memory = Memory::new(256);
        let a = memory.allocate(64).unwrap();
        let b = memory.allocate(64).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 64);

        memory.free(a).unwrap();
        let c = memory.allocate(32).unwrap();
        assert_eq!(c, 0); // first fit reuses the hole

        let d = memory.allocate(32).unwrap();
        assert_eq!(d, 32);
    }

    #[test]
    fn test_allocation_exhaustion() {
        let mut memory = Memory::new(128);
        memory.allocate(100).unwrap();
        let err = memory.allocate(64).unwrap_err();
        assert!(matches!(
            err,
            ArenaError::AccessViolation {
                kind: ViolationKind::Allocation,
                ..
            }
        ));
        assert_eq!(memory.access_log().len(), 1);
    }

    #[test]
    fn test_free_requires_exact_base() {
        let mut memory = Memory::new(128);
        let base = memory.allocate(32).unwrap();
        assert!(memory.free(base + 1).is_err());
        assert!(memory.free(base).is_ok());
        // double free is a bounds violation
        assert!(memory.free(base).is_err());
    }

    #[test]
    fn test_free_clears_ownership() {
        let mut memory = Memory::new(128);
        let base = memory.allocate(16).unwrap();
        memory.set_ownership_range(base, 16, 9);
        assert_eq!(memory.owned_count(9), 16);
        memory.free(base).unwrap();
        assert_eq!(memory.get_owner(base as i64), 0);
        assert_eq!(memory.owned_count(9), 0);
    }

    #[test]
    fn test_load_bytes() {
        let mut memory = Memory::new(256);
        memory.load_bytes(100, &[1, 2, 3, 4], 2).unwrap();
        assert_eq!(memory.read(100), 1);
        assert_eq!(memory.read(103), 4);
        assert_eq!(memory.get_owner(100), 2);
        assert_eq!(memory.owned_count(2), 4);
    }

    #[test]
    fn test_violation_timestamps_are_monotone() {
        let mut memory = Memory::new(64);
        memory.protect(1);
        let _ = memory.write(1, 0);
        let _ = memory.write(1, 0);
        let log = memory.access_log();
        assert_eq!(log.len(), 2);
        assert!(log[0].timestamp < log[1].timestamp);
    }
}

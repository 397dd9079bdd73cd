//! Memory and register handling for the simulator.
//!
//! This module consists of:
//! - [`MemoryDevice`]: The byte/word access surface shared by every layer of the memory hierarchy.
//! - [`paged`]: The paged memory store (the flat address space).
//! - [`cold`]: Disk-backed cold storage for evicted pages.
//! - [`Memory`]: The memory hierarchy attached to a simulator.
//! - [`RegFile`]: The general-purpose register file.
//! - [`Cp0`]: The system control coprocessor registers.

pub mod cold;
pub mod paged;

use serde::{Deserialize, Serialize};

use crate::ast::Reg;
use super::cache::Cache;
use super::SimErr;
use self::paged::PagedMemory;

/// Byte order of multi-byte accesses.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Endianness {
    /// Least significant byte at the lowest address.
    #[default]
    Little,
    /// Most significant byte at the lowest address.
    Big,
}
impl Endianness {
    /// Assembles a word from its bytes in address order.
    pub fn word_from_bytes(self, bytes: [u8; 4]) -> u32 {
        match self {
            Endianness::Little => u32::from_le_bytes(bytes),
            Endianness::Big    => u32::from_be_bytes(bytes),
        }
    }
    /// Splits a word into its bytes in address order.
    pub fn word_to_bytes(self, word: u32) -> [u8; 4] {
        match self {
            Endianness::Little => word.to_le_bytes(),
            Endianness::Big    => word.to_be_bytes(),
        }
    }
    /// Assembles a halfword from its bytes in address order.
    pub fn half_from_bytes(self, bytes: [u8; 2]) -> u16 {
        match self {
            Endianness::Little => u16::from_le_bytes(bytes),
            Endianness::Big    => u16::from_be_bytes(bytes),
        }
    }
    /// Splits a halfword into its bytes in address order.
    pub fn half_to_bytes(self, half: u16) -> [u8; 2] {
        match self {
            Endianness::Little => half.to_le_bytes(),
            Endianness::Big    => half.to_be_bytes(),
        }
    }
}

/// Computes `addr + offset`, failing if the address wraps past the 32-bit space.
pub(crate) fn offset_addr(addr: u32, offset: u32, size: u64) -> Result<u32, SimErr> {
    addr.checked_add(offset)
        .ok_or(SimErr::AddressOutOfRange { addr: u64::from(addr) + u64::from(offset), size })
}

/// A byte-addressable memory.
///
/// Every layer of the memory hierarchy (the paged store, caches, and [`Memory`])
/// implements this trait, so a cache can be substituted for the memory it fronts.
///
/// Only the byte accessors are required. Halfword and word accessors are assembled from
/// byte accesses in the device's [`Endianness`]. None of these accessors check alignment;
/// that is the responsibility of the executing core.
///
/// Accesses take `&mut self` since reading can load pages or fill cache lines.
pub trait MemoryDevice {
    /// Reads the byte at the given address.
    fn read_byte(&mut self, addr: u32) -> Result<u8, SimErr>;

    /// Writes the byte at the given address.
    fn write_byte(&mut self, addr: u32, data: u8) -> Result<(), SimErr>;

    /// The byte order of this device's multi-byte accesses.
    fn endianness(&self) -> Endianness;

    /// Number of addressable bytes.
    fn size(&self) -> u64;

    /// Propagates any deferred writes to the layer below (or to disk).
    ///
    /// After this call, every write made through this device is visible
    /// in whatever this device is backed by.
    fn flush(&mut self) -> Result<(), SimErr>;

    /// Reads the halfword at the given address.
    fn read_half(&mut self, addr: u32) -> Result<u16, SimErr> {
        let size = self.size();
        let bytes = [
            self.read_byte(addr)?,
            self.read_byte(offset_addr(addr, 1, size)?)?,
        ];
        Ok(self.endianness().half_from_bytes(bytes))
    }

    /// Reads the word at the given address.
    fn read_word(&mut self, addr: u32) -> Result<u32, SimErr> {
        let mut bytes = [0; 4];
        self.read_bytes(addr, &mut bytes)?;
        Ok(self.endianness().word_from_bytes(bytes))
    }

    /// Writes the halfword at the given address.
    fn write_half(&mut self, addr: u32, data: u16) -> Result<(), SimErr> {
        let bytes = self.endianness().half_to_bytes(data);
        self.write_bytes(addr, &bytes)
    }

    /// Writes the word at the given address.
    fn write_word(&mut self, addr: u32, data: u32) -> Result<(), SimErr> {
        let bytes = self.endianness().word_to_bytes(data);
        self.write_bytes(addr, &bytes)
    }

    /// Reads consecutive bytes starting at the given address.
    fn read_bytes(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), SimErr> {
        let size = self.size();
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.read_byte(offset_addr(addr, i as u32, size)?)?;
        }
        Ok(())
    }

    /// Writes consecutive bytes starting at the given address.
    fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), SimErr> {
        let size = self.size();
        for (i, &b) in data.iter().enumerate() {
            self.write_byte(offset_addr(addr, i as u32, size)?, b)?;
        }
        Ok(())
    }
}
impl dyn MemoryDevice {} // assert MemoryDevice is dyn safe

impl<M: MemoryDevice + ?Sized> MemoryDevice for Box<M> {
    fn read_byte(&mut self, addr: u32) -> Result<u8, SimErr> {
        (**self).read_byte(addr)
    }
    fn write_byte(&mut self, addr: u32, data: u8) -> Result<(), SimErr> {
        (**self).write_byte(addr, data)
    }
    fn endianness(&self) -> Endianness {
        (**self).endianness()
    }
    fn size(&self) -> u64 {
        (**self).size()
    }
    fn flush(&mut self) -> Result<(), SimErr> {
        (**self).flush()
    }
}

/// The memory hierarchy attached to a simulator.
///
/// This is either the paged store directly, the paged store behind a cache,
/// or some custom [`MemoryDevice`].
pub enum Memory {
    /// Uncached access to the paged memory store.
    Paged(PagedMemory),
    /// Access through a cache in front of the paged memory store.
    Cached(Cache<PagedMemory>),
    /// A custom memory device.
    Custom(Box<dyn MemoryDevice + Send>),
}
impl Memory {
    /// Creates a custom memory.
    pub fn custom(device: impl MemoryDevice + Send + 'static) -> Self {
        Memory::Custom(Box::new(device))
    }

    /// The cache in front of the memory store, if there is one.
    pub fn cache(&self) -> Option<&Cache<PagedMemory>> {
        match self {
            Memory::Cached(c) => Some(c),
            _ => None,
        }
    }
    /// The cache in front of the memory store, if there is one.
    pub fn cache_mut(&mut self) -> Option<&mut Cache<PagedMemory>> {
        match self {
            Memory::Cached(c) => Some(c),
            _ => None,
        }
    }

    /// Flushes all layers and releases the memory.
    ///
    /// This must be called (or [`MemoryDevice::flush`] must be) before relying on
    /// the contents of cold storage.
    pub fn close(self) -> Result<(), SimErr> {
        match self {
            Memory::Paged(m)  => m.close(),
            Memory::Cached(c) => c.close()?.close(),
            Memory::Custom(mut m) => m.flush(),
        }
    }
}
impl From<PagedMemory> for Memory {
    fn from(value: PagedMemory) -> Self {
        Memory::Paged(value)
    }
}
impl From<Cache<PagedMemory>> for Memory {
    fn from(value: Cache<PagedMemory>) -> Self {
        Memory::Cached(value)
    }
}
impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paged(m)  => f.debug_tuple("Paged").field(m).finish(),
            Self::Cached(c) => f.debug_tuple("Cached").field(c).finish(),
            Self::Custom(_) => f.debug_struct("Custom").finish_non_exhaustive(),
        }
    }
}
impl MemoryDevice for Memory {
    fn read_byte(&mut self, addr: u32) -> Result<u8, SimErr> {
        match self {
            Memory::Paged(m)  => m.read_byte(addr),
            Memory::Cached(c) => c.read_byte(addr),
            Memory::Custom(m) => m.read_byte(addr),
        }
    }

    fn write_byte(&mut self, addr: u32, data: u8) -> Result<(), SimErr> {
        match self {
            Memory::Paged(m)  => m.write_byte(addr, data),
            Memory::Cached(c) => c.write_byte(addr, data),
            Memory::Custom(m) => m.write_byte(addr, data),
        }
    }

    fn endianness(&self) -> Endianness {
        match self {
            Memory::Paged(m)  => m.endianness(),
            Memory::Cached(c) => c.endianness(),
            Memory::Custom(m) => m.endianness(),
        }
    }

    fn size(&self) -> u64 {
        match self {
            Memory::Paged(m)  => m.size(),
            Memory::Cached(c) => c.size(),
            Memory::Custom(m) => m.size(),
        }
    }

    fn flush(&mut self) -> Result<(), SimErr> {
        match self {
            Memory::Paged(m)  => m.flush(),
            Memory::Cached(c) => {
                c.flush()?;
                c.backing_mut().flush()
            },
            Memory::Custom(m) => m.flush(),
        }
    }
}

/// The register file.
///
/// This holds the 32 general-purpose registers and the `hi`/`lo` multiply/divide registers.
/// Register `$zero` is hard-wired: writes to it are discarded.
///
/// # Example
///
/// ```
/// use mips_ensemble::sim::mem::RegFile;
/// use mips_ensemble::ast::reg_consts::{T0, ZERO};
///
/// let mut reg = RegFile::new();
/// reg.set(T0, 11);
/// reg.set(ZERO, 11);
/// assert_eq!(reg[T0], 11);
/// assert_eq!(reg[ZERO], 0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegFile {
    gpr: [u32; 32],
    /// The `hi` register (high word of products, remainder of divisions).
    pub hi: u32,
    /// The `lo` register (low word of products, quotient of divisions).
    pub lo: u32,
}
impl RegFile {
    /// Creates a zeroed register file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a register. Writes to `$zero` are ignored.
    pub fn set(&mut self, reg: Reg, data: u32) {
        if reg.0 != 0 {
            self.gpr[usize::from(reg)] = data;
        }
    }

    /// All general-purpose register values, indexed by register number.
    pub fn as_slice(&self) -> &[u32; 32] {
        &self.gpr
    }
}
impl std::ops::Index<Reg> for RegFile {
    type Output = u32;

    fn index(&self, index: Reg) -> &Self::Output {
        &self.gpr[usize::from(index)]
    }
}

/// The system control coprocessor (CP0) registers used for exception handling.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cp0 {
    /// Address of the most recent faulting access (register 8).
    pub bad_vaddr: u32,
    /// Processor status (register 12).
    pub status: u32,
    /// Cause of the most recent exception (register 13).
    pub cause: u32,
    /// Address of the instruction that raised the most recent exception (register 14).
    pub epc: u32,
}
impl Cp0 {
    /// CP0 register number of `BadVAddr`.
    pub const BAD_VADDR: u8 = 8;
    /// CP0 register number of `Status`.
    pub const STATUS: u8 = 12;
    /// CP0 register number of `Cause`.
    pub const CAUSE: u8 = 13;
    /// CP0 register number of `EPC`.
    pub const EPC: u8 = 14;

    /// The exception level bit of `Status`.
    pub const STATUS_EXL: u32 = 1 << 1;

    /// Reads a CP0 register by number (unimplemented registers read as 0).
    pub fn get(&self, reg: Reg) -> u32 {
        match reg.0 {
            Self::BAD_VADDR => self.bad_vaddr,
            Self::STATUS    => self.status,
            Self::CAUSE     => self.cause,
            Self::EPC       => self.epc,
            _ => 0,
        }
    }

    /// Writes a CP0 register by number (writes to unimplemented registers are dropped).
    pub fn set(&mut self, reg: Reg, data: u32) {
        match reg.0 {
            Self::BAD_VADDR => self.bad_vaddr = data,
            Self::STATUS    => self.status = data,
            Self::CAUSE     => self.cause = data,
            Self::EPC       => self.epc = data,
            _ => {},
        }
    }
}

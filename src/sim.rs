//! Simulating and execution of MIPS machine code.
//!
//! The simulator module consists of several items:
//! - [`Simulator`]: The single-cycle execution core.
//! - [`pipeline::PipelinedSimulator`]: A five-stage pipelined execution core with the same architectural results.
//! - [`mem`]: The paged memory model, along with the register file and CP0 registers.
//! - [`cache`]: A configurable cache which sits between the core and paged memory.
//! - [`exception`]: Exception signals and the handler interface they are dispatched to.
//! - [`io`]: The character streams a program's OS layer reads from and writes to.
//! - [`os`]: A small console OS which services common syscalls.
//!
//! # Usage
//!
//! A simulator is created from a memory and a set of [`SimFlags`].
//! A program is loaded into memory as a set of [`Segment`]s, then the simulator is clocked
//! until [`Simulator::is_execution_finished`] holds:
//!
//! ```
//! use mips_ensemble::ast::instr::{Instruction, IOp, ROp};
//! use mips_ensemble::ast::reg_consts::{T0, V0, ZERO};
//! use mips_ensemble::sim::{Segment, SimFlags, Simulator};
//! use mips_ensemble::sim::mem::Endianness;
//! use mips_ensemble::sim::mem::paged::{MemoryConfig, PagedMemory};
//! use mips_ensemble::sim::os::ConsoleOs;
//!
//! let mem = PagedMemory::new(&MemoryConfig { size: 1 << 20, ..Default::default() }).unwrap();
//! let mut sim = Simulator::new(SimFlags::default(), mem);
//!
//! let program = [
//!     Instruction::imm(IOp::Addiu, T0, ZERO, 3),
//!     Instruction::imm(IOp::Addiu, T0, T0, 1),
//!     Instruction::imm(IOp::Addiu, V0, ZERO, 10), // exit
//!     Instruction::reg(ROp::Syscall, ZERO, ZERO, ZERO),
//! ];
//! sim.load_segments(&[Segment::from_instrs(0x1000, &program, Endianness::Little)]).unwrap();
//! sim.set_entry_point(0x1000);
//! sim.set_handler(ConsoleOs::new());
//!
//! sim.run().unwrap();
//! assert_eq!(sim.reg_file[T0], 4);
//! assert!(sim.hit_halt());
//! ```
//!
//! # Querying state
//!
//! - The PC, register file, and CP0 registers are available as the `pc`, `reg_file`, and `cp0` fields.
//! - Memory is available as the `mem` field. Accessing memory through it goes through the cache (if one is configured),
//!   so those accesses are counted in the cache's statistics.
//!
//! ```
//! use mips_ensemble::ast::reg_consts::T0;
//! use mips_ensemble::sim::{SimFlags, Simulator};
//! use mips_ensemble::sim::mem::MemoryDevice;
//! use mips_ensemble::sim::mem::paged::{MemoryConfig, PagedMemory};
//!
//! let mem = PagedMemory::new(&MemoryConfig { size: 1 << 16, ..Default::default() }).unwrap();
//! let mut sim = Simulator::new(SimFlags::default(), mem);
//!
//! sim.reg_file.set(T0, 0x1234);
//! assert_eq!(sim.reg_file[T0], 0x1234);
//!
//! sim.mem.write_word(0x3000, 0x5678).unwrap();
//! assert_eq!(sim.mem.read_word(0x3000).unwrap(), 0x5678);
//! assert!(sim.mem.read_word(0x10000).is_err());
//! ```

pub mod barrier;
pub mod cache;
pub mod exception;
pub mod exec;
pub mod io;
pub mod mem;
pub mod observer;
pub mod os;
pub mod pipeline;

use std::ops::Range;

use crate::ast::instr::{DecodeErr, Instruction};
use crate::ast::reg_consts::{GP, SP};
use crate::ast::Reg;
use crate::config::MachineConfig;
use exception::{Continuation, ExceptionHandler, ExceptionKind, ExceptionSignal, MachineView};
use exec::{Branch, Effect, MemOp, Operands, Width};
use io::{CharIO, SimIO};
use mem::{Cp0, Endianness, Memory, MemoryDevice, RegFile};

/// Errors that can occur during simulation.
#[derive(Debug)]
pub enum SimErr {
    /// A configuration value was invalid.
    InvalidConfig(String),
    /// A configuration file could not be parsed.
    ConfigParse(toml::de::Error),
    /// A configuration file could not be read.
    ConfigIo(std::io::Error),
    /// An address was outside of the memory's address space.
    AddressOutOfRange {
        /// The first address accessed.
        addr: u64,
        /// The size of the address space.
        size: u64,
    },
    /// An access was not aligned to its width.
    UnalignedAccess {
        /// The address accessed.
        addr: u32,
        /// The required alignment.
        align: u32,
    },
    /// A word could not be decoded into an instruction.
    UnrecognizedInstr(u32),
    /// Reading or writing cold storage failed.
    ColdStorage(std::io::Error),
    /// An exception was raised, but no handler was attached to service it.
    NoDispatcher(ExceptionKind),
}

/// The category an error falls into (see [`SimErr::kind`]).
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum SimErrKind {
    /// The machine was misconfigured.
    Config,
    /// A memory access was invalid.
    Address,
    /// An instruction could not be decoded.
    Decode,
    /// A host I/O operation failed.
    Io,
    /// An exception could not be dispatched.
    Dispatch,
}

impl SimErr {
    /// The category of this error.
    pub fn kind(&self) -> SimErrKind {
        match self {
            SimErr::InvalidConfig(_) => SimErrKind::Config,
            SimErr::ConfigParse(_) => SimErrKind::Config,
            SimErr::ConfigIo(_) => SimErrKind::Io,
            SimErr::AddressOutOfRange { .. } => SimErrKind::Address,
            SimErr::UnalignedAccess { .. } => SimErrKind::Address,
            SimErr::UnrecognizedInstr(_) => SimErrKind::Decode,
            SimErr::ColdStorage(_) => SimErrKind::Io,
            SimErr::NoDispatcher(_) => SimErrKind::Dispatch,
        }
    }
}
impl std::fmt::Display for SimErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimErr::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            SimErr::ConfigParse(e) => write!(f, "could not parse configuration: {e}"),
            SimErr::ConfigIo(e) => write!(f, "could not read configuration: {e}"),
            SimErr::AddressOutOfRange { addr, size } => write!(f, "address {addr:#x} is outside of memory (size {size:#x})"),
            SimErr::UnalignedAccess { addr, align } => write!(f, "address {addr:#010x} is not aligned to {align} bytes"),
            SimErr::UnrecognizedInstr(word) => write!(f, "unrecognized instruction {word:#010x}"),
            SimErr::ColdStorage(e) => write!(f, "cold storage failure: {e}"),
            SimErr::NoDispatcher(kind) => write!(f, "{kind} raised with no exception handler attached"),
        }
    }
}
impl std::error::Error for SimErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SimErr::ConfigParse(e) => Some(e),
            SimErr::ConfigIo(e) => Some(e),
            SimErr::ColdStorage(e) => Some(e),
            _ => None,
        }
    }
}
impl From<DecodeErr> for SimErr {
    fn from(value: DecodeErr) -> Self {
        SimErr::UnrecognizedInstr(value.0)
    }
}

/// Configuration flags for [`Simulator`] and [`pipeline::PipelinedSimulator`].
///
/// These can be modified after the simulator is created with [`Simulator::new`]
/// and their effects should still apply.
///
/// Read the field descriptions for more details.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SimFlags {
    /// Whether to emulate branch-delay slots.
    ///
    /// If true, the instruction physically following a taken branch or jump
    /// executes before the branch target is entered,
    /// and linking instructions save `pc + 8` rather than `pc + 4`.
    ///
    /// This is `false` by default.
    pub branch_delay_slot: bool,

    /// The initial value of `$sp`.
    ///
    /// If unset, `$sp` starts at the highest word-aligned address of memory.
    /// This is only consulted when the simulator is created.
    pub initial_sp: Option<u32>,
}

/// A contiguous range of bytes to load into memory.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Segment {
    /// The address of the first byte.
    pub addr: u32,
    /// The segment's contents.
    pub bytes: Vec<u8>,
}
impl Segment {
    /// Creates a segment from raw bytes.
    pub fn new(addr: u32, bytes: Vec<u8>) -> Self {
        Self { addr, bytes }
    }

    /// Creates a segment holding words laid out in the given byte order.
    pub fn from_words(addr: u32, words: &[u32], endianness: Endianness) -> Self {
        let bytes = words.iter()
            .flat_map(|&w| endianness.word_to_bytes(w))
            .collect();
        Self { addr, bytes }
    }

    /// Creates a segment holding encoded instructions.
    pub fn from_instrs(addr: u32, instrs: &[Instruction], endianness: Endianness) -> Self {
        let words: Vec<_> = instrs.iter().map(Instruction::encode).collect();
        Self::from_words(addr, &words, endianness)
    }

    /// The addresses this segment covers.
    pub fn range(&self) -> Range<u64> {
        let start = u64::from(self.addr);
        start..start + self.bytes.len() as u64
    }
}

/// A loadable program, as produced by an assembler or loader.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct ProgramImage {
    /// The segments to load.
    pub segments: Vec<Segment>,
    /// The address execution begins at.
    pub entry: u32,
    /// The value of the `_gp` symbol, if defined. This becomes the initial `$gp`.
    pub gp: Option<u32>,
    /// The value of the `__end` symbol, if defined. This becomes the program end.
    pub end: Option<u32>,
}

/// Bookkeeping for where a loaded program ends.
#[derive(Debug, Default)]
pub(crate) struct ProgramBounds {
    loaded: Vec<Range<u64>>,
    entry: u32,
    end: Option<u64>,
}
impl ProgramBounds {
    /// The program end: the explicit end if set,
    /// otherwise the end of the loaded segment holding the entry point.
    ///
    /// If neither exists, execution never finishes by reaching the end.
    pub(crate) fn end(&self) -> u64 {
        self.end
            .or_else(|| {
                self.loaded.iter()
                    .rev()
                    .find(|r| r.contains(&u64::from(self.entry)))
                    .map(|r| r.end)
            })
            .unwrap_or(u64::MAX)
    }
}

/// Writes segments into memory, recording their ranges.
pub(crate) fn write_segments(mem: &mut Memory, bounds: &mut ProgramBounds, segments: &[Segment]) -> Result<(), SimErr> {
    for seg in segments {
        mem.write_bytes(seg.addr, &seg.bytes)?;
        log::debug!("loaded {} bytes at {:#010x}", seg.bytes.len(), seg.addr);
        bounds.loaded.push(seg.range());
    }
    Ok(())
}

/// The initial stack pointer for a memory, unless overridden by flags.
pub(crate) fn initial_sp(flags: &SimFlags, mem: &Memory) -> u32 {
    flags.initial_sp
        .unwrap_or_else(|| (mem.size().saturating_sub(4).min(u64::from(u32::MAX)) as u32) & !3)
}

fn check_align(addr: u32, align: u32) -> Result<(), SimErr> {
    match addr % align {
        0 => Ok(()),
        _ => Err(SimErr::UnalignedAccess { addr, align })
    }
}

/// Reads the instruction word at `pc`.
pub(crate) fn fetch(mem: &mut Memory, pc: u32) -> Result<u32, SimErr> {
    check_align(pc, 4)?;
    mem.read_word(pc)
}

/// Performs a load or store, returning the register write a load produces.
pub(crate) fn access_mem(mem: &mut Memory, op: &MemOp) -> Result<Option<(Reg, u32)>, SimErr> {
    match *op {
        MemOp::Load { addr, width, signed, dest } => {
            check_align(addr, width.bytes())?;
            let value = match (width, signed) {
                (Width::Byte, true)  => mem.read_byte(addr)? as i8 as i32 as u32,
                (Width::Byte, false) => u32::from(mem.read_byte(addr)?),
                (Width::Half, true)  => mem.read_half(addr)? as i16 as i32 as u32,
                (Width::Half, false) => u32::from(mem.read_half(addr)?),
                (Width::Word, _)     => mem.read_word(addr)?,
            };
            Ok(Some((dest, value)))
        },
        MemOp::Store { addr, width, value } => {
            check_align(addr, width.bytes())?;
            match width {
                Width::Byte => mem.write_byte(addr, value as u8)?,
                Width::Half => mem.write_half(addr, value as u16)?,
                Width::Word => mem.write_word(addr, value)?,
            }
            Ok(None)
        },
    }
}

/// Applies the register-level results of an instruction.
pub(crate) fn write_back(reg_file: &mut RegFile, cp0: &mut Cp0, fx: &Effect, loaded: Option<(Reg, u32)>) {
    if let Some((reg, value)) = fx.write {
        reg_file.set(reg, value);
    }
    if let Some((reg, value)) = loaded {
        reg_file.set(reg, value);
    }
    if let Some((hi, lo)) = fx.hilo {
        reg_file.hi = hi;
        reg_file.lo = lo;
    }
    if let Some((reg, value)) = fx.cp0 {
        cp0.set(reg, value);
    }
    if fx.eret {
        cp0.status &= !Cp0::STATUS_EXL;
    }
}

/// Executes MIPS machine code, one whole instruction per clock.
///
/// This can be created with [`Simulator::new`] or [`Simulator::from_config`].
pub struct Simulator {
    // ------------------ SIMULATION STATE ------------------
    // Calling [`Simulator::close`] flushes memory (and any cache) to cold storage.

    /// The simulator's memory.
    ///
    /// Accesses through this field go through the cache, if one is configured.
    pub mem: Memory,

    /// The general purpose registers, along with `hi` and `lo`.
    pub reg_file: RegFile,

    /// The CP0 (system control) registers.
    pub cp0: Cp0,

    /// The program counter.
    pub pc: u32,

    /// The target of a taken branch whose delay slot has not yet executed.
    pending_branch: Option<u32>,

    /// Whether execution has been halted (by the exception handler or by an error).
    halted: bool,
    /// Whether memory was already flushed by [`Simulator::close`].
    closed: bool,

    bounds: ProgramBounds,

    // ------------------ CONFIG/DEBUG STATE ------------------

    /// Configuration settings for the simulator.
    ///
    /// These are preserved between loads.
    /// See [`SimFlags`] for more details on what configuration
    /// settings are available.
    pub flags: SimFlags,

    /// The number of instructions successfully run since this `Simulator` was created.
    pub instructions_run: u64,

    /// The character streams available to the exception handler.
    io: SimIO,

    /// The attached exception handler.
    handler: Option<Box<dyn ExceptionHandler + Send>>,
}
impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("mem", &self.mem)
            .field("reg_file", &self.reg_file)
            .field("cp0", &self.cp0)
            .field("pc", &self.pc)
            .field("pending_branch", &self.pending_branch)
            .field("halted", &self.halted)
            .field("flags", &self.flags)
            .field("instructions_run", &self.instructions_run)
            .field("io", &self.io)
            .field("has_handler", &self.handler.is_some())
            .finish_non_exhaustive()
    }
}

impl Simulator {
    /// Creates a new simulator over the given memory.
    ///
    /// All registers start at 0, except `$sp` (see [`SimFlags::initial_sp`]).
    pub fn new(flags: SimFlags, mem: impl Into<Memory>) -> Self {
        let mem = mem.into();
        let mut reg_file = RegFile::new();
        reg_file.set(SP, initial_sp(&flags, &mem));

        Self {
            mem,
            reg_file,
            cp0: Cp0::default(),
            pc: 0,
            pending_branch: None,
            halted: false,
            closed: false,
            bounds: ProgramBounds::default(),
            flags,
            instructions_run: 0,
            io: SimIO::Empty,
            handler: None,
        }
    }

    /// Creates a new simulator from a machine configuration.
    pub fn from_config(config: &MachineConfig) -> Result<Self, SimErr> {
        Ok(Self::new(config.cpu, config.build_memory()?))
    }

    /// Writes segments into memory.
    ///
    /// This does not change the PC. See [`Simulator::set_entry_point`].
    pub fn load_segments(&mut self, segments: &[Segment]) -> Result<(), SimErr> {
        write_segments(&mut self.mem, &mut self.bounds, segments)
    }

    /// Sets the PC to the program's entry point.
    pub fn set_entry_point(&mut self, entry: u32) {
        self.bounds.entry = entry;
        self.pc = entry;
        self.pending_branch = None;
        self.halted = false;
    }

    /// Sets the address at which execution is considered finished.
    pub fn set_program_end(&mut self, end: u32) {
        self.bounds.end = Some(u64::from(end));
    }

    /// The address at which execution is considered finished.
    ///
    /// If not explicitly set, this is the end of the loaded segment holding the entry point.
    pub fn program_end(&self) -> u64 {
        self.bounds.end()
    }

    /// Loads a whole program image, setting the entry point, `$gp`, and program end.
    pub fn load_image(&mut self, image: &ProgramImage) -> Result<(), SimErr> {
        self.load_segments(&image.segments)?;
        if let Some(gp) = image.gp {
            self.reg_file.set(GP, gp);
        }
        if let Some(end) = image.end {
            self.set_program_end(end);
        }
        self.set_entry_point(image.entry);
        log::info!("loaded program with entry point {:#010x}", image.entry);
        Ok(())
    }

    /// Attaches an exception handler, replacing any previously attached one.
    pub fn set_handler(&mut self, handler: impl ExceptionHandler + Send + 'static) {
        self.handler = Some(Box::new(handler));
    }

    /// Detaches the exception handler, returning it.
    pub fn take_handler(&mut self) -> Option<Box<dyn ExceptionHandler + Send>> {
        self.handler.take()
    }

    /// Sets the character streams the exception handler uses.
    pub fn open_io<IO: Into<SimIO>>(&mut self, io: IO) {
        self.io.close();
        self.io = io.into();
    }

    /// Closes the character streams, replacing them with [`SimIO::Empty`].
    pub fn close_io(&mut self) {
        self.io.close();
        self.io = SimIO::Empty;
    }

    /// The target of a taken branch whose delay slot is about to execute, if any.
    pub fn pending_branch(&self) -> Option<u32> {
        self.pending_branch
    }

    /// Whether execution was halted (by the exception handler or by an error).
    pub fn hit_halt(&self) -> bool {
        self.halted
    }

    /// Whether execution has finished.
    ///
    /// This is true once the simulator halts, or once the PC reaches or passes the program end.
    pub fn is_execution_finished(&self) -> bool {
        self.halted || (self.pending_branch.is_none() && u64::from(self.pc) >= self.bounds.end())
    }

    /// Executes one instruction.
    ///
    /// If an error occurs, the simulator halts and the error is returned.
    /// Clocking a halted simulator does nothing.
    pub fn clock(&mut self) -> Result<(), SimErr> {
        if self.halted { return Ok(()); }

        let result = self.step();
        if let Err(e) = &result {
            log::debug!("halted at {:#010x}: {e}", self.pc);
            self.halted = true;
        }
        result
    }

    fn step(&mut self) -> Result<(), SimErr> {
        let pc = self.pc;
        let instr = Instruction::decode(fetch(&mut self.mem, pc)?)?;
        log::trace!("{pc:#010x}: {instr}");

        let ops = Operands::read(&instr, &self.reg_file, &self.cp0);
        let fx = exec::execute(&instr, pc, &ops, self.flags.branch_delay_slot);
        let next_pc = self.pending_branch.unwrap_or(pc.wrapping_add(4));

        if let Some(kind) = fx.signal {
            self.pending_branch = None;
            self.instructions_run += 1;

            let signal = ExceptionSignal { kind, instr, code: instr.code(), pc, resume_pc: next_pc };
            return self.raise(signal);
        }

        let loaded = match &fx.mem {
            Some(op) => access_mem(&mut self.mem, op)?,
            None => None,
        };
        write_back(&mut self.reg_file, &mut self.cp0, &fx, loaded);

        self.pending_branch = None;
        self.pc = match fx.branch {
            Some(Branch { target, delayed: true }) => {
                self.pending_branch = Some(target);
                next_pc
            },
            Some(Branch { target, delayed: false }) => target,
            None => next_pc,
        };
        self.instructions_run += 1;
        Ok(())
    }

    fn raise(&mut self, signal: ExceptionSignal) -> Result<(), SimErr> {
        let machine = MachineView {
            reg_file: &mut self.reg_file,
            cp0: &mut self.cp0,
            mem: &mut self.mem,
            io: &self.io,
        };

        match exception::dispatch(self.handler.as_deref_mut(), &signal, machine)? {
            Continuation::Resume(pc) => self.pc = pc,
            Continuation::Halt => {
                log::info!("halted by {} at {:#010x}", signal.kind, signal.pc);
                self.halted = true;
            },
        }
        Ok(())
    }

    /// Clocks the simulator while the tripwire condition holds and execution has not finished.
    pub fn run_while(&mut self, mut tripwire: impl FnMut(&mut Simulator) -> bool) -> Result<(), SimErr> {
        while !self.is_execution_finished() && tripwire(self) {
            self.clock()?;
        }
        Ok(())
    }

    /// Clocks the simulator until execution finishes.
    pub fn run(&mut self) -> Result<(), SimErr> {
        self.run_while(|_| true)
    }

    /// Clocks the simulator until execution finishes or `max_steps` instructions have run.
    pub fn run_with_limit(&mut self, max_steps: u64) -> Result<(), SimErr> {
        let i = self.instructions_run;
        self.run_while(|sim| sim.instructions_run.wrapping_sub(i) < max_steps)
    }

    /// Flushes memory to cold storage and closes the character streams.
    pub fn close(mut self) -> Result<(), SimErr> {
        self.closed = true;
        self.io.close();
        self.mem.flush()
    }
}
impl Drop for Simulator {
    fn drop(&mut self) {
        if self.closed { return; }
        self.io.close();
        if let Err(e) = self.mem.flush() {
            log::warn!("could not flush memory on drop: {e}");
        }
    }
}

//! Exception dispatch.
//!
//! When the execution core executes `syscall`, `break`, a trap whose condition holds,
//! or a trapping arithmetic instruction that overflows, it raises an [`ExceptionSignal`].
//! The signal is routed to the attached [`ExceptionHandler`] (the OS emulation layer),
//! which returns a [`Continuation`] telling the core where to go next.
//!
//! On entry, the core records the signal in CP0: `EPC` holds the faulting instruction's address,
//! `Cause` holds the signal's exception code, and the exception-level bit of `Status` is set.
//! The handler receives a [`MachineView`], lending it the machine state for the duration of the call.
//!
//! If no handler is attached when a signal fires, the core halts with [`SimErr::NoDispatcher`].
//!
//! # Example
//!
//! ```
//! use mips_ensemble::sim::SimErr;
//! use mips_ensemble::sim::exception::{Continuation, ExceptionKind, ExceptionSignal, HandlerFn, MachineView};
//!
//! // resumes after syscalls, halts on anything else
//! let handler = HandlerFn(|signal: &ExceptionSignal, _: MachineView<'_>| -> Result<Continuation, SimErr> {
//!     match signal.kind {
//!         ExceptionKind::Syscall => Ok(Continuation::Resume(signal.resume_pc)),
//!         _ => Ok(Continuation::Halt),
//!     }
//! });
//! # let _ = handler;
//! ```

use crate::ast::instr::Instruction;
use super::io::SimIO;
use super::mem::{Cp0, Memory, RegFile};
use super::SimErr;

/// The architectural kind of an exception signal.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ExceptionKind {
    /// A `syscall` instruction.
    Syscall,
    /// A `break` instruction.
    Break,
    /// A trap instruction whose condition held.
    Trap,
    /// Signed overflow in `add`, `addi`, or `sub`.
    Overflow,
}
impl ExceptionKind {
    /// The exception code recorded in bits 6..2 of the `Cause` register.
    pub fn cause_code(self) -> u32 {
        match self {
            ExceptionKind::Syscall  => 8,
            ExceptionKind::Break    => 9,
            ExceptionKind::Overflow => 12,
            ExceptionKind::Trap     => 13,
        }
    }
}
impl std::fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExceptionKind::Syscall  => f.write_str("syscall"),
            ExceptionKind::Break    => f.write_str("break"),
            ExceptionKind::Trap     => f.write_str("trap"),
            ExceptionKind::Overflow => f.write_str("arithmetic overflow"),
        }
    }
}

/// A signal raised by the execution core.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ExceptionSignal {
    /// The kind of signal.
    pub kind: ExceptionKind,
    /// The instruction that raised it.
    pub instr: Instruction,
    /// The raw code payload of the instruction (see [`Instruction::code`]).
    pub code: u32,
    /// The address of the instruction that raised it.
    pub pc: u32,
    /// The address execution would have continued at, had no signal been raised.
    ///
    /// This is the instruction after `pc`, or the pending branch target if the signal
    /// was raised in a branch-delay slot.
    pub resume_pc: u32,
}

/// What the core should do after a signal has been handled.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Continuation {
    /// Continue execution at the given address.
    Resume(u32),
    /// Stop execution.
    Halt,
}

/// The machine state lent to an [`ExceptionHandler`] while it handles a signal.
pub struct MachineView<'a> {
    /// The register file.
    pub reg_file: &'a mut RegFile,
    /// The CP0 registers.
    pub cp0: &'a mut Cp0,
    /// The memory (through any cache).
    pub mem: &'a mut Memory,
    /// The program's character streams.
    pub io: &'a SimIO,
}

/// A receiver of exception signals (e.g., an OS emulation layer).
pub trait ExceptionHandler {
    /// Handles a signal, returning how execution should continue.
    ///
    /// This is called synchronously from within the core's clock.
    /// An error returned here halts the core and is propagated to the caller.
    fn on_signal(&mut self, signal: &ExceptionSignal, machine: MachineView<'_>) -> Result<Continuation, SimErr>;
}
impl dyn ExceptionHandler {} // assert ExceptionHandler is dyn safe

/// Wraps a closure as an [`ExceptionHandler`].
pub struct HandlerFn<F>(pub F);
impl<F> ExceptionHandler for HandlerFn<F>
    where F: FnMut(&ExceptionSignal, MachineView<'_>) -> Result<Continuation, SimErr>
{
    fn on_signal(&mut self, signal: &ExceptionSignal, machine: MachineView<'_>) -> Result<Continuation, SimErr> {
        (self.0)(signal, machine)
    }
}

/// Records the signal in CP0 and routes it to the handler.
pub(super) fn dispatch<H: ExceptionHandler + ?Sized>(
    handler: Option<&mut H>,
    signal: &ExceptionSignal,
    mut machine: MachineView<'_>
) -> Result<Continuation, SimErr> {
    machine.cp0.epc = signal.pc;
    machine.cp0.cause = signal.kind.cause_code() << 2;
    machine.cp0.status |= Cp0::STATUS_EXL;

    log::debug!("{} raised at {:#010x} (code {:#x})", signal.kind, signal.pc, signal.code);
    let Some(handler) = handler else {
        return Err(SimErr::NoDispatcher(signal.kind));
    };

    let lent = MachineView {
        reg_file: &mut *machine.reg_file,
        cp0: &mut *machine.cp0,
        mem: &mut *machine.mem,
        io: machine.io,
    };
    let cont = handler.on_signal(signal, lent)?;
    if let Continuation::Resume(_) = cont {
        machine.cp0.status &= !Cp0::STATUS_EXL;
    }
    Ok(cont)
}

#[cfg(test)]
mod tests {
    use crate::ast::instr::Instruction;
    use crate::sim::mem::paged::{MemoryConfig, PagedMemory};
    use crate::sim::SimErrKind;
    use super::*;

    fn signal(kind: ExceptionKind) -> ExceptionSignal {
        ExceptionSignal { kind, instr: Instruction::NOP, code: 0, pc: 0x400, resume_pc: 0x404 }
    }

    #[test]
    fn test_dispatch_sets_cp0() {
        let mut reg_file = RegFile::new();
        let mut cp0 = Cp0::default();
        let mut mem = Memory::from(PagedMemory::new(&MemoryConfig { size: 1 << 12, page_size: 256, ..Default::default() }).unwrap());
        let io = SimIO::Empty;

        let mut seen = None;
        let mut handler = HandlerFn(|sig: &ExceptionSignal, m: MachineView<'_>| -> Result<Continuation, SimErr> {
            seen = Some((m.cp0.epc, m.cp0.cause, m.cp0.status & Cp0::STATUS_EXL));
            Ok(Continuation::Resume(sig.resume_pc))
        });

        let view = MachineView { reg_file: &mut reg_file, cp0: &mut cp0, mem: &mut mem, io: &io };
        let cont = dispatch(Some(&mut handler), &signal(ExceptionKind::Trap), view).unwrap();
        assert_eq!(cont, Continuation::Resume(0x404));
        drop(handler);

        assert_eq!(seen, Some((0x400, 13 << 2, Cp0::STATUS_EXL)));
        // resumed, so exception level is cleared
        assert_eq!(cp0.status & Cp0::STATUS_EXL, 0);
    }

    #[test]
    fn test_no_dispatcher() {
        let mut reg_file = RegFile::new();
        let mut cp0 = Cp0::default();
        let mut mem = Memory::from(PagedMemory::new(&MemoryConfig { size: 1 << 12, page_size: 256, ..Default::default() }).unwrap());
        let io = SimIO::Empty;

        let view = MachineView { reg_file: &mut reg_file, cp0: &mut cp0, mem: &mut mem, io: &io };
        let err = dispatch(None::<&mut dyn ExceptionHandler>, &signal(ExceptionKind::Syscall), view).unwrap_err();
        assert_eq!(err.kind(), SimErrKind::Dispatch);
        assert_eq!(cp0.epc, 0x400);
    }

    #[test]
    fn test_cause_codes() {
        assert_eq!(ExceptionKind::Syscall.cause_code(), 8);
        assert_eq!(ExceptionKind::Break.cause_code(), 9);
        assert_eq!(ExceptionKind::Overflow.cause_code(), 12);
        assert_eq!(ExceptionKind::Trap.cause_code(), 13);
    }
}

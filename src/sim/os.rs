//! A small console OS.
//!
//! [`ConsoleOs`] is an [`ExceptionHandler`] that services the common console syscalls,
//! reading from and writing to the simulator's [`SimIO`](super::io::SimIO).
//! The syscall number is read from `$v0` and its argument from `$a0`:
//!
//! | `$v0` | Service        | Behavior                                                      |
//! |-------|----------------|---------------------------------------------------------------|
//! | 1     | `print_int`    | Prints `$a0` as a signed decimal.                             |
//! | 4     | `print_string` | Prints the NUL-terminated string at address `$a0`.            |
//! | 10    | `exit`         | Halts with exit code 0.                                       |
//! | 11    | `print_char`   | Prints the low byte of `$a0`.                                 |
//! | 12    | `read_char`    | Reads a byte into `$v0` (or -1 if the input is exhausted).    |
//! | 17    | `exit2`        | Halts with exit code `$a0`.                                   |
//!
//! Any other syscall number, along with `break`, traps, and arithmetic overflow, halts the machine.

use std::sync::{Arc, OnceLock};

use crate::ast::reg_consts::{A0, V0};
use super::exception::{Continuation, ExceptionHandler, ExceptionKind, ExceptionSignal, MachineView};
use super::io::{CharIO, Stream};
use super::mem::MemoryDevice;
use super::SimErr;

/// A shared handle to the exit code of a program run under [`ConsoleOs`].
///
/// The handle can be cloned before the OS is handed to a simulator,
/// and read after the simulator halts.
#[derive(Debug, Clone, Default)]
pub struct ExitStatus(Arc<OnceLock<i32>>);
impl ExitStatus {
    /// The exit code, if the program has exited through `exit` or `exit2`.
    pub fn get(&self) -> Option<i32> {
        self.0.get().copied()
    }

    fn set(&self, code: i32) {
        if self.0.set(code).is_err() {
            log::warn!("exit code already set, ignoring {code}");
        }
    }
}

/// An [`ExceptionHandler`] servicing console syscalls.
///
/// See the [module-level documentation](self) for the supported syscalls.
#[derive(Debug, Default)]
pub struct ConsoleOs {
    exit: ExitStatus,
}

impl ConsoleOs {
    /// Creates a new console OS.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle to the program's exit code.
    pub fn exit_status(&self) -> ExitStatus {
        self.exit.clone()
    }

    fn print(machine: &MachineView<'_>, bytes: &[u8]) {
        for &b in bytes {
            if !machine.io.write_char(Stream::Stdout, b) {
                log::warn!("console output closed");
                break;
            }
        }
    }

    fn syscall(&mut self, signal: &ExceptionSignal, machine: MachineView<'_>) -> Result<Continuation, SimErr> {
        let number = machine.reg_file[V0];
        let arg = machine.reg_file[A0];

        match number {
            1 => Self::print(&machine, (arg as i32).to_string().as_bytes()),
            4 => {
                let mut text = vec![];
                let mut addr = arg;
                loop {
                    match machine.mem.read_byte(addr)? {
                        0 => break,
                        b => text.push(b),
                    }
                    addr = addr.wrapping_add(1);
                }
                Self::print(&machine, &text);
            },
            10 => {
                self.exit.set(0);
                return Ok(Continuation::Halt);
            },
            11 => Self::print(&machine, &[arg as u8]),
            12 => {
                let value = match machine.io.read_char() {
                    Some(b) => u32::from(b),
                    None => u32::MAX,
                };
                machine.reg_file.set(V0, value);
            },
            17 => {
                self.exit.set(arg as i32);
                return Ok(Continuation::Halt);
            },
            n => {
                log::warn!("unknown syscall {n} at {:#010x}", signal.pc);
                return Ok(Continuation::Halt);
            },
        }

        Ok(Continuation::Resume(signal.resume_pc))
    }
}

impl ExceptionHandler for ConsoleOs {
    fn on_signal(&mut self, signal: &ExceptionSignal, machine: MachineView<'_>) -> Result<Continuation, SimErr> {
        match signal.kind {
            ExceptionKind::Syscall => self.syscall(signal, machine),
            kind => {
                log::info!("{kind} at {:#010x} (code {:#x})", signal.pc, signal.code);
                Ok(Continuation::Halt)
            },
        }
    }
}

//! A clock-stepped simulator for a 32-bit MIPS-like architecture.
//!
//! This crate decodes and encodes machine words, executes them against a register file and
//! a paged, cacheable memory, and dispatches architectural exceptions (syscalls, breakpoints, traps)
//! to a pluggable OS layer. The machine advances one clock at a time, so its exact state
//! (registers, memory, cache behavior) can be observed after every step.
//!
//! # Usage
//!
//! Instructions are built directly or decoded from machine words:
//! ```
//! use mips_ensemble::ast::instr::{Instruction, IOp};
//! use mips_ensemble::ast::reg_consts::{T0, ZERO};
//!
//! let instr = Instruction::imm(IOp::Ori, T0, ZERO, 0xFFFF);
//! assert_eq!(instr.encode(), 0x3408_FFFF);
//! assert_eq!(Instruction::decode(0x3408_FFFF).unwrap(), instr);
//! assert_eq!(instr.to_string(), "ori $t0, $zero, 0xFFFF");
//! ```
//!
//! A machine is usually described by a [`config::MachineConfig`]
//! (memory, an optional cache, and core flags) and then loaded with a program:
//! ```
//! use mips_ensemble::ast::instr::{Instruction, IOp, ROp};
//! use mips_ensemble::ast::reg_consts::{A0, V0, ZERO};
//! use mips_ensemble::config::MachineConfig;
//! use mips_ensemble::sim::{Segment, Simulator};
//! use mips_ensemble::sim::io::BufferedIO;
//! use mips_ensemble::sim::mem::Endianness;
//! use mips_ensemble::sim::os::ConsoleOs;
//!
//! let config = MachineConfig::from_toml_str(r#"
//!     [memory]
//!     size = 0x100000
//!     [cache]
//!     associativity = 2
//!     block-count = 16
//! "#).unwrap();
//! let mut sim = Simulator::from_config(&config).unwrap();
//!
//! let program = [
//!     Instruction::imm(IOp::Addiu, A0, ZERO, 42),
//!     Instruction::imm(IOp::Addiu, V0, ZERO, 1), // print_int
//!     Instruction::reg(ROp::Syscall, ZERO, ZERO, ZERO),
//! ];
//! sim.load_segments(&[Segment::from_instrs(0x400, &program, Endianness::Little)]).unwrap();
//! sim.set_entry_point(0x400);
//!
//! let io = BufferedIO::new();
//! sim.open_io(io.clone());
//! sim.set_handler(ConsoleOs::new());
//!
//! sim.run().unwrap(); // <-- Result can be handled accordingly
//! assert_eq!(io.take_output(), b"42");
//! ```
//!
//! If more granularity is needed, the simulator can be advanced with [`sim::Simulator::clock`],
//! and a pipelined core is available in [`sim::pipeline`].
//! See the [`sim`] module for more details.
#![warn(missing_docs)]

pub mod ast;
pub mod config;
pub mod sim;

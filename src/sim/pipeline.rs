//! A five-stage pipelined execution core.
//!
//! [`PipelinedSimulator`] splits each instruction into the classic five stages
//! (fetch, decode, execute, memory, write-back), separated by [`PipelineBarrier`]s.
//! Every clock evaluates the stages from last to first and then commits every barrier,
//! so each stage only observes what the previous clock committed.
//!
//! The pipeline produces the same architectural results as [`Simulator`](super::Simulator):
//! - Data hazards are resolved by an interlock: decode stalls while one of its source registers
//!   is the destination of an instruction in the execute or memory stage.
//! - Control transfers are resolved in decode, before the next fetch, so no wrong-path instruction is fetched.
//!   With branch-delay slots enabled, the instruction after the branch is fetched before the target.
//! - Exceptions and faults are taken at write-back, in program order.
//!   Instructions younger than the faulting one are flushed and never touch memory or registers.
//!
//! ```
//! use mips_ensemble::ast::instr::{Instruction, IOp, ROp};
//! use mips_ensemble::ast::reg_consts::{T0, T1, ZERO};
//! use mips_ensemble::sim::{Segment, SimFlags};
//! use mips_ensemble::sim::mem::Endianness;
//! use mips_ensemble::sim::mem::paged::{MemoryConfig, PagedMemory};
//! use mips_ensemble::sim::pipeline::PipelinedSimulator;
//!
//! let mem = PagedMemory::new(&MemoryConfig { size: 1 << 16, ..Default::default() }).unwrap();
//! let mut sim = PipelinedSimulator::new(SimFlags::default(), mem);
//!
//! let program = [
//!     Instruction::imm(IOp::Addiu, T0, ZERO, 20),
//!     Instruction::reg(ROp::Addu, T1, T0, T0), // stalls on $t0
//! ];
//! sim.load_segments(&[Segment::from_instrs(0x400, &program, Endianness::Little)]).unwrap();
//! sim.set_entry_point(0x400);
//! sim.run().unwrap();
//!
//! assert_eq!(sim.reg_file[T1], 40);
//! assert_eq!(sim.instructions_run, 2);
//! assert!(sim.cycles > 2);
//! ```

use crate::ast::instr::Instruction;
use crate::ast::Reg;
use crate::config::MachineConfig;
use super::barrier::PipelineBarrier;
use super::exception::{self, Continuation, ExceptionHandler, ExceptionSignal, MachineView};
use super::exec::{self, Branch, Effect, Operands};
use super::io::{CharIO, SimIO};
use super::mem::{Cp0, Memory, MemoryDevice, RegFile};
use super::{access_mem, fetch, initial_sp, write_back, write_segments, ProgramBounds, ProgramImage, Segment, SimErr, SimFlags};
use crate::ast::reg_consts::{GP, SP};

/// An instruction in flight, along with everything computed for it so far.
#[derive(Debug, Clone, Copy)]
struct InFlight {
    pc: u32,
    /// Where execution continues after this instruction, if it does not transfer control.
    next_pc: u32,
    instr: Instruction,
    ops: Operands,
    fx: Effect,
    loaded: Option<(Reg, u32)>,
}

type Latch = PipelineBarrier<Option<InFlight>>;

/// The value a latch committed last clock, if it committed one.
fn latched(latch: &Latch) -> Option<InFlight> {
    match latch.has_value() {
        true  => *latch.read(),
        false => None,
    }
}

/// Executes MIPS machine code in a five-stage pipeline.
///
/// See the [module-level documentation](self) for details.
pub struct PipelinedSimulator {
    /// The simulator's memory.
    pub mem: Memory,
    /// The general purpose registers, along with `hi` and `lo`.
    pub reg_file: RegFile,
    /// The CP0 (system control) registers.
    pub cp0: Cp0,
    /// Configuration settings for the simulator.
    pub flags: SimFlags,
    /// The number of instructions retired since this simulator was created.
    pub instructions_run: u64,
    /// The number of clocks since this simulator was created.
    pub cycles: u64,

    fetch_pc: u32,
    /// Branch target to fetch after the delay slot.
    redirect: Option<u32>,
    /// A fetch or decode failure, raised once every older instruction retires.
    fault: Option<SimErr>,
    halted: bool,
    closed: bool,
    bounds: ProgramBounds,

    if_id: Latch,
    id_ex: Latch,
    ex_mem: Latch,
    mem_wb: Latch,

    io: SimIO,
    handler: Option<Box<dyn ExceptionHandler + Send>>,
}
impl std::fmt::Debug for PipelinedSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelinedSimulator")
            .field("mem", &self.mem)
            .field("reg_file", &self.reg_file)
            .field("cp0", &self.cp0)
            .field("fetch_pc", &self.fetch_pc)
            .field("halted", &self.halted)
            .field("instructions_run", &self.instructions_run)
            .field("cycles", &self.cycles)
            .field("if_id", &self.if_id)
            .field("id_ex", &self.id_ex)
            .field("ex_mem", &self.ex_mem)
            .field("mem_wb", &self.mem_wb)
            .finish_non_exhaustive()
    }
}

impl PipelinedSimulator {
    /// Creates a new pipelined simulator over the given memory.
    pub fn new(flags: SimFlags, mem: impl Into<Memory>) -> Self {
        let mem = mem.into();
        let mut reg_file = RegFile::new();
        reg_file.set(SP, initial_sp(&flags, &mem));

        Self {
            mem,
            reg_file,
            cp0: Cp0::default(),
            flags,
            instructions_run: 0,
            cycles: 0,
            fetch_pc: 0,
            redirect: None,
            fault: None,
            halted: false,
            closed: false,
            bounds: ProgramBounds::default(),
            if_id: Latch::new(),
            id_ex: Latch::new(),
            ex_mem: Latch::new(),
            mem_wb: Latch::new(),
            io: SimIO::Empty,
            handler: None,
        }
    }

    /// Creates a new pipelined simulator from a machine configuration.
    pub fn from_config(config: &MachineConfig) -> Result<Self, SimErr> {
        Ok(Self::new(config.cpu, config.build_memory()?))
    }

    /// Writes segments into memory.
    pub fn load_segments(&mut self, segments: &[Segment]) -> Result<(), SimErr> {
        write_segments(&mut self.mem, &mut self.bounds, segments)
    }

    /// Empties the pipeline and starts fetching from the program's entry point.
    pub fn set_entry_point(&mut self, entry: u32) {
        self.bounds.entry = entry;
        self.fetch_pc = entry;
        self.redirect = None;
        self.fault = None;
        self.halted = false;
        for latch in [&mut self.if_id, &mut self.id_ex, &mut self.ex_mem, &mut self.mem_wb] {
            *latch = Latch::new();
        }
    }

    /// Sets the address at which fetching stops.
    pub fn set_program_end(&mut self, end: u32) {
        self.bounds.end = Some(u64::from(end));
    }

    /// The address at which fetching stops.
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

    /// The address of the next instruction to fetch.
    pub fn fetch_pc(&self) -> u32 {
        self.fetch_pc
    }

    /// Whether execution was halted (by the exception handler or by an error).
    pub fn hit_halt(&self) -> bool {
        self.halted
    }

    fn is_drained(&self) -> bool {
        [&self.if_id, &self.id_ex, &self.ex_mem, &self.mem_wb]
            .iter()
            .all(|latch| !latch.has_value())
    }

    /// Whether execution has finished.
    ///
    /// This is true once the simulator halts, or once fetching reaches the program end
    /// and every instruction in flight has retired.
    pub fn is_execution_finished(&self) -> bool {
        self.halted || (
            self.fault.is_none()
            && self.redirect.is_none()
            && u64::from(self.fetch_pc) >= self.bounds.end()
            && self.is_drained()
        )
    }

    /// Advances every stage by one clock.
    ///
    /// If an error occurs, the simulator halts and the error is returned.
    /// Clocking a halted simulator does nothing.
    pub fn clock(&mut self) -> Result<(), SimErr> {
        if self.halted { return Ok(()); }

        let result = self.tick();
        for latch in [&mut self.if_id, &mut self.id_ex, &mut self.ex_mem, &mut self.mem_wb] {
            latch.commit();
        }
        self.cycles += 1;

        if let Err(e) = &result {
            log::debug!("pipeline halted: {e}");
            self.halted = true;
        }
        result
    }

    fn tick(&mut self) -> Result<(), SimErr> {
        if self.is_drained() {
            if let Some(e) = self.fault.take() {
                return Err(e);
            }
        }

        if self.stage_wb()? {
            return Ok(());
        }
        self.stage_mem()?;
        self.stage_ex();
        if self.stage_id() {
            self.stage_if();
        }
        Ok(())
    }

    /// Retires an instruction. Returns whether the pipeline was flushed.
    fn stage_wb(&mut self) -> Result<bool, SimErr> {
        let Some(slot) = latched(&self.mem_wb) else { return Ok(false) };
        self.instructions_run += 1;

        let Some(kind) = slot.fx.signal else {
            write_back(&mut self.reg_file, &mut self.cp0, &slot.fx, slot.loaded);
            return Ok(false);
        };

        let signal = ExceptionSignal {
            kind,
            instr: slot.instr,
            code: slot.instr.code(),
            pc: slot.pc,
            resume_pc: slot.next_pc,
        };
        let machine = MachineView {
            reg_file: &mut self.reg_file,
            cp0: &mut self.cp0,
            mem: &mut self.mem,
            io: &self.io,
        };
        match exception::dispatch(self.handler.as_deref_mut(), &signal, machine)? {
            Continuation::Resume(pc) => self.fetch_pc = pc,
            Continuation::Halt => {
                log::info!("halted by {} at {:#010x}", signal.kind, signal.pc);
                self.halted = true;
            },
        }

        // drop every younger instruction
        for latch in [&mut self.if_id, &mut self.id_ex, &mut self.ex_mem, &mut self.mem_wb] {
            latch.cancel();
        }
        self.redirect = None;
        self.fault = None;
        Ok(true)
    }

    fn stage_mem(&mut self) -> Result<(), SimErr> {
        let Some(mut slot) = latched(&self.ex_mem) else { return Ok(()) };
        if let Some(op) = &slot.fx.mem {
            slot.loaded = access_mem(&mut self.mem, op)?;
        }
        self.mem_wb.write(Some(slot));
        Ok(())
    }

    fn stage_ex(&mut self) {
        let Some(mut slot) = latched(&self.id_ex) else { return };
        slot.fx = exec::execute(&slot.instr, slot.pc, &slot.ops, self.flags.branch_delay_slot);
        self.ex_mem.write(Some(slot));
    }

    /// Reads operands and resolves control transfers. Returns false if decode stalled.
    fn stage_id(&mut self) -> bool {
        let Some(mut slot) = latched(&self.if_id) else { return true };

        let needs = exec::sources(&slot.instr);
        let hazard = [&self.id_ex, &self.ex_mem].into_iter()
            .filter_map(latched)
            .any(|older| exec::destinations(&older.instr).overlaps(&needs));
        if hazard {
            log::trace!("stall at {:#010x}", slot.pc);
            self.if_id.write(Some(slot));
            return false;
        }

        slot.ops = Operands::read(&slot.instr, &self.reg_file, &self.cp0);
        if exec::is_control(&slot.instr) {
            let fx = exec::execute(&slot.instr, slot.pc, &slot.ops, self.flags.branch_delay_slot);
            match fx.branch {
                Some(Branch { target, delayed: true }) => self.redirect = Some(target),
                Some(Branch { target, delayed: false }) => self.fetch_pc = target,
                None => {},
            }
        }
        self.id_ex.write(Some(slot));
        true
    }

    fn stage_if(&mut self) {
        if self.fault.is_some() { return; }
        if self.redirect.is_none() && u64::from(self.fetch_pc) >= self.bounds.end() { return; }

        let pc = self.fetch_pc;
        let decoded = fetch(&mut self.mem, pc)
            .and_then(|word| Instruction::decode(word).map_err(SimErr::from));

        match decoded {
            Ok(instr) => {
                log::trace!("fetch {pc:#010x}: {instr}");
                let next_pc = self.redirect.take().unwrap_or(pc.wrapping_add(4));
                self.if_id.write(Some(InFlight {
                    pc,
                    next_pc,
                    instr,
                    ops: Operands::default(),
                    fx: Effect::default(),
                    loaded: None,
                }));
                self.fetch_pc = next_pc;
            },
            Err(e) => self.fault = Some(e),
        }
    }

    /// Clocks the simulator while the tripwire condition holds and execution has not finished.
    pub fn run_while(&mut self, mut tripwire: impl FnMut(&mut PipelinedSimulator) -> bool) -> Result<(), SimErr> {
        while !self.is_execution_finished() && tripwire(self) {
            self.clock()?;
        }
        Ok(())
    }

    /// Clocks the simulator until execution finishes.
    pub fn run(&mut self) -> Result<(), SimErr> {
        self.run_while(|_| true)
    }

    /// Clocks the simulator until execution finishes or `max_steps` instructions have retired.
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
impl Drop for PipelinedSimulator {
    fn drop(&mut self) {
        if self.closed { return; }
        self.io.close();
        if let Err(e) = self.mem.flush() {
            log::warn!("could not flush memory on drop: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::instr::{IOp, JOp, ROp};
    use crate::ast::reg_consts::*;
    use crate::sim::exception::{ExceptionKind, HandlerFn};
    use crate::sim::mem::paged::{MemoryConfig, PagedMemory};
    use crate::sim::mem::Endianness;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::sim::tests::FlushCounter;
    use crate::sim::{SimErrKind, Simulator};
    use super::*;

    const BASE: u32 = 0x1000;

    fn memory() -> PagedMemory {
        PagedMemory::new(&MemoryConfig { size: 1 << 16, page_size: 256, ..Default::default() }).unwrap()
    }

    fn resume_with_double(sig: &ExceptionSignal, m: MachineView<'_>) -> Result<Continuation, SimErr> {
        match sig.kind {
            ExceptionKind::Syscall => {
                let arg = m.reg_file[A0];
                m.reg_file.set(V0, arg.wrapping_mul(2));
                Ok(Continuation::Resume(sig.resume_pc))
            },
            _ => Ok(Continuation::Halt),
        }
    }

    fn run_both(flags: SimFlags, program: &[Instruction]) -> (Simulator, PipelinedSimulator) {
        let seg = [Segment::from_instrs(BASE, program, Endianness::Little)];

        let mut single = Simulator::new(flags, memory());
        single.load_segments(&seg).unwrap();
        single.set_entry_point(BASE);
        single.set_handler(HandlerFn(resume_with_double));
        single.run_with_limit(10_000).unwrap();
        assert!(single.is_execution_finished());

        let mut piped = PipelinedSimulator::new(flags, memory());
        piped.load_segments(&seg).unwrap();
        piped.set_entry_point(BASE);
        piped.set_handler(HandlerFn(resume_with_double));
        piped.run_with_limit(10_000).unwrap();
        assert!(piped.is_execution_finished());

        (single, piped)
    }

    fn assert_same_state(single: &mut Simulator, piped: &mut PipelinedSimulator) {
        assert_eq!(single.reg_file, piped.reg_file);
        assert_eq!(single.cp0, piped.cp0);
        assert_eq!(single.instructions_run, piped.instructions_run);
        assert_eq!(single.hit_halt(), piped.hit_halt());
        for addr in (0x2000..0x2040).step_by(4) {
            assert_eq!(single.mem.read_word(addr).unwrap(), piped.mem.read_word(addr).unwrap(), "word at {addr:#x}");
        }
    }

    fn mixed_program() -> Vec<Instruction> {
        vec![
            // load a small array, sum it with hazards everywhere
            Instruction::imm(IOp::Addiu, T0, ZERO, 0x2000),
            Instruction::imm(IOp::Addiu, T1, ZERO, 5),
            Instruction::imm(IOp::Sw, T1, T0, 0),
            Instruction::imm(IOp::Addiu, T1, T1, 0xFFFF),
            Instruction::imm(IOp::Addiu, T0, T0, 4),
            Instruction::imm(IOp::Bne, ZERO, T1, 0xFFFC),
            Instruction::NOP,
            Instruction::imm(IOp::Addiu, T0, ZERO, 0x2000),
            Instruction::imm(IOp::Lw, T2, T0, 0),
            Instruction::imm(IOp::Lw, T3, T0, 4),
            Instruction::reg(ROp::Addu, T4, T2, T3),
            Instruction::reg(ROp::Mult, ZERO, T4, T2),
            Instruction::reg(ROp::Mflo, T5, ZERO, ZERO),
            Instruction::imm(IOp::Sw, T5, T0, 0x20),
            // call a subroutine
            Instruction::jump(JOp::Jal, BASE + 4 * 20),
            Instruction::NOP,
            Instruction::imm(IOp::Addiu, A0, T5, 0),
            Instruction::reg(ROp::Syscall, ZERO, ZERO, ZERO),
            Instruction::imm(IOp::Sw, V0, T0, 0x24),
            Instruction::jump(JOp::J, BASE + 4 * 24),
            // subroutine
            Instruction::imm(IOp::Addiu, S0, S0, 1),
            Instruction::reg(ROp::Jr, ZERO, RA, ZERO),
            Instruction::imm(IOp::Addiu, S1, S1, 1),
            Instruction::NOP,
            // end
            Instruction::imm(IOp::Sb, S0, T0, 0x28),
        ]
    }

    #[test]
    fn test_matches_single_cycle() {
        let (mut single, mut piped) = run_both(SimFlags::default(), &mixed_program());
        assert_same_state(&mut single, &mut piped);
        assert_eq!(piped.reg_file[T5], 45);
        assert_eq!(piped.reg_file[V0], 90);
        assert_eq!(piped.reg_file[S0], 1);
        assert_eq!(piped.reg_file[S1], 0);
        assert!(piped.cycles > piped.instructions_run);
    }

    #[test]
    fn test_matches_single_cycle_with_delay_slots() {
        let flags = SimFlags { branch_delay_slot: true, ..Default::default() };
        let (mut single, mut piped) = run_both(flags, &mixed_program());
        assert_same_state(&mut single, &mut piped);
        // the jr delay slot runs
        assert_eq!(piped.reg_file[S1], 1);
    }

    #[test]
    fn test_matches_single_cycle_after_eret() {
        let program = [
            Instruction::imm(IOp::Addiu, T0, ZERO, Cp0::STATUS_EXL as u16),
            Instruction::reg(ROp::Mtc0, Reg(Cp0::STATUS), ZERO, T0),
            Instruction::imm(IOp::Addiu, T1, ZERO, (BASE + 4 * 6) as u16),
            Instruction::reg(ROp::Mtc0, Reg(Cp0::EPC), ZERO, T1),
            Instruction::reg(ROp::Eret, ZERO, ZERO, ZERO),
            Instruction::imm(IOp::Addiu, T3, ZERO, 1),
            // Status is read right after eret clears EXL
            Instruction::reg(ROp::Mfc0, Reg(Cp0::STATUS), ZERO, T2),
        ];
        for branch_delay_slot in [false, true] {
            let flags = SimFlags { branch_delay_slot, ..Default::default() };
            let (mut single, mut piped) = run_both(flags, &program);
            assert_same_state(&mut single, &mut piped);
            assert_eq!(piped.reg_file[T2], 0);
            assert_eq!(piped.reg_file[T3], 0);
        }
    }

    #[test]
    fn test_close_flushes_once() {
        let flushes = Arc::new(AtomicUsize::new(0));
        let piped = PipelinedSimulator::new(SimFlags::default(), Memory::custom(FlushCounter(Arc::clone(&flushes))));
        piped.close().unwrap();
        assert_eq!(flushes.load(Ordering::Relaxed), 1);

        drop(PipelinedSimulator::new(SimFlags::default(), Memory::custom(FlushCounter(Arc::clone(&flushes)))));
        assert_eq!(flushes.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_branch_delay_toggle() {
        let program = [
            Instruction::imm(IOp::Beq, ZERO, ZERO, 2),
            Instruction::imm(IOp::Addiu, T0, ZERO, 1),
            Instruction::imm(IOp::Addiu, T1, ZERO, 1),
            Instruction::imm(IOp::Addiu, T2, ZERO, 1),
        ];
        let (_, piped) = run_both(SimFlags::default(), &program);
        assert_eq!((piped.reg_file[T0], piped.reg_file[T1], piped.reg_file[T2]), (0, 0, 1));

        let (_, piped) = run_both(SimFlags { branch_delay_slot: true, ..Default::default() }, &program);
        assert_eq!((piped.reg_file[T0], piped.reg_file[T1], piped.reg_file[T2]), (1, 0, 1));
    }

    #[test]
    fn test_precise_halt() {
        let program = [
            Instruction::imm(IOp::Addiu, T0, ZERO, 1),
            Instruction::reg(ROp::Break, ZERO, ZERO, ZERO),
            Instruction::imm(IOp::Sw, T0, ZERO, 0x2000),
            Instruction::imm(IOp::Addiu, T1, ZERO, 1),
        ];
        let (mut single, mut piped) = run_both(SimFlags::default(), &program);
        assert_same_state(&mut single, &mut piped);
        assert!(piped.hit_halt());
        assert_eq!(piped.reg_file[T1], 0);
        assert_eq!(piped.mem.read_word(0x2000).unwrap(), 0);
        assert_eq!(piped.cp0.epc, BASE + 4);
    }

    #[test]
    fn test_fault_after_halt_is_not_raised() {
        // the word after `break` does not decode, but is never reached
        let mut piped = PipelinedSimulator::new(SimFlags::default(), memory());
        let mut words: Vec<_> = [Instruction::reg(ROp::Break, ZERO, ZERO, ZERO)].iter().map(Instruction::encode).collect();
        words.push(0xFFFF_FFFF);
        piped.load_segments(&[Segment::from_words(BASE, &words, Endianness::Little)]).unwrap();
        piped.set_entry_point(BASE);
        piped.set_handler(HandlerFn(resume_with_double));

        piped.run().unwrap();
        assert!(piped.hit_halt());
    }

    #[test]
    fn test_fault_raised_in_order() {
        let mut piped = PipelinedSimulator::new(SimFlags::default(), memory());
        let words = [Instruction::imm(IOp::Addiu, T0, ZERO, 3).encode(), 0xFFFF_FFFF];
        piped.load_segments(&[Segment::from_words(BASE, &words, Endianness::Little)]).unwrap();
        piped.set_entry_point(BASE);

        let err = piped.run().unwrap_err();
        assert_eq!(err.kind(), SimErrKind::Decode);
        assert_eq!(piped.reg_file[T0], 3);
        assert!(piped.is_execution_finished());
    }

    #[test]
    fn test_no_dispatcher() {
        let mut piped = PipelinedSimulator::new(SimFlags::default(), memory());
        let program = [Instruction::reg(ROp::Syscall, ZERO, ZERO, ZERO)];
        piped.load_segments(&[Segment::from_instrs(BASE, &program, Endianness::Little)]).unwrap();
        piped.set_entry_point(BASE);

        let err = piped.run().unwrap_err();
        assert_eq!(err.kind(), SimErrKind::Dispatch);
        assert!(piped.hit_halt());
    }

    #[test]
    fn test_independent_instructions_do_not_stall() {
        let program = [
            Instruction::imm(IOp::Addiu, T0, ZERO, 1),
            Instruction::imm(IOp::Addiu, T1, ZERO, 2),
            Instruction::imm(IOp::Addiu, T2, ZERO, 3),
            Instruction::imm(IOp::Addiu, T3, ZERO, 4),
        ];
        let (_, piped) = run_both(SimFlags::default(), &program);
        // 4 instructions through 5 stages
        assert_eq!(piped.cycles, 8);
    }
}

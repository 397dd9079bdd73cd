//! The execute step shared by both variants of the execution core.
//!
//! [`execute`] is a pure function: it computes an instruction's [`Effect`]
//! from the instruction, its address, and its source operands, without touching machine state.
//! The cores apply the effect (memory access, register writes, control transfer, signal)
//! in their memory and write-back phases.
//!
//! This module also exposes the register dependencies of each instruction ([`sources`] and
//! [`destinations`]), which the pipelined core uses to detect data hazards.

use crate::ast::instr::{IOp, Instruction, JOp, ROp};
use crate::ast::reg_consts::RA;
use crate::ast::{sext16, Reg};
use super::exception::ExceptionKind;
use super::mem::{Cp0, RegFile};

/// The width of a memory access.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Width {
    /// 1 byte.
    Byte,
    /// 2 bytes.
    Half,
    /// 4 bytes.
    Word,
}
impl Width {
    /// The number of bytes accessed (which is also the required alignment).
    pub fn bytes(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Half => 2,
            Width::Word => 4,
        }
    }
}

/// A memory access requested by an instruction.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum MemOp {
    /// Load into a register.
    Load {
        /// Effective address.
        addr: u32,
        /// Access width.
        width: Width,
        /// Whether the loaded value is sign-extended (else zero-extended).
        signed: bool,
        /// Destination register.
        dest: Reg,
    },
    /// Store from a register.
    Store {
        /// Effective address.
        addr: u32,
        /// Access width.
        width: Width,
        /// The value to store (truncated to the width).
        value: u32,
    },
}

/// A taken control transfer.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct Branch {
    /// The address control transfers to.
    pub target: u32,
    /// Whether the instruction in the branch-delay slot executes before the target is entered.
    pub delayed: bool,
}

/// The source operands of an instruction, read from machine state.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy)]
pub struct Operands {
    /// Value of `rs`.
    pub rs: u32,
    /// Value of `rt`.
    pub rt: u32,
    /// Value of `hi`.
    pub hi: u32,
    /// Value of `lo`.
    pub lo: u32,
    /// Value of the CP0 register named by `rd` (for `mfc0`).
    pub cp0: u32,
    /// Value of `EPC` (for `eret`).
    pub epc: u32,
}
impl Operands {
    /// Reads the operands of an instruction.
    pub fn read(instr: &Instruction, reg_file: &RegFile, cp0: &Cp0) -> Self {
        match *instr {
            Instruction::Register { rs, rt, rd, .. } => Operands {
                rs: reg_file[rs],
                rt: reg_file[rt],
                hi: reg_file.hi,
                lo: reg_file.lo,
                cp0: cp0.get(rd),
                epc: cp0.epc,
            },
            Instruction::Immediate { rs, rt, .. } => Operands {
                rs: reg_file[rs],
                rt: reg_file[rt],
                ..Default::default()
            },
            Instruction::Jump { .. } => Operands::default(),
        }
    }
}

/// The effect of executing one instruction.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy)]
pub struct Effect {
    /// A register write (applied at write-back, after any load).
    pub write: Option<(Reg, u32)>,
    /// New values of (`hi`, `lo`).
    pub hilo: Option<(u32, u32)>,
    /// A CP0 register write.
    pub cp0: Option<(Reg, u32)>,
    /// A memory access.
    pub mem: Option<MemOp>,
    /// A taken control transfer.
    pub branch: Option<Branch>,
    /// A raised exception signal.
    pub signal: Option<ExceptionKind>,
    /// Whether this returns from an exception (clearing the exception level).
    pub eret: bool,
}

fn link_addr(pc: u32, delay_slots: bool) -> u32 {
    match delay_slots {
        true  => pc.wrapping_add(8),
        false => pc.wrapping_add(4),
    }
}

fn branch_target(pc: u32, imm: u16) -> u32 {
    pc.wrapping_add(4).wrapping_add(sext16(imm) << 2)
}

/// Computes the effect of executing an instruction at `pc`.
///
/// `delay_slots` determines whether taken branches are delayed
/// and which address the linking instructions save.
pub fn execute(instr: &Instruction, pc: u32, ops: &Operands, delay_slots: bool) -> Effect {
    let mut fx = Effect::default();
    let (s, t) = (ops.rs, ops.rt);
    let branch = |target| Some(Branch { target, delayed: delay_slots });

    match *instr {
        Instruction::Register { op, rs: _, rt, rd, shamt } => {
            let shamt = u32::from(shamt);
            let trap = |cond: bool| cond.then_some(ExceptionKind::Trap);

            match op {
                ROp::Sll  => fx.write = Some((rd, t << shamt)),
                ROp::Srl  => fx.write = Some((rd, t >> shamt)),
                ROp::Sra  => fx.write = Some((rd, ((t as i32) >> shamt) as u32)),
                ROp::Sllv => fx.write = Some((rd, t << (s & 0x1F))),
                ROp::Srlv => fx.write = Some((rd, t >> (s & 0x1F))),
                ROp::Srav => fx.write = Some((rd, ((t as i32) >> (s & 0x1F)) as u32)),
                ROp::Jr   => fx.branch = branch(s),
                ROp::Jalr => {
                    fx.write = Some((rd, link_addr(pc, delay_slots)));
                    fx.branch = branch(s);
                },
                ROp::Movz => if t == 0 { fx.write = Some((rd, s)) },
                ROp::Movn => if t != 0 { fx.write = Some((rd, s)) },
                ROp::Syscall => fx.signal = Some(ExceptionKind::Syscall),
                ROp::Break   => fx.signal = Some(ExceptionKind::Break),
                ROp::Mfhi => fx.write = Some((rd, ops.hi)),
                ROp::Mthi => fx.hilo = Some((s, ops.lo)),
                ROp::Mflo => fx.write = Some((rd, ops.lo)),
                ROp::Mtlo => fx.hilo = Some((ops.hi, s)),
                ROp::Mult => {
                    let p = i64::from(s as i32) * i64::from(t as i32);
                    fx.hilo = Some(((p >> 32) as u32, p as u32));
                },
                ROp::Multu => {
                    let p = u64::from(s) * u64::from(t);
                    fx.hilo = Some(((p >> 32) as u32, p as u32));
                },
                ROp::Div => {
                    // division by zero leaves hi/lo untouched
                    if t != 0 {
                        let (n, d) = (s as i32, t as i32);
                        fx.hilo = Some((n.wrapping_rem(d) as u32, n.wrapping_div(d) as u32));
                    }
                },
                ROp::Divu => {
                    if t != 0 {
                        fx.hilo = Some((s % t, s / t));
                    }
                },
                ROp::Add => match (s as i32).checked_add(t as i32) {
                    Some(r) => fx.write = Some((rd, r as u32)),
                    None    => fx.signal = Some(ExceptionKind::Overflow),
                },
                ROp::Addu => fx.write = Some((rd, s.wrapping_add(t))),
                ROp::Sub => match (s as i32).checked_sub(t as i32) {
                    Some(r) => fx.write = Some((rd, r as u32)),
                    None    => fx.signal = Some(ExceptionKind::Overflow),
                },
                ROp::Subu => fx.write = Some((rd, s.wrapping_sub(t))),
                ROp::And  => fx.write = Some((rd, s & t)),
                ROp::Or   => fx.write = Some((rd, s | t)),
                ROp::Xor  => fx.write = Some((rd, s ^ t)),
                ROp::Nor  => fx.write = Some((rd, !(s | t))),
                ROp::Slt  => fx.write = Some((rd, u32::from((s as i32) < (t as i32)))),
                ROp::Sltu => fx.write = Some((rd, u32::from(s < t))),
                ROp::Tge  => fx.signal = trap((s as i32) >= (t as i32)),
                ROp::Tgeu => fx.signal = trap(s >= t),
                ROp::Tlt  => fx.signal = trap((s as i32) < (t as i32)),
                ROp::Tltu => fx.signal = trap(s < t),
                ROp::Teq  => fx.signal = trap(s == t),
                ROp::Tne  => fx.signal = trap(s != t),
                ROp::Mul  => fx.write = Some((rd, (s as i32).wrapping_mul(t as i32) as u32)),
                ROp::Clz  => fx.write = Some((rd, s.leading_zeros())),
                ROp::Clo  => fx.write = Some((rd, s.leading_ones())),
                ROp::Mfc0 => fx.write = Some((rt, ops.cp0)),
                ROp::Mtc0 => fx.cp0 = Some((rd, t)),
                ROp::Eret => {
                    fx.branch = Some(Branch { target: ops.epc, delayed: false });
                    fx.eret = true;
                },
            }
        },
        Instruction::Immediate { op, rs: _, rt, imm } => {
            let x = op.extend(imm);
            let trap = |cond: bool| cond.then_some(ExceptionKind::Trap);
            let cond_branch = |cond: bool| match cond {
                true  => branch(branch_target(pc, imm)),
                false => None,
            };
            let load = |width, signed| Some(MemOp::Load { addr: s.wrapping_add(x), width, signed, dest: rt });
            let store = |width| Some(MemOp::Store { addr: s.wrapping_add(x), width, value: t });

            match op {
                IOp::Bltz   => fx.branch = cond_branch((s as i32) < 0),
                IOp::Bgez   => fx.branch = cond_branch((s as i32) >= 0),
                IOp::Tgei   => fx.signal = trap((s as i32) >= (x as i32)),
                IOp::Tgeiu  => fx.signal = trap(s >= x),
                IOp::Tlti   => fx.signal = trap((s as i32) < (x as i32)),
                IOp::Tltiu  => fx.signal = trap(s < x),
                IOp::Teqi   => fx.signal = trap(s == x),
                IOp::Tnei   => fx.signal = trap(s != x),
                IOp::Bltzal => {
                    fx.write = Some((RA, link_addr(pc, delay_slots)));
                    fx.branch = cond_branch((s as i32) < 0);
                },
                IOp::Bgezal => {
                    fx.write = Some((RA, link_addr(pc, delay_slots)));
                    fx.branch = cond_branch((s as i32) >= 0);
                },
                IOp::Beq   => fx.branch = cond_branch(s == t),
                IOp::Bne   => fx.branch = cond_branch(s != t),
                IOp::Blez  => fx.branch = cond_branch((s as i32) <= 0),
                IOp::Bgtz  => fx.branch = cond_branch((s as i32) > 0),
                IOp::Addi  => match (s as i32).checked_add(x as i32) {
                    Some(r) => fx.write = Some((rt, r as u32)),
                    None    => fx.signal = Some(ExceptionKind::Overflow),
                },
                IOp::Addiu => fx.write = Some((rt, s.wrapping_add(x))),
                IOp::Slti  => fx.write = Some((rt, u32::from((s as i32) < (x as i32)))),
                IOp::Sltiu => fx.write = Some((rt, u32::from(s < x))),
                IOp::Andi  => fx.write = Some((rt, s & x)),
                IOp::Ori   => fx.write = Some((rt, s | x)),
                IOp::Xori  => fx.write = Some((rt, s ^ x)),
                IOp::Lui   => fx.write = Some((rt, x)),
                IOp::Lb    => fx.mem = load(Width::Byte, true),
                IOp::Lh    => fx.mem = load(Width::Half, true),
                IOp::Lw    => fx.mem = load(Width::Word, true),
                IOp::Lbu   => fx.mem = load(Width::Byte, false),
                IOp::Lhu   => fx.mem = load(Width::Half, false),
                IOp::Sb    => fx.mem = store(Width::Byte),
                IOp::Sh    => fx.mem = store(Width::Half),
                IOp::Sw    => fx.mem = store(Width::Word),
            }
        },
        Instruction::Jump { op, target } => {
            let dest = (pc.wrapping_add(4) & 0xF000_0000) | (target << 2);
            if op == JOp::Jal {
                fx.write = Some((RA, link_addr(pc, delay_slots)));
            }
            fx.branch = branch(dest);
        },
    }

    fx
}

/// Whether an instruction may transfer control.
///
/// The pipelined core resolves these in its decode stage.
pub fn is_control(instr: &Instruction) -> bool {
    match *instr {
        Instruction::Register { op, .. } => matches!(op, ROp::Jr | ROp::Jalr | ROp::Eret),
        Instruction::Immediate { op, .. } => op.is_branch(),
        Instruction::Jump { .. } => true,
    }
}

/// A set of registers used by an instruction.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy)]
pub struct RegUse {
    /// General-purpose registers (`$zero` is never listed).
    pub gpr: [Option<Reg>; 2],
    /// Whether `hi`/`lo` are used.
    pub hilo: bool,
    /// Whether CP0 registers are used.
    pub cp0: bool,
}
impl RegUse {
    fn gprs(regs: &[Reg]) -> [Option<Reg>; 2] {
        let mut out = [None; 2];
        for (slot, &r) in out.iter_mut().zip(regs.iter().filter(|r| r.reg_no() != 0)) {
            *slot = Some(r);
        }
        out
    }

    /// Whether any register in `self` is also in `other`.
    pub fn overlaps(&self, other: &RegUse) -> bool {
        let gpr = self.gpr.iter()
            .flatten()
            .any(|r| other.gpr.contains(&Some(*r)));

        gpr || (self.hilo && other.hilo) || (self.cp0 && other.cp0)
    }
}

/// The registers an instruction reads.
pub fn sources(instr: &Instruction) -> RegUse {
    match *instr {
        Instruction::Register { op, rs, rt, .. } => match op {
            ROp::Sll | ROp::Srl | ROp::Sra => RegUse { gpr: RegUse::gprs(&[rt]), ..Default::default() },
            ROp::Jr | ROp::Jalr | ROp::Mthi | ROp::Mtlo => RegUse { gpr: RegUse::gprs(&[rs]), hilo: matches!(op, ROp::Mthi | ROp::Mtlo), ..Default::default() },
            ROp::Mfhi | ROp::Mflo => RegUse { hilo: true, ..Default::default() },
            ROp::Syscall | ROp::Break => RegUse::default(),
            ROp::Mfc0 | ROp::Eret => RegUse { cp0: true, ..Default::default() },
            ROp::Mtc0 => RegUse { gpr: RegUse::gprs(&[rt]), ..Default::default() },
            ROp::Clz | ROp::Clo => RegUse { gpr: RegUse::gprs(&[rs]), ..Default::default() },
            _ => RegUse { gpr: RegUse::gprs(&[rs, rt]), ..Default::default() },
        },
        Instruction::Immediate { op, rs, rt, .. } => match op {
            IOp::Beq | IOp::Bne | IOp::Sb | IOp::Sh | IOp::Sw => RegUse { gpr: RegUse::gprs(&[rs, rt]), ..Default::default() },
            IOp::Lui => RegUse::default(),
            _ => RegUse { gpr: RegUse::gprs(&[rs]), ..Default::default() },
        },
        Instruction::Jump { .. } => RegUse::default(),
    }
}

/// The registers an instruction may write.
pub fn destinations(instr: &Instruction) -> RegUse {
    let gpr = |r: Reg| RegUse { gpr: RegUse::gprs(&[r]), ..Default::default() };

    match *instr {
        Instruction::Register { op, rt, rd, .. } => match op {
            ROp::Jr | ROp::Syscall | ROp::Break
            | ROp::Tge | ROp::Tgeu | ROp::Tlt | ROp::Tltu | ROp::Teq | ROp::Tne => RegUse::default(),
            ROp::Mthi | ROp::Mtlo | ROp::Mult | ROp::Multu | ROp::Div | ROp::Divu => RegUse { hilo: true, ..Default::default() },
            ROp::Mtc0 | ROp::Eret => RegUse { cp0: true, ..Default::default() },
            ROp::Mfc0 => gpr(rt),
            _ => gpr(rd),
        },
        Instruction::Immediate { op, rt, .. } => match op {
            IOp::Bltzal | IOp::Bgezal => gpr(RA),
            _ if op.is_branch() => RegUse::default(),
            IOp::Tgei | IOp::Tgeiu | IOp::Tlti | IOp::Tltiu | IOp::Teqi | IOp::Tnei => RegUse::default(),
            IOp::Sb | IOp::Sh | IOp::Sw => RegUse::default(),
            _ => gpr(rt),
        },
        Instruction::Jump { op: JOp::Jal, .. } => gpr(RA),
        Instruction::Jump { op: JOp::J, .. } => RegUse::default(),
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::reg_consts::{S0, T0, T1, T2, ZERO};
    use super::*;

    fn ops(rs: u32, rt: u32) -> Operands {
        Operands { rs, rt, ..Default::default() }
    }

    #[test]
    fn test_arith() {
        let add = Instruction::reg(ROp::Add, T0, T1, T2);
        assert_eq!(execute(&add, 0, &ops(2, 3), false).write, Some((T0, 5)));

        let sra = Instruction::shift(ROp::Sra, T0, T1, 4);
        assert_eq!(execute(&sra, 0, &ops(0, 0x8000_0000), false).write, Some((T0, 0xF800_0000)));

        let slt = Instruction::reg(ROp::Slt, T0, T1, T2);
        assert_eq!(execute(&slt, 0, &ops(-1i32 as u32, 0), false).write, Some((T0, 1)));
        let sltu = Instruction::reg(ROp::Sltu, T0, T1, T2);
        assert_eq!(execute(&sltu, 0, &ops(-1i32 as u32, 0), false).write, Some((T0, 0)));
    }

    #[test]
    fn test_immediate_extension() {
        let addi = Instruction::imm(IOp::Addi, T0, T1, 0xFFFF);
        assert_eq!(execute(&addi, 0, &ops(10, 0), false).write, Some((T0, 9)));

        let ori = Instruction::imm(IOp::Ori, T0, T1, 0xFFFF);
        assert_eq!(execute(&ori, 0, &ops(0, 0), false).write, Some((T0, 0x0000_FFFF)));

        let lui = Instruction::imm(IOp::Lui, T0, ZERO, 0x1234);
        assert_eq!(execute(&lui, 0, &ops(0, 0), false).write, Some((T0, 0x1234_0000)));

        let lw = Instruction::imm(IOp::Lw, T0, S0, 0xFFFC);
        assert_eq!(
            execute(&lw, 0, &ops(0x100, 0), false).mem,
            Some(MemOp::Load { addr: 0xFC, width: Width::Word, signed: true, dest: T0 })
        );
    }

    #[test]
    fn test_overflow() {
        let add = Instruction::reg(ROp::Add, T0, T1, T2);
        let fx = execute(&add, 0, &ops(i32::MAX as u32, 1), false);
        assert_eq!(fx.signal, Some(ExceptionKind::Overflow));
        assert_eq!(fx.write, None);

        let addu = Instruction::reg(ROp::Addu, T0, T1, T2);
        assert_eq!(execute(&addu, 0, &ops(i32::MAX as u32, 1), false).write, Some((T0, 0x8000_0000)));

        let addi = Instruction::imm(IOp::Addi, T0, T1, 0x8000);
        assert_eq!(execute(&addi, 0, &ops(i32::MIN as u32, 0), false).signal, Some(ExceptionKind::Overflow));
    }

    #[test]
    fn test_mult_div() {
        let mult = Instruction::reg(ROp::Mult, ZERO, T0, T1);
        assert_eq!(execute(&mult, 0, &ops(-2i32 as u32, 3), false).hilo, Some((0xFFFF_FFFF, -6i32 as u32)));

        let div = Instruction::reg(ROp::Div, ZERO, T0, T1);
        assert_eq!(execute(&div, 0, &ops(-7i32 as u32, 2), false).hilo, Some((-1i32 as u32, -3i32 as u32)));
        assert_eq!(execute(&div, 0, &ops(7, 0), false).hilo, None);
    }

    #[test]
    fn test_branches() {
        let beq = Instruction::imm(IOp::Beq, T1, T0, 3);
        assert_eq!(execute(&beq, 0x100, &ops(1, 1), false).branch, Some(Branch { target: 0x110, delayed: false }));
        assert_eq!(execute(&beq, 0x100, &ops(1, 2), true).branch, None);

        let back = Instruction::imm(IOp::Bne, T1, T0, 0xFFFF);
        assert_eq!(execute(&back, 0x100, &ops(1, 2), true).branch, Some(Branch { target: 0x100, delayed: true }));

        let jal = Instruction::jump(JOp::Jal, 0x0040_0040);
        let fx = execute(&jal, 0x0040_0000, &Operands::default(), true);
        assert_eq!(fx.write, Some((RA, 0x0040_0008)));
        assert_eq!(fx.branch, Some(Branch { target: 0x0040_0040, delayed: true }));
        let fx = execute(&jal, 0x0040_0000, &Operands::default(), false);
        assert_eq!(fx.write, Some((RA, 0x0040_0004)));

        let eret = Instruction::reg(ROp::Eret, ZERO, ZERO, ZERO);
        let fx = execute(&eret, 0, &Operands { epc: 0x80, ..Default::default() }, true);
        assert_eq!(fx.branch, Some(Branch { target: 0x80, delayed: false }));
        assert!(fx.eret);
    }

    #[test]
    fn test_traps() {
        let teq = Instruction::reg(ROp::Teq, ZERO, T0, T1);
        assert_eq!(execute(&teq, 0, &ops(4, 4), false).signal, Some(ExceptionKind::Trap));
        assert_eq!(execute(&teq, 0, &ops(4, 5), false).signal, None);

        let tlti = Instruction::imm(IOp::Tlti, ZERO, T0, 0);
        assert_eq!(execute(&tlti, 0, &ops(-1i32 as u32, 0), false).signal, Some(ExceptionKind::Trap));
    }

    #[test]
    fn test_dependencies() {
        let add = Instruction::reg(ROp::Add, T0, T1, T2);
        let sub = Instruction::reg(ROp::Sub, T2, T0, ZERO);
        assert!(sources(&sub).overlaps(&destinations(&add)));
        let or = Instruction::reg(ROp::Or, T1, S0, S0);
        assert!(!sources(&or).overlaps(&destinations(&add)));

        // $zero never creates a dependency
        let to_zero = Instruction::reg(ROp::Addu, ZERO, T1, T2);
        let from_zero = Instruction::reg(ROp::Addu, T0, ZERO, ZERO);
        assert!(!sources(&from_zero).overlaps(&destinations(&to_zero)));

        let mult = Instruction::reg(ROp::Mult, ZERO, T0, T1);
        let mflo = Instruction::reg(ROp::Mflo, T2, ZERO, ZERO);
        assert!(sources(&mflo).overlaps(&destinations(&mult)));

        let sw = Instruction::imm(IOp::Sw, T0, S0, 0);
        assert_eq!(destinations(&sw), RegUse::default());
        assert!(sources(&sw).overlaps(&destinations(&add)));

        // eret clears Status.EXL
        let eret = Instruction::reg(ROp::Eret, ZERO, ZERO, ZERO);
        let mfc0 = Instruction::reg(ROp::Mfc0, ZERO, ZERO, T0);
        assert!(sources(&mfc0).overlaps(&destinations(&eret)));
    }
}

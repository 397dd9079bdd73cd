//! Components relating to the representation of machine instructions.
//!
//! These components together are used to construct [`instr::Instruction`]
//! (a data structure holding one decoded machine word).

pub mod instr;

use std::num::TryFromIntError;

/// A general-purpose register. Must be between 0 and 31.
///
/// This `Reg` struct can either be constructed by selecting a register from [`reg_consts`],
/// or by using [`Reg::try_from`].
///
/// ## Examples
///
/// ```text
/// add $t0, $t1, $t2
///     ~~~  ~~~  ~~~
/// lw $ra, 4($sp)
///    ~~~    ~~~
/// ```
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, Default)]
pub struct Reg(pub(crate) u8);

/// Register constants, named by their software convention.
pub mod reg_consts {
    use super::Reg;

    /// Hard-wired zero.
    pub const ZERO: Reg = Reg(0);
    /// Assembler temporary.
    pub const AT: Reg = Reg(1);
    /// First return value (and syscall number).
    pub const V0: Reg = Reg(2);
    /// Second return value.
    pub const V1: Reg = Reg(3);
    /// First argument.
    pub const A0: Reg = Reg(4);
    /// Second argument.
    pub const A1: Reg = Reg(5);
    /// Third argument.
    pub const A2: Reg = Reg(6);
    /// Fourth argument.
    pub const A3: Reg = Reg(7);
    /// Temporary 0.
    pub const T0: Reg = Reg(8);
    /// Temporary 1.
    pub const T1: Reg = Reg(9);
    /// Temporary 2.
    pub const T2: Reg = Reg(10);
    /// Temporary 3.
    pub const T3: Reg = Reg(11);
    /// Temporary 4.
    pub const T4: Reg = Reg(12);
    /// Temporary 5.
    pub const T5: Reg = Reg(13);
    /// Temporary 6.
    pub const T6: Reg = Reg(14);
    /// Temporary 7.
    pub const T7: Reg = Reg(15);
    /// Saved 0.
    pub const S0: Reg = Reg(16);
    /// Saved 1.
    pub const S1: Reg = Reg(17);
    /// Saved 2.
    pub const S2: Reg = Reg(18);
    /// Saved 3.
    pub const S3: Reg = Reg(19);
    /// Saved 4.
    pub const S4: Reg = Reg(20);
    /// Saved 5.
    pub const S5: Reg = Reg(21);
    /// Saved 6.
    pub const S6: Reg = Reg(22);
    /// Saved 7.
    pub const S7: Reg = Reg(23);
    /// Temporary 8.
    pub const T8: Reg = Reg(24);
    /// Temporary 9.
    pub const T9: Reg = Reg(25);
    /// Kernel 0.
    pub const K0: Reg = Reg(26);
    /// Kernel 1.
    pub const K1: Reg = Reg(27);
    /// Global pointer.
    pub const GP: Reg = Reg(28);
    /// Stack pointer.
    pub const SP: Reg = Reg(29);
    /// Frame pointer.
    pub const FP: Reg = Reg(30);
    /// Return address.
    pub const RA: Reg = Reg(31);
}

const REG_NAMES: [&str; 32] = [
    "zero", "at", "v0", "v1", "a0", "a1", "a2", "a3",
    "t0", "t1", "t2", "t3", "t4", "t5", "t6", "t7",
    "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7",
    "t8", "t9", "k0", "k1", "gp", "sp", "fp", "ra",
];

impl Reg {
    /// Gets the register number of this [`Reg`]. This is always between 0 and 31.
    pub fn reg_no(self) -> u8 {
        self.0
    }

    /// Creates a register from the low 5 bits of a value.
    ///
    /// This is infallible, as any 5-bit field names a register.
    pub(crate) fn from_field(bits: u32) -> Self {
        Reg((bits & 0x1F) as u8)
    }

    /// The conventional name of this register (without the `$` sigil).
    pub fn name(self) -> &'static str {
        REG_NAMES[usize::from(self.0)]
    }
}
impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${}", self.name())
    }
}
impl From<Reg> for usize {
    // Used for indexing the reg file.
    fn from(value: Reg) -> Self {
        usize::from(value.0)
    }
}
impl TryFrom<u8> for Reg {
    type Error = TryFromIntError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0..=31 => Ok(Reg(value)),
            // HACKy, but there's no other way to create this error
            _      => u8::try_from(256).map(|_| unreachable!("should've been TryFromIntError")),
        }
    }
}

/// Sign-extends a 16-bit immediate into a 32-bit word.
pub fn sext16(imm: u16) -> u32 {
    imm as i16 as i32 as u32
}
/// Zero-extends a 16-bit immediate into a 32-bit word.
pub fn zext16(imm: u16) -> u32 {
    u32::from(imm)
}

#[cfg(test)]
mod tests {
    use super::reg_consts::{RA, SP, ZERO};
    use super::*;

    #[test]
    fn test_reg_names() {
        assert_eq!(ZERO.to_string(), "$zero");
        assert_eq!(SP.to_string(), "$sp");
        assert_eq!(RA.reg_no(), 31);
        assert_eq!(Reg::try_from(8).unwrap().name(), "t0");
        assert!(Reg::try_from(32).is_err());
    }

    #[test]
    fn test_extension() {
        assert_eq!(sext16(0xFFFF), 0xFFFF_FFFF);
        assert_eq!(sext16(0x7FFF), 0x0000_7FFF);
        assert_eq!(zext16(0xFFFF), 0x0000_FFFF);
    }
}

//! The instruction codec.
//!
//! This module converts between raw 32-bit machine words and [`Instruction`]s.
//!
//! Every instruction is in one of three formats:
//!
//! ```text
//! Register:  | opcode (6) | rs (5) | rt (5) | rd (5) | shamt (5) | funct (6) |
//! Immediate: | opcode (6) | rs (5) | rt (5) |          immediate (16)        |
//! Jump:      | opcode (6) |                 target (26)                     |
//! ```
//!
//! Which mnemonic a word holds is determined by the opcode, and for some opcodes
//! by a selector field (`funct` for `SPECIAL`, `rt` for `REGIMM`, `rs` for `COP0`).
//! The mnemonics and their selector values are listed in static tables
//! ([`ROp::ALL`], [`IOp::ALL`], [`JOp::ALL`]), which both [`Instruction::decode`]
//! and [`Instruction::encode`] are driven by.
//!
//! ```
//! use mips_ensemble::ast::instr::{Instruction, IOp};
//! use mips_ensemble::ast::reg_consts::{T0, ZERO};
//!
//! let instr = Instruction::decode(0x2008000A).unwrap();
//! assert_eq!(instr, Instruction::Immediate { op: IOp::Addi, rs: ZERO, rt: T0, imm: 10 });
//! assert_eq!(instr.encode(), 0x2008000A);
//! assert_eq!(instr.to_string(), "addi $t0, $zero, 10");
//! ```

use super::{sext16, zext16, Reg};

const OP_SPECIAL: u8 = 0x00;
const OP_REGIMM: u8 = 0x01;
const OP_COP0: u8 = 0x10;
const OP_SPECIAL2: u8 = 0x1C;

/// Error raised when a word does not match any known instruction.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct DecodeErr(pub u32);
impl std::fmt::Display for DecodeErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unrecognized instruction 0x{:08X}", self.0)
    }
}
impl std::error::Error for DecodeErr {}

/// How the 16-bit immediate of an [`IOp`] is widened to 32 bits.
///
/// This is a property of the mnemonic, not of the format:
/// `addi` and `andi` are both in the immediate format,
/// but only `addi` sign-extends.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ImmKind {
    /// The immediate is sign-extended.
    Signed,
    /// The immediate is zero-extended.
    Unsigned,
    /// The immediate is placed into the upper half of the word (`lui`).
    Upper,
}

#[derive(Clone, Copy)]
struct REnc {
    opcode: u8,
    funct: u8,
    rs: Option<u8>,
}
const fn special(funct: u8) -> REnc {
    REnc { opcode: OP_SPECIAL, funct, rs: None }
}
const fn special2(funct: u8) -> REnc {
    REnc { opcode: OP_SPECIAL2, funct, rs: None }
}
const fn cop0(rs: u8, funct: u8) -> REnc {
    REnc { opcode: OP_COP0, funct, rs: Some(rs) }
}

#[derive(Clone, Copy)]
struct IEnc {
    opcode: u8,
    rt: Option<u8>,
    kind: ImmKind,
}
const fn imm(opcode: u8, kind: ImmKind) -> IEnc {
    IEnc { opcode, rt: None, kind }
}
const fn regimm(rt: u8) -> IEnc {
    IEnc { opcode: OP_REGIMM, rt: Some(rt), kind: ImmKind::Signed }
}

macro_rules! mnemonics {
    ($(#[$m:meta])* $Type:ident($Enc:ident) { $($name:ident = $text:literal => $enc:expr),+ $(,)? }) => {
        $(#[$m])*
        #[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
        pub enum $Type {
            $(
                #[doc = concat!("`", $text, "`")]
                $name
            ),+
        }
        impl $Type {
            /// Every mnemonic of this format, in table order.
            pub const ALL: &'static [$Type] = &[$(Self::$name),+];

            /// The assembly name of this mnemonic.
            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$name => $text),+
                }
            }

            fn encoding(self) -> $Enc {
                match self {
                    $(Self::$name => $enc),+
                }
            }
        }
        impl std::fmt::Display for $Type {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }
    }
}

mnemonics!(
    /// Mnemonics in the register format.
    ROp(REnc) {
        Sll     = "sll"     => special(0x00),
        Srl     = "srl"     => special(0x02),
        Sra     = "sra"     => special(0x03),
        Sllv    = "sllv"    => special(0x04),
        Srlv    = "srlv"    => special(0x06),
        Srav    = "srav"    => special(0x07),
        Jr      = "jr"      => special(0x08),
        Jalr    = "jalr"    => special(0x09),
        Movz    = "movz"    => special(0x0A),
        Movn    = "movn"    => special(0x0B),
        Syscall = "syscall" => special(0x0C),
        Break   = "break"   => special(0x0D),
        Mfhi    = "mfhi"    => special(0x10),
        Mthi    = "mthi"    => special(0x11),
        Mflo    = "mflo"    => special(0x12),
        Mtlo    = "mtlo"    => special(0x13),
        Mult    = "mult"    => special(0x18),
        Multu   = "multu"   => special(0x19),
        Div     = "div"     => special(0x1A),
        Divu    = "divu"    => special(0x1B),
        Add     = "add"     => special(0x20),
        Addu    = "addu"    => special(0x21),
        Sub     = "sub"     => special(0x22),
        Subu    = "subu"    => special(0x23),
        And     = "and"     => special(0x24),
        Or      = "or"      => special(0x25),
        Xor     = "xor"     => special(0x26),
        Nor     = "nor"     => special(0x27),
        Slt     = "slt"     => special(0x2A),
        Sltu    = "sltu"    => special(0x2B),
        Tge     = "tge"     => special(0x30),
        Tgeu    = "tgeu"    => special(0x31),
        Tlt     = "tlt"     => special(0x32),
        Tltu    = "tltu"    => special(0x33),
        Teq     = "teq"     => special(0x34),
        Tne     = "tne"     => special(0x36),
        Mul     = "mul"     => special2(0x02),
        Clz     = "clz"     => special2(0x20),
        Clo     = "clo"     => special2(0x21),
        Mfc0    = "mfc0"    => cop0(0x00, 0x00),
        Mtc0    = "mtc0"    => cop0(0x04, 0x00),
        Eret    = "eret"    => cop0(0x10, 0x18),
    }
);

mnemonics!(
    /// Mnemonics in the immediate format.
    IOp(IEnc) {
        Bltz   = "bltz"   => regimm(0x00),
        Bgez   = "bgez"   => regimm(0x01),
        Tgei   = "tgei"   => regimm(0x08),
        Tgeiu  = "tgeiu"  => regimm(0x09),
        Tlti   = "tlti"   => regimm(0x0A),
        Tltiu  = "tltiu"  => regimm(0x0B),
        Teqi   = "teqi"   => regimm(0x0C),
        Tnei   = "tnei"   => regimm(0x0E),
        Bltzal = "bltzal" => regimm(0x10),
        Bgezal = "bgezal" => regimm(0x11),
        Beq    = "beq"    => imm(0x04, ImmKind::Signed),
        Bne    = "bne"    => imm(0x05, ImmKind::Signed),
        Blez   = "blez"   => imm(0x06, ImmKind::Signed),
        Bgtz   = "bgtz"   => imm(0x07, ImmKind::Signed),
        Addi   = "addi"   => imm(0x08, ImmKind::Signed),
        Addiu  = "addiu"  => imm(0x09, ImmKind::Signed),
        Slti   = "slti"   => imm(0x0A, ImmKind::Signed),
        Sltiu  = "sltiu"  => imm(0x0B, ImmKind::Signed),
        Andi   = "andi"   => imm(0x0C, ImmKind::Unsigned),
        Ori    = "ori"    => imm(0x0D, ImmKind::Unsigned),
        Xori   = "xori"   => imm(0x0E, ImmKind::Unsigned),
        Lui    = "lui"    => imm(0x0F, ImmKind::Upper),
        Lb     = "lb"     => imm(0x20, ImmKind::Signed),
        Lh     = "lh"     => imm(0x21, ImmKind::Signed),
        Lw     = "lw"     => imm(0x23, ImmKind::Signed),
        Lbu    = "lbu"    => imm(0x24, ImmKind::Signed),
        Lhu    = "lhu"    => imm(0x25, ImmKind::Signed),
        Sb     = "sb"     => imm(0x28, ImmKind::Signed),
        Sh     = "sh"     => imm(0x29, ImmKind::Signed),
        Sw     = "sw"     => imm(0x2B, ImmKind::Signed),
    }
);

mnemonics!(
    /// Mnemonics in the jump format.
    JOp(u8) {
        J   = "j"   => 0x02,
        Jal = "jal" => 0x03,
    }
);

impl ROp {
    fn lookup(opcode: u8, funct: u8, rs: u8) -> Option<Self> {
        Self::ALL.iter()
            .copied()
            .find(|op| {
                let e = op.encoding();
                e.opcode == opcode && e.funct == funct && e.rs.map_or(true, |sel| sel == rs)
            })
    }
}
impl IOp {
    fn lookup(opcode: u8, rt: u8) -> Option<Self> {
        Self::ALL.iter()
            .copied()
            .find(|op| {
                let e = op.encoding();
                e.opcode == opcode && e.rt.map_or(true, |sel| sel == rt)
            })
    }

    /// How this mnemonic widens its immediate.
    pub fn imm_kind(self) -> ImmKind {
        self.encoding().kind
    }

    /// Widens a 16-bit immediate to 32 bits according to [`IOp::imm_kind`].
    pub fn extend(self, imm: u16) -> u32 {
        match self.imm_kind() {
            ImmKind::Signed   => sext16(imm),
            ImmKind::Unsigned => zext16(imm),
            ImmKind::Upper    => u32::from(imm) << 16,
        }
    }

    /// Whether this is a conditional branch.
    pub fn is_branch(self) -> bool {
        matches!(self,
            IOp::Beq | IOp::Bne | IOp::Blez | IOp::Bgtz
            | IOp::Bltz | IOp::Bgez | IOp::Bltzal | IOp::Bgezal
        )
    }
}
impl JOp {
    fn lookup(opcode: u8) -> Option<Self> {
        Self::ALL.iter()
            .copied()
            .find(|op| op.encoding() == opcode)
    }
}

/// The format of an instruction.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Format {
    /// Register format (`rs`, `rt`, `rd`, `shamt`, `funct`).
    Register,
    /// Immediate format (`rs`, `rt`, 16-bit immediate).
    Immediate,
    /// Jump format (26-bit target).
    Jump,
}

/// A decoded machine instruction.
///
/// Only the defined bit fields are kept. Fields that act as selectors for a mnemonic
/// (e.g., the `rt` field of `bltz`) are decoded as their selector value and are forced
/// to it on encoding, so `decode(encode(i)) == i` for any `i` produced by [`Instruction::decode`].
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Instruction {
    /// An instruction in the register format.
    Register {
        /// The mnemonic.
        op: ROp,
        /// First source register.
        rs: Reg,
        /// Second source register.
        rt: Reg,
        /// Destination register.
        rd: Reg,
        /// Shift amount (5 bits).
        shamt: u8,
    },
    /// An instruction in the immediate format.
    Immediate {
        /// The mnemonic.
        op: IOp,
        /// Source (or base) register.
        rs: Reg,
        /// Destination (or second source) register.
        rt: Reg,
        /// The raw 16-bit immediate. See [`IOp::extend`] for its 32-bit value.
        imm: u16,
    },
    /// An instruction in the jump format.
    Jump {
        /// The mnemonic.
        op: JOp,
        /// The 26-bit word index of the target within the current 256 MiB region.
        target: u32,
    },
}

impl Instruction {
    /// The canonical no-op (`sll $zero, $zero, 0`, encoded as `0x00000000`).
    pub const NOP: Instruction = Instruction::Register {
        op: ROp::Sll, rs: Reg(0), rt: Reg(0), rd: Reg(0), shamt: 0
    };

    /// Decodes a machine word.
    ///
    /// This fails if the word does not match any known mnemonic.
    pub fn decode(word: u32) -> Result<Self, DecodeErr> {
        let opcode = (word >> 26) as u8;
        let rs = Reg::from_field(word >> 21);
        let rt = Reg::from_field(word >> 16);
        let rd = Reg::from_field(word >> 11);
        let shamt = ((word >> 6) & 0x1F) as u8;
        let funct = (word & 0x3F) as u8;

        if let Some(op) = ROp::lookup(opcode, funct, rs.0) {
            return Ok(Instruction::Register { op, rs, rt, rd, shamt });
        }
        if let Some(op) = IOp::lookup(opcode, rt.0) {
            return Ok(Instruction::Immediate { op, rs, rt, imm: word as u16 });
        }
        if let Some(op) = JOp::lookup(opcode) {
            return Ok(Instruction::Jump { op, target: word & 0x03FF_FFFF });
        }

        Err(DecodeErr(word))
    }

    /// Encodes this instruction into a machine word.
    pub fn encode(&self) -> u32 {
        match *self {
            Instruction::Register { op, rs, rt, rd, shamt } => {
                let e = op.encoding();
                let rs = e.rs.unwrap_or(rs.0);

                u32::from(e.opcode) << 26
                    | u32::from(rs & 0x1F) << 21
                    | u32::from(rt.0 & 0x1F) << 16
                    | u32::from(rd.0 & 0x1F) << 11
                    | u32::from(shamt & 0x1F) << 6
                    | u32::from(e.funct)
            },
            Instruction::Immediate { op, rs, rt, imm } => {
                let e = op.encoding();
                let rt = e.rt.unwrap_or(rt.0);

                u32::from(e.opcode) << 26
                    | u32::from(rs.0 & 0x1F) << 21
                    | u32::from(rt & 0x1F) << 16
                    | u32::from(imm)
            },
            Instruction::Jump { op, target } => {
                u32::from(op.encoding()) << 26 | (target & 0x03FF_FFFF)
            },
        }
    }

    /// Creates a register-format instruction with operands in assembly order (`op rd, rs, rt`).
    pub fn reg(op: ROp, rd: Reg, rs: Reg, rt: Reg) -> Self {
        Instruction::Register { op, rs, rt, rd, shamt: 0 }
    }
    /// Creates a shift-by-immediate instruction (`op rd, rt, shamt`).
    pub fn shift(op: ROp, rd: Reg, rt: Reg, shamt: u8) -> Self {
        Instruction::Register { op, rs: Reg(0), rt, rd, shamt: shamt & 0x1F }
    }
    /// Creates an immediate-format instruction with operands in assembly order (`op rt, rs, imm`).
    ///
    /// For branches this is `op rs, rt, offset`'s fields, with `rt` in the second position.
    pub fn imm(op: IOp, rt: Reg, rs: Reg, imm: u16) -> Self {
        let rt = op.encoding().rt.map_or(rt, Reg);
        Instruction::Immediate { op, rs, rt, imm }
    }
    /// Creates a jump-format instruction targeting the given byte address.
    pub fn jump(op: JOp, addr: u32) -> Self {
        Instruction::Jump { op, target: (addr >> 2) & 0x03FF_FFFF }
    }

    /// The format of this instruction.
    pub fn format(&self) -> Format {
        match self {
            Instruction::Register { .. }  => Format::Register,
            Instruction::Immediate { .. } => Format::Immediate,
            Instruction::Jump { .. }      => Format::Jump,
        }
    }

    /// The code payload of this instruction.
    ///
    /// - `syscall` and `break` carry a 20-bit code in bits 25..6.
    /// - Register-format traps carry a 10-bit code in bits 15..6.
    /// - Every other instruction has no code (0).
    pub fn code(&self) -> u32 {
        let word = self.encode();
        match self {
            Instruction::Register { op: ROp::Syscall | ROp::Break, .. } => (word >> 6) & 0xF_FFFF,
            Instruction::Register { op: ROp::Tge | ROp::Tgeu | ROp::Tlt | ROp::Tltu | ROp::Teq | ROp::Tne, .. } => (word >> 6) & 0x3FF,
            _ => 0,
        }
    }
}
impl Default for Instruction {
    fn default() -> Self {
        Self::NOP
    }
}
impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            i if i == Self::NOP => f.write_str("nop"),
            Instruction::Register { op, rs, rt, rd, shamt } => match op {
                ROp::Sll | ROp::Srl | ROp::Sra => write!(f, "{op} {rd}, {rt}, {shamt}"),
                ROp::Sllv | ROp::Srlv | ROp::Srav => write!(f, "{op} {rd}, {rt}, {rs}"),
                ROp::Jr | ROp::Mthi | ROp::Mtlo => write!(f, "{op} {rs}"),
                ROp::Jalr => write!(f, "{op} {rd}, {rs}"),
                ROp::Mfhi | ROp::Mflo => write!(f, "{op} {rd}"),
                ROp::Syscall | ROp::Eret => f.write_str(op.name()),
                ROp::Break => write!(f, "{op} {}", self.code()),
                ROp::Mult | ROp::Multu | ROp::Div | ROp::Divu
                | ROp::Tge | ROp::Tgeu | ROp::Tlt | ROp::Tltu | ROp::Teq | ROp::Tne => write!(f, "{op} {rs}, {rt}"),
                ROp::Clz | ROp::Clo => write!(f, "{op} {rd}, {rs}"),
                ROp::Mfc0 | ROp::Mtc0 => write!(f, "{op} {rt}, ${}", rd.0),
                _ => write!(f, "{op} {rd}, {rs}, {rt}"),
            },
            Instruction::Immediate { op, rs, rt, imm } => match op {
                IOp::Beq | IOp::Bne => write!(f, "{op} {rs}, {rt}, {}", imm as i16),
                IOp::Blez | IOp::Bgtz | IOp::Bltz | IOp::Bgez | IOp::Bltzal | IOp::Bgezal => write!(f, "{op} {rs}, {}", imm as i16),
                IOp::Tgei | IOp::Tgeiu | IOp::Tlti | IOp::Tltiu | IOp::Teqi | IOp::Tnei => write!(f, "{op} {rs}, {}", imm as i16),
                IOp::Lui => write!(f, "{op} {rt}, 0x{imm:X}"),
                IOp::Andi | IOp::Ori | IOp::Xori => write!(f, "{op} {rt}, {rs}, 0x{imm:X}"),
                IOp::Lb | IOp::Lh | IOp::Lw | IOp::Lbu | IOp::Lhu
                | IOp::Sb | IOp::Sh | IOp::Sw => write!(f, "{op} {rt}, {}({rs})", imm as i16),
                _ => write!(f, "{op} {rt}, {rs}, {}", imm as i16),
            },
            Instruction::Jump { op, target } => write!(f, "{op} 0x{:08X}", target << 2),
        }
    }
}

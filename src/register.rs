//! Tagged representation of the integer and floating-point registers the
//! encoder can address, plus base+offset memory operands.
//!
//! Two constructors, [`Register::from_base`] and [`Register::from_ext`],
//! collapse into one integer-register type carrying an explicit
//! discriminant: encoding branches differ between the two banks (the
//! `REX.B`/`REX.R`/`REX.X` bit a register contributes depends on which
//! bank it comes from), so the discriminant is kept visible rather than
//! hidden behind an implicit conversion.

use std::fmt;

/// One of the eight registers addressable without a REX prefix bit:
/// `AX, CX, DX, BX, SP, BP, SI, DI` (encodings 0-7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum BaseReg {
    Ax = 0,
    Cx = 1,
    Dx = 2,
    Bx = 3,
    Sp = 4,
    Bp = 5,
    Si = 6,
    Di = 7,
}

/// One of the eight extended registers `R8-R15` (encodings 0-7 with
/// `REX.B`/`REX.R`/`REX.X` set as appropriate at the use site).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ExtReg {
    R8 = 0,
    R9 = 1,
    R10 = 2,
    R11 = 3,
    R12 = 4,
    R13 = 5,
    R14 = 6,
    R15 = 7,
}

/// A general-purpose integer register, 8 bytes wide. 32-bit use is
/// selected at the instruction level (suppressing `REX.W`), not by this
/// type: the same [`Register`] value denotes both `RAX` and `EAX`
/// depending on the `is32bit` flag the encoder call site provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    /// A register from the base bank (no REX bit required to select it).
    Base(BaseReg),
    /// A register from the extended bank (requires a REX bit).
    Ext(ExtReg),
}

impl Register {
    /// `RAX` / `EAX`.
    pub const RAX: Register = Register::Base(BaseReg::Ax);
    /// `RCX` / `ECX`.
    pub const RCX: Register = Register::Base(BaseReg::Cx);
    /// `RDX` / `EDX`.
    pub const RDX: Register = Register::Base(BaseReg::Dx);
    /// `RBX` / `EBX`.
    pub const RBX: Register = Register::Base(BaseReg::Bx);
    /// `RSP` / `ESP`.
    pub const RSP: Register = Register::Base(BaseReg::Sp);
    /// `RBP` / `EBP`.
    pub const RBP: Register = Register::Base(BaseReg::Bp);
    /// `RSI` / `ESI`.
    pub const RSI: Register = Register::Base(BaseReg::Si);
    /// `RDI` / `EDI`.
    pub const RDI: Register = Register::Base(BaseReg::Di);
    /// `R8`.
    pub const R8: Register = Register::Ext(ExtReg::R8);
    /// `R9`.
    pub const R9: Register = Register::Ext(ExtReg::R9);
    /// `R10`.
    pub const R10: Register = Register::Ext(ExtReg::R10);
    /// `R11`.
    pub const R11: Register = Register::Ext(ExtReg::R11);
    /// `R12`: fixed integer scratch/spill register for the optimised pipeline.
    pub const R12: Register = Register::Ext(ExtReg::R12);
    /// `R13`.
    pub const R13: Register = Register::Ext(ExtReg::R13);
    /// `R14`.
    pub const R14: Register = Register::Ext(ExtReg::R14);
    /// `R15`.
    pub const R15: Register = Register::Ext(ExtReg::R15);

    /// Builds a register from the base bank.
    #[must_use]
    pub const fn from_base(reg: BaseReg) -> Register {
        Register::Base(reg)
    }

    /// Builds a register from the extended bank.
    #[must_use]
    pub const fn from_ext(reg: ExtReg) -> Register {
        Register::Ext(reg)
    }

    /// `true` if this register belongs to the extended bank and
    /// therefore requires a REX bit to select.
    #[must_use]
    pub const fn is_extended(self) -> bool {
        matches!(self, Register::Ext(_))
    }

    /// The 3-bit ModR/M / SIB encoding of this register, independent of
    /// bank (the REX bit supplies the missing 4th bit).
    #[must_use]
    pub const fn encoding(self) -> u8 {
        match self {
            Register::Base(b) => b as u8,
            Register::Ext(e) => e as u8,
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Register::Base(BaseReg::Ax) => "rax",
            Register::Base(BaseReg::Cx) => "rcx",
            Register::Base(BaseReg::Dx) => "rdx",
            Register::Base(BaseReg::Bx) => "rbx",
            Register::Base(BaseReg::Sp) => "rsp",
            Register::Base(BaseReg::Bp) => "rbp",
            Register::Base(BaseReg::Si) => "rsi",
            Register::Base(BaseReg::Di) => "rdi",
            Register::Ext(ExtReg::R8) => "r8",
            Register::Ext(ExtReg::R9) => "r9",
            Register::Ext(ExtReg::R10) => "r10",
            Register::Ext(ExtReg::R11) => "r11",
            Register::Ext(ExtReg::R12) => "r12",
            Register::Ext(ExtReg::R13) => "r13",
            Register::Ext(ExtReg::R14) => "r14",
            Register::Ext(ExtReg::R15) => "r15",
        };
        f.write_str(name)
    }
}

/// One of the eight directly addressable XMM registers, `XMM0-XMM7`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FloatRegister(u8);

impl FloatRegister {
    /// `XMM0`.
    pub const XMM0: FloatRegister = FloatRegister(0);
    /// `XMM1`.
    pub const XMM1: FloatRegister = FloatRegister(1);
    /// `XMM2`.
    pub const XMM2: FloatRegister = FloatRegister(2);
    /// `XMM3`.
    pub const XMM3: FloatRegister = FloatRegister(3);
    /// `XMM4`.
    pub const XMM4: FloatRegister = FloatRegister(4);
    /// `XMM5`: fixed float scratch/spill register for the optimised pipeline.
    pub const XMM5: FloatRegister = FloatRegister(5);
    /// `XMM6`.
    pub const XMM6: FloatRegister = FloatRegister(6);
    /// `XMM7`.
    pub const XMM7: FloatRegister = FloatRegister(7);

    /// Builds an XMM register from its 0-7 encoding.
    ///
    /// # Panics
    /// Panics if `encoding` is not in `0..8`; callers only ever pass a
    /// value produced by the allocator or a named constant above.
    #[must_use]
    pub const fn new(encoding: u8) -> FloatRegister {
        assert!(encoding < 8, "XMM encoding out of range");
        FloatRegister(encoding)
    }

    /// The 3-bit ModR/M encoding of this register.
    #[must_use]
    pub const fn encoding(self) -> u8 {
        self.0
    }
}

impl fmt::Display for FloatRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xmm{}", self.0)
    }
}

/// A `[base + offset]` memory operand. The offset defaults to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryOperand {
    /// Base register the address is computed from.
    pub base: Register,
    /// Signed byte offset added to `base`.
    pub offset: i32,
}

impl MemoryOperand {
    /// Builds a memory operand with an explicit offset.
    #[must_use]
    pub const fn new(base: Register, offset: i32) -> MemoryOperand {
        MemoryOperand { base, offset }
    }

    /// Builds a memory operand with a zero offset.
    #[must_use]
    pub const fn at(base: Register) -> MemoryOperand {
        MemoryOperand { base, offset: 0 }
    }

    /// `true` if `offset` fits the 1-byte-displacement ModR/M form.
    #[must_use]
    pub const fn fits_disp8(self) -> bool {
        self.offset >= i8::MIN as i32 && self.offset <= i8::MAX as i32
    }

    /// `true` if addressing this operand requires an explicit SIB byte
    /// (`0x24`), i.e. the base register is `RSP`/`R12` (same 3-bit
    /// encoding, `100`).
    #[must_use]
    pub const fn requires_sib(self) -> bool {
        self.base.encoding() == BaseReg::Sp as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_and_ext_share_encodings() {
        assert_eq!(Register::RAX.encoding(), 0);
        assert_eq!(Register::R8.encoding(), 0);
        assert!(!Register::RAX.is_extended());
        assert!(Register::R8.is_extended());
    }

    #[test]
    fn rsp_and_r12_both_require_sib() {
        assert!(MemoryOperand::at(Register::RSP).requires_sib());
        assert!(MemoryOperand::at(Register::R12).requires_sib());
        assert!(!MemoryOperand::at(Register::RAX).requires_sib());
    }

    #[test]
    fn disp8_boundary() {
        assert!(MemoryOperand::new(Register::RAX, 127).fits_disp8());
        assert!(MemoryOperand::new(Register::RAX, -128).fits_disp8());
        assert!(!MemoryOperand::new(Register::RAX, 128).fits_disp8());
        assert!(!MemoryOperand::new(Register::RAX, -129).fits_disp8());
    }

    #[test]
    fn float_register_display() {
        assert_eq!(FloatRegister::XMM5.to_string(), "xmm5");
    }
}

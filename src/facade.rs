//! Typed assembler facade: one entry per logical mnemonic, dispatching
//! from `(operand-kind, operand-kind)` tuples to the correct raw-encoder
//! function — a handful of encoder-function pointers behind one shared
//! routine, rather than method overloading.

use crate::buffer::CodeBuffer;
use crate::error::{JitError, Result};
use crate::raw;
use crate::raw::Condition;
use crate::register::{FloatRegister, MemoryOperand, Register};

/// An integer operand: a register from either bank, or a memory
/// location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOperand {
    /// A general-purpose register.
    Reg(Register),
    /// A `[base + offset]` memory operand.
    Mem(MemoryOperand),
}

/// A floating-point operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatOperand {
    /// An XMM register.
    Reg(FloatRegister),
    /// A `[base + offset]` memory operand.
    Mem(MemoryOperand),
}

/// Either an integer or a float register, for `push`/`pop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackOperand {
    /// An integer register.
    Int(Register),
    /// A float register, synthesised via an 8-byte stack slot; the
    /// upper 4 bytes are left undefined.
    Float(FloatRegister),
}

/// Signed or unsigned relational condition for conditional jumps,
/// resolved to a concrete [`Condition`] by [`Assembler::jump_if`]. The
/// integer comparison family defaults to signed unless `unsigned` is
/// explicitly set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// `==`.
    Equal,
    /// `!=`.
    NotEqual,
    /// `>`.
    Greater,
    /// `>=`.
    GreaterOrEqual,
    /// `<`.
    Less,
    /// `<=`.
    LessOrEqual,
}

impl Relation {
    /// Resolves to the concrete (signed or unsigned) [`Condition`].
    /// `unsigned` is ignored for `Equal`/`NotEqual`, which have no
    /// signedness distinction.
    #[must_use]
    pub fn resolve(self, unsigned: bool) -> Condition {
        match (self, unsigned) {
            (Relation::Equal, _) => Condition::Equal,
            (Relation::NotEqual, _) => Condition::NotEqual,
            (Relation::Greater, false) => Condition::Greater,
            (Relation::Greater, true) => Condition::Above,
            (Relation::GreaterOrEqual, false) => Condition::GreaterOrEqual,
            (Relation::GreaterOrEqual, true) => Condition::AboveOrEqual,
            (Relation::Less, false) => Condition::Less,
            (Relation::Less, true) => Condition::Below,
            (Relation::LessOrEqual, false) => Condition::LessOrEqual,
            (Relation::LessOrEqual, true) => Condition::BelowOrEqual,
        }
    }
}

/// Typed assembler: every method is a logical mnemonic that dispatches
/// to the raw encoder based on the tags of its operands.
#[derive(Debug, Default)]
pub struct Assembler {
    /// The byte buffer instructions are appended to.
    pub buffer: CodeBuffer,
}

impl Assembler {
    /// Creates an assembler over a fresh, empty buffer.
    #[must_use]
    pub fn new() -> Assembler {
        Assembler { buffer: CodeBuffer::new() }
    }

    /// Current byte offset (where the next instruction will land).
    #[must_use]
    pub fn offset(&self) -> usize {
        self.buffer.len()
    }

    fn int_binop(
        &mut self,
        dst: IntOperand,
        src: IntOperand,
        is32bit: bool,
        rr: fn(&mut CodeBuffer, Register, Register, bool),
        rm: fn(&mut CodeBuffer, Register, MemoryOperand, bool),
        mr: fn(&mut CodeBuffer, MemoryOperand, Register, bool),
        mnemonic: &'static str,
    ) -> Result<()> {
        match (dst, src) {
            (IntOperand::Reg(d), IntOperand::Reg(s)) => rr(&mut self.buffer, d, s, is32bit),
            (IntOperand::Reg(d), IntOperand::Mem(s)) => rm(&mut self.buffer, d, s, is32bit),
            (IntOperand::Mem(d), IntOperand::Reg(s)) => mr(&mut self.buffer, d, s, is32bit),
            (IntOperand::Mem(_), IntOperand::Mem(_)) => {
                return Err(JitError::InternalEncoderInvariant {
                    location: "facade::int_binop",
                    detail: format!("{mnemonic}: memory-memory form must be rewritten by the virtual assembler"),
                })
            }
        }
        Ok(())
    }

    /// `mov dst, src`.
    pub fn mov(&mut self, dst: IntOperand, src: IntOperand, is32bit: bool) -> Result<()> {
        self.int_binop(dst, src, is32bit, raw::mov_rr, raw::mov_rm, raw::mov_mr, "mov")
    }

    /// `mov dst, imm32`.
    pub fn mov_imm(&mut self, dst: IntOperand, imm: i32, is32bit: bool) {
        match dst {
            IntOperand::Reg(d) => raw::mov_ri(&mut self.buffer, d, imm, is32bit),
            IntOperand::Mem(d) => raw::mov_mi(&mut self.buffer, d, imm, is32bit),
        }
    }

    /// `add dst, src`.
    pub fn add(&mut self, dst: IntOperand, src: IntOperand, is32bit: bool) -> Result<()> {
        self.int_binop(dst, src, is32bit, raw::add_rr, raw::add_rm, raw::add_mr, "add")
    }

    /// `add dst, imm32`.
    pub fn add_imm(&mut self, dst: IntOperand, imm: i32, is32bit: bool) {
        match dst {
            IntOperand::Reg(d) => raw::add_ri(&mut self.buffer, d, imm, is32bit),
            IntOperand::Mem(d) => raw::add_mi(&mut self.buffer, d, imm, is32bit),
        }
    }

    /// `sub dst, src`.
    pub fn sub(&mut self, dst: IntOperand, src: IntOperand, is32bit: bool) -> Result<()> {
        self.int_binop(dst, src, is32bit, raw::sub_rr, raw::sub_rm, raw::sub_mr, "sub")
    }

    /// `sub dst, imm32`.
    pub fn sub_imm(&mut self, dst: IntOperand, imm: i32, is32bit: bool) {
        match dst {
            IntOperand::Reg(d) => raw::sub_ri(&mut self.buffer, d, imm, is32bit),
            IntOperand::Mem(d) => raw::sub_mi(&mut self.buffer, d, imm, is32bit),
        }
    }

    /// `xor dst, src`.
    pub fn xor(&mut self, dst: IntOperand, src: IntOperand, is32bit: bool) -> Result<()> {
        self.int_binop(dst, src, is32bit, raw::xor_rr, raw::xor_rm, raw::xor_mr, "xor")
    }

    /// `xor dst, imm32`.
    pub fn xor_imm(&mut self, dst: IntOperand, imm: i32, is32bit: bool) {
        match dst {
            IntOperand::Reg(d) => raw::xor_ri(&mut self.buffer, d, imm, is32bit),
            IntOperand::Mem(d) => raw::xor_mi(&mut self.buffer, d, imm, is32bit),
        }
    }

    /// `cmp lhs, rhs`.
    pub fn cmp(&mut self, lhs: IntOperand, rhs: IntOperand, is32bit: bool) -> Result<()> {
        self.int_binop(lhs, rhs, is32bit, raw::cmp_rr, raw::cmp_rm, raw::cmp_mr, "cmp")
    }

    /// `cmp lhs, imm32`.
    pub fn cmp_imm(&mut self, lhs: IntOperand, imm: i32, is32bit: bool) {
        match lhs {
            IntOperand::Reg(d) => raw::cmp_ri(&mut self.buffer, d, imm, is32bit),
            IntOperand::Mem(d) => raw::cmp_mi(&mut self.buffer, d, imm, is32bit),
        }
    }

    /// `imul dst, src` — two-operand multiply, register destination only;
    /// a memory destination must go through the virtual assembler's
    /// `MemoryOnRight` rewrite.
    pub fn mul(&mut self, dst: Register, src: IntOperand, is32bit: bool) {
        match src {
            IntOperand::Reg(s) => raw::imul_rr(&mut self.buffer, dst, s, is32bit),
            IntOperand::Mem(s) => raw::imul_rm(&mut self.buffer, dst, s, is32bit),
        }
    }

    /// `cdq`/`cqo` followed by `idiv divisor`. `dividend_dest` must be
    /// `RAX`, the only place `idiv`'s quotient can land.
    pub fn div(&mut self, divisor: IntOperand, is32bit: bool, dividend_dest: Register) -> Result<()> {
        if is32bit {
            raw::cdq(&mut self.buffer);
        } else {
            raw::cqo(&mut self.buffer);
        }
        match divisor {
            IntOperand::Reg(d) => raw::idiv_r(&mut self.buffer, d, is32bit, dividend_dest),
            IntOperand::Mem(d) => raw::idiv_m(&mut self.buffer, d, is32bit, dividend_dest),
        }
    }

    fn float_binop(
        &mut self,
        dst: FloatOperand,
        src: FloatOperand,
        rr: fn(&mut CodeBuffer, FloatRegister, FloatRegister),
        rm: fn(&mut CodeBuffer, FloatRegister, MemoryOperand),
        mnemonic: &'static str,
    ) -> Result<()> {
        match (dst, src) {
            (FloatOperand::Reg(d), FloatOperand::Reg(s)) => {
                rr(&mut self.buffer, d, s);
                Ok(())
            }
            (FloatOperand::Reg(d), FloatOperand::Mem(s)) => {
                rm(&mut self.buffer, d, s);
                Ok(())
            }
            (FloatOperand::Mem(_), _) => Err(JitError::InternalEncoderInvariant {
                location: "facade::float_binop",
                detail: format!("{mnemonic}: scalar SSE forms always write to a register destination"),
            }),
        }
    }

    /// `movss dst, src`, including the memory-store direction.
    pub fn mov_float(&mut self, dst: FloatOperand, src: FloatOperand) -> Result<()> {
        match (dst, src) {
            (FloatOperand::Reg(d), FloatOperand::Reg(s)) => raw::movss_rr(&mut self.buffer, d, s),
            (FloatOperand::Reg(d), FloatOperand::Mem(s)) => raw::movss_rm(&mut self.buffer, d, s),
            (FloatOperand::Mem(d), FloatOperand::Reg(s)) => raw::movss_mr(&mut self.buffer, d, s),
            (FloatOperand::Mem(_), FloatOperand::Mem(_)) => {
                return Err(JitError::InternalEncoderInvariant {
                    location: "facade::mov_float",
                    detail: "movss: memory-memory form must be rewritten by the virtual assembler".into(),
                })
            }
        }
        Ok(())
    }

    /// `addss dst, src`.
    pub fn add_float(&mut self, dst: FloatOperand, src: FloatOperand) -> Result<()> {
        self.float_binop(dst, src, raw::addss_rr, raw::addss_rm, "addss")
    }

    /// `subss dst, src`.
    pub fn sub_float(&mut self, dst: FloatOperand, src: FloatOperand) -> Result<()> {
        self.float_binop(dst, src, raw::subss_rr, raw::subss_rm, "subss")
    }

    /// `mulss dst, src`.
    pub fn mul_float(&mut self, dst: FloatOperand, src: FloatOperand) -> Result<()> {
        self.float_binop(dst, src, raw::mulss_rr, raw::mulss_rm, "mulss")
    }

    /// `divss dst, src`.
    pub fn div_float(&mut self, dst: FloatOperand, src: FloatOperand) -> Result<()> {
        self.float_binop(dst, src, raw::divss_rr, raw::divss_rm, "divss")
    }

    /// `ucomiss lhs, rhs` — always the unsigned-style unordered compare,
    /// which is the correct flag interpretation for floating point.
    pub fn cmp_float(&mut self, lhs: FloatRegister, rhs: FloatOperand) {
        match rhs {
            FloatOperand::Reg(r) => raw::ucomiss_rr(&mut self.buffer, lhs, r),
            FloatOperand::Mem(m) => raw::ucomiss_rm(&mut self.buffer, lhs, m),
        }
    }

    /// `push operand`. A float register is synthesised as
    /// `sub rsp,8; movss [rsp],xmm`, leaving the upper 4 bytes of the
    /// slot undefined — harmless since this is only ever used for
    /// register save/restore round-trips through the same slot.
    pub fn push(&mut self, operand: StackOperand) {
        match operand {
            StackOperand::Int(r) => raw::push_r(&mut self.buffer, r),
            StackOperand::Float(x) => {
                raw::sub_ri(&mut self.buffer, Register::RSP, 8, false);
                raw::movss_mr(&mut self.buffer, MemoryOperand::at(Register::RSP), x);
            }
        }
    }

    /// `pop operand`, or `add rsp,8` (discard) when `operand` is `None`.
    pub fn pop(&mut self, operand: Option<StackOperand>) {
        match operand {
            None => raw::add_ri(&mut self.buffer, Register::RSP, 8, false),
            Some(StackOperand::Int(r)) => raw::pop_r(&mut self.buffer, r),
            Some(StackOperand::Float(x)) => {
                raw::movss_rm(&mut self.buffer, x, MemoryOperand::at(Register::RSP));
                raw::add_ri(&mut self.buffer, Register::RSP, 8, false);
            }
        }
    }

    /// Emits an unconditional `jmp rel32` placeholder and returns the
    /// site offset for later patching.
    pub fn jump(&mut self) -> usize {
        raw::jmp_rel32_placeholder(&mut self.buffer)
    }

    /// Emits a conditional `Jcc rel32` placeholder, resolving `relation`
    /// against `unsigned`, and returns the site offset.
    pub fn jump_if(&mut self, relation: Relation, unsigned: bool) -> usize {
        raw::jcc_rel32_placeholder(&mut self.buffer, relation.resolve(unsigned))
    }

    /// Emits a relative `call rel32` placeholder and returns the site
    /// offset.
    pub fn call_relative(&mut self) -> usize {
        raw::call_rel32_placeholder(&mut self.buffer)
    }

    /// Emits `mov target, imm64; call target` for a native function
    /// whose address is known at compile time.
    pub fn call_absolute(&mut self, target: Register, address: i64) {
        raw::mov_reg_imm64(&mut self.buffer, target, address);
        raw::call_reg(&mut self.buffer, target);
    }

    /// `ret`.
    pub fn ret(&mut self) {
        raw::ret(&mut self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_mem_mov_is_rejected() {
        let mut asm = Assembler::new();
        let mem = MemoryOperand::at(Register::RBP);
        assert!(asm.mov(IntOperand::Mem(mem), IntOperand::Mem(mem), false).is_err());
    }

    #[test]
    fn push_pop_float_round_trips_through_eight_byte_slot() {
        let mut asm = Assembler::new();
        asm.push(StackOperand::Float(FloatRegister::XMM0));
        asm.pop(Some(StackOperand::Float(FloatRegister::XMM0)));
        // sub rsp,8 (REX+opcode+modrm+imm32=7) + movss store (F3+REX?+0F+11+modrm+sib=6)
        // + movss load + add rsp,8: just assert it produced a non-trivial, balanced sequence.
        assert!(asm.offset() > 0);
    }

    #[test]
    fn relation_resolves_signed_by_default() {
        assert_eq!(Relation::Greater.resolve(false), Condition::Greater);
        assert_eq!(Relation::Greater.resolve(true), Condition::Above);
    }
}

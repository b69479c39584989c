//! Microsoft x64 calling-convention shim: parameter registers, shadow
//! space, stack alignment, and argument/return-value marshalling for
//! the `__fastcall`-derived Windows x64 ABI.

use crate::context::CompilationContext;
use crate::facade::{FloatOperand, IntOperand};
use crate::ir::VMType;
use crate::register::{FloatRegister, MemoryOperand, Register};

/// Integer/pointer argument registers, in order, for parameters 0-3.
pub const INT_PARAM_REGS: [Register; 4] = [Register::RCX, Register::RDX, Register::R8, Register::R9];
/// Float argument registers, in order, for parameters 0-3.
pub const FLOAT_PARAM_REGS: [FloatRegister; 4] =
    [FloatRegister::XMM0, FloatRegister::XMM1, FloatRegister::XMM2, FloatRegister::XMM3];
/// Bytes of shadow space the caller reserves below the first four
/// (register-passed) arguments.
pub const SHADOW_SPACE: i32 = 32;
/// Required stack alignment, in bytes, immediately before every `call`.
pub const STACK_ALIGNMENT: i32 = 16;

/// A concrete source or destination for an argument/return value: either
/// bank of register, or a memory location (a spill slot or a stack
/// argument slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// An integer register.
    IntReg(Register),
    /// An XMM register.
    FloatReg(FloatRegister),
    /// A memory operand.
    Mem(MemoryOperand),
}

impl Location {
    /// Converts to an [`IntOperand`] for use with [`crate::facade::Assembler`]
    /// integer methods.
    ///
    /// # Panics
    /// Panics if `self` is [`Location::FloatReg`].
    #[must_use]
    pub(crate) fn as_int_operand(self) -> IntOperand {
        match self {
            Location::IntReg(r) => IntOperand::Reg(r),
            Location::Mem(m) => IntOperand::Mem(m),
            Location::FloatReg(_) => unreachable!("integer move requested for a float location"),
        }
    }

    /// Converts to a [`FloatOperand`] for use with [`crate::facade::Assembler`]
    /// float methods.
    ///
    /// # Panics
    /// Panics if `self` is [`Location::IntReg`].
    #[must_use]
    pub(crate) fn as_float_operand(self) -> FloatOperand {
        match self {
            Location::FloatReg(r) => FloatOperand::Reg(r),
            Location::Mem(m) => FloatOperand::Mem(m),
            Location::IntReg(_) => unreachable!("float move requested for an integer location"),
        }
    }
}

/// Microsoft x64 ABI shim. Stateless: every operation takes the pieces
/// of context it needs explicitly.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsX64Abi;

impl WindowsX64Abi {
    /// Byte offset, relative to `rbp`, of the caller-stack slot holding
    /// argument `index` (only valid for `index >= 4`): `[rbp + 16 + 8*(index-4)]`.
    #[must_use]
    pub fn caller_stack_arg_offset(index: usize) -> i32 {
        16 + 8 * (index as i32 - 4)
    }

    /// In the prologue, copies every incoming argument (from its ABI
    /// register or the caller's stack) into the callee's home slot at
    /// `[rbp - 8*(1+i)]`.
    pub fn move_arguments_to_home_slots(&self, ctx: &mut CompilationContext, params: &[VMType]) {
        for (i, &ty) in params.iter().enumerate() {
            let home = MemoryOperand::new(Register::RBP, ctx.home_slot_offset(i));
            match ty {
                VMType::Int32 | VMType::Void => {
                    if i < 4 {
                        ctx.asm.mov(IntOperand::Mem(home), IntOperand::Reg(INT_PARAM_REGS[i]), false).unwrap();
                    } else {
                        let stack_src = MemoryOperand::new(Register::RBP, Self::caller_stack_arg_offset(i));
                        ctx.asm.mov(IntOperand::Reg(Register::RAX), IntOperand::Mem(stack_src), false).unwrap();
                        ctx.asm.mov(IntOperand::Mem(home), IntOperand::Reg(Register::RAX), false).unwrap();
                    }
                }
                VMType::Float32 => {
                    if i < 4 {
                        ctx.asm.mov_float(FloatOperand::Mem(home), FloatOperand::Reg(FLOAT_PARAM_REGS[i])).unwrap();
                    } else {
                        let stack_src = MemoryOperand::new(Register::RBP, Self::caller_stack_arg_offset(i));
                        ctx.asm
                            .mov_float(FloatOperand::Reg(FloatRegister::XMM5), FloatOperand::Mem(stack_src))
                            .unwrap();
                        ctx.asm.mov_float(FloatOperand::Mem(home), FloatOperand::Reg(FloatRegister::XMM5)).unwrap();
                    }
                }
            }
        }
    }

    /// For each argument (processed from last to first, matching the
    /// source's evaluation order), moves its current value from
    /// `arg_locations[i]` into the ABI register or caller-stack slot.
    /// Stack slots are written at `[rsp + 8*(i-4)]`, assuming the
    /// caller has already reserved shadow space and alignment padding
    /// below them.
    pub fn marshal_call_arguments(&self, ctx: &mut CompilationContext, param_types: &[VMType], arg_locations: &[Location]) {
        debug_assert_eq!(param_types.len(), arg_locations.len());
        for i in (0..param_types.len()).rev() {
            let ty = param_types[i];
            let src = arg_locations[i];
            match ty {
                VMType::Int32 | VMType::Void => {
                    if i < 4 {
                        if src != Location::IntReg(INT_PARAM_REGS[i]) {
                            ctx.asm.mov(IntOperand::Reg(INT_PARAM_REGS[i]), src.as_int_operand(), false).unwrap();
                        }
                    } else {
                        let dst = MemoryOperand::new(Register::RSP, 8 * (i as i32 - 4));
                        match src {
                            Location::IntReg(r) => {
                                ctx.asm.mov(IntOperand::Mem(dst), IntOperand::Reg(r), false).unwrap();
                            }
                            Location::Mem(_) => {
                                ctx.asm.mov(IntOperand::Reg(Register::RAX), src.as_int_operand(), false).unwrap();
                                ctx.asm.mov(IntOperand::Mem(dst), IntOperand::Reg(Register::RAX), false).unwrap();
                            }
                            Location::FloatReg(_) => unreachable!(),
                        }
                    }
                }
                VMType::Float32 => {
                    if i < 4 {
                        if src != Location::FloatReg(FLOAT_PARAM_REGS[i]) {
                            ctx.asm.mov_float(FloatOperand::Reg(FLOAT_PARAM_REGS[i]), src.as_float_operand()).unwrap();
                        }
                    } else {
                        let dst = MemoryOperand::new(Register::RSP, 8 * (i as i32 - 4));
                        match src {
                            Location::FloatReg(r) => {
                                ctx.asm.mov_float(FloatOperand::Mem(dst), FloatOperand::Reg(r)).unwrap();
                            }
                            Location::Mem(_) => {
                                ctx.asm
                                    .mov_float(FloatOperand::Reg(FloatRegister::XMM5), src.as_float_operand())
                                    .unwrap();
                                ctx.asm.mov_float(FloatOperand::Mem(dst), FloatOperand::Reg(FloatRegister::XMM5)).unwrap();
                            }
                            Location::IntReg(_) => unreachable!(),
                        }
                    }
                }
            }
        }
    }

    /// `(stack_args + num_saved_regs) mod 2`, scaled to an 8-byte pad.
    #[must_use]
    pub fn compute_alignment(&self, callee_params: &[VMType], num_saved_regs: usize) -> i32 {
        let stack_args = callee_params.len().saturating_sub(4);
        if (stack_args + num_saved_regs) % 2 == 1 {
            8
        } else {
            0
        }
    }

    /// Moves the value vreg's location into `RAX`/`XMM0` ahead of `ret`,
    /// skipping the move when it already resides there.
    pub fn emit_return_value(&self, ctx: &mut CompilationContext, return_type: VMType, value: Location) {
        match return_type {
            VMType::Void => {}
            VMType::Int32 => {
                if value != Location::IntReg(Register::RAX) {
                    ctx.asm.mov(IntOperand::Reg(Register::RAX), value.as_int_operand(), false).unwrap();
                }
            }
            VMType::Float32 => {
                if value != Location::FloatReg(FloatRegister::XMM0) {
                    ctx.asm.mov_float(FloatOperand::Reg(FloatRegister::XMM0), value.as_float_operand()).unwrap();
                }
            }
        }
    }

    /// Moves the just-returned value out of `RAX`/`XMM0` into `dest`,
    /// skipping the move when `dest` already is that register.
    pub fn consume_return_value(&self, ctx: &mut CompilationContext, return_type: VMType, dest: Location) {
        match return_type {
            VMType::Void => {}
            VMType::Int32 => {
                if dest != Location::IntReg(Register::RAX) {
                    ctx.asm.mov(dest.as_int_operand(), IntOperand::Reg(Register::RAX), false).unwrap();
                }
            }
            VMType::Float32 => {
                if dest != Location::FloatReg(FloatRegister::XMM0) {
                    ctx.asm.mov_float(dest.as_float_operand(), FloatOperand::Reg(FloatRegister::XMM0)).unwrap();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_is_a_parity_check() {
        let abi = WindowsX64Abi;
        assert_eq!(abi.compute_alignment(&[], 0), 0);
        assert_eq!(abi.compute_alignment(&[], 1), 8);
    }

    #[test]
    fn six_params_have_two_stack_args() {
        let abi = WindowsX64Abi;
        // 6 params -> 2 stack args; with 0 saved regs, 2 % 2 == 0 -> no pad.
        assert_eq!(abi.compute_alignment(&[VMType::Int32; 6], 0), 0);
    }
}

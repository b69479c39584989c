//! Virtual assembler: hides the four possible operand layouts of a
//! two-virtual-register operation — (reg,reg), (reg,mem), (mem,reg),
//! (mem,mem) — behind a single call, rewriting the (mem,mem) case
//! through the reserved scratch register using one of two policies.
//! Callers pass the raw-encoder function pointers for the three
//! directly-encodable shapes.

use std::collections::HashSet;

use crate::abi::Location;
use crate::buffer::CodeBuffer;
use crate::context::CompilationContext;
use crate::ir::{IrIndex, VMType};
use crate::raw;
use crate::register::{FloatRegister, MemoryOperand, Register};
use crate::regalloc::VReg;

const INT_REGS_BY_INDEX: [Register; 7] =
    [Register::RAX, Register::RCX, Register::RDX, Register::R8, Register::R9, Register::R10, Register::R11];
const FLOAT_REGS_BY_INDEX: [FloatRegister; 5] =
    [FloatRegister::XMM0, FloatRegister::XMM1, FloatRegister::XMM2, FloatRegister::XMM3, FloatRegister::XMM4];

/// Resolves a virtual register to its concrete location, given the
/// allocation result carried by `ctx`.
#[must_use]
pub fn location_of(ctx: &CompilationContext, vreg: VReg) -> Location {
    let alloc = ctx.allocation.as_ref().expect("optimised path only");
    let ty = ctx.vreg_type(vreg);
    match alloc.location(vreg) {
        crate::regalloc::Location::InReg(i) => {
            if ty == VMType::Float32 {
                Location::FloatReg(FLOAT_REGS_BY_INDEX[i as usize])
            } else {
                Location::IntReg(INT_REGS_BY_INDEX[i as usize])
            }
        }
        crate::regalloc::Location::OnStack(slot) => {
            Location::Mem(MemoryOperand::new(Register::RBP, ctx.spill_offset(slot)))
        }
    }
}

/// The set of physical integer registers currently holding a virtual
/// register live across `idx` — used by the optimised generator to push
/// caller-saves around a call.
#[must_use]
pub fn alive_int_registers(ctx: &CompilationContext, idx: IrIndex) -> Vec<Register> {
    let alloc = ctx.allocation.as_ref().expect("optimised path only");
    let mut regs: Vec<Register> = alloc
        .live_across(idx)
        .iter()
        .filter(|v| ctx.vreg_type(**v) == VMType::Int32)
        .filter_map(|v| match alloc.location(*v) {
            crate::regalloc::Location::InReg(i) => Some(INT_REGS_BY_INDEX[i as usize]),
            crate::regalloc::Location::OnStack(_) => None,
        })
        .collect();
    regs.sort_by_key(|r| r.encoding());
    regs.dedup();
    regs
}

/// Same as [`alive_int_registers`] but for the float bank.
#[must_use]
pub fn alive_float_registers(ctx: &CompilationContext, idx: IrIndex) -> HashSet<FloatRegister> {
    let alloc = ctx.allocation.as_ref().expect("optimised path only");
    alloc
        .live_across(idx)
        .iter()
        .filter(|v| ctx.vreg_type(**v) == VMType::Float32)
        .filter_map(|v| match alloc.location(*v) {
            crate::regalloc::Location::InReg(i) => Some(FLOAT_REGS_BY_INDEX[i as usize]),
            crate::regalloc::Location::OnStack(_) => None,
        })
        .collect()
}

/// Rewrite policy for the (mem,mem) case of an integer binary op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// `mov scratch, src; op dst_mem, scratch`.
    MemoryOnLeft,
    /// `mov scratch, dst_mem; op scratch, src_mem; mov dst_mem, scratch`.
    MemoryOnRight,
}

type RegRegOp = fn(&mut CodeBuffer, Register, Register, bool);
type RegMemOp = fn(&mut CodeBuffer, Register, MemoryOperand, bool);
type MemRegOp = fn(&mut CodeBuffer, MemoryOperand, Register, bool);

/// Emits a two-operand integer instruction given `dst`/`src` virtual
/// registers, consulting the allocation and rewriting the (mem,mem)
/// case per `policy`. `R12` is the reserved integer scratch.
pub fn emit_int_binop(ctx: &mut CompilationContext, dst: VReg, src: VReg, policy: Policy, rr: RegRegOp, rm: RegMemOp, mr: MemRegOp) {
    let dst_loc = location_of(ctx, dst);
    let src_loc = location_of(ctx, src);
    let buf = &mut ctx.asm.buffer;
    match (dst_loc, src_loc) {
        (Location::IntReg(d), Location::IntReg(s)) => rr(buf, d, s, true),
        (Location::IntReg(d), Location::Mem(s)) => rm(buf, d, s, true),
        (Location::Mem(d), Location::IntReg(s)) => mr(buf, d, s, true),
        (Location::Mem(d), Location::Mem(s)) => match policy {
            Policy::MemoryOnLeft => {
                raw::mov_rm(buf, Register::R12, s, true);
                mr(buf, d, Register::R12, true);
            }
            Policy::MemoryOnRight => {
                raw::mov_rm(buf, Register::R12, d, true);
                rm(buf, Register::R12, s, true);
                raw::mov_mr(buf, d, Register::R12, true);
            }
        },
        _ => unreachable!("integer binop with a float-typed operand"),
    }
}

type FloatRegRegOp = fn(&mut CodeBuffer, FloatRegister, FloatRegister);
type FloatRegMemOp = fn(&mut CodeBuffer, FloatRegister, MemoryOperand);

/// Emits a two-operand scalar-float instruction. Scalar SSE arithmetic
/// has no memory-destination form at all, so the (mem,mem) case always
/// uses `MemoryOnRight` through `XMM5`, the reserved float scratch.
pub fn emit_float_binop(ctx: &mut CompilationContext, dst: VReg, src: VReg, rr: FloatRegRegOp, rm: FloatRegMemOp) {
    let dst_loc = location_of(ctx, dst);
    let src_loc = location_of(ctx, src);
    let buf = &mut ctx.asm.buffer;
    match (dst_loc, src_loc) {
        (Location::FloatReg(d), Location::FloatReg(s)) => rr(buf, d, s),
        (Location::FloatReg(d), Location::Mem(s)) => rm(buf, d, s),
        (Location::Mem(d), Location::FloatReg(s)) => {
            raw::movss_rm(buf, FloatRegister::XMM5, d);
            rr(buf, FloatRegister::XMM5, s);
            raw::movss_mr(buf, d, FloatRegister::XMM5);
        }
        (Location::Mem(d), Location::Mem(s)) => {
            raw::movss_rm(buf, FloatRegister::XMM5, d);
            rm(buf, FloatRegister::XMM5, s);
            raw::movss_mr(buf, d, FloatRegister::XMM5);
        }
        _ => unreachable!("float binop with an integer-typed operand"),
    }
}

/// Emits a plain move between two virtual register locations,
/// dispatching on whether either side is a spill slot. Used for
/// `LoadLocal`/`StoreLocal`/argument marshalling when neither side needs
/// an arithmetic rewrite.
pub fn emit_move(ctx: &mut CompilationContext, dst: VReg, src: VReg) {
    let dst_loc = location_of(ctx, dst);
    let src_loc = location_of(ctx, src);
    if dst_loc == src_loc {
        return;
    }
    // Looked up before `buf` borrows `ctx.asm.buffer`: the (Mem,Mem) arm
    // below needs to know which scratch register/rewrite to use, and a
    // method call through `ctx` can't happen while `buf` holds a field
    // borrow of it.
    let is_float = ctx.vreg_type(dst) == VMType::Float32;
    let buf = &mut ctx.asm.buffer;
    match (dst_loc, src_loc) {
        (Location::IntReg(d), Location::IntReg(s)) => raw::mov_rr(buf, d, s, true),
        (Location::IntReg(d), Location::Mem(s)) => raw::mov_rm(buf, d, s, true),
        (Location::Mem(d), Location::IntReg(s)) => raw::mov_mr(buf, d, s, true),
        (Location::FloatReg(d), Location::FloatReg(s)) => raw::movss_rr(buf, d, s),
        (Location::FloatReg(d), Location::Mem(s)) => raw::movss_rm(buf, d, s),
        (Location::Mem(d), Location::FloatReg(s)) => raw::movss_mr(buf, d, s),
        (Location::Mem(d), Location::Mem(s)) => {
            if is_float {
                raw::movss_rm(buf, FloatRegister::XMM5, s);
                raw::movss_mr(buf, d, FloatRegister::XMM5);
            } else {
                raw::mov_rm(buf, Register::R12, s, true);
                raw::mov_mr(buf, d, Register::R12, true);
            }
        }
        _ => unreachable!("move between mismatched-type locations"),
    }
}

//! Optimised code generator: lowers IR through the virtual-register
//! allocator and emits directly into the locations
//! [`crate::regalloc::allocate`] chose, using the virtual assembler to
//! hide the four operand-layout cases of every two-operand instruction.

use std::collections::HashMap;

use crate::abi::{Location, WindowsX64Abi, SHADOW_SPACE};
use crate::binder::{Binder, CallTarget};
use crate::codegen::virtual_asm::{
    alive_float_registers, alive_int_registers, emit_float_binop, emit_int_binop, emit_move, location_of, Policy,
};
use crate::context::{align_to_16, CallMode, CompilationContext, PendingBranch, PendingCall};
use crate::error::Result;
use crate::facade::{FloatOperand, IntOperand, Relation, StackOperand};
use crate::ir::{Function, Instruction, VMType};
use crate::raw;
use crate::regalloc::{self, VReg, VirtualInstruction};
use crate::register::{FloatRegister, MemoryOperand, Register};

/// Compiles `function` with the optimised pipeline.
///
/// # Errors
/// Propagates any [`crate::error::JitError`] raised while emitting an
/// instruction.
pub fn compile(function: &Function, binder: &dyn Binder) -> Result<CompilationContext> {
    let vf = regalloc::lower(function);
    let alloc = regalloc::allocate(&vf, &function.instructions);

    let mut ctx = CompilationContext::new(
        function.definition.name.clone(),
        function.definition.params.len(),
        function.locals.len(),
    );
    ctx.virtual_function = Some(vf);
    ctx.allocation = Some(alloc);
    let abi = WindowsX64Abi;

    let spill_count = ctx.allocation.as_ref().expect("just set").spill_count();
    let has_any_spill = ctx.allocation.as_ref().expect("just set").has_any_spill();
    let has_div = function.instructions.iter().any(|i| matches!(i, Instruction::DivInt));
    ctx.scratch_pushed = has_any_spill || has_div;

    let frame_size = align_to_16(8 * (function.definition.params.len() + spill_count) as u32);
    ctx.stack_frame_size = frame_size;

    ctx.asm.push(StackOperand::Int(Register::RBP));
    ctx.asm.mov(IntOperand::Reg(Register::RBP), IntOperand::Reg(Register::RSP), false)?;
    if ctx.scratch_pushed {
        ctx.asm.push(StackOperand::Int(Register::R12));
    }
    if frame_size > 0 {
        ctx.asm.sub_imm(IntOperand::Reg(Register::RSP), frame_size as i32, false);
    }

    abi.move_arguments_to_home_slots(&mut ctx, &function.definition.params);

    let param_vregs = ctx.virtual_function.as_ref().expect("just set").param_vregs.clone();
    for (i, &pv) in param_vregs.iter().enumerate() {
        let home = MemoryOperand::new(Register::RBP, ctx.home_slot_offset(i));
        let dst = location_of(&ctx, pv);
        if dst != Location::Mem(home) {
            move_home_to_location(&mut ctx, dst, function.definition.params[i], home);
        }
    }

    let local_vregs = ctx.virtual_function.as_ref().expect("just set").local_vregs.clone();
    for (i, &lv) in local_vregs.iter().enumerate() {
        let loc = location_of(&ctx, lv);
        zero_location(&mut ctx, loc, function.locals[i]);
    }

    let instructions = ctx.virtual_function.as_ref().expect("just set").instructions.clone();
    for (idx, vi) in instructions.iter().enumerate() {
        ctx.record_instruction_offset(idx);
        lower_one(&mut ctx, function, idx, vi, binder, &abi)?;
    }

    Ok(ctx)
}

/// Moves an incoming argument from its ABI home slot into the register
/// or spill slot the allocator actually gave it, when that differs.
fn move_home_to_location(ctx: &mut CompilationContext, dst: Location, ty: VMType, home: MemoryOperand) {
    match (ty, dst) {
        (VMType::Float32, Location::FloatReg(r)) => {
            ctx.asm.mov_float(FloatOperand::Reg(r), FloatOperand::Mem(home)).unwrap();
        }
        (VMType::Float32, Location::Mem(m)) => {
            ctx.asm.mov_float(FloatOperand::Reg(FloatRegister::XMM5), FloatOperand::Mem(home)).unwrap();
            ctx.asm.mov_float(FloatOperand::Mem(m), FloatOperand::Reg(FloatRegister::XMM5)).unwrap();
        }
        (_, Location::IntReg(r)) => {
            ctx.asm.mov(IntOperand::Reg(r), IntOperand::Mem(home), true).unwrap();
        }
        (_, Location::Mem(m)) => {
            ctx.asm.mov(IntOperand::Reg(Register::R12), IntOperand::Mem(home), true).unwrap();
            ctx.asm.mov(IntOperand::Mem(m), IntOperand::Reg(Register::R12), true).unwrap();
        }
        (VMType::Float32, Location::IntReg(_)) | (VMType::Int32 | VMType::Void, Location::FloatReg(_)) => {
            unreachable!("type/location mismatch copying an argument home")
        }
    }
}

/// Zeroes a local's allocated location. Writes the immediate directly
/// when the location is memory (no scratch register needed); synthesises
/// a float zero through the `push 0 / movss [rsp]` pattern otherwise,
/// the same stack-relay trick float literal loads use.
fn zero_location(ctx: &mut CompilationContext, loc: Location, ty: VMType) {
    match (loc, ty) {
        (Location::IntReg(r), _) => {
            ctx.asm.xor(IntOperand::Reg(r), IntOperand::Reg(r), true).unwrap();
        }
        (Location::Mem(m), VMType::Float32) => {
            raw::push_i(&mut ctx.asm.buffer, 0);
            raw::movss_rm(&mut ctx.asm.buffer, FloatRegister::XMM5, MemoryOperand::at(Register::RSP));
            raw::add_ri(&mut ctx.asm.buffer, Register::RSP, 8, false);
            ctx.asm.mov_float(FloatOperand::Mem(m), FloatOperand::Reg(FloatRegister::XMM5)).unwrap();
        }
        (Location::Mem(m), _) => {
            ctx.asm.mov_imm(IntOperand::Mem(m), 0, true);
        }
        (Location::FloatReg(r), _) => {
            raw::push_i(&mut ctx.asm.buffer, 0);
            raw::movss_rm(&mut ctx.asm.buffer, r, MemoryOperand::at(Register::RSP));
            raw::add_ri(&mut ctx.asm.buffer, Register::RSP, 8, false);
        }
    }
}

fn relation_for(instr: &Instruction) -> Relation {
    match instr {
        Instruction::BranchEqual(_) => Relation::Equal,
        Instruction::BranchNotEqual(_) => Relation::NotEqual,
        Instruction::BranchGreater(_) => Relation::Greater,
        Instruction::BranchGreaterOrEqual(_) => Relation::GreaterOrEqual,
        Instruction::BranchLess(_) => Relation::Less,
        Instruction::BranchLessOrEqual(_) => Relation::LessOrEqual,
        _ => unreachable!("relation_for called on a non-branch instruction"),
    }
}

fn emit_float_cmp(ctx: &mut CompilationContext, a: VReg, b: VReg) {
    let a_loc = location_of(ctx, a);
    let b_loc = location_of(ctx, b);
    match a_loc {
        Location::FloatReg(r) => ctx.asm.cmp_float(r, b_loc.as_float_operand()),
        Location::Mem(m) => {
            ctx.asm.mov_float(FloatOperand::Reg(FloatRegister::XMM5), FloatOperand::Mem(m)).unwrap();
            ctx.asm.cmp_float(FloatRegister::XMM5, b_loc.as_float_operand());
        }
        Location::IntReg(_) => unreachable!("float compare with an integer-typed operand"),
    }
}

/// `imul` has no memory-destination form at all, so unlike the other
/// integer binops this always goes through [`Policy::MemoryOnRight`] by
/// hand when the destination is a spill slot.
fn lower_mul_int(ctx: &mut CompilationContext, a: VReg, b: VReg, assign: VReg) {
    let a_loc = location_of(ctx, a);
    let b_loc = location_of(ctx, b);
    match a_loc {
        Location::IntReg(d) => {
            ctx.asm.mul(d, b_loc.as_int_operand(), true);
            if assign != a {
                emit_move(ctx, assign, a);
            }
        }
        Location::Mem(m) => {
            ctx.asm.mov(IntOperand::Reg(Register::R12), IntOperand::Mem(m), true).unwrap();
            ctx.asm.mul(Register::R12, b_loc.as_int_operand(), true);
            ctx.asm.mov(IntOperand::Mem(m), IntOperand::Reg(Register::R12), true).unwrap();
            let assign_loc = location_of(ctx, assign);
            if assign_loc != Location::Mem(m) {
                ctx.asm.mov(assign_loc.as_int_operand(), IntOperand::Mem(m), true).unwrap();
            }
        }
        Location::FloatReg(_) => unreachable!("MulInt with a float-typed operand"),
    }
}

/// `idiv` always divides `RAX`/`RDX` and writes its quotient to `RAX`.
/// Saves `RAX`/`RDX` around the division when they hold a value other
/// than `a`/`b` themselves, and relocates `b` away from `RAX`/`RDX`
/// before `a` is moved into `RAX` so a divisor that happens to already
/// sit in one of those registers isn't clobbered.
fn lower_div_int(ctx: &mut CompilationContext, a: VReg, b: VReg, assign: VReg) {
    let a_loc = location_of(ctx, a);
    let b_loc = location_of(ctx, b);

    let rax_holds_operand = a_loc == Location::IntReg(Register::RAX) || b_loc == Location::IntReg(Register::RAX);
    let rdx_holds_operand = a_loc == Location::IntReg(Register::RDX) || b_loc == Location::IntReg(Register::RDX);
    let save_rax = !rax_holds_operand;
    let save_rdx = !rdx_holds_operand;

    if save_rax {
        ctx.asm.push(StackOperand::Int(Register::RAX));
    }
    if save_rdx {
        ctx.asm.push(StackOperand::Int(Register::RDX));
    }

    let divisor = match b_loc {
        Location::IntReg(Register::RAX) | Location::IntReg(Register::RDX) => {
            ctx.asm.mov(IntOperand::Reg(Register::R12), b_loc.as_int_operand(), true).unwrap();
            IntOperand::Reg(Register::R12)
        }
        other => other.as_int_operand(),
    };

    if a_loc != Location::IntReg(Register::RAX) {
        ctx.asm.mov(IntOperand::Reg(Register::RAX), a_loc.as_int_operand(), true).unwrap();
    }
    ctx.asm.div(divisor, true, Register::RAX).unwrap();

    let assign_loc = location_of(ctx, assign);
    if assign_loc != Location::IntReg(Register::RAX) {
        ctx.asm.mov(assign_loc.as_int_operand(), IntOperand::Reg(Register::RAX), true).unwrap();
    }

    if save_rdx {
        if assign_loc == Location::IntReg(Register::RDX) {
            ctx.asm.pop(None);
        } else {
            ctx.asm.pop(Some(StackOperand::Int(Register::RDX)));
        }
    }
    if save_rax {
        if assign_loc == Location::IntReg(Register::RAX) {
            ctx.asm.pop(None);
        } else {
            ctx.asm.pop(Some(StackOperand::Int(Register::RAX)));
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn lower_call(
    ctx: &mut CompilationContext,
    idx: usize,
    name: &str,
    param_types: &[VMType],
    return_type: VMType,
    uses: &[VReg],
    assign: Option<VReg>,
    binder: &dyn Binder,
    abi: &WindowsX64Abi,
) -> Result<()> {
    let alive_ints = alive_int_registers(ctx, idx);
    let mut alive_floats: Vec<FloatRegister> = alive_float_registers(ctx, idx).into_iter().collect();
    alive_floats.sort_by_key(|r| r.encoding());

    for &r in &alive_ints {
        ctx.asm.push(StackOperand::Int(r));
    }
    for &x in &alive_floats {
        ctx.asm.push(StackOperand::Float(x));
    }

    let mut stack_distance: HashMap<Register, i32> = HashMap::new();
    let mut float_stack_distance: HashMap<FloatRegister, i32> = HashMap::new();
    let mut offset = 0i32;
    for &x in alive_floats.iter().rev() {
        float_stack_distance.insert(x, offset);
        offset += 8;
    }
    for &r in alive_ints.iter().rev() {
        stack_distance.insert(r, offset);
        offset += 8;
    }

    let num_saved = alive_ints.len() + alive_floats.len() + usize::from(ctx.scratch_pushed);
    let alignment = abi.compute_alignment(param_types, num_saved);
    let extra = alignment + SHADOW_SPACE;
    if extra != 0 {
        ctx.asm.sub_imm(IntOperand::Reg(Register::RSP), extra, false);
    }

    let arg_locations: Vec<Location> = uses
        .iter()
        .map(|&v| {
            let loc = location_of(ctx, v);
            match loc {
                Location::IntReg(r) if stack_distance.contains_key(&r) => {
                    Location::Mem(MemoryOperand::new(Register::RSP, stack_distance[&r] + extra))
                }
                Location::FloatReg(x) if float_stack_distance.contains_key(&x) => {
                    Location::Mem(MemoryOperand::new(Register::RSP, float_stack_distance[&x] + extra))
                }
                other => other,
            }
        })
        .collect();

    abi.marshal_call_arguments(ctx, param_types, &arg_locations);

    match binder.resolve(name, param_types)? {
        CallTarget::Managed => {
            let site = ctx.asm.call_relative();
            ctx.unresolved_calls.push(PendingCall { site_offset: site, callee_name: name.to_string(), mode: CallMode::Relative });
        }
        CallTarget::Native(_) => {
            let site = ctx.asm.offset();
            ctx.asm.call_absolute(Register::RAX, 0);
            ctx.unresolved_calls.push(PendingCall { site_offset: site, callee_name: name.to_string(), mode: CallMode::Absolute });
        }
    }

    if extra != 0 {
        ctx.asm.add_imm(IntOperand::Reg(Register::RSP), extra, false);
    }

    if let Some(assign) = assign {
        let dest = location_of(ctx, assign);
        abi.consume_return_value(ctx, return_type, dest);
    }

    for &x in alive_floats.iter().rev() {
        ctx.asm.pop(Some(StackOperand::Float(x)));
    }
    for &r in alive_ints.iter().rev() {
        ctx.asm.pop(Some(StackOperand::Int(r)));
    }

    Ok(())
}

#[allow(clippy::too_many_lines)]
fn lower_one(
    ctx: &mut CompilationContext,
    function: &Function,
    idx: usize,
    vi: &VirtualInstruction,
    binder: &dyn Binder,
    abi: &WindowsX64Abi,
) -> Result<()> {
    match &vi.ir {
        Instruction::Pop => {}
        Instruction::LoadInt(v) => {
            let assign = vi.assign.expect("LoadInt always assigns");
            match location_of(ctx, assign) {
                Location::IntReg(r) => ctx.asm.mov_imm(IntOperand::Reg(r), *v, true),
                Location::Mem(m) => ctx.asm.mov_imm(IntOperand::Mem(m), *v, true),
                Location::FloatReg(_) => unreachable!(),
            }
        }
        Instruction::LoadFloat(v) => {
            let assign = vi.assign.expect("LoadFloat always assigns");
            let bits = v.to_bits() as i32;
            raw::push_i(&mut ctx.asm.buffer, bits);
            match location_of(ctx, assign) {
                Location::FloatReg(r) => {
                    raw::movss_rm(&mut ctx.asm.buffer, r, MemoryOperand::at(Register::RSP));
                }
                Location::Mem(m) => {
                    raw::movss_rm(&mut ctx.asm.buffer, FloatRegister::XMM5, MemoryOperand::at(Register::RSP));
                    ctx.asm.mov_float(FloatOperand::Mem(m), FloatOperand::Reg(FloatRegister::XMM5)).unwrap();
                }
                Location::IntReg(_) => unreachable!(),
            }
            raw::add_ri(&mut ctx.asm.buffer, Register::RSP, 8, false);
        }
        Instruction::LoadLocal(_) | Instruction::StoreLocal(_) | Instruction::LoadArgument(_) => {
            emit_move(ctx, vi.assign.expect("always assigns"), vi.uses[0]);
        }
        Instruction::AddInt | Instruction::SubInt => {
            let (a, b) = (vi.uses[0], vi.uses[1]);
            let assign = vi.assign.expect("always assigns");
            match vi.ir {
                Instruction::AddInt => emit_int_binop(ctx, a, b, Policy::MemoryOnLeft, raw::add_rr, raw::add_rm, raw::add_mr),
                Instruction::SubInt => emit_int_binop(ctx, a, b, Policy::MemoryOnLeft, raw::sub_rr, raw::sub_rm, raw::sub_mr),
                _ => unreachable!(),
            }
            if assign != a {
                emit_move(ctx, assign, a);
            }
        }
        Instruction::MulInt => {
            let (a, b) = (vi.uses[0], vi.uses[1]);
            lower_mul_int(ctx, a, b, vi.assign.expect("always assigns"));
        }
        Instruction::DivInt => {
            let (a, b) = (vi.uses[0], vi.uses[1]);
            lower_div_int(ctx, a, b, vi.assign.expect("always assigns"));
        }
        Instruction::AddFloat | Instruction::SubFloat | Instruction::MulFloat | Instruction::DivFloat => {
            let (a, b) = (vi.uses[0], vi.uses[1]);
            let assign = vi.assign.expect("always assigns");
            match vi.ir {
                Instruction::AddFloat => emit_float_binop(ctx, a, b, raw::addss_rr, raw::addss_rm),
                Instruction::SubFloat => emit_float_binop(ctx, a, b, raw::subss_rr, raw::subss_rm),
                Instruction::MulFloat => emit_float_binop(ctx, a, b, raw::mulss_rr, raw::mulss_rm),
                Instruction::DivFloat => emit_float_binop(ctx, a, b, raw::divss_rr, raw::divss_rm),
                _ => unreachable!(),
            }
            if assign != a {
                emit_move(ctx, assign, a);
            }
        }
        Instruction::Call { name, param_types, return_type } => {
            lower_call(ctx, idx, name, param_types, *return_type, &vi.uses, vi.assign, binder, abi)?;
        }
        Instruction::Ret => {
            if function.definition.return_type != VMType::Void {
                let loc = location_of(ctx, vi.uses[0]);
                abi.emit_return_value(ctx, function.definition.return_type, loc);
            }
            ctx.asm.mov(IntOperand::Reg(Register::RSP), IntOperand::Reg(Register::RBP), false)?;
            if ctx.scratch_pushed {
                ctx.asm.sub_imm(IntOperand::Reg(Register::RSP), 8, false);
                ctx.asm.pop(Some(StackOperand::Int(Register::R12)));
            }
            ctx.asm.pop(Some(StackOperand::Int(Register::RBP)));
            ctx.asm.ret();
        }
        Instruction::Branch(target) => {
            let site = ctx.asm.jump();
            ctx.unresolved_branches
                .insert(site, PendingBranch { target_ir_index: *target, instruction_size: raw::JMP_INSTRUCTION_WIDTH });
        }
        Instruction::BranchEqual(target)
        | Instruction::BranchNotEqual(target)
        | Instruction::BranchGreater(target)
        | Instruction::BranchGreaterOrEqual(target)
        | Instruction::BranchLess(target)
        | Instruction::BranchLessOrEqual(target) => {
            let (a, b) = (vi.uses[0], vi.uses[1]);
            let relation = relation_for(&vi.ir);
            let is_float = ctx.vreg_type(a) == VMType::Float32;
            let site = if is_float {
                emit_float_cmp(ctx, a, b);
                ctx.asm.jump_if(relation, true)
            } else {
                emit_int_binop(ctx, a, b, Policy::MemoryOnLeft, raw::cmp_rr, raw::cmp_rm, raw::cmp_mr);
                ctx.asm.jump_if(relation, false)
            };
            ctx.unresolved_branches
                .insert(site, PendingBranch { target_ir_index: *target, instruction_size: raw::JCC_INSTRUCTION_WIDTH });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::StaticBinder;
    use crate::ir::FunctionDefinition;

    #[test]
    fn simple_add_compiles() {
        let function = Function::with_inferred_operand_stack(
            FunctionDefinition { name: "add".into(), params: vec![], return_type: VMType::Int32 },
            vec![Instruction::LoadInt(2), Instruction::LoadInt(3), Instruction::AddInt, Instruction::Ret],
            vec![],
            true,
        );
        let binder = StaticBinder::new();
        let ctx = compile(&function, &binder).unwrap();
        assert_eq!(ctx.instruction_mapping.len(), 4);
        assert!(!ctx.scratch_pushed, "no spills or division, R12 shouldn't be reserved");
    }

    #[test]
    fn division_reserves_the_scratch_register() {
        let function = Function::with_inferred_operand_stack(
            FunctionDefinition { name: "div".into(), params: vec![VMType::Int32, VMType::Int32], return_type: VMType::Int32 },
            vec![Instruction::LoadArgument(0), Instruction::LoadArgument(1), Instruction::DivInt, Instruction::Ret],
            vec![],
            true,
        );
        let binder = StaticBinder::new();
        let ctx = compile(&function, &binder).unwrap();
        assert!(ctx.scratch_pushed);
    }

    #[test]
    fn managed_call_leaves_a_pending_relative_patch() {
        let function = Function::with_inferred_operand_stack(
            FunctionDefinition { name: "caller".into(), params: vec![], return_type: VMType::Int32 },
            vec![
                Instruction::LoadInt(1),
                Instruction::Call { name: "callee".into(), param_types: vec![VMType::Int32], return_type: VMType::Int32 },
                Instruction::Ret,
            ],
            vec![],
            true,
        );
        let mut binder = StaticBinder::new();
        binder.register_managed("callee");
        let ctx = compile(&function, &binder).unwrap();
        assert_eq!(ctx.unresolved_calls.len(), 1);
        assert_eq!(ctx.unresolved_calls[0].mode, CallMode::Relative);
    }

    #[test]
    fn heavy_register_pressure_spills_and_still_compiles() {
        let mut instrs = Vec::new();
        for i in 0..10 {
            instrs.push(Instruction::LoadInt(i));
        }
        for _ in 0..9 {
            instrs.push(Instruction::AddInt);
        }
        instrs.push(Instruction::Ret);
        let function = Function::with_inferred_operand_stack(
            FunctionDefinition { name: "sum10".into(), params: vec![], return_type: VMType::Int32 },
            instrs,
            vec![],
            true,
        );
        let binder = StaticBinder::new();
        let ctx = compile(&function, &binder).unwrap();
        assert!(ctx.scratch_pushed);
        assert!(ctx.asm.offset() > 0);
    }
}

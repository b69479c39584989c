//! Naïve code generator: lowers IR one instruction at a
//! time using an explicit operand stack materialised in stack slots
//! below the locals region. No virtual registers, no allocation — every
//! operation round-trips its operands through memory via a handful of
//! fixed scratch registers (`RAX`/`RCX` for integers, `XMM0`/`XMM1` for
//! floats).

use crate::abi::WindowsX64Abi;
use crate::binder::{Binder, CallTarget};
use crate::context::{align_to_16, CallMode, CompilationContext, PendingBranch, PendingCall};
use crate::error::Result;
use crate::facade::{IntOperand, FloatOperand, Relation, StackOperand};
use crate::ir::{Function, Instruction, VMType};
use crate::raw;
use crate::register::{FloatRegister, MemoryOperand, Register};

/// Compiles `function` with the naïve pipeline, returning the populated
/// context (bytes, instruction mapping, and unresolved patch sites).
///
/// # Errors
/// Propagates any [`crate::error::JitError`] raised while emitting an
/// instruction (e.g. an unresolved call name, though that is only
/// detected later at `make_executable` time for managed callees — this
/// only fails for a binder lookup error on a native callee).
pub fn compile(function: &Function, binder: &dyn Binder) -> Result<CompilationContext> {
    let mut ctx = CompilationContext::new(
        function.definition.name.clone(),
        function.definition.params.len(),
        function.locals.len(),
    );
    let abi = WindowsX64Abi;

    let frame_size = align_to_16(
        8 * (function.definition.params.len() + function.locals.len() + function.operand_stack_size as usize) as u32,
    );
    ctx.stack_frame_size = frame_size;

    ctx.asm.push(StackOperand::Int(Register::RBP));
    ctx.asm.mov(IntOperand::Reg(Register::RBP), IntOperand::Reg(Register::RSP), false)?;
    if frame_size > 0 {
        ctx.asm.sub_imm(IntOperand::Reg(Register::RSP), frame_size as i32, false);
    }

    abi.move_arguments_to_home_slots(&mut ctx, &function.definition.params);

    ctx.asm.xor(IntOperand::Reg(Register::RAX), IntOperand::Reg(Register::RAX), false)?;
    for i in 0..function.locals.len() {
        let slot = MemoryOperand::new(Register::RBP, ctx.local_offset(i));
        ctx.asm.mov(IntOperand::Mem(slot), IntOperand::Reg(Register::RAX), false)?;
    }

    for (idx, instr) in function.instructions.iter().enumerate() {
        ctx.record_instruction_offset(idx);
        lower_one(&mut ctx, function, idx, instr, binder, &abi)?;
    }

    Ok(ctx)
}

fn push_int(ctx: &mut CompilationContext, imm: i32) {
    let depth = ctx.push_slot();
    let mem = MemoryOperand::new(Register::RBP, ctx.operand_slot_offset(depth));
    ctx.asm.mov_imm(IntOperand::Mem(mem), imm, true);
}

fn push_register_int(ctx: &mut CompilationContext, reg: Register) -> Result<()> {
    let depth = ctx.push_slot();
    let mem = MemoryOperand::new(Register::RBP, ctx.operand_slot_offset(depth));
    ctx.asm.mov(IntOperand::Mem(mem), IntOperand::Reg(reg), true)
}

fn push_register_float(ctx: &mut CompilationContext, xmm: FloatRegister) -> Result<()> {
    let depth = ctx.push_slot();
    let mem = MemoryOperand::new(Register::RBP, ctx.operand_slot_offset(depth));
    ctx.asm.mov_float(FloatOperand::Mem(mem), FloatOperand::Reg(xmm))
}

fn pop_register_int(ctx: &mut CompilationContext, reg: Register) -> Result<()> {
    let depth = ctx.pop_slot();
    let mem = MemoryOperand::new(Register::RBP, ctx.operand_slot_offset(depth));
    ctx.asm.mov(IntOperand::Reg(reg), IntOperand::Mem(mem), true)
}

fn pop_register_float(ctx: &mut CompilationContext, xmm: FloatRegister) -> Result<()> {
    let depth = ctx.pop_slot();
    let mem = MemoryOperand::new(Register::RBP, ctx.operand_slot_offset(depth));
    ctx.asm.mov_float(FloatOperand::Reg(xmm), FloatOperand::Mem(mem))
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

#[allow(clippy::too_many_lines)]
fn lower_one(
    ctx: &mut CompilationContext,
    function: &Function,
    idx: usize,
    instr: &Instruction,
    binder: &dyn Binder,
    abi: &WindowsX64Abi,
) -> Result<()> {
    match instr {
        Instruction::Pop => {
            ctx.pop_slot();
        }
        Instruction::LoadInt(v) => push_int(ctx, *v),
        Instruction::LoadFloat(v) => push_int(ctx, v.to_bits() as i32),
        Instruction::LoadLocal(i) => {
            let slot = MemoryOperand::new(Register::RBP, ctx.local_offset(*i));
            match function.locals[*i] {
                VMType::Float32 => {
                    ctx.asm.mov_float(FloatOperand::Reg(FloatRegister::XMM0), FloatOperand::Mem(slot))?;
                    push_register_float(ctx, FloatRegister::XMM0)?;
                }
                VMType::Int32 | VMType::Void => {
                    ctx.asm.mov(IntOperand::Reg(Register::RAX), IntOperand::Mem(slot), true)?;
                    push_register_int(ctx, Register::RAX)?;
                }
            }
        }
        Instruction::StoreLocal(i) => {
            let slot = MemoryOperand::new(Register::RBP, ctx.local_offset(*i));
            match function.locals[*i] {
                VMType::Float32 => {
                    pop_register_float(ctx, FloatRegister::XMM0)?;
                    ctx.asm.mov_float(FloatOperand::Mem(slot), FloatOperand::Reg(FloatRegister::XMM0))?;
                }
                VMType::Int32 | VMType::Void => {
                    pop_register_int(ctx, Register::RAX)?;
                    ctx.asm.mov(IntOperand::Mem(slot), IntOperand::Reg(Register::RAX), true)?;
                }
            }
        }
        Instruction::LoadArgument(i) => {
            let slot = MemoryOperand::new(Register::RBP, ctx.home_slot_offset(*i));
            match function.definition.params[*i] {
                VMType::Float32 => {
                    ctx.asm.mov_float(FloatOperand::Reg(FloatRegister::XMM0), FloatOperand::Mem(slot))?;
                    push_register_float(ctx, FloatRegister::XMM0)?;
                }
                VMType::Int32 | VMType::Void => {
                    ctx.asm.mov(IntOperand::Reg(Register::RAX), IntOperand::Mem(slot), true)?;
                    push_register_int(ctx, Register::RAX)?;
                }
            }
        }
        Instruction::AddInt | Instruction::SubInt | Instruction::MulInt | Instruction::DivInt => {
            pop_register_int(ctx, Register::RCX)?;
            pop_register_int(ctx, Register::RAX)?;
            match instr {
                Instruction::AddInt => ctx.asm.add(IntOperand::Reg(Register::RAX), IntOperand::Reg(Register::RCX), true)?,
                Instruction::SubInt => ctx.asm.sub(IntOperand::Reg(Register::RAX), IntOperand::Reg(Register::RCX), true)?,
                Instruction::MulInt => ctx.asm.mul(Register::RAX, IntOperand::Reg(Register::RCX), true),
                Instruction::DivInt => ctx.asm.div(IntOperand::Reg(Register::RCX), true, Register::RAX)?,
                _ => unreachable!(),
            }
            push_register_int(ctx, Register::RAX)?;
        }
        Instruction::AddFloat | Instruction::SubFloat | Instruction::MulFloat | Instruction::DivFloat => {
            pop_register_float(ctx, FloatRegister::XMM1)?;
            pop_register_float(ctx, FloatRegister::XMM0)?;
            match instr {
                Instruction::AddFloat => {
                    ctx.asm.add_float(FloatOperand::Reg(FloatRegister::XMM0), FloatOperand::Reg(FloatRegister::XMM1))?
                }
                Instruction::SubFloat => {
                    ctx.asm.sub_float(FloatOperand::Reg(FloatRegister::XMM0), FloatOperand::Reg(FloatRegister::XMM1))?
                }
                Instruction::MulFloat => {
                    ctx.asm.mul_float(FloatOperand::Reg(FloatRegister::XMM0), FloatOperand::Reg(FloatRegister::XMM1))?
                }
                Instruction::DivFloat => {
                    ctx.asm.div_float(FloatOperand::Reg(FloatRegister::XMM0), FloatOperand::Reg(FloatRegister::XMM1))?
                }
                _ => unreachable!(),
            }
            push_register_float(ctx, FloatRegister::XMM0)?;
        }
        Instruction::Call { name, param_types, return_type } => {
            lower_call(ctx, name, param_types, *return_type, binder, abi)?;
        }
        Instruction::Ret => {
            if function.definition.return_type != VMType::Void {
                match function.definition.return_type {
                    VMType::Float32 => pop_register_float(ctx, FloatRegister::XMM0)?,
                    VMType::Int32 | VMType::Void => pop_register_int(ctx, Register::RAX)?,
                }
            }
            ctx.asm.mov(IntOperand::Reg(Register::RSP), IntOperand::Reg(Register::RBP), false)?;
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
            let operand_types = &function.operand_type_stack[idx];
            let is_float = operand_types[operand_types.len() - 1] == VMType::Float32;
            let relation = relation_for(instr);
            let site = if is_float {
                pop_register_float(ctx, FloatRegister::XMM1)?;
                pop_register_float(ctx, FloatRegister::XMM0)?;
                ctx.asm.cmp_float(FloatRegister::XMM0, FloatOperand::Reg(FloatRegister::XMM1));
                ctx.asm.jump_if(relation, true)
            } else {
                pop_register_int(ctx, Register::RCX)?;
                pop_register_int(ctx, Register::RAX)?;
                ctx.asm.cmp(IntOperand::Reg(Register::RAX), IntOperand::Reg(Register::RCX), true)?;
                ctx.asm.jump_if(relation, false)
            };
            ctx.unresolved_branches
                .insert(site, PendingBranch { target_ir_index: *target, instruction_size: raw::JCC_INSTRUCTION_WIDTH });
        }
    }
    Ok(())
}

fn lower_call(
    ctx: &mut CompilationContext,
    name: &str,
    param_types: &[VMType],
    return_type: VMType,
    binder: &dyn Binder,
    abi: &WindowsX64Abi,
) -> Result<()> {
    use crate::abi::Location;

    let base_depth = ctx.operand_stack_cursor - param_types.len() as i32;
    let arg_locations: Vec<Location> = (0..param_types.len())
        .map(|i| Location::Mem(MemoryOperand::new(Register::RBP, ctx.operand_slot_offset(base_depth + i as i32))))
        .collect();
    ctx.operand_stack_cursor = base_depth;

    let alignment = abi.compute_alignment(param_types, 0);
    if alignment != 0 {
        ctx.asm.sub_imm(IntOperand::Reg(Register::RSP), alignment, false);
    }
    ctx.asm.sub_imm(IntOperand::Reg(Register::RSP), crate::abi::SHADOW_SPACE, false);

    abi.marshal_call_arguments(ctx, param_types, &arg_locations);

    match binder.resolve(name, param_types)? {
        CallTarget::Managed => {
            let site = ctx.asm.call_relative();
            ctx.unresolved_calls.push(PendingCall { site_offset: site, callee_name: name.to_string(), mode: CallMode::Relative });
        }
        CallTarget::Native(_) => {
            // The real address is re-resolved and patched into the imm64
            // at `crate::driver::JitDriver::make_executable` time, not
            // embedded here, so both pipelines go through the same
            // deferred-patch path as managed calls.
            let site = ctx.asm.offset();
            ctx.asm.call_absolute(Register::RAX, 0);
            ctx.unresolved_calls.push(PendingCall { site_offset: site, callee_name: name.to_string(), mode: CallMode::Absolute });
        }
    }

    ctx.asm.add_imm(IntOperand::Reg(Register::RSP), crate::abi::SHADOW_SPACE, false);
    if alignment != 0 {
        ctx.asm.add_imm(IntOperand::Reg(Register::RSP), alignment, false);
    }

    if return_type != VMType::Void {
        match return_type {
            VMType::Float32 => push_register_float(ctx, FloatRegister::XMM0)?,
            VMType::Int32 | VMType::Void => push_register_int(ctx, Register::RAX)?,
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
    fn simple_add_compiles_with_a_monotonic_instruction_mapping() {
        let function = Function::with_inferred_operand_stack(
            FunctionDefinition { name: "add".into(), params: vec![], return_type: VMType::Int32 },
            vec![Instruction::LoadInt(2), Instruction::LoadInt(3), Instruction::AddInt, Instruction::Ret],
            vec![],
            false,
        );
        let binder = StaticBinder::new();
        let ctx = compile(&function, &binder).unwrap();
        assert_eq!(ctx.instruction_mapping.len(), 4);
        assert!(ctx.instruction_mapping.windows(2).all(|w| w[0] <= w[1]));
        assert!(ctx.instruction_mapping[0] > 0, "prologue must precede IR[0]");
    }

    #[test]
    fn branch_leaves_a_pending_patch() {
        let function = Function::with_inferred_operand_stack(
            FunctionDefinition { name: "jmp".into(), params: vec![], return_type: VMType::Void },
            vec![Instruction::Branch(1), Instruction::Ret],
            vec![],
            false,
        );
        let binder = StaticBinder::new();
        let ctx = compile(&function, &binder).unwrap();
        assert_eq!(ctx.unresolved_branches.len(), 1);
    }
}

//! IR-to-virtual-register lowering and a linear-scan allocator.
//!
//! [`crate::codegen::optimized`] only ever consumes a read-only
//! [`AllocationResult`]; this module is the producer behind that
//! boundary — a minimal, textbook linear scan, built so the optimised
//! generator has a real allocator to run against rather than a mock.
//! No coalescing, no spill-cost heuristics beyond "spill whichever
//! active range ends furthest in the future".

use std::collections::{HashMap, HashSet};

use crate::ir::{Function, Instruction, IrIndex, VMType};

/// An SSA-like name for a value, resolved by [`AllocationResult`] to
/// either a physical register or a spill slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(pub usize);

/// One instruction of the virtual-register IR: an [`Instruction`]
/// augmented with an optional destination and an ordered list of
/// operand virtual registers.
#[derive(Debug, Clone)]
pub struct VirtualInstruction {
    /// The original IR instruction (opcode and any immediate payload).
    pub ir: Instruction,
    /// Destination virtual register, if this instruction produces one.
    pub assign: Option<VReg>,
    /// Operand virtual registers consumed, in the stack-pop order the
    /// original instruction dictates (e.g. for `SubInt`, `[a, b]`
    /// meaning `a - b`).
    pub uses: Vec<VReg>,
}

/// A function lowered to virtual-register form.
#[derive(Debug, Clone)]
pub struct VirtualFunction {
    /// One virtual instruction per IR instruction, in IR order.
    pub instructions: Vec<VirtualInstruction>,
    /// The type of every virtual register, indexed by `VReg.0`.
    pub types: Vec<VMType>,
    /// The persistent virtual register backing each local, indexed by
    /// local index.
    pub local_vregs: Vec<VReg>,
    /// The persistent virtual register backing each parameter, indexed
    /// by parameter index.
    pub param_vregs: Vec<VReg>,
}

impl VirtualFunction {
    /// Total number of virtual registers.
    #[must_use]
    pub fn num_vregs(&self) -> usize {
        self.types.len()
    }
}

/// Lowers a function's IR into virtual-register form. Locals and
/// parameters each get one persistent virtual register (read by
/// `LoadLocal`/`LoadArgument` through a plain move, written by
/// `StoreLocal`); every other IR instruction that produces a stack value
/// gets a fresh one.
#[must_use]
pub fn lower(function: &Function) -> VirtualFunction {
    let mut types: Vec<VMType> = Vec::new();
    let mut alloc_vreg = |ty: VMType, types: &mut Vec<VMType>| -> VReg {
        let id = types.len();
        types.push(ty);
        VReg(id)
    };

    let local_vregs: Vec<VReg> = function.locals.iter().map(|&ty| alloc_vreg(ty, &mut types)).collect();
    let param_vregs: Vec<VReg> = function
        .definition
        .params
        .iter()
        .map(|&ty| alloc_vreg(ty, &mut types))
        .collect();

    let mut stack: Vec<VReg> = Vec::new();
    let mut instructions = Vec::with_capacity(function.instructions.len());

    for instr in &function.instructions {
        let vi = match instr {
            Instruction::Pop => {
                let v = stack.pop().expect("operand stack underflow");
                VirtualInstruction { ir: instr.clone(), assign: None, uses: vec![v] }
            }
            Instruction::LoadInt(_) => {
                let v = alloc_vreg(VMType::Int32, &mut types);
                stack.push(v);
                VirtualInstruction { ir: instr.clone(), assign: Some(v), uses: vec![] }
            }
            Instruction::LoadFloat(_) => {
                let v = alloc_vreg(VMType::Float32, &mut types);
                stack.push(v);
                VirtualInstruction { ir: instr.clone(), assign: Some(v), uses: vec![] }
            }
            Instruction::LoadLocal(i) => {
                let local = local_vregs[*i];
                let v = alloc_vreg(types[local.0], &mut types);
                stack.push(v);
                VirtualInstruction { ir: instr.clone(), assign: Some(v), uses: vec![local] }
            }
            Instruction::StoreLocal(i) => {
                let src = stack.pop().expect("operand stack underflow");
                VirtualInstruction { ir: instr.clone(), assign: Some(local_vregs[*i]), uses: vec![src] }
            }
            Instruction::LoadArgument(i) => {
                let param = param_vregs[*i];
                let v = alloc_vreg(types[param.0], &mut types);
                stack.push(v);
                VirtualInstruction { ir: instr.clone(), assign: Some(v), uses: vec![param] }
            }
            Instruction::AddInt | Instruction::SubInt | Instruction::MulInt | Instruction::DivInt => {
                let b = stack.pop().expect("operand stack underflow");
                let a = stack.pop().expect("operand stack underflow");
                let v = alloc_vreg(VMType::Int32, &mut types);
                stack.push(v);
                VirtualInstruction { ir: instr.clone(), assign: Some(v), uses: vec![a, b] }
            }
            Instruction::AddFloat | Instruction::SubFloat | Instruction::MulFloat | Instruction::DivFloat => {
                let b = stack.pop().expect("operand stack underflow");
                let a = stack.pop().expect("operand stack underflow");
                let v = alloc_vreg(VMType::Float32, &mut types);
                stack.push(v);
                VirtualInstruction { ir: instr.clone(), assign: Some(v), uses: vec![a, b] }
            }
            Instruction::Call { param_types, return_type, .. } => {
                let mut args = Vec::with_capacity(param_types.len());
                for _ in param_types {
                    args.push(stack.pop().expect("operand stack underflow"));
                }
                args.reverse();
                let assign = if *return_type != VMType::Void {
                    let v = alloc_vreg(*return_type, &mut types);
                    stack.push(v);
                    Some(v)
                } else {
                    None
                };
                VirtualInstruction { ir: instr.clone(), assign, uses: args }
            }
            Instruction::Ret => {
                let uses = match stack.pop() {
                    Some(v) => vec![v],
                    None => vec![],
                };
                VirtualInstruction { ir: instr.clone(), assign: None, uses }
            }
            Instruction::Branch(_) => VirtualInstruction { ir: instr.clone(), assign: None, uses: vec![] },
            Instruction::BranchEqual(_)
            | Instruction::BranchNotEqual(_)
            | Instruction::BranchGreater(_)
            | Instruction::BranchGreaterOrEqual(_)
            | Instruction::BranchLess(_)
            | Instruction::BranchLessOrEqual(_) => {
                let b = stack.pop().expect("operand stack underflow");
                let a = stack.pop().expect("operand stack underflow");
                VirtualInstruction { ir: instr.clone(), assign: None, uses: vec![a, b] }
            }
        };
        instructions.push(vi);
    }

    VirtualFunction { instructions, types, local_vregs, param_vregs }
}

fn successors(instructions: &[Instruction], idx: IrIndex) -> Vec<IrIndex> {
    let instr = &instructions[idx];
    if matches!(instr, Instruction::Ret) {
        return vec![];
    }
    if let Some(target) = instr.branch_target() {
        if instr.is_conditional_branch() {
            let mut succs = vec![target];
            if idx + 1 < instructions.len() {
                succs.push(idx + 1);
            }
            succs
        } else {
            vec![target]
        }
    } else if idx + 1 < instructions.len() {
        vec![idx + 1]
    } else {
        vec![]
    }
}

/// Computes, for every IR index, the set of virtual registers live
/// *across* it: a standard iterative
/// backward dataflow over the instruction CFG (fallthrough plus branch
/// targets), sound for the straight-line and simple-loop programs this
/// back end's own generator produces.
#[must_use]
pub fn compute_liveness(vf: &VirtualFunction, raw_instructions: &[Instruction]) -> Vec<HashSet<VReg>> {
    let n = vf.instructions.len();
    let mut live_in = vec![HashSet::new(); n];
    let mut live_out = vec![HashSet::new(); n];

    let mut changed = true;
    while changed {
        changed = false;
        for idx in (0..n).rev() {
            let vi = &vf.instructions[idx];
            let mut new_out: HashSet<VReg> = HashSet::new();
            for succ in successors(raw_instructions, idx) {
                new_out.extend(live_in[succ].iter().copied());
            }
            let mut new_in: HashSet<VReg> = vi.uses.iter().copied().collect();
            for v in &new_out {
                if Some(*v) != vi.assign {
                    new_in.insert(*v);
                }
            }
            if new_in != live_in[idx] {
                live_in[idx] = new_in;
                changed = true;
            }
            if new_out != live_out[idx] {
                live_out[idx] = new_out;
                changed = true;
            }
        }
    }
    live_out
}

/// Where the allocator placed a virtual register: either a physical
/// register bank index, or a frame spill slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Integer index `0..=6` (RAX,RCX,RDX,R8,R9,R10,R11) or float index
    /// `0..=4` (XMM0-XMM4).
    InReg(u8),
    /// An 8-byte frame slot below locals/params.
    OnStack(usize),
}

const INT_BANK_SIZE: u8 = 7;
const FLOAT_BANK_SIZE: u8 = 5;

/// The read-only result of register allocation: where
/// each virtual register lives, plus the liveness query used to spill
/// caller-saves around calls.
#[derive(Debug, Clone)]
pub struct AllocationResult {
    locations: HashMap<VReg, Location>,
    live_across: Vec<HashSet<VReg>>,
    spill_count: usize,
}

impl AllocationResult {
    /// Where `vreg` was placed.
    #[must_use]
    pub fn location(&self, vreg: VReg) -> Location {
        self.locations[&vreg]
    }

    /// The virtual registers live across IR index `idx`.
    #[must_use]
    pub fn live_across(&self, idx: IrIndex) -> &HashSet<VReg> {
        &self.live_across[idx]
    }

    /// `true` if any virtual register of either bank was spilled —
    /// drives the "reserve R12/XMM5 scratch whenever a spill exists"
    /// invariant.
    #[must_use]
    pub fn has_any_spill(&self) -> bool {
        self.spill_count > 0
    }

    /// Number of 8-byte spill slots used.
    #[must_use]
    pub fn spill_count(&self) -> usize {
        self.spill_count
    }
}

#[derive(Clone, Copy)]
struct Range {
    vreg: VReg,
    start: usize,
    end: usize,
}

fn live_ranges(vf: &VirtualFunction) -> Vec<Range> {
    let mut start = vec![usize::MAX; vf.num_vregs()];
    let mut end = vec![0usize; vf.num_vregs()];
    // Locals and parameters are live from function entry.
    for v in vf.local_vregs.iter().chain(vf.param_vregs.iter()) {
        start[v.0] = 0;
    }
    for (idx, vi) in vf.instructions.iter().enumerate() {
        if let Some(v) = vi.assign {
            start[v.0] = start[v.0].min(idx);
            end[v.0] = end[v.0].max(idx);
        }
        for u in &vi.uses {
            start[u.0] = start[u.0].min(idx);
            end[u.0] = end[u.0].max(idx);
        }
    }
    (0..vf.num_vregs())
        .filter(|&i| start[i] != usize::MAX)
        .map(|i| Range { vreg: VReg(i), start: start[i], end: end[i] })
        .collect()
}

/// Runs linear-scan register allocation over a lowered function.
#[must_use]
pub fn allocate(vf: &VirtualFunction, raw_instructions: &[Instruction]) -> AllocationResult {
    let live_across = compute_liveness(vf, raw_instructions);

    let mut ranges = live_ranges(vf);
    ranges.sort_by_key(|r| r.start);

    let mut locations: HashMap<VReg, Location> = HashMap::new();
    let mut spill_count = 0usize;

    let mut int_active: Vec<Range> = Vec::new();
    let mut float_active: Vec<Range> = Vec::new();
    let mut int_free: Vec<u8> = (0..INT_BANK_SIZE).rev().collect();
    let mut float_free: Vec<u8> = (0..FLOAT_BANK_SIZE).rev().collect();

    for r in ranges {
        let is_float = vf.types[r.vreg.0] == VMType::Float32;
        let (active, free) = if is_float {
            (&mut float_active, &mut float_free)
        } else {
            (&mut int_active, &mut int_free)
        };

        active.retain(|a| {
            if a.end < r.start {
                if let Some(Location::InReg(reg)) = locations.get(&a.vreg) {
                    free.push(*reg);
                }
                false
            } else {
                true
            }
        });

        if let Some(reg) = free.pop() {
            locations.insert(r.vreg, Location::InReg(reg));
            active.push(r);
        } else {
            // Spill whichever active range ends furthest in the future,
            // if that is later than the current one; otherwise spill
            // the current range itself.
            let victim_pos = active
                .iter()
                .enumerate()
                .max_by_key(|(_, a)| a.end)
                .map(|(i, _)| i);
            match victim_pos {
                Some(pos) if active[pos].end > r.end => {
                    let victim = active.remove(pos);
                    let reg = match locations.remove(&victim.vreg) {
                        Some(Location::InReg(reg)) => reg,
                        _ => unreachable!("active range must hold a register"),
                    };
                    locations.insert(victim.vreg, Location::OnStack(spill_count));
                    spill_count += 1;
                    locations.insert(r.vreg, Location::InReg(reg));
                    active.push(r);
                }
                _ => {
                    locations.insert(r.vreg, Location::OnStack(spill_count));
                    spill_count += 1;
                }
            }
        }
    }

    AllocationResult { locations, live_across, spill_count }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::FunctionDefinition;

    fn add_function() -> Function {
        Function::with_inferred_operand_stack(
            FunctionDefinition { name: "add".into(), params: vec![], return_type: VMType::Int32 },
            vec![Instruction::LoadInt(2), Instruction::LoadInt(3), Instruction::AddInt, Instruction::Ret],
            vec![],
            true,
        )
    }

    #[test]
    fn lowering_produces_one_virtual_instruction_per_ir_instruction() {
        let f = add_function();
        let vf = lower(&f);
        assert_eq!(vf.instructions.len(), f.instructions.len());
        assert_eq!(vf.instructions[2].uses.len(), 2);
    }

    #[test]
    fn small_function_allocates_without_spilling() {
        let f = add_function();
        let vf = lower(&f);
        let alloc = allocate(&vf, &f.instructions);
        assert!(!alloc.has_any_spill());
    }

    #[test]
    fn spilling_kicks_in_with_more_live_values_than_registers() {
        let mut instrs = Vec::new();
        for i in 0..10 {
            instrs.push(Instruction::LoadInt(i));
        }
        for _ in 0..9 {
            instrs.push(Instruction::AddInt);
        }
        instrs.push(Instruction::Ret);
        let f = Function::with_inferred_operand_stack(
            FunctionDefinition { name: "sum10".into(), params: vec![], return_type: VMType::Int32 },
            instrs,
            vec![],
            true,
        );
        let vf = lower(&f);
        let alloc = allocate(&vf, &f.instructions);
        assert!(alloc.has_any_spill());
    }
}

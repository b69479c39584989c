//! Per-function compilation scratch shared by both code generators.

use std::collections::HashMap;

use crate::facade::Assembler;
use crate::ir::{IrIndex, VMType};
use crate::regalloc::{AllocationResult, VirtualFunction};

/// Where a pending call site expects its target address to come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// Managed callee: displacement patched once every function has an
    /// entry point.
    Relative,
    /// Native callee: absolute address patched in after a
    /// `mov rax,imm64` prefix.
    Absolute,
}

/// An unresolved intra-function branch, recorded at the byte offset of
/// its placeholder displacement field.
#[derive(Debug, Clone, Copy)]
pub struct PendingBranch {
    /// IR index the branch targets.
    pub target_ir_index: IrIndex,
    /// Total width, in bytes, of the jump instruction (5 for `jmp`, 6
    /// for `Jcc`) — the displacement is relative to the byte *after*
    /// this many bytes from the site.
    pub instruction_size: usize,
}

/// An unresolved inter-function call site.
#[derive(Debug, Clone)]
pub struct PendingCall {
    /// Byte offset, within the function's buffer, of the call site
    /// (the first byte of the `call`/`mov` sequence).
    pub site_offset: usize,
    /// Name of the callee, resolved through the binder.
    pub callee_name: String,
    /// How the target address reaches the call site.
    pub mode: CallMode,
}

/// Per-function scratch threaded through the naïve and optimised code
/// generators alike.
pub struct CompilationContext {
    /// Name of the function being compiled (for diagnostics).
    pub function_name: String,
    /// The typed assembler bytes are emitted through.
    pub asm: Assembler,
    /// IR index -> byte offset, one entry per IR instruction,
    /// monotonically non-decreasing.
    pub instruction_mapping: Vec<u32>,
    /// Unresolved branches, keyed by the byte offset of their
    /// placeholder displacement field.
    pub unresolved_branches: HashMap<usize, PendingBranch>,
    /// Unresolved call sites, in emission order.
    pub unresolved_calls: Vec<PendingCall>,
    /// Total stack frame size in bytes (16-byte aligned).
    pub stack_frame_size: u32,
    /// Next free operand-stack slot offset below locals, in bytes
    /// (naïve path only — unused by the optimised path).
    pub operand_stack_cursor: i32,
    /// Number of declared parameters (needed to compute home-slot and
    /// spill-slot offsets uniformly).
    pub params_count: usize,
    /// Number of declared locals.
    pub locals_count: usize,
    /// Virtual instructions, local/param virtual registers (optimised
    /// path only).
    pub virtual_function: Option<VirtualFunction>,
    /// Allocation result consumed from the external allocator
    /// (optimised path only).
    pub allocation: Option<AllocationResult>,
    /// `true` once the optimised prologue has pushed R12 as a guarded
    /// scratch register, so the epilogue knows to pop it back before
    /// `ret`.
    pub scratch_pushed: bool,
}

impl CompilationContext {
    /// Starts a fresh context for `function_name`.
    #[must_use]
    pub fn new(function_name: String, params_count: usize, locals_count: usize) -> CompilationContext {
        CompilationContext {
            function_name,
            asm: Assembler::new(),
            instruction_mapping: Vec::new(),
            unresolved_branches: HashMap::new(),
            unresolved_calls: Vec::new(),
            stack_frame_size: 0,
            operand_stack_cursor: 0,
            params_count,
            locals_count,
            virtual_function: None,
            allocation: None,
            scratch_pushed: false,
        }
    }

    /// Allocates the next free naïve operand-stack slot and returns its
    /// depth (the value to pass to [`CompilationContext::operand_slot_offset`]).
    pub fn push_slot(&mut self) -> i32 {
        let depth = self.operand_stack_cursor;
        self.operand_stack_cursor += 1;
        depth
    }

    /// Releases the top naïve operand-stack slot and returns its depth.
    pub fn pop_slot(&mut self) -> i32 {
        self.operand_stack_cursor -= 1;
        self.operand_stack_cursor
    }

    /// Extra displacement every frame slot is pushed down by when the
    /// optimised prologue has reserved `R12` as a scratch register: the
    /// saved `R12` occupies `[rbp-8]`, so every home/spill slot must
    /// start at `[rbp-16]` instead, or slot 0 would alias the saved
    /// register.
    fn scratch_shift(&self) -> i32 {
        if self.scratch_pushed {
            8
        } else {
            0
        }
    }

    /// Byte offset of the home slot for parameter `index`:
    /// `[rbp - 8*(1+index)]`, shifted down another 8 bytes when `R12` is
    /// saved in the prologue.
    #[must_use]
    pub fn home_slot_offset(&self, index: usize) -> i32 {
        -8 * (1 + index as i32) - self.scratch_shift()
    }

    /// Byte offset of local `index`'s frame slot:
    /// `[rbp - 8*(1+params+index)]`, shifted the same way as
    /// [`CompilationContext::home_slot_offset`].
    #[must_use]
    pub fn local_offset(&self, index: usize) -> i32 {
        -8 * (1 + self.params_count as i32 + index as i32) - self.scratch_shift()
    }

    /// Byte offset of spill slot `slot`: `[rbp - 8*(1+params+spill_slot)]`.
    /// The optimised path has no separate frame region for locals — a
    /// local is just another virtual register and is spilled into this
    /// same region when the allocator puts it on the stack, which is why
    /// the optimised prologue's frame-size formula has no locals term.
    #[must_use]
    pub fn spill_offset(&self, slot: usize) -> i32 {
        -8 * (1 + self.params_count as i32 + slot as i32) - self.scratch_shift()
    }

    /// Byte offset of the naïve path's per-instruction operand-stack slot
    /// at depth `depth` (0-based from the bottom), immediately below the
    /// locals region: `[rbp - 8*(1+params+locals+depth)]`.
    #[must_use]
    pub fn operand_slot_offset(&self, depth: i32) -> i32 {
        -8 * (1 + self.params_count as i32 + self.locals_count as i32 + depth) - self.scratch_shift()
    }

    /// Records the current byte offset as the mapping entry for IR
    /// index `ir_index`.
    pub fn record_instruction_offset(&mut self, ir_index: IrIndex) {
        debug_assert_eq!(ir_index, self.instruction_mapping.len());
        self.instruction_mapping.push(self.asm.offset() as u32);
    }

    /// Returns the type of a virtual register, looked up from the
    /// lowered virtual function (optimised path only).
    #[must_use]
    pub fn vreg_type(&self, vreg: crate::regalloc::VReg) -> VMType {
        self.virtual_function.as_ref().expect("optimised path only")[vreg]
    }
}

/// Rounds `bytes` up to the next multiple of 16, used by both code
/// generators' frame-size formulas.
#[must_use]
pub fn align_to_16(bytes: u32) -> u32 {
    (bytes + 15) / 16 * 16
}

impl std::ops::Index<crate::regalloc::VReg> for VirtualFunction {
    type Output = VMType;

    fn index(&self, vreg: crate::regalloc::VReg) -> &VMType {
        &self.types[vreg.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_slots_dont_move_when_no_scratch_register_is_saved() {
        let ctx = CompilationContext::new("f".into(), 2, 1);
        assert_eq!(ctx.home_slot_offset(0), -8);
        assert_eq!(ctx.local_offset(0), -24);
        assert_eq!(ctx.spill_offset(0), -24);
    }

    #[test]
    fn frame_slots_shift_below_the_saved_scratch_register() {
        let mut ctx = CompilationContext::new("f".into(), 2, 1);
        ctx.scratch_pushed = true;
        // R12 is saved at [rbp-8]; every frame slot must start at
        // [rbp-16] or later so none of them alias it.
        assert_eq!(ctx.home_slot_offset(0), -16);
        assert_eq!(ctx.local_offset(0), -32);
        assert_eq!(ctx.spill_offset(0), -32);
        assert_eq!(ctx.operand_slot_offset(0), -40);
    }
}

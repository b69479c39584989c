//! JIT driver: compiles functions into pre-allocated executable memory,
//! then patches every branch and call displacement in a single
//! finalisation pass before flipping the whole arena executable.

use std::collections::HashMap;

use crate::binder::{Binder, CallTarget};
use crate::codegen::{naive, optimized};
use crate::context::{CallMode, CompilationContext, PendingBranch, PendingCall};
use crate::error::{JitError, Result};
use crate::ir::Function;
use crate::memory::ExecutableMemory;
use crate::raw;

/// Lifecycle state of a [`JitDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Accepting [`JitDriver::compile`] calls.
    Compiling,
    /// [`JitDriver::make_executable`] has committed; the driver now only
    /// serves [`JitDriver::entry_point`] lookups and [`JitDriver::release`].
    Finalising,
    /// [`JitDriver::release`] has run; every allocation has been freed.
    Terminated,
}

struct CompiledFunction {
    entry_point: *mut u8,
    bytes: Vec<u8>,
    instruction_mapping: Vec<u32>,
    unresolved_branches: HashMap<usize, PendingBranch>,
    unresolved_calls: Vec<PendingCall>,
}

fn patch_i32(bytes: &mut [u8], offset: usize, value: i32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn patch_i64(bytes: &mut [u8], offset: usize, value: i64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn patch_branches(func: &mut CompiledFunction) {
    let patches: Vec<(usize, PendingBranch)> = func.unresolved_branches.iter().map(|(&s, b)| (s, *b)).collect();
    for (site, branch) in patches {
        let target = i64::from(func.instruction_mapping[branch.target_ir_index]);
        let disp = target - (site as i64 + branch.instruction_size as i64);
        patch_i32(&mut func.bytes, site + branch.instruction_size - 4, disp as i32);
    }
}

fn patch_calls<B: Binder>(func: &mut CompiledFunction, entry_points: &HashMap<String, usize>, binder: &B) -> Result<()> {
    for call in func.unresolved_calls.clone() {
        match call.mode {
            CallMode::Relative => {
                let target = *entry_points
                    .get(&call.callee_name)
                    .ok_or_else(|| JitError::UnresolvedSymbol { name: call.callee_name.clone() })?;
                let disp = target as i64 - (func.entry_point as i64 + call.site_offset as i64 + raw::CALL_REL_INSTRUCTION_WIDTH as i64);
                patch_i32(&mut func.bytes, call.site_offset + 1, disp as i32);
            }
            CallMode::Absolute => {
                let target = match binder.resolve(&call.callee_name, &[])? {
                    CallTarget::Native(addr) => addr,
                    CallTarget::Managed => *entry_points
                        .get(&call.callee_name)
                        .ok_or_else(|| JitError::UnresolvedSymbol { name: call.callee_name.clone() })?,
                };
                patch_i64(&mut func.bytes, call.site_offset + 2, target as i64);
            }
        }
    }
    Ok(())
}

/// Owns every compiled function's executable memory and drives the
/// two-phase compile-then-patch pipeline.
pub struct JitDriver<B: Binder> {
    binder: B,
    memory: ExecutableMemory,
    compiled: HashMap<String, CompiledFunction>,
    entry_points: HashMap<String, usize>,
    state: DriverState,
}

impl<B: Binder> JitDriver<B> {
    /// Starts a fresh driver over `binder`.
    #[must_use]
    pub fn new(binder: B) -> JitDriver<B> {
        JitDriver {
            binder,
            memory: ExecutableMemory::new(),
            compiled: HashMap::new(),
            entry_points: HashMap::new(),
            state: DriverState::Compiling,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Compiles `function` with the pipeline its `optimise` flag selects,
    /// allocating its executable-memory region immediately (writable
    /// until [`JitDriver::make_executable`] runs).
    ///
    /// # Errors
    /// Returns [`JitError::InternalEncoderInvariant`] if the driver isn't
    /// in [`DriverState::Compiling`]; otherwise propagates whatever error
    /// the selected code generator raised (`compile` fails with
    /// `UnsupportedOpCode` or `InvalidFunction`).
    pub fn compile(&mut self, function: &Function) -> Result<()> {
        if self.state != DriverState::Compiling {
            return Err(JitError::InternalEncoderInvariant {
                location: "driver::compile",
                detail: format!("cannot compile {:?} while driver is {:?}", function.definition.name, self.state),
            });
        }

        let ctx: CompilationContext =
            if function.optimise { optimized::compile(function, &self.binder)? } else { naive::compile(function, &self.binder)? };

        let bytes = ctx.asm.buffer.into_bytes();
        let entry_point = self.memory.allocate(bytes.len().max(1))?;
        self.entry_points.insert(function.definition.name.clone(), entry_point as usize);
        self.compiled.insert(
            function.definition.name.clone(),
            CompiledFunction {
                entry_point,
                bytes,
                instruction_mapping: ctx.instruction_mapping,
                unresolved_branches: ctx.unresolved_branches,
                unresolved_calls: ctx.unresolved_calls,
            },
        );
        Ok(())
    }

    /// Patches every branch and call displacement, copies the patched
    /// bytes into their pre-allocated regions, and flips every
    /// allocation to executable.
    ///
    /// Only advances to [`DriverState::Finalising`] once every phase
    /// succeeds: a failure here leaves the driver in
    /// [`DriverState::Compiling`], so callers may fix the cause (compile
    /// the missing managed function, register the missing native symbol)
    /// and call `make_executable` again, or call [`JitDriver::release`]
    /// to abandon all work.
    ///
    /// # Errors
    /// Returns [`JitError::UnresolvedSymbol`] if a call site's callee
    /// never resolved to a known entry point, or
    /// [`JitError::MemoryProtectionFailed`] if the OS refuses the
    /// permission change.
    pub fn make_executable(&mut self) -> Result<()> {
        if self.state != DriverState::Compiling {
            return Err(JitError::InternalEncoderInvariant {
                location: "driver::make_executable",
                detail: format!("cannot finalise while driver is {:?}", self.state),
            });
        }

        for func in self.compiled.values_mut() {
            patch_branches(func);
        }
        for func in self.compiled.values_mut() {
            patch_calls(func, &self.entry_points, &self.binder)?;
        }
        for func in self.compiled.values() {
            // SAFETY: `entry_point` was allocated by `self.memory` with at
            // least `bytes.len()` writable bytes and is still writable —
            // `make_executable` on the memory manager hasn't run yet.
            unsafe {
                std::ptr::copy_nonoverlapping(func.bytes.as_ptr(), func.entry_point, func.bytes.len());
            }
        }
        self.memory.make_executable()?;
        self.state = DriverState::Finalising;
        Ok(())
    }

    /// The entry point of a compiled function, once [`JitDriver::make_executable`]
    /// has succeeded (or, before that, its not-yet-executable address).
    #[must_use]
    pub fn entry_point(&self, name: &str) -> Option<*const u8> {
        self.entry_points.get(name).map(|&a| a as *const u8)
    }

    /// Frees every allocation and terminates the driver. Idempotent.
    pub fn release(&mut self) {
        self.memory.release();
        self.state = DriverState::Terminated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::StaticBinder;
    use crate::ir::{FunctionDefinition, Instruction, VMType};

    fn leaf(name: &str, value: i32) -> Function {
        Function::with_inferred_operand_stack(
            FunctionDefinition { name: name.into(), params: vec![], return_type: VMType::Int32 },
            vec![Instruction::LoadInt(value), Instruction::Ret],
            vec![],
            false,
        )
    }

    #[test]
    fn single_function_with_no_calls_finalises() {
        let mut driver = JitDriver::new(StaticBinder::new());
        driver.compile(&leaf("answer", 42)).unwrap();
        driver.make_executable().unwrap();
        assert_eq!(driver.state(), DriverState::Finalising);
        assert!(driver.entry_point("answer").is_some());
    }

    #[test]
    fn missing_managed_callee_rolls_back_and_is_retryable() {
        let mut binder = StaticBinder::new();
        binder.register_managed("helper");
        let mut driver = JitDriver::new(binder);

        let caller = Function::with_inferred_operand_stack(
            FunctionDefinition { name: "main".into(), params: vec![], return_type: VMType::Int32 },
            vec![
                Instruction::Call { name: "helper".into(), param_types: vec![], return_type: VMType::Int32 },
                Instruction::Ret,
            ],
            vec![],
            false,
        );
        driver.compile(&caller).unwrap();

        // "helper" was registered as managed but never actually compiled:
        // its entry point is unknown, so finalisation must fail and leave
        // the driver retryable.
        assert!(driver.make_executable().is_err());
        assert_eq!(driver.state(), DriverState::Compiling);

        driver.compile(&leaf("helper", 7)).unwrap();
        driver.make_executable().unwrap();
        assert_eq!(driver.state(), DriverState::Finalising);
    }

    #[test]
    fn release_frees_and_terminates() {
        let mut driver = JitDriver::new(StaticBinder::new());
        driver.compile(&leaf("x", 1)).unwrap();
        driver.make_executable().unwrap();
        driver.release();
        assert_eq!(driver.state(), DriverState::Terminated);
    }

    /// `displacement = target_byte - (site + instruction_width)`, read
    /// back little-endian from the patched buffer.
    #[test]
    fn relative_call_displacement_matches_the_patch_formula() {
        let mut binder = StaticBinder::new();
        binder.register_managed("callee");
        let mut driver = JitDriver::new(binder);

        let callee = leaf("callee", 99);
        let caller = Function::with_inferred_operand_stack(
            FunctionDefinition { name: "caller".into(), params: vec![], return_type: VMType::Int32 },
            vec![
                Instruction::Call { name: "callee".into(), param_types: vec![], return_type: VMType::Int32 },
                Instruction::Ret,
            ],
            vec![],
            false,
        );
        driver.compile(&callee).unwrap();
        driver.compile(&caller).unwrap();
        driver.make_executable().unwrap();

        let func = &driver.compiled["caller"];
        assert_eq!(func.unresolved_calls.len(), 1);
        let call = &func.unresolved_calls[0];
        let target = driver.entry_points["callee"];
        let expected_disp =
            target as i64 - (func.entry_point as i64 + call.site_offset as i64 + raw::CALL_REL_INSTRUCTION_WIDTH as i64);

        let bytes = &func.bytes[call.site_offset + 1..call.site_offset + 5];
        let actual_disp = i32::from_le_bytes(bytes.try_into().unwrap());
        assert_eq!(i64::from(actual_disp), expected_disp);
    }
}

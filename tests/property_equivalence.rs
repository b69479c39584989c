//! Property-based equivalence test: random, well-typed integer-arithmetic
//! programs must compile under both the naïve and the optimised pipeline
//! and, where the host can execute the result, return identical values.
//!
//! The generator below only ever produces a left-to-right fold of integer
//! literals through `Add`/`Sub`/`Mul` — no division (to avoid exercising
//! divide-by-zero, whose behaviour belongs to the caller, not this crate)
//! and no branches (so every generated program is well-typed by
//! construction: the operand stack never exceeds depth one). Real callers
//! only ever hand this back end well-typed programs, so this is a
//! deliberately narrowed subset of the instruction set rather than
//! arbitrary byte soup.

use proptest::prelude::*;
use winjit::binder::StaticBinder;
use winjit::driver::JitDriver;
use winjit::ir::{Function, FunctionDefinition, Instruction, VMType};

#[derive(Debug, Clone, Copy)]
enum Op {
    Add,
    Sub,
    Mul,
}

fn op_strategy() -> impl Strategy<Item = Op> {
    prop_oneof![Just(Op::Add), Just(Op::Sub), Just(Op::Mul)]
}

fn build_instructions(first: i32, rest: &[(Op, i32)]) -> Vec<Instruction> {
    let mut instructions = vec![Instruction::LoadInt(first)];
    for &(op, value) in rest {
        instructions.push(Instruction::LoadInt(value));
        instructions.push(match op {
            Op::Add => Instruction::AddInt,
            Op::Sub => Instruction::SubInt,
            Op::Mul => Instruction::MulInt,
        });
    }
    instructions.push(Instruction::Ret);
    instructions
}

fn chain_function(instructions: Vec<Instruction>, optimise: bool) -> Function {
    Function::with_inferred_operand_stack(
        FunctionDefinition { name: "chain".into(), params: vec![], return_type: VMType::Int32 },
        instructions,
        vec![],
        optimise,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Every random chain compiles and finalises under both pipelines on
    /// any host, whether or not the result can actually be called.
    #[test]
    fn naive_and_optimised_both_compile(
        first in -1000i32..1000,
        rest in prop::collection::vec((op_strategy(), -1000i32..1000), 0..24),
    ) {
        let instructions = build_instructions(first, &rest);
        prop_assert!(instructions.len() <= 50);

        for optimise in [false, true] {
            let function = chain_function(instructions.clone(), optimise);
            let mut driver = JitDriver::new(StaticBinder::new());
            prop_assert!(driver.compile(&function).is_ok());
            prop_assert!(driver.make_executable().is_ok());
            prop_assert!(driver.entry_point("chain").is_some());
        }
    }
}

/// Actually running the generated code through both pipelines and
/// comparing results only works where the allocation is truly made
/// executable, which is Windows-only (see `src/memory.rs`).
#[cfg(windows)]
mod windows_execution {
    use super::*;

    fn run(instructions: Vec<Instruction>, optimise: bool) -> i32 {
        let function = chain_function(instructions, optimise);
        let mut driver = JitDriver::new(StaticBinder::new());
        driver.compile(&function).unwrap();
        driver.make_executable().unwrap();
        let entry = driver.entry_point("chain").unwrap();
        let f: extern "win64" fn() -> i32 = unsafe { std::mem::transmute(entry) };
        f()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn naive_and_optimised_agree_on_every_chain(
            first in -1000i32..1000,
            rest in prop::collection::vec((op_strategy(), -1000i32..1000), 0..24),
        ) {
            let instructions = build_instructions(first, &rest);
            let naive_result = run(instructions.clone(), false);
            let optimised_result = run(instructions, true);
            prop_assert_eq!(naive_result, optimised_result);
        }
    }
}

//! End-to-end scenario tests: whole IR programs compiled through
//! [`JitDriver`] and, where the host can actually execute the generated
//! code, invoked and checked against the expected return value.
//!
//! Generated machine code is only ever made truly executable on Windows
//! (`src/memory.rs`'s non-Windows branch is a heap stand-in that never
//! flips page protection) so the calls into compiled code live in a
//! `#[cfg(windows)]` module; the structural checks below it — that every
//! scenario compiles and finalises without error — run on every host.

use winjit::binder::StaticBinder;
use winjit::driver::JitDriver;
use winjit::ir::{Function, FunctionDefinition, Instruction, VMType};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn def(name: &str, params: Vec<VMType>, return_type: VMType) -> FunctionDefinition {
    FunctionDefinition { name: name.into(), params, return_type }
}

/// Scenario 1: `LoadInt 2; LoadInt 3; AddInt; Ret` -> 5.
fn scenario_1() -> Function {
    Function::with_inferred_operand_stack(
        def("add_consts", vec![], VMType::Int32),
        vec![Instruction::LoadInt(2), Instruction::LoadInt(3), Instruction::AddInt, Instruction::Ret],
        vec![],
        false,
    )
}

/// Scenario 2: `LoadArgument 0; LoadArgument 1; MulInt; Ret`, (6,7) -> 42.
fn scenario_2() -> Function {
    Function::with_inferred_operand_stack(
        def("mul_args", vec![VMType::Int32, VMType::Int32], VMType::Int32),
        vec![Instruction::LoadArgument(0), Instruction::LoadArgument(1), Instruction::MulInt, Instruction::Ret],
        vec![],
        false,
    )
}

/// Scenario 3: divide-or-default-to-minus-one, guarded by a conditional
/// branch on the divisor (instruction indices written out explicitly
/// since branch targets are IR indices, not byte offsets):
///
/// ```text
/// 0: LoadArgument 0
/// 1: LoadInt 0
/// 2: BranchEqual 7
/// 3: LoadArgument 0
/// 4: LoadArgument 1
/// 5: DivInt
/// 6: Ret
/// 7: LoadInt -1
/// 8: Ret
/// ```
fn scenario_3() -> Function {
    Function::with_inferred_operand_stack(
        def("div_or_default", vec![VMType::Int32, VMType::Int32], VMType::Int32),
        vec![
            Instruction::LoadArgument(0),
            Instruction::LoadInt(0),
            Instruction::BranchEqual(7),
            Instruction::LoadArgument(0),
            Instruction::LoadArgument(1),
            Instruction::DivInt,
            Instruction::Ret,
            Instruction::LoadInt(-1),
            Instruction::Ret,
        ],
        vec![],
        false,
    )
}

/// Scenario 4: recursive Fibonacci via `Call`, exercising self-recursive
/// managed-call resolution:
///
/// ```text
///  0: LoadArgument 0
///  1: LoadInt 2
///  2: BranchLess 13        ; if n < 2, jump to the base case
///  3: LoadArgument 0
///  4: LoadInt 1
///  5: SubInt                ; n - 1
///  6: Call fib(n-1)
///  7: LoadArgument 0
///  8: LoadInt 2
///  9: SubInt                ; n - 2
/// 10: Call fib(n-2)
/// 11: AddInt
/// 12: Ret
/// 13: LoadArgument 0        ; base case: return n
/// 14: Ret
/// ```
fn scenario_4(optimise: bool) -> Function {
    let call_fib = || Instruction::Call {
        name: "fib".into(),
        param_types: vec![VMType::Int32],
        return_type: VMType::Int32,
    };
    Function::with_inferred_operand_stack(
        def("fib", vec![VMType::Int32], VMType::Int32),
        vec![
            Instruction::LoadArgument(0),
            Instruction::LoadInt(2),
            Instruction::BranchLess(13),
            Instruction::LoadArgument(0),
            Instruction::LoadInt(1),
            Instruction::SubInt,
            call_fib(),
            Instruction::LoadArgument(0),
            Instruction::LoadInt(2),
            Instruction::SubInt,
            call_fib(),
            Instruction::AddInt,
            Instruction::Ret,
            Instruction::LoadArgument(0),
            Instruction::Ret,
        ],
        vec![],
        optimise,
    )
}

/// Scenario 5: `LoadFloat 1.5; LoadFloat 2.5; AddFloat; Ret` -> 4.0.
fn scenario_5() -> Function {
    Function::with_inferred_operand_stack(
        def("add_floats", vec![], VMType::Float32),
        vec![Instruction::LoadFloat(1.5), Instruction::LoadFloat(2.5), Instruction::AddFloat, Instruction::Ret],
        vec![],
        false,
    )
}

/// Scenario 6: six integer parameters summed, exercising stack arguments,
/// shadow space, and alignment.
fn scenario_6() -> Function {
    let instrs = (0..6)
        .map(Instruction::LoadArgument)
        .chain(std::iter::repeat(Instruction::AddInt).take(5))
        .chain(std::iter::once(Instruction::Ret))
        .collect();
    Function::with_inferred_operand_stack(def("sum6", vec![VMType::Int32; 6], VMType::Int32), instrs, vec![], false)
}

#[test]
fn every_scenario_compiles_and_finalises_on_every_host() {
    init_logging();

    let mut driver = JitDriver::new(StaticBinder::new());
    driver.compile(&scenario_1()).unwrap();
    driver.compile(&scenario_2()).unwrap();
    driver.compile(&scenario_3()).unwrap();
    driver.compile(&scenario_5()).unwrap();
    driver.compile(&scenario_6()).unwrap();
    driver.make_executable().unwrap();

    for name in ["add_consts", "mul_args", "div_or_default", "add_floats", "sum6"] {
        assert!(driver.entry_point(name).is_some());
    }
}

#[test]
fn recursive_fibonacci_compiles_and_finalises_on_every_host() {
    for optimise in [false, true] {
        let mut binder = StaticBinder::new();
        binder.register_managed("fib");
        let mut driver = JitDriver::new(binder);
        driver.compile(&scenario_4(optimise)).unwrap();
        driver.make_executable().unwrap();
        assert!(driver.entry_point("fib").is_some());
    }
}

/// Calls into compiled machine code only work where `src/memory.rs`
/// actually flips the allocation to executable, which is Windows-only.
#[cfg(windows)]
mod windows_execution {
    use super::*;

    #[test]
    fn scenario_1_returns_five() {
        init_logging();
        let mut driver = JitDriver::new(StaticBinder::new());
        driver.compile(&scenario_1()).unwrap();
        driver.make_executable().unwrap();
        let entry = driver.entry_point("add_consts").unwrap();
        let f: extern "win64" fn() -> i32 = unsafe { std::mem::transmute(entry) };
        assert_eq!(f(), 5);
    }

    #[test]
    fn scenario_2_returns_forty_two() {
        let mut driver = JitDriver::new(StaticBinder::new());
        driver.compile(&scenario_2()).unwrap();
        driver.make_executable().unwrap();
        let entry = driver.entry_point("mul_args").unwrap();
        let f: extern "win64" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(entry) };
        assert_eq!(f(6, 7), 42);
    }

    #[test]
    fn scenario_3_divides_or_defaults() {
        let mut driver = JitDriver::new(StaticBinder::new());
        driver.compile(&scenario_3()).unwrap();
        driver.make_executable().unwrap();
        let entry = driver.entry_point("div_or_default").unwrap();
        let f: extern "win64" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(entry) };
        assert_eq!(f(10, 2), 5);
        assert_eq!(f(0, 2), -1);
    }

    #[test]
    fn scenario_4_fibonacci_of_ten_is_fifty_five() {
        for optimise in [false, true] {
            let mut binder = StaticBinder::new();
            binder.register_managed("fib");
            let mut driver = JitDriver::new(binder);
            driver.compile(&scenario_4(optimise)).unwrap();
            driver.make_executable().unwrap();
            let entry = driver.entry_point("fib").unwrap();
            let f: extern "win64" fn(i32) -> i32 = unsafe { std::mem::transmute(entry) };
            assert_eq!(f(10), 55, "optimise={optimise}");
        }
    }

    #[test]
    fn scenario_5_adds_floats() {
        let mut driver = JitDriver::new(StaticBinder::new());
        driver.compile(&scenario_5()).unwrap();
        driver.make_executable().unwrap();
        let entry = driver.entry_point("add_floats").unwrap();
        let f: extern "win64" fn() -> f32 = unsafe { std::mem::transmute(entry) };
        assert_eq!(f(), 4.0);
    }

    #[test]
    fn scenario_6_sums_six_stack_and_register_arguments() {
        let mut driver = JitDriver::new(StaticBinder::new());
        driver.compile(&scenario_6()).unwrap();
        driver.make_executable().unwrap();
        let entry = driver.entry_point("sum6").unwrap();
        let f: extern "win64" fn(i32, i32, i32, i32, i32, i32) -> i32 = unsafe { std::mem::transmute(entry) };
        assert_eq!(f(1, 2, 3, 4, 5, 6), 21);
    }
}

//! The data model consumed from the (out-of-scope) IR verifier: opcodes,
//! the typed function object, and the virtual-instruction shape the
//! optimised pipeline lowers IR into.

use std::fmt;

/// A primitive VM type: no GC, exceptions or object model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VMType {
    /// 32-bit signed integer.
    Int32,
    /// 32-bit IEEE-754 float.
    Float32,
    /// No value.
    Void,
}

impl VMType {
    /// `true` for `Int32`.
    #[must_use]
    pub fn is_integer(self) -> bool {
        matches!(self, VMType::Int32)
    }

    /// `true` for `Float32`.
    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, VMType::Float32)
    }
}

/// An IR instruction index. Branch and call targets are expressed as
/// indices into the owning function's instruction vector, never as byte
/// offsets — those are computed later by the code generator.
pub type IrIndex = usize;

/// One instruction of the typed, stack-oriented IR the verifier
/// produces.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Discards the top of the operand stack.
    Pop,
    /// Pushes a 32-bit integer literal.
    LoadInt(i32),
    /// Pushes a 32-bit float literal.
    LoadFloat(f32),
    /// Pushes the value of local `index`.
    LoadLocal(usize),
    /// Pops the top of the operand stack into local `index`.
    StoreLocal(usize),
    /// Pushes the value of parameter `index`.
    LoadArgument(usize),
    /// Pops two ints, pushes their sum.
    AddInt,
    /// Pops two ints (`b` then `a`), pushes `a - b`.
    SubInt,
    /// Pops two ints, pushes their product.
    MulInt,
    /// Pops two ints (`b` then `a`), pushes `a / b`.
    DivInt,
    /// Pops two floats, pushes their sum.
    AddFloat,
    /// Pops two floats (`b` then `a`), pushes `a - b`.
    SubFloat,
    /// Pops two floats, pushes their product.
    MulFloat,
    /// Pops two floats (`b` then `a`), pushes `a / b`.
    DivFloat,
    /// Calls `name`, consuming `param_types.len()` stack operands
    /// (last argument on top) and pushing the return value if not void.
    /// The verifier has already resolved the callee's signature, so
    /// `return_type` travels with the instruction rather than requiring
    /// the back end to look up other functions' definitions.
    Call {
        /// Callee name, resolved through the binder.
        name: String,
        /// Parameter types, in declaration order.
        param_types: Vec<VMType>,
        /// The callee's return type.
        return_type: VMType,
    },
    /// Pops the return value (if any) and returns from the function.
    Ret,
    /// Unconditional jump to IR index `target`.
    Branch(IrIndex),
    /// Pops two operands and jumps to `target` if equal.
    BranchEqual(IrIndex),
    /// Pops two operands and jumps to `target` if not equal.
    BranchNotEqual(IrIndex),
    /// Pops two operands (`b` then `a`) and jumps to `target` if `a > b`.
    BranchGreater(IrIndex),
    /// Pops two operands (`b` then `a`) and jumps to `target` if `a >= b`.
    BranchGreaterOrEqual(IrIndex),
    /// Pops two operands (`b` then `a`) and jumps to `target` if `a < b`.
    BranchLess(IrIndex),
    /// Pops two operands (`b` then `a`) and jumps to `target` if `a <= b`.
    BranchLessOrEqual(IrIndex),
}

impl Instruction {
    /// Branch/jump target of this instruction, if any.
    #[must_use]
    pub fn branch_target(&self) -> Option<IrIndex> {
        match self {
            Instruction::Branch(t)
            | Instruction::BranchEqual(t)
            | Instruction::BranchNotEqual(t)
            | Instruction::BranchGreater(t)
            | Instruction::BranchGreaterOrEqual(t)
            | Instruction::BranchLess(t)
            | Instruction::BranchLessOrEqual(t) => Some(*t),
            _ => None,
        }
    }

    /// `true` for the six conditional branch variants.
    #[must_use]
    pub fn is_conditional_branch(&self) -> bool {
        matches!(
            self,
            Instruction::BranchEqual(_)
                | Instruction::BranchNotEqual(_)
                | Instruction::BranchGreater(_)
                | Instruction::BranchGreaterOrEqual(_)
                | Instruction::BranchLess(_)
                | Instruction::BranchLessOrEqual(_)
        )
    }

    /// A short, stable name used in `UnsupportedOpCode` diagnostics.
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::Pop => "Pop",
            Instruction::LoadInt(_) => "LoadInt",
            Instruction::LoadFloat(_) => "LoadFloat",
            Instruction::LoadLocal(_) => "LoadLocal",
            Instruction::StoreLocal(_) => "StoreLocal",
            Instruction::LoadArgument(_) => "LoadArgument",
            Instruction::AddInt => "AddInt",
            Instruction::SubInt => "SubInt",
            Instruction::MulInt => "MulInt",
            Instruction::DivInt => "DivInt",
            Instruction::AddFloat => "AddFloat",
            Instruction::SubFloat => "SubFloat",
            Instruction::MulFloat => "MulFloat",
            Instruction::DivFloat => "DivFloat",
            Instruction::Call { .. } => "Call",
            Instruction::Ret => "Ret",
            Instruction::Branch(_) => "Branch",
            Instruction::BranchEqual(_) => "BranchEqual",
            Instruction::BranchNotEqual(_) => "BranchNotEqual",
            Instruction::BranchGreater(_) => "BranchGreater",
            Instruction::BranchGreaterOrEqual(_) => "BranchGreaterOrEqual",
            Instruction::BranchLess(_) => "BranchLess",
            Instruction::BranchLessOrEqual(_) => "BranchLessOrEqual",
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

/// The full signature of a function: name, parameter types, return type.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDefinition {
    /// Function name, used for call resolution.
    pub name: String,
    /// Ordered parameter types.
    pub params: Vec<VMType>,
    /// Return type.
    pub return_type: VMType,
}

/// A function as consumed by the back end: already type-checked,
/// carrying an instruction stream and a precomputed per-instruction
/// operand-type stack.
#[derive(Debug, Clone)]
pub struct Function {
    /// Name, parameter types and return type.
    pub definition: FunctionDefinition,
    /// The typed IR instruction stream.
    pub instructions: Vec<Instruction>,
    /// Declared local variable types, in declaration order.
    pub locals: Vec<VMType>,
    /// `true` to compile with the register-allocated optimised pipeline
    /// (`crate::codegen::optimized`); `false` for the naïve,
    /// stack-materialising pipeline (`crate::codegen::naive`).
    pub optimise: bool,
    /// Per-instruction-index snapshot of the operand-type stack *before*
    /// the instruction executes, used by conditional branches to pick
    /// `cmp` (integer) versus `ucomiss` (float).
    pub operand_type_stack: Vec<Vec<VMType>>,
    /// Maximum depth the operand stack reaches anywhere in the body
    /// used by the naïve generator to size its frame.
    pub operand_stack_size: u32,
}

impl Function {
    /// Computes `operand_type_stack` by simulating the stack effect of
    /// every instruction (the verifier is out of scope, but the back
    /// end still needs a precomputed per-instruction operand-type stack).
    #[must_use]
    pub fn with_inferred_operand_stack(
        definition: FunctionDefinition,
        instructions: Vec<Instruction>,
        locals: Vec<VMType>,
        optimise: bool,
    ) -> Function {
        let mut stack: Vec<VMType> = Vec::new();
        let mut snapshots = Vec::with_capacity(instructions.len());
        let mut max_depth: usize = 0;
        for instr in &instructions {
            snapshots.push(stack.clone());
            match instr {
                Instruction::Pop => {
                    stack.pop();
                }
                Instruction::LoadInt(_) => stack.push(VMType::Int32),
                Instruction::LoadFloat(_) => stack.push(VMType::Float32),
                Instruction::LoadLocal(i) => stack.push(locals[*i]),
                Instruction::StoreLocal(_) => {
                    stack.pop();
                }
                Instruction::LoadArgument(i) => stack.push(definition.params[*i]),
                Instruction::AddInt | Instruction::SubInt | Instruction::MulInt | Instruction::DivInt => {
                    stack.pop();
                    stack.pop();
                    stack.push(VMType::Int32);
                }
                Instruction::AddFloat | Instruction::SubFloat | Instruction::MulFloat | Instruction::DivFloat => {
                    stack.pop();
                    stack.pop();
                    stack.push(VMType::Float32);
                }
                Instruction::Call { param_types, return_type, .. } => {
                    for _ in param_types {
                        stack.pop();
                    }
                    if *return_type != VMType::Void {
                        stack.push(*return_type);
                    }
                }
                Instruction::Ret => {
                    if definition.return_type != VMType::Void {
                        stack.pop();
                    }
                }
                Instruction::Branch(_) => {}
                Instruction::BranchEqual(_)
                | Instruction::BranchNotEqual(_)
                | Instruction::BranchGreater(_)
                | Instruction::BranchGreaterOrEqual(_)
                | Instruction::BranchLess(_)
                | Instruction::BranchLessOrEqual(_) => {
                    stack.pop();
                    stack.pop();
                }
            }
            max_depth = max_depth.max(stack.len());
        }
        Function {
            definition,
            instructions,
            locals,
            optimise,
            operand_type_stack: snapshots,
            operand_stack_size: max_depth as u32,
        }
    }
}

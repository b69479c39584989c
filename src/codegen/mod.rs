//! The two code generation pipelines: a naïve generator that
//! materialises the operand stack in memory, and an optimised generator
//! built on the virtual-register allocator, sharing the virtual
//! assembler's memory-to-memory rewrite rules.

/// The naïve, stack-materialising generator.
pub mod naive;
/// The register-allocated generator.
pub mod optimized;
/// Shared memory-to-memory rewrite rules used by both generators.
pub mod virtual_asm;

//! Function binder: the embedding collaborator that resolves a callee
//! name to either a function compiled by this same pipeline (a
//! *managed* function, whose entry point is only known once every
//! function has been compiled) or to a native function pointer already
//! known at compile time.

use crate::error::{JitError, Result};
use crate::ir::VMType;

/// What [`Binder::resolve`] decided for one call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    /// Resolves to a function this same [`crate::driver::JitDriver`]
    /// compiles (or will compile). The call site is emitted as a
    /// placeholder and patched once every function has an entry point.
    Managed,
    /// Resolves to a native function pointer, already known.
    Native(usize),
}

/// Resolves call targets by name and signature. Implemented by the
/// embedding virtual machine and consumed only through this trait by
/// [`crate::codegen`] and [`crate::driver`].
pub trait Binder {
    /// Resolves `name`/`param_types` to a call target.
    ///
    /// # Errors
    /// Returns [`JitError::UnresolvedSymbol`] if `name` is not a known
    /// function at all (neither managed nor native).
    fn resolve(&self, name: &str, param_types: &[VMType]) -> Result<CallTarget>;
}

/// A [`Binder`] backed by two plain maps, useful for tests and small
/// embeddings that don't need a real symbol table.
#[derive(Debug, Default, Clone)]
pub struct StaticBinder {
    managed: std::collections::HashSet<String>,
    native: std::collections::HashMap<String, usize>,
}

impl StaticBinder {
    /// An empty binder: every name is unresolved until registered.
    #[must_use]
    pub fn new() -> StaticBinder {
        StaticBinder { managed: std::collections::HashSet::new(), native: std::collections::HashMap::new() }
    }

    /// Registers `name` as a managed function compiled by the same
    /// driver this binder is handed to.
    pub fn register_managed(&mut self, name: impl Into<String>) {
        self.managed.insert(name.into());
    }

    /// Registers `name` as a native function at a fixed address.
    pub fn register_native(&mut self, name: impl Into<String>, address: usize) {
        self.native.insert(name.into(), address);
    }
}

impl Binder for StaticBinder {
    fn resolve(&self, name: &str, _param_types: &[VMType]) -> Result<CallTarget> {
        if let Some(&addr) = self.native.get(name) {
            return Ok(CallTarget::Native(addr));
        }
        if self.managed.contains(name) {
            return Ok(CallTarget::Managed);
        }
        Err(JitError::UnresolvedSymbol { name: name.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_name_is_unresolved() {
        let binder = StaticBinder::new();
        assert!(binder.resolve("missing", &[]).is_err());
    }

    #[test]
    fn registered_managed_name_resolves() {
        let mut binder = StaticBinder::new();
        binder.register_managed("fib");
        assert_eq!(binder.resolve("fib", &[]).unwrap(), CallTarget::Managed);
    }

    #[test]
    fn registered_native_name_resolves_to_its_address() {
        let mut binder = StaticBinder::new();
        binder.register_native("memset", 0x1234);
        assert_eq!(binder.resolve("memset", &[]).unwrap(), CallTarget::Native(0x1234));
    }
}

//! Host interface of the interpreter: symbols, host classes and calls.
//!
//! Scripts reach the device through `CALL_HOST rd, "Class", "method", args...`.
//! Classes and their methods are registered on each VM instance before any
//! task is created; programs referencing anything unregistered are rejected
//! when their task is created.

use crate::api::HostEnv;
use crate::core::restart_lock::FreezeGuard;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::vm::Value;

/// Index of an interned symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SymbolId(pub u16);

/// Symbols known to scripts (`:led1`, `:sw1`, ...).
#[derive(Debug, Default)]
pub struct SymbolTable {
    names: Vec<&'static str>,
}

impl SymbolTable {
    /// Interns `name`, returning the existing id if already present.
    pub fn intern(&mut self, name: &'static str) -> SymbolId {
        if let Some(id) = self.lookup(name) {
            return id;
        }
        self.names.push(name);
        SymbolId((self.names.len() - 1) as u16)
    }

    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.names
            .iter()
            .position(|n| *n == name)
            .map(|i| SymbolId(i as u16))
    }

    pub fn name(&self, id: SymbolId) -> Option<&'static str> {
        self.names.get(id.0 as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Signature of a host method.
pub type HostFn = fn(&mut HostCall<'_>, &[Value]) -> Result<Value, VMError>;

/// Context handed to a host method for one call.
pub struct HostCall<'a> {
    pub env: &'a HostEnv,
    pub symbols: &'a SymbolTable,
    /// Restart-lock guard owned by the calling task.
    pub freeze: &'a mut Option<FreezeGuard>,
}

impl HostCall<'_> {
    /// Resolves a symbol argument to its name.
    pub fn symbol_name(&self, value: Value, context: &'static str) -> Result<&'static str, VMError> {
        match value {
            Value::Sym(id) => self
                .symbols
                .name(id)
                .ok_or_else(|| VMError::UnknownSymbol(format!("#{}", id.0))),
            other => Err(VMError::TypeMismatch {
                context,
                expected: "Symbol",
                actual: other.type_name(),
            }),
        }
    }
}

/// Checks the argument count of a host call.
pub fn expect_args(method: &'static str, args: &[Value], expected: usize) -> Result<(), VMError> {
    if args.len() != expected {
        return Err(VMError::ArgumentCount {
            method,
            expected,
            actual: args.len(),
        });
    }
    Ok(())
}

struct ClassDef {
    name: &'static str,
    methods: Vec<(&'static str, HostFn)>,
}

/// Host classes registered on a VM instance.
#[derive(Default)]
pub struct ClassRegistry {
    classes: Vec<ClassDef>,
}

impl ClassRegistry {
    /// Defines `class.method`, creating the class on first use.
    pub fn define_method(
        &mut self,
        class: &'static str,
        method: &'static str,
        f: HostFn,
    ) -> Result<(), VMError> {
        let index = match self.classes.iter().position(|c| c.name == class) {
            Some(index) => index,
            None => {
                self.classes.push(ClassDef {
                    name: class,
                    methods: Vec::new(),
                });
                self.classes.len() - 1
            }
        };
        let def = &mut self.classes[index];
        if def.methods.iter().any(|(name, _)| *name == method) {
            return Err(VMError::MethodAlreadyDefined {
                class: class.to_string(),
                method: method.to_string(),
            });
        }
        def.methods.push((method, f));
        Ok(())
    }

    pub fn find(&self, class: &str, method: &str) -> Option<HostFn> {
        self.classes
            .iter()
            .find(|c| c.name == class)?
            .methods
            .iter()
            .find(|(name, _)| *name == method)
            .map(|(_, f)| *f)
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn method_count(&self) -> usize {
        self.classes.iter().map(|c| c.methods.len()).sum()
    }
}

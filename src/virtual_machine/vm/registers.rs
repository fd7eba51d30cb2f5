use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::host::SymbolId;
use crate::virtual_machine::isa::REGISTER_COUNT;

/// Runtime value stored in registers and passed to host methods.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// Interned symbol such as `:led1`.
    Sym(SymbolId),
}

impl Value {
    /// Returns the type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "Boolean",
            Value::Int(_) => "Integer",
            Value::Sym(_) => "Symbol",
        }
    }

    /// Only `nil` and `false` are falsy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }
}

/// Fixed-size register file of a task.
#[derive(Debug, Clone)]
pub(crate) struct Registers {
    regs: [Value; REGISTER_COUNT],
}

impl Registers {
    pub(crate) fn new() -> Self {
        Self {
            regs: [Value::Nil; REGISTER_COUNT],
        }
    }

    /// Returns the value in register `idx`.
    pub(crate) fn get(&self, idx: u8) -> Result<Value, VMError> {
        self.regs
            .get(idx as usize)
            .copied()
            .ok_or(VMError::InvalidRegisterIndex(idx))
    }

    /// Returns the integer in register `idx`.
    pub(crate) fn get_int(&self, idx: u8, context: &'static str) -> Result<i64, VMError> {
        match self.get(idx)? {
            Value::Int(v) => Ok(v),
            other => Err(VMError::TypeMismatch {
                context,
                expected: "Integer",
                actual: other.type_name(),
            }),
        }
    }

    pub(crate) fn set(&mut self, idx: u8, value: Value) -> Result<(), VMError> {
        let slot = self
            .regs
            .get_mut(idx as usize)
            .ok_or(VMError::InvalidRegisterIndex(idx))?;
        *slot = value;
        Ok(())
    }
}

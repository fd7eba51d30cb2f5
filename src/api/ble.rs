use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::host::{HostCall, expect_args};
use crate::virtual_machine::vm::{Value, Vm};

pub fn define(vm: &mut Vm<'_>) -> Result<(), VMError> {
    vm.define_method("BLE", "state", state)
}

/// `BLE.state`: 0 off, 1 advertising, 2 connected.
fn state(call: &mut HostCall<'_>, args: &[Value]) -> Result<Value, VMError> {
    expect_args("BLE.state", args, 0)?;
    Ok(Value::Int(call.env.link.get().code() as i64))
}

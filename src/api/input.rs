use crate::api::pin_arg;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::host::{HostCall, expect_args};
use crate::virtual_machine::vm::{Value, Vm};

pub fn define(vm: &mut Vm<'_>) -> Result<(), VMError> {
    vm.define_method("Input", "pressed?", pressed)?;
    vm.define_method("Input", "released?", released)
}

fn level(call: &HostCall<'_>, method: &'static str, args: &[Value]) -> Result<Option<bool>, VMError> {
    expect_args(method, args, 1)?;
    Ok(pin_arg(call, args[0])
        .filter(|pin| !pin.is_output())
        .map(|pin| call.env.gpio.get(pin)))
}

/// `Input.pressed?(part)`; `false` for anything but a switch.
fn pressed(call: &mut HostCall<'_>, args: &[Value]) -> Result<Value, VMError> {
    let level = level(call, "Input.pressed?", args)?;
    Ok(Value::Bool(level == Some(true)))
}

/// `Input.released?(part)`; `false` for anything but a switch.
fn released(call: &mut HostCall<'_>, args: &[Value]) -> Result<Value, VMError> {
    let level = level(call, "Input.released?", args)?;
    Ok(Value::Bool(level == Some(false)))
}

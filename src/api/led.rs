use crate::api::pin_arg;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::host::HostCall;
use crate::virtual_machine::vm::{Value, Vm};
use crate::warn;

pub fn define(vm: &mut Vm<'_>) -> Result<(), VMError> {
    vm.define_method("LED", "set", set)
}

/// `LED.set(part, state = false)`
fn set(call: &mut HostCall<'_>, args: &[Value]) -> Result<Value, VMError> {
    let (part, state) = match args {
        [part] => (*part, false),
        [part, state] => (*part, state.is_truthy()),
        _ => {
            return Err(VMError::ArgumentCount {
                method: "LED.set",
                expected: 2,
                actual: args.len(),
            });
        }
    };

    let Some(pin) = pin_arg(call, part) else {
        return Ok(Value::Bool(false));
    };
    match call.env.gpio.set(pin, state) {
        Ok(()) => Ok(Value::Bool(true)),
        Err(err) => {
            warn!("LED.set: {err}");
            Ok(Value::Bool(false))
        }
    }
}

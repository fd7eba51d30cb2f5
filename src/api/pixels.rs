use crate::drivers::led_strip::Rgb;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::host::{HostCall, expect_args};
use crate::virtual_machine::vm::{Value, Vm};

pub fn define(vm: &mut Vm<'_>) -> Result<(), VMError> {
    vm.define_method("PIXELS", "set", set)?;
    vm.define_method("PIXELS", "update", update)
}

/// `PIXELS.set(index, r, g, b)`: components are clamped to 0..=255.
fn set(call: &mut HostCall<'_>, args: &[Value]) -> Result<Value, VMError> {
    expect_args("PIXELS.set", args, 4)?;
    let index = int_arg(args[0])?;
    let colour = Rgb::new(
        component(args[1])?,
        component(args[2])?,
        component(args[3])?,
    );

    let Ok(index) = usize::try_from(index) else {
        return Ok(Value::Bool(false));
    };
    Ok(Value::Bool(call.env.strip.set(index, colour).is_ok()))
}

/// `PIXELS.update`: shows the staged colours.
fn update(call: &mut HostCall<'_>, args: &[Value]) -> Result<Value, VMError> {
    expect_args("PIXELS.update", args, 0)?;
    call.env.strip.update();
    Ok(Value::Bool(true))
}

fn int_arg(value: Value) -> Result<i64, VMError> {
    match value {
        Value::Int(v) => Ok(v),
        other => Err(VMError::TypeMismatch {
            context: "PIXELS.set",
            expected: "Integer",
            actual: other.type_name(),
        }),
    }
}

fn component(value: Value) -> Result<u8, VMError> {
    Ok(int_arg(value)?.clamp(0, u8::MAX as i64) as u8)
}

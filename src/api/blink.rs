//! `Blink` lets a script hold off restarts while it is in a critical section.
//!
//! The lock taken by `Blink.lock` is the same one a restart acquires, and it is
//! owned by the calling task: it is released by `Blink.unlock`, when the task
//! ends, or when the VM instance is torn down.

use crate::config::FREEZE_LOCK_TIMEOUT;
use crate::debug;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::host::{HostCall, expect_args};
use crate::virtual_machine::vm::{Value, Vm};

pub fn define(vm: &mut Vm<'_>) -> Result<(), VMError> {
    vm.define_method("Blink", "req_reload?", req_reload)?;
    vm.define_method("Blink", "lock", lock)?;
    vm.define_method("Blink", "unlock", unlock)
}

fn req_reload(_call: &mut HostCall<'_>, args: &[Value]) -> Result<Value, VMError> {
    expect_args("Blink.req_reload?", args, 0)?;
    debug!("call to deprecated method Blink.req_reload?");
    Ok(Value::Bool(false))
}

fn lock(call: &mut HostCall<'_>, args: &[Value]) -> Result<Value, VMError> {
    expect_args("Blink.lock", args, 0)?;
    if call.freeze.is_some() {
        return Ok(Value::Bool(true));
    }
    match call.env.restart_lock.acquire(FREEZE_LOCK_TIMEOUT) {
        Some(guard) => {
            *call.freeze = Some(guard);
            Ok(Value::Bool(true))
        }
        None => Ok(Value::Bool(false)),
    }
}

fn unlock(call: &mut HostCall<'_>, args: &[Value]) -> Result<Value, VMError> {
    expect_args("Blink.unlock", args, 0)?;
    Ok(Value::Bool(call.freeze.take().is_some()))
}

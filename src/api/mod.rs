//! Host classes exposed to scripts.
//!
//! | Class | Method | Returns |
//! |---|---|---|
//! | `LED` | `set(part, state)` | `true` if `part` names an LED |
//! | `Input` | `pressed?(part)`, `released?(part)` | switch level |
//! | `BLE` | `state` | 0 off, 1 advertising, 2 connected |
//! | `Blink` | `lock`, `unlock` | whether the restart lock was taken/released |
//! | `Blink` | `req_reload?` | always `false` (deprecated) |
//! | `PIXELS` | `set(index, r, g, b)` | `false` if `index` is off the strip |
//! | `PIXELS` | `update` | `true` once the staged colours are shown |
//!
//! Everything is registered on each new VM instance by [`define_all`].

pub mod ble;
pub mod blink;
mod console;
pub mod input;
pub mod led;
pub mod pixels;

pub use console::Console;

use crate::config::STRIP_PIXELS;
use crate::core::restart_lock::RestartLock;
use crate::drivers::gpio::{GpioBank, Pin};
use crate::drivers::led_strip::LedStrip;
use crate::network::link::LinkState;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::host::HostCall;
use crate::virtual_machine::vm::{Value, Vm};
use std::sync::Arc;

/// Device resources reachable from host methods.
pub struct HostEnv {
    pub gpio: Arc<GpioBank>,
    pub strip: LedStrip,
    pub link: LinkState,
    pub restart_lock: RestartLock,
    pub console: Console,
}

impl HostEnv {
    pub fn new(gpio: Arc<GpioBank>, link: LinkState, restart_lock: RestartLock) -> Self {
        Self {
            gpio,
            strip: LedStrip::new(STRIP_PIXELS),
            link,
            restart_lock,
            console: Console::default(),
        }
    }
}

/// Registers the symbol table and every host class on `vm`.
pub fn define_all(vm: &mut Vm<'_>) -> Result<(), VMError> {
    for pin in Pin::ALL {
        vm.intern_symbol(pin.symbol());
    }
    led::define(vm)?;
    input::define(vm)?;
    ble::define(vm)?;
    blink::define(vm)?;
    pixels::define(vm)?;
    Ok(())
}

/// Resolves a `part` argument to a pin, `None` for anything that is not a known pin symbol.
fn pin_arg(call: &HostCall<'_>, value: Value) -> Option<Pin> {
    match value {
        Value::Sym(id) => call.symbols.name(id).and_then(Pin::from_symbol),
        _ => None,
    }
}

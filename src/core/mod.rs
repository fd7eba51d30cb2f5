//! Device core: VM lifecycle, coordination and device-level procedures.
//!
//! - `supervisor`: Boots, restarts and shuts down the VM on its own thread
//! - `restart_lock`: Gate serializing restarts against VM freeze requests
//! - `reboot`: Storage-safe warm/cold reboot procedure
//! - `identity`: Advertised device name derived from the hardware id
//! - `device`: Wires channel, dispatcher, supervisor and storage together

pub mod device;
pub mod identity;
pub mod reboot;
pub mod restart_lock;
pub mod supervisor;

//! Field-programmable script slots.
//!
//! Firmware for a device that runs two small bytecode programs side by side.
//! Programs are uploaded over a deployment channel, persisted in a slot store
//! and hot-swapped by restarting the supervised VM.

pub mod api;
pub mod config;
pub mod core;
pub mod drivers;
pub mod network;
pub mod storage;
pub mod utils;
pub mod virtual_machine;

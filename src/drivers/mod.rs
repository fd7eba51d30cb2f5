//! Simulated peripherals.

pub mod gpio;
pub mod led_strip;

//! Simulated GPIO bank: two LEDs driven by scripts, two switches driven by
//! the outside world (tests, the device simulator's console).

use dashmap::DashMap;
use slotvm_derive::Error;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Pin {
    Led1,
    Led2,
    Sw1,
    Sw2,
}

impl Pin {
    pub const ALL: [Pin; 4] = [Pin::Led1, Pin::Led2, Pin::Sw1, Pin::Sw2];

    /// Script symbol naming this pin.
    pub fn symbol(self) -> &'static str {
        match self {
            Pin::Led1 => "led1",
            Pin::Led2 => "led2",
            Pin::Sw1 => "sw1",
            Pin::Sw2 => "sw2",
        }
    }

    pub fn from_symbol(name: &str) -> Option<Pin> {
        Pin::ALL.into_iter().find(|pin| pin.symbol() == name)
    }

    pub fn is_output(self) -> bool {
        matches!(self, Pin::Led1 | Pin::Led2)
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpioError {
    #[error("pin {0} is not an output")]
    NotAnOutput(Pin),

    #[error("pin {0} is not an input")]
    NotAnInput(Pin),
}

/// Current level of every pin.
pub struct GpioBank {
    levels: DashMap<Pin, bool>,
}

impl Default for GpioBank {
    fn default() -> Self {
        Self::new()
    }
}

impl GpioBank {
    pub fn new() -> Self {
        let levels = DashMap::new();
        for pin in Pin::ALL {
            levels.insert(pin, false);
        }
        Self { levels }
    }

    /// Drives an output pin.
    pub fn set(&self, pin: Pin, on: bool) -> Result<(), GpioError> {
        if !pin.is_output() {
            return Err(GpioError::NotAnOutput(pin));
        }
        self.levels.insert(pin, on);
        Ok(())
    }

    /// Reads the level of any pin.
    pub fn get(&self, pin: Pin) -> bool {
        self.levels.get(&pin).is_some_and(|level| *level)
    }

    pub fn press(&self, pin: Pin) -> Result<(), GpioError> {
        self.drive_input(pin, true)
    }

    pub fn release(&self, pin: Pin) -> Result<(), GpioError> {
        self.drive_input(pin, false)
    }

    fn drive_input(&self, pin: Pin, level: bool) -> Result<(), GpioError> {
        if pin.is_output() {
            return Err(GpioError::NotAnInput(pin));
        }
        self.levels.insert(pin, level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pins_start_low() {
        let gpio = GpioBank::new();
        assert!(Pin::ALL.iter().all(|pin| !gpio.get(*pin)));
    }

    #[test]
    fn leds_are_outputs_and_switches_inputs() {
        let gpio = GpioBank::new();
        gpio.set(Pin::Led2, true).unwrap();
        assert!(gpio.get(Pin::Led2));
        assert_eq!(gpio.set(Pin::Sw1, true), Err(GpioError::NotAnOutput(Pin::Sw1)));
        assert_eq!(gpio.press(Pin::Led1), Err(GpioError::NotAnInput(Pin::Led1)));

        gpio.press(Pin::Sw1).unwrap();
        assert!(gpio.get(Pin::Sw1));
        gpio.release(Pin::Sw1).unwrap();
        assert!(!gpio.get(Pin::Sw1));
    }

    #[test]
    fn symbols_round_trip() {
        for pin in Pin::ALL {
            assert_eq!(Pin::from_symbol(pin.symbol()), Some(pin));
        }
        assert_eq!(Pin::from_symbol("led3"), None);
        assert_eq!(GpioError::NotAnOutput(Pin::Sw2).to_string(), "pin sw2 is not an output");
    }
}

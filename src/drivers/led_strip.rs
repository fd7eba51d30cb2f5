//! Simulated addressable RGB strip.
//!
//! `set` stages a colour in the frame buffer; nothing is visible until
//! `update` latches the buffer onto the strip.

use crate::error;
use parking_lot::Mutex;
use slotvm_derive::Error;
use std::fmt;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const OFF: Rgb = Rgb { r: 0, g: 0, b: 0 };

    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StripError {
    #[error("pixel index {index} is out of range for a {len} pixel strip")]
    IndexOutOfRange { index: usize, len: usize },
}

pub struct LedStrip {
    staged: Mutex<Vec<Rgb>>,
    shown: Mutex<Vec<Rgb>>,
}

impl LedStrip {
    /// A strip of `len` pixels, all off.
    pub fn new(len: usize) -> Self {
        Self {
            staged: Mutex::new(vec![Rgb::OFF; len]),
            shown: Mutex::new(vec![Rgb::OFF; len]),
        }
    }

    pub fn len(&self) -> usize {
        self.staged.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stages `colour` for pixel `index`.
    pub fn set(&self, index: usize, colour: Rgb) -> Result<(), StripError> {
        let mut staged = self.staged.lock();
        let len = staged.len();
        match staged.get_mut(index) {
            Some(pixel) => {
                *pixel = colour;
                Ok(())
            }
            None => {
                error!("Pixel index out of range: {index}");
                Err(StripError::IndexOutOfRange { index, len })
            }
        }
    }

    /// Shows every staged colour.
    pub fn update(&self) {
        let staged = self.staged.lock();
        self.shown.lock().copy_from_slice(&staged);
    }

    /// Colour currently shown by pixel `index`.
    pub fn pixel(&self, index: usize) -> Option<Rgb> {
        self.shown.lock().get(index).copied()
    }

    pub fn pixels(&self) -> Vec<Rgb> {
        self.shown.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colours_show_only_after_update() {
        let strip = LedStrip::new(4);
        strip.set(2, Rgb::new(255, 16, 0)).unwrap();
        assert_eq!(strip.pixel(2), Some(Rgb::OFF));

        strip.update();
        assert_eq!(strip.pixel(2), Some(Rgb::new(255, 16, 0)));
        assert_eq!(strip.pixels().iter().filter(|p| **p == Rgb::OFF).count(), 3);
    }

    #[test]
    fn out_of_range_index_is_refused() {
        let strip = LedStrip::new(4);
        assert_eq!(
            strip.set(4, Rgb::new(1, 2, 3)),
            Err(StripError::IndexOutOfRange { index: 4, len: 4 })
        );
        strip.update();
        assert!(strip.pixels().iter().all(|p| *p == Rgb::OFF));
        assert_eq!(strip.pixel(4), None);
        assert_eq!(Rgb::new(255, 16, 0).to_string(), "#FF1000");
    }
}

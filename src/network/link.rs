use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Radio link state as reported to scripts by `BLE.state`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Advertising = 1,
    Connected = 2,
}

impl ConnectionState {
    pub fn code(self) -> u8 {
        self as u8
    }

    fn from_code(code: u8) -> Self {
        match code {
            1 => ConnectionState::Advertising,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Advertising => "advertising",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Shared connection state: written by the dispatcher, read by host methods.
#[derive(Clone, Debug, Default)]
pub struct LinkState {
    state: Arc<AtomicU8>,
}

impl LinkState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_code(self.state.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ConnectionState) {
        self.state.store(state.code(), Ordering::Release);
    }
}

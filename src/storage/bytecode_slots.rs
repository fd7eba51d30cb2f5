//! Bytecode slot manager.
//!
//! Maps the two logical program slots onto slot-store keys and layers the
//! factory-default fallback over store access: a slot with no usable stored
//! program always loads its built-in default instead.

use crate::config::MAX_BYTECODE_SIZE;
use crate::storage::factory;
use crate::storage::shared::SharedStore;
use crate::storage::slot_store::{StorageKey, StoreError};
use crate::{debug, info, warn};
use slotvm_derive::Error;
use std::fmt;

/// Logical program slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    Slot1 = 0,
    Slot2 = 1,
}

impl Slot {
    /// Slots in priority order.
    pub const ALL: [Slot; 2] = [Slot::Slot1, Slot::Slot2];

    /// Wire index (0 or 1), also used to index per-slot buffers.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Task priority of the slot's program; lower runs first.
    pub fn priority(self) -> u8 {
        match self {
            Slot::Slot1 => 1,
            Slot::Slot2 => 2,
        }
    }

    pub fn from_index(index: u8) -> Result<Slot, SlotError> {
        match index {
            0 => Ok(Slot::Slot1),
            1 => Ok(Slot::Slot2),
            other => Err(SlotError::InvalidSlot(other)),
        }
    }

    /// Name used for the slot's task and in logs.
    pub fn name(self) -> &'static str {
        match self {
            Slot::Slot1 => "slot1",
            Slot::Slot2 => "slot2",
        }
    }

    pub fn key(self) -> StorageKey {
        match self {
            Slot::Slot1 => StorageKey::BytecodeSlot1,
            Slot::Slot2 => StorageKey::BytecodeSlot2,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a loaded program came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramSource {
    Stored,
    FactoryDefault,
    Empty,
}

impl fmt::Display for ProgramSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramSource::Stored => write!(f, "stored"),
            ProgramSource::FactoryDefault => write!(f, "factory default"),
            ProgramSource::Empty => write!(f, "empty"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("program of {size} bytes exceeds the {max} byte limit")]
    ProgramTooLarge { size: usize, max: usize },
    #[error("slot index {0} is out of range")]
    InvalidSlot(u8),
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

/// Slot-level access to persisted programs.
#[derive(Clone)]
pub struct SlotManager {
    store: SharedStore,
}

impl SlotManager {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn store_handle(&self) -> &SharedStore {
        &self.store
    }

    /// Loads the effective program of `slot` into `buf` and returns its length.
    ///
    /// Returns 0 only when neither a stored program nor the factory default
    /// fits `buf`.
    pub fn load(&self, slot: Slot, buf: &mut [u8]) -> usize {
        self.load_traced(slot, buf).0
    }

    /// Like [`load`](Self::load), also reporting which source was used.
    pub fn load_traced(&self, slot: Slot, buf: &mut [u8]) -> (usize, ProgramSource) {
        let key = slot.key();
        match self.store.lock() {
            Ok(guard) => match guard.data_length(key) {
                Ok(len) if len > 0 && len <= buf.len() => match guard.read(key, buf) {
                    Ok(read) => return (read, ProgramSource::Stored),
                    Err(e) => warn!("Reading {} failed, using factory default: {}", slot, e),
                },
                Ok(len) if len > buf.len() => {
                    warn!(
                        "Stored program in {} ({} bytes) exceeds the {} byte buffer",
                        slot,
                        len,
                        buf.len()
                    );
                }
                Ok(_) | Err(StoreError::NotFound(_)) => {
                    debug!("No stored program in {}", slot);
                }
                Err(e) => warn!("Length query for {} failed: {}", slot, e),
            },
            Err(e) => warn!("Slot store unavailable while loading {}: {}", slot, e),
        }

        let default = factory::default_program(slot);
        if default.is_empty() || default.len() > buf.len() {
            return (0, ProgramSource::Empty);
        }
        buf[..default.len()].copy_from_slice(default);
        (default.len(), ProgramSource::FactoryDefault)
    }

    /// Replaces the stored program of `slot`.
    ///
    /// Size limits are checked before anything is deleted, so a rejected
    /// program leaves the previous one in place. Returns `Ok(0)` when `bytes`
    /// is empty and nothing changed.
    pub fn store(&self, slot: Slot, bytes: &[u8]) -> Result<usize, SlotError> {
        if bytes.is_empty() {
            debug!("Ignoring empty program for {}", slot);
            return Ok(0);
        }
        if bytes.len() > MAX_BYTECODE_SIZE {
            return Err(SlotError::ProgramTooLarge {
                size: bytes.len(),
                max: MAX_BYTECODE_SIZE,
            });
        }

        let key = slot.key();
        let mut guard = self.store.lock()?;
        let max = guard.max_entry_size();
        if bytes.len() > max {
            return Err(SlotError::ProgramTooLarge {
                size: bytes.len(),
                max,
            });
        }
        let free = guard.free_space() + guard.data_length(key).unwrap_or(0);
        if bytes.len() > free {
            return Err(StoreError::OutOfSpace {
                needed: bytes.len(),
                free,
            }
            .into());
        }

        match guard.delete(key) {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let written = guard.write(key, bytes)?;
        info!("Stored {} bytes in {}", written, slot);
        Ok(written)
    }

    /// Stored length of `slot`, without reading the program.
    pub fn length(&self, slot: Slot) -> Result<usize, SlotError> {
        Ok(self.store.lock()?.data_length(slot.key())?)
    }

    /// Deletes the stored program of `slot`; an empty slot is not an error.
    pub fn erase(&self, slot: Slot) -> Result<(), SlotError> {
        match self.store.lock()?.delete(slot.key()) {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Erases both slots so the next boot runs the factory defaults.
    pub fn factory_reset(&self) -> Result<(), SlotError> {
        for slot in Slot::ALL {
            self.erase(slot)?;
        }
        info!("Factory reset: both slots erased");
        Ok(())
    }
}

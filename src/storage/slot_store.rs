//! Persistent slot store abstraction.
//!
//! A slot store is a small durable key/blob store addressed by a fixed set of
//! [`StorageKey`]s. Every write fully replaces the previous value of its key.

use slotvm_derive::Error;
use std::fmt;

/// Keys known to the slot store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    BytecodeSlot1,
    BytecodeSlot2,
}

impl StorageKey {
    pub const ALL: [StorageKey; 2] = [StorageKey::BytecodeSlot1, StorageKey::BytecodeSlot2];

    /// Byte representation used by on-disk backends.
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            StorageKey::BytecodeSlot1 => b"bytecode_slot1",
            StorageKey::BytecodeSlot2 => b"bytecode_slot2",
        }
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKey::BytecodeSlot1 => write!(f, "bytecode_slot1"),
            StorageKey::BytecodeSlot2 => write!(f, "bytecode_slot2"),
        }
    }
}

/// Errors reported by slot store backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("no entry stored under {0}")]
    NotFound(StorageKey),
    #[error("entry of {needed} bytes does not fit a {capacity} byte buffer")]
    BufferTooSmall { needed: usize, capacity: usize },
    #[error("entry of {size} bytes exceeds the maximum entry size of {max} bytes")]
    EntryTooLarge { size: usize, max: usize },
    #[error("entry of {needed} bytes does not fit in {free} free bytes")]
    OutOfSpace { needed: usize, free: usize },
    #[error("storage lock is busy")]
    Busy,
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Durable key/blob storage.
///
/// Implementations are used behind [`SharedStore`](super::shared::SharedStore),
/// which serializes access, so methods take `&self`/`&mut self` without
/// internal locking.
pub trait SlotStore: Send {
    /// Copies the value of `key` into `buf` and returns its length.
    ///
    /// Fails with [`StoreError::BufferTooSmall`] without writing to `buf` when
    /// the value does not fit.
    fn read(&self, key: StorageKey, buf: &mut [u8]) -> Result<usize, StoreError>;

    /// Replaces the value of `key` with `data`, returning the number of bytes written.
    fn write(&mut self, key: StorageKey, data: &[u8]) -> Result<usize, StoreError>;

    /// Removes the value of `key`. Fails with [`StoreError::NotFound`] if absent.
    fn delete(&mut self, key: StorageKey) -> Result<(), StoreError>;

    /// Returns the stored length of `key` without reading it.
    fn data_length(&self, key: StorageKey) -> Result<usize, StoreError>;

    /// Bytes still available for new entries.
    fn free_space(&self) -> usize;

    /// Largest value a single key may hold.
    fn max_entry_size(&self) -> usize;
}

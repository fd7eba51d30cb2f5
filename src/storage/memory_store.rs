//! In-memory slot store for tests and the `--in-memory` device mode.

use crate::storage::slot_store::{SlotStore, StorageKey, StoreError};
use std::collections::HashMap;

/// Volatile [`SlotStore`] with a fixed capacity.
pub struct MemoryStore {
    entries: HashMap<StorageKey, Vec<u8>>,
    capacity: usize,
    max_entry: usize,
    /// Remaining successful writes before writes start failing; `None` never fails.
    write_budget: Option<usize>,
}

impl MemoryStore {
    pub fn new(capacity: usize, max_entry: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            max_entry,
            write_budget: None,
        }
    }

    /// Makes every write after the first `count` fail with a backend error.
    pub fn fail_writes_after(mut self, count: usize) -> Self {
        self.write_budget = Some(count);
        self
    }

    fn used(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

impl SlotStore for MemoryStore {
    fn read(&self, key: StorageKey, buf: &mut [u8]) -> Result<usize, StoreError> {
        let value = self.entries.get(&key).ok_or(StoreError::NotFound(key))?;
        if value.len() > buf.len() {
            return Err(StoreError::BufferTooSmall {
                needed: value.len(),
                capacity: buf.len(),
            });
        }
        buf[..value.len()].copy_from_slice(value);
        Ok(value.len())
    }

    fn write(&mut self, key: StorageKey, data: &[u8]) -> Result<usize, StoreError> {
        if data.len() > self.max_entry {
            return Err(StoreError::EntryTooLarge {
                size: data.len(),
                max: self.max_entry,
            });
        }
        let replaced = self.entries.get(&key).map_or(0, Vec::len);
        let free = self.free_space() + replaced;
        if data.len() > free {
            return Err(StoreError::OutOfSpace {
                needed: data.len(),
                free,
            });
        }
        if let Some(budget) = self.write_budget.as_mut() {
            if *budget == 0 {
                return Err(StoreError::Backend("simulated write failure".into()));
            }
            *budget -= 1;
        }
        self.entries.insert(key, data.to_vec());
        Ok(data.len())
    }

    fn delete(&mut self, key: StorageKey) -> Result<(), StoreError> {
        self.entries
            .remove(&key)
            .map(|_| ())
            .ok_or(StoreError::NotFound(key))
    }

    fn data_length(&self, key: StorageKey) -> Result<usize, StoreError> {
        self.entries
            .get(&key)
            .map(Vec::len)
            .ok_or(StoreError::NotFound(key))
    }

    fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.used())
    }

    fn max_entry_size(&self) -> usize {
        self.max_entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_returns_same_bytes() {
        let mut store = MemoryStore::new(1024, 256);
        assert_eq!(store.write(StorageKey::BytecodeSlot1, b"abc"), Ok(3));

        let mut buf = [0u8; 8];
        assert_eq!(store.read(StorageKey::BytecodeSlot1, &mut buf), Ok(3));
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(store.data_length(StorageKey::BytecodeSlot1), Ok(3));
    }

    #[test]
    fn write_replaces_previous_value() {
        let mut store = MemoryStore::new(1024, 256);
        store.write(StorageKey::BytecodeSlot2, &[1; 100]).unwrap();
        store.write(StorageKey::BytecodeSlot2, &[2; 10]).unwrap();
        assert_eq!(store.data_length(StorageKey::BytecodeSlot2), Ok(10));
        assert_eq!(store.free_space(), 1014);
    }

    #[test]
    fn read_into_short_buffer_leaves_buffer_untouched() {
        let mut store = MemoryStore::new(1024, 256);
        store.write(StorageKey::BytecodeSlot1, &[7; 16]).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(
            store.read(StorageKey::BytecodeSlot1, &mut buf),
            Err(StoreError::BufferTooSmall {
                needed: 16,
                capacity: 8
            })
        );
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn oversized_and_out_of_space_writes_are_rejected() {
        let mut store = MemoryStore::new(300, 200);
        assert_eq!(
            store.write(StorageKey::BytecodeSlot1, &[0; 201]),
            Err(StoreError::EntryTooLarge { size: 201, max: 200 })
        );
        store.write(StorageKey::BytecodeSlot1, &[0; 200]).unwrap();
        assert_eq!(
            store.write(StorageKey::BytecodeSlot2, &[0; 150]),
            Err(StoreError::OutOfSpace {
                needed: 150,
                free: 100
            })
        );
    }

    #[test]
    fn delete_missing_key_reports_not_found() {
        let mut store = MemoryStore::new(64, 64);
        assert_eq!(
            store.delete(StorageKey::BytecodeSlot1),
            Err(StoreError::NotFound(StorageKey::BytecodeSlot1))
        );
    }

    #[test]
    fn write_budget_fails_later_writes() {
        let mut store = MemoryStore::new(64, 64).fail_writes_after(1);
        assert!(store.write(StorageKey::BytecodeSlot1, b"ok").is_ok());
        assert!(matches!(
            store.write(StorageKey::BytecodeSlot1, b"no"),
            Err(StoreError::Backend(_))
        ));
        assert_eq!(store.data_length(StorageKey::BytecodeSlot1), Ok(2));
    }
}

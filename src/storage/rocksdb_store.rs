//! RocksDB-backed slot store.
//!
//! Each [`StorageKey`] maps to one row of the default column family. Writes and
//! deletes are synced to disk before returning so a power loss never leaves a
//! half-written program behind. The store enforces a fixed capacity across all
//! keys to mirror the flash partition of the device.

use crate::storage::slot_store::{SlotStore, StorageKey, StoreError};
use crate::{debug, info};
use rocksdb::{DB, Options, WriteOptions};
use std::path::Path;

/// Durable [`SlotStore`] backed by a RocksDB database directory.
pub struct RocksDbSlotStore {
    db: DB,
    capacity: usize,
    max_entry: usize,
}

impl From<rocksdb::Error> for StoreError {
    fn from(err: rocksdb::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl RocksDbSlotStore {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: &Path, capacity: usize, max_entry: usize) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;

        let store = Self {
            db,
            capacity,
            max_entry,
        };
        info!(
            "Slot store opened at {} ({} bytes used of {})",
            path.display(),
            store.used(),
            capacity
        );
        Ok(store)
    }

    fn sync_writes() -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        opts
    }

    fn stored_len(&self, key: StorageKey) -> usize {
        match self.db.get_pinned(key.as_bytes()) {
            Ok(Some(value)) => value.len(),
            _ => 0,
        }
    }

    fn used(&self) -> usize {
        StorageKey::ALL.iter().map(|key| self.stored_len(*key)).sum()
    }
}

impl SlotStore for RocksDbSlotStore {
    fn read(&self, key: StorageKey, buf: &mut [u8]) -> Result<usize, StoreError> {
        let value = self
            .db
            .get_pinned(key.as_bytes())?
            .ok_or(StoreError::NotFound(key))?;
        if value.len() > buf.len() {
            return Err(StoreError::BufferTooSmall {
                needed: value.len(),
                capacity: buf.len(),
            });
        }
        buf[..value.len()].copy_from_slice(&value);
        Ok(value.len())
    }

    fn write(&mut self, key: StorageKey, data: &[u8]) -> Result<usize, StoreError> {
        if data.len() > self.max_entry {
            return Err(StoreError::EntryTooLarge {
                size: data.len(),
                max: self.max_entry,
            });
        }
        let free = self.free_space() + self.stored_len(key);
        if data.len() > free {
            return Err(StoreError::OutOfSpace {
                needed: data.len(),
                free,
            });
        }
        self.db
            .put_opt(key.as_bytes(), data, &Self::sync_writes())?;
        debug!("Wrote {} bytes to {}", data.len(), key);
        Ok(data.len())
    }

    fn delete(&mut self, key: StorageKey) -> Result<(), StoreError> {
        if self.db.get_pinned(key.as_bytes())?.is_none() {
            return Err(StoreError::NotFound(key));
        }
        self.db.delete_opt(key.as_bytes(), &Self::sync_writes())?;
        debug!("Deleted {}", key);
        Ok(())
    }

    fn data_length(&self, key: StorageKey) -> Result<usize, StoreError> {
        self.db
            .get_pinned(key.as_bytes())?
            .map(|value| value.len())
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

    fn open_store(dir: &Path) -> RocksDbSlotStore {
        RocksDbSlotStore::open(dir, 8192, 4096).expect("failed to open slot store")
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        {
            let mut store = open_store(dir.path());
            store.write(StorageKey::BytecodeSlot2, &[9; 120]).unwrap();
        }

        let store = open_store(dir.path());
        let mut buf = vec![0u8; 4096];
        assert_eq!(store.read(StorageKey::BytecodeSlot2, &mut buf), Ok(120));
        assert!(buf[..120].iter().all(|b| *b == 9));
        assert_eq!(store.free_space(), 8192 - 120);
    }

    #[test]
    fn delete_removes_entry_and_reports_missing() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut store = open_store(dir.path());
        store.write(StorageKey::BytecodeSlot1, b"program").unwrap();

        assert_eq!(store.delete(StorageKey::BytecodeSlot1), Ok(()));
        assert_eq!(
            store.data_length(StorageKey::BytecodeSlot1),
            Err(StoreError::NotFound(StorageKey::BytecodeSlot1))
        );
        assert_eq!(
            store.delete(StorageKey::BytecodeSlot1),
            Err(StoreError::NotFound(StorageKey::BytecodeSlot1))
        );
    }

    #[test]
    fn entry_limit_is_enforced() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut store = open_store(dir.path());
        assert_eq!(
            store.write(StorageKey::BytecodeSlot1, &vec![0; 4097]),
            Err(StoreError::EntryTooLarge {
                size: 4097,
                max: 4096
            })
        );
        assert_eq!(store.free_space(), 8192);
    }

    #[test]
    fn capacity_is_shared_between_keys() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut store = RocksDbSlotStore::open(dir.path(), 5000, 4096).unwrap();
        store.write(StorageKey::BytecodeSlot1, &vec![1; 4000]).unwrap();
        assert_eq!(
            store.write(StorageKey::BytecodeSlot2, &vec![2; 1001]),
            Err(StoreError::OutOfSpace {
                needed: 1001,
                free: 1000
            })
        );
        // Replacing an entry may reuse its own space.
        assert_eq!(store.write(StorageKey::BytecodeSlot1, &vec![3; 4096]), Ok(4096));
    }
}

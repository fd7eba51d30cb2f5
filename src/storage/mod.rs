//! Persistent program storage.
//!
//! This module provides the slot store abstraction and the layers built on it:
//!
//! - [`slot_store`]: Core [`SlotStore`](slot_store::SlotStore) trait and storage keys
//! - [`memory_store`]: In-memory implementation for tests and `--in-memory` devices
//! - [`rocksdb_store`]: Durable RocksDB-backed implementation
//! - [`shared`]: [`SharedStore`](shared::SharedStore), the storage lock around a store
//! - [`bytecode_slots`]: Slot manager with factory-default fallback
//! - [`factory`]: Factory default programs

pub mod bytecode_slots;
pub mod factory;
pub mod memory_store;
pub mod rocksdb_store;
pub mod shared;
pub mod slot_store;

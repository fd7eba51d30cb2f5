//! Device configuration: compile-time limits and the runtime [`DeviceConfig`].

use fs2::FileExt;
use std::fs::{self, File};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest program accepted into a slot.
pub const MAX_BYTECODE_SIZE: usize = 4096;
/// Size of the interpreter heap arena, allocated once at supervisor init.
pub const HEAP_SIZE: usize = 15 * 1024;
/// Total bytes available to the slot store across both slots.
pub const STORE_CAPACITY: usize = 2 * MAX_BYTECODE_SIZE;
/// Period of the interpreter tick source.
pub const TICK_PERIOD: Duration = Duration::from_millis(1);
/// Ticks a task may run before yielding to a peer of equal priority.
pub const TIMESLICE_TICKS: u64 = 10;
/// Instructions a task may execute before the scheduler re-evaluates.
pub const INSTRUCTIONS_PER_SLICE: usize = 1000;

/// Bound on acquiring the restart lock for a remote reload.
pub const RESTART_LOCK_TIMEOUT: Duration = Duration::from_millis(1000);
/// Bound on acquiring the restart lock from a running script.
pub const FREEZE_LOCK_TIMEOUT: Duration = Duration::from_millis(1);
/// Bound on acquiring the storage lock for ordinary reads and writes.
pub const STORAGE_LOCK_TIMEOUT: Duration = Duration::from_millis(500);
/// Pause before booting again once every task has halted.
pub const IDLE_BACKOFF: Duration = Duration::from_millis(100);

/// Attempts made to quiesce storage before a warm reboot.
pub const REBOOT_ATTEMPTS: u32 = 10;
/// Bound on each storage-lock attempt during reboot.
pub const REBOOT_LOCK_TIMEOUT: Duration = Duration::from_millis(100);
/// Time granted to a warm reboot request before the next attempt.
pub const REBOOT_SETTLE: Duration = Duration::from_millis(100);

/// Pixels on the RGB strip.
pub const STRIP_PIXELS: usize = 8;
/// Size of the buffer the advertised device name is formatted into.
pub const DEVICE_NAME_SIZE: usize = 32;
/// Capacity of the deployment event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 32;
/// Capacity of the queue carrying device status texts to the peer.
pub const STATUS_QUEUE_CAPACITY: usize = 16;
/// MTU reported by the simulated link once a peer is connected.
pub const NEGOTIATED_MTU: u16 = 247;
/// Base of the advertised device name.
pub const DEFAULT_BASE_NAME: &str = "SlotVM";

/// Runtime configuration of a simulated device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Base of the advertised name; the identity suffix is appended.
    pub base_name: String,
    /// Hardware identifier the name suffix is derived from.
    pub device_id: [u8; 8],
    /// Directory holding the slot store; `None` uses the default location.
    pub data_dir: Option<PathBuf>,
    /// Address the deployment channel listens on.
    pub listen_addr: SocketAddr,
    /// Keep programs in memory only.
    pub in_memory: bool,
    pub heap_size: usize,
    pub idle_backoff: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            base_name: DEFAULT_BASE_NAME.to_string(),
            device_id: [0; 8],
            data_dir: None,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 4300)),
            in_memory: false,
            heap_size: HEAP_SIZE,
            idle_backoff: IDLE_BACKOFF,
        }
    }
}

impl DeviceConfig {
    /// Resolves the data directory: explicit setting, then `SLOTVM_DATA_DIR`,
    /// then `~/.slotvm/<device_name>/`. Creates it if missing.
    pub fn resolve_data_dir(&self, device_name: &str) -> io::Result<PathBuf> {
        let dir = match (&self.data_dir, std::env::var_os("SLOTVM_DATA_DIR")) {
            (Some(dir), _) => dir.clone(),
            (None, Some(env_dir)) => PathBuf::from(env_dir).join(device_name),
            (None, None) => dirs::home_dir()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "home directory not found"))?
                .join(".slotvm")
                .join(device_name),
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// Acquires an exclusive lock on a device data directory.
///
/// The lock lives as long as the returned `File`. Fails if another process
/// already runs a device on the same directory.
pub fn acquire_data_dir_lock(dir: &Path) -> io::Result<File> {
    let lock_path = dir.join(".lock");
    let lock_file = File::create(&lock_path)?;
    lock_file.try_lock_exclusive().map_err(|_| {
        io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("device data directory in use (lock held: {})", lock_path.display()),
        )
    })?;
    Ok(lock_file)
}

/// Derives a hardware id from the host machine id, or zeros if unavailable.
pub fn detect_device_id() -> [u8; 8] {
    fs::read_to_string("/etc/machine-id")
        .ok()
        .and_then(|text| parse_device_id(text.trim()))
        .unwrap_or([0; 8])
}

/// Parses the first 16 hex digits of `text` into an 8-byte id.
pub fn parse_device_id(text: &str) -> Option<[u8; 8]> {
    let digits = text.get(..16).filter(|d| d.is_ascii())?;
    let mut id = [0u8; 8];
    for (i, byte) in id.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_device_id_reads_leading_hex() {
        assert_eq!(
            parse_device_id("0001020304050607ffee"),
            Some([0, 1, 2, 3, 4, 5, 6, 7])
        );
        assert_eq!(parse_device_id("00010203"), None);
        assert_eq!(parse_device_id("zz01020304050607"), None);
    }

    #[test]
    fn explicit_data_dir_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DeviceConfig {
            data_dir: Some(tmp.path().join("nested").join("dev")),
            ..DeviceConfig::default()
        };
        let dir = config.resolve_data_dir("SlotVM_51F1").unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn data_dir_lock_is_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let _held = acquire_data_dir_lock(tmp.path()).unwrap();
        let second = acquire_data_dir_lock(tmp.path());
        assert_eq!(second.unwrap_err().kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn defaults_match_device_limits() {
        let config = DeviceConfig::default();
        assert_eq!(config.heap_size, 15 * 1024);
        assert_eq!(config.idle_backoff, Duration::from_millis(100));
        assert!(STORE_CAPACITY >= 2 * MAX_BYTECODE_SIZE);
    }
}

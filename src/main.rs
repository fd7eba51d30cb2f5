//! Simulated script-slot device.
//!
//! Runs the firmware of one device in a host process: the slot store, the
//! supervised VM and the deployment channel (over TCP instead of a radio).
//!
//! # Usage
//! ```text
//! slotvm [OPTIONS]
//! ```
//!
//! # Options
//! - `--name <base>`: Base of the advertised name (defaults to `SlotVM`)
//! - `--listen <addr>`: Address the deployment channel binds
//! - `--data-dir <dir>`: Slot store directory
//! - `--in-memory`: Keep programs in memory only
//! - `--device-id <hex>`: Hardware id (16 hex digits)
//! - `--factory-reset`: Erase both slots before booting
//! - `--log <level>`: Lowest log level written out
//!
//! # Console
//! While running, stdin accepts `press <pin>`, `release <pin>`, `pins`,
//! `strip`, `tasks`, `reload` and `quit`.

use slotvm::api::HostEnv;
use slotvm::config::{
    DEVICE_NAME_SIZE, DeviceConfig, EVENT_QUEUE_CAPACITY, MAX_BYTECODE_SIZE,
    NEGOTIATED_MTU, STORE_CAPACITY, acquire_data_dir_lock, detect_device_id, parse_device_id,
};
use slotvm::core::device::Device;
use slotvm::core::identity::device_name;
use slotvm::core::reboot::ProcessReboot;
use slotvm::core::supervisor::SupervisorHandle;
use slotvm::drivers::gpio::Pin;
use slotvm::network::tcp_channel::TcpChannel;
use slotvm::storage::bytecode_slots::SlotManager;
use slotvm::storage::memory_store::MemoryStore;
use slotvm::storage::rocksdb_store::RocksDbSlotStore;
use slotvm::storage::shared::SharedStore;
use slotvm::utils::log::{self, Level};
use slotvm::{info, warn};
use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tokio::task;

#[tokio::main]
async fn main() {
    log::init_from_env();
    let args: Vec<String> = env::args().collect();

    let mut config = DeviceConfig::default();
    let mut device_id: Option<[u8; 8]> = None;
    let mut factory_reset = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_usage(&args[0]);
                process::exit(0);
            }
            "--name" => {
                config.base_name = option_value(&args, &mut i).to_string();
            }
            "--listen" => {
                let value = option_value(&args, &mut i);
                config.listen_addr = match value.parse() {
                    Ok(addr) => addr,
                    Err(_) => {
                        eprintln!("Invalid listen address: {}", value);
                        process::exit(1);
                    }
                };
            }
            "--data-dir" => {
                config.data_dir = Some(PathBuf::from(option_value(&args, &mut i)));
            }
            "--in-memory" => {
                config.in_memory = true;
                i += 1;
            }
            "--device-id" => {
                let value = option_value(&args, &mut i);
                device_id = match parse_device_id(value) {
                    Some(id) => Some(id),
                    None => {
                        eprintln!("Invalid device id (expected 16 hex digits): {}", value);
                        process::exit(1);
                    }
                };
            }
            "--factory-reset" => {
                factory_reset = true;
                i += 1;
            }
            "--log" => {
                let value = option_value(&args, &mut i);
                match Level::parse(value) {
                    Some(level) => log::set_min_level(level),
                    None => {
                        eprintln!("Unknown log level: {}", value);
                        process::exit(1);
                    }
                }
            }
            other => {
                eprintln!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    config.device_id = device_id.unwrap_or_else(detect_device_id);
    let name = device_name(&config.base_name, &config.device_id, DEVICE_NAME_SIZE);

    // The directory lock is held for the lifetime of the process.
    let (store, _dir_lock) = if config.in_memory {
        (SharedStore::new(MemoryStore::new(STORE_CAPACITY, MAX_BYTECODE_SIZE)), None)
    } else {
        let dir = match config.resolve_data_dir(&name) {
            Ok(dir) => dir,
            Err(e) => {
                eprintln!("Failed to prepare data directory: {}", e);
                process::exit(1);
            }
        };
        let lock = match acquire_data_dir_lock(&dir) {
            Ok(lock) => lock,
            Err(e) => {
                eprintln!("{}", e);
                process::exit(1);
            }
        };
        match RocksDbSlotStore::open(&dir.join("slots"), STORE_CAPACITY, MAX_BYTECODE_SIZE) {
            Ok(store) => (SharedStore::new(store), Some(lock)),
            Err(e) => {
                eprintln!("Failed to open slot store: {}", e);
                process::exit(1);
            }
        }
    };

    if factory_reset {
        if let Err(e) = SlotManager::new(store.clone()).factory_reset() {
            eprintln!("Factory reset failed: {}", e);
            process::exit(1);
        }
        info!("Factory reset: both slots erased");
    }

    let channel = match TcpChannel::start(config.listen_addr, NEGOTIATED_MTU, EVENT_QUEUE_CAPACITY).await {
        Ok(channel) => channel,
        Err(e) => {
            eprintln!("Failed to start deployment channel: {}", e);
            process::exit(1);
        }
    };

    let device = match Device::boot(&config, store, channel, Arc::new(ProcessReboot)) {
        Ok(device) => device,
        Err(e) => {
            eprintln!("Failed to boot device: {}", e);
            process::exit(1);
        }
    };

    let shutdown = Arc::new(Notify::new());
    tokio::spawn(run_console(
        device.host().clone(),
        device.supervisor(),
        shutdown.clone(),
    ));

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received, shutting down..."),
            Err(e) => eprintln!("Failed to setup Ctrl+C handler: {}", e),
        }
        ctrl_c.notify_one();
    });

    let stop = shutdown.clone();
    match device.run(async move { stop.notified().await }).await {
        Ok(state) => info!("VM supervisor ended in state {state}"),
        Err(e) => {
            eprintln!("Device stopped with an error: {}", e);
            process::exit(1);
        }
    }
}

/// Returns the argument following the option at `i` and advances past both.
fn option_value<'a>(args: &'a [String], i: &mut usize) -> &'a str {
    let option = &args[*i];
    *i += 1;
    if *i >= args.len() {
        eprintln!("{option} requires an argument");
        process::exit(1);
    }
    let value = &args[*i];
    *i += 1;
    value
}

/// Reads operator commands from stdin until EOF or `quit`.
async fn run_console(host: Arc<HostEnv>, supervisor: SupervisorHandle, shutdown: Arc<Notify>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => {}
            [action @ ("press" | "release"), pin] => {
                let Some(pin) = Pin::from_symbol(pin) else {
                    warn!("Unknown pin: {pin}");
                    continue;
                };
                let result = if *action == "press" {
                    host.gpio.press(pin)
                } else {
                    host.gpio.release(pin)
                };
                if let Err(e) = result {
                    warn!("{e}");
                }
            }
            ["pins"] => {
                let levels: Vec<String> = Pin::ALL
                    .iter()
                    .map(|pin| format!("{pin}={}", if host.gpio.get(*pin) { "on" } else { "off" }))
                    .collect();
                info!("{}", levels.join(" "));
            }
            ["strip"] => {
                let pixels: Vec<String> = host.strip.pixels().iter().map(ToString::to_string).collect();
                info!("{}", pixels.join(" "));
            }
            ["tasks"] => match supervisor.tasks() {
                Some(tasks) => {
                    info!("VM {} with {} task(s)", supervisor.state(), tasks.len());
                    for t in tasks {
                        info!("  {} {} (priority {}): {:?}", t.id, t.name, t.priority, t.state);
                    }
                }
                None => warn!("VM {} is busy, task table unavailable", supervisor.state()),
            },
            ["reload"] => {
                let handle = supervisor.clone();
                match task::spawn_blocking(move || handle.restart()).await {
                    Ok(Ok(torn_down)) => info!("Reloaded ({torn_down} task(s) stopped)"),
                    Ok(Err(e)) => warn!("Reload refused: {e}"),
                    Err(e) => warn!("Reload failed: {e}"),
                }
            }
            ["quit"] => {
                shutdown.notify_one();
                return;
            }
            _ => warn!("Unknown command: {line} (try press, release, pins, strip, tasks, reload, quit)"),
        }
    }
}

const USAGE: &str = "\
Script Slot Device Simulator

USAGE:
    {program} [OPTIONS]

OPTIONS:
    --name <base>         Base of the advertised name (default: SlotVM)
    --listen <addr>       Deployment channel address (default: 127.0.0.1:4300)
    --data-dir <dir>      Slot store directory
    --in-memory           Keep programs in memory only
    --device-id <hex>     Hardware id as 16 hex digits (default: from /etc/machine-id)
    --factory-reset       Erase both slots before booting
    --log <level>         debug, info, warn or error
    -h, --help            Print this help message

ENVIRONMENT:
    SLOTVM_DATA_DIR    Parent directory for device data directories
    SLOTVM_LOG         Lowest log level written out

CONSOLE:
    press <pin>, release <pin>    Drive sw1 or sw2
    pins                          Show every pin level
    strip                         Show the RGB strip colours
    tasks                         Show the running tasks
    reload                        Restart the VM with the stored programs
    quit                          Shut down

EXIT CODES:
    3    warm reboot requested
    4    cold reboot requested

EXAMPLES:
    # Run a device with a fixed id
    {program} --device-id 0001020304050607

    # Two devices on the same machine
    {program} --listen 127.0.0.1:4300 --name bench-a
    {program} --listen 127.0.0.1:4301 --name bench-b --in-memory

FILES:
    ~/.slotvm/<device_name>/slots/
    ~/.slotvm/<device_name>/.lock
";

/// Prints usage information to stderr.
fn print_usage(program: &str) {
    eprintln!("{}", USAGE.replace("{program}", program));
}

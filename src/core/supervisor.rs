//! VM supervisor: owns the interpreter lifecycle.
//!
//! A dedicated thread runs boot cycles back to back. Each cycle opens a fresh
//! [`Vm`] on the preallocated heap, loads both slots through the slot manager
//! (stored program or factory default), creates one task per slot and runs
//! the scheduler until every task is gone. A restart tears the task set down
//! under the restart lock; the thread notices, drops the instance and boots
//! again, now picking up whatever was stored in the meantime.

use crate::api::{self, HostEnv};
use crate::config::{IDLE_BACKOFF, HEAP_SIZE, MAX_BYTECODE_SIZE, RESTART_LOCK_TIMEOUT, TICK_PERIOD};
use crate::core::restart_lock::{FreezeGuard, RestartLock};
use crate::storage::bytecode_slots::{ProgramSource, Slot, SlotManager};
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::tick::TickSource;
use crate::virtual_machine::vm::{Heap, RunExit, TaskInfo, Vm, VmCore};
use crate::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use slotvm_derive::Error;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::Sender;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SupervisorState {
    Booting = 0,
    Running = 1,
    Restarting = 2,
    ShuttingDown = 3,
}

impl SupervisorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SupervisorState::Booting,
            1 => SupervisorState::Running,
            2 => SupervisorState::Restarting,
            _ => SupervisorState::ShuttingDown,
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Booting => "booting",
            SupervisorState::Running => "running",
            SupervisorState::Restarting => "restarting",
            SupervisorState::ShuttingDown => "shutting down",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
    #[error("cannot allocate the {0} byte VM heap")]
    HeapAllocation(usize),

    #[error("a restart is already in progress")]
    RestartBusy,

    #[error("VM freeze request timed out")]
    Busy,

    #[error("VM teardown failed: {0}")]
    Teardown(#[from] VMError),

    #[error("cannot spawn the supervisor thread: {0}")]
    Spawn(String),

    #[error("the supervisor is shutting down")]
    ShuttingDown,
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub heap_size: usize,
    /// Size of each per-slot load buffer.
    pub load_buffer_size: usize,
    /// Pause before booting again once every task has ended by itself.
    pub idle_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heap_size: HEAP_SIZE,
            load_buffer_size: MAX_BYTECODE_SIZE,
            idle_backoff: IDLE_BACKOFF,
        }
    }
}

/// What a boot cycle loaded into one slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotReport {
    pub slot: Slot,
    pub length: usize,
    pub source: ProgramSource,
    pub task_created: bool,
}

/// Result of one boot cycle, numbered from 1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootReport {
    pub generation: u64,
    pub programs: Vec<SlotReport>,
}

impl BootReport {
    pub fn slot(&self, slot: Slot) -> Option<&SlotReport> {
        self.programs.iter().find(|p| p.slot == slot)
    }

    pub fn tasks_created(&self) -> usize {
        self.programs.iter().filter(|p| p.task_created).count()
    }
}

struct Shared {
    core: Arc<VmCore>,
    restart_lock: RestartLock,
    state: AtomicU8,
    shutdown: AtomicBool,
    boot: Mutex<Option<BootReport>>,
    booted: Condvar,
}

impl Shared {
    fn set_state(&self, state: SupervisorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> SupervisorState {
        SupervisorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn publish(&self, report: BootReport) {
        *self.boot.lock() = Some(report);
        self.booted.notify_all();
    }
}

/// Owner of the supervisor thread.
pub struct VmSupervisor {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

/// Cloneable control surface of a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    shared: Arc<Shared>,
}

impl VmSupervisor {
    /// Allocates the heap arena and load buffers, then starts booting.
    ///
    /// Status texts for the deployment peer are sent on `status` when given;
    /// they are dropped if the queue is full.
    pub fn init(
        config: SupervisorConfig,
        slots: SlotManager,
        host: Arc<HostEnv>,
        status: Option<Sender<String>>,
    ) -> Result<Self, SupervisorError> {
        let heap = Heap::allocate(config.heap_size)
            .map_err(|_| SupervisorError::HeapAllocation(config.heap_size))?;
        let mut buffers = Vec::with_capacity(Slot::ALL.len());
        for _ in Slot::ALL {
            buffers.push(allocate_buffer(config.load_buffer_size)?);
        }

        let shared = Arc::new(Shared {
            core: Arc::new(VmCore::new()),
            restart_lock: host.restart_lock.clone(),
            state: AtomicU8::new(SupervisorState::Booting as u8),
            shutdown: AtomicBool::new(false),
            boot: Mutex::new(None),
            booted: Condvar::new(),
        });

        let boot_loop = BootLoop {
            heap,
            buffers,
            slots,
            host,
            status,
            idle_backoff: config.idle_backoff,
            shared: Arc::clone(&shared),
        };
        let thread = thread::Builder::new()
            .name("vm-supervisor".into())
            .spawn(move || boot_loop.run())
            .map_err(|e| SupervisorError::Spawn(e.to_string()))?;

        info!(
            "VM supervisor started ({} byte heap, {} byte load buffers)",
            config.heap_size, config.load_buffer_size
        );
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stops the VM for good and joins the supervisor thread.
    pub fn shutdown(mut self) -> SupervisorState {
        self.stop();
        self.shared.state()
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        info!("Shutting down the VM supervisor");

        let guard = self.shared.restart_lock.acquire(RESTART_LOCK_TIMEOUT);
        if guard.is_none() {
            warn!("Restart lock still held, shutting down anyway");
        }
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.set_state(SupervisorState::ShuttingDown);
        self.shared.core.halt();
        if let Err(e) = self.shared.core.teardown(RESTART_LOCK_TIMEOUT) {
            warn!("VM teardown during shutdown failed: {e}");
        }
        drop(guard);

        if thread.join().is_err() {
            error!("VM supervisor thread panicked");
        }
        self.shared.set_state(SupervisorState::ShuttingDown);
    }
}

impl Drop for VmSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SupervisorHandle {
    /// Tears down every task so the supervisor boots a fresh VM instance.
    ///
    /// Returns the number of tasks deleted. Fails with
    /// [`SupervisorError::RestartBusy`] when the restart lock cannot be taken
    /// in time; the running VM is left untouched then.
    pub fn restart(&self) -> Result<usize, SupervisorError> {
        if self.shared.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }
        let _guard = self
            .shared
            .restart_lock
            .acquire(RESTART_LOCK_TIMEOUT)
            .ok_or(SupervisorError::RestartBusy)?;

        let deleted = self.shared.core.teardown(RESTART_LOCK_TIMEOUT)?;
        self.shared.set_state(SupervisorState::Restarting);
        info!("VM restart: {deleted} task(s) deleted");
        Ok(deleted)
    }

    /// Holds off restarts until the returned guard is dropped.
    pub fn freeze(&self, timeout: Duration) -> Result<FreezeGuard, SupervisorError> {
        self.shared
            .restart_lock
            .acquire(timeout)
            .ok_or(SupervisorError::Busy)
    }

    pub fn state(&self) -> SupervisorState {
        self.shared.state()
    }

    /// Tasks installed on the running instance, `None` if the scheduler held on to them.
    pub fn live_tasks(&self) -> Option<usize> {
        self.shared.core.live_tasks(RESTART_LOCK_TIMEOUT)
    }

    pub fn tasks(&self) -> Option<Vec<TaskInfo>> {
        self.shared.core.snapshot(RESTART_LOCK_TIMEOUT)
    }

    pub fn last_boot(&self) -> Option<BootReport> {
        self.shared.boot.lock().clone()
    }

    /// Waits for a boot cycle newer than `after_generation`.
    pub fn wait_for_boot(&self, after_generation: u64, timeout: Duration) -> Option<BootReport> {
        let deadline = Instant::now() + timeout;
        let mut boot = self.shared.boot.lock();
        loop {
            if let Some(report) = boot.as_ref()
                && report.generation > after_generation
            {
                return Some(report.clone());
            }
            if self.shared.booted.wait_until(&mut boot, deadline).timed_out() {
                return boot
                    .as_ref()
                    .filter(|report| report.generation > after_generation)
                    .cloned();
            }
        }
    }
}

fn allocate_buffer(size: usize) -> Result<Vec<u8>, SupervisorError> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(size)
        .map_err(|_| SupervisorError::HeapAllocation(size))?;
    buffer.resize(size, 0);
    Ok(buffer)
}

/// State owned by the supervisor thread.
struct BootLoop {
    heap: Heap,
    buffers: Vec<Vec<u8>>,
    slots: SlotManager,
    host: Arc<HostEnv>,
    status: Option<Sender<String>>,
    idle_backoff: Duration,
    shared: Arc<Shared>,
}

impl BootLoop {
    fn run(mut self) {
        let mut generation = 0;
        while !self.shared.is_shutting_down() && !self.shared.core.is_halted() {
            generation += 1;
            self.shared.set_state(SupervisorState::Booting);
            let exit = self.boot_cycle(generation);

            if self.shared.is_shutting_down() || self.shared.core.is_halted() {
                break;
            }
            match exit {
                RunExit::Restart => self.shared.set_state(SupervisorState::Restarting),
                RunExit::Idle => {
                    debug!("All tasks ended, booting again in {:?}", self.idle_backoff);
                    self.idle_wait();
                }
            }
        }
        self.shared.set_state(SupervisorState::ShuttingDown);
        debug!("VM supervisor thread exiting after {generation} boot(s)");
    }

    fn boot_cycle(&mut self, generation: u64) -> RunExit {
        let started = Instant::now();
        let core = Arc::clone(&self.shared.core);
        core.begin_boot();
        if self.shared.is_shutting_down() {
            return RunExit::Restart;
        }

        let mut vm = Vm::open(&mut self.heap, Arc::clone(&core), Arc::clone(&self.host));
        if let Err(e) = api::define_all(&mut vm) {
            error!("Registering host classes failed: {e}");
        }

        let mut programs = Vec::with_capacity(Slot::ALL.len());
        for (slot, buffer) in Slot::ALL.into_iter().zip(self.buffers.iter_mut()) {
            programs.push(load_slot(&mut vm, &self.slots, slot, buffer));
        }
        let report = BootReport {
            generation,
            programs,
        };
        info!(
            "Boot #{generation}: {} task(s) created ({})",
            report.tasks_created(),
            describe(&report)
        );
        self.shared.publish(report);
        send_status(&self.status, format!("Blinked ({} ms)\n", started.elapsed().as_millis()));

        let mut ticks = match TickSource::start(Arc::clone(&core), TICK_PERIOD) {
            Ok(ticks) => ticks,
            Err(e) => {
                error!("Cannot start the tick source: {e}");
                return RunExit::Idle;
            }
        };
        self.shared.set_state(SupervisorState::Running);
        let running = Instant::now();
        let exit = vm.run();
        ticks.stop();
        drop(vm);

        send_status(
            &self.status,
            format!(
                "VM stopped (uptime: {} ms)\n",
                running.elapsed().as_millis()
            ),
        );
        exit
    }

    /// Waits out the idle backoff unless a restart or shutdown comes first.
    fn idle_wait(&self) {
        let deadline = Instant::now() + self.idle_backoff;
        while Instant::now() < deadline {
            if self.shared.is_shutting_down() || self.shared.core.restart_pending() {
                return;
            }
            thread::sleep(TICK_PERIOD);
        }
    }
}

fn send_status(status: &Option<Sender<String>>, text: String) {
    if let Some(status) = status
        && status.try_send(text).is_err()
    {
        debug!("Status text dropped, queue full or closed");
    }
}

/// Loads one slot and creates its task.
///
/// A stored program that fails validation is not replaced by the factory
/// default; the slot simply has no task until the next store.
fn load_slot(vm: &mut Vm<'_>, slots: &SlotManager, slot: Slot, buffer: &mut [u8]) -> SlotReport {
    let (length, source) = slots.load_traced(slot, buffer);
    let task_created = length > 0
        && match vm.create_task(slot.name(), &buffer[..length], slot.priority()) {
            Ok(_) => true,
            Err(e) => {
                error!("{slot}: cannot create a task for the {source} program: {e}");
                false
            }
        };

    SlotReport {
        slot,
        length,
        source,
        task_created,
    }
}

fn describe(report: &BootReport) -> String {
    report
        .programs
        .iter()
        .map(|p| format!("{}: {} bytes, {}", p.slot, p.length, p.source))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::gpio::Pin;
    use crate::storage::factory::default_program;
    use crate::storage::memory_store::MemoryStore;
    use crate::storage::shared::SharedStore;
    use crate::storage::slot_store::StorageKey;
    use crate::utils::test_utils::utils::{assemble, host_env, slot_manager, wait_until};
    use tokio::sync::mpsc;

    const BOOT: Duration = Duration::from_secs(5);

    fn start(slots: SlotManager) -> (VmSupervisor, Arc<HostEnv>) {
        let host = host_env();
        let supervisor =
            VmSupervisor::init(SupervisorConfig::default(), slots, Arc::clone(&host), None).unwrap();
        (supervisor, host)
    }

    #[test]
    fn first_boot_runs_factory_defaults() {
        let (supervisor, _host) = start(slot_manager());
        let report = supervisor.handle().wait_for_boot(0, BOOT).unwrap();

        assert_eq!(report.generation, 1);
        for slot in Slot::ALL {
            let program = report.slot(slot).unwrap();
            assert_eq!(program.source, ProgramSource::FactoryDefault);
            assert_eq!(program.length, default_program(slot).len());
            assert!(program.task_created);
        }
        assert!(wait_until(BOOT, || supervisor.handle().state() == SupervisorState::Running));
        assert_eq!(supervisor.shutdown(), SupervisorState::ShuttingDown);
    }

    #[test]
    fn heap_allocation_failure_is_fatal() {
        let config = SupervisorConfig {
            heap_size: usize::MAX,
            ..SupervisorConfig::default()
        };
        let result = VmSupervisor::init(config, slot_manager(), host_env(), None);
        assert!(matches!(result, Err(SupervisorError::HeapAllocation(usize::MAX))));
    }

    #[test]
    fn restart_picks_up_stored_programs() {
        let slots = slot_manager();
        let (supervisor, host) = start(slots.clone());
        let handle = supervisor.handle();
        handle.wait_for_boot(0, BOOT).unwrap();

        let program = assemble("CALL_HOST r0, \"LED\", \"set\", :led2, true\nloop: SLEEP_MS 10\nJUMP loop");
        slots.store(Slot::Slot2, &program).unwrap();
        assert_eq!(handle.restart(), Ok(2));

        let report = handle.wait_for_boot(1, BOOT).unwrap();
        let slot2 = report.slot(Slot::Slot2).unwrap();
        assert_eq!(slot2.source, ProgramSource::Stored);
        assert_eq!(slot2.length, program.len());
        assert_eq!(report.slot(Slot::Slot1).unwrap().source, ProgramSource::FactoryDefault);
        assert!(wait_until(BOOT, || host.gpio.get(Pin::Led2)));
    }

    #[test]
    fn concurrent_restarts_never_overlap_instances() {
        let (supervisor, _host) = start(slot_manager());
        let handle = supervisor.handle();
        handle.wait_for_boot(0, BOOT).unwrap();

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let handle = handle.clone();
                thread::spawn(move || handle.restart())
            })
            .collect();
        for worker in workers {
            let result = worker.join().unwrap();
            assert!(matches!(result, Ok(_) | Err(SupervisorError::RestartBusy)));
            assert!(handle.live_tasks().unwrap_or(0) <= 2);
        }

        let report = handle.wait_for_boot(1, BOOT).unwrap();
        assert!(report.generation >= 2);
        assert!(wait_until(BOOT, || handle.live_tasks() == Some(2)));
    }

    #[test]
    fn restart_is_busy_while_the_vm_is_frozen() {
        let (supervisor, _host) = start(slot_manager());
        let handle = supervisor.handle();
        handle.wait_for_boot(0, BOOT).unwrap();

        let frozen = handle.freeze(Duration::from_millis(100)).unwrap();
        let contender = handle.clone();
        let result = thread::spawn(move || contender.restart()).join().unwrap();
        assert_eq!(result, Err(SupervisorError::RestartBusy));
        assert_eq!(handle.freeze(Duration::from_millis(1)).err(), Some(SupervisorError::Busy));

        drop(frozen);
        assert_eq!(handle.restart(), Ok(2));
    }

    #[test]
    fn idle_vm_boots_again_after_backoff() {
        let slots = slot_manager();
        for slot in Slot::ALL {
            slots.store(slot, &assemble("PUTS \"done\"")).unwrap();
        }
        let config = SupervisorConfig {
            idle_backoff: Duration::from_millis(20),
            ..SupervisorConfig::default()
        };
        let supervisor = VmSupervisor::init(config, slots, host_env(), None).unwrap();
        let report = supervisor.handle().wait_for_boot(2, BOOT).unwrap();
        assert!(report.generation >= 3);
    }

    #[test]
    fn invalid_stored_program_leaves_the_slot_without_a_task() {
        let slots = slot_manager();
        slots.store(Slot::Slot1, b"not bytecode").unwrap();
        let (supervisor, _host) = start(slots);

        let report = supervisor.handle().wait_for_boot(0, BOOT).unwrap();
        let slot1 = report.slot(Slot::Slot1).unwrap();
        assert_eq!(slot1.source, ProgramSource::Stored);
        assert!(!slot1.task_created);
        assert!(report.slot(Slot::Slot2).unwrap().task_created);
    }

    #[test]
    fn oversized_stored_program_falls_back_to_default() {
        let store = SharedStore::new(MemoryStore::new(16 * 1024, 8 * 1024));
        let slots = SlotManager::new(store.clone());
        {
            let mut guard = store.lock().unwrap();
            guard
                .write(StorageKey::BytecodeSlot1, &vec![0u8; MAX_BYTECODE_SIZE + 1])
                .unwrap();
        }
        let (supervisor, _host) = start(slots);

        let report = supervisor.handle().wait_for_boot(0, BOOT).unwrap();
        let slot1 = report.slot(Slot::Slot1).unwrap();
        assert_eq!(slot1.source, ProgramSource::FactoryDefault);
        assert!(slot1.task_created);
    }

    #[test]
    fn status_texts_report_boot_and_stop() {
        let (tx, mut rx) = mpsc::channel(8);
        let supervisor =
            VmSupervisor::init(SupervisorConfig::default(), slot_manager(), host_env(), Some(tx))
                .unwrap();
        let handle = supervisor.handle();
        handle.wait_for_boot(0, BOOT).unwrap();
        handle.restart().unwrap();
        handle.wait_for_boot(1, BOOT).unwrap();
        drop(supervisor);

        let mut texts = Vec::new();
        while let Ok(text) = rx.try_recv() {
            texts.push(text);
        }
        assert!(texts[0].starts_with("Blinked ("));
        assert!(texts[0].ends_with(" ms)\n"));
        assert!(texts.iter().any(|t| t.starts_with("VM stopped (uptime: ")));
    }

    #[test]
    fn shutdown_rejects_later_restarts() {
        let (supervisor, _host) = start(slot_manager());
        let handle = supervisor.handle();
        handle.wait_for_boot(0, BOOT).unwrap();
        supervisor.shutdown();
        assert_eq!(handle.restart(), Err(SupervisorError::ShuttingDown));
        assert_eq!(handle.state(), SupervisorState::ShuttingDown);
    }

    #[test]
    fn shutdown_right_after_init_never_hangs() {
        for _ in 0..50 {
            let (supervisor, _host) = start(slot_manager());
            let (done, finished) = std::sync::mpsc::channel();
            thread::spawn(move || {
                let _ = done.send(supervisor.shutdown());
            });
            assert_eq!(finished.recv_timeout(BOOT), Ok(SupervisorState::ShuttingDown));
        }
    }

    #[test]
    fn halted_core_stops_the_boot_loop() {
        let (supervisor, _host) = start(slot_manager());
        let handle = supervisor.handle();
        handle.wait_for_boot(0, BOOT).unwrap();

        supervisor.shared.core.halt();
        supervisor.shared.core.begin_boot();
        assert!(wait_until(BOOT, || handle.state() == SupervisorState::ShuttingDown));
        assert_eq!(handle.live_tasks(), Some(0));
        assert_eq!(supervisor.shutdown(), SupervisorState::ShuttingDown);
    }

    #[test]
    fn busy_restart_keeps_the_running_state() {
        let (supervisor, _host) = start(slot_manager());
        let handle = supervisor.handle();
        handle.wait_for_boot(0, BOOT).unwrap();
        assert!(wait_until(BOOT, || handle.state() == SupervisorState::Running));

        let table = supervisor.shared.core.lock_tasks(BOOT).unwrap();
        let contender = handle.clone();
        let result = thread::spawn(move || contender.restart()).join().unwrap();
        drop(table);

        assert_eq!(result, Err(SupervisorError::Teardown(VMError::Busy)));
        assert_eq!(handle.state(), SupervisorState::Running);
    }
}

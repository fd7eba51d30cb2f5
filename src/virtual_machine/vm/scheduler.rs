//! Task table and clock shared between the run loop, the tick source and
//! whoever tears the VM down.
//!
//! The run loop holds the task-table lock while a task executes its slice, so
//! taking that lock suspends scheduling. The tick gate masks the tick source:
//! while it is held, ticks are dropped instead of advancing the clock.

use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::vm::task::{Task, TaskInfo, TaskState};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Tasks installed on the running VM instance.
#[derive(Default)]
pub struct TaskTable {
    tasks: Vec<Task>,
    /// Index of the task that ran last, for round-robin among equal priorities.
    last: Option<usize>,
}

impl TaskTable {
    pub(crate) fn install(&mut self, tasks: impl IntoIterator<Item = Task>) {
        self.tasks.extend(tasks);
        self.last = None;
    }

    /// Deletes every task, releasing any freeze they hold.
    pub(crate) fn clear(&mut self) -> usize {
        let count = self.tasks.len();
        self.tasks.clear();
        self.last = None;
        count
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn any_alive(&self) -> bool {
        self.tasks.iter().any(Task::is_alive)
    }

    pub(crate) fn wake_sleepers(&mut self, now: u64) {
        for task in &mut self.tasks {
            task.wake(now);
        }
    }

    /// Picks the next ready task: highest priority first, round-robin among peers.
    pub(crate) fn pick(&mut self) -> Option<usize> {
        let best = self
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Ready)
            .map(|t| t.priority)
            .min()?;
        let count = self.tasks.len();
        let start = self.last.map_or(0, |last| last + 1);
        let chosen = (0..count)
            .map(|i| (start + i) % count)
            .find(|&i| {
                let task = &self.tasks[i];
                task.priority == best
                    && task.state == TaskState::Ready
            })?;
        self.last = Some(chosen);
        Some(chosen)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Task> {
        self.tasks.get_mut(index)
    }

    pub fn snapshot(&self) -> Vec<TaskInfo> {
        self.tasks.iter().map(Task::snapshot).collect()
    }
}

/// Scheduler state that outlives individual VM instances.
#[derive(Default)]
pub struct VmCore {
    tasks: Mutex<TaskTable>,
    tick_gate: Mutex<()>,
    clock: AtomicU64,
    masked_ticks: AtomicU64,
    restart_pending: AtomicBool,
    halted: AtomicBool,
}

impl VmCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock by one tick unless ticks are masked.
    pub fn tick(&self) -> bool {
        match self.tick_gate.try_lock() {
            Some(_gate) => {
                self.clock.fetch_add(1, Ordering::AcqRel);
                true
            }
            None => {
                self.masked_ticks.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Ticks since the current VM instance booted.
    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    /// Ticks dropped while the tick source was masked.
    pub fn masked_ticks(&self) -> u64 {
        self.masked_ticks.load(Ordering::Relaxed)
    }

    /// Prepares for a new VM instance.
    pub fn begin_boot(&self) {
        self.restart_pending.store(false, Ordering::Release);
        self.clock.store(0, Ordering::Release);
    }

    /// True once a teardown ran on this instance, or for good after [`halt`](Self::halt).
    pub fn restart_pending(&self) -> bool {
        self.restart_pending.load(Ordering::Acquire) || self.is_halted()
    }

    /// Stops every current and future instance; [`begin_boot`](Self::begin_boot)
    /// does not clear it.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Deletes every task of the running instance.
    ///
    /// Masks the tick source and suspends scheduling for the duration, and
    /// makes the run loop return [`RunExit::Restart`](super::RunExit::Restart).
    /// Each lock is bounded by `timeout`.
    pub fn teardown(&self, timeout: Duration) -> Result<usize, VMError> {
        let _mask = self.tick_gate.try_lock_for(timeout).ok_or(VMError::Busy)?;
        let mut tasks = self.tasks.try_lock_for(timeout).ok_or(VMError::Busy)?;
        self.restart_pending.store(true, Ordering::Release);
        Ok(tasks.clear())
    }

    pub(crate) fn lock_tasks(&self, timeout: Duration) -> Option<MutexGuard<'_, TaskTable>> {
        self.tasks.try_lock_for(timeout)
    }

    /// Number of tasks installed, or `None` if the table stayed locked.
    pub fn live_tasks(&self, timeout: Duration) -> Option<usize> {
        self.lock_tasks(timeout).map(|tasks| tasks.len())
    }

    pub fn snapshot(&self, timeout: Duration) -> Option<Vec<TaskInfo>> {
        self.lock_tasks(timeout).map(|tasks| tasks.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::vm::task::TaskId;

    const LOCK: Duration = Duration::from_millis(50);

    fn task(id: u32, priority: u8) -> Task {
        Task::new(TaskId(id), "test", priority, 0..0, 0)
    }

    #[test]
    fn pick_prefers_lower_priority_numbers() {
        let mut table = TaskTable::default();
        table.install([task(1, 2), task(2, 1)]);
        assert_eq!(table.pick(), Some(1));
        assert_eq!(table.pick(), Some(1));
    }

    #[test]
    fn pick_rotates_among_equal_priorities() {
        let mut table = TaskTable::default();
        table.install([task(1, 1), task(2, 1)]);
        assert_eq!(table.pick(), Some(0));
        assert_eq!(table.pick(), Some(1));
        assert_eq!(table.pick(), Some(0));
    }

    #[test]
    fn sleeping_tasks_wake_at_their_deadline() {
        let mut table = TaskTable::default();
        let mut sleeper = task(1, 1);
        sleeper.state = TaskState::Sleeping { until: 5 };
        table.install([sleeper]);

        assert_eq!(table.pick(), None);
        assert!(table.any_alive());
        table.wake_sleepers(4);
        assert_eq!(table.pick(), None);
        table.wake_sleepers(5);
        assert_eq!(table.pick(), Some(0));
    }

    #[test]
    fn halted_tasks_are_not_alive() {
        let mut table = TaskTable::default();
        let mut done = task(1, 1);
        done.halt();
        table.install([done]);
        assert!(!table.any_alive());
        assert_eq!(table.pick(), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn ticks_are_dropped_while_masked() {
        let core = VmCore::new();
        let mask = core.tick_gate.lock();
        assert!(!core.tick());
        assert_eq!(core.now(), 0);
        assert_eq!(core.masked_ticks(), 1);
        drop(mask);
        assert!(core.tick());
        assert_eq!(core.now(), 1);
    }

    #[test]
    fn teardown_clears_tasks_and_flags_restart() {
        let core = VmCore::new();
        core.lock_tasks(LOCK).unwrap().install([task(1, 1), task(2, 2)]);

        assert_eq!(core.teardown(LOCK), Ok(2));
        assert!(core.restart_pending());
        assert_eq!(core.live_tasks(LOCK), Some(0));

        core.begin_boot();
        assert!(!core.restart_pending());
    }

    #[test]
    fn halt_survives_the_next_boot() {
        let core = VmCore::new();
        core.halt();
        core.begin_boot();
        assert!(core.is_halted());
        assert!(core.restart_pending());
    }

    #[test]
    fn teardown_is_busy_while_the_scheduler_holds_the_table() {
        let core = VmCore::new();
        let running = core.lock_tasks(LOCK).unwrap();
        assert_eq!(core.teardown(Duration::from_millis(5)), Err(VMError::Busy));
        drop(running);
        assert!(!core.restart_pending());
    }
}

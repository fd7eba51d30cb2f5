use crate::core::restart_lock::FreezeGuard;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::vm::registers::Registers;
use std::fmt;
use std::ops::Range;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(pub u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Scheduling state of a task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    /// Waiting until the VM clock reaches `until`.
    Sleeping { until: u64 },
    /// Ran to completion.
    Dormant,
    /// Stopped by a runtime error.
    Faulted(VMError),
}

/// One interpreter task: a program in the heap arena plus its execution state.
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) name: &'static str,
    /// Lower runs first.
    pub(crate) priority: u8,
    /// Location of the program in the heap arena.
    pub(crate) code: Range<usize>,
    pub(crate) ip: usize,
    pub(crate) registers: Registers,
    pub(crate) state: TaskState,
    /// Restart lock held on behalf of the script (`Blink.lock`).
    pub(crate) freeze: Option<FreezeGuard>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        name: &'static str,
        priority: u8,
        code: Range<usize>,
        entry: usize,
    ) -> Self {
        Self {
            id,
            name,
            priority,
            code,
            ip: entry,
            registers: Registers::new(),
            state: TaskState::Ready,
            freeze: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.state, TaskState::Ready | TaskState::Sleeping { .. })
    }

    /// Moves a sleeping task back to ready once its deadline passed.
    pub(crate) fn wake(&mut self, now: u64) {
        if let TaskState::Sleeping { until } = self.state
            && until <= now
        {
            self.state = TaskState::Ready;
        }
    }

    pub(crate) fn halt(&mut self) {
        self.state = TaskState::Dormant;
        self.freeze = None;
    }

    pub(crate) fn fault(&mut self, err: VMError) {
        self.state = TaskState::Faulted(err);
        self.freeze = None;
    }

    pub fn snapshot(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            name: self.name,
            priority: self.priority,
            state: self.state.clone(),
            holds_freeze: self.freeze.is_some(),
        }
    }
}

/// Point-in-time view of a task for status reporting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: &'static str,
    pub priority: u8,
    pub state: TaskState,
    pub holds_freeze: bool,
}

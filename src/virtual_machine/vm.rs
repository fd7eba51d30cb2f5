//! Interpreter instance and its cooperative scheduler.
//!
//! A [`Vm`] owns the heap arena for the lifetime of one boot cycle. Tasks are
//! created on it before [`Vm::run`] installs them on the shared [`VmCore`];
//! from then on the run loop executes one time slice at a time while holding
//! the task-table lock. Tearing the instance down from another thread means
//! taking that lock and clearing the table (see [`VmCore::teardown`]).

mod heap;
mod registers;
mod scheduler;
mod task;


pub use heap::Heap;
pub use registers::Value;
pub use scheduler::{TaskTable, VmCore};
pub use task::{TaskId, TaskInfo, TaskState};

use crate::api::HostEnv;
use crate::config::{INSTRUCTIONS_PER_SLICE, RESTART_LOCK_TIMEOUT, TICK_PERIOD, TIMESLICE_TICKS};
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::host::{ClassRegistry, HostCall, HostFn, SymbolId, SymbolTable};
use crate::virtual_machine::isa::{HEADER, Instruction, MAX_HOST_ARGS};
use crate::virtual_machine::program::{ArgList, Decoded, HostArg, Operand, decode_at, jump_target, validate};
use crate::{debug, error, warn};
use std::sync::Arc;
use std::thread;
use task::Task;

/// Tasks a single VM instance can hold, one per slot.
pub const MAX_TASKS: usize = 2;

/// Why [`Vm::run`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunExit {
    /// Every task was deleted by a teardown.
    Restart,
    /// Every task halted or faulted.
    Idle,
}

/// Outcome of executing one instruction.
enum Flow {
    Next,
    Jump(usize),
    /// Continue with the next instruction in a later slice.
    Yield,
    Halt,
}

/// Dispatches a decoded instruction to its handler.
///
/// Operands are pulled from the decoded array in declaration order; the kind
/// names the [`Operand`] variant the handler expects.
macro_rules! exec_vm {
    (
        vm = $vm:ident,
        task = $task:ident,
        decoded = $decoded:ident,
        { $( $variant:ident => $handler:ident ( $( $field:ident : $kind:ident ),* $(,)? ) ),* $(,)? }
    ) => {{
        match $decoded.instr {
            $(
                Instruction::$variant => {
                    #[allow(unused_mut, unused_variables)]
                    let mut operands = $decoded.operands.iter();
                    $( let $field = exec_vm!(@read operands, $decoded, $kind)?; )*
                    $vm.$handler($task, &$decoded, $( $field ),*)
                }
            ),*
        }
    }};

    (@read $operands:ident, $decoded:ident, $kind:ident) => {{
        match $operands.next() {
            Some(Operand::$kind(value)) => Ok::<_, VMError>(*value),
            _ => Err(VMError::InvalidInstruction {
                opcode: $decoded.instr as u8,
                offset: $decoded.offset,
            }),
        }
    }};
}

/// One interpreter instance.
pub struct Vm<'h> {
    heap: &'h mut Heap,
    core: Arc<VmCore>,
    host: Arc<HostEnv>,
    classes: ClassRegistry,
    symbols: SymbolTable,
    /// Tasks created but not yet handed to the scheduler.
    pending: Vec<Task>,
    next_id: u32,
}

impl<'h> Vm<'h> {
    /// Opens an instance on a reset heap arena.
    pub fn open(heap: &'h mut Heap, core: Arc<VmCore>, host: Arc<HostEnv>) -> Self {
        heap.reset();
        Self {
            heap,
            core,
            host,
            classes: ClassRegistry::default(),
            symbols: SymbolTable::default(),
            pending: Vec::with_capacity(MAX_TASKS),
            next_id: 1,
        }
    }

    pub fn define_method(
        &mut self,
        class: &'static str,
        method: &'static str,
        f: HostFn,
    ) -> Result<(), VMError> {
        self.classes.define_method(class, method, f)
    }

    pub fn intern_symbol(&mut self, name: &'static str) -> SymbolId {
        self.symbols.intern(name)
    }

    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn heap_used(&self) -> usize {
        self.heap.used()
    }

    /// Validates `code`, copies it into the heap arena and queues a task for it.
    pub fn create_task(
        &mut self,
        name: &'static str,
        code: &[u8],
        priority: u8,
    ) -> Result<TaskId, VMError> {
        if self.pending.len() >= MAX_TASKS {
            return Err(VMError::TooManyTasks(MAX_TASKS));
        }
        validate(code, &self.classes, &self.symbols)?;
        let range = self.heap.alloc(code)?;

        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.pending
            .push(Task::new(id, name, priority, range, HEADER.len()));
        debug!("created {name} ({id}) with priority {priority}, {} bytes", code.len());
        Ok(id)
    }

    /// Runs the scheduler until no task can run any more or a teardown deleted them.
    pub fn run(&mut self) -> RunExit {
        let core = Arc::clone(&self.core);
        match core.lock_tasks(RESTART_LOCK_TIMEOUT) {
            Some(mut tasks) => {
                if core.restart_pending() {
                    debug!("restart requested before start, discarding {} task(s)", self.pending.len());
                    self.pending.clear();
                } else {
                    tasks.install(self.pending.drain(..));
                }
            }
            None => {
                warn!("task table stayed locked, abandoning this instance");
                return RunExit::Restart;
            }
        }

        loop {
            let Some(mut tasks) = core.lock_tasks(TICK_PERIOD) else {
                continue;
            };
            if core.is_halted() {
                tasks.clear();
                return RunExit::Restart;
            }
            if tasks.is_empty() {
                return Self::exit_reason(&core);
            }
            tasks.wake_sleepers(core.now());

            match tasks.pick() {
                Some(index) => {
                    if let Some(task) = tasks.get_mut(index) {
                        self.run_slice(task);
                    }
                }
                None if tasks.any_alive() => {
                    drop(tasks);
                    thread::sleep(TICK_PERIOD);
                }
                None => return Self::exit_reason(&core),
            }
        }
    }

    fn exit_reason(core: &VmCore) -> RunExit {
        if core.restart_pending() {
            RunExit::Restart
        } else {
            RunExit::Idle
        }
    }

    /// Runs `task` until its slice expires, it yields, halts or faults.
    fn run_slice(&self, task: &mut Task) {
        let started = self.core.now();
        for _ in 0..INSTRUCTIONS_PER_SLICE {
            match self.step(task) {
                Ok(Flow::Next | Flow::Jump(_)) => {}
                Ok(Flow::Yield) => return,
                Ok(Flow::Halt) => {
                    debug!("{} ({}) halted", task.name, task.id);
                    task.halt();
                    return;
                }
                Err(err) => {
                    error!("{} ({}) faulted at offset {}: {err}", task.name, task.id, task.ip);
                    task.fault(err);
                    return;
                }
            }
            if self.core.now().saturating_sub(started) >= TIMESLICE_TICKS {
                return;
            }
        }
    }

    /// Executes the instruction at the task's instruction pointer.
    fn step(&self, task: &mut Task) -> Result<Flow, VMError> {
        let code = self.heap.get(task.code.clone());
        if task.ip >= code.len() {
            return Ok(Flow::Halt);
        }
        let decoded = decode_at(code, task.ip)?;
        let flow = exec_vm! {
            vm = self,
            task = task,
            decoded = decoded,
            {
                // Scheduling
                Halt => op_halt(),
                Pass => op_pass(),
                SleepMs => op_sleep_ms(ms: U32),
                // Registers
                LoadBool => op_load_bool(rd: Reg, value: Bool),
                LoadI64 => op_load_i64(rd: Reg, imm: I64),
                LoadNil => op_load_nil(rd: Reg),
                Move => op_move(rd: Reg, rs: Reg),
                Not => op_not(rd: Reg, rs: Reg),
                Eq => op_eq(rd: Reg, rs1: Reg, rs2: Reg),
                EqI64 => op_eq_i64(rd: Reg, rs: Reg, imm: I64),
                AddI64 => op_add_i64(rd: Reg, rs: Reg, imm: I64),
                // Control flow
                Jump => op_jump(offset: Offset),
                JumpIf => op_jump_if(rs: Reg, offset: Offset),
                JumpUnless => op_jump_unless(rs: Reg, offset: Offset),
                // Host
                Puts => op_puts(text: Str),
                CallHost => op_call_host(rd: Reg, class: Str, method: Str, args: Args),
            }
        }?;

        match flow {
            Flow::Next | Flow::Yield => task.ip = decoded.offset + decoded.len,
            Flow::Jump(target) => task.ip = target,
            Flow::Halt => {}
        }
        Ok(flow)
    }

    fn op_halt(&self, _task: &mut Task, _d: &Decoded) -> Result<Flow, VMError> {
        Ok(Flow::Halt)
    }

    fn op_pass(&self, _task: &mut Task, _d: &Decoded) -> Result<Flow, VMError> {
        Ok(Flow::Yield)
    }

    fn op_sleep_ms(&self, task: &mut Task, _d: &Decoded, ms: u32) -> Result<Flow, VMError> {
        task.state = TaskState::Sleeping {
            until: self.core.now() + ms as u64,
        };
        Ok(Flow::Yield)
    }

    fn op_load_bool(&self, task: &mut Task, _d: &Decoded, rd: u8, value: bool) -> Result<Flow, VMError> {
        task.registers.set(rd, Value::Bool(value))?;
        Ok(Flow::Next)
    }

    fn op_load_i64(&self, task: &mut Task, _d: &Decoded, rd: u8, imm: i64) -> Result<Flow, VMError> {
        task.registers.set(rd, Value::Int(imm))?;
        Ok(Flow::Next)
    }

    fn op_load_nil(&self, task: &mut Task, _d: &Decoded, rd: u8) -> Result<Flow, VMError> {
        task.registers.set(rd, Value::Nil)?;
        Ok(Flow::Next)
    }

    fn op_move(&self, task: &mut Task, _d: &Decoded, rd: u8, rs: u8) -> Result<Flow, VMError> {
        let value = task.registers.get(rs)?;
        task.registers.set(rd, value)?;
        Ok(Flow::Next)
    }

    fn op_not(&self, task: &mut Task, _d: &Decoded, rd: u8, rs: u8) -> Result<Flow, VMError> {
        let value = task.registers.get(rs)?;
        task.registers.set(rd, Value::Bool(!value.is_truthy()))?;
        Ok(Flow::Next)
    }

    fn op_eq(&self, task: &mut Task, _d: &Decoded, rd: u8, rs1: u8, rs2: u8) -> Result<Flow, VMError> {
        let equal = task.registers.get(rs1)? == task.registers.get(rs2)?;
        task.registers.set(rd, Value::Bool(equal))?;
        Ok(Flow::Next)
    }

    fn op_eq_i64(&self, task: &mut Task, _d: &Decoded, rd: u8, rs: u8, imm: i64) -> Result<Flow, VMError> {
        let equal = task.registers.get(rs)? == Value::Int(imm);
        task.registers.set(rd, Value::Bool(equal))?;
        Ok(Flow::Next)
    }

    fn op_add_i64(&self, task: &mut Task, _d: &Decoded, rd: u8, rs: u8, imm: i64) -> Result<Flow, VMError> {
        let value = task.registers.get_int(rs, "ADD_I64")?;
        task.registers.set(rd, Value::Int(value.wrapping_add(imm)))?;
        Ok(Flow::Next)
    }

    fn op_jump(&self, _task: &mut Task, d: &Decoded, offset: i32) -> Result<Flow, VMError> {
        Self::jump(d, offset)
    }

    fn op_jump_if(&self, task: &mut Task, d: &Decoded, rs: u8, offset: i32) -> Result<Flow, VMError> {
        if task.registers.get(rs)?.is_truthy() {
            return Self::jump(d, offset);
        }
        Ok(Flow::Next)
    }

    fn op_jump_unless(&self, task: &mut Task, d: &Decoded, rs: u8, offset: i32) -> Result<Flow, VMError> {
        if !task.registers.get(rs)?.is_truthy() {
            return Self::jump(d, offset);
        }
        Ok(Flow::Next)
    }

    fn jump(d: &Decoded, offset: i32) -> Result<Flow, VMError> {
        jump_target(d.offset, offset)
            .map(Flow::Jump)
            .ok_or(VMError::InvalidJumpTarget {
                offset: d.offset,
                target: d.offset as i64 + offset as i64,
            })
    }

    fn op_puts(&self, _task: &mut Task, _d: &Decoded, text: &str) -> Result<Flow, VMError> {
        self.host.console.puts(text);
        Ok(Flow::Next)
    }

    fn op_call_host(
        &self,
        task: &mut Task,
        _d: &Decoded,
        rd: u8,
        class: &str,
        method: &str,
        args: ArgList<'_>,
    ) -> Result<Flow, VMError> {
        let f = self
            .classes
            .find(class, method)
            .ok_or_else(|| VMError::UndefinedMethod {
                class: class.to_string(),
                method: method.to_string(),
            })?;

        let mut values = [Value::Nil; MAX_HOST_ARGS];
        let args = args.as_slice();
        for (value, arg) in values.iter_mut().zip(args) {
            *value = match *arg {
                HostArg::Sym(name) => self
                    .symbols
                    .lookup(name)
                    .map(Value::Sym)
                    .ok_or_else(|| VMError::UnknownSymbol(name.to_string()))?,
                HostArg::Int(v) => Value::Int(v),
                HostArg::Bool(v) => Value::Bool(v),
                HostArg::Reg(r) => task.registers.get(r)?,
                HostArg::Nil => Value::Nil,
            };
        }

        let mut call = HostCall {
            env: &self.host,
            symbols: &self.symbols,
            freeze: &mut task.freeze,
        };
        let result = f(&mut call, &values[..args.len()])?;
        task.registers.set(rd, result)?;
        Ok(Flow::Next)
    }
}

impl Drop for Vm<'_> {
    fn drop(&mut self) {
        match self.core.lock_tasks(RESTART_LOCK_TIMEOUT) {
            Some(mut tasks) => {
                tasks.clear();
            }
            None => warn!("could not clear the task table while closing the VM"),
        }
    }
}

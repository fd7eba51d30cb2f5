//! Register-based bytecode interpreter running the slot programs.
//!
//! Programs are produced by the assembler (or pushed already compiled by a
//! deployment peer), validated when their task is created and executed by a
//! tick-driven cooperative scheduler.
//!
//! # Architecture
//!
//! - **Registers**: 16 registers per task storing typed [`vm::Value`]s (`Nil`, `Bool`, `Int`, `Sym`)
//! - **Instruction format**: Variable-length bytecode behind a 4-byte header
//! - **Tasks**: up to two per instance, one per slot, scheduled by priority and
//!   round-robin among equals with a time slice of 10 ticks
//! - **Host calls**: `CALL_HOST` dispatches to classes registered per instance
//!
//! # Modules
//!
//! - [`assembler`]: Assembly parsing, diagnostics, and bytecode generation
//! - [`errors`]: Assembly, validation and execution error types
//! - [`host`]: Symbol table and host class registry
//! - [`isa`]: Instruction set definition and opcode mappings
//! - [`program`]: Program format, decoding and static validation
//! - [`tick`]: Periodic tick source
//! - [`vm`]: Interpreter instance, tasks and scheduler

pub mod assembler;
pub mod errors;
pub mod host;
pub mod isa;
pub mod program;
pub mod tick;
pub mod vm;

//! Assembly to bytecode compiler CLI.
//!
//! Reads slot program sources and compiles them to bytecode ready for upload.
//!
//! # Usage
//! ```text
//! assembler <input.blk> [OPTIONS]
//! ```
//!
//! # Arguments
//! - `input.blk`: Assembly source file to compile
//!
//! # Options
//! - `-o, --output <file>`: Output file path (defaults to `<input>.bin`)
//! - `-c, --check`: Validate against the device's host API and slot limits
//! - `-l, --listing`: Print the decoded instructions
//!
//! # Examples
//! ```text
//! assembler blink.blk
//! assembler blink.blk -o slot1.bin
//! assembler blink.blk --check --listing
//! ```

use slotvm::api::{self, HostEnv};
use slotvm::config::MAX_BYTECODE_SIZE;
use slotvm::core::restart_lock::RestartLock;
use slotvm::drivers::gpio::GpioBank;
use slotvm::network::link::LinkState;
use slotvm::virtual_machine::assembler::assemble_file;
use slotvm::virtual_machine::isa::HEADER;
use slotvm::virtual_machine::program::{Operand, decode_at, validate};
use slotvm::virtual_machine::vm::{Heap, Vm, VmCore};
use slotvm::{error, info, warn};
use std::env;
use std::fs;
use std::path::Path;
use std::process;
use std::sync::Arc;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let input_path = &args[1];
    let mut output_path: Option<String> = None;
    let mut check = false;
    let mut listing = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            k @ ("--output" | "-o") => {
                i += 1;
                if i >= args.len() {
                    error!("{k} requires an argument");
                    process::exit(1);
                }
                output_path = Some(args[i].clone());
                i += 1;
            }
            "--check" | "-c" => {
                check = true;
                i += 1;
            }
            "--listing" | "-l" => {
                listing = true;
                i += 1;
            }
            other => {
                error!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    if !Path::new(input_path).exists() {
        error!("Input file does not exist: {}", input_path);
        process::exit(1);
    }

    let output_path = output_path.unwrap_or_else(|| {
        let p = Path::new(input_path);
        let stem = p.file_stem().unwrap_or_default().to_string_lossy();
        let parent = p.parent().unwrap_or(Path::new("."));
        parent
            .join(format!("{}.bin", stem))
            .to_string_lossy()
            .into_owned()
    });

    if let Some(parent) = Path::new(&output_path).parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        error!("Output directory does not exist: {}", parent.display());
        process::exit(1);
    }

    let program = match assemble_file(input_path) {
        Ok(p) => p,
        Err(e) => {
            error!("Assembly failed: {}", e);
            process::exit(1);
        }
    };
    let bytecode = program.to_bytes();

    if listing {
        print_listing(bytecode);
    }

    if check {
        if bytecode.len() > MAX_BYTECODE_SIZE {
            error!(
                "Program of {} bytes exceeds the {} byte slot limit",
                bytecode.len(),
                MAX_BYTECODE_SIZE
            );
            process::exit(1);
        }
        if let Err(e) = check_against_host_api(bytecode) {
            error!("Program would not start on the device: {e}");
            process::exit(1);
        }
        info!(
            "Check passed: {} of {} bytes used",
            bytecode.len(),
            MAX_BYTECODE_SIZE
        );
    } else if bytecode.len() > MAX_BYTECODE_SIZE {
        warn!(
            "Program of {} bytes will be rejected by the device (limit {})",
            bytecode.len(),
            MAX_BYTECODE_SIZE
        );
    }

    if let Err(e) = fs::write(&output_path, bytecode) {
        error!("Failed to write output file: {}", e);
        process::exit(1);
    }

    info!(
        "Compiled {} -> {} ({} bytes)",
        input_path,
        output_path,
        bytecode.len()
    );
}

/// Validates `code` the way the device does when creating a task.
fn check_against_host_api(code: &[u8]) -> Result<(), String> {
    let mut heap = Heap::allocate(MAX_BYTECODE_SIZE).map_err(|e| e.to_string())?;
    let host = Arc::new(HostEnv::new(
        Arc::new(GpioBank::new()),
        LinkState::new(),
        RestartLock::new(),
    ));
    let mut vm = Vm::open(&mut heap, Arc::new(VmCore::new()), host);
    api::define_all(&mut vm).map_err(|e| e.to_string())?;
    validate(code, vm.classes(), vm.symbols()).map_err(|e| e.to_string())
}

fn print_listing(code: &[u8]) {
    let mut offset = HEADER.len();
    while offset < code.len() {
        let decoded = match decode_at(code, offset) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!("Cannot decode at {offset:#06x}: {e}");
                return;
            }
        };
        let operands: Vec<String> = decoded
            .operands
            .iter()
            .filter(|op| !matches!(op, Operand::Unused))
            .map(format_operand)
            .collect();
        println!(
            "{:#06x}  {:<12} {}",
            offset,
            decoded.instr.mnemonic(),
            operands.join(", ")
        );
        offset += decoded.len;
    }
}

fn format_operand(operand: &Operand<'_>) -> String {
    match operand {
        Operand::Unused => String::new(),
        Operand::Reg(r) => format!("r{r}"),
        Operand::Bool(b) => b.to_string(),
        Operand::U32(v) => v.to_string(),
        Operand::I64(v) => v.to_string(),
        Operand::Offset(rel) => format!("{rel:+}"),
        Operand::Str(s) => format!("{s:?}"),
        Operand::Args(args) => format!("{:?}", args.as_slice()),
    }
}

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}

const USAGE: &str = "\
Slot Program Assembler

USAGE:
    {program} <input.blk> [OPTIONS]

ARGS:
    <input.blk>    Assembly source file to compile

OPTIONS:
    -o, --output <file>     Output file path (defaults to <input>.bin)
    -c, --check             Validate against the device host API and slot limit
    -l, --listing           Print the decoded instructions
    -h, --help              Print this help message

EXAMPLES:
    # Compile to default output name
    {program} blink.blk

    # Compile with explicit output
    {program} blink.blk -o slot1.bin

    # Check that the device would start the program, and show it decoded
    {program} blink.blk --check --listing
";

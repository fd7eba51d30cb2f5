//! Deployment client for a simulated device.
//!
//! # Usage
//! ```text
//! deploy <command> [ARGS] [OPTIONS]
//! ```
//!
//! # Commands
//! - `store <slot> <file>`: Upload a program (`.blk` sources are assembled first)
//! - `reload`: Restart the device VM with the stored programs
//! - `reboot`: Reboot the device
//! - `status`: Print the negotiated MTU
//! - `watch`: Print status texts until interrupted
//!
//! # Options
//! - `--device <addr>`: Device address (defaults to `127.0.0.1:4300`)
//! - `-f, --follow`: Keep printing status texts after the reply

use bytes::Bytes;
use slotvm::network::event::{DeployEvent, EventReply};
use slotvm::network::frame::{Frame, FrameError, TEXT, decode_reply, encode_event};
use slotvm::virtual_machine::assembler::assemble_file;
use slotvm::{error, info, warn};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::process;
use tokio::io;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;

const DEFAULT_DEVICE: &str = "127.0.0.1:4300";

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let mut device = DEFAULT_DEVICE.to_string();
    let mut follow = false;
    let mut positional: Vec<&str> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--device" | "-d" => {
                i += 1;
                if i >= args.len() {
                    error!("--device requires an argument");
                    process::exit(1);
                }
                device = args[i].clone();
                i += 1;
            }
            "--follow" | "-f" => {
                follow = true;
                i += 1;
            }
            other => {
                positional.push(other);
                i += 1;
            }
        }
    }

    let device: SocketAddr = match device.parse() {
        Ok(addr) => addr,
        Err(_) => {
            error!("Invalid device address: {}", device);
            process::exit(1);
        }
    };

    let event = match positional.as_slice() {
        ["store", slot, file] => program_event(slot, file),
        ["reload"] => Some(DeployEvent::ReloadRequested),
        ["reboot"] => Some(DeployEvent::RebootRequested),
        ["status"] => Some(DeployEvent::StatusRequested),
        ["watch"] => None,
        _ => {
            error!("Unexpected arguments: {}\n", positional.join(" "));
            print_usage(&args[0]);
            process::exit(1);
        }
    };

    let stream = match TcpStream::connect(device).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to connect to {}: {}", device, e);
            process::exit(1);
        }
    };
    let (mut reader, mut writer) = stream.into_split();

    if let Some(event) = event {
        info!("Sending {event} to {device}");
        if let Err(e) = encode_event(&event).write_to(&mut writer).await {
            error!("Failed to send request: {}", e);
            process::exit(1);
        }
        match read_reply(&mut reader).await {
            Ok(EventReply::Rejected(reason)) => {
                error!("Device rejected the request: {}", reason);
                process::exit(2);
            }
            Ok(reply) => info!("Device replied: {reply}"),
            Err(FrameError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                // A rebooting device drops the connection instead of replying.
                warn!("Device closed the connection before replying");
                return;
            }
            Err(e) => {
                error!("Failed to read reply: {}", e);
                process::exit(1);
            }
        }
        if !follow {
            return;
        }
    }

    tokio::select! {
        result = print_texts(&mut reader) => {
            if let Err(e) = result {
                warn!("Connection lost: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {}
    }
}

/// Builds the upload event for `file`, assembling `.blk` sources.
fn program_event(slot: &str, file: &str) -> Option<DeployEvent> {
    let slot: u8 = match slot.parse() {
        Ok(slot) => slot,
        Err(_) => {
            error!("Invalid slot index: {}", slot);
            process::exit(1);
        }
    };

    let bytes = if Path::new(file).extension().is_some_and(|ext| ext == "blk") {
        match assemble_file(file) {
            Ok(program) => program.to_bytes().to_vec(),
            Err(e) => {
                error!("Assembly failed: {}", e);
                process::exit(1);
            }
        }
    } else {
        match fs::read(file) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to read {}: {}", file, e);
                process::exit(1);
            }
        }
    };

    if bytes.len() > u16::MAX as usize {
        error!("Program of {} bytes does not fit in one upload", bytes.len());
        process::exit(1);
    }
    let length = bytes.len();
    Some(DeployEvent::ProgramReceived {
        slot,
        bytes: Bytes::from(bytes),
        length,
    })
}

/// Prints status texts until a reply frame arrives.
async fn read_reply(reader: &mut OwnedReadHalf) -> Result<EventReply, FrameError> {
    loop {
        let frame = Frame::read_from(reader).await?;
        if frame.code == TEXT {
            print_text(&frame);
            continue;
        }
        return decode_reply(&frame);
    }
}

async fn print_texts(reader: &mut OwnedReadHalf) -> Result<(), FrameError> {
    loop {
        let frame = Frame::read_from(reader).await?;
        if frame.code == TEXT {
            print_text(&frame);
        }
    }
}

fn print_text(frame: &Frame) {
    match frame.text() {
        Ok(text) => print!("{text}"),
        Err(e) => warn!("{e}"),
    }
}

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}

const USAGE: &str = "\
Slot Program Deployment Client

USAGE:
    {program} <command> [ARGS] [OPTIONS]

COMMANDS:
    store <slot> <file>    Upload a program to slot 0 or 1 (.blk sources are assembled)
    reload                 Restart the device VM with the stored programs
    reboot                 Reboot the device
    status                 Print the negotiated MTU
    watch                  Print status texts until interrupted

OPTIONS:
    -d, --device <addr>    Device address (default: 127.0.0.1:4300)
    -f, --follow           Keep printing status texts after the reply
    -h, --help             Print this help message

EXAMPLES:
    # Upload and start a program in the second slot
    {program} store 1 blink.blk
    {program} reload --follow

    # Talk to a device on another port
    {program} status --device 127.0.0.1:4301
";

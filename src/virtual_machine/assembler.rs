//! Assembly language parser and bytecode compiler.
//!
//! Converts human-readable assembly source into a [`Program`]. Uses
//! [`for_each_instruction!`](crate::for_each_instruction) to generate the
//! assembler IR and `parse_instruction`.
//!
//! # Syntax
//!
//! ```text
//! label: INSTRUCTION operand1, operand2, ...  # optional comment
//! ```
//!
//! - Instructions are uppercase (e.g., `LOAD_I64`, `CALL_HOST`)
//! - Registers use `r` prefix (e.g., `r0`, `r15`)
//! - Immediates are decimal integers (e.g., `500`, `-1`)
//! - String literals are double-quoted (e.g., `"Hello World!"`)
//! - Booleans are `true` or `false`
//! - Symbols start with `:` (e.g., `:led1`) and are only valid as host arguments
//! - Jump operands are label names or raw relative offsets
//! - Comments start with `#`
//! - Commas between operands are optional

use crate::for_each_instruction;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::{HEADER, Instruction, MAX_HOST_ARGS, OperandKind, REGISTER_COUNT, arg_tag};
use crate::virtual_machine::program::Program;
use std::collections::HashMap;
use std::fmt::Write;
use std::fs;
use std::path::Path;

const COMMENT_CHAR: char = '#';
const LABEL_SUFFIX: char = ':';
const SYMBOL_PREFIX: char = ':';

/// Return the line/column/message triple for assembly-related errors.
fn assembly_error_location(err: &VMError) -> Option<(usize, usize, String)> {
    match err {
        VMError::AssemblyError {
            line,
            offset,
            source,
        } => Some((*line, *offset, source.clone())),
        VMError::ParseError {
            line,
            offset,
            message,
        } => Some((*line, *offset, message.to_string())),
        _ => None,
    }
}

/// Formats a compiler-style diagnostic for assembly failures.
pub fn render_assembly_diagnostic(
    file: &str,
    source: &str,
    line: usize,
    offset: usize,
    message: &str,
) -> String {
    let mut diag = String::new();
    let _ = writeln!(diag, "error: {message}");
    let _ = writeln!(diag, " --> {file}:{line}:{offset}");

    if let Some(raw_line) = source.lines().nth(line.saturating_sub(1)) {
        let line_text = raw_line.trim_end_matches('\r');
        let underline = " ".repeat(offset.saturating_sub(1));
        let _ = writeln!(diag, "  |");
        let _ = writeln!(diag, "{:>4} | {}", line, line_text);
        let _ = writeln!(diag, "  | {}^", underline);
    }

    diag
}

/// Emit a helpful diagnostic to stderr for assembly errors.
fn log_assembly_error(file: &str, source: &str, err: &VMError) {
    if let Some((line, offset, message)) = assembly_error_location(err) {
        eprintln!(
            "{}",
            render_assembly_diagnostic(file, source, line, offset, &message)
        );
    } else {
        eprintln!("error: {err}");
    }
}

/// Label table built during the first pass.
pub struct AsmContext {
    /// Label definitions mapping names to program offsets (header included).
    labels: HashMap<String, usize>,
    /// `false` while sizing instructions, when labels may not be defined yet.
    resolving: bool,
}

impl AsmContext {
    pub fn new() -> Self {
        Self {
            labels: HashMap::new(),
            resolving: false,
        }
    }

    /// Registers a label at the given program offset.
    fn define_label(&mut self, name: String, offset: usize) -> Result<(), VMError> {
        if self.labels.contains_key(&name) {
            return Err(VMError::DuplicateLabel(name));
        }
        self.labels.insert(name, offset);
        Ok(())
    }

    fn resolve_label(&self, name: &str) -> Result<usize, VMError> {
        self.labels
            .get(name)
            .copied()
            .ok_or_else(|| VMError::UndefinedLabel(name.to_string()))
    }
}

impl Default for AsmContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct Token<'a> {
    text: &'a str,
    /// 1-based column offset in the line.
    offset: usize,
}

/// Tokenize a single line of assembly.
///
/// Rules:
/// - `#` starts a comment
/// - commas are ignored
/// - whitespace-separated tokens
fn tokenize(line_no: usize, line: &str) -> Result<Vec<Token<'_>>, VMError> {
    let mut out = Vec::with_capacity(8);

    let mut start: Option<usize> = None;
    let mut start_col: usize = 0;
    let mut in_str = false;

    let bytes = line.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];

        if b == COMMENT_CHAR as u8 && !in_str {
            break;
        }

        match b {
            b'"' => {
                if start.is_none() {
                    start = Some(i);
                    start_col = i + 1;
                }
                in_str = !in_str;
            }
            b',' | b' ' | b'\t' if !in_str => {
                if let Some(s) = start.take() {
                    let text = line[s..i].trim();
                    if !text.is_empty() {
                        out.push(Token {
                            text,
                            offset: start_col,
                        });
                    }
                }
            }
            _ => {
                if start.is_none() {
                    start = Some(i);
                    start_col = i + 1;
                }
            }
        }
        i += 1;
    }

    if in_str {
        return Err(VMError::ParseError {
            line: line_no,
            offset: start_col,
            message: "unterminated string literal (missing closing quote)",
        });
    }

    if let Some(s) = start {
        let text = line[s..i].trim();
        if !text.is_empty() {
            out.push(Token {
                text,
                offset: start_col,
            });
        }
    }

    Ok(out)
}

/// Parse a register token like `r0`, `r15`
pub(crate) fn parse_reg(tok: &str) -> Result<u8, VMError> {
    tok.strip_prefix('r')
        .ok_or_else(|| VMError::ExpectedRegister(tok.to_string()))?
        .parse::<u8>()
        .ok()
        .filter(|r| (*r as usize) < REGISTER_COUNT)
        .ok_or_else(|| VMError::InvalidRegister(tok.to_string()))
}

pub(crate) fn parse_i64(tok: &str) -> Result<i64, VMError> {
    tok.parse::<i64>().map_err(|_| VMError::InvalidOperand {
        expected: "integer",
        token: tok.to_string(),
    })
}

pub(crate) fn parse_u32(tok: &str) -> Result<u32, VMError> {
    tok.parse::<u32>().map_err(|_| VMError::InvalidOperand {
        expected: "unsigned integer",
        token: tok.to_string(),
    })
}

/// Parse a boolean literal (`true` or `false`).
pub(crate) fn parse_bool(tok: &str) -> Result<bool, VMError> {
    match tok {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(VMError::InvalidOperand {
            expected: "bool",
            token: tok.to_string(),
        }),
    }
}

/// Parse a double-quoted string literal of at most 255 bytes.
pub(crate) fn parse_str(tok: &str) -> Result<String, VMError> {
    let text = tok
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .filter(|t| t.len() <= u8::MAX as usize)
        .ok_or_else(|| VMError::InvalidOperand {
            expected: "string",
            token: tok.to_string(),
        })?;
    Ok(text.to_string())
}

/// Parses a raw relative offset or a label reference.
///
/// Label references become offsets relative to `current_offset`, the position
/// of the instruction's opcode byte. While sizing, unresolved labels yield 0.
pub(crate) fn parse_offset(
    tok: &str,
    ctx: &AsmContext,
    current_offset: usize,
) -> Result<i32, VMError> {
    if let Ok(v) = tok.parse::<i32>() {
        return Ok(v);
    }
    if !ctx.resolving {
        return Ok(0);
    }
    let target = ctx.resolve_label(tok)?;
    i32::try_from(target as i64 - current_offset as i64).map_err(|_| VMError::InvalidOperand {
        expected: "jump offset",
        token: tok.to_string(),
    })
}

/// Host call argument in assembler IR.
#[derive(Debug, Clone, PartialEq)]
enum AsmArg {
    Sym(String),
    Int(i64),
    Bool(bool),
    Reg(u8),
    Nil,
}

impl AsmArg {
    fn parse(tok: &str) -> Result<AsmArg, VMError> {
        if let Some(name) = tok.strip_prefix(SYMBOL_PREFIX) {
            if name.is_empty() || name.len() > u8::MAX as usize {
                return Err(VMError::InvalidOperand {
                    expected: "symbol",
                    token: tok.to_string(),
                });
            }
            return Ok(AsmArg::Sym(name.to_string()));
        }
        match tok {
            "nil" => Ok(AsmArg::Nil),
            "true" | "false" => parse_bool(tok).map(AsmArg::Bool),
            _ if tok.starts_with('r') => parse_reg(tok).map(AsmArg::Reg),
            _ => parse_i64(tok)
                .map(AsmArg::Int)
                .map_err(|_| VMError::InvalidOperand {
                    expected: "host argument",
                    token: tok.to_string(),
                }),
        }
    }

    fn emit(&self, out: &mut Vec<u8>) {
        match self {
            AsmArg::Sym(name) => {
                out.push(arg_tag::SYM);
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
            }
            AsmArg::Int(v) => {
                out.push(arg_tag::INT);
                out.extend_from_slice(&v.to_le_bytes());
            }
            AsmArg::Bool(b) => {
                out.push(arg_tag::BOOL);
                out.push(*b as u8);
            }
            AsmArg::Reg(r) => {
                out.push(arg_tag::REG);
                out.push(*r);
            }
            AsmArg::Nil => out.push(arg_tag::NIL),
        }
    }
}

fn parse_args<'a, 'b: 'a>(
    it: &mut impl Iterator<Item = &'a Token<'b>>,
) -> Result<Vec<AsmArg>, VMError> {
    let args = it
        .map(|tok| AsmArg::parse(tok.text))
        .collect::<Result<Vec<_>, _>>()?;
    if args.len() > MAX_HOST_ARGS {
        return Err(VMError::TooManyArguments {
            count: args.len(),
            max: MAX_HOST_ARGS,
        });
    }
    Ok(args)
}

fn next_token<'a, 'b: 'a>(
    it: &mut impl Iterator<Item = &'a Token<'b>>,
) -> Result<&'a Token<'b>, VMError> {
    it.next().ok_or(VMError::UnexpectedEndOfBytecode { offset: 0 })
}

/// Checks the operand count; a trailing `Args` operand takes zero or more tokens.
fn check_arity(instr: Instruction, actual: usize) -> Result<(), VMError> {
    let kinds = instr.operands();
    let variadic = kinds.last() == Some(&OperandKind::Args);
    let fixed = kinds.len() - variadic as usize;
    let ok = if variadic {
        actual >= fixed
    } else {
        actual == fixed
    };
    if ok {
        Ok(())
    } else {
        Err(VMError::ArityMismatch {
            instruction: instr.mnemonic().to_string(),
            expected: fixed,
            actual,
        })
    }
}

macro_rules! define_parse_instruction {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:expr, $mnemonic:literal => [
                $( $field:ident : $kind:ident ),* $(,)?
            ]
        ),* $(,)?
    ) => {
        // =========================
        // Assembler IR
        // =========================
        #[derive(Debug, Clone, PartialEq)]
        enum AsmInstr {
            $(
                $name {
                    $( $field: define_parse_instruction!(@ty $kind) ),*
                },
            )*
        }

        impl AsmInstr {
            /// Encodes the assembly instruction into bytecode
            fn assemble(&self, out: &mut Vec<u8>) {
                match self {
                    $(
                        AsmInstr::$name { $( $field ),* } => {
                            out.push($opcode);
                            $(
                                define_parse_instruction!(@emit out, $kind, $field);
                            )*
                        }
                    ),*
                }
            }

            fn encoded_len(&self) -> usize {
                let mut scratch = Vec::new();
                self.assemble(&mut scratch);
                scratch.len()
            }
        }

        /// Parse one instruction from tokens into [`AsmInstr`].
        ///
        /// `current_offset` is the program offset of the opcode byte, used for
        /// resolving label references to relative offsets.
        fn parse_instruction(
            ctx: &AsmContext,
            tokens: &[Token],
            current_offset: usize,
        ) -> Result<AsmInstr, VMError> {
            let Some(head) = tokens.first() else {
                return Err(VMError::ArityMismatch {
                    instruction: "<missing opcode>".to_string(),
                    expected: 1,
                    actual: 0,
                });
            };

            let instr = Instruction::from_mnemonic(head.text)?;
            check_arity(instr, tokens.len() - 1)?;
            #[allow(unused_mut, unused_variables)]
            let mut it = tokens[1..].iter();

            match instr {
                $(
                    Instruction::$name => Ok(AsmInstr::$name {
                        $(
                            $field: define_parse_instruction!(
                                @parse_operand $kind, it, ctx, current_offset
                            )?,
                        )*
                    }),
                )*
            }
        }
    };

    // ---------- types ----------
    (@ty Reg)    => { u8 };
    (@ty Bool)   => { bool };
    (@ty ImmU32) => { u32 };
    (@ty ImmI64) => { i64 };
    (@ty Offset) => { i32 };
    (@ty Str)    => { String };
    (@ty Args)   => { Vec<AsmArg> };

    // ---------- encoding ----------
    (@emit $out:ident, Reg, $v:ident) => {
        $out.push(*$v);
    };
    (@emit $out:ident, Bool, $v:ident) => {
        $out.push(*$v as u8);
    };
    (@emit $out:ident, ImmU32, $v:ident) => {
        $out.extend_from_slice(&$v.to_le_bytes());
    };
    (@emit $out:ident, ImmI64, $v:ident) => {
        $out.extend_from_slice(&$v.to_le_bytes());
    };
    (@emit $out:ident, Offset, $v:ident) => {
        $out.extend_from_slice(&$v.to_le_bytes());
    };
    (@emit $out:ident, Str, $v:ident) => {
        $out.push($v.len() as u8);
        $out.extend_from_slice($v.as_bytes());
    };
    (@emit $out:ident, Args, $v:ident) => {
        $out.push($v.len() as u8);
        for arg in $v.iter() {
            arg.emit($out);
        }
    };

    // ---------- parsing ----------
    (@parse_operand Reg, $it:ident, $ctx:ident, $offset:ident) => {
        parse_reg(next_token(&mut $it)?.text)
    };
    (@parse_operand Bool, $it:ident, $ctx:ident, $offset:ident) => {
        parse_bool(next_token(&mut $it)?.text)
    };
    (@parse_operand ImmU32, $it:ident, $ctx:ident, $offset:ident) => {
        parse_u32(next_token(&mut $it)?.text)
    };
    (@parse_operand ImmI64, $it:ident, $ctx:ident, $offset:ident) => {
        parse_i64(next_token(&mut $it)?.text)
    };
    (@parse_operand Offset, $it:ident, $ctx:ident, $offset:ident) => {
        parse_offset(next_token(&mut $it)?.text, $ctx, $offset)
    };
    (@parse_operand Str, $it:ident, $ctx:ident, $offset:ident) => {
        parse_str(next_token(&mut $it)?.text)
    };
    (@parse_operand Args, $it:ident, $ctx:ident, $offset:ident) => {
        parse_args(&mut $it)
    };
}

for_each_instruction!(define_parse_instruction);

/// Checks if a token is a label definition (ends with `:`)
fn is_label_def(tok: &str) -> bool {
    tok.ends_with(LABEL_SUFFIX) && !tok.starts_with(SYMBOL_PREFIX) && tok.len() > 1
}

/// Extracts the label name from a label definition token.
fn label_name(tok: &str) -> &str {
    &tok[..tok.len() - 1]
}

/// Performs two-pass assembly.
///
/// Pass 1: tokenizes all lines, sizes every instruction and records label
/// positions as program offsets (the header included).
///
/// Pass 2: parses instructions with label resolution and emits bytecode.
fn assemble_lines(source: &str) -> Result<Program, VMError> {
    let mut ctx = AsmContext::new();
    let mut parsed_lines: Vec<(usize, Vec<Token>)> = Vec::new();
    let mut offset = HEADER.len();

    for (line_no, line) in source.lines().enumerate() {
        let mut tokens = tokenize(line_no + 1, line)?;
        if tokens.is_empty() {
            continue;
        }

        if is_label_def(tokens[0].text) {
            let name = label_name(tokens[0].text).to_string();
            ctx.define_label(name, offset)
                .map_err(|e| VMError::AssemblyError {
                    line: line_no + 1,
                    offset: tokens[0].offset,
                    source: e.to_string(),
                })?;
            tokens.remove(0);
            if tokens.is_empty() {
                continue;
            }
        }

        let size = parse_instruction(&ctx, &tokens, offset)
            .map_err(|e| VMError::AssemblyError {
                line: line_no + 1,
                offset: tokens[0].offset,
                source: e.to_string(),
            })?
            .encoded_len();
        offset += size;
        parsed_lines.push((line_no, tokens));
    }

    ctx.resolving = true;
    let mut body = Vec::with_capacity(offset - HEADER.len());
    for (line_no, tokens) in parsed_lines {
        let instr = parse_instruction(&ctx, &tokens, HEADER.len() + body.len()).map_err(|e| {
            VMError::AssemblyError {
                line: line_no + 1,
                offset: tokens.first().map(|t| t.offset).unwrap_or(1),
                source: e.to_string(),
            }
        })?;
        instr.assemble(&mut body);
    }

    Ok(Program::from_body(&body))
}

/// Assemble a full source string into a program.
pub fn assemble_source(source: impl Into<String>) -> Result<Program, VMError> {
    assemble_source_with_name(source.into(), "<source>")
}

/// Assembles source with an associated filename for error diagnostics.
fn assemble_source_with_name(source: String, source_name: &str) -> Result<Program, VMError> {
    let result = assemble_lines(&source);
    if let Err(err) = &result {
        log_assembly_error(source_name, &source, err);
    }
    result
}

/// Convenience: assemble directly from file path
pub fn assemble_file<P: AsRef<Path>>(path: P) -> Result<Program, VMError> {
    let path_ref = path.as_ref();
    let source = fs::read_to_string(path_ref).map_err(|e| VMError::IoError {
        path: path_ref.display().to_string(),
        source: e.to_string(),
    })?;
    assemble_source_with_name(source, &path_ref.display().to_string())
}

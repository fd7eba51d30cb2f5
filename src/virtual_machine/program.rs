//! Bytecode program representation, decoding and static validation.
//!
//! [`decode_at`] reads one instruction with all its operands; the interpreter
//! and [`validate`] share it so a program accepted at task creation never
//! trips over malformed encodings while running.

use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::host::{ClassRegistry, SymbolTable};
use crate::virtual_machine::isa::{
    HEADER, Instruction, MAX_HOST_ARGS, MAX_OPERANDS, OperandKind, REGISTER_COUNT, arg_tag,
};

/// Compiled program: [`HEADER`] followed by instruction bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    code: Vec<u8>,
}

impl Program {
    /// Wraps encoded instructions with the program header.
    pub fn from_body(body: &[u8]) -> Self {
        let mut code = Vec::with_capacity(HEADER.len() + body.len());
        code.extend_from_slice(&HEADER);
        code.extend_from_slice(body);
        Self { code }
    }

    /// Full program bytes as stored in a slot.
    pub fn to_bytes(&self) -> &[u8] {
        &self.code
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.code
    }

    /// Instruction bytes without the header.
    pub fn body(&self) -> &[u8] {
        &self.code[HEADER.len()..]
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.len() == HEADER.len()
    }
}

/// Argument of a `CALL_HOST` instruction as encoded in bytecode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostArg<'a> {
    Sym(&'a str),
    Int(i64),
    Bool(bool),
    Reg(u8),
    Nil,
}

/// Decoded argument list of a `CALL_HOST` instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArgList<'a> {
    items: [HostArg<'a>; MAX_HOST_ARGS],
    len: usize,
}

impl<'a> ArgList<'a> {
    pub fn as_slice(&self) -> &[HostArg<'a>] {
        &self.items[..self.len]
    }
}

/// Decoded operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand<'a> {
    Unused,
    Reg(u8),
    Bool(bool),
    U32(u32),
    I64(i64),
    /// Jump offset relative to the opcode byte.
    Offset(i32),
    Str(&'a str),
    Args(ArgList<'a>),
}

/// One decoded instruction.
#[derive(Clone, Copy, Debug)]
pub struct Decoded<'a> {
    pub instr: Instruction,
    pub operands: [Operand<'a>; MAX_OPERANDS],
    /// Offset of the opcode byte.
    pub offset: usize,
    /// Encoded size in bytes.
    pub len: usize,
}

struct Cursor<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, count: usize) -> Result<&'a [u8], VMError> {
        let end = self
            .pos
            .checked_add(count)
            .filter(|end| *end <= self.code.len())
            .ok_or(VMError::UnexpectedEndOfBytecode { offset: self.pos })?;
        let bytes = &self.code[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], VMError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, VMError> {
        Ok(self.take(1)?[0])
    }

    fn reg(&mut self) -> Result<u8, VMError> {
        let reg = self.u8()?;
        if reg as usize >= REGISTER_COUNT {
            return Err(VMError::InvalidRegisterIndex(reg));
        }
        Ok(reg)
    }

    fn bool(&mut self) -> Result<bool, VMError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(VMError::InvalidOperand {
                expected: "bool",
                token: other.to_string(),
            }),
        }
    }

    fn str(&mut self) -> Result<&'a str, VMError> {
        let at = self.pos;
        let len = self.u8()? as usize;
        std::str::from_utf8(self.take(len)?).map_err(|_| VMError::InvalidUtf8 { offset: at })
    }

    fn args(&mut self) -> Result<ArgList<'a>, VMError> {
        let count = self.u8()? as usize;
        if count > MAX_HOST_ARGS {
            return Err(VMError::TooManyArguments {
                count,
                max: MAX_HOST_ARGS,
            });
        }
        let mut items = [HostArg::Nil; MAX_HOST_ARGS];
        for item in items.iter_mut().take(count) {
            let at = self.pos;
            *item = match self.u8()? {
                arg_tag::SYM => HostArg::Sym(self.str()?),
                arg_tag::INT => HostArg::Int(i64::from_le_bytes(self.array()?)),
                arg_tag::BOOL => HostArg::Bool(self.bool()?),
                arg_tag::REG => HostArg::Reg(self.reg()?),
                arg_tag::NIL => HostArg::Nil,
                tag => return Err(VMError::InvalidArgumentTag { tag, offset: at }),
            };
        }
        Ok(ArgList { items, len: count })
    }

    fn operand(&mut self, kind: OperandKind) -> Result<Operand<'a>, VMError> {
        Ok(match kind {
            OperandKind::Reg => Operand::Reg(self.reg()?),
            OperandKind::Bool => Operand::Bool(self.bool()?),
            OperandKind::ImmU32 => Operand::U32(u32::from_le_bytes(self.array()?)),
            OperandKind::ImmI64 => Operand::I64(i64::from_le_bytes(self.array()?)),
            OperandKind::Offset => Operand::Offset(i32::from_le_bytes(self.array()?)),
            OperandKind::Str => Operand::Str(self.str()?),
            OperandKind::Args => Operand::Args(self.args()?),
        })
    }
}

/// Decodes the instruction starting at `offset`.
pub fn decode_at(code: &[u8], offset: usize) -> Result<Decoded<'_>, VMError> {
    let opcode = *code
        .get(offset)
        .ok_or(VMError::UnexpectedEndOfBytecode { offset })?;
    let instr = Instruction::try_from(opcode)
        .map_err(|_| VMError::InvalidInstruction { opcode, offset })?;

    let mut cursor = Cursor {
        code,
        pos: offset + 1,
    };
    let mut operands = [Operand::Unused; MAX_OPERANDS];
    for (slot, kind) in operands.iter_mut().zip(instr.operands()) {
        *slot = cursor.operand(*kind)?;
    }

    Ok(Decoded {
        instr,
        operands,
        offset,
        len: cursor.pos - offset,
    })
}

/// Returns the absolute target of a relative jump, if it stays addressable.
pub fn jump_target(offset: usize, relative: i32) -> Option<usize> {
    usize::try_from(offset as i64 + relative as i64).ok()
}

/// Checks a program before a task is created for it.
///
/// Verifies the header, every opcode and operand encoding, that jumps land on
/// instruction boundaries (or the end of the program), and that every host
/// method and symbol it references is registered.
pub fn validate(
    code: &[u8],
    classes: &ClassRegistry,
    symbols: &SymbolTable,
) -> Result<(), VMError> {
    if code.len() < HEADER.len() || code[..HEADER.len()] != HEADER {
        return Err(VMError::InvalidHeader);
    }

    let mut boundaries = vec![false; code.len() + 1];
    let mut jumps: Vec<(usize, i32)> = Vec::new();
    let mut offset = HEADER.len();

    while offset < code.len() {
        let decoded = decode_at(code, offset)?;
        boundaries[offset] = true;

        for operand in decoded.operands.iter() {
            match operand {
                Operand::Offset(rel) => jumps.push((offset, *rel)),
                Operand::Args(args) => {
                    for arg in args.as_slice() {
                        if let HostArg::Sym(name) = arg
                            && symbols.lookup(name).is_none()
                        {
                            return Err(VMError::UnknownSymbol(name.to_string()));
                        }
                    }
                }
                _ => {}
            }
        }

        if let (Instruction::CallHost, [_, Operand::Str(class), Operand::Str(method), _]) =
            (decoded.instr, decoded.operands)
            && classes.find(class, method).is_none()
        {
            return Err(VMError::UndefinedMethod {
                class: class.to_string(),
                method: method.to_string(),
            });
        }

        offset += decoded.len;
    }
    boundaries[code.len()] = true;

    for (at, rel) in jumps {
        let valid = jump_target(at, rel)
            .filter(|target| *target >= HEADER.len())
            .and_then(|target| boundaries.get(target).copied())
            .unwrap_or(false);
        if !valid {
            return Err(VMError::InvalidJumpTarget {
                offset: at,
                target: at as i64 + rel as i64,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::host::HostCall;
    use crate::virtual_machine::vm::Value;

    fn nop(_: &mut HostCall<'_>, _: &[Value]) -> Result<Value, VMError> {
        Ok(Value::Nil)
    }

    fn registry() -> (ClassRegistry, SymbolTable) {
        let mut classes = ClassRegistry::default();
        classes.define_method("LED", "set", nop).unwrap();
        let mut symbols = SymbolTable::default();
        symbols.intern("led1");
        (classes, symbols)
    }

    fn call_led_set(symbol: &str) -> Vec<u8> {
        let mut body = vec![Instruction::CallHost as u8, 0];
        body.push(3);
        body.extend_from_slice(b"LED");
        body.push(3);
        body.extend_from_slice(b"set");
        body.push(2);
        body.push(arg_tag::SYM);
        body.push(symbol.len() as u8);
        body.extend_from_slice(symbol.as_bytes());
        body.push(arg_tag::BOOL);
        body.push(1);
        body
    }

    #[test]
    fn decode_load_i64() {
        let mut code = vec![Instruction::LoadI64 as u8, 3];
        code.extend_from_slice(&(-7i64).to_le_bytes());
        let decoded = decode_at(&code, 0).unwrap();
        assert_eq!(decoded.instr, Instruction::LoadI64);
        assert_eq!(decoded.len, 10);
        assert_eq!(decoded.operands[0], Operand::Reg(3));
        assert_eq!(decoded.operands[1], Operand::I64(-7));
        assert_eq!(decoded.operands[2], Operand::Unused);
    }

    #[test]
    fn decode_call_host_arguments() {
        let code = call_led_set("led1");
        let decoded = decode_at(&code, 0).unwrap();
        let Operand::Args(args) = decoded.operands[3] else {
            panic!("expected argument list");
        };
        assert_eq!(args.as_slice(), &[HostArg::Sym("led1"), HostArg::Bool(true)]);
        assert_eq!(decoded.len, code.len());
    }

    #[test]
    fn decode_rejects_truncation_and_bad_registers() {
        assert_eq!(
            decode_at(&[Instruction::SleepMs as u8, 1, 0], 0).unwrap_err(),
            VMError::UnexpectedEndOfBytecode { offset: 1 }
        );
        assert_eq!(
            decode_at(&[Instruction::Move as u8, 0, 16], 0).unwrap_err(),
            VMError::InvalidRegisterIndex(16)
        );
        assert_eq!(
            decode_at(&[0xEE], 0).unwrap_err(),
            VMError::InvalidInstruction {
                opcode: 0xEE,
                offset: 0
            }
        );
    }

    #[test]
    fn validate_accepts_known_methods() {
        let (classes, symbols) = registry();
        let program = Program::from_body(&call_led_set("led1"));
        assert_eq!(validate(program.to_bytes(), &classes, &symbols), Ok(()));
    }

    #[test]
    fn validate_rejects_unknown_symbols_and_methods() {
        let (classes, symbols) = registry();
        let program = Program::from_body(&call_led_set("led7"));
        assert_eq!(
            validate(program.to_bytes(), &classes, &symbols),
            Err(VMError::UnknownSymbol("led7".into()))
        );

        let mut body = call_led_set("led1");
        body[3..6].copy_from_slice(b"LEX");
        let program = Program::from_body(&body);
        assert!(matches!(
            validate(program.to_bytes(), &classes, &symbols),
            Err(VMError::UndefinedMethod { .. })
        ));
    }

    #[test]
    fn validate_rejects_missing_header() {
        let (classes, symbols) = registry();
        assert_eq!(
            validate(&[Instruction::Halt as u8], &classes, &symbols),
            Err(VMError::InvalidHeader)
        );
        assert_eq!(
            validate(b"SVM\x02", &classes, &symbols),
            Err(VMError::InvalidHeader)
        );
    }

    #[test]
    fn validate_checks_jump_targets() {
        let (classes, symbols) = registry();
        // JUMP back onto itself is fine; a jump into the operand bytes is not.
        let mut body = vec![Instruction::Jump as u8];
        body.extend_from_slice(&0i32.to_le_bytes());
        assert_eq!(
            validate(Program::from_body(&body).to_bytes(), &classes, &symbols),
            Ok(())
        );

        let mut body = vec![Instruction::Jump as u8];
        body.extend_from_slice(&2i32.to_le_bytes());
        assert_eq!(
            validate(Program::from_body(&body).to_bytes(), &classes, &symbols),
            Err(VMError::InvalidJumpTarget {
                offset: 4,
                target: 6
            })
        );

        let mut body = vec![Instruction::Jump as u8];
        body.extend_from_slice(&(-4i32).to_le_bytes());
        assert!(validate(Program::from_body(&body).to_bytes(), &classes, &symbols).is_err());
    }

    #[test]
    fn jump_to_program_end_is_allowed() {
        let (classes, symbols) = registry();
        let mut body = vec![Instruction::Jump as u8];
        body.extend_from_slice(&5i32.to_le_bytes());
        assert_eq!(
            validate(Program::from_body(&body).to_bytes(), &classes, &symbols),
            Ok(())
        );
    }

    #[test]
    fn header_only_program_is_empty() {
        let program = Program::from_body(&[]);
        assert!(program.is_empty());
        assert_eq!(program.len(), 4);
    }
}

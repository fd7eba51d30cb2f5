use slotvm_derive::Error;

/// Errors that can occur during assembly, program validation or execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VMError {
    /// Unknown opcode encountered in bytecode.
    #[error("invalid instruction 0x{opcode:02X} at offset {offset}")]
    InvalidInstruction { opcode: u8, offset: usize },
    /// Unrecognized instruction mnemonic during assembly.
    #[error("invalid instruction name: {0}")]
    InvalidInstructionName(String),
    /// Wrong number of operands for an instruction.
    #[error("{instruction} expects {expected} operands, got {actual}")]
    ArityMismatch {
        instruction: String,
        expected: usize,
        actual: usize,
    },
    /// Expected a register operand (e.g., `r0`) but got something else.
    #[error("expected register, got {0}")]
    ExpectedRegister(String),
    /// Register token malformed or out of range.
    #[error("invalid register {0}")]
    InvalidRegister(String),
    /// Register index in bytecode exceeds the register file size.
    #[error("register index {0} out of bounds")]
    InvalidRegisterIndex(u8),
    /// Operand token could not be parsed as the expected kind.
    #[error("invalid {expected} operand: {token}")]
    InvalidOperand {
        expected: &'static str,
        token: String,
    },
    /// Bytecode ended unexpectedly while reading an instruction.
    #[error("unexpected end of bytecode at offset {offset}")]
    UnexpectedEndOfBytecode { offset: usize },
    /// Program does not start with the expected magic and version.
    #[error("missing or unsupported program header")]
    InvalidHeader,
    /// Jump lands outside the program or inside an instruction.
    #[error("jump at offset {offset} targets {target}, which is not an instruction boundary")]
    InvalidJumpTarget { offset: usize, target: i64 },
    /// String operand is not valid UTF-8.
    #[error("invalid utf8 in string at offset {offset}")]
    InvalidUtf8 { offset: usize },
    /// Unknown host argument tag.
    #[error("invalid argument tag {tag} at offset {offset}")]
    InvalidArgumentTag { tag: u8, offset: usize },
    /// More host arguments than a call can pass.
    #[error("{count} host arguments exceed the limit of {max}")]
    TooManyArguments { count: usize, max: usize },
    /// Symbol literal not present in the symbol table.
    #[error("unknown symbol :{0}")]
    UnknownSymbol(String),
    /// `CALL_HOST` names a class or method that is not registered.
    #[error("undefined method {class}.{method}")]
    UndefinedMethod { class: String, method: String },
    /// A host method was registered twice.
    #[error("method {class}.{method} is already defined")]
    MethodAlreadyDefined { class: String, method: String },
    /// Host method called with the wrong number of arguments.
    #[error("{method} expects {expected} arguments, got {actual}")]
    ArgumentCount {
        method: &'static str,
        expected: usize,
        actual: usize,
    },
    /// Operand or argument has the wrong runtime type.
    #[error("{context} expected {expected} but got {actual}")]
    TypeMismatch {
        context: &'static str,
        expected: &'static str,
        actual: &'static str,
    },
    /// Host driver failure surfaced to the script.
    #[error("host call failed: {0}")]
    Host(String),
    /// Not enough room left in the heap arena.
    #[error("heap exhausted: requested {requested} bytes, {free} free")]
    HeapExhausted { requested: usize, free: usize },
    /// The heap arena itself could not be allocated.
    #[error("failed to allocate a {0} byte heap")]
    HeapAllocation(usize),
    /// Every task slot of the VM is taken.
    #[error("task limit of {0} reached")]
    TooManyTasks(usize),
    /// A bounded lock acquisition timed out.
    #[error("vm is busy")]
    Busy,
    /// Tokenizer failure with source location.
    #[error("line {line}:{offset}: {message}")]
    ParseError {
        line: usize,
        offset: usize,
        message: &'static str,
    },
    /// Assembly error with source location.
    #[error("line {line}:{offset}: {source}")]
    AssemblyError {
        line: usize,
        offset: usize,
        source: String,
    },
    /// Label defined more than once.
    #[error("duplicate label: {0}")]
    DuplicateLabel(String),
    /// Reference to undefined label.
    #[error("undefined label: {0}")]
    UndefinedLabel(String),
    /// File I/O error during assembly.
    #[error("failed to read {path}: {source}")]
    IoError { path: String, source: String },
}

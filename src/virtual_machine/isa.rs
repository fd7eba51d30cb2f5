//! Instruction Set Architecture (ISA) definitions.
//!
//! The [`for_each_instruction!`](crate::for_each_instruction) macro holds the
//! canonical instruction list and invokes a callback macro for code
//! generation, so the interpreter and the assembler never disagree on opcodes
//! or operand layouts.
//!
//! This module generates:
//! - The [`Instruction`] enum with opcode mappings
//! - `TryFrom<u8>` for decoding opcodes
//! - [`Instruction::operands`] describing the operand layout
//!
//! # Bytecode Format
//!
//! A program starts with the 4-byte [`HEADER`], followed by instructions with
//! variable-length encoding:
//! - Opcode: 1 byte
//! - Register: 1 byte (index below [`REGISTER_COUNT`])
//! - Boolean: 1 byte (0 = false, 1 = true)
//! - Immediate u32 / i64: 4 / 8 bytes (little-endian)
//! - Jump offset: 4 bytes (i32, little-endian, relative to the opcode byte)
//! - String: 1 length byte followed by UTF-8 bytes
//! - Host arguments: 1 count byte, then per argument a tag byte and its payload

use crate::virtual_machine::errors::VMError;

/// Magic bytes and format version at the start of every program.
pub const HEADER: [u8; 4] = *b"SVM\x01";
/// Registers per task.
pub const REGISTER_COUNT: usize = 16;
/// Most arguments a single `CALL_HOST` may pass.
pub const MAX_HOST_ARGS: usize = 4;
/// Most operands any instruction carries.
pub const MAX_OPERANDS: usize = 4;

/// Host argument tags in the `Args` operand encoding.
pub mod arg_tag {
    pub const SYM: u8 = 0;
    pub const INT: u8 = 1;
    pub const BOOL: u8 = 2;
    pub const REG: u8 = 3;
    pub const NIL: u8 = 4;
}

/// Invokes a callback macro with the complete instruction definition list.
#[macro_export]
macro_rules! for_each_instruction {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Scheduling
            // =========================
            /// HALT ; ends the task
            Halt = 0x00, "HALT" => [],
            /// PASS ; yields the rest of the time slice
            Pass = 0x01, "PASS" => [],
            /// SLEEP_MS ms ; suspends the task for `ms` ticks
            SleepMs = 0x02, "SLEEP_MS" => [ms: ImmU32],
            // =========================
            // Registers
            // =========================
            /// LOAD_BOOL rd, true|false ; rd = true|false
            LoadBool = 0x10, "LOAD_BOOL" => [rd: Reg, value: Bool],
            /// LOAD_I64 rd, imm64 ; rd = imm64
            LoadI64 = 0x11, "LOAD_I64" => [rd: Reg, imm: ImmI64],
            /// LOAD_NIL rd ; rd = nil
            LoadNil = 0x12, "LOAD_NIL" => [rd: Reg],
            /// MOVE rd, rs ; rd = rs
            Move = 0x13, "MOVE" => [rd: Reg, rs: Reg],
            /// NOT rd, rs ; rd = !truthy(rs)
            Not = 0x14, "NOT" => [rd: Reg, rs: Reg],
            /// EQ rd, rs1, rs2 ; rd = (rs1 == rs2)
            Eq = 0x15, "EQ" => [rd: Reg, rs1: Reg, rs2: Reg],
            /// EQ_I64 rd, rs, imm64 ; rd = (rs == imm64)
            EqI64 = 0x16, "EQ_I64" => [rd: Reg, rs: Reg, imm: ImmI64],
            /// ADD_I64 rd, rs, imm64 ; rd = rs + imm64 (wrapping)
            AddI64 = 0x17, "ADD_I64" => [rd: Reg, rs: Reg, imm: ImmI64],
            // =========================
            // Control Flow
            // =========================
            /// JUMP label ; PC += offset
            Jump = 0x20, "JUMP" => [offset: Offset],
            /// JUMP_IF rs, label ; if truthy(rs) then PC += offset
            JumpIf = 0x21, "JUMP_IF" => [rs: Reg, offset: Offset],
            /// JUMP_UNLESS rs, label ; if !truthy(rs) then PC += offset
            JumpUnless = 0x22, "JUMP_UNLESS" => [rs: Reg, offset: Offset],
            // =========================
            // Host interface
            // =========================
            /// PUTS "text" ; writes a line to the device console
            Puts = 0x30, "PUTS" => [text: Str],
            /// CALL_HOST rd, "Class", "method", args... ; rd = Class.method(args)
            CallHost = 0x31, "CALL_HOST" => [rd: Reg, class: Str, method: Str, args: Args],
        }
    };
}

#[macro_export]
macro_rules! define_instructions {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:expr, $mnemonic:literal => [
                $( $field:ident : $kind:ident ),* $(,)?
            ]
        ),* $(,)?
    ) => {
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub enum Instruction {
            $(
                $(#[$doc])*
                $name = $opcode,
            )*
        }

        impl TryFrom<u8> for Instruction {
            type Error = VMError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $opcode => Ok(Instruction::$name), )*
                    _ => Err(VMError::InvalidInstruction {
                        opcode: value,
                        offset: 0,
                    }),
                }
            }
        }

        impl Instruction {
            /// Every instruction, in opcode order.
            pub const ALL: &'static [Instruction] = &[ $( Instruction::$name, )* ];

            /// Returns the assembly mnemonic for this instruction.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Instruction::$name => $mnemonic, )*
                }
            }

            /// Looks up an instruction by its assembly mnemonic.
            pub fn from_mnemonic(name: &str) -> Result<Instruction, VMError> {
                match name {
                    $( $mnemonic => Ok(Instruction::$name), )*
                    _ => Err(VMError::InvalidInstructionName(name.to_string())),
                }
            }

            /// Operand layout following the opcode byte.
            pub const fn operands(&self) -> &'static [OperandKind] {
                match self {
                    $( Instruction::$name => &[ $( OperandKind::$kind ),* ], )*
                }
            }
        }
    };
}

/// Encoding class of an instruction operand.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OperandKind {
    Reg,
    Bool,
    ImmU32,
    ImmI64,
    Offset,
    Str,
    Args,
}

for_each_instruction!(define_instructions);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_try_from_invalid() {
        assert!(matches!(
            Instruction::try_from(0xFF),
            Err(VMError::InvalidInstruction { opcode: 0xFF, .. })
        ));
    }

    #[test]
    fn opcodes_round_trip() {
        for instr in Instruction::ALL {
            assert_eq!(Instruction::try_from(*instr as u8).unwrap(), *instr);
            assert_eq!(Instruction::from_mnemonic(instr.mnemonic()).unwrap(), *instr);
        }
    }

    #[test]
    fn operand_layouts() {
        assert!(Instruction::Halt.operands().is_empty());
        assert_eq!(
            Instruction::CallHost.operands(),
            &[
                OperandKind::Reg,
                OperandKind::Str,
                OperandKind::Str,
                OperandKind::Args
            ]
        );
        assert!(
            Instruction::ALL
                .iter()
                .all(|i| i.operands().len() <= MAX_OPERANDS)
        );
    }

    #[test]
    fn unknown_mnemonic_is_rejected() {
        assert!(matches!(
            Instruction::from_mnemonic("ADD"),
            Err(VMError::InvalidInstructionName(name)) if name == "ADD"
        ));
    }
}

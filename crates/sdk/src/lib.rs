//! ilsplice SDK - Host instruction set type definitions
//!
//! This crate contains the plain data types that describe a host method
//! body: opcodes, operands, member references and instructions, plus the
//! runtime values passed to extension callbacks. It has no dependencies
//! and compiles quickly, allowing parallel compilation of dependent crates.
//!
//! # Modules
//!
//! - [`body`] - Flat method body exchanged with the host
//! - [`opcode`] - Opcodes, mnemonics and control-flow classification
//! - [`operand`] - Labels, member references and the operand union
//! - [`instruction`] - Instruction records and stack effects
//! - [`value`] - Values handed to callbacks at runtime

pub mod body;
pub mod instruction;
pub mod opcode;
pub mod operand;
pub mod value;

pub use body::MethodBody;
pub use instruction::{Instruction, StackEffect};
pub use opcode::{FlowKind, OpCode, UnknownOpCode};
pub use operand::{FieldRef, Label, MethodRef, Operand, TypeRef};
pub use value::{ObjectRef, Value};

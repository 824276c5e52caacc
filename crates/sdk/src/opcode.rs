//! Opcode definitions for host method bodies
//!
//! Covers the subset of the stack-machine instruction set the host binary
//! actually compiles to. Mnemonics follow the host disassembler's spelling
//! so anchor patterns in gamedata files read the same as a dump.

use std::fmt;
use std::str::FromStr;

/// Instruction opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Nop,

    // Arguments and locals
    Ldarg,
    Ldarga,
    Starg,
    Ldloc,
    Ldloca,
    Stloc,

    // Constants
    Ldnull,
    LdcI4,
    LdcI8,
    LdcR4,
    LdcR8,
    Ldstr,

    // Stack shuffling
    Dup,
    Pop,

    // Fields
    Ldfld,
    Ldflda,
    Stfld,
    Ldsfld,
    Stsfld,

    // Calls
    Call,
    Callvirt,
    Newobj,
    Ret,

    // Control flow
    Br,
    Brfalse,
    Brtrue,
    Beq,
    Bne,
    Bge,
    Bgt,
    Ble,
    Blt,
    Switch,
    Leave,
    Endfinally,
    Throw,

    // Type tests and conversions
    Isinst,
    Castclass,
    Box,
    Unbox,
    ConvI4,
    ConvR4,

    // Arithmetic and comparison
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    And,
    Or,
    Not,
    Ceq,
    Cgt,
    Clt,
}

/// How an opcode transfers control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    /// Falls through to the next instruction
    Next,
    /// Unconditional jump to a label
    Branch,
    /// Jump to a label or fall through
    CondBranch,
    /// Leaves the method or protected region
    Return,
    /// Raises an exception
    Throw,
    /// Invokes another method, then falls through
    Call,
}

impl OpCode {
    /// Every opcode, in declaration order
    pub const ALL: &'static [OpCode] = &[
        Self::Nop,
        Self::Ldarg,
        Self::Ldarga,
        Self::Starg,
        Self::Ldloc,
        Self::Ldloca,
        Self::Stloc,
        Self::Ldnull,
        Self::LdcI4,
        Self::LdcI8,
        Self::LdcR4,
        Self::LdcR8,
        Self::Ldstr,
        Self::Dup,
        Self::Pop,
        Self::Ldfld,
        Self::Ldflda,
        Self::Stfld,
        Self::Ldsfld,
        Self::Stsfld,
        Self::Call,
        Self::Callvirt,
        Self::Newobj,
        Self::Ret,
        Self::Br,
        Self::Brfalse,
        Self::Brtrue,
        Self::Beq,
        Self::Bne,
        Self::Bge,
        Self::Bgt,
        Self::Ble,
        Self::Blt,
        Self::Switch,
        Self::Leave,
        Self::Endfinally,
        Self::Throw,
        Self::Isinst,
        Self::Castclass,
        Self::Box,
        Self::Unbox,
        Self::ConvI4,
        Self::ConvR4,
        Self::Add,
        Self::Sub,
        Self::Mul,
        Self::Div,
        Self::Neg,
        Self::And,
        Self::Or,
        Self::Not,
        Self::Ceq,
        Self::Cgt,
        Self::Clt,
    ];

    /// Disassembler mnemonic
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Self::Nop => "nop",
            Self::Ldarg => "ldarg",
            Self::Ldarga => "ldarga",
            Self::Starg => "starg",
            Self::Ldloc => "ldloc",
            Self::Ldloca => "ldloca",
            Self::Stloc => "stloc",
            Self::Ldnull => "ldnull",
            Self::LdcI4 => "ldc.i4",
            Self::LdcI8 => "ldc.i8",
            Self::LdcR4 => "ldc.r4",
            Self::LdcR8 => "ldc.r8",
            Self::Ldstr => "ldstr",
            Self::Dup => "dup",
            Self::Pop => "pop",
            Self::Ldfld => "ldfld",
            Self::Ldflda => "ldflda",
            Self::Stfld => "stfld",
            Self::Ldsfld => "ldsfld",
            Self::Stsfld => "stsfld",
            Self::Call => "call",
            Self::Callvirt => "callvirt",
            Self::Newobj => "newobj",
            Self::Ret => "ret",
            Self::Br => "br",
            Self::Brfalse => "brfalse",
            Self::Brtrue => "brtrue",
            Self::Beq => "beq",
            Self::Bne => "bne.un",
            Self::Bge => "bge",
            Self::Bgt => "bgt",
            Self::Ble => "ble",
            Self::Blt => "blt",
            Self::Switch => "switch",
            Self::Leave => "leave",
            Self::Endfinally => "endfinally",
            Self::Throw => "throw",
            Self::Isinst => "isinst",
            Self::Castclass => "castclass",
            Self::Box => "box",
            Self::Unbox => "unbox.any",
            Self::ConvI4 => "conv.i4",
            Self::ConvR4 => "conv.r4",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Neg => "neg",
            Self::And => "and",
            Self::Or => "or",
            Self::Not => "not",
            Self::Ceq => "ceq",
            Self::Cgt => "cgt",
            Self::Clt => "clt",
        }
    }

    /// Control-flow classification
    pub fn flow(&self) -> FlowKind {
        match self {
            Self::Br | Self::Leave => FlowKind::Branch,
            Self::Brfalse
            | Self::Brtrue
            | Self::Beq
            | Self::Bne
            | Self::Bge
            | Self::Bgt
            | Self::Ble
            | Self::Blt
            | Self::Switch => FlowKind::CondBranch,
            Self::Ret | Self::Endfinally => FlowKind::Return,
            Self::Throw => FlowKind::Throw,
            Self::Call | Self::Callvirt | Self::Newobj => FlowKind::Call,
            _ => FlowKind::Next,
        }
    }

    /// Check if this opcode carries one or more label operands
    pub fn is_branch(&self) -> bool {
        matches!(self.flow(), FlowKind::Branch | FlowKind::CondBranch)
    }

    /// Check if control can reach the following instruction
    pub fn falls_through(&self) -> bool {
        !matches!(
            self.flow(),
            FlowKind::Branch | FlowKind::Return | FlowKind::Throw
        )
    }

    /// Check if this is a pure load: pushes one value, pops nothing,
    /// and has no side effects
    pub fn is_pure_load(&self) -> bool {
        matches!(
            self,
            Self::Ldarg
                | Self::Ldloc
                | Self::Ldnull
                | Self::LdcI4
                | Self::LdcI8
                | Self::LdcR4
                | Self::LdcR8
                | Self::Ldstr
                | Self::Ldsfld
        )
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Error returned when a mnemonic is not recognised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownOpCode(pub String);

impl fmt::Display for UnknownOpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown opcode mnemonic: {}", self.0)
    }
}

impl std::error::Error for UnknownOpCode {}

impl FromStr for OpCode {
    type Err = UnknownOpCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        if let Some(op) = Self::ALL.iter().find(|op| op.mnemonic() == wanted) {
            return Ok(*op);
        }
        // Short forms (ldarg.0, ldloc.s, brfalse.s) collapse onto the base opcode
        let base = match wanted.as_str() {
            "bne" => "bne.un",
            "unbox" => "unbox.any",
            other => other
                .strip_suffix(".s")
                .unwrap_or(other)
                .trim_end_matches(|c: char| c.is_ascii_digit())
                .trim_end_matches('.'),
        };
        let base = if base == "ldc.i" { "ldc.i4" } else { base };
        Self::ALL
            .iter()
            .copied()
            .find(|op| op.mnemonic() == base)
            .ok_or(UnknownOpCode(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_classification() {
        assert_eq!(OpCode::Brfalse.flow(), FlowKind::CondBranch);
        assert_eq!(OpCode::Br.flow(), FlowKind::Branch);
        assert_eq!(OpCode::Ret.flow(), FlowKind::Return);
        assert!(OpCode::Brtrue.is_branch());
        assert!(!OpCode::Br.falls_through());
        assert!(OpCode::Callvirt.falls_through());
    }

    #[test]
    fn test_parse_mnemonics() {
        assert_eq!("ldfld".parse::<OpCode>().unwrap(), OpCode::Ldfld);
        assert_eq!("brfalse.s".parse::<OpCode>().unwrap(), OpCode::Brfalse);
        assert_eq!("ldarg.0".parse::<OpCode>().unwrap(), OpCode::Ldarg);
        assert_eq!("ldc.i4".parse::<OpCode>().unwrap(), OpCode::LdcI4);
        assert_eq!("ldc.r4".parse::<OpCode>().unwrap(), OpCode::LdcR4);
        assert_eq!("ldc.i8".parse::<OpCode>().unwrap(), OpCode::LdcI8);
        assert_eq!("ldc.i4.0".parse::<OpCode>().unwrap(), OpCode::LdcI4);
        assert_eq!("bne.un.s".parse::<OpCode>().unwrap(), OpCode::Bne);
        assert!("frobnicate".parse::<OpCode>().is_err());
    }
}

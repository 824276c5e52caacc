//! Instruction records

use std::fmt;

use crate::opcode::OpCode;
use crate::operand::{FieldRef, Label, MethodRef, Operand, TypeRef};

/// Values popped and pushed by one instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackEffect {
    pub pops: u16,
    pub pushes: u16,
}

impl StackEffect {
    pub const fn new(pops: u16, pushes: u16) -> Self {
        Self { pops, pushes }
    }

    /// Net change in stack depth
    pub fn net(&self) -> i32 {
        i32::from(self.pushes) - i32::from(self.pops)
    }
}

/// One instruction of a method body
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: OpCode,
    pub operand: Operand,
}

impl Instruction {
    pub fn new(opcode: OpCode, operand: Operand) -> Self {
        Self { opcode, operand }
    }

    /// Instruction without operand
    pub fn simple(opcode: OpCode) -> Self {
        Self::new(opcode, Operand::None)
    }

    pub fn nop() -> Self {
        Self::simple(OpCode::Nop)
    }

    pub fn ldarg(index: u16) -> Self {
        Self::new(OpCode::Ldarg, Operand::Arg(index))
    }

    pub fn ldloc(index: u16) -> Self {
        Self::new(OpCode::Ldloc, Operand::Local(index))
    }

    pub fn stloc(index: u16) -> Self {
        Self::new(OpCode::Stloc, Operand::Local(index))
    }

    pub fn ldc_i4(value: i32) -> Self {
        Self::new(OpCode::LdcI4, Operand::Int(i64::from(value)))
    }

    pub fn ldc_r4(value: f32) -> Self {
        Self::new(OpCode::LdcR4, Operand::Float(f64::from(value)))
    }

    pub fn ldstr(value: impl Into<String>) -> Self {
        Self::new(OpCode::Ldstr, Operand::Str(value.into()))
    }

    pub fn ldnull() -> Self {
        Self::simple(OpCode::Ldnull)
    }

    pub fn dup() -> Self {
        Self::simple(OpCode::Dup)
    }

    pub fn pop() -> Self {
        Self::simple(OpCode::Pop)
    }

    pub fn ldfld(field: FieldRef) -> Self {
        Self::new(OpCode::Ldfld, Operand::Field(field))
    }

    pub fn stfld(field: FieldRef) -> Self {
        Self::new(OpCode::Stfld, Operand::Field(field))
    }

    pub fn ldsfld(field: FieldRef) -> Self {
        Self::new(OpCode::Ldsfld, Operand::Field(field))
    }

    pub fn call(method: MethodRef) -> Self {
        Self::new(OpCode::Call, Operand::Method(method))
    }

    pub fn callvirt(method: MethodRef) -> Self {
        Self::new(OpCode::Callvirt, Operand::Method(method))
    }

    pub fn newobj(ctor: MethodRef) -> Self {
        Self::new(OpCode::Newobj, Operand::Method(ctor))
    }

    pub fn isinst(ty: TypeRef) -> Self {
        Self::new(OpCode::Isinst, Operand::Type(ty))
    }

    pub fn br(target: Label) -> Self {
        Self::new(OpCode::Br, Operand::Label(target))
    }

    pub fn brfalse(target: Label) -> Self {
        Self::new(OpCode::Brfalse, Operand::Label(target))
    }

    pub fn brtrue(target: Label) -> Self {
        Self::new(OpCode::Brtrue, Operand::Label(target))
    }

    pub fn ret() -> Self {
        Self::simple(OpCode::Ret)
    }

    /// Labels this instruction may jump to
    pub fn branch_targets(&self) -> &[Label] {
        if self.opcode.is_branch() {
            self.operand.labels()
        } else {
            &[]
        }
    }

    /// Rewrite every label operand through `map`
    pub fn map_labels(&mut self, mut map: impl FnMut(Label) -> Label) {
        match &mut self.operand {
            Operand::Label(label) => *label = map(*label),
            Operand::Labels(labels) => labels.iter_mut().for_each(|l| *l = map(*l)),
            _ => {}
        }
    }

    /// Field operand, if any
    pub fn field(&self) -> Option<&FieldRef> {
        match &self.operand {
            Operand::Field(f) => Some(f),
            _ => None,
        }
    }

    /// Method operand, if any
    pub fn method(&self) -> Option<&MethodRef> {
        match &self.operand {
            Operand::Method(m) => Some(m),
            _ => None,
        }
    }

    /// Stack effect of this instruction.
    ///
    /// `ret`, `leave` and `endfinally` report no pops; callers that track
    /// depth treat them as block terminators.
    pub fn stack_effect(&self) -> StackEffect {
        use OpCode::*;

        match self.opcode {
            Nop | Br | Leave | Endfinally | Ret => StackEffect::new(0, 0),
            Ldarg | Ldarga | Ldloc | Ldloca | Ldnull | LdcI4 | LdcI8 | LdcR4 | LdcR8 | Ldstr
            | Ldsfld => StackEffect::new(0, 1),
            Starg | Stloc | Stsfld | Pop | Throw => StackEffect::new(1, 0),
            Dup => StackEffect::new(1, 2),
            Ldfld | Ldflda => StackEffect::new(1, 1),
            Stfld => StackEffect::new(2, 0),
            Brfalse | Brtrue | Switch => StackEffect::new(1, 0),
            Beq | Bne | Bge | Bgt | Ble | Blt => StackEffect::new(2, 0),
            Isinst | Castclass | Box | Unbox | ConvI4 | ConvR4 | Neg | Not => {
                StackEffect::new(1, 1)
            }
            Add | Sub | Mul | Div | And | Or | Ceq | Cgt | Clt => StackEffect::new(2, 1),
            Call | Callvirt => self
                .method()
                .map(|m| StackEffect::new(m.call_pops(), u16::from(m.returns_value)))
                .unwrap_or_default(),
            Newobj => self
                .method()
                .map(|m| StackEffect::new(m.params, 1))
                .unwrap_or_default(),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operand {
            Operand::None => write!(f, "{}", self.opcode),
            _ => write!(f, "{} {}", self.opcode, self.operand),
        }
    }
}

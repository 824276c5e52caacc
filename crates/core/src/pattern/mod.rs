//! Instruction predicates and anchor patterns
//!
//! A [`Pattern`] is an ordered list of [`Step`]s. Each step holds a
//! [`Predicate`] and the number of unrelated instructions tolerated before
//! it, so one pattern can absorb incidental differences between builds. A
//! [`PatternSet`] lists a primary pattern and the fallbacks tried after it.
//!
//! # Example
//!
//! ```ignore
//! use ilsplice_core::pattern::{Pattern, PatternSet, Predicate};
//!
//! let anchor = PatternSet::new(
//!     Pattern::new("holding/plain")
//!         .then(Predicate::load_field("Holding"))
//!         .then(Predicate::branch_if_false()),
//! )
//! .or(Pattern::parse("holding/dup", "ldfld Holding; dup; brfalse")?);
//! ```

mod matcher;
mod parse;

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use ilsplice_sdk::{Instruction, OpCode, Operand};

pub use matcher::{find_all, find_first, find_from, match_at, MatchError, PatternMatch};
pub use parse::PatternSyntaxError;

bitflags! {
    /// Coarse opcode families for predicates that should not care which
    /// exact encoding a build picked
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpFamily: u32 {
        /// ldarg, ldloc, constants, ldsfld
        const LOAD = 0x001;
        /// starg, stloc, stfld, stsfld
        const STORE = 0x002;
        /// Instance and static field loads
        const FIELD_LOAD = 0x004;
        /// call, callvirt, newobj
        const CALL = 0x008;
        /// Unconditional branches
        const JUMP = 0x010;
        /// brtrue
        const BRANCH_TRUE = 0x020;
        /// brfalse
        const BRANCH_FALSE = 0x040;
        /// Two-operand comparison branches
        const BRANCH_COMPARE = 0x080;
        /// isinst, castclass
        const TYPE_TEST = 0x100;
        /// ret, throw, endfinally
        const EXIT = 0x200;

        const BRANCH = Self::JUMP.bits()
            | Self::BRANCH_TRUE.bits()
            | Self::BRANCH_FALSE.bits()
            | Self::BRANCH_COMPARE.bits();
    }
}

impl OpFamily {
    /// Families an opcode belongs to
    pub fn of(opcode: OpCode) -> Self {
        use OpCode::*;

        match opcode {
            Ldarg | Ldloc | Ldnull | LdcI4 | LdcI8 | LdcR4 | LdcR8 | Ldstr => Self::LOAD,
            Ldsfld => Self::LOAD | Self::FIELD_LOAD,
            Ldfld | Ldflda => Self::FIELD_LOAD,
            Starg | Stloc | Stfld | Stsfld => Self::STORE,
            Call | Callvirt | Newobj => Self::CALL,
            Br | Leave => Self::JUMP,
            Brtrue => Self::BRANCH_TRUE,
            Brfalse => Self::BRANCH_FALSE,
            Beq | Bne | Bge | Bgt | Ble | Blt | Switch => Self::BRANCH_COMPARE,
            Isinst | Castclass => Self::TYPE_TEST,
            Ret | Throw | Endfinally => Self::EXIT,
            _ => Self::empty(),
        }
    }
}

type MatchFn = dyn Fn(&Instruction) -> bool + Send + Sync;

/// Test applied to a single instruction
#[derive(Clone)]
pub struct Predicate {
    description: String,
    test: Arc<MatchFn>,
}

impl Predicate {
    /// Predicate from an arbitrary closure
    pub fn custom<F>(description: impl Into<String>, test: F) -> Self
    where
        F: Fn(&Instruction) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            test: Arc::new(test),
        }
    }

    /// Matches every instruction
    pub fn any() -> Self {
        Self::custom("*", |_| true)
    }

    /// Exact opcode
    pub fn opcode(opcode: OpCode) -> Self {
        Self::custom(opcode.mnemonic(), move |insn| insn.opcode == opcode)
    }

    /// Any opcode of a family
    pub fn family(family: OpFamily) -> Self {
        Self::custom(format!("@{family:?}"), move |insn| {
            OpFamily::of(insn.opcode).intersects(family)
        })
    }

    /// Exact opcode and operand
    pub fn exact(insn: Instruction) -> Self {
        Self::custom(insn.to_string(), move |other| *other == insn)
    }

    /// Opcode whose member operand (field, method or type) has this name.
    ///
    /// `name` may be `member` or `Owner::member`; the owner matches either
    /// the full or the short type name.
    pub fn member(opcode: OpCode, name: &str) -> Self {
        let description = format!("{} {}", opcode.mnemonic(), name);
        let (owner, member) = split_member(name);
        Self::custom(description, move |insn| {
            insn.opcode == opcode && member_matches(&insn.operand, owner.as_deref(), &member)
        })
    }

    /// Opcode with an integer-like operand (constant, argument or local index)
    pub fn with_index(opcode: OpCode, value: i64) -> Self {
        Self::custom(format!("{} {}", opcode.mnemonic(), value), move |insn| {
            insn.opcode == opcode
                && match insn.operand {
                    Operand::Int(v) => v == value,
                    Operand::Arg(i) | Operand::Local(i) => i64::from(i) == value,
                    _ => false,
                }
        })
    }

    /// Opcode with a string operand
    pub fn with_str(opcode: OpCode, value: impl Into<String>) -> Self {
        let value = value.into();
        Self::custom(format!("{} {:?}", opcode.mnemonic(), value), move |insn| {
            insn.opcode == opcode && matches!(&insn.operand, Operand::Str(s) if *s == value)
        })
    }

    /// `ldfld` of a named instance field
    pub fn load_field(name: &str) -> Self {
        Self::member(OpCode::Ldfld, name)
    }

    /// `ldsfld` of a named static field
    pub fn load_static_field(name: &str) -> Self {
        Self::member(OpCode::Ldsfld, name)
    }

    /// `call` or `callvirt` of a named method
    pub fn call(name: &str) -> Self {
        let direct = Self::member(OpCode::Call, name);
        let virt = Self::member(OpCode::Callvirt, name);
        Self::custom(format!("call {name}"), move |insn| {
            direct.matches(insn) || virt.matches(insn)
        })
    }

    /// `brfalse`
    pub fn branch_if_false() -> Self {
        Self::family(OpFamily::BRANCH_FALSE)
    }

    /// `brtrue`
    pub fn branch_if_true() -> Self {
        Self::family(OpFamily::BRANCH_TRUE)
    }

    /// Either predicate
    pub fn or(self, other: Predicate) -> Self {
        let description = format!("{}|{}", self.description, other.description);
        Self::custom(description, move |insn| {
            self.matches(insn) || other.matches(insn)
        })
    }

    /// Any of several predicates
    pub fn any_of(predicates: Vec<Predicate>) -> Self {
        let description = predicates
            .iter()
            .map(|p| p.description.as_str())
            .collect::<Vec<_>>()
            .join("|");
        Self::custom(description, move |insn| {
            predicates.iter().any(|p| p.matches(insn))
        })
    }

    /// Both predicates
    pub fn and(self, other: Predicate) -> Self {
        let description = format!("{}&{}", self.description, other.description);
        Self::custom(description, move |insn| {
            self.matches(insn) && other.matches(insn)
        })
    }

    /// Negation
    pub fn not(self) -> Self {
        let description = format!("!{}", self.description);
        Self::custom(description, move |insn| !self.matches(insn))
    }

    pub fn matches(&self, insn: &Instruction) -> bool {
        (self.test)(insn)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Predicate({})", self.description)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

fn split_member(name: &str) -> (Option<String>, String) {
    match name.rsplit_once("::") {
        Some((owner, member)) => (Some(owner.to_string()), member.to_string()),
        None => (None, name.to_string()),
    }
}

fn member_matches(operand: &Operand, owner: Option<&str>, member: &str) -> bool {
    let owner_matches = |ty: &ilsplice_sdk::TypeRef| match owner {
        None => true,
        Some(o) => ty.name == o || ty.short_name() == o,
    };

    match operand {
        Operand::Field(f) => f.name == member && owner_matches(&f.owner),
        Operand::Method(m) => m.name == member && owner_matches(&m.owner),
        Operand::Type(t) => match owner {
            // `Owner::Name` against a type means namespace `Owner`
            Some(o) => t.name == format!("{o}.{member}"),
            None => t.name == member || t.short_name() == member,
        },
        _ => false,
    }
}

/// One element of a pattern
#[derive(Debug, Clone)]
pub struct Step {
    pub predicate: Predicate,
    /// Unrelated instructions allowed between the previous step and this one
    pub max_gap: usize,
}

/// Ordered predicate list describing an anchor
#[derive(Debug, Clone)]
pub struct Pattern {
    name: String,
    steps: Vec<Step>,
}

impl Pattern {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Contiguous pattern from a predicate list
    pub fn contiguous(name: impl Into<String>, predicates: Vec<Predicate>) -> Self {
        predicates
            .into_iter()
            .fold(Self::new(name), |pattern, p| pattern.then(p))
    }

    /// Append a step that must follow immediately
    pub fn then(self, predicate: Predicate) -> Self {
        self.then_within(0, predicate)
    }

    /// Append a step that may follow after up to `max_gap` other instructions
    pub fn then_within(mut self, max_gap: usize, predicate: Predicate) -> Self {
        self.steps.push(Step { predicate, max_gap });
        self
    }

    /// Parse the compact text syntax used in gamedata files
    pub fn parse(name: impl Into<String>, text: &str) -> Result<Self, PatternSyntaxError> {
        parse::parse_pattern(name.into(), text)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [", self.name)?;
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
                if step.max_gap > 0 {
                    write!(f, "?{}; ", step.max_gap)?;
                }
            }
            write!(f, "{}", step.predicate)?;
        }
        f.write_str("]")
    }
}

/// Primary pattern followed by build-variant fallbacks, tried in order
#[derive(Debug, Clone)]
pub struct PatternSet {
    alternatives: Vec<Pattern>,
}

impl PatternSet {
    pub fn new(primary: Pattern) -> Self {
        Self {
            alternatives: vec![primary],
        }
    }

    /// Add a fallback
    pub fn or(mut self, fallback: Pattern) -> Self {
        self.alternatives.push(fallback);
        self
    }

    pub fn alternatives(&self) -> &[Pattern] {
        &self.alternatives
    }

    pub fn primary(&self) -> &Pattern {
        &self.alternatives[0]
    }

    /// Comma-separated names, for error context
    pub fn describe(&self) -> String {
        self.alternatives
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl From<Pattern> for PatternSet {
    fn from(primary: Pattern) -> Self {
        Self::new(primary)
    }
}

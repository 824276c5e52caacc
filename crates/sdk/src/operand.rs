//! Operand and member reference types
//!
//! References are symbolic (type name + member name) rather than metadata
//! tokens, since tokens are not stable between host builds.

use std::fmt;

/// Branch target marker
///
/// A label is an identity, not a position. The owning stream maps each
/// label to the instruction it currently points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Reference to a host type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeRef {
    /// Fully qualified name, e.g. `Celeste.Refill`
    pub name: String,
}

impl TypeRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Name without the namespace prefix
    pub fn short_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Reference to a field
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub owner: TypeRef,
    pub name: String,
    pub is_static: bool,
}

impl FieldRef {
    /// Instance field
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: TypeRef::new(owner),
            name: name.into(),
            is_static: false,
        }
    }

    /// Static field
    pub fn new_static(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            is_static: true,
            ..Self::new(owner, name)
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.owner, self.name)
    }
}

/// Reference to a method, carrying enough of the signature to compute
/// stack effects at call sites
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub owner: TypeRef,
    pub name: String,
    /// Number of explicit parameters (excluding `this`)
    pub params: u16,
    pub has_this: bool,
    pub returns_value: bool,
}

impl MethodRef {
    /// Static method
    pub fn new_static(
        owner: impl Into<String>,
        name: impl Into<String>,
        params: u16,
        returns_value: bool,
    ) -> Self {
        Self {
            owner: TypeRef::new(owner),
            name: name.into(),
            params,
            has_this: false,
            returns_value,
        }
    }

    /// Instance method
    pub fn new_instance(
        owner: impl Into<String>,
        name: impl Into<String>,
        params: u16,
        returns_value: bool,
    ) -> Self {
        Self {
            has_this: true,
            ..Self::new_static(owner, name, params, returns_value)
        }
    }

    /// Values popped by a call to this method
    pub fn call_pops(&self) -> u16 {
        self.params + u16::from(self.has_this)
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}/{}", self.owner, self.name, self.params)
    }
}

/// Instruction operand
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    Int(i64),
    Float(f64),
    Str(String),
    Arg(u16),
    Local(u16),
    Label(Label),
    /// Jump table for `switch`
    Labels(Vec<Label>),
    Field(FieldRef),
    Method(MethodRef),
    Type(TypeRef),
}

impl Operand {
    /// Labels referenced by this operand
    pub fn labels(&self) -> &[Label] {
        match self {
            Self::Label(label) => std::slice::from_ref(label),
            Self::Labels(labels) => labels,
            _ => &[],
        }
    }

    /// Symbolic name for member operands, used by name-based predicates
    pub fn member_name(&self) -> Option<&str> {
        match self {
            Self::Field(f) => Some(&f.name),
            Self::Method(m) => Some(&m.name),
            Self::Type(t) => Some(t.short_name()),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => Ok(()),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v:?}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Arg(i) => write!(f, "arg{i}"),
            Self::Local(i) => write!(f, "V_{i}"),
            Self::Label(l) => write!(f, "{l}"),
            Self::Labels(ls) => {
                f.write_str("(")?;
                for (i, l) in ls.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{l}")?;
                }
                f.write_str(")")
            }
            Self::Field(r) => write!(f, "{r}"),
            Self::Method(r) => write!(f, "{r}"),
            Self::Type(r) => write!(f, "{r}"),
        }
    }
}

//! Runtime values handed to extension callbacks
//!
//! The host marshals its own objects into these when it reaches an
//! injected dispatch call. Objects stay opaque: the callback side only
//! sees a handle and the concrete runtime type name.

/// Opaque handle to a live host object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub handle: u64,
    /// Concrete runtime type, e.g. `MyMod.Entities.CustomRefill`
    pub type_name: String,
}

/// A value taken off the host evaluation stack
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Object(ObjectRef),
}

impl Value {
    pub fn object(handle: u64, type_name: impl Into<String>) -> Self {
        Self::Object(ObjectRef {
            handle,
            type_name: type_name.into(),
        })
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Host truthiness: null, false and zero are false
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(v) => *v != 0,
            Self::Float(v) => *v != 0.0,
            Self::Str(_) | Self::Object(_) => true,
        }
    }
}

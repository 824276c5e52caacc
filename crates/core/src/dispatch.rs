//! Callback dispatch table
//!
//! Every splice calls `ilsplice.Dispatch::<point>`. The host routes those
//! calls here, and the dispatcher forwards them to the callback registered
//! for the point. Lookups are read-only, so patched methods may run on any
//! number of threads at once.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use ilsplice_sdk::{MethodRef, Value};

use crate::extension::{SpliceMode, DISPATCH_OWNER};

type ConsumeFn = dyn Fn(&Value) -> bool + Send + Sync;
type AugmentFn = dyn Fn(&Value, &[Value]) + Send + Sync;

/// Callback bound to one extension point
#[derive(Clone)]
pub enum Callback {
    /// `(active) -> handled`
    Consume(Arc<ConsumeFn>),
    /// `(active, context...)`
    Augment(Arc<AugmentFn>),
}

impl Callback {
    pub fn consume<F>(f: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self::Consume(Arc::new(f))
    }

    pub fn augment<F>(f: F) -> Self
    where
        F: Fn(&Value, &[Value]) + Send + Sync + 'static,
    {
        Self::Augment(Arc::new(f))
    }

    pub fn mode(&self) -> SpliceMode {
        match self {
            Self::Consume(_) => SpliceMode::Consume,
            Self::Augment(_) => SpliceMode::Augment,
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Consume(_) => f.write_str("Callback::Consume"),
            Self::Augment(_) => f.write_str("Callback::Augment"),
        }
    }
}

/// Dispatch failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("{0} is not a dispatch call")]
    NotDispatch(String),

    #[error("No callback registered for '{0}'")]
    UnknownPoint(String),

    #[error("Callback for '{0}' is already registered")]
    Duplicate(String),

    #[error("Callback for '{point}' takes {expected} arguments, got {found}")]
    Arity {
        point: String,
        expected: usize,
        found: usize,
    },
}

/// Point name to callback table
#[derive(Default)]
pub struct Dispatcher {
    callbacks: DashMap<String, Callback>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register the callback for an extension point
    ///
    /// # Arguments
    /// * `point` - Extension point name, unique across the registry
    /// * `callback` - Callback invoked by the injected dispatch call
    pub fn register(&self, point: &str, callback: Callback) -> Result<(), DispatchError> {
        use dashmap::mapref::entry::Entry;

        match self.callbacks.entry(point.to_string()) {
            Entry::Occupied(_) => Err(DispatchError::Duplicate(point.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(callback);
                Ok(())
            }
        }
    }

    /// Remove a callback; returns whether one was registered
    pub fn unregister(&self, point: &str) -> bool {
        self.callbacks.remove(point).is_some()
    }

    pub fn contains(&self, point: &str) -> bool {
        self.callbacks.contains_key(point)
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    // ========================================================================
    // Invocation
    // ========================================================================

    /// Route an injected call
    ///
    /// # Arguments
    /// * `method` - Callee of the injected `call`
    /// * `args` - Call arguments, active object first
    ///
    /// # Returns
    /// The handled flag for consume callbacks, `None` for augment callbacks
    pub fn invoke(&self, method: &MethodRef, args: &[Value]) -> Result<Option<Value>, DispatchError> {
        if method.owner.name != DISPATCH_OWNER {
            return Err(DispatchError::NotDispatch(method.to_string()));
        }
        let point = method.name.as_str();
        let expected = usize::from(method.params);
        if args.len() != expected || args.is_empty() {
            return Err(DispatchError::Arity {
                point: point.to_string(),
                expected,
                found: args.len(),
            });
        }

        match self.callback(point)? {
            Callback::Consume(f) => Ok(Some(Value::Bool(f(&args[0])))),
            Callback::Augment(f) => {
                f(&args[0], &args[1..]);
                Ok(None)
            }
        }
    }

    /// Invoke a consume callback directly
    pub fn consume(&self, point: &str, active: &Value) -> Result<bool, DispatchError> {
        match self.callback(point)? {
            Callback::Consume(f) => Ok(f(active)),
            Callback::Augment(_) => Err(DispatchError::Arity {
                point: point.to_string(),
                expected: 1,
                found: 0,
            }),
        }
    }

    /// Invoke an augment callback directly
    pub fn augment(&self, point: &str, active: &Value, context: &[Value]) -> Result<(), DispatchError> {
        match self.callback(point)? {
            Callback::Augment(f) => {
                f(active, context);
                Ok(())
            }
            Callback::Consume(_) => Err(DispatchError::Arity {
                point: point.to_string(),
                expected: 1,
                found: 1 + context.len(),
            }),
        }
    }

    /// Clone the callback out so it runs without holding a shard lock
    fn callback(&self, point: &str) -> Result<Callback, DispatchError> {
        self.callbacks
            .get(point)
            .map(|c| c.value().clone())
            .ok_or_else(|| DispatchError::UnknownPoint(point.to_string()))
    }
}

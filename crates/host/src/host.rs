//! Host reflection collaborator
//!
//! The patch engine never discovers methods on its own. It asks the host to
//! resolve a readable name to an identity, to hand over the compiled body,
//! and to activate a replacement body in place of the original.

use std::fmt;

use ilsplice_sdk::MethodBody;

use crate::error::HostError;

/// Opaque, stable identity of a host method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u64);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:04x}", self.0)
    }
}

/// Access to the host's compiled methods
///
/// Implementations must be callable from the control thread during module
/// activation and deactivation. `activate` must be all-or-nothing: either
/// the new body is live afterwards or the previous body still is.
pub trait MethodHost: Send + Sync {
    /// Resolve a human-readable method name, e.g. `Celeste.Refill::OnPlayer`
    fn resolve(&self, name: &str) -> Result<MethodId, HostError>;

    /// Readable name for diagnostics
    fn name_of(&self, id: MethodId) -> Option<String>;

    /// Currently active body of a method
    fn load_body(&self, id: MethodId) -> Result<MethodBody, HostError>;

    /// Swap in a replacement body
    fn activate(&self, id: MethodId, body: &MethodBody) -> Result<(), HostError>;

    /// Put back a previously captured body.
    ///
    /// Defaults to `activate`; hosts that keep the pristine body around can
    /// override this with a cheaper path.
    fn restore(&self, id: MethodId, original: &MethodBody) -> Result<(), HostError> {
        self.activate(id, original)
    }

    /// Diagnostic label: the readable name when known, the raw id otherwise
    fn describe(&self, id: MethodId) -> String {
        self.name_of(id).unwrap_or_else(|| id.to_string())
    }
}

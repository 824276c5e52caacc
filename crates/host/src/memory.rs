//! In-memory host
//!
//! Keeps method bodies in a table. Used for embedding the engine against
//! bodies loaded by another tool and for exercising the engine in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use ilsplice_sdk::MethodBody;

use crate::error::HostError;
use crate::host::{MethodHost, MethodId};

/// Storage for one method
struct MethodEntry {
    name: String,
    /// Body the host was built with
    pristine: MethodBody,
    /// Body currently executing
    active: MethodBody,
    /// Number of successful activations
    activations: u32,
    /// Reject activations (simulates a host that cannot swap bodies)
    locked: bool,
}

/// Table-backed [`MethodHost`]
#[derive(Default)]
pub struct MemoryHost {
    methods: RwLock<HashMap<MethodId, MethodEntry>>,
    names: RwLock<HashMap<String, MethodId>>,
    next_id: AtomicU64,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a method, returning its identity.
    ///
    /// Redefining a name replaces the body but keeps the identity.
    pub fn define(&self, name: &str, body: MethodBody) -> MethodId {
        let mut names = self.names.write();
        let id = *names
            .entry(name.to_string())
            .or_insert_with(|| MethodId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1));

        self.methods.write().insert(
            id,
            MethodEntry {
                name: name.to_string(),
                pristine: body.clone(),
                active: body,
                activations: 0,
                locked: false,
            },
        );

        tracing::debug!("Defined host method '{}' as {}", name, id);
        id
    }

    /// Body the method was defined with
    pub fn pristine_body(&self, id: MethodId) -> Option<MethodBody> {
        self.methods.read().get(&id).map(|e| e.pristine.clone())
    }

    /// Body currently active
    pub fn active_body(&self, id: MethodId) -> Option<MethodBody> {
        self.methods.read().get(&id).map(|e| e.active.clone())
    }

    /// Check if the active body differs from the defined one
    pub fn is_modified(&self, id: MethodId) -> bool {
        self.methods
            .read()
            .get(&id)
            .map(|e| e.active != e.pristine)
            .unwrap_or(false)
    }

    /// Number of successful activations
    pub fn activation_count(&self, id: MethodId) -> u32 {
        self.methods
            .read()
            .get(&id)
            .map(|e| e.activations)
            .unwrap_or(0)
    }

    /// Make further activations of this method fail
    pub fn set_locked(&self, id: MethodId, locked: bool) {
        if let Some(entry) = self.methods.write().get_mut(&id) {
            entry.locked = locked;
        }
    }
}

impl MethodHost for MemoryHost {
    fn resolve(&self, name: &str) -> Result<MethodId, HostError> {
        self.names
            .read()
            .get(name)
            .copied()
            .ok_or_else(|| HostError::MethodNotFound(name.to_string()))
    }

    fn name_of(&self, id: MethodId) -> Option<String> {
        self.methods.read().get(&id).map(|e| e.name.clone())
    }

    fn load_body(&self, id: MethodId) -> Result<MethodBody, HostError> {
        let methods = self.methods.read();
        let entry = methods.get(&id).ok_or(HostError::UnknownMethod(id))?;
        if entry.active.is_empty() {
            return Err(HostError::NoBody(entry.name.clone()));
        }
        Ok(entry.active.clone())
    }

    fn activate(&self, id: MethodId, body: &MethodBody) -> Result<(), HostError> {
        let mut methods = self.methods.write();
        let entry = methods.get_mut(&id).ok_or(HostError::UnknownMethod(id))?;

        if entry.locked {
            return Err(HostError::ActivationRejected {
                method: entry.name.clone(),
                reason: "method is locked".to_string(),
            });
        }

        let dangling = body.dangling_labels();
        if !dangling.is_empty() {
            let labels = dangling
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(HostError::DanglingLabels {
                method: entry.name.clone(),
                labels,
            });
        }

        entry.active = body.clone();
        entry.activations += 1;

        tracing::debug!(
            "Activated body for '{}' ({} instructions)",
            entry.name,
            body.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ilsplice_sdk::{Instruction, Label};

    fn body() -> MethodBody {
        MethodBody::new(vec![Instruction::nop(), Instruction::ret()])
    }

    #[test]
    fn test_define_and_resolve() {
        let host = MemoryHost::new();
        let id = host.define("Celeste.Refill::OnPlayer", body());
        assert_eq!(host.resolve("Celeste.Refill::OnPlayer").unwrap(), id);
        assert!(matches!(
            host.resolve("Celeste.Refill::Missing"),
            Err(HostError::MethodNotFound(_))
        ));
        assert_eq!(host.describe(id), "Celeste.Refill::OnPlayer");
    }

    #[test]
    fn test_redefine_keeps_identity() {
        let host = MemoryHost::new();
        let a = host.define("A::M", body());
        let b = host.define("A::M", MethodBody::new(vec![Instruction::ret()]));
        assert_eq!(a, b);
        assert_eq!(host.load_body(a).unwrap().len(), 1);
    }

    #[test]
    fn test_activate_and_restore() {
        let host = MemoryHost::new();
        let id = host.define("A::M", body());

        let patched = MethodBody::new(vec![
            Instruction::nop(),
            Instruction::nop(),
            Instruction::ret(),
        ]);
        host.activate(id, &patched).unwrap();
        assert!(host.is_modified(id));
        assert_eq!(host.activation_count(id), 1);

        let original = host.pristine_body(id).unwrap();
        host.restore(id, &original).unwrap();
        assert!(!host.is_modified(id));
    }

    #[test]
    fn test_locked_rejects_activation() {
        let host = MemoryHost::new();
        let id = host.define("A::M", body());
        host.set_locked(id, true);
        assert!(matches!(
            host.activate(id, &body()),
            Err(HostError::ActivationRejected { .. })
        ));
        assert_eq!(host.activation_count(id), 0);
    }

    #[test]
    fn test_rejects_dangling_labels() {
        let host = MemoryHost::new();
        let id = host.define("A::M", body());
        let bad = MethodBody::new(vec![Instruction::br(Label(3)), Instruction::ret()]);
        assert!(matches!(
            host.activate(id, &bad),
            Err(HostError::DanglingLabels { .. })
        ));
        assert!(!host.is_modified(id));
    }
}

//! Patch registry
//!
//! Tracks, per target method, the extension points to splice and the
//! installed patch. Each method moves through
//! `Unpatched -> Installing -> Installed -> Uninstalling -> Unpatched`
//! inside its own critical section. All extension points of a method are
//! spliced into a private copy and activated together, so a method is
//! either fully patched or running its original body.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, error, info, warn};

use ilsplice_host::{MethodHost, MethodId};
use ilsplice_sdk::MethodBody;

use crate::analysis::check_stream;
use crate::dispatch::{Callback, Dispatcher};
use crate::error::{PatchError, PatchResult};
use crate::extension::{self, ExtensionPointSpec, SpliceReport};
use crate::stream::InstructionStream;

/// Lifecycle state of one target method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchState {
    Unpatched,
    Installing,
    Installed,
    Uninstalling,
}

impl fmt::Display for PatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unpatched => "unpatched",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Uninstalling => "uninstalling",
        };
        f.write_str(s)
    }
}

/// An installed patch.
///
/// Owns a copy of the original body so uninstalling never has to ask the
/// host what the method looked like.
#[derive(Debug, Clone)]
pub struct PatchHandle {
    method: MethodId,
    name: String,
    original: MethodBody,
    patched: MethodBody,
    applied: Vec<SpliceReport>,
}

impl PatchHandle {
    pub fn method(&self) -> MethodId {
        self.method
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn original(&self) -> &MethodBody {
        &self.original
    }

    pub fn patched(&self) -> &MethodBody {
        &self.patched
    }

    /// One report per extension point, in splice order
    pub fn applied(&self) -> &[SpliceReport] {
        &self.applied
    }
}

/// Result of [`PatchRegistry::install`]
#[derive(Debug, Clone)]
pub enum InstallOutcome {
    Installed(Arc<PatchHandle>),
    /// Already installed; nothing was searched or activated
    AlreadyInstalled(Arc<PatchHandle>),
}

impl InstallOutcome {
    pub fn handle(&self) -> &Arc<PatchHandle> {
        match self {
            Self::Installed(h) | Self::AlreadyInstalled(h) => h,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Installed(_))
    }
}

/// Result of [`PatchRegistry::uninstall`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallOutcome {
    Restored,
    NotInstalled,
}

/// Extension points for one target method, with their callbacks
pub struct MethodPatch {
    target: String,
    points: Vec<(ExtensionPointSpec, Callback)>,
}

impl MethodPatch {
    /// `target` is the host-readable method name
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            points: Vec::new(),
        }
    }

    pub fn point(mut self, spec: ExtensionPointSpec, callback: Callback) -> Self {
        self.points.push((spec, callback));
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

struct MethodSlot {
    name: String,
    points: Vec<ExtensionPointSpec>,
    state: PatchState,
    handle: Option<Arc<PatchHandle>>,
    /// Number of times the anchors were searched
    searches: u64,
}

/// Reentrant so that a nested call from inside the host on the same
/// thread sees the in-flight state and fails with `Busy`
type SlotCell = Arc<ReentrantMutex<RefCell<MethodSlot>>>;

/// Table of patched methods
pub struct PatchRegistry {
    host: Arc<dyn MethodHost>,
    dispatcher: Arc<Dispatcher>,
    slots: DashMap<MethodId, SlotCell>,
    /// Registration order, used by `install_all`
    order: Mutex<Vec<MethodId>>,
    strict: bool,
}

impl PatchRegistry {
    pub fn new(host: Arc<dyn MethodHost>) -> Self {
        Self {
            host,
            dispatcher: Arc::new(Dispatcher::new()),
            slots: DashMap::new(),
            order: Mutex::new(Vec::new()),
            strict: true,
        }
    }

    /// Log fallback anchors at `warn` (strict) or `debug`
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn host(&self) -> &Arc<dyn MethodHost> {
        &self.host
    }

    /// Table the host routes injected calls through
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register extension points for a method
    ///
    /// Points added to a method that already has some are appended after
    /// them. Nothing is registered if any point is rejected.
    ///
    /// # Returns
    /// The resolved method identity
    pub fn register(&self, patch: MethodPatch) -> PatchResult<MethodId> {
        let method = self.host.resolve(&patch.target)?;

        let mut names = HashSet::new();
        for (spec, callback) in &patch.points {
            if callback.mode() != spec.mode() {
                return Err(PatchError::CallbackMismatch(spec.name().to_string()));
            }
            if !names.insert(spec.name()) || self.dispatcher.contains(spec.name()) {
                return Err(PatchError::DuplicatePoint(spec.name().to_string()));
            }
        }

        let cell = self
            .slots
            .entry(method)
            .or_insert_with(|| {
                Arc::new(ReentrantMutex::new(RefCell::new(MethodSlot {
                    name: self.host.describe(method),
                    points: Vec::new(),
                    state: PatchState::Unpatched,
                    handle: None,
                    searches: 0,
                })))
            })
            .clone();

        let guard = cell.lock();
        let mut slot = guard.borrow_mut();
        if slot.state != PatchState::Unpatched {
            return Err(PatchError::MethodPatched(slot.name.clone()));
        }

        let count = patch.points.len();
        for (spec, callback) in patch.points {
            self.dispatcher
                .register(spec.name(), callback)
                .map_err(|_| PatchError::DuplicatePoint(spec.name().to_string()))?;
            slot.points.push(spec);
        }

        {
            let mut order = self.order.lock();
            if !order.contains(&method) {
                order.push(method);
            }
        }

        debug!("Registered {} extension point(s) for {}", count, slot.name);
        Ok(method)
    }

    // ========================================================================
    // Install / uninstall
    // ========================================================================

    /// Splice every extension point of `method` and activate the result
    ///
    /// Idempotent: a second call returns the existing handle without
    /// searching again. On any failure the host keeps the original body and
    /// the method returns to `Unpatched`.
    pub fn install(&self, method: MethodId) -> PatchResult<InstallOutcome> {
        let cell = self.slot(method)?;
        let guard = cell.lock();

        let (name, points) = {
            let mut slot = guard.borrow_mut();
            match slot.state {
                PatchState::Installed => {
                    if let Some(handle) = &slot.handle {
                        return Ok(InstallOutcome::AlreadyInstalled(handle.clone()));
                    }
                }
                PatchState::Installing | PatchState::Uninstalling => {
                    return Err(PatchError::Busy(slot.name.clone()));
                }
                PatchState::Unpatched => {}
            }
            slot.state = PatchState::Installing;
            slot.searches += 1;
            (slot.name.clone(), slot.points.clone())
        };

        let result = self.build_and_activate(method, &name, &points);

        let mut slot = guard.borrow_mut();
        match result {
            Ok(handle) => {
                slot.state = PatchState::Installed;
                slot.handle = Some(handle.clone());
                info!(
                    "Installed {} extension point(s) into {} ({} -> {} instructions)",
                    handle.applied.len(),
                    name,
                    handle.original.len(),
                    handle.patched.len()
                );
                Ok(InstallOutcome::Installed(handle))
            }
            Err(e) => {
                slot.state = PatchState::Unpatched;
                error!("Failed to install patch for {}: {}", name, e);
                Err(e)
            }
        }
    }

    /// Restore the original body of `method`
    ///
    /// A restore failure leaves the method `Installed` and is returned as
    /// [`PatchError::RestoreFailed`]; the method is then in an unknown state.
    pub fn uninstall(&self, method: MethodId) -> PatchResult<UninstallOutcome> {
        let cell = self.slot(method)?;
        let guard = cell.lock();

        let (name, handle) = {
            let mut slot = guard.borrow_mut();
            match (slot.state, slot.handle.clone()) {
                (PatchState::Unpatched, _) => return Ok(UninstallOutcome::NotInstalled),
                (PatchState::Installing | PatchState::Uninstalling, _) => {
                    return Err(PatchError::Busy(slot.name.clone()));
                }
                (PatchState::Installed, None) => {
                    slot.state = PatchState::Unpatched;
                    return Ok(UninstallOutcome::NotInstalled);
                }
                (PatchState::Installed, Some(handle)) => {
                    slot.state = PatchState::Uninstalling;
                    (slot.name.clone(), handle)
                }
            }
        };

        let result = self.host.restore(method, &handle.original);

        let mut slot = guard.borrow_mut();
        match result {
            Ok(()) => {
                slot.state = PatchState::Unpatched;
                slot.handle = None;
                info!("Uninstalled patch from {}", name);
                Ok(UninstallOutcome::Restored)
            }
            Err(source) => {
                slot.state = PatchState::Installed;
                error!("Failed to restore original body of {}: {}", name, source);
                Err(PatchError::RestoreFailed {
                    method: name,
                    source,
                })
            }
        }
    }

    /// Install every registered method, in registration order
    ///
    /// Stops at the first failure and uninstalls whatever this call
    /// installed, so either every method is patched or none newly is.
    pub fn install_all(&self) -> PatchResult<Vec<InstallOutcome>> {
        let methods = self.methods();
        let mut outcomes = Vec::with_capacity(methods.len());

        for &method in &methods {
            match self.install(method) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(
                        "Rolling back {} method(s) after install failure",
                        outcomes.iter().filter(|o| o.is_new()).count()
                    );
                    for outcome in outcomes.iter().rev().filter(|o| o.is_new()) {
                        self.uninstall(outcome.handle().method)?;
                    }
                    return Err(e);
                }
            }
        }

        info!("Installed patches for {} method(s)", outcomes.len());
        Ok(outcomes)
    }

    /// Uninstall every method, in reverse registration order
    ///
    /// Keeps going after a failure so as many methods as possible are
    /// restored, then returns the first error.
    pub fn uninstall_all(&self) -> PatchResult<usize> {
        let mut restored = 0;
        let mut first_error = None;

        for method in self.methods().into_iter().rev() {
            match self.uninstall(method) {
                Ok(UninstallOutcome::Restored) => restored += 1,
                Ok(UninstallOutcome::NotInstalled) => {}
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Uninstalled patches from {} method(s)", restored);
                Ok(restored)
            }
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Registered methods, in registration order
    pub fn methods(&self) -> Vec<MethodId> {
        self.order.lock().clone()
    }

    /// Methods currently installed
    pub fn installed(&self) -> Vec<MethodId> {
        self.methods()
            .into_iter()
            .filter(|&m| self.state(m) == Some(PatchState::Installed))
            .collect()
    }

    pub fn state(&self, method: MethodId) -> Option<PatchState> {
        let cell = self.slots.get(&method)?.value().clone();
        let guard = cell.lock();
        let state = guard.borrow().state;
        Some(state)
    }

    pub fn handle(&self, method: MethodId) -> Option<Arc<PatchHandle>> {
        let cell = self.slots.get(&method)?.value().clone();
        let guard = cell.lock();
        let handle = guard.borrow().handle.clone();
        handle
    }

    /// How many times the anchors of `method` were searched
    pub fn search_count(&self, method: MethodId) -> u64 {
        let Ok(cell) = self.slot(method) else {
            return 0;
        };
        let guard = cell.lock();
        let searches = guard.borrow().searches;
        searches
    }

    fn slot(&self, method: MethodId) -> PatchResult<SlotCell> {
        self.slots
            .get(&method)
            .map(|cell| cell.value().clone())
            .ok_or_else(|| PatchError::NotRegistered(self.host.describe(method)))
    }

    fn build_and_activate(
        &self,
        method: MethodId,
        name: &str,
        points: &[ExtensionPointSpec],
    ) -> PatchResult<Arc<PatchHandle>> {
        let original = self.host.load_body(method)?;
        let mut stream = InstructionStream::from_body(&original).map_err(|source| {
            PatchError::Stream {
                method: name.to_string(),
                source,
            }
        })?;

        let mut applied = Vec::with_capacity(points.len());
        for spec in points {
            let report = extension::apply(&mut stream, spec).map_err(|source| PatchError::Splice {
                method: name.to_string(),
                source,
            })?;
            if report.used_fallback() {
                if self.strict {
                    warn!(
                        "'{}' in {} matched fallback anchor '{}'",
                        report.point, name, report.pattern
                    );
                } else {
                    debug!(
                        "'{}' in {} matched fallback anchor '{}'",
                        report.point, name, report.pattern
                    );
                }
            }
            applied.push(report);
        }

        stream.validate().map_err(|source| PatchError::Stream {
            method: name.to_string(),
            source,
        })?;

        // Only hold the patch to the stack check when the original passes it
        let original_stream = InstructionStream::from_body(&original).map_err(|source| {
            PatchError::Stream {
                method: name.to_string(),
                source,
            }
        })?;
        if check_stream(&original_stream).is_ok() {
            check_stream(&stream).map_err(|source| PatchError::Unbalanced {
                method: name.to_string(),
                source,
            })?;
        } else {
            debug!("Skipping stack check for {}: original body does not pass it", name);
        }

        let patched = stream.to_body();
        self.host.activate(method, &patched)?;

        Ok(Arc::new(PatchHandle {
            method,
            name: name.to_string(),
            original,
            patched,
            applied,
        }))
    }
}

//! ilsplice core - instruction-stream patch engine
//!
//! Loads compiled method bodies from a host, finds extension points by
//! structural pattern, splices in a type test plus callback dispatch, and
//! installs the result so that it can be removed again without a trace.
//!
//! # Re-exports
//!
//! This crate re-exports the SDK and host crates for convenience:
//! - [`sdk`] - Instruction set and method body types
//! - [`host`] - Host collaborator trait and the in-memory host

pub use ilsplice_host as host;
pub use ilsplice_sdk as sdk;

pub mod analysis;
pub mod config;
pub mod cursor;
pub mod dispatch;
pub mod error;
pub mod extension;
pub mod gamedata;
pub mod pattern;
pub mod registry;
pub mod stream;

// Re-export commonly used items
pub use cursor::Cursor;
pub use dispatch::{Callback, DispatchError, Dispatcher};
pub use error::{PatchError, PatchResult, SpliceError, StreamError};
pub use extension::{
    Capture, ExtensionPointSpec, ObjectSource, Occurrence, Placement, SkipTarget, SpliceMode,
    SpliceReport, Template, TemplateError,
};
pub use pattern::{OpFamily, Pattern, PatternSet, Predicate};
pub use registry::{
    InstallOutcome, MethodPatch, PatchHandle, PatchRegistry, PatchState, UninstallOutcome,
};
pub use stream::{Block, InstructionStream, MatchSpan, Position};

// Re-export config and gamedata types
pub use config::{ConfigError, ConfigResult, CoreConfig};
pub use gamedata::{Gamedata, GamedataError};

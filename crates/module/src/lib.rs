//! ilsplice module - lifecycle layer
//!
//! This crate sits between whatever loads mods into the host and the patch
//! engine. A module load reads configuration and anchors, installs every
//! method patch, and hands back a [`Module`]; unloading it restores every
//! original body.

mod lifecycle;
mod logging;

pub use lifecycle::{Module, ModuleError, ModuleResult};
pub use logging::init_logging;

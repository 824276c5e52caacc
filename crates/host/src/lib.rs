//! ilsplice Host - Method resolution and body activation
//!
//! This crate defines the collaborator the patch engine relies on:
//! - Resolving human-readable method names to stable identities
//! - Handing over a method's compiled body
//! - Activating a replacement body, and restoring the original one
//!
//! # Architecture
//!
//! The engine talks to the host only through the [`MethodHost`] trait. A
//! table-backed implementation, [`MemoryHost`], is provided for embedding
//! and tests.

pub mod error;
pub mod host;
pub mod memory;

pub use error::HostError;
pub use host::{MethodHost, MethodId};
pub use memory::MemoryHost;

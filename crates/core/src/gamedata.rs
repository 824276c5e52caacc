//! Gamedata: anchor patterns loaded from JSON
//!
//! Anchors are kept in an `anchors.json` file deployed with the module, so
//! a new host build can be supported by adding a fallback pattern instead
//! of recompiling.
//!
//! ```json
//! {
//!     "refill.level-check": {
//!         "primary": "ldfld Refill::level; brfalse",
//!         "fallbacks": ["ldfld Refill::level; ?1; brfalse"]
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::pattern::{Pattern, PatternSet, PatternSyntaxError};

/// Errors that can occur when loading gamedata
#[derive(Debug, Error)]
pub enum GamedataError {
    #[error("Failed to read gamedata file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse gamedata JSON: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Anchor not found: {0}")]
    AnchorNotFound(String),

    #[error("Invalid pattern for anchor '{anchor}': {source}")]
    InvalidPattern {
        anchor: String,
        #[source]
        source: PatternSyntaxError,
    },
}

/// One anchor as written in the file
#[derive(Debug, Deserialize)]
pub struct AnchorEntry {
    /// Pattern for the current host build
    pub primary: String,
    /// Patterns for other builds, tried in order
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

/// Loaded and parsed gamedata
#[derive(Debug, Default)]
pub struct Gamedata {
    anchors: HashMap<String, PatternSet>,
}

impl Gamedata {
    /// Load gamedata from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GamedataError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    /// Load gamedata from a JSON string
    ///
    /// Every pattern is parsed up front, so a typo fails the load instead
    /// of a later install.
    pub fn load_from_str(json: &str) -> Result<Self, GamedataError> {
        let raw: HashMap<String, AnchorEntry> = serde_json::from_str(json)?;

        let mut gamedata = Gamedata::default();
        for (name, entry) in raw {
            let set = parse_entry(&name, &entry)?;
            gamedata.anchors.insert(name, set);
        }

        tracing::info!("Loaded gamedata: {} anchors", gamedata.anchors.len());
        Ok(gamedata)
    }

    /// Anchor alternatives by name
    pub fn anchor(&self, name: &str) -> Result<PatternSet, GamedataError> {
        self.anchors
            .get(name)
            .cloned()
            .ok_or_else(|| GamedataError::AnchorNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.anchors.contains_key(name)
    }

    /// Anchor names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.anchors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}

/// Fallbacks are named `<anchor>#1`, `<anchor>#2`, ... in error context
fn parse_entry(name: &str, entry: &AnchorEntry) -> Result<PatternSet, GamedataError> {
    let invalid = |source| GamedataError::InvalidPattern {
        anchor: name.to_string(),
        source,
    };

    let mut set = PatternSet::new(Pattern::parse(name, &entry.primary).map_err(invalid)?);
    for (i, text) in entry.fallbacks.iter().enumerate() {
        let fallback = Pattern::parse(format!("{}#{}", name, i + 1), text).map_err(invalid)?;
        set = set.or(fallback);
    }
    Ok(set)
}

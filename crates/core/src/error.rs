//! Error types for the patch engine

use ilsplice_host::HostError;
use ilsplice_sdk::Label;

use crate::analysis::StackError;
use crate::extension::TemplateError;

/// Structural errors raised by stream and cursor operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("Position is not part of this stream")]
    UnknownPosition,

    #[error("Label {0} is referenced but never bound")]
    UnboundLabel(Label),

    #[error("Label {0} is already bound")]
    LabelAlreadyBound(Label),

    #[error("Label {0} is bound twice in one block")]
    DuplicateBinding(Label),

    #[error("Block binds label {label} to index {index} but has {len} instructions")]
    BindingOutOfRange { label: Label, index: usize, len: usize },

    #[error("Cannot insert an empty block")]
    EmptyBlock,

    #[error("Span end does not follow span start")]
    InvalidSpan,

    #[error("Removing the span would orphan label {0}")]
    OrphanedLabel(Label),

    #[error("No instruction matching {0}")]
    NotFound(String),
}

/// Errors raised while splicing one extension point into one stream
#[derive(Debug, thiserror::Error)]
pub enum SpliceError {
    /// No alternative matched anywhere in the stream
    #[error("Anchor for '{point}' not found (tried: {tried})")]
    PatternNotFound { point: String, tried: String },

    /// The anchor matched more often than the occurrence policy allows
    #[error("Anchor for '{point}' matched {count} times with pattern '{pattern}'")]
    AmbiguousMatch {
        point: String,
        pattern: String,
        count: usize,
    },

    /// A context capture found no suitable instruction
    #[error("Capture '{capture}' for '{point}' not found")]
    CaptureNotFound { point: String, capture: String },

    /// A context capture resolved to an instruction with side effects
    #[error("Capture '{capture}' for '{point}' resolved to '{instruction}', which is not a plain load")]
    UnsupportedCapture {
        point: String,
        capture: String,
        instruction: String,
    },

    /// The consume skip target could not be located
    #[error("Skip target for '{point}' not found: {reason}")]
    SkipTargetNotFound { point: String, reason: String },

    /// The anchor sits at the end of the stream with nothing to continue to
    #[error("Anchor for '{point}' has no following instruction")]
    NoContinuation { point: String },

    #[error("Stream error while splicing '{point}': {source}")]
    Stream {
        point: String,
        #[source]
        source: StreamError,
    },
}

impl SpliceError {
    /// Name of the extension point the error belongs to
    pub fn point(&self) -> &str {
        match self {
            Self::PatternNotFound { point, .. }
            | Self::AmbiguousMatch { point, .. }
            | Self::CaptureNotFound { point, .. }
            | Self::UnsupportedCapture { point, .. }
            | Self::SkipTargetNotFound { point, .. }
            | Self::NoContinuation { point }
            | Self::Stream { point, .. } => point,
        }
    }
}

/// Error type for registry operations
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    /// Splicing failed; the method was left on its original body
    #[error("Failed to patch {method}: {source}")]
    Splice {
        method: String,
        #[source]
        source: SpliceError,
    },

    /// An extension point definition is invalid
    #[error("Malformed template: {0}")]
    MalformedTemplate(#[from] TemplateError),

    /// The patched body fails the stack-balance check
    #[error("Patched body of {method} is unbalanced: {source}")]
    Unbalanced {
        method: String,
        #[source]
        source: StackError,
    },

    #[error("Host error: {0}")]
    Host(#[from] HostError),

    #[error("Stream error in {method}: {source}")]
    Stream {
        method: String,
        #[source]
        source: StreamError,
    },

    /// Two extension points share a name
    #[error("Extension point '{0}' is already registered")]
    DuplicatePoint(String),

    /// The callback kind does not fit the splice mode
    #[error("Callback for '{0}' does not match its splice mode")]
    CallbackMismatch(String),

    /// Extension points can only be added while the method is unpatched
    #[error("Cannot add extension points to {0} while it is patched")]
    MethodPatched(String),

    /// Install or uninstall re-entered while the method was mid-transition
    #[error("Method {0} is busy installing or uninstalling")]
    Busy(String),

    /// No patch is registered for this method
    #[error("No patch registered for {0}")]
    NotRegistered(String),

    /// The original body could not be put back; the method is in an
    /// unknown state and the host must not keep running it
    #[error("Failed to restore original body of {method}: {source}")]
    RestoreFailed {
        method: String,
        #[source]
        source: HostError,
    },
}

impl PatchError {
    /// Underlying splice error, if this is one
    pub fn splice_error(&self) -> Option<&SpliceError> {
        match self {
            Self::Splice { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result type for registry operations
pub type PatchResult<T> = Result<T, PatchError>;

//! Extension point definitions
//!
//! An [`ExtensionPointSpec`] names one splice: which anchor to find, which
//! object to type-test, what to insert and where to jump. Specs are
//! validated once when built and are immutable afterwards.
//!
//! # Example
//!
//! ```ignore
//! use ilsplice_core::extension::{ExtensionPointSpec, ObjectSource};
//! use ilsplice_core::pattern::{Pattern, Predicate};
//!
//! let spec = ExtensionPointSpec::consume(
//!     "refill.particles",
//!     TypeRef::new("Mods.IRefillParticles"),
//!     Pattern::new("level-check")
//!         .then(Predicate::load_field("Refill::level"))
//!         .then(Predicate::branch_if_false()),
//! )
//! .active(ObjectSource::Arg(0))
//! .build()?;
//! ```

mod splice;
mod template;

use ilsplice_sdk::{FieldRef, Instruction, MethodRef, TypeRef};

use crate::pattern::{PatternSet, Predicate};

pub use splice::{apply, locate, SpliceReport};
pub use template::{Symbol, Template, TemplateError, TemplateOp};

pub(crate) use template::Lowering;

/// Owner type of every injected dispatch call
pub const DISPATCH_OWNER: &str = "ilsplice.Dispatch";

/// Consume or augment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceMode {
    /// The callback may handle the situation and skip the original code
    Consume,
    /// The original code always runs; the callback only adds behavior
    Augment,
}

/// Where the active object comes from
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectSource {
    Arg(u16),
    Local(u16),
    /// Field of `this`, for state machines that keep their owner in a field
    ThisField(FieldRef),
}

impl ObjectSource {
    /// Instructions that push the active object
    pub fn load(&self) -> Vec<Instruction> {
        match self {
            Self::Arg(i) => vec![Instruction::ldarg(*i)],
            Self::Local(i) => vec![Instruction::ldloc(*i)],
            Self::ThisField(field) => vec![Instruction::ldarg(0), Instruction::ldfld(field.clone())],
        }
    }
}

/// Where a handled consume splice continues
#[derive(Debug, Clone)]
pub enum SkipTarget {
    /// Target of the last branch inside the anchor span
    AnchorBranch,
    /// Start of the first match searched forward from the splice
    Pattern(PatternSet),
}

/// Splice position relative to the anchor span
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Before,
    After,
}

/// How many anchor matches are acceptable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Occurrence {
    /// Exactly one; more is an ambiguity error
    #[default]
    Unique,
    /// The first of any number
    First,
    /// The n-th (zero-based) match
    Nth(usize),
}

/// Search direction of a context capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureDirection {
    /// Strictly before the anchor start
    Backward,
    /// Strictly after the anchor end
    Forward,
}

/// Context value located relative to the anchor and passed to an augment
/// callback
#[derive(Debug, Clone)]
pub struct Capture {
    pub name: String,
    pub direction: CaptureDirection,
    pub predicate: Predicate,
    /// Skip this many earlier hits in the search direction
    pub nth: usize,
}

impl Capture {
    pub fn backward(name: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            name: name.into(),
            direction: CaptureDirection::Backward,
            predicate,
            nth: 0,
        }
    }

    pub fn forward(name: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            direction: CaptureDirection::Forward,
            ..Self::backward(name, predicate)
        }
    }

    pub fn nth(mut self, nth: usize) -> Self {
        self.nth = nth;
        self
    }
}

/// Validated, immutable description of one splice
#[derive(Debug, Clone)]
pub struct ExtensionPointSpec {
    name: String,
    mode: SpliceMode,
    anchors: PatternSet,
    capability: TypeRef,
    active: ObjectSource,
    placement: Placement,
    occurrence: Occurrence,
    skip: SkipTarget,
    captures: Vec<Capture>,
    template: Template,
    callback: MethodRef,
}

impl ExtensionPointSpec {
    /// Start a consume spec: `(active) -> handled`
    pub fn consume(
        name: impl Into<String>,
        capability: TypeRef,
        anchors: impl Into<PatternSet>,
    ) -> ExtensionPointBuilder {
        ExtensionPointBuilder::new(name.into(), SpliceMode::Consume, capability, anchors.into())
    }

    /// Start an augment spec: `(active, captures...)`
    pub fn augment(
        name: impl Into<String>,
        capability: TypeRef,
        anchors: impl Into<PatternSet>,
    ) -> ExtensionPointBuilder {
        ExtensionPointBuilder::new(name.into(), SpliceMode::Augment, capability, anchors.into())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> SpliceMode {
        self.mode
    }

    pub fn anchors(&self) -> &PatternSet {
        &self.anchors
    }

    pub fn capability(&self) -> &TypeRef {
        &self.capability
    }

    pub fn active(&self) -> &ObjectSource {
        &self.active
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn occurrence(&self) -> Occurrence {
        self.occurrence
    }

    pub fn skip(&self) -> &SkipTarget {
        &self.skip
    }

    pub fn captures(&self) -> &[Capture] {
        &self.captures
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    /// Dispatch call the splice injects
    pub fn callback(&self) -> &MethodRef {
        &self.callback
    }
}

/// Builder for [`ExtensionPointSpec`]
pub struct ExtensionPointBuilder {
    name: String,
    mode: SpliceMode,
    anchors: PatternSet,
    capability: TypeRef,
    active: ObjectSource,
    placement: Placement,
    occurrence: Occurrence,
    skip: SkipTarget,
    captures: Vec<Capture>,
    template: Option<Template>,
}

impl ExtensionPointBuilder {
    fn new(name: String, mode: SpliceMode, capability: TypeRef, anchors: PatternSet) -> Self {
        Self {
            name,
            mode,
            anchors,
            capability,
            active: ObjectSource::Arg(0),
            placement: Placement::After,
            occurrence: Occurrence::Unique,
            skip: SkipTarget::AnchorBranch,
            captures: Vec::new(),
            template: None,
        }
    }

    pub fn active(mut self, source: ObjectSource) -> Self {
        self.active = source;
        self
    }

    pub fn placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    pub fn occurrence(mut self, occurrence: Occurrence) -> Self {
        self.occurrence = occurrence;
        self
    }

    pub fn skip_to(mut self, skip: SkipTarget) -> Self {
        self.skip = skip;
        self
    }

    pub fn capture(mut self, capture: Capture) -> Self {
        self.captures.push(capture);
        self
    }

    /// Replace the default template for the mode
    pub fn template(mut self, template: Template) -> Self {
        self.template = Some(template);
        self
    }

    pub fn build(self) -> Result<ExtensionPointSpec, TemplateError> {
        if self.name.trim().is_empty() {
            return Err(TemplateError::EmptyName);
        }
        if let Some(empty) = self.anchors.alternatives().iter().find(|p| p.is_empty()) {
            return Err(TemplateError::EmptyPattern {
                point: self.name,
                pattern: empty.name().to_string(),
            });
        }

        let template = self.template.unwrap_or_else(|| match self.mode {
            SpliceMode::Consume => Template::consume(),
            SpliceMode::Augment => Template::augment(self.captures.len()),
        });

        let callback = match self.mode {
            SpliceMode::Consume => MethodRef::new_static(DISPATCH_OWNER, &self.name, 1, true),
            SpliceMode::Augment => MethodRef::new_static(
                DISPATCH_OWNER,
                &self.name,
                1 + self.captures.len() as u16,
                false,
            ),
        };

        // Captures are checked as placeholders; the real loads are
        // resolved per stream and are always single pushes
        let placeholders: Vec<Vec<Instruction>> = self
            .captures
            .iter()
            .map(|_| vec![Instruction::ldnull()])
            .collect();
        let active = self.active.load();
        let ctx = Lowering {
            active: &active,
            capability: &self.capability,
            callback: &callback,
            captures: &placeholders,
        };
        template.validate(&self.name, self.mode == SpliceMode::Consume, &ctx)?;

        Ok(ExtensionPointSpec {
            name: self.name,
            mode: self.mode,
            anchors: self.anchors,
            capability: self.capability,
            active: self.active,
            placement: self.placement,
            occurrence: self.occurrence,
            skip: self.skip,
            captures: self.captures,
            template,
            callback,
        })
    }
}

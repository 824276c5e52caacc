//! Insertion templates
//!
//! A template is the instruction shape spliced at an anchor, written
//! against symbolic labels so one template serves every target method.

use std::collections::{HashMap, HashSet};
use std::fmt;

use ilsplice_sdk::{Instruction, Label, MethodRef, TypeRef};

use crate::analysis::{check_stream, StackError};
use crate::stream::{Block, InstructionStream, Position};

/// Label symbol inside a template
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Symbol {
    /// The instruction the original code continues with
    Continue,
    /// Where a handled consume splice jumps to, past the original code
    Skip,
    /// Label private to the template, bound with [`TemplateOp::Mark`]
    Local(String),
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => f.write_str("continue"),
            Self::Skip => f.write_str("skip"),
            Self::Local(name) => write!(f, "'{name}"),
        }
    }
}

/// One template element
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateOp {
    /// Push the active object
    LoadActive,
    /// `isinst` against the capability type
    TypeTest,
    /// Push the n-th context capture
    LoadCapture(usize),
    /// Call the registered callback
    InvokeCallback,
    Branch(Symbol),
    BranchTrue(Symbol),
    BranchFalse(Symbol),
    /// Bind a local symbol to the next instruction
    Mark(String),
    /// Literal instruction; must not reference labels
    Emit(Instruction),
}

/// Invalid template or extension point definition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("Extension point name is empty")]
    EmptyName,

    #[error("'{point}' has an empty anchor pattern '{pattern}'")]
    EmptyPattern { point: String, pattern: String },

    #[error("'{point}' references undefined label {symbol}")]
    UndefinedSymbol { point: String, symbol: String },

    #[error("'{point}' marks label {symbol} twice")]
    DuplicateMark { point: String, symbol: String },

    #[error("'{point}' marks label {symbol} with no instruction after it")]
    MarkAtEnd { point: String, symbol: String },

    #[error("'{point}' invokes its callback {count} times, expected once")]
    CallbackCount { point: String, count: usize },

    #[error("'{point}' loads capture #{index} but defines {captures}")]
    CaptureIndex {
        point: String,
        index: usize,
        captures: usize,
    },

    #[error("'{point}' is an augment splice and cannot skip original code")]
    SkipInAugment { point: String },

    #[error("'{point}' emits '{instruction}', which references a label")]
    LabelInEmit { point: String, instruction: String },

    #[error("'{point}' is unbalanced: {source}")]
    Unbalanced {
        point: String,
        #[source]
        source: StackError,
    },
}

/// Concrete values a template is lowered against
pub(crate) struct Lowering<'a> {
    pub active: &'a [Instruction],
    pub capability: &'a TypeRef,
    pub callback: &'a MethodRef,
    pub captures: &'a [Vec<Instruction>],
}

/// Symbolic instruction shape of a splice
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    ops: Vec<TemplateOp>,
}

impl Template {
    pub fn new(ops: Vec<TemplateOp>) -> Self {
        Self { ops }
    }

    /// `active isinst Cap; brfalse continue; active; call cb; brtrue skip`
    pub fn consume() -> Self {
        use TemplateOp::*;

        Self::new(vec![
            LoadActive,
            TypeTest,
            BranchFalse(Symbol::Continue),
            LoadActive,
            InvokeCallback,
            BranchTrue(Symbol::Skip),
        ])
    }

    /// `active isinst Cap; brfalse continue; active; captures...; call cb`
    pub fn augment(captures: usize) -> Self {
        use TemplateOp::*;

        let mut ops = vec![
            LoadActive,
            TypeTest,
            BranchFalse(Symbol::Continue),
            LoadActive,
        ];
        ops.extend((0..captures).map(LoadCapture));
        ops.push(InvokeCallback);
        Self::new(ops)
    }

    pub fn ops(&self) -> &[TemplateOp] {
        &self.ops
    }

    /// Check if any branch targets [`Symbol::Skip`]
    pub fn uses_skip(&self) -> bool {
        self.ops.iter().any(|op| {
            matches!(
                op,
                TemplateOp::Branch(Symbol::Skip)
                    | TemplateOp::BranchTrue(Symbol::Skip)
                    | TemplateOp::BranchFalse(Symbol::Skip)
            )
        })
    }

    /// Structural and stack checks against a concrete lowering context.
    ///
    /// The stack check lowers the template in front of two `ret`s standing
    /// in for the continue and skip targets, so every exit must leave the
    /// stack exactly as it found it.
    pub(crate) fn validate(
        &self,
        point: &str,
        allow_skip: bool,
        ctx: &Lowering<'_>,
    ) -> Result<(), TemplateError> {
        let mut marked = HashSet::new();
        let mut callbacks = 0;
        let mut trailing_mark = None;

        for op in &self.ops {
            trailing_mark = None;
            match op {
                TemplateOp::Mark(name) => {
                    if !marked.insert(name.as_str()) {
                        return Err(TemplateError::DuplicateMark {
                            point: point.to_string(),
                            symbol: Symbol::Local(name.clone()).to_string(),
                        });
                    }
                    trailing_mark = Some(name);
                }
                TemplateOp::InvokeCallback => callbacks += 1,
                TemplateOp::LoadCapture(index) if *index >= ctx.captures.len() => {
                    return Err(TemplateError::CaptureIndex {
                        point: point.to_string(),
                        index: *index,
                        captures: ctx.captures.len(),
                    })
                }
                TemplateOp::Emit(insn) if !insn.operand.labels().is_empty() => {
                    return Err(TemplateError::LabelInEmit {
                        point: point.to_string(),
                        instruction: insn.to_string(),
                    })
                }
                _ => {}
            }
        }

        if let Some(name) = trailing_mark {
            return Err(TemplateError::MarkAtEnd {
                point: point.to_string(),
                symbol: Symbol::Local(name.clone()).to_string(),
            });
        }
        if callbacks != 1 {
            return Err(TemplateError::CallbackCount {
                point: point.to_string(),
                count: callbacks,
            });
        }
        if !allow_skip && self.uses_skip() {
            return Err(TemplateError::SkipInAugment {
                point: point.to_string(),
            });
        }
        for symbol in self.branch_symbols() {
            if let Symbol::Local(name) = symbol {
                if !marked.contains(name.as_str()) {
                    return Err(TemplateError::UndefinedSymbol {
                        point: point.to_string(),
                        symbol: symbol.to_string(),
                    });
                }
            }
        }

        let mut trial =
            InstructionStream::from_instructions([Instruction::ret(), Instruction::ret()]);
        if let (Some(continue_at), Some(skip_at)) = (trial.first(), trial.last()) {
            let block = self.lower(ctx, &mut trial, continue_at, skip_at);
            // An empty template is a bare fallthrough
            if !block.is_empty() {
                trial
                    .insert_before(continue_at, block)
                    .and_then(|_| trial.validate())
                    .map_err(|e| TemplateError::UndefinedSymbol {
                        point: point.to_string(),
                        symbol: e.to_string(),
                    })?;
            }
            check_stream(&trial).map_err(|source| TemplateError::Unbalanced {
                point: point.to_string(),
                source,
            })?;
        }
        Ok(())
    }

    /// Lower into a block for `stream`, binding the continue and skip
    /// symbols to existing positions
    pub(crate) fn lower(
        &self,
        ctx: &Lowering<'_>,
        stream: &mut InstructionStream,
        continue_at: Position,
        skip_at: Position,
    ) -> Block {
        let mut labels: HashMap<Symbol, Label> = HashMap::new();
        let mut block = Block::new();

        let mut label_for = |symbol: &Symbol, block: &mut Block| -> Label {
            if let Some(&label) = labels.get(symbol) {
                return label;
            }
            let label = stream.define_label();
            match symbol {
                Symbol::Continue => {
                    block.bind_existing(label, continue_at);
                }
                Symbol::Skip => {
                    block.bind_existing(label, skip_at);
                }
                Symbol::Local(_) => {}
            }
            labels.insert(symbol.clone(), label);
            label
        };

        for op in &self.ops {
            match op {
                TemplateOp::LoadActive => {
                    for insn in ctx.active {
                        block.push(insn.clone());
                    }
                }
                TemplateOp::TypeTest => {
                    block.push(Instruction::isinst(ctx.capability.clone()));
                }
                TemplateOp::LoadCapture(index) => {
                    for insn in ctx.captures.get(*index).into_iter().flatten() {
                        block.push(insn.clone());
                    }
                }
                TemplateOp::InvokeCallback => {
                    block.push(Instruction::call(ctx.callback.clone()));
                }
                TemplateOp::Branch(symbol) => {
                    let label = label_for(symbol, &mut block);
                    block.push(Instruction::br(label));
                }
                TemplateOp::BranchTrue(symbol) => {
                    let label = label_for(symbol, &mut block);
                    block.push(Instruction::brtrue(label));
                }
                TemplateOp::BranchFalse(symbol) => {
                    let label = label_for(symbol, &mut block);
                    block.push(Instruction::brfalse(label));
                }
                TemplateOp::Mark(name) => {
                    let label = label_for(&Symbol::Local(name.clone()), &mut block);
                    block.mark(label);
                }
                TemplateOp::Emit(insn) => {
                    block.push(insn.clone());
                }
            }
        }
        block
    }

    fn branch_symbols(&self) -> impl Iterator<Item = &Symbol> + '_ {
        self.ops.iter().filter_map(|op| match op {
            TemplateOp::Branch(s) | TemplateOp::BranchTrue(s) | TemplateOp::BranchFalse(s) => {
                Some(s)
            }
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ilsplice_sdk::OpCode;

    fn ctx_parts() -> (Vec<Instruction>, TypeRef, MethodRef, Vec<Vec<Instruction>>) {
        (
            vec![Instruction::ldarg(0)],
            TypeRef::new("Mods.IRefillCapability"),
            MethodRef::new_static("ilsplice.Dispatch", "refill.particles", 1, true),
            Vec::new(),
        )
    }

    fn check(template: &Template, allow_skip: bool) -> Result<(), TemplateError> {
        let (active, capability, callback, captures) = ctx_parts();
        let ctx = Lowering {
            active: &active,
            capability: &capability,
            callback: &callback,
            captures: &captures,
        };
        template.validate("test", allow_skip, &ctx)
    }

    #[test]
    fn test_default_consume_is_valid() {
        check(&Template::consume(), true).unwrap();
        assert!(Template::consume().uses_skip());
    }

    #[test]
    fn test_skip_rejected_in_augment() {
        assert!(matches!(
            check(&Template::consume(), false),
            Err(TemplateError::SkipInAugment { .. })
        ));
    }

    #[test]
    fn test_callback_count() {
        let none = Template::new(vec![TemplateOp::Emit(Instruction::nop())]);
        assert!(matches!(
            check(&none, true),
            Err(TemplateError::CallbackCount { count: 0, .. })
        ));
    }

    #[test]
    fn test_undefined_and_duplicate_symbols() {
        use TemplateOp::*;

        let undefined = Template::new(vec![
            LoadActive,
            InvokeCallback,
            BranchTrue(Symbol::Local("done".into())),
        ]);
        assert!(matches!(
            check(&undefined, true),
            Err(TemplateError::UndefinedSymbol { .. })
        ));

        let twice = Template::new(vec![
            Mark("a".into()),
            Emit(Instruction::nop()),
            Mark("a".into()),
            LoadActive,
            InvokeCallback,
            Emit(Instruction::pop()),
        ]);
        assert!(matches!(
            check(&twice, true),
            Err(TemplateError::DuplicateMark { .. })
        ));

        let dangling = Template::new(vec![
            LoadActive,
            InvokeCallback,
            Emit(Instruction::pop()),
            Mark("end".into()),
        ]);
        assert!(matches!(
            check(&dangling, true),
            Err(TemplateError::MarkAtEnd { .. })
        ));
    }

    #[test]
    fn test_unbalanced_exit_rejected() {
        use TemplateOp::*;

        // Leaves the callback result on the stack when falling through
        let leaky = Template::new(vec![LoadActive, InvokeCallback]);
        assert!(matches!(
            check(&leaky, true),
            Err(TemplateError::Unbalanced { .. })
        ));

        // Pops more than it pushed
        let underflow = Template::new(vec![LoadActive, InvokeCallback, Emit(Instruction::pop()), Emit(Instruction::pop())]);
        assert!(matches!(
            check(&underflow, true),
            Err(TemplateError::Unbalanced {
                source: StackError::Underflow { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_local_labels_lower() {
        use TemplateOp::*;

        let template = Template::new(vec![
            LoadActive,
            InvokeCallback,
            BranchFalse(Symbol::Local("out".into())),
            Emit(Instruction::nop()),
            Mark("out".into()),
            Emit(Instruction::nop()),
        ]);
        check(&template, false).unwrap();

        let (active, capability, callback, captures) = ctx_parts();
        let ctx = Lowering {
            active: &active,
            capability: &capability,
            callback: &callback,
            captures: &captures,
        };
        let mut stream = InstructionStream::from_instructions([Instruction::ret()]);
        let at = stream.first().unwrap();
        let block = template.lower(&ctx, &mut stream, at, at);
        assert_eq!(block.len(), 5);
        assert_eq!(block.instructions()[1].opcode, OpCode::Call);

        let span = stream.insert_before(at, block).unwrap();
        stream.validate().unwrap();
        assert_eq!(stream.index_of(span.end), Some(4));
        let branch = stream.position_at(2).unwrap();
        assert_eq!(stream.branch_target(branch), stream.position_at(4));
    }

    #[test]
    fn test_capture_index_checked() {
        let template = Template::augment(2);
        assert!(matches!(
            check(&template, false),
            Err(TemplateError::CaptureIndex { index: 0, captures: 0, .. })
        ));
    }
}

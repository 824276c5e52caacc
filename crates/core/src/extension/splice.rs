//! Applying an extension point to a stream

use ilsplice_sdk::{Instruction, OpCode, Operand};
use tracing::debug;

use crate::cursor::Cursor;
use crate::error::{SpliceError, StreamError};
use crate::pattern::{find_all, find_from, PatternMatch};
use crate::stream::{InstructionStream, MatchSpan, Position};

use super::{
    Capture, CaptureDirection, ExtensionPointSpec, Lowering, Occurrence, Placement, SkipTarget,
    SpliceMode,
};

/// What one splice did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpliceReport {
    pub point: String,
    /// Name of the anchor alternative that matched
    pub pattern: String,
    /// Index of that alternative; 0 is the primary
    pub alternative: usize,
    /// Index of the first inserted instruction after the splice
    pub index: usize,
    /// Number of inserted instructions
    pub inserted: usize,
}

impl SpliceReport {
    pub fn used_fallback(&self) -> bool {
        self.alternative > 0
    }
}

/// Find the anchor of `spec` under its occurrence policy.
///
/// Alternatives are tried in order; the first one with an acceptable match
/// wins. A primary that matches too often is an error, not a reason to try
/// the fallbacks.
pub fn locate(
    stream: &InstructionStream,
    spec: &ExtensionPointSpec,
) -> Result<PatternMatch, SpliceError> {
    for (alternative, pattern) in spec.anchors().alternatives().iter().enumerate() {
        let spans = find_all(stream, pattern);
        let span = match spec.occurrence() {
            Occurrence::Unique if spans.len() > 1 => {
                return Err(SpliceError::AmbiguousMatch {
                    point: spec.name().to_string(),
                    pattern: pattern.name().to_string(),
                    count: spans.len(),
                })
            }
            Occurrence::Unique | Occurrence::First => spans.first().copied(),
            Occurrence::Nth(n) => spans.get(n).copied(),
        };

        if let Some(span) = span {
            return Ok(PatternMatch {
                span,
                alternative,
                pattern: pattern.name().to_string(),
            });
        }
    }

    Err(SpliceError::PatternNotFound {
        point: spec.name().to_string(),
        tried: spec.anchors().describe(),
    })
}

/// Splice `spec` into `stream`.
///
/// Everything is resolved before the stream is touched, so on error the
/// stream's listing is unchanged.
pub fn apply(
    stream: &mut InstructionStream,
    spec: &ExtensionPointSpec,
) -> Result<SpliceReport, SpliceError> {
    let point = spec.name();
    let found = locate(stream, spec)?;
    let anchor = found.span;

    let continue_at = match spec.placement() {
        Placement::Before => anchor.start,
        Placement::After => stream
            .next(anchor.end)
            .ok_or_else(|| SpliceError::NoContinuation {
                point: point.to_string(),
            })?,
    };

    let skip_at = if spec.mode() == SpliceMode::Consume && spec.template().uses_skip() {
        resolve_skip(stream, spec, anchor, continue_at)?
    } else {
        continue_at
    };

    let captures = spec
        .captures()
        .iter()
        .map(|capture| resolve_capture(stream, point, anchor, capture))
        .collect::<Result<Vec<_>, _>>()?;

    let incoming = match spec.placement() {
        Placement::Before => stream.labels_at(anchor.start),
        Placement::After => Vec::new(),
    };

    let active = spec.active().load();
    let ctx = Lowering {
        active: &active,
        capability: spec.capability(),
        callback: spec.callback(),
        captures: &captures,
    };
    let block = spec.template().lower(&ctx, stream, continue_at, skip_at);

    let stream_err = |source: StreamError| SpliceError::Stream {
        point: point.to_string(),
        source,
    };

    let mut cursor = Cursor::at(stream, continue_at).map_err(stream_err)?;
    let inserted = cursor.emit_block(block).map_err(stream_err)?;

    // Branches into the anchor now run the splice first
    for label in incoming {
        stream.retarget(label, inserted.start).map_err(stream_err)?;
    }

    let index = stream.index_of(inserted.start).unwrap_or_default();
    let count = stream
        .span_positions(inserted)
        .map(|p| p.len())
        .map_err(stream_err)?;

    debug!(
        "Spliced '{}' at IL_{:04} ({} instructions, anchor '{}')",
        point, index, count, found.pattern
    );

    Ok(SpliceReport {
        point: point.to_string(),
        pattern: found.pattern,
        alternative: found.alternative,
        index,
        inserted: count,
    })
}

fn resolve_skip(
    stream: &InstructionStream,
    spec: &ExtensionPointSpec,
    anchor: MatchSpan,
    continue_at: Position,
) -> Result<Position, SpliceError> {
    let not_found = |reason: String| SpliceError::SkipTargetNotFound {
        point: spec.name().to_string(),
        reason,
    };

    match spec.skip() {
        SkipTarget::AnchorBranch => {
            let positions = stream.span_positions(anchor).map_err(|source| SpliceError::Stream {
                point: spec.name().to_string(),
                source,
            })?;
            positions
                .iter()
                .rev()
                .find_map(|&p| stream.branch_target(p))
                .ok_or_else(|| not_found("anchor contains no branch".to_string()))
        }
        SkipTarget::Pattern(patterns) => patterns
            .alternatives()
            .iter()
            .find_map(|pattern| find_from(stream, continue_at, pattern))
            .map(|span| span.start)
            .ok_or_else(|| not_found(format!("tried: {}", patterns.describe()))),
    }
}

/// Locate a capture and turn it into the loads that reproduce its value
fn resolve_capture(
    stream: &mut InstructionStream,
    point: &str,
    anchor: MatchSpan,
    capture: &Capture,
) -> Result<Vec<Instruction>, SpliceError> {
    let not_found = || SpliceError::CaptureNotFound {
        point: point.to_string(),
        capture: capture.name.clone(),
    };

    let found = {
        let mut cursor = match capture.direction {
            CaptureDirection::Backward => Cursor::at(stream, anchor.start),
            CaptureDirection::Forward => Cursor::at(stream, anchor.end),
        }
        .map_err(|_| not_found())?;

        let mut found = None;
        for _ in 0..=capture.nth {
            let hit = match capture.direction {
                CaptureDirection::Backward => cursor.goto_prev(&capture.predicate),
                CaptureDirection::Forward => {
                    if !cursor.advance() {
                        return Err(not_found());
                    }
                    cursor.goto_next(&capture.predicate)
                }
            };
            found = Some(hit.map_err(|_| not_found())?);
        }
        found.ok_or_else(not_found)?
    };

    let insn = stream.instruction_at(found).ok_or_else(not_found)?;
    if insn.opcode.is_pure_load() {
        return Ok(vec![insn.clone()]);
    }

    // `this.field` is a pure load too when it reads straight off arg 0
    if insn.opcode == OpCode::Ldfld {
        let receiver = stream.prev(found).and_then(|p| stream.instruction_at(p));
        if let Some(receiver) = receiver {
            if receiver.opcode == OpCode::Ldarg && receiver.operand == Operand::Arg(0) {
                return Ok(vec![receiver.clone(), insn.clone()]);
            }
        }
    }

    Err(SpliceError::UnsupportedCapture {
        point: point.to_string(),
        capture: capture.name.clone(),
        instruction: insn.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{stack_depths, walk_path};
    use crate::extension::{Capture, ExtensionPointSpec, ObjectSource};
    use crate::pattern::{Pattern, PatternSet, Predicate};
    use ilsplice_sdk::{FieldRef, Label, MethodBody, MethodRef, TypeRef};

    fn capability() -> TypeRef {
        TypeRef::new("Mods.IRefillParticles")
    }

    fn level() -> FieldRef {
        FieldRef::new("Celeste.Refill", "level")
    }

    /// Ten instructions: the `level` check at 3-4 guards the particle call
    /// at 5 and jumps to the sound at 6
    fn refill_body() -> MethodBody {
        MethodBody::new(vec![
            Instruction::ldarg(0),
            Instruction::call(MethodRef::new_instance("Celeste.Refill", "Collect", 0, false)),
            Instruction::ldarg(0),
            Instruction::ldfld(level()),
            Instruction::brfalse(Label(0)),
            Instruction::call(MethodRef::new_static("Celeste.Refill", "EmitParticles", 0, false)),
            Instruction::ldarg(0),
            Instruction::call(MethodRef::new_instance("Celeste.Refill", "PlaySound", 0, false)),
            Instruction::nop(),
            Instruction::ret(),
        ])
        .with_label(Label(0), 6)
    }

    fn level_check() -> Pattern {
        Pattern::new("level-check")
            .then(Predicate::load_field("level"))
            .then(Predicate::branch_if_false())
    }

    fn consume_spec() -> ExtensionPointSpec {
        ExtensionPointSpec::consume("refill.particles", capability(), level_check())
            .build()
            .unwrap()
    }

    #[test]
    fn test_consume_splice_paths() {
        let original = refill_body();
        let mut stream = InstructionStream::from_body(&original).unwrap();
        let report = apply(&mut stream, &consume_spec()).unwrap();

        let n = report.inserted;
        assert_eq!(n, 6);
        assert_eq!(report.index, 5);
        assert_eq!(stream.len(), 10 + n);
        assert!(!report.used_fallback());

        let patched = stream.to_body();
        let depths = stack_depths(&patched).unwrap();
        let original_depths = stack_depths(&original).unwrap();
        // Original 5 (the particle call) and 6 (the sound) keep their depth
        assert_eq!(depths[5 + n], original_depths[5]);
        assert_eq!(depths[6 + n], original_depths[6]);

        let splice_start = 5;
        let type_test_fails = walk_path(&patched, |index, _| {
            // Take the `level` check's fallthrough, then fail the type test
            index == splice_start + 2
        })
        .unwrap();
        let indices: Vec<usize> = type_test_fails.iter().map(|&(i, _)| i).collect();
        assert!(indices.contains(&(5 + n)));
        let (_, depth) = type_test_fails
            .iter()
            .find(|&&(i, _)| i == 5 + n)
            .copied()
            .unwrap();
        assert_eq!(Some(depth), original_depths[5]);

        let handled = walk_path(&patched, |index, _| index == splice_start + 5).unwrap();
        let indices: Vec<usize> = handled.iter().map(|&(i, _)| i).collect();
        assert!(!indices.contains(&(5 + n)));
        assert!(indices.contains(&(6 + n)));
        let (_, depth) = handled.iter().find(|&&(i, _)| i == 6 + n).copied().unwrap();
        assert_eq!(Some(depth), original_depths[6]);
    }

    #[test]
    fn test_consume_splice_shape() {
        let mut stream = InstructionStream::from_body(&refill_body()).unwrap();
        apply(&mut stream, &consume_spec()).unwrap();
        let listing = stream.listing();

        assert_eq!(listing[5], Instruction::ldarg(0));
        assert_eq!(listing[6], Instruction::isinst(capability()));
        // brfalse continue -> original particle call, now at 11
        assert_eq!(listing[7], Instruction::brfalse(Label(11)));
        assert_eq!(listing[8], Instruction::ldarg(0));
        assert_eq!(listing[9].opcode, OpCode::Call);
        // brtrue skip -> original sound, now at 12
        assert_eq!(listing[10], Instruction::brtrue(Label(12)));
        // The anchor's own branch still targets the sound
        assert_eq!(listing[4], Instruction::brfalse(Label(12)));
    }

    #[test]
    fn test_build_variants_share_one_spec() {
        let holding = FieldRef::new("Celeste.Player", "Holding");
        let variant_a = MethodBody::new(vec![
            Instruction::ldarg(0),
            Instruction::ldfld(holding.clone()),
            Instruction::brfalse(Label(0)),
            Instruction::ldarg(0),
            Instruction::call(MethodRef::new_instance("Celeste.Player", "Throw", 0, false)),
            Instruction::ret(),
        ])
        .with_label(Label(0), 5);
        // The other build keeps the loaded value around for the call
        let variant_b = MethodBody::new(vec![
            Instruction::ldarg(0),
            Instruction::ldfld(holding),
            Instruction::dup(),
            Instruction::brfalse(Label(0)),
            Instruction::call(MethodRef::new_static("Celeste.Player", "Throw", 1, false)),
            Instruction::br(Label(1)),
            Instruction::pop(),
            Instruction::ret(),
        ])
        .with_label(Label(0), 6)
        .with_label(Label(1), 7);

        let anchors = PatternSet::new(
            Pattern::new("holding/plain")
                .then(Predicate::load_field("Holding"))
                .then(Predicate::branch_if_false()),
        )
        .or(Pattern::new("holding/dup")
            .then(Predicate::load_field("Holding"))
            .then(Predicate::opcode(OpCode::Dup))
            .then(Predicate::branch_if_false()));
        let spec = ExtensionPointSpec::consume("player.throw", TypeRef::new("Mods.IThrowable"), anchors)
            .build()
            .unwrap();

        let mut a = InstructionStream::from_body(&variant_a).unwrap();
        let mut b = InstructionStream::from_body(&variant_b).unwrap();
        let ra = apply(&mut a, &spec).unwrap();
        let rb = apply(&mut b, &spec).unwrap();

        assert_eq!(ra.alternative, 0);
        assert_eq!(rb.alternative, 1);
        assert_eq!(rb.pattern, "holding/dup");
        assert_eq!(ra.inserted, rb.inserted);

        // Same splice relative to each anchor
        let la = a.listing();
        let lb = b.listing();
        let sa = &la[ra.index..ra.index + ra.inserted];
        let sb = &lb[rb.index..rb.index + rb.inserted];
        for (x, y) in sa.iter().zip(sb) {
            assert_eq!(x.opcode, y.opcode);
        }
        assert!(stack_depths(&a.to_body()).is_ok());
        assert!(stack_depths(&b.to_body()).is_ok());
    }

    #[test]
    fn test_ambiguous_and_missing_leave_stream_unchanged() {
        let mut body = refill_body();
        body.instructions[8] = Instruction::ldfld(level());
        body.instructions.insert(9, Instruction::brfalse(Label(0)));
        let mut stream = InstructionStream::from_body(&body).unwrap();
        let snapshot = stream.clone();

        let err = apply(&mut stream, &consume_spec()).unwrap_err();
        assert!(matches!(err, SpliceError::AmbiguousMatch { count: 2, .. }));
        assert_eq!(stream, snapshot);

        let missing = ExtensionPointSpec::consume(
            "refill.missing",
            capability(),
            Pattern::new("throws").then(Predicate::opcode(OpCode::Throw)),
        )
        .build()
        .unwrap();
        let err = apply(&mut stream, &missing).unwrap_err();
        assert!(matches!(err, SpliceError::PatternNotFound { ref tried, .. } if tried == "throws"));
        assert_eq!(stream, snapshot);
    }

    #[test]
    fn test_occurrence_nth() {
        let mut body = refill_body();
        body.instructions[8] = Instruction::ldfld(level());
        body.instructions.insert(9, Instruction::brfalse(Label(0)));
        let stream = InstructionStream::from_body(&body).unwrap();

        let spec = ExtensionPointSpec::consume("refill.second", capability(), level_check())
            .occurrence(Occurrence::Nth(1))
            .build()
            .unwrap();
        let found = locate(&stream, &spec).unwrap();
        assert_eq!(stream.index_of(found.span.start), Some(8));
    }

    #[test]
    fn test_before_placement_moves_incoming_labels() {
        // Branch into the anchor start from earlier in the method
        let body = MethodBody::new(vec![
            Instruction::ldarg(1),
            Instruction::brtrue(Label(1)),
            Instruction::nop(),
            Instruction::ldarg(0),
            Instruction::ldfld(level()),
            Instruction::brfalse(Label(0)),
            Instruction::nop(),
            Instruction::ret(),
        ])
        .with_label(Label(0), 7)
        .with_label(Label(1), 3);

        let spec = ExtensionPointSpec::consume(
            "refill.before",
            capability(),
            Pattern::new("p")
                .then(Predicate::with_index(OpCode::Ldarg, 0))
                .then(Predicate::load_field("level"))
                .then(Predicate::branch_if_false()),
        )
        .placement(Placement::Before)
        .build()
        .unwrap();

        let mut stream = InstructionStream::from_body(&body).unwrap();
        let report = apply(&mut stream, &spec).unwrap();
        assert_eq!(report.index, 3);
        let target = stream.label_target(Label(1)).unwrap();
        assert_eq!(stream.index_of(target), Some(3));
        stack_depths(&stream.to_body()).unwrap();
    }

    #[test]
    fn test_skip_to_end_pattern() {
        let spec = ExtensionPointSpec::consume("refill.to-nop", capability(), level_check())
            .skip_to(SkipTarget::Pattern(
                Pattern::new("tail").then(Predicate::opcode(OpCode::Nop)).into(),
            ))
            .build()
            .unwrap();
        let mut stream = InstructionStream::from_body(&refill_body()).unwrap();
        let report = apply(&mut stream, &spec).unwrap();
        let listing = stream.listing();
        let nop_index = 8 + report.inserted;
        assert_eq!(listing[nop_index].opcode, OpCode::Nop);
        assert_eq!(listing[report.index + 5], Instruction::brtrue(Label(nop_index as u32)));
    }

    #[test]
    fn test_augment_with_captures() {
        let body = MethodBody::new(vec![
            Instruction::ldarg(0),
            Instruction::ldc_r4(0.5),
            Instruction::stloc(0),
            Instruction::ldstr("event:/game/general/diamond_touch"),
            Instruction::call(MethodRef::new_static("Celeste.Audio", "Play", 1, false)),
            Instruction::pop(),
            Instruction::ret(),
        ]);
        let spec = ExtensionPointSpec::augment(
            "refill.sound",
            capability(),
            Pattern::new("play").then(Predicate::call("Audio::Play")),
        )
        .placement(Placement::Before)
        .capture(Capture::backward("event", Predicate::opcode(OpCode::Ldstr)))
        .capture(Capture::backward("owner", Predicate::opcode(OpCode::Ldarg)))
        .build()
        .unwrap();

        let mut stream = InstructionStream::from_body(&body).unwrap();
        let report = apply(&mut stream, &spec).unwrap();
        let listing = stream.listing();
        let splice = &listing[report.index..report.index + report.inserted];
        assert_eq!(splice[3], Instruction::ldarg(0));
        assert_eq!(splice[4], Instruction::ldstr("event:/game/general/diamond_touch"));
        assert_eq!(splice[5], Instruction::ldarg(0));
        assert_eq!(splice[6].method().map(|m| m.params), Some(3));
        stack_depths(&stream.to_body()).unwrap();
    }

    #[test]
    fn test_capture_must_be_pure_load() {
        let body = refill_body();
        let spec = ExtensionPointSpec::augment("refill.collect", capability(), level_check())
            .capture(Capture::backward("collect", Predicate::call("Collect")))
            .build()
            .unwrap();
        let mut stream = InstructionStream::from_body(&body).unwrap();
        let err = apply(&mut stream, &spec).unwrap_err();
        assert!(matches!(err, SpliceError::UnsupportedCapture { .. }));

        let spec = ExtensionPointSpec::augment("refill.nothing", capability(), level_check())
            .capture(Capture::forward("string", Predicate::opcode(OpCode::Ldstr)))
            .build()
            .unwrap();
        let err = apply(&mut stream, &spec).unwrap_err();
        assert!(matches!(err, SpliceError::CaptureNotFound { .. }));
    }

    #[test]
    fn test_this_field_active_object() {
        let owner = FieldRef::new("Celeste.Refill+<Routine>d__1", "<>4__this");
        let spec = ExtensionPointSpec::consume("refill.routine", capability(), level_check())
            .active(ObjectSource::ThisField(owner.clone()))
            .build()
            .unwrap();
        let mut stream = InstructionStream::from_body(&refill_body()).unwrap();
        let report = apply(&mut stream, &spec).unwrap();
        assert_eq!(report.inserted, 8);
        let listing = stream.listing();
        assert_eq!(listing[report.index + 1], Instruction::ldfld(owner));
        stack_depths(&stream.to_body()).unwrap();
    }
}

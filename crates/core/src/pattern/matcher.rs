//! Pattern search over instruction streams
//!
//! Matching rules:
//! - the first step must match at the window start
//! - each later step may be preceded by at most `max_gap` skipped
//!   instructions
//! - a skipped instruction must not satisfy the first step (a shorter
//!   window starts there) nor any step after the current one (the window
//!   would jump over that step's match)
//!
//! Together these make every reported window minimal for its anchor.

use crate::stream::{InstructionStream, MatchSpan, Position};

use super::{Pattern, PatternSet};

/// Result of a successful search
#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub span: MatchSpan,
    /// Index of the alternative that matched (0 is the primary)
    pub alternative: usize,
    /// Name of the alternative that matched
    pub pattern: String,
}

impl PatternMatch {
    /// Check if a fallback, not the primary pattern, matched
    pub fn used_fallback(&self) -> bool {
        self.alternative > 0
    }
}

/// No alternative matched
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("No pattern matched (tried: {tried})")]
pub struct MatchError {
    pub tried: String,
}

/// Try to match `pattern` with its first step at `start`
pub fn match_at(
    stream: &InstructionStream,
    start: Position,
    pattern: &Pattern,
) -> Option<MatchSpan> {
    let steps = pattern.steps();
    let first = steps.first()?;
    if !first.predicate.matches(stream.instruction_at(start)?) {
        return None;
    }

    let mut end = start;
    for (i, step) in steps.iter().enumerate().skip(1) {
        let mut skipped = 0;
        let mut cur = stream.next(end);
        loop {
            let pos = cur?;
            let insn = stream.instruction_at(pos)?;
            if step.predicate.matches(insn) {
                end = pos;
                break;
            }

            if first.predicate.matches(insn)
                || steps[i + 1..].iter().any(|s| s.predicate.matches(insn))
            {
                return None;
            }

            skipped += 1;
            if skipped > step.max_gap {
                return None;
            }
            cur = stream.next(pos);
        }
    }

    Some(MatchSpan::new(start, end))
}

/// First match of `pattern` at or after `from`
pub fn find_from(
    stream: &InstructionStream,
    from: Position,
    pattern: &Pattern,
) -> Option<MatchSpan> {
    let mut cur = Some(from);
    while let Some(pos) = cur {
        if let Some(span) = match_at(stream, pos, pattern) {
            return Some(span);
        }
        cur = stream.next(pos);
    }
    None
}

/// All non-overlapping matches of `pattern`, in stream order
pub fn find_all(stream: &InstructionStream, pattern: &Pattern) -> Vec<MatchSpan> {
    let mut spans = Vec::new();
    let mut cur = stream.first();
    while let Some(pos) = cur {
        match match_at(stream, pos, pattern) {
            Some(span) => {
                spans.push(span);
                cur = stream.next(span.end);
            }
            None => cur = stream.next(pos),
        }
    }
    spans
}

/// First match of the first alternative that matches anywhere
pub fn find_first(
    stream: &InstructionStream,
    patterns: &PatternSet,
) -> Result<PatternMatch, MatchError> {
    for (alternative, pattern) in patterns.alternatives().iter().enumerate() {
        if let Some(start) = stream.first() {
            if let Some(span) = find_from(stream, start, pattern) {
                return Ok(PatternMatch {
                    span,
                    alternative,
                    pattern: pattern.name().to_string(),
                });
            }
        }
    }

    Err(MatchError {
        tried: patterns.describe(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::Predicate;
    use ilsplice_sdk::{FieldRef, Instruction, Label, MethodBody, OpCode};

    fn holding() -> FieldRef {
        FieldRef::new("Celeste.Player", "Holding")
    }

    fn stream(insns: Vec<Instruction>, label_at: usize) -> InstructionStream {
        let body = MethodBody::new(insns).with_label(Label(0), label_at);
        InstructionStream::from_body(&body).unwrap()
    }

    fn variant_a() -> InstructionStream {
        stream(
            vec![
                Instruction::ldarg(0),
                Instruction::ldfld(holding()),
                Instruction::brfalse(Label(0)),
                Instruction::nop(),
                Instruction::ret(),
            ],
            4,
        )
    }

    fn variant_b() -> InstructionStream {
        stream(
            vec![
                Instruction::ldarg(0),
                Instruction::ldfld(holding()),
                Instruction::dup(),
                Instruction::brfalse(Label(0)),
                Instruction::pop(),
                Instruction::ret(),
            ],
            5,
        )
    }

    fn plain() -> Pattern {
        Pattern::new("plain")
            .then(Predicate::load_field("Holding"))
            .then(Predicate::branch_if_false())
    }

    fn with_dup() -> Pattern {
        Pattern::new("dup")
            .then(Predicate::load_field("Holding"))
            .then(Predicate::opcode(OpCode::Dup))
            .then(Predicate::branch_if_false())
    }

    #[test]
    fn test_contiguous_match() {
        let s = variant_a();
        let span = find_from(&s, s.first().unwrap(), &plain()).unwrap();
        assert_eq!(s.index_of(span.start), Some(1));
        assert_eq!(s.index_of(span.end), Some(2));
    }

    #[test]
    fn test_contiguous_rejects_gap() {
        let s = variant_b();
        assert!(find_all(&s, &plain()).is_empty());
    }

    #[test]
    fn test_gap_tolerance() {
        let s = variant_b();
        let windowed = Pattern::new("windowed")
            .then(Predicate::load_field("Holding"))
            .then_within(1, Predicate::branch_if_false());
        let spans = find_all(&s, &windowed);
        assert_eq!(spans.len(), 1);
        assert_eq!(s.index_of(spans[0].end), Some(3));
    }

    #[test]
    fn test_gap_never_skips_later_step() {
        // ldfld Holding; brtrue; brfalse -- the brtrue matches the last step,
        // so the middle step may not skip over it
        let s = stream(
            vec![
                Instruction::ldfld(holding()),
                Instruction::brtrue(Label(0)),
                Instruction::nop(),
                Instruction::brfalse(Label(0)),
                Instruction::ret(),
            ],
            4,
        );
        let pattern = Pattern::new("p")
            .then(Predicate::load_field("Holding"))
            .then_within(3, Predicate::opcode(OpCode::Nop))
            .then(Predicate::branch_if_true().or(Predicate::branch_if_false()));
        assert!(find_all(&s, &pattern).is_empty());
    }

    #[test]
    fn test_window_is_minimal() {
        let s = stream(
            vec![
                Instruction::ldfld(holding()),
                Instruction::ldfld(holding()),
                Instruction::brfalse(Label(0)),
                Instruction::ret(),
            ],
            3,
        );
        let pattern = Pattern::new("p")
            .then(Predicate::load_field("Holding"))
            .then_within(2, Predicate::branch_if_false());
        let span = find_from(&s, s.first().unwrap(), &pattern).unwrap();
        assert_eq!(s.index_of(span.start), Some(1));
    }

    #[test]
    fn test_fallback_used_when_primary_fails() {
        let set = PatternSet::new(plain()).or(with_dup());

        let a = variant_a();
        let m = find_first(&a, &set).unwrap();
        assert_eq!(m.alternative, 0);
        assert!(!m.used_fallback());

        let b = variant_b();
        let m = find_first(&b, &set).unwrap();
        assert_eq!(m.alternative, 1);
        assert_eq!(m.pattern, "dup");
        assert_eq!(b.index_of(m.span.start), Some(1));
        assert_eq!(b.index_of(m.span.end), Some(3));
    }

    #[test]
    fn test_not_found_lists_alternatives() {
        let set = PatternSet::new(with_dup()).or(Pattern::new("never").then(Predicate::opcode(OpCode::Throw)));
        let err = find_first(&variant_a(), &set).unwrap_err();
        assert_eq!(err.tried, "dup, never");
    }

    #[test]
    fn test_find_all_non_overlapping() {
        let s = stream(
            vec![
                Instruction::ldfld(holding()),
                Instruction::brfalse(Label(0)),
                Instruction::ldfld(holding()),
                Instruction::brfalse(Label(0)),
                Instruction::ret(),
            ],
            4,
        );
        assert_eq!(find_all(&s, &plain()).len(), 2);
    }

    #[test]
    fn test_empty_stream() {
        let s = InstructionStream::new();
        assert!(find_first(&s, &PatternSet::new(plain())).is_err());
        assert!(find_all(&s, &plain()).is_empty());
    }
}

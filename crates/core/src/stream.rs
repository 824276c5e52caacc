//! Mutable instruction stream with stable positions
//!
//! Instructions live in a slot map and are chained into a doubly linked
//! list, so a [`Position`] keeps pointing at the same instruction no matter
//! what gets inserted around it. Labels map to positions; inserting never
//! moves a label, only [`InstructionStream::retarget`] does.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use slotmap::{new_key_type, SlotMap};

use ilsplice_sdk::{Instruction, Label, MethodBody};

use crate::error::StreamError;

new_key_type! {
    /// Stable handle to one instruction of a stream
    pub struct Position;
}

/// Inclusive range of positions produced by a match or an insertion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchSpan {
    pub start: Position,
    pub end: Position,
}

impl MatchSpan {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    /// Span covering a single instruction
    pub fn single(position: Position) -> Self {
        Self::new(position, position)
    }
}

#[derive(Clone)]
struct Node {
    insn: Instruction,
    prev: Option<Position>,
    next: Option<Position>,
}

/// Where a block binds a label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    /// Index into the block's own instructions
    Inner(usize),
    /// An instruction already in the stream
    Existing(Position),
}

/// Instructions to insert as one unit, plus the labels they bind
#[derive(Debug, Clone, Default)]
pub struct Block {
    instructions: Vec<Instruction>,
    bindings: Vec<(Label, Binding)>,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an instruction
    pub fn push(&mut self, insn: Instruction) -> &mut Self {
        self.instructions.push(insn);
        self
    }

    /// Bind `label` to the next instruction pushed
    pub fn mark(&mut self, label: Label) -> &mut Self {
        self.bindings
            .push((label, Binding::Inner(self.instructions.len())));
        self
    }

    /// Bind `label` to an instruction already in the stream when the block
    /// is inserted
    pub fn bind_existing(&mut self, label: Label, position: Position) -> &mut Self {
        self.bindings.push((label, Binding::Existing(position)));
        self
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

impl From<Vec<Instruction>> for Block {
    fn from(instructions: Vec<Instruction>) -> Self {
        Self {
            instructions,
            bindings: Vec::new(),
        }
    }
}

/// A method body as an editable sequence of instructions
#[derive(Clone, Default)]
pub struct InstructionStream {
    nodes: SlotMap<Position, Node>,
    head: Option<Position>,
    tail: Option<Position>,
    labels: BTreeMap<Label, Position>,
    next_label: u32,
    returns_value: bool,
}

impl InstructionStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from plain instructions without labels
    pub fn from_instructions(instructions: impl IntoIterator<Item = Instruction>) -> Self {
        let mut stream = Self::new();
        for insn in instructions {
            stream.link_back(insn);
        }
        stream
    }

    /// Load a host body. Fails if any label is out of range or any branch
    /// target is unbound.
    pub fn from_body(body: &MethodBody) -> Result<Self, StreamError> {
        let mut stream = Self::new();
        stream.returns_value = body.returns_value;

        let positions: Vec<Position> = body
            .instructions
            .iter()
            .map(|insn| stream.link_back(insn.clone()))
            .collect();

        for (&label, &index) in &body.labels {
            let position = *positions
                .get(index)
                .ok_or(StreamError::UnboundLabel(label))?;
            stream.labels.insert(label, position);
        }
        stream.next_label = body.labels.keys().map(|l| l.0 + 1).max().unwrap_or(0);

        for insn in &body.instructions {
            for &label in insn.branch_targets() {
                if !stream.labels.contains_key(&label) {
                    return Err(StreamError::UnboundLabel(label));
                }
                stream.next_label = stream.next_label.max(label.0 + 1);
            }
        }

        Ok(stream)
    }

    /// Flatten back into a host body, keeping label identities
    pub fn to_body(&self) -> MethodBody {
        let index: HashMap<Position, usize> =
            self.positions().enumerate().map(|(i, p)| (p, i)).collect();

        MethodBody {
            instructions: self.instructions().cloned().collect(),
            labels: self
                .labels
                .iter()
                .filter_map(|(&label, pos)| index.get(pos).map(|&i| (label, i)))
                .collect(),
            returns_value: self.returns_value,
        }
    }

    /// Normalized, index-resolved view used for observational equality
    pub fn listing(&self) -> Vec<Instruction> {
        self.to_body().normalized()
    }

    pub fn returns_value(&self) -> bool {
        self.returns_value
    }

    pub fn set_returns_value(&mut self, returns_value: bool) {
        self.returns_value = returns_value;
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, position: Position) -> bool {
        self.nodes.contains_key(position)
    }

    pub fn first(&self) -> Option<Position> {
        self.head
    }

    pub fn last(&self) -> Option<Position> {
        self.tail
    }

    pub fn next(&self, position: Position) -> Option<Position> {
        self.nodes.get(position).and_then(|n| n.next)
    }

    pub fn prev(&self, position: Position) -> Option<Position> {
        self.nodes.get(position).and_then(|n| n.prev)
    }

    pub fn instruction_at(&self, position: Position) -> Option<&Instruction> {
        self.nodes.get(position).map(|n| &n.insn)
    }

    /// Current index of a position; walks the list
    pub fn index_of(&self, position: Position) -> Option<usize> {
        self.positions().position(|p| p == position)
    }

    /// Position currently at `index`
    pub fn position_at(&self, index: usize) -> Option<Position> {
        self.positions().nth(index)
    }

    /// Valid positions in stream order; lazy and restartable
    pub fn positions(&self) -> Positions<'_> {
        Positions {
            stream: self,
            cursor: self.head,
        }
    }

    /// Instructions in stream order
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> + '_ {
        self.positions().filter_map(|p| self.instruction_at(p))
    }

    /// Positions from `span.start` to `span.end` inclusive
    pub fn span_positions(&self, span: MatchSpan) -> Result<Vec<Position>, StreamError> {
        if !self.contains(span.start) || !self.contains(span.end) {
            return Err(StreamError::UnknownPosition);
        }
        let mut out = Vec::new();
        let mut cur = Some(span.start);
        while let Some(pos) = cur {
            out.push(pos);
            if pos == span.end {
                return Ok(out);
            }
            cur = self.next(pos);
        }
        Err(StreamError::InvalidSpan)
    }

    // ------------------------------------------------------------------
    // Labels
    // ------------------------------------------------------------------

    /// Reserve a label id that is not used anywhere in this stream.
    ///
    /// The label is unbound until a block or [`Self::mark_label`] binds it.
    pub fn define_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Bind an unbound label to a position
    pub fn mark_label(&mut self, label: Label, position: Position) -> Result<(), StreamError> {
        if !self.contains(position) {
            return Err(StreamError::UnknownPosition);
        }
        if self.labels.contains_key(&label) {
            return Err(StreamError::LabelAlreadyBound(label));
        }
        self.next_label = self.next_label.max(label.0 + 1);
        self.labels.insert(label, position);
        Ok(())
    }

    /// Move an already bound label to another position
    pub fn retarget(&mut self, label: Label, position: Position) -> Result<(), StreamError> {
        if !self.contains(position) {
            return Err(StreamError::UnknownPosition);
        }
        let slot = self
            .labels
            .get_mut(&label)
            .ok_or(StreamError::UnboundLabel(label))?;
        *slot = position;
        Ok(())
    }

    pub fn label_target(&self, label: Label) -> Option<Position> {
        self.labels.get(&label).copied()
    }

    /// Labels currently bound to `position`
    pub fn labels_at(&self, position: Position) -> Vec<Label> {
        self.labels
            .iter()
            .filter(|(_, &p)| p == position)
            .map(|(&l, _)| l)
            .collect()
    }

    /// Position a branch at `position` jumps to, for single-target branches
    pub fn branch_target(&self, position: Position) -> Option<Position> {
        match self.instruction_at(position)?.branch_targets() {
            [label] => self.label_target(*label),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Insert a block so that it ends right before `position`.
    ///
    /// Returns the span of inserted instructions. On error nothing changes.
    pub fn insert_before(
        &mut self,
        position: Position,
        block: Block,
    ) -> Result<MatchSpan, StreamError> {
        if !self.contains(position) {
            return Err(StreamError::UnknownPosition);
        }
        self.check_block(&block)?;
        Ok(self.commit_block(self.prev(position), Some(position), block))
    }

    /// Insert a block so that it starts right after `position`
    pub fn insert_after(
        &mut self,
        position: Position,
        block: Block,
    ) -> Result<MatchSpan, StreamError> {
        if !self.contains(position) {
            return Err(StreamError::UnknownPosition);
        }
        self.check_block(&block)?;
        Ok(self.commit_block(Some(position), self.next(position), block))
    }

    /// Insert a block at the end of the stream
    pub fn append(&mut self, block: Block) -> Result<MatchSpan, StreamError> {
        self.check_block(&block)?;
        Ok(self.commit_block(self.tail, None, block))
    }

    /// Remove the instructions of a span.
    ///
    /// Labels bound inside the span move to the instruction after it. If the
    /// span reaches the end of the stream and a label points into it, nothing
    /// is removed.
    pub fn remove(&mut self, span: MatchSpan) -> Result<Vec<Instruction>, StreamError> {
        let doomed = self.span_positions(span)?;
        let doomed_set: HashSet<Position> = doomed.iter().copied().collect();
        let after = self.next(span.end);

        let moved: Vec<Label> = self
            .labels
            .iter()
            .filter(|(_, p)| doomed_set.contains(*p))
            .map(|(&l, _)| l)
            .collect();

        if let (Some(&label), None) = (moved.first(), after) {
            return Err(StreamError::OrphanedLabel(label));
        }

        let before = self.prev(span.start);
        match before {
            Some(b) => self.nodes[b].next = after,
            None => self.head = after,
        }
        match after {
            Some(a) => self.nodes[a].prev = before,
            None => self.tail = before,
        }
        if let Some(after) = after {
            for label in moved {
                self.labels.insert(label, after);
            }
        }

        Ok(doomed
            .into_iter()
            .filter_map(|p| self.nodes.remove(p).map(|n| n.insn))
            .collect())
    }

    /// Replace the instruction at `position`, keeping its identity and labels
    pub fn replace(
        &mut self,
        position: Position,
        insn: Instruction,
    ) -> Result<Instruction, StreamError> {
        if let Some(&label) = insn
            .branch_targets()
            .iter()
            .find(|l| !self.labels.contains_key(*l))
        {
            return Err(StreamError::UnboundLabel(label));
        }
        let node = self
            .nodes
            .get_mut(position)
            .ok_or(StreamError::UnknownPosition)?;
        Ok(std::mem::replace(&mut node.insn, insn))
    }

    /// Check that every branch target is bound to a live instruction
    pub fn validate(&self) -> Result<(), StreamError> {
        for insn in self.instructions() {
            for &label in insn.branch_targets() {
                match self.labels.get(&label) {
                    Some(&p) if self.contains(p) => {}
                    _ => return Err(StreamError::UnboundLabel(label)),
                }
            }
        }
        Ok(())
    }

    fn link_back(&mut self, insn: Instruction) -> Position {
        let prev = self.tail;
        let position = self.nodes.insert(Node {
            insn,
            prev,
            next: None,
        });
        match prev {
            Some(p) => self.nodes[p].next = Some(position),
            None => self.head = Some(position),
        }
        self.tail = Some(position);
        position
    }

    fn check_block(&self, block: &Block) -> Result<(), StreamError> {
        if block.is_empty() {
            return Err(StreamError::EmptyBlock);
        }

        let mut bound_here = HashSet::new();
        for &(label, binding) in &block.bindings {
            if self.labels.contains_key(&label) {
                return Err(StreamError::LabelAlreadyBound(label));
            }
            if !bound_here.insert(label) {
                return Err(StreamError::DuplicateBinding(label));
            }
            match binding {
                Binding::Inner(index) if index >= block.len() => {
                    return Err(StreamError::BindingOutOfRange {
                        label,
                        index,
                        len: block.len(),
                    })
                }
                Binding::Existing(p) if !self.contains(p) => {
                    return Err(StreamError::UnknownPosition)
                }
                _ => {}
            }
        }

        for insn in &block.instructions {
            for label in insn.operand.labels() {
                if !self.labels.contains_key(label) && !bound_here.contains(label) {
                    return Err(StreamError::UnboundLabel(*label));
                }
            }
        }
        Ok(())
    }

    fn commit_block(
        &mut self,
        before: Option<Position>,
        after: Option<Position>,
        block: Block,
    ) -> MatchSpan {
        let Block {
            instructions,
            bindings,
        } = block;

        let mut inserted = Vec::with_capacity(instructions.len());
        let mut prev = before;
        for insn in instructions {
            let position = self.nodes.insert(Node {
                insn,
                prev,
                next: None,
            });
            match prev {
                Some(p) => self.nodes[p].next = Some(position),
                None => self.head = Some(position),
            }
            inserted.push(position);
            prev = Some(position);
        }
        // `prev` is the last inserted node here
        match after {
            Some(a) => self.nodes[a].prev = prev,
            None => self.tail = prev,
        }
        if let Some(last) = prev {
            self.nodes[last].next = after;
        }

        for (label, binding) in bindings {
            let position = match binding {
                Binding::Inner(index) => inserted[index],
                Binding::Existing(p) => p,
            };
            self.next_label = self.next_label.max(label.0 + 1);
            self.labels.insert(label, position);
        }

        MatchSpan::new(inserted[0], inserted[inserted.len() - 1])
    }
}

impl PartialEq for InstructionStream {
    fn eq(&self, other: &Self) -> bool {
        self.returns_value == other.returns_value && self.listing() == other.listing()
    }
}

impl fmt::Debug for InstructionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstructionStream({} instructions)", self.len())
    }
}

impl fmt::Display for InstructionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, position) in self.positions().enumerate() {
            for label in self.labels_at(position) {
                writeln!(f, "{label}:")?;
            }
            if let Some(insn) = self.instruction_at(position) {
                writeln!(f, "  IL_{index:04}: {insn}")?;
            }
        }
        Ok(())
    }
}

/// Iterator over stream positions
#[derive(Clone)]
pub struct Positions<'a> {
    stream: &'a InstructionStream,
    cursor: Option<Position>,
}

impl Iterator for Positions<'_> {
    type Item = Position;

    fn next(&mut self) -> Option<Position> {
        let current = self.cursor?;
        self.cursor = self.stream.next(current);
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ilsplice_sdk::{FieldRef, MethodRef};

    fn sample() -> InstructionStream {
        let body = MethodBody::new(vec![
            Instruction::ldarg(0),
            Instruction::ldfld(FieldRef::new("Celeste.Refill", "level")),
            Instruction::brfalse(Label(0)),
            Instruction::call(MethodRef::new_static("Celeste.Refill", "Emit", 0, false)),
            Instruction::ret(),
        ])
        .with_label(Label(0), 4);
        InstructionStream::from_body(&body).unwrap()
    }

    #[test]
    fn test_body_roundtrip_keeps_labels() {
        let stream = sample();
        let body = stream.to_body();
        assert_eq!(body.resolve(Label(0)), Some(4));
        assert_eq!(InstructionStream::from_body(&body).unwrap(), stream);
    }

    #[test]
    fn test_from_body_rejects_unbound_branch() {
        let body = MethodBody::new(vec![Instruction::br(Label(5)), Instruction::ret()]);
        assert_eq!(
            InstructionStream::from_body(&body).unwrap_err(),
            StreamError::UnboundLabel(Label(5))
        );
    }

    #[test]
    fn test_positions_survive_insertion() {
        let mut stream = sample();
        let call = stream.position_at(3).unwrap();
        let ret = stream.position_at(4).unwrap();

        let first = stream.first().unwrap();
        stream
            .insert_after(first, Block::from(vec![Instruction::nop(), Instruction::nop()]))
            .unwrap();

        assert_eq!(stream.len(), 7);
        assert_eq!(stream.index_of(call), Some(5));
        assert_eq!(stream.index_of(ret), Some(6));
        assert_eq!(stream.label_target(Label(0)), Some(ret));
    }

    #[test]
    fn test_insert_before_does_not_move_labels() {
        let mut stream = sample();
        let ret = stream.position_at(4).unwrap();
        let span = stream
            .insert_before(ret, Block::from(vec![Instruction::nop()]))
            .unwrap();

        assert_eq!(stream.index_of(span.start), Some(4));
        // Branch still lands on the original ret, not on the new nop
        assert_eq!(stream.label_target(Label(0)), Some(ret));
    }

    #[test]
    fn test_failed_insert_leaves_stream_unchanged() {
        let mut stream = sample();
        let before = stream.clone();
        let at = stream.position_at(2).unwrap();

        let missing = Label(99);
        let err = stream
            .insert_before(at, Block::from(vec![Instruction::br(missing)]))
            .unwrap_err();
        assert_eq!(err, StreamError::UnboundLabel(missing));

        let mut out_of_range = Block::new();
        out_of_range.push(Instruction::nop());
        out_of_range.push(Instruction::nop());
        out_of_range.mark(Label(50));
        assert!(matches!(
            stream.insert_before(at, out_of_range),
            Err(StreamError::BindingOutOfRange { .. })
        ));

        assert!(matches!(
            stream.insert_before(at, Block::new()),
            Err(StreamError::EmptyBlock)
        ));

        assert_eq!(stream, before);
        assert_eq!(stream.len(), 5);
    }

    #[test]
    fn test_block_binds_inner_label() {
        let mut stream = sample();
        let at = stream.position_at(3).unwrap();
        let skip = stream.define_label();

        let mut block = Block::new();
        block.push(Instruction::br(skip));
        block.push(Instruction::nop());
        block.mark(skip);
        block.push(Instruction::nop());

        let span = stream.insert_before(at, block).unwrap();
        let target = stream.label_target(skip).unwrap();
        assert_eq!(stream.index_of(target), Some(5));
        assert_eq!(stream.next(target), Some(at));
        assert_eq!(stream.index_of(span.end), Some(5));
        stream.validate().unwrap();
    }

    #[test]
    fn test_remove_retargets_labels() {
        let mut stream = sample();
        let call = stream.position_at(3).unwrap();
        let ret = stream.position_at(4).unwrap();
        let label = stream.define_label();
        stream.mark_label(label, call).unwrap();

        let removed = stream.remove(MatchSpan::single(call)).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(stream.label_target(label), Some(ret));
        assert!(!stream.contains(call));
    }

    #[test]
    fn test_remove_tail_with_label_fails() {
        let mut stream = sample();
        let ret = stream.last().unwrap();
        let before = stream.clone();
        assert_eq!(
            stream.remove(MatchSpan::single(ret)).unwrap_err(),
            StreamError::OrphanedLabel(Label(0))
        );
        assert_eq!(stream, before);
    }

    #[test]
    fn test_positions_restartable() {
        let stream = sample();
        let iter = stream.positions();
        let again = iter.clone();
        assert_eq!(iter.count(), 5);
        assert_eq!(again.count(), 5);
    }

    #[test]
    fn test_define_labels_are_unique() {
        let mut stream = sample();
        let a = stream.define_label();
        let b = stream.define_label();
        assert_ne!(a, b);
        assert_ne!(a, Label(0));
    }

    #[test]
    fn test_display_lists_labels() {
        let text = sample().to_string();
        assert!(text.contains("IL_0001: ldfld Celeste.Refill::level"));
        assert!(text.contains("L0:\n  IL_0004: ret"));
    }
}

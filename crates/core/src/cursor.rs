//! Stateful cursor over an instruction stream
//!
//! The cursor sits *on* an instruction, or past the end of the stream.
//! Searches run strictly forward (or strictly backward for
//! [`Cursor::goto_prev`]) in a single pass, so the order of calls encodes
//! anchor precedence. Emitting inserts before the current instruction and
//! leaves the cursor on it, i.e. advanced past what was emitted. Emitting
//! after moves the cursor onto the last inserted instruction, so repeated
//! calls keep program order.

use ilsplice_sdk::{Instruction, Label};

use crate::error::StreamError;
use crate::pattern::{match_at, Pattern, Predicate};
use crate::stream::{Block, InstructionStream, MatchSpan, Position};

/// Editing cursor
pub struct Cursor<'a> {
    stream: &'a mut InstructionStream,
    /// `None` means past the last instruction
    current: Option<Position>,
}

impl<'a> Cursor<'a> {
    /// Cursor on the first instruction
    pub fn new(stream: &'a mut InstructionStream) -> Self {
        let current = stream.first();
        Self { stream, current }
    }

    /// Cursor on a given instruction
    pub fn at(stream: &'a mut InstructionStream, position: Position) -> Result<Self, StreamError> {
        if !stream.contains(position) {
            return Err(StreamError::UnknownPosition);
        }
        Ok(Self {
            stream,
            current: Some(position),
        })
    }

    pub fn stream(&self) -> &InstructionStream {
        self.stream
    }

    pub fn position(&self) -> Option<Position> {
        self.current
    }

    pub fn instruction(&self) -> Option<&Instruction> {
        self.current.and_then(|p| self.stream.instruction_at(p))
    }

    pub fn is_at_end(&self) -> bool {
        self.current.is_none()
    }

    pub fn goto(&mut self, position: Position) -> Result<(), StreamError> {
        if !self.stream.contains(position) {
            return Err(StreamError::UnknownPosition);
        }
        self.current = Some(position);
        Ok(())
    }

    pub fn goto_start(&mut self) {
        self.current = self.stream.first();
    }

    pub fn goto_end(&mut self) {
        self.current = None;
    }

    /// Step to the next instruction; returns false once past the end
    pub fn advance(&mut self) -> bool {
        self.current = self.current.and_then(|p| self.stream.next(p));
        self.current.is_some()
    }

    /// Move to the first instruction at or after the cursor satisfying
    /// `predicate`. On failure the cursor does not move.
    pub fn goto_next(&mut self, predicate: &Predicate) -> Result<Position, StreamError> {
        let mut cur = self.current;
        while let Some(pos) = cur {
            if self
                .stream
                .instruction_at(pos)
                .is_some_and(|insn| predicate.matches(insn))
            {
                self.current = Some(pos);
                return Ok(pos);
            }
            cur = self.stream.next(pos);
        }
        Err(StreamError::NotFound(predicate.description().to_string()))
    }

    /// Find the first window at or after the cursor where the predicates
    /// match contiguously, and move past it
    pub fn goto_next_sequence(&mut self, predicates: &[Predicate]) -> Result<MatchSpan, StreamError> {
        let pattern = Pattern::contiguous("sequence", predicates.to_vec());
        self.goto_next_pattern(&pattern)
    }

    /// Like [`Self::goto_next_sequence`], honoring the pattern's gaps
    pub fn goto_next_pattern(&mut self, pattern: &Pattern) -> Result<MatchSpan, StreamError> {
        let mut cur = self.current;
        while let Some(pos) = cur {
            if let Some(span) = match_at(self.stream, pos, pattern) {
                self.current = self.stream.next(span.end);
                return Ok(span);
            }
            cur = self.stream.next(pos);
        }
        Err(StreamError::NotFound(pattern.to_string()))
    }

    /// Move to the nearest instruction strictly before the cursor
    /// satisfying `predicate`. On failure the cursor does not move.
    pub fn goto_prev(&mut self, predicate: &Predicate) -> Result<Position, StreamError> {
        let mut cur = match self.current {
            Some(p) => self.stream.prev(p),
            None => self.stream.last(),
        };
        while let Some(pos) = cur {
            if self
                .stream
                .instruction_at(pos)
                .is_some_and(|insn| predicate.matches(insn))
            {
                self.current = Some(pos);
                return Ok(pos);
            }
            cur = self.stream.prev(pos);
        }
        Err(StreamError::NotFound(predicate.description().to_string()))
    }

    /// Target of the branch under the cursor
    pub fn branch_target(&self) -> Option<Position> {
        self.current.and_then(|p| self.stream.branch_target(p))
    }

    /// Labels bound to the instruction under the cursor
    pub fn incoming_labels(&self) -> Vec<Label> {
        self.current
            .map(|p| self.stream.labels_at(p))
            .unwrap_or_default()
    }

    /// Bind a new label to the instruction under the cursor
    pub fn mark_label(&mut self) -> Result<Label, StreamError> {
        let position = self
            .current
            .ok_or_else(|| StreamError::NotFound("instruction to label".to_string()))?;
        let label = self.stream.define_label();
        self.stream.mark_label(label, position)?;
        Ok(label)
    }

    /// Insert one instruction before the cursor
    pub fn emit(&mut self, insn: Instruction) -> Result<Position, StreamError> {
        self.emit_block(Block::from(vec![insn])).map(|span| span.start)
    }

    /// Insert a block before the cursor
    pub fn emit_block(&mut self, block: Block) -> Result<MatchSpan, StreamError> {
        match self.current {
            Some(p) => self.stream.insert_before(p, block),
            None => self.stream.append(block),
        }
    }

    /// Insert one instruction after the cursor
    pub fn emit_after(&mut self, insn: Instruction) -> Result<Position, StreamError> {
        self.emit_block_after(Block::from(vec![insn])).map(|span| span.end)
    }

    /// Insert a block after the cursor and move onto its last instruction
    ///
    /// Fails past the end, where there is no instruction to follow.
    pub fn emit_block_after(&mut self, block: Block) -> Result<MatchSpan, StreamError> {
        let position = self
            .current
            .ok_or_else(|| StreamError::NotFound("instruction to emit after".to_string()))?;
        let span = self.stream.insert_after(position, block)?;
        self.current = Some(span.end);
        Ok(span)
    }

    /// Reserve a label in the underlying stream
    pub fn define_label(&mut self) -> Label {
        self.stream.define_label()
    }
}

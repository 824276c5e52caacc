//! Method body exchange format
//!
//! This is what the host hands over when asked for a method and what it
//! receives back on activation. It is a flat, index-addressed form: labels
//! map to instruction indices.

use std::collections::BTreeMap;

use crate::instruction::Instruction;
use crate::operand::Label;

/// Flat method body
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MethodBody {
    pub instructions: Vec<Instruction>,
    /// Label -> index into `instructions`
    pub labels: BTreeMap<Label, usize>,
    /// Whether `ret` leaves a value on the stack
    pub returns_value: bool,
}

impl MethodBody {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self {
            instructions,
            labels: BTreeMap::new(),
            returns_value: false,
        }
    }

    pub fn with_label(mut self, label: Label, index: usize) -> Self {
        self.labels.insert(label, index);
        self
    }

    pub fn with_returns_value(mut self, returns_value: bool) -> Self {
        self.returns_value = returns_value;
        self
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Index an instruction's label operand resolves to
    pub fn resolve(&self, label: Label) -> Option<usize> {
        self.labels.get(&label).copied()
    }

    /// Copy with every label operand replaced by `Label(target index)`.
    ///
    /// Two bodies with equal normalized forms have identical instruction
    /// sequences and identical control flow, regardless of label naming.
    pub fn normalized(&self) -> Vec<Instruction> {
        self.instructions
            .iter()
            .map(|insn| {
                let mut insn = insn.clone();
                insn.map_labels(|label| match self.resolve(label) {
                    Some(index) => Label(index as u32),
                    None => Label(u32::MAX),
                });
                insn
            })
            .collect()
    }

    /// Check that every label is in range and every branch resolves
    pub fn dangling_labels(&self) -> Vec<Label> {
        let mut dangling: Vec<Label> = self
            .labels
            .iter()
            .filter(|(_, &index)| index >= self.instructions.len())
            .map(|(&label, _)| label)
            .collect();

        for insn in &self.instructions {
            for &label in insn.branch_targets() {
                if self.resolve(label).is_none() && !dangling.contains(&label) {
                    dangling.push(label);
                }
            }
        }
        dangling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_ignores_label_names() {
        let a = MethodBody::new(vec![
            Instruction::ldarg(0),
            Instruction::brfalse(Label(1)),
            Instruction::nop(),
            Instruction::ret(),
        ])
        .with_label(Label(1), 3);

        let b = MethodBody::new(vec![
            Instruction::ldarg(0),
            Instruction::brfalse(Label(42)),
            Instruction::nop(),
            Instruction::ret(),
        ])
        .with_label(Label(42), 3);

        assert_ne!(a, b);
        assert_eq!(a.normalized(), b.normalized());
    }

    #[test]
    fn test_dangling_labels() {
        let body = MethodBody::new(vec![Instruction::br(Label(9)), Instruction::ret()])
            .with_label(Label(2), 5);
        let dangling = body.dangling_labels();
        assert!(dangling.contains(&Label(2)));
        assert!(dangling.contains(&Label(9)));
    }
}

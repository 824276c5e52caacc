//! Stack-depth dataflow over method bodies
//!
//! Computes the evaluation stack depth on entry to every reachable
//! instruction and rejects bodies where two paths disagree, a pop
//! underflows, or a `ret` leaves the wrong number of values behind.

use ilsplice_sdk::{Instruction, Label, MethodBody, OpCode};

use crate::stream::InstructionStream;

/// Stack discipline violation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StackError {
    #[error("Stack underflow at IL_{index:04} ({instruction})")]
    Underflow { index: usize, instruction: String },

    #[error("Stack depth mismatch at IL_{index:04}: {expected} on one path, {found} on another")]
    Mismatch {
        index: usize,
        expected: u32,
        found: u32,
    },

    #[error("Return at IL_{index:04} with stack depth {depth}, expected {expected}")]
    BadReturn {
        index: usize,
        depth: u32,
        expected: u32,
    },

    #[error("Control falls off the end after IL_{index:04}")]
    FallsOffEnd { index: usize },

    #[error("Branch at IL_{index:04} targets unbound label {label}")]
    UnboundLabel { index: usize, label: Label },
}

/// Entry depth of every instruction; `None` marks unreachable code
pub fn stack_depths(body: &MethodBody) -> Result<Vec<Option<u32>>, StackError> {
    let mut depths = vec![None; body.len()];
    if body.is_empty() {
        return Ok(depths);
    }

    let mut work = vec![(0usize, 0u32)];
    while let Some((index, depth)) = work.pop() {
        match depths[index] {
            Some(known) if known == depth => continue,
            Some(known) => {
                return Err(StackError::Mismatch {
                    index,
                    expected: known,
                    found: depth,
                })
            }
            None => depths[index] = Some(depth),
        }
        work.extend(successors(body, index, depth)?);
    }
    Ok(depths)
}

/// Check a stream for stack balance
pub fn check_stream(stream: &InstructionStream) -> Result<(), StackError> {
    stack_depths(&stream.to_body()).map(|_| ())
}

/// Follow one execution path from the method entry.
///
/// `take_branch` decides each conditional branch. Returns every visited
/// `(index, entry depth)` pair, ending at the first `ret` or `throw`. Loops
/// are cut after a generous step count.
pub fn walk_path(
    body: &MethodBody,
    mut take_branch: impl FnMut(usize, &Instruction) -> bool,
) -> Result<Vec<(usize, u32)>, StackError> {
    let mut visited = Vec::new();
    let mut current = if body.is_empty() { None } else { Some((0, 0)) };
    let limit = body.len() * 8;

    while let Some((index, depth)) = current.take() {
        visited.push((index, depth));
        if visited.len() > limit {
            break;
        }

        let insn = &body.instructions[index];
        let next = successors(body, index, depth)?;
        current = match insn.opcode.is_branch() && insn.opcode.falls_through() {
            // Conditional: successors are the fallthrough plus targets
            true => {
                let fallthrough = next.iter().copied().find(|&(i, _)| i == index + 1);
                let target = next.iter().copied().find(|&(i, _)| i != index + 1);
                if take_branch(index, insn) {
                    target.or(fallthrough)
                } else {
                    fallthrough
                }
            }
            false => next.first().copied(),
        };
    }
    Ok(visited)
}

fn successors(
    body: &MethodBody,
    index: usize,
    depth: u32,
) -> Result<Vec<(usize, u32)>, StackError> {
    let insn = &body.instructions[index];
    let effect = insn.stack_effect();
    let pops = u32::from(effect.pops);
    if depth < pops {
        return Err(StackError::Underflow {
            index,
            instruction: insn.to_string(),
        });
    }
    let after = depth - pops + u32::from(effect.pushes);

    let mut out = Vec::new();
    match insn.opcode {
        OpCode::Ret => {
            let expected = u32::from(body.returns_value);
            if depth != expected {
                return Err(StackError::BadReturn {
                    index,
                    depth,
                    expected,
                });
            }
            return Ok(out);
        }
        OpCode::Throw | OpCode::Endfinally => return Ok(out),
        _ => {}
    }

    // `leave` empties the evaluation stack
    let target_depth = if insn.opcode == OpCode::Leave { 0 } else { after };
    for &label in insn.branch_targets() {
        let target = body
            .resolve(label)
            .filter(|&target| target < body.len())
            .ok_or(StackError::UnboundLabel { index, label })?;
        out.push((target, target_depth));
    }

    if insn.opcode.falls_through() {
        if index + 1 >= body.len() {
            return Err(StackError::FallsOffEnd { index });
        }
        // Fallthrough first, so `walk_path` sees it in a stable spot
        out.insert(0, (index + 1, after));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ilsplice_sdk::{FieldRef, MethodRef};

    fn guarded() -> MethodBody {
        MethodBody::new(vec![
            Instruction::ldarg(0),
            Instruction::ldfld(FieldRef::new("Celeste.Refill", "oneUse")),
            Instruction::brfalse(Label(0)),
            Instruction::ldarg(0),
            Instruction::call(MethodRef::new_instance("Celeste.Refill", "Respawn", 0, false)),
            Instruction::ret(),
        ])
        .with_label(Label(0), 5)
    }

    #[test]
    fn test_depths() {
        let depths = stack_depths(&guarded()).unwrap();
        assert_eq!(
            depths,
            vec![Some(0), Some(1), Some(1), Some(0), Some(1), Some(0)]
        );
    }

    #[test]
    fn test_unreachable_is_none() {
        let body = MethodBody::new(vec![
            Instruction::br(Label(0)),
            Instruction::nop(),
            Instruction::ret(),
        ])
        .with_label(Label(0), 2);
        assert_eq!(stack_depths(&body).unwrap(), vec![Some(0), None, Some(0)]);
    }

    #[test]
    fn test_underflow() {
        let body = MethodBody::new(vec![Instruction::pop(), Instruction::ret()]);
        assert!(matches!(
            stack_depths(&body),
            Err(StackError::Underflow { index: 0, .. })
        ));
    }

    #[test]
    fn test_mismatch_at_join() {
        // One path pushes before the join, the other does not
        let body = MethodBody::new(vec![
            Instruction::ldarg(0),
            Instruction::brtrue(Label(0)),
            Instruction::ldc_i4(1),
            Instruction::nop(),
            Instruction::ret(),
        ])
        .with_label(Label(0), 3);
        assert!(matches!(
            stack_depths(&body),
            Err(StackError::Mismatch { index: 3, .. })
        ));
    }

    #[test]
    fn test_return_depth() {
        let body = MethodBody::new(vec![Instruction::ldc_i4(1), Instruction::ret()]);
        assert!(matches!(
            stack_depths(&body),
            Err(StackError::BadReturn { depth: 1, expected: 0, .. })
        ));
        let body = body.with_returns_value(true);
        assert!(stack_depths(&body).is_ok());
    }

    #[test]
    fn test_falls_off_end() {
        let body = MethodBody::new(vec![Instruction::nop()]);
        assert_eq!(
            stack_depths(&body).unwrap_err(),
            StackError::FallsOffEnd { index: 0 }
        );
    }

    #[test]
    fn test_label_past_end_is_unbound() {
        let body = MethodBody::new(vec![Instruction::br(Label(0)), Instruction::ret()])
            .with_label(Label(0), 7);

        let expected = StackError::UnboundLabel {
            index: 0,
            label: Label(0),
        };
        assert_eq!(stack_depths(&body).unwrap_err(), expected);
        assert_eq!(walk_path(&body, |_, _| true).unwrap_err(), expected);
    }

    #[test]
    fn test_walk_path_follows_decisions() {
        let body = guarded();
        let taken = walk_path(&body, |_, _| true).unwrap();
        assert_eq!(taken, vec![(0, 0), (1, 1), (2, 1), (5, 0)]);

        let fallthrough = walk_path(&body, |_, _| false).unwrap();
        let indices: Vec<usize> = fallthrough.iter().map(|&(i, _)| i).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    }
}

//! Compact text syntax for patterns
//!
//! Steps are separated by `;`:
//! - `ldfld Player::Holding` - opcode with member operand
//! - `ldarg.0`, `ldc.i4 3` - opcode with index or constant
//! - `ldstr "event:/game/general/diamond_touch"` - opcode with string
//! - `brfalse|brtrue` - either opcode
//! - `@call`, `@brfalse`, `@load` - opcode family
//! - `*` - any instruction
//! - `?2` - allow up to two unrelated instructions before the next step
//!
//! `;` and `|` inside a quoted string are part of the string.

use ilsplice_sdk::{OpCode, Operand};

use super::{OpFamily, Pattern, Predicate};

/// Error in pattern text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternSyntaxError {
    #[error("Pattern '{0}' has no steps")]
    Empty(String),

    #[error("Unknown opcode '{0}'")]
    UnknownOpCode(String),

    #[error("Unknown opcode family '@{0}'")]
    UnknownFamily(String),

    #[error("Invalid operand '{operand}' for {opcode}")]
    BadOperand { opcode: String, operand: String },

    #[error("Invalid gap '{0}'")]
    BadGap(String),

    #[error("Gap at end of pattern '{0}'")]
    TrailingGap(String),
}

pub(super) fn parse_pattern(name: String, text: &str) -> Result<Pattern, PatternSyntaxError> {
    let mut pattern = Pattern::new(name.clone());
    let mut gap = 0usize;
    let mut pending_gap = false;

    for token in split_unquoted(text, ';')
        .into_iter()
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        if let Some(rest) = token.strip_prefix('?') {
            gap = if rest.is_empty() {
                1
            } else {
                rest.parse()
                    .map_err(|_| PatternSyntaxError::BadGap(token.to_string()))?
            };
            pending_gap = true;
            continue;
        }

        let predicate = split_unquoted(token, '|')
            .into_iter()
            .map(|alt| parse_step(alt.trim()))
            .reduce(|a, b| Ok(a?.or(b?)))
            .unwrap_or_else(|| Err(PatternSyntaxError::Empty(name.clone())))?;

        pattern = pattern.then_within(gap, predicate);
        gap = 0;
        pending_gap = false;
    }

    if pending_gap {
        return Err(PatternSyntaxError::TrailingGap(name));
    }
    if pattern.is_empty() {
        return Err(PatternSyntaxError::Empty(name));
    }
    Ok(pattern)
}

/// Split on `sep` outside double quotes
fn split_unquoted(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;

    for (i, c) in text.char_indices() {
        if c == '"' {
            quoted = !quoted;
        } else if c == sep && !quoted {
            parts.push(&text[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&text[start..]);
    parts
}

fn parse_step(text: &str) -> Result<Predicate, PatternSyntaxError> {
    if text == "*" {
        return Ok(Predicate::any());
    }
    if let Some(family) = text.strip_prefix('@') {
        return parse_family(family).map(Predicate::family);
    }

    let (mnemonic, operand) = match text.split_once(char::is_whitespace) {
        Some((m, o)) => (m, Some(o.trim())),
        None => (text, None),
    };
    let opcode: OpCode = mnemonic
        .parse()
        .map_err(|_| PatternSyntaxError::UnknownOpCode(mnemonic.to_string()))?;

    let bad_operand = |operand: &str| PatternSyntaxError::BadOperand {
        opcode: opcode.mnemonic().to_string(),
        operand: operand.to_string(),
    };

    match operand {
        // `ldarg.0` style short forms carry their index in the mnemonic
        None => match inline_index(mnemonic) {
            Some(index) => Ok(Predicate::with_index(opcode, index)),
            None => Ok(Predicate::opcode(opcode)),
        },
        Some(operand) => match operand_kind(opcode) {
            OperandKind::Member => Ok(Predicate::member(opcode, operand)),
            OperandKind::Index => operand
                .parse::<i64>()
                .map(|v| Predicate::with_index(opcode, v))
                .map_err(|_| bad_operand(operand)),
            OperandKind::Float => {
                let value: f64 = operand.parse().map_err(|_| bad_operand(operand))?;
                Ok(Predicate::custom(text.to_string(), move |insn| {
                    insn.opcode == opcode
                        && matches!(insn.operand, Operand::Float(v) if (v - value).abs() < 1e-6)
                }))
            }
            OperandKind::Str => {
                let unquoted = operand
                    .strip_prefix('"')
                    .and_then(|s| s.strip_suffix('"'))
                    .ok_or_else(|| bad_operand(operand))?;
                Ok(Predicate::with_str(opcode, unquoted))
            }
            OperandKind::None => Err(bad_operand(operand)),
        },
    }
}

enum OperandKind {
    None,
    Member,
    Index,
    Float,
    Str,
}

fn operand_kind(opcode: OpCode) -> OperandKind {
    use OpCode::*;

    match opcode {
        Ldfld | Ldflda | Stfld | Ldsfld | Stsfld | Call | Callvirt | Newobj | Isinst
        | Castclass | Box | Unbox => OperandKind::Member,
        Ldarg | Ldarga | Starg | Ldloc | Ldloca | Stloc | LdcI4 | LdcI8 => OperandKind::Index,
        LdcR4 | LdcR8 => OperandKind::Float,
        Ldstr => OperandKind::Str,
        _ => OperandKind::None,
    }
}

/// Index embedded in a short-form mnemonic (`ldloc.3`, `ldc.i4.1`)
fn inline_index(mnemonic: &str) -> Option<i64> {
    let (head, tail) = mnemonic.rsplit_once('.')?;
    if head.is_empty() || tail.is_empty() || !tail.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    // `ldc.i4` / `conv.r4` end in digits but are full mnemonics
    if mnemonic.parse::<OpCode>().ok()?.mnemonic() == mnemonic.to_ascii_lowercase() {
        return None;
    }
    tail.parse().ok()
}

fn parse_family(name: &str) -> Result<OpFamily, PatternSyntaxError> {
    let family = match name.to_ascii_lowercase().as_str() {
        "load" => OpFamily::LOAD,
        "store" => OpFamily::STORE,
        "fieldload" | "field" => OpFamily::FIELD_LOAD,
        "call" => OpFamily::CALL,
        "jump" => OpFamily::JUMP,
        "brtrue" => OpFamily::BRANCH_TRUE,
        "brfalse" => OpFamily::BRANCH_FALSE,
        "compare" => OpFamily::BRANCH_COMPARE,
        "branch" => OpFamily::BRANCH,
        "typetest" => OpFamily::TYPE_TEST,
        "exit" => OpFamily::EXIT,
        _ => return Err(PatternSyntaxError::UnknownFamily(name.to_string())),
    };
    Ok(family)
}

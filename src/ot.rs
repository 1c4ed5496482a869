//! The Operational Transformation algebra: `transform` rebases a client operation
//! against one it didn't know about yet; `apply` folds an operation into document
//! content. Both are pure and total over the operation types they recognize.
//!
//! Grounded on `original_source/utils/ot.py` (`adjust_position`, `transform`,
//! `apply_operation`): this module is a direct, idiomatic-Rust restatement of that
//! algebra, not a novel design. The convergence contract (TP1 in the spec) is:
//! for operations `a` and `b` applied to identical content, `apply(apply(c, a),
//! transform(b, a))` must equal `apply(apply(c, b), transform(a, b))`.

use crate::position::{adjust, Position};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Input,
    Paste,
    Undo,
    Delete,
    Cursor,
}

impl OperationType {
    #[must_use]
    pub const fn is_additive(self) -> bool {
        matches!(self, Self::Input | Self::Paste | Self::Undo)
    }
}

/// Wire and log form of a single edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub from_pos: Position,
    pub to_pos: Position,
    /// Replacement lines; length >= 1. Unused (conventionally `[""]`) for DELETE,
    /// where only the splice boundaries in `from_pos`/`to_pos` matter.
    pub text: Vec<String>,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub revision: u64,
}

impl Operation {
    /// The length of the first replacement line, used by `adjust` as the shift amount
    /// a same-line position needs to move by.
    fn first_line_len(&self) -> u32 {
        u32::try_from(self.text.first().map_or(0, String::chars).count())
            .unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OtError {
    #[error("unrecognized operation type combination: new={new:?} prev={prev:?}")]
    InvalidOperation {
        new: OperationType,
        prev: OperationType,
    },
    #[error("position out of bounds for current content: {0:?}")]
    BadRange(Position),
}

/// Rebase `new` (not yet applied) against `prev` (already applied, concurrent with
/// `new`). See the module doc for the convergence contract this must satisfy.
pub fn transform(new: &Operation, prev: &Operation) -> Result<Operation, OtError> {
    use OperationType::{Delete, Input, Paste, Undo};

    match (new.op_type, prev.op_type) {
        (Input | Paste | Undo, Input | Paste | Undo) => {
            let l = prev.first_line_len();
            Ok(Operation {
                from_pos: adjust(new.from_pos, prev.from_pos, l),
                to_pos: adjust(new.to_pos, prev.from_pos, l),
                text: new.text.clone(),
                op_type: new.op_type,
                revision: new.revision,
            })
        }
        (Input | Paste | Undo, Delete) => Ok(Operation {
            from_pos: adjust_after_delete(new.from_pos, prev.from_pos, prev.to_pos),
            to_pos: adjust_after_delete(new.to_pos, prev.from_pos, prev.to_pos),
            text: new.text.clone(),
            op_type: new.op_type,
            revision: new.revision,
        }),
        (Delete, Input | Paste | Undo) => {
            let l = prev.first_line_len();
            Ok(Operation {
                from_pos: adjust(new.from_pos, prev.from_pos, l),
                to_pos: new.to_pos,
                text: new.text.clone(),
                op_type: Delete,
                revision: new.revision,
            })
        }
        // Known limitation (carried from the source, see DESIGN.md): returning `new`
        // unchanged is correct only for disjoint delete ranges, not overlapping ones.
        (Delete, Delete) => Ok(new.clone()),
        (new_type @ OperationType::Cursor, prev_type)
        | (new_type, prev_type @ OperationType::Cursor) => {
            Err(OtError::InvalidOperation {
                new: new_type,
                prev: prev_type,
            })
        }
    }
}

/// Where `new_pos` lands after a concurrent deletion of `[prev_from, prev_to)`.
///
/// This is the delete-aware counterpart of `position::adjust`: a position before the
/// deleted range is unaffected, a position inside it collapses to the deletion point,
/// and a position after it shifts back by exactly the deleted span (merging onto
/// `prev_from`'s line when the deletion crossed a line boundary).
///
/// Divergence from `original_source` (see DESIGN.md): the source's
/// `transform`/prev-is-DELETE branch decrements `new_pos.line` by one unconditionally,
/// which is only sound for whole-line deletions and underflows (and breaks
/// convergence, TP1) for the common case of an intra-line delete — confirmed by the
/// worked example in the specification itself, which requires a same-line character
/// shift, not a line shift. This function implements the character-shift behavior the
/// worked example requires.
fn adjust_after_delete(new_pos: Position, prev_from: Position, prev_to: Position) -> Position {
    if new_pos.line < prev_from.line || (new_pos.line == prev_from.line && new_pos.ch <= prev_from.ch) {
        return new_pos;
    }
    if new_pos.line < prev_to.line || (new_pos.line == prev_to.line && new_pos.ch <= prev_to.ch) {
        return prev_from;
    }
    if new_pos.line == prev_to.line {
        Position::new(prev_from.line, prev_from.ch + (new_pos.ch - prev_to.ch))
    } else {
        Position::new(new_pos.line - (prev_to.line - prev_from.line), new_pos.ch)
    }
}

/// Fold `op` into `content` (document lines), returning the new content.
pub fn apply(content: &[String], op: &Operation) -> Result<Vec<String>, OtError> {
    let from = op.from_pos;
    let to = op.to_pos;

    let start_line = line_ref(content, from.line)?;
    let end_line = line_ref(content, to.line)?;

    let before = slice_prefix(start_line, from.ch)?;
    let after = slice_suffix(end_line, to.ch)?;

    let combined: Vec<String> = match op.op_type {
        OperationType::Input | OperationType::Paste | OperationType::Undo => {
            let middle = &op.text;
            match middle.len() {
                0 => return Err(OtError::BadRange(from)),
                1 => vec![format!("{before}{}{after}", middle[0])],
                2 => vec![format!("{before}{}", middle[0]), format!("{}{after}", middle[1])],
                _ => {
                    let mut lines = Vec::with_capacity(middle.len());
                    lines.push(format!("{before}{}", middle[0]));
                    lines.extend(middle[1..middle.len() - 1].iter().cloned());
                    lines.push(format!("{}{after}", middle[middle.len() - 1]));
                    lines
                }
            }
        }
        OperationType::Delete => {
            let boundary = op.text.first().map_or("", String::as_str);
            vec![format!("{before}{boundary}{after}")]
        }
        OperationType::Cursor => return Err(OtError::BadRange(from)),
    };

    let start = from.line as usize;
    let end = to.line as usize;
    let mut new_content = content.to_vec();
    new_content.splice(start..=end, combined);
    Ok(new_content)
}

fn line_ref(content: &[String], line: u32) -> Result<&str, OtError> {
    content
        .get(line as usize)
        .map(String::as_str)
        .ok_or(OtError::BadRange(Position::new(line, 0)))
}

fn slice_prefix(line: &str, ch: u32) -> Result<String, OtError> {
    let chars: Vec<char> = line.chars().collect();
    let ch = ch as usize;
    if ch > chars.len() {
        return Err(OtError::BadRange(Position::new(0, ch as u32)));
    }
    Ok(chars[..ch].iter().collect())
}

fn slice_suffix(line: &str, ch: u32) -> Result<String, OtError> {
    let chars: Vec<char> = line.chars().collect();
    let ch = ch as usize;
    if ch > chars.len() {
        return Err(OtError::BadRange(Position::new(0, ch as u32)));
    }
    Ok(chars[ch..].iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(
        from: (u32, u32),
        to: (u32, u32),
        text: &[&str],
        ty: OperationType,
        rev: u64,
    ) -> Operation {
        Operation {
            from_pos: Position::new(from.0, from.1),
            to_pos: Position::new(to.0, to.1),
            text: text.iter().map(|s| (*s).to_string()).collect(),
            op_type: ty,
            revision: rev,
        }
    }

    fn content(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|s| (*s).to_string()).collect()
    }

    // Scenario 1: insert at head, single line.
    #[test]
    fn scenario_insert_at_head() {
        let c = content(&["hello"]);
        let o = op((0, 0), (0, 0), &["Hi, "], OperationType::Input, 0);
        let result = apply(&c, &o).unwrap();
        assert_eq!(result, content(&["Hi, hello"]));
    }

    // Scenario 2: concurrent inserts converge regardless of order.
    #[test]
    fn scenario_concurrent_inserts_converge() {
        let c = content(&["abc"]);
        let a = op((0, 0), (0, 0), &["X"], OperationType::Input, 5);
        let b = op((0, 2), (0, 2), &["Y"], OperationType::Input, 5);

        // Order 1: apply a, then transform(b, a), apply.
        let after_a = apply(&c, &a).unwrap();
        let b_t = transform(&b, &a).unwrap();
        let result1 = apply(&after_a, &b_t).unwrap();

        // Order 2: apply b, then transform(a, b), apply.
        let after_b = apply(&c, &b).unwrap();
        let a_t = transform(&a, &b).unwrap();
        let result2 = apply(&after_b, &a_t).unwrap();

        assert_eq!(result1, content(&["XabYc"]));
        assert_eq!(result1, result2);
    }

    // Scenario 3: insert rebased against an earlier, already-applied delete.
    #[test]
    fn scenario_insert_vs_earlier_delete() {
        let c = content(&["abcdef"]);
        let prev = op((0, 1), (0, 2), &[""], OperationType::Delete, 11);
        let new = op((0, 4), (0, 4), &["Z"], OperationType::Input, 10);

        let c_after_prev = apply(&c, &prev).unwrap();
        assert_eq!(c_after_prev, content(&["acdef"]));

        let transformed = transform(&new, &prev).unwrap();
        let result = apply(&c_after_prev, &transformed).unwrap();
        assert_eq!(result, content(&["acdZef"]));
    }

    // Scenario 4: multi-line insert. The specification's own worked example text
    // second-guesses itself here ("wait — splice replaces..."); applying its own
    // general rule from section 4.3 consistently (before+text[0], the middle lines
    // untouched, text[-1]+after, then splicing into content[from.line..=to.line])
    // gives a 4-line result, not the 3-line "Cline2" merge the prose lands on. This
    // test pins the result of mechanically applying the stated rule.
    #[test]
    fn scenario_multiline_insert() {
        let c = content(&["line1", "line2"]);
        let o = op((0, 5), (0, 5), &["A", "B", "C"], OperationType::Input, 0);
        let result = apply(&c, &o).unwrap();
        assert_eq!(result, content(&["line1A", "B", "C", "line2"]));
    }

    // Scenario 5: range delete.
    #[test]
    fn scenario_range_delete() {
        let c = content(&["abc def", "ghi"]);
        let o = op((0, 0), (0, 3), &[""], OperationType::Delete, 0);
        let result = apply(&c, &o).unwrap();
        assert_eq!(result, content(&[" def", "ghi"]));
    }

    #[test]
    fn additive_vs_delete_position_inside_deleted_range_collapses() {
        let prev = op((0, 1), (0, 3), &[""], OperationType::Delete, 0);
        let new = op((0, 2), (0, 2), &["Z"], OperationType::Input, 0);
        let result = transform(&new, &prev).unwrap();
        assert_eq!(result.from_pos, Position::new(0, 1));
    }

    #[test]
    fn additive_vs_delete_position_before_deleted_range_is_unaffected() {
        let prev = op((0, 4), (0, 6), &[""], OperationType::Delete, 0);
        let new = op((0, 2), (0, 2), &["Z"], OperationType::Input, 0);
        let result = transform(&new, &prev).unwrap();
        assert_eq!(result.from_pos, Position::new(0, 2));
    }

    #[test]
    fn delete_vs_delete_is_unchanged() {
        let a = op((0, 0), (0, 1), &[""], OperationType::Delete, 0);
        let b = op((0, 2), (0, 3), &[""], OperationType::Delete, 0);
        assert_eq!(transform(&b, &a).unwrap(), b);
    }

    // TP2: identity against a zero-length additive no-op at (0,0).
    #[test]
    fn identity_against_noop() {
        let noop = op((0, 0), (0, 0), &[""], OperationType::Input, 0);
        let o = op((2, 3), (2, 5), &["hi"], OperationType::Input, 7);
        assert_eq!(transform(&o, &noop).unwrap(), o);
    }

    #[test]
    fn cursor_is_never_transformable() {
        let c = op((0, 0), (0, 0), &[""], OperationType::Cursor, 0);
        let i = op((0, 0), (0, 0), &["x"], OperationType::Input, 0);
        assert!(transform(&c, &i).is_err());
        assert!(transform(&i, &c).is_err());
    }

    #[test]
    fn apply_out_of_bounds_line_is_bad_range() {
        let c = content(&["abc"]);
        let o = op((5, 0), (5, 0), &["x"], OperationType::Input, 0);
        assert!(matches!(apply(&c, &o), Err(OtError::BadRange(_))));
    }

    #[test]
    fn apply_out_of_bounds_ch_is_bad_range() {
        let c = content(&["abc"]);
        let o = op((0, 50), (0, 50), &["x"], OperationType::Input, 0);
        assert!(matches!(apply(&c, &o), Err(OtError::BadRange(_))));
    }
}

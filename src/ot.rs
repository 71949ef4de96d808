//! Pure operational-transform functions: `apply` and `transform`.
//!
//! Everything in this module is synchronous and allocates only the returned
//! value. No locking, no I/O — the engine in [`crate::engine`] is the only
//! thing that owns mutable document state.

use serde::{Deserialize, Serialize};

/// Whether an [`Operation`] inserts or deletes text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// Splice `payload` into the document at `position`.
    Insert,
    /// Remove `len(payload)` chars starting at `position`; `payload` must
    /// match what's actually there or the op is rejected.
    Delete,
}

/// An atomic document edit.
///
/// `position` is a character (not byte) offset. `version` is overloaded by
/// direction, matching the wire protocol literally: on a client submission it
/// carries the client's logical (base) version; once the engine accepts the
/// op it is overwritten with the room version at the moment of acceptance
/// (this is the pinned tie-break behavior for same-position concurrent ops).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Client-chosen unique id for this op.
    pub id: String,
    /// Insert or delete.
    pub kind: OpKind,
    /// Character offset within the document.
    pub position: u64,
    /// For insert, the text to splice; for delete, the text expected to be removed.
    pub payload: String,
    /// Opaque id of the client that produced this op.
    pub client_id: String,
    /// Opaque id of the user behind that client, if known.
    pub user_id: Option<String>,
    /// See struct docs: base version on submission, assigned version once accepted.
    pub version: u64,
}

impl Operation {
    fn payload_chars(&self) -> u64 {
        self.payload.chars().count() as u64
    }
}

/// Failure applying an operation to document content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    /// `position` (or `position + len(payload)` for delete) is past the end of the content.
    #[error("operation position is out of bounds")]
    OutOfBounds,
    /// A delete's `payload` does not match the content actually at `position`.
    #[error("delete payload does not match document content")]
    PreconditionFailed,
}

/// Apply `op` to `content`, returning the new content.
///
/// `insert`: `content[:position] + payload + content[position:]`.
/// `delete`: removes `payload` from `position` if it matches; otherwise
/// [`ApplyError::PreconditionFailed`].
pub fn apply(content: &str, op: &Operation) -> Result<String, ApplyError> {
    let chars: Vec<char> = content.chars().collect();
    let position = op.position as usize;

    match op.kind {
        OpKind::Insert => {
            if position > chars.len() {
                return Err(ApplyError::OutOfBounds);
            }
            let mut result = String::with_capacity(content.len() + op.payload.len());
            result.extend(chars[..position].iter());
            result.push_str(&op.payload);
            result.extend(chars[position..].iter());
            Ok(result)
        }
        OpKind::Delete => {
            let delete_len = op.payload.chars().count();
            let end = position
                .checked_add(delete_len)
                .ok_or(ApplyError::OutOfBounds)?;
            if end > chars.len() {
                return Err(ApplyError::OutOfBounds);
            }
            let actual: String = chars[position..end].iter().collect();
            if actual != op.payload {
                return Err(ApplyError::PreconditionFailed);
            }
            let mut result = String::with_capacity(content.len());
            result.extend(chars[..position].iter());
            result.extend(chars[end..].iter());
            Ok(result)
        }
    }
}

/// Transform `op_a` against `op_b`, both concurrent from `op_a`'s point of
/// view (`op_b` was already accepted at the version `op_a` was based on).
/// Returns an adjusted copy of `op_a` such that applying it after `op_b`
/// preserves the user's intent.
///
/// The only authoritative tie-break for equal positions is a lexicographic
/// comparison of `client_id`, applied symmetrically on both sides: the lower
/// `client_id` is "earlier" and keeps its position, the other shifts exactly
/// as it would if `op_b.position < op_a.position`. There is no short-circuit
/// case.
pub fn transform(op_a: &Operation, op_b: &Operation) -> Operation {
    let mut result = op_a.clone();

    let b_is_earlier = match op_b.position.cmp(&op_a.position) {
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Equal => op_b.client_id < op_a.client_id,
    };

    if !b_is_earlier {
        return result;
    }

    let b_len = op_b.payload_chars();
    result.position = match op_b.kind {
        OpKind::Insert => op_a.position + b_len,
        OpKind::Delete => op_b.position.max(op_a.position.saturating_sub(b_len)),
    };
    result
}

//! Editor-facing text changes.

use serde::{Deserialize, Serialize};

use crate::SyncError;

/// Replace the byte range `from..to` with `insert`.
///
/// Offsets are UTF-8 byte offsets into the text the change is applied to.
/// A batch of changes is non-overlapping, ascending and positioned against
/// the text as it was before any of them were applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionedChange {
    /// Start of the replaced range.
    pub from: usize,
    /// End of the replaced range (exclusive).
    pub to: usize,
    /// Text inserted at `from`.
    pub insert: String,
}

impl PositionedChange {
    /// A pure insertion at `at`.
    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        Self {
            from: at,
            to: at,
            insert: text.into(),
        }
    }

    /// A pure deletion of `from..to`.
    pub fn delete(from: usize, to: usize) -> Self {
        Self {
            from,
            to,
            insert: String::new(),
        }
    }

    /// Replace `from..to` with `text`.
    pub fn replace(from: usize, to: usize, text: impl Into<String>) -> Self {
        Self {
            from,
            to,
            insert: text.into(),
        }
    }

    /// Whether this change leaves the text untouched.
    pub fn is_noop(&self) -> bool {
        self.from == self.to && self.insert.is_empty()
    }

    /// Apply a batch of changes to `text`, returning the new text.
    pub fn apply_all(text: &str, changes: &[PositionedChange]) -> Result<String, SyncError> {
        Self::check_batch(text, changes)?;
        let mut out = String::with_capacity(text.len());
        let mut pos = 0;
        for change in changes {
            out.push_str(&text[pos..change.from]);
            out.push_str(&change.insert);
            pos = change.to;
        }
        out.push_str(&text[pos..]);
        Ok(out)
    }

    /// Validate that a batch is ordered, in bounds and on char boundaries.
    pub fn check_batch(text: &str, changes: &[PositionedChange]) -> Result<(), SyncError> {
        let mut last_end = 0;
        for change in changes {
            if change.from > change.to || change.to > text.len() {
                return Err(SyncError::ChangeOutOfBounds {
                    from: change.from,
                    to: change.to,
                    len: text.len(),
                });
            }
            if change.from < last_end {
                return Err(SyncError::UnorderedChanges);
            }
            for offset in [change.from, change.to] {
                if !text.is_char_boundary(offset) {
                    return Err(SyncError::NotCharBoundary(offset));
                }
            }
            last_end = change.to;
        }
        Ok(())
    }
}

//! Error types for trisync.

use thiserror::Error;

/// Errors that can occur while handling shared trisync types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// A content hash was not 64 lowercase hex characters.
    #[error("invalid content hash: {0}")]
    InvalidHash(String),

    /// A positioned change does not fit the text it was applied to.
    #[error("change {from}..{to} out of bounds for text of length {len}")]
    ChangeOutOfBounds {
        /// Start offset of the change.
        from: usize,
        /// End offset of the change.
        to: usize,
        /// Length of the text in bytes.
        len: usize,
    },

    /// A positioned change splits a UTF-8 code point.
    #[error("change offset {0} is not on a char boundary")]
    NotCharBoundary(usize),

    /// Changes overlap or are not in ascending order.
    #[error("changes overlap or are out of order")]
    UnorderedChanges,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SyncError::ChangeOutOfBounds {
            from: 4,
            to: 9,
            len: 5,
        };
        assert_eq!(err.to_string(), "change 4..9 out of bounds for text of length 5");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SyncError>();
    }
}

//! ID parse errors.

use thiserror::Error;

/// Why a string is not a valid ID.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("empty ID")]
    Empty,

    /// Prefix belongs to a different ID type.
    #[error("wrong ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// No `_` between prefix and ULID.
    #[error("ID has no '_' separator")]
    MissingSeparator,

    #[error("bad ULID in ID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}

//! Error types for the Tether engine.

use crate::ClassName;
use thiserror::Error;

/// All possible errors from the Tether engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Algebra errors
    #[error("cannot apply {op} to a {found} value")]
    TypeMismatch {
        op: &'static str,
        found: &'static str,
    },

    #[error("cannot merge {newer} with the previous {older}")]
    IncompatibleMerge {
        newer: &'static str,
        older: &'static str,
    },

    #[error("cannot modify a relation after deleting it")]
    CannotModifyDeletedRelation,

    #[error("related object must be a {expected}, but a {found} was passed in")]
    RelationTargetMismatch { expected: ClassName, found: ClassName },

    // Encoding errors
    #[error("cannot create a pointer to an unsaved {class_name}")]
    UnsavedPointer { class_name: ClassName },

    #[error("invalid encoded value: {0}")]
    InvalidEncoding(String),

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

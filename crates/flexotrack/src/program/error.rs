//! Lifecycle engine error types.

use thiserror::Error;

use crate::db::DatabaseError;
use crate::program::{ProgramId, ProgramStatus};

/// Errors from program lifecycle operations.
#[derive(Error, Debug)]
pub enum ProgramError {
    #[error("Program {0} not found")]
    NotFound(ProgramId),

    #[error("Work order '{0}' is already assigned to another program")]
    DuplicateWorkOrder(String),

    #[error("Cannot move program from {from} to {to}")]
    InvalidTransition {
        from: ProgramStatus,
        to: ProgramStatus,
    },

    #[error("Invalid program: {0}")]
    Validation(String),

    #[error("Program {id} changed concurrently (expected version {expected}, found {actual})")]
    VersionConflict {
        id: ProgramId,
        expected: i64,
        actual: i64,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

//! Error types for task intake and expansion.
//!
//! Subsystems with their own failure surfaces (client, store, pool,
//! config) define their error enums locally; the two here are shared
//! between the expander, the model, and the orchestrator.

use thiserror::Error;

/// Errors that abort task expansion and fail the parent task.
#[derive(Debug, Error)]
pub enum ExpandError {
    /// A variable tag's name matched no entry in the variables map.
    #[error("variable tag '{tag_id}' ({tag_name}) matches no variable")]
    UnmatchedVariable { tag_id: String, tag_name: String },

    /// The batch tag's value is not a positive integer.
    #[error("batch tag value '{0}' is not a positive integer")]
    InvalidBatch(String),
}

/// Errors raised when a task definition is rejected at intake.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("field '{0}' must not be empty")]
    EmptyField(&'static str),

    #[error("variable tag '{tag_id}' has no name to match a variable by")]
    UnnamedVariableTag { tag_id: String },

    #[error("variable key '{0}' is not one of v0..v5")]
    UnknownVariableSlot(String),

    #[error("variable '{variable}' declares {declared} values but lists {actual}")]
    ValuesCountMismatch {
        variable: String,
        declared: usize,
        actual: usize,
    },

    #[error("concurrency {0} is outside 1..=50")]
    ConcurrencyOutOfRange(u32),

    #[error("steps {0} is outside 1..=50")]
    StepsOutOfRange(u32),

    #[error("cfg {0} is outside 0.1..=10")]
    CfgOutOfRange(f64),
}

use thiserror::Error;

/// Structural errors raised while building or addressing a solver session,
/// and numerical failures of the linear-model helpers.
///
/// Solve-time outcomes (non-convergence, infeasibility, evaluation failures)
/// are never errors; they are reported through [`crate::SolveStatus`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("field name must not be empty")]
    EmptyFieldName,

    #[error("duplicate field `{name}`")]
    DuplicateField { name: String },

    #[error("field `{name}` must have a non-zero length and dimension, got {len} x {dim}")]
    EmptyField { name: String, len: usize, dim: usize },

    #[error("unknown field `{name}`")]
    UnknownField { name: String },

    #[error("time index {t} out of range for field `{name}` with {len} time points")]
    TimeIndexOutOfRange { name: String, t: usize, len: usize },

    #[error("component index {index} out of range for field `{name}` of dimension {dim}")]
    ComponentOutOfRange { name: String, index: usize, dim: usize },

    #[error("{what}: expected {expected} values, got {actual}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("{what} does not share the variable structure")]
    StructureMismatch { what: &'static str },

    #[error("invalid options: {reason}")]
    InvalidOptions { reason: &'static str },

    #[error("{what} is singular")]
    Singular { what: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;

//! Error types shared by every model in the crate.

use thiserror::Error;

/// Errors raised while constructing or evaluating a model.
///
/// Construction errors come out of `new`/`with_*` constructors, input-validation
/// errors out of `calc`/`calc_diff` and the Jacobian-multiplication primitives.
/// Disagreement between analytic and numerical derivatives is not an error; see
/// [`crate::derivatives`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    /// A vector operand has the wrong length.
    #[error("Invalid argument: {what} has wrong dimension (it should be {expected}, got {got})")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// A matrix operand has the wrong shape.
    #[error(
        "Invalid argument: {what} has wrong shape (it should be {expected_rows}x{expected_cols}, got {rows}x{cols})"
    )]
    ShapeMismatch {
        what: &'static str,
        expected_rows: usize,
        expected_cols: usize,
        rows: usize,
        cols: usize,
    },

    /// The smoothing constant of an activation is negative.
    #[error("Invalid argument: smoothing constant must be non-negative, got {0}")]
    NegativeSmoothing(f64),

    /// The finite-difference disturbance is negative, zero or not finite.
    #[error("Invalid argument: disturbance constant must be positive, got {0}")]
    InvalidDisturbance(f64),

    /// The kinematic model does not have the structure a model requires.
    #[error("Invalid argument: {0}")]
    InvalidTopology(String),

    /// Dimensions given at construction are inconsistent with each other.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An assignment-operator tag that is not one of setto, addto, rmfrom.
    #[error("Invalid argument: unknown assignment operator {0:?} (allowed operators: setto, addto, rmfrom)")]
    InvalidAssignmentOp(String),

    /// Normalized time outside of the unit interval.
    #[error("Invalid argument: t must be in [0, 1], got {0}")]
    TimeOutOfRange(f64),
}

/// Result type for model operations.
pub type ModelResult<T> = std::result::Result<T, ModelError>;

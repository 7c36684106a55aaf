//! The `shooting_core` crate provides the differentiable model layer of a
//! shooting-based trajectory optimizer.
//!
//! Key components:
//! - **State**: manifolds with local `integrate` / `difference` and their Jacobians
//!   (`StateVector`, `StateMultibody`).
//! - **Activation**: scalar shaping of residuals (quadratic, weighted, smooth-abs).
//! - **Actuation**: control-to-generalized-torque maps (full, floating base, multicopter).
//! - **Control**: control parametrizations and the in-place Jacobian products
//!   driven by `AssignmentOp`.
//! - **Action**: one step of dynamics plus stage cost (unicycle, LQR).
//! - **Residual / Constraint**: residual vectors and the equality or bounded
//!   inequality constraints built on them.
//! - **NumDiff**: finite-difference wrappers for every model family, and the
//!   `derivatives` helpers that compare them against analytic derivatives.
pub mod action;
pub mod activation;
pub mod actuation;
pub mod constraint;
pub mod control;
pub mod derivatives;
pub mod error;
pub mod math;
pub mod multibody;
pub mod numdiff;
pub mod residual;
pub mod state;

pub use action::{ActionData, ActionModel, ActionModelLQR, ActionModelUnicycle, LqrMatrices};
pub use activation::{
    ActivationData, ActivationModel, ActivationQuad, ActivationSmoothAbs, ActivationWeightedQuad,
};
pub use actuation::{
    ActuationData, ActuationFloatingBase, ActuationFull, ActuationModel, ActuationMultiCopterBase,
};
pub use constraint::{ConstraintData, ConstraintModelResidual, ConstraintType};
pub use control::{
    ControlParametrizationData, ControlParametrizationModel, ControlParametrizationPolyOne,
    ControlParametrizationPolyZero,
};
pub use error::{ModelError, ModelResult};
pub use math::AssignmentOp;
pub use multibody::{JointModel, KinematicModel};
pub use numdiff::{
    ActionModelNumDiff, ActuationNumDiff, ControlParametrizationNumDiff, NumDiffSettings,
    StateNumDiff,
};
pub use residual::{ResidualData, ResidualModel, ResidualModelControl, ResidualModelState};
pub use state::{Jcomponent, StateManifold, StateMultibody, StateVector};

//! Cross-validation of analytic derivatives against the finite-difference
//! engines.
//!
//! Mismatches are reported and logged, never raised: a model whose analytic
//! derivatives drift from the numerical ones is still usable.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use tracing::warn;

use crate::action::{ActionData, ActionModel};
use crate::control::{ControlParametrizationData, ControlParametrizationModel};
use crate::numdiff::{ActionModelNumDiff, ControlParametrizationNumDiff, NumDiffSettings};

/// Tolerance for comparing against forward differences taken with
/// `disturbance`.
pub fn tolerance_for(disturbance: f64, modifier: f64) -> f64 {
    modifier * disturbance
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockDeviation {
    pub name: &'static str,
    /// Largest absolute entry-wise difference.
    pub max_abs: f64,
    pub within_tolerance: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DerivativeReport {
    pub tolerance: f64,
    pub blocks: Vec<BlockDeviation>,
}

impl DerivativeReport {
    fn new(tolerance: f64) -> Self {
        Self {
            tolerance,
            blocks: Vec::new(),
        }
    }

    fn push(&mut self, name: &'static str, analytic: &DMatrix<f64>, numerical: &DMatrix<f64>) {
        self.record(name, (analytic - numerical).amax());
    }

    fn push_vector(&mut self, name: &'static str, analytic: &DVector<f64>, numerical: &DVector<f64>) {
        self.record(name, (analytic - numerical).amax());
    }

    fn record(&mut self, name: &'static str, max_abs: f64) {
        let within_tolerance = max_abs <= self.tolerance;
        if !within_tolerance {
            warn!(
                block = name,
                max_abs,
                tolerance = self.tolerance,
                "Analytic derivative deviates from finite differences."
            );
        }
        self.blocks.push(BlockDeviation {
            name,
            max_abs,
            within_tolerance,
        });
    }

    pub fn is_consistent(&self) -> bool {
        self.blocks.iter().all(|b| b.within_tolerance)
    }

    /// Block with the largest deviation.
    pub fn worst(&self) -> Option<&BlockDeviation> {
        self.blocks
            .iter()
            .max_by(|a, b| a.max_abs.total_cmp(&b.max_abs))
    }
}

fn validate_tolerance(tolerance: f64) -> Result<()> {
    if !(tolerance.is_finite() && tolerance > 0.0) {
        bail!("tolerance must be positive.");
    }
    Ok(())
}

/// Compares `Fx`, `Fu`, `Lx`, `Lu` and, when `settings.gauss_approx` is on
/// and the model has a residual, the Gauss–Newton Hessians.
pub fn compare_action_derivatives<M: ActionModel>(
    model: Arc<M>,
    x: &DVector<f64>,
    u: &DVector<f64>,
    settings: NumDiffSettings,
    tolerance: f64,
) -> Result<DerivativeReport> {
    validate_tolerance(tolerance)?;
    let numdiff = ActionModelNumDiff::with_settings(model.clone(), settings)
        .context("Invalid finite-difference settings.")?;

    let mut data = model.create_data();
    model
        .calc(&mut data, x, u)
        .context("Failed to evaluate the action model.")?;
    model
        .calc_diff(&mut data, x, u)
        .context("Failed to evaluate analytic action derivatives.")?;
    let mut data_nd = numdiff.create_data();
    numdiff
        .calc_diff(&mut data_nd, x, u)
        .context("Failed to evaluate numerical action derivatives.")?;

    let (a, n): (&ActionData, &ActionData) = (data.as_ref(), data_nd.as_ref());
    let mut report = DerivativeReport::new(tolerance);
    report.push("Fx", &a.fx, &n.fx);
    report.push("Fu", &a.fu, &n.fu);
    report.push_vector("Lx", &a.lx, &n.lx);
    report.push_vector("Lu", &a.lu, &n.lu);
    if numdiff.computes_hessians() {
        report.push("Lxx", &a.lxx, &n.lxx);
        report.push("Lxu", &a.lxu, &n.lxu);
        report.push("Luu", &a.luu, &n.luu);
    }
    Ok(report)
}

/// Compares `dw_du` at normalized time `t`.
pub fn compare_control_derivatives<M: ControlParametrizationModel>(
    model: Arc<M>,
    t: f64,
    u: &DVector<f64>,
    settings: NumDiffSettings,
    tolerance: f64,
) -> Result<DerivativeReport> {
    validate_tolerance(tolerance)?;
    let numdiff = ControlParametrizationNumDiff::with_settings(model.clone(), settings)
        .context("Invalid finite-difference settings.")?;

    let mut data = model.create_data();
    model
        .calc_diff(&mut data, t, u)
        .context("Failed to evaluate analytic control Jacobian.")?;
    let mut data_nd = numdiff.create_data();
    numdiff
        .calc_diff(&mut data_nd, t, u)
        .context("Failed to evaluate numerical control Jacobian.")?;

    let (a, n): (&ControlParametrizationData, &ControlParametrizationData) =
        (data.as_ref(), data_nd.as_ref());
    let mut report = DerivativeReport::new(tolerance);
    report.push("dw_du", &a.dw_du, &n.dw_du);
    Ok(report)
}

//! Constraints built from residuals: `lb ≤ r(x, u) ≤ ub` or `r(x, u) = 0`.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ModelError, ModelResult};
use crate::math::check_len;
use crate::residual::{ResidualData, ResidualModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintType {
    Inequality,
    Equality,
}

/// Inequality (`g`) and equality (`h`) values and Jacobians. Only the block
/// matching the constraint type is sized; the other one is empty.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintData<D> {
    pub g: DVector<f64>,
    pub gx: DMatrix<f64>,
    pub gu: DMatrix<f64>,
    pub h: DVector<f64>,
    pub hx: DMatrix<f64>,
    pub hu: DMatrix<f64>,
    pub residual: D,
}

#[derive(Debug, Clone)]
pub struct ConstraintModelResidual<R> {
    residual: Arc<R>,
    kind: ConstraintType,
    lb: DVector<f64>,
    ub: DVector<f64>,
}

fn check_bounds(lb: &DVector<f64>, ub: &DVector<f64>) -> ModelResult<()> {
    for (i, (&lo, &hi)) in lb.iter().zip(ub.iter()).enumerate() {
        if lo.is_nan() || hi.is_nan() {
            return Err(ModelError::InvalidConfiguration(format!(
                "bounds cannot be NaN (entry {i})"
            )));
        }
        if lo == f64::INFINITY || lo == f64::MAX {
            return Err(ModelError::InvalidConfiguration(format!(
                "the lower bound cannot contain a positive infinity/max value (entry {i})"
            )));
        }
        if hi == f64::NEG_INFINITY || hi == f64::MIN {
            return Err(ModelError::InvalidConfiguration(format!(
                "the upper bound cannot contain a negative infinity/min value (entry {i})"
            )));
        }
        if lo.is_finite() && hi.is_finite() && lo > hi {
            return Err(ModelError::InvalidConfiguration(format!(
                "the upper bound is not equal to / higher than the lower bound (entry {i}: {lo} > {hi})"
            )));
        }
    }
    Ok(())
}

impl<R: ResidualModel> ConstraintModelResidual<R> {
    /// `lb ≤ r ≤ ub`. Infinite entries leave that side unbounded.
    pub fn inequality(residual: Arc<R>, lb: DVector<f64>, ub: DVector<f64>) -> ModelResult<Self> {
        let nr = residual.nr();
        check_len("lb", &lb, nr)?;
        check_len("ub", &ub, nr)?;
        check_bounds(&lb, &ub)?;
        debug!(ng = nr, "inequality constraint from residual");
        Ok(Self {
            residual,
            kind: ConstraintType::Inequality,
            lb,
            ub,
        })
    }

    /// `r = 0`
    pub fn equality(residual: Arc<R>) -> Self {
        debug!(nh = residual.nr(), "equality constraint from residual");
        Self {
            residual,
            kind: ConstraintType::Equality,
            lb: DVector::zeros(0),
            ub: DVector::zeros(0),
        }
    }

    pub fn residual(&self) -> &Arc<R> {
        &self.residual
    }

    pub fn constraint_type(&self) -> ConstraintType {
        self.kind
    }

    /// Number of inequality constraints.
    pub fn ng(&self) -> usize {
        match self.kind {
            ConstraintType::Inequality => self.residual.nr(),
            ConstraintType::Equality => 0,
        }
    }

    /// Number of equality constraints.
    pub fn nh(&self) -> usize {
        match self.kind {
            ConstraintType::Inequality => 0,
            ConstraintType::Equality => self.residual.nr(),
        }
    }

    pub fn nu(&self) -> usize {
        self.residual.nu()
    }

    pub fn lb(&self) -> &DVector<f64> {
        &self.lb
    }

    pub fn ub(&self) -> &DVector<f64> {
        &self.ub
    }

    /// Writes `g` or `h` from the residual at `(x, u)`.
    pub fn calc(
        &self,
        data: &mut ConstraintData<R::Data>,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> ModelResult<()> {
        self.residual.calc(&mut data.residual, x, u)?;
        let r = &data.residual.as_ref().r;
        match self.kind {
            ConstraintType::Inequality => data.g.copy_from(r),
            ConstraintType::Equality => data.h.copy_from(r),
        }
        Ok(())
    }

    /// Writes the value and the Jacobians of `g` or `h` at `(x, u)`.
    pub fn calc_diff(
        &self,
        data: &mut ConstraintData<R::Data>,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> ModelResult<()> {
        self.calc(data, x, u)?;
        self.residual.calc_diff(&mut data.residual, x, u)?;
        let ResidualData { rx, ru, .. } = data.residual.as_ref();
        match self.kind {
            ConstraintType::Inequality => {
                data.gx.copy_from(rx);
                data.gu.copy_from(ru);
            }
            ConstraintType::Equality => {
                data.hx.copy_from(rx);
                data.hu.copy_from(ru);
            }
        }
        Ok(())
    }

    pub fn create_data(&self) -> ConstraintData<R::Data> {
        let (ng, nh) = (self.ng(), self.nh());
        let (ndx, nu) = (self.residual.state().ndx(), self.nu());
        ConstraintData {
            g: DVector::zeros(ng),
            gx: DMatrix::zeros(ng, ndx),
            gu: DMatrix::zeros(ng, nu),
            h: DVector::zeros(nh),
            hx: DMatrix::zeros(nh, ndx),
            hu: DMatrix::zeros(nh, nu),
            residual: self.residual.create_data(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::residual::{ResidualModelControl, ResidualModelState};
    use crate::state::{StateManifold, StateVector};

    fn control_residual() -> Arc<ResidualModelControl> {
        let state: Arc<dyn StateManifold> = Arc::new(StateVector::new(2).expect("state"));
        Arc::new(ResidualModelControl::new(state, DVector::from_vec(vec![0.0, 1.0, 2.0])))
    }

    type ControlConstraint = ConstraintModelResidual<ResidualModelControl>;

    fn bounds(lb: [f64; 3], ub: [f64; 3]) -> ModelResult<ControlConstraint> {
        ConstraintModelResidual::inequality(
            control_residual(),
            DVector::from_row_slice(&lb),
            DVector::from_row_slice(&ub),
        )
    }

    fn configuration_message(result: ModelResult<ControlConstraint>) -> String {
        match result.err() {
            Some(ModelError::InvalidConfiguration(message)) => message,
            other => panic!("expected InvalidConfiguration, got {other:?}"),
        }
    }

    #[test]
    fn inequality_accepts_one_sided_and_equal_bounds() {
        let inf = f64::INFINITY;
        let model = bounds([-inf, 0.0, 1.0], [0.0, inf, 1.0]).expect("valid bounds");
        assert_eq!(model.constraint_type(), ConstraintType::Inequality);
        assert_eq!((model.ng(), model.nh()), (3, 0));
        assert_eq!(model.lb()[1], 0.0);
    }

    #[test]
    fn lower_bound_above_upper_bound_is_rejected() {
        let message = configuration_message(bounds([0.0, 2.0, 0.0], [1.0, 1.0, 1.0]));
        assert!(message.contains("not equal to / higher than"), "{message}");
        assert!(message.contains("entry 1"), "{message}");
    }

    #[test]
    fn positive_infinite_lower_bound_is_rejected() {
        for bad in [f64::INFINITY, f64::MAX] {
            let message =
                configuration_message(bounds([0.0, 0.0, bad], [1.0, 1.0, f64::INFINITY]));
            assert!(message.contains("lower bound cannot contain"), "{message}");
        }
    }

    #[test]
    fn negative_infinite_upper_bound_is_rejected() {
        for bad in [f64::NEG_INFINITY, f64::MIN] {
            let message =
                configuration_message(bounds([f64::NEG_INFINITY, 0.0, 0.0], [bad, 1.0, 1.0]));
            assert!(message.contains("upper bound cannot contain"), "{message}");
        }
    }

    #[test]
    fn nan_bound_is_rejected() {
        let message = configuration_message(bounds([0.0, f64::NAN, 0.0], [1.0, 1.0, 1.0]));
        assert!(message.contains("NaN"), "{message}");
    }

    #[test]
    fn bounds_of_wrong_length_are_rejected() {
        let err = ConstraintModelResidual::inequality(
            control_residual(),
            DVector::zeros(2),
            DVector::zeros(3),
        )
        .err()
        .expect("short lb");
        assert!(matches!(err, ModelError::DimensionMismatch { what: "lb", .. }));
    }

    #[test]
    fn inequality_copies_residual_into_g() {
        let model = bounds([-1.0; 3], [1.0; 3]).expect("model");
        let mut data = model.create_data();
        let x = DVector::zeros(2);
        let u = DVector::from_vec(vec![0.5, 0.5, 0.5]);
        model.calc_diff(&mut data, &x, &u).expect("calc_diff");
        assert_eq!(data.g.as_slice(), &[0.5, -0.5, -1.5]);
        assert_eq!(data.gu, DMatrix::<f64>::identity(3, 3));
        assert!(data.gx.iter().all(|v| *v == 0.0));
        assert_eq!(data.h.len(), 0);
        assert_eq!(data.hx.shape(), (0, 2));
    }

    #[test]
    fn equality_copies_residual_into_h() {
        let state: Arc<dyn StateManifold> = Arc::new(StateVector::new(2).expect("state"));
        let residual = Arc::new(
            ResidualModelState::new(state, DVector::from_vec(vec![1.0, -1.0]), 1)
                .expect("residual"),
        );
        let model = ConstraintModelResidual::equality(residual);
        assert_eq!((model.ng(), model.nh()), (0, 2));
        assert!(model.lb().is_empty());

        let mut data = model.create_data();
        let x = DVector::from_vec(vec![2.0, 0.0]);
        let u = DVector::zeros(1);
        model.calc(&mut data, &x, &u).expect("calc");
        assert_eq!(data.h.as_slice(), &[1.0, 1.0]);

        let x = DVector::from_vec(vec![0.0, 0.0]);
        model.calc_diff(&mut data, &x, &u).expect("calc_diff");
        assert_eq!(data.h.as_slice(), &[-1.0, 1.0]);
        assert_eq!(data.hx, DMatrix::<f64>::identity(2, 2));
        assert_eq!(data.hu.shape(), (2, 1));
        assert_eq!(data.g.len(), 0);
    }

    #[test]
    fn calc_validates_inputs() {
        let model = bounds([-1.0; 3], [1.0; 3]).expect("model");
        let mut data = model.create_data();
        let err = model
            .calc(&mut data, &DVector::zeros(3), &DVector::zeros(3))
            .expect_err("wrong x");
        assert!(matches!(err, ModelError::DimensionMismatch { what: "x", .. }));
    }
}

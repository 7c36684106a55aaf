//! Action models: one step of discrete dynamics together with its stage cost.
//!
//! `calc` writes the next state, the cost and (when present) the residual;
//! `calc_diff` writes the first- and second-order derivatives at its own
//! `(x, u)`, recomputing whatever intermediate terms it needs.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::activation::{ActivationData, ActivationModel, ActivationQuad};
use crate::error::{ModelError, ModelResult};
use crate::math::{check_len, check_shape};
use crate::state::{StateManifold, StateVector};

#[derive(Debug, Clone, PartialEq)]
pub struct ActionData {
    /// Next state (`nx`).
    pub xnext: DVector<f64>,
    pub cost: f64,
    /// Residual (`nr`).
    pub r: DVector<f64>,
    /// `ndx × ndx`
    pub fx: DMatrix<f64>,
    /// `ndx × nu`
    pub fu: DMatrix<f64>,
    pub lx: DVector<f64>,
    pub lu: DVector<f64>,
    pub lxx: DMatrix<f64>,
    pub lxu: DMatrix<f64>,
    pub luu: DMatrix<f64>,
}

impl ActionData {
    pub fn new(nx: usize, ndx: usize, nu: usize, nr: usize) -> Self {
        Self {
            xnext: DVector::zeros(nx),
            cost: 0.0,
            r: DVector::zeros(nr),
            fx: DMatrix::zeros(ndx, ndx),
            fu: DMatrix::zeros(ndx, nu),
            lx: DVector::zeros(ndx),
            lu: DVector::zeros(nu),
            lxx: DMatrix::zeros(ndx, ndx),
            lxu: DMatrix::zeros(ndx, nu),
            luu: DMatrix::zeros(nu, nu),
        }
    }
}

impl AsRef<ActionData> for ActionData {
    fn as_ref(&self) -> &ActionData {
        self
    }
}

impl AsMut<ActionData> for ActionData {
    fn as_mut(&mut self) -> &mut ActionData {
        self
    }
}

pub trait ActionModel: Send + Sync {
    type Data: AsRef<ActionData> + AsMut<ActionData>;

    fn state(&self) -> &Arc<dyn StateManifold>;

    /// Control dimension.
    fn nu(&self) -> usize;

    /// Residual dimension; zero when the cost is not written as `a(r(x, u))`.
    fn nr(&self) -> usize;

    fn calc(&self, data: &mut Self::Data, x: &DVector<f64>, u: &DVector<f64>) -> ModelResult<()>;

    /// Writes the derivatives at `(x, u)`; does not rely on an earlier `calc`.
    fn calc_diff(&self, data: &mut Self::Data, x: &DVector<f64>, u: &DVector<f64>)
        -> ModelResult<()>;

    fn create_data(&self) -> Self::Data;

    fn check_inputs(&self, x: &DVector<f64>, u: &DVector<f64>) -> ModelResult<()> {
        check_len("x", x, self.state().nx())?;
        check_len("u", u, self.nu())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionDataUnicycle {
    pub base: ActionData,
    pub activation: ActivationData,
}

impl AsRef<ActionData> for ActionDataUnicycle {
    fn as_ref(&self) -> &ActionData {
        &self.base
    }
}

impl AsMut<ActionData> for ActionDataUnicycle {
    fn as_mut(&mut self) -> &mut ActionData {
        &mut self.base
    }
}

/// Planar unicycle `x = [px, py, θ]`, `u = [v, ω]`, integrated with explicit
/// Euler over `dt`.
///
/// The stage cost is `a(r)` with `r = [w₀·x; w₁·u]`.
pub struct ActionModelUnicycle {
    state: Arc<dyn StateManifold>,
    activation: Box<dyn ActivationModel>,
    dt: f64,
    cost_weights: [f64; 2],
}

impl ActionModelUnicycle {
    pub const NR: usize = 5;
    pub const DEFAULT_DT: f64 = 0.1;
    pub const DEFAULT_COST_WEIGHTS: [f64; 2] = [10.0, 1.0];

    pub fn new() -> ModelResult<Self> {
        Self::with_activation(Box::new(ActivationQuad::new(Self::NR)))
    }

    pub fn with_activation(activation: Box<dyn ActivationModel>) -> ModelResult<Self> {
        if activation.nr() != Self::NR {
            return Err(ModelError::DimensionMismatch {
                what: "activation",
                expected: Self::NR,
                got: activation.nr(),
            });
        }
        Ok(Self {
            state: Arc::new(StateVector::new(3)?),
            activation,
            dt: Self::DEFAULT_DT,
            cost_weights: Self::DEFAULT_COST_WEIGHTS,
        })
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn set_dt(&mut self, dt: f64) -> ModelResult<()> {
        if !(dt.is_finite() && dt > 0.0) {
            return Err(ModelError::InvalidConfiguration(format!(
                "dt must be positive, got {dt}"
            )));
        }
        self.dt = dt;
        Ok(())
    }

    pub fn cost_weights(&self) -> [f64; 2] {
        self.cost_weights
    }

    pub fn set_cost_weights(&mut self, weights: [f64; 2]) {
        self.cost_weights = weights;
    }

    /// `r = [w₀·x; w₁·u]`
    fn write_residual(&self, r: &mut DVector<f64>, x: &DVector<f64>, u: &DVector<f64>) {
        let [wx, wu] = self.cost_weights;
        for i in 0..3 {
            r[i] = wx * x[i];
        }
        for i in 0..2 {
            r[3 + i] = wu * u[i];
        }
    }
}

impl ActionModel for ActionModelUnicycle {
    type Data = ActionDataUnicycle;

    fn state(&self) -> &Arc<dyn StateManifold> {
        &self.state
    }

    fn nu(&self) -> usize {
        2
    }

    fn nr(&self) -> usize {
        Self::NR
    }

    fn calc(
        &self,
        data: &mut ActionDataUnicycle,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> ModelResult<()> {
        self.check_inputs(x, u)?;
        let (s, c) = x[2].sin_cos();
        let base = &mut data.base;
        base.xnext[0] = x[0] + c * u[0] * self.dt;
        base.xnext[1] = x[1] + s * u[0] * self.dt;
        base.xnext[2] = x[2] + u[1] * self.dt;

        self.write_residual(&mut base.r, x, u);
        self.activation.calc(&mut data.activation, &base.r)?;
        base.cost = data.activation.value;
        Ok(())
    }

    fn calc_diff(
        &self,
        data: &mut ActionDataUnicycle,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> ModelResult<()> {
        self.check_inputs(x, u)?;
        self.write_residual(&mut data.base.r, x, u);
        self.activation.calc_diff(&mut data.activation, &data.base.r)?;

        let [wx, wu] = self.cost_weights;
        let ar = &data.activation.ar;
        let arr = &data.activation.arr;
        let base = &mut data.base;
        base.lx.copy_from(&(ar.rows(0, 3) * wx));
        base.lu.copy_from(&(ar.rows(3, 2) * wu));
        base.lxx.copy_from(&(arr.view((0, 0), (3, 3)) * (wx * wx)));
        base.lxu.copy_from(&(arr.view((0, 3), (3, 2)) * (wx * wu)));
        base.luu.copy_from(&(arr.view((3, 3), (2, 2)) * (wu * wu)));

        let (s, c) = x[2].sin_cos();
        base.fx[(0, 2)] = -s * u[0] * self.dt;
        base.fx[(1, 2)] = c * u[0] * self.dt;
        base.fu[(0, 0)] = c * self.dt;
        base.fu[(1, 0)] = s * self.dt;
        base.fu[(2, 1)] = self.dt;
        Ok(())
    }

    fn create_data(&self) -> ActionDataUnicycle {
        let mut base = ActionData::new(3, 3, 2, Self::NR);
        base.fx.fill_with_identity();
        ActionDataUnicycle {
            base,
            activation: self.activation.create_data(),
        }
    }
}

/// Dense coefficients of a linear-quadratic action model.
#[derive(Debug, Clone, PartialEq)]
pub struct LqrMatrices {
    pub fx: DMatrix<f64>,
    pub fu: DMatrix<f64>,
    pub f0: DVector<f64>,
    pub lxx: DMatrix<f64>,
    pub lxu: DMatrix<f64>,
    pub luu: DMatrix<f64>,
    pub lx: DVector<f64>,
    pub lu: DVector<f64>,
}

/// Linear dynamics `x' = Fx x + Fu u + f0` with quadratic cost
/// `½xᵗLxx x + ½uᵗLuu u + xᵗLxu u + lxᵗx + luᵗu`.
pub struct ActionModelLQR {
    state: Arc<dyn StateManifold>,
    nu: usize,
    coefficients: LqrMatrices,
}

impl ActionModelLQR {
    /// Identity dynamics and cost Hessians, unit linear cost terms, and unit
    /// drift unless `drift_free`.
    pub fn new(nx: usize, nu: usize, drift_free: bool) -> ModelResult<Self> {
        let f0 = if drift_free {
            DVector::zeros(nx)
        } else {
            DVector::from_element(nx, 1.0)
        };
        Self::from_matrices(LqrMatrices {
            fx: DMatrix::identity(nx, nx),
            fu: DMatrix::identity(nx, nu),
            f0,
            lxx: DMatrix::identity(nx, nx),
            lxu: DMatrix::zeros(nx, nu),
            luu: DMatrix::identity(nu, nu),
            lx: DVector::from_element(nx, 1.0),
            lu: DVector::from_element(nu, 1.0),
        })
    }

    pub fn from_matrices(coefficients: LqrMatrices) -> ModelResult<Self> {
        let nx = coefficients.fx.nrows();
        let nu = coefficients.fu.ncols();
        check_shape("Fx", &coefficients.fx, nx, nx)?;
        check_shape("Fu", &coefficients.fu, nx, nu)?;
        check_len("f0", &coefficients.f0, nx)?;
        check_shape("Lxx", &coefficients.lxx, nx, nx)?;
        check_shape("Lxu", &coefficients.lxu, nx, nu)?;
        check_shape("Luu", &coefficients.luu, nu, nu)?;
        check_len("lx", &coefficients.lx, nx)?;
        check_len("lu", &coefficients.lu, nu)?;
        debug!(nx, nu, "LQR action model");
        Ok(Self {
            state: Arc::new(StateVector::new(nx)?),
            nu,
            coefficients,
        })
    }

    pub fn coefficients(&self) -> &LqrMatrices {
        &self.coefficients
    }

    pub fn is_drift_free(&self) -> bool {
        self.coefficients.f0.iter().all(|v| *v == 0.0)
    }
}

impl ActionModel for ActionModelLQR {
    type Data = ActionData;

    fn state(&self) -> &Arc<dyn StateManifold> {
        &self.state
    }

    fn nu(&self) -> usize {
        self.nu
    }

    fn nr(&self) -> usize {
        0
    }

    fn calc(&self, data: &mut ActionData, x: &DVector<f64>, u: &DVector<f64>) -> ModelResult<()> {
        self.check_inputs(x, u)?;
        let m = &self.coefficients;
        data.xnext.copy_from(&m.f0);
        data.xnext.gemv(1.0, &m.fx, x, 1.0);
        data.xnext.gemv(1.0, &m.fu, u, 1.0);
        data.cost = 0.5 * x.dot(&(&m.lxx * x))
            + 0.5 * u.dot(&(&m.luu * u))
            + x.dot(&(&m.lxu * u))
            + m.lx.dot(x)
            + m.lu.dot(u);
        Ok(())
    }

    fn calc_diff(
        &self,
        data: &mut ActionData,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> ModelResult<()> {
        self.check_inputs(x, u)?;
        let m = &self.coefficients;
        data.fx.copy_from(&m.fx);
        data.fu.copy_from(&m.fu);

        data.lx.copy_from(&m.lx);
        data.lx.gemv(1.0, &m.lxx, x, 1.0);
        data.lx.gemv(1.0, &m.lxu, u, 1.0);
        data.lu.copy_from(&m.lu);
        data.lu.gemv(1.0, &m.luu, u, 1.0);
        data.lu.gemv_tr(1.0, &m.lxu, x, 1.0);

        data.lxx.copy_from(&m.lxx);
        data.lxu.copy_from(&m.lxu);
        data.luu.copy_from(&m.luu);
        Ok(())
    }

    fn create_data(&self) -> ActionData {
        let nx = self.state.nx();
        ActionData::new(nx, self.state.ndx(), self.nu, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ActivationSmoothAbs;
    use approx::assert_relative_eq;

    #[test]
    fn unicycle_moves_along_heading() {
        let model = ActionModelUnicycle::new().expect("model");
        let mut data = model.create_data();
        let x = DVector::from_vec(vec![0.0, 0.0, std::f64::consts::FRAC_PI_2]);
        let u = DVector::from_vec(vec![1.0, 0.5]);
        model.calc(&mut data, &x, &u).expect("calc");
        assert_relative_eq!(data.base.xnext[0], 0.0, epsilon = 1e-15);
        assert_relative_eq!(data.base.xnext[1], 0.1, epsilon = 1e-15);
        assert_relative_eq!(data.base.xnext[2], x[2] + 0.05, epsilon = 1e-15);
    }

    #[test]
    fn unicycle_quadratic_cost_derivatives() {
        let model = ActionModelUnicycle::new().expect("model");
        let mut data = model.create_data();
        let x = DVector::from_vec(vec![0.3, -0.2, 0.4]);
        let u = DVector::from_vec(vec![0.5, -0.1]);
        model.calc(&mut data, &x, &u).expect("calc");
        model.calc_diff(&mut data, &x, &u).expect("calc_diff");

        let expected_cost = 0.5 * (100.0 * x.norm_squared() + u.norm_squared());
        assert_relative_eq!(data.base.cost, expected_cost, epsilon = 1e-12);
        assert_relative_eq!(data.base.lx, &x * 100.0, epsilon = 1e-12);
        assert_relative_eq!(data.base.lu, u.clone(), epsilon = 1e-12);
        assert_relative_eq!(
            data.base.lxx,
            DMatrix::<f64>::identity(3, 3) * 100.0,
            epsilon = 1e-12
        );
        assert_eq!(data.base.lxu, DMatrix::<f64>::zeros(3, 2));
        assert_eq!(data.base.fx[(2, 2)], 1.0);
        assert_relative_eq!(data.base.fu[(2, 1)], 0.1);
    }

    #[test]
    fn unicycle_calc_diff_on_fresh_data() {
        let model = ActionModelUnicycle::new().expect("model");
        let mut data = model.create_data();
        let x = DVector::from_vec(vec![0.3, -0.2, 0.4]);
        let u = DVector::from_vec(vec![0.5, -0.1]);
        model.calc_diff(&mut data, &x, &u).expect("calc_diff");
        assert_relative_eq!(data.base.lx, &x * 100.0, epsilon = 1e-12);
        assert_relative_eq!(data.base.lu, u.clone(), epsilon = 1e-12);
    }

    #[test]
    fn unicycle_calc_diff_ignores_previous_calc_point() {
        let model = ActionModelUnicycle::new().expect("model");
        let mut data = model.create_data();
        let x = DVector::from_vec(vec![0.3, -0.2, 0.4]);
        let u = DVector::from_vec(vec![0.5, -0.1]);
        model
            .calc(&mut data, &DVector::from_element(3, 1.0), &DVector::from_element(2, 1.0))
            .expect("calc");
        model.calc_diff(&mut data, &x, &u).expect("calc_diff");
        assert_relative_eq!(data.base.lx, &x * 100.0, epsilon = 1e-12);
        assert_relative_eq!(data.base.lu, u.clone(), epsilon = 1e-12);
        assert_relative_eq!(data.base.r.rows(0, 3).clone_owned(), &x * 10.0, epsilon = 1e-12);
    }

    #[test]
    fn unicycle_accepts_other_activations() {
        let model =
            ActionModelUnicycle::with_activation(Box::new(ActivationSmoothAbs::new(5))).expect("model");
        let mut data = model.create_data();
        let x = DVector::zeros(3);
        let u = DVector::zeros(2);
        model.calc(&mut data, &x, &u).expect("calc");
        assert_eq!(data.base.cost, 5.0);

        let err = ActionModelUnicycle::with_activation(Box::new(ActivationQuad::new(3)))
            .err()
            .expect("dimension error");
        assert!(format!("{err}").contains("activation has wrong dimension"));
    }

    #[test]
    fn unicycle_rejects_bad_dt() {
        let mut model = ActionModelUnicycle::new().expect("model");
        assert!(model.set_dt(0.0).is_err());
        assert!(model.set_dt(f64::NAN).is_err());
        model.set_dt(0.05).expect("dt");
        assert_eq!(model.dt(), 0.05);
    }

    #[test]
    fn lqr_canonical_instance() {
        let model = ActionModelLQR::new(3, 2, false).expect("model");
        assert!(!model.is_drift_free());
        let mut data = model.create_data();
        let x = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let u = DVector::from_vec(vec![-1.0, 0.5]);
        model.calc(&mut data, &x, &u).expect("calc");
        assert_eq!(data.xnext.as_slice(), &[1.0, 3.5, 4.0]);
        let expected_cost = 0.5 * 14.0 + 0.5 * 1.25 + 6.0 - 0.5;
        assert_relative_eq!(data.cost, expected_cost, epsilon = 1e-14);

        model.calc_diff(&mut data, &x, &u).expect("calc_diff");
        assert_eq!(data.lx.as_slice(), &[2.0, 3.0, 4.0]);
        assert_eq!(data.lu.as_slice(), &[0.0, 1.5]);
        assert_eq!(data.fx, DMatrix::<f64>::identity(3, 3));
    }

    #[test]
    fn lqr_drift_free_has_no_offset() {
        let model = ActionModelLQR::new(2, 2, true).expect("model");
        assert!(model.is_drift_free());
        let mut data = model.create_data();
        let x = DVector::from_vec(vec![1.0, -1.0]);
        model.calc(&mut data, &x, &DVector::zeros(2)).expect("calc");
        assert_eq!(data.xnext, x);
    }

    #[test]
    fn lqr_rejects_inconsistent_matrices() {
        let model = ActionModelLQR::new(3, 2, true).expect("model");
        let mut coefficients = model.coefficients().clone();
        coefficients.luu = DMatrix::identity(3, 3);
        let err = ActionModelLQR::from_matrices(coefficients)
            .err()
            .expect("shape error");
        assert!(format!("{err}").contains("Luu has wrong shape"));
    }

    #[test]
    fn inputs_are_validated() {
        let model = ActionModelLQR::new(3, 2, true).expect("model");
        let mut data = model.create_data();
        let err = model
            .calc(&mut data, &DVector::zeros(2), &DVector::zeros(2))
            .expect_err("length error");
        assert!(format!("{err}").contains("x has wrong dimension"));
    }
}

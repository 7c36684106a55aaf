//! Forward-difference derivative engines.
//!
//! Each engine wraps an analytic model of the same family, forwards every
//! evaluation to it and replaces `calc_diff` with a finite-difference
//! approximation. They exist to cross-check hand-written derivatives and to
//! prototype models before their derivatives are written.
//!
//! For an operand `v` the step is `h = disturbance · max(1, ‖v‖)`, one
//! coordinate is perturbed at a time and the perturbation is undone before the
//! next column. All perturbed evaluations share one scratch data object,
//! except in [`StateNumDiff`]: state methods take `&self`, so it keeps a few
//! per-call tangent vectors and writes every Jacobian column straight into
//! the caller's matrix.

use std::sync::Arc;

use nalgebra::{DMatrix, DMatrixView, DMatrixViewMut, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::action::{ActionData, ActionModel};
use crate::actuation::{ActuationData, ActuationModel};
use crate::control::{ControlParametrizationData, ControlParametrizationModel};
use crate::error::{ModelError, ModelResult};
use crate::math::{check_shape, AssignmentOp};
use crate::state::{Jcomponent, StateManifold, StateMultibody};

/// `sqrt(2 · f64::EPSILON)`
pub fn default_disturbance() -> f64 {
    (2.0 * f64::EPSILON).sqrt()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NumDiffSettings {
    pub disturbance: f64,
    /// Fill `Lxx`, `Lxu`, `Luu` of [`ActionModelNumDiff`] with Gauss–Newton
    /// products of the residual Jacobians. Off: they stay zero.
    pub gauss_approx: bool,
}

impl Default for NumDiffSettings {
    fn default() -> Self {
        Self {
            disturbance: default_disturbance(),
            gauss_approx: false,
        }
    }
}

impl NumDiffSettings {
    pub fn validate(&self) -> ModelResult<()> {
        if !(self.disturbance.is_finite() && self.disturbance > 0.0) {
            return Err(ModelError::InvalidDisturbance(self.disturbance));
        }
        Ok(())
    }
}

/// Finite-difference step for `operand`; never smaller than `disturbance`.
pub fn perturbation_step(disturbance: f64, operand: &DVector<f64>) -> f64 {
    disturbance * operand.norm().max(1.0)
}

/// `target[:, i] = (perturbed − baseline) / h`
fn difference_column(
    target: &mut DMatrix<f64>,
    i: usize,
    perturbed: &DVector<f64>,
    baseline: &DVector<f64>,
    h: f64,
) {
    for (out, (p, b)) in target
        .column_mut(i)
        .iter_mut()
        .zip(perturbed.iter().zip(baseline.iter()))
    {
        *out = (p - b) / h;
    }
}

/// `target[:, i] = tangent / h`
fn scaled_column(target: &mut DMatrix<f64>, i: usize, tangent: &DVector<f64>, h: f64) {
    let mut column = target.column_mut(i);
    column.copy_from(tangent);
    column /= h;
}

// --- control parametrization ---

#[derive(Debug, Clone, PartialEq)]
pub struct ControlParametrizationDataNumDiff<D> {
    pub base: ControlParametrizationData,
    /// Wrapped model's data at the unperturbed point.
    pub data_0: D,
    /// Scratch data for perturbed evaluations.
    pub data_u: D,
    /// Perturbed parameters.
    pub up: DVector<f64>,
    /// Step used by the last `calc_diff`.
    pub step: f64,
}

impl<D> AsRef<ControlParametrizationData> for ControlParametrizationDataNumDiff<D> {
    fn as_ref(&self) -> &ControlParametrizationData {
        &self.base
    }
}

impl<D> AsMut<ControlParametrizationData> for ControlParametrizationDataNumDiff<D> {
    fn as_mut(&mut self) -> &mut ControlParametrizationData {
        &mut self.base
    }
}

/// Control parametrization whose `dw_du` is computed by forward differences.
#[derive(Debug, Clone)]
pub struct ControlParametrizationNumDiff<M> {
    model: Arc<M>,
    settings: NumDiffSettings,
}

impl<M: ControlParametrizationModel> ControlParametrizationNumDiff<M> {
    pub fn new(model: Arc<M>) -> Self {
        Self {
            model,
            settings: NumDiffSettings::default(),
        }
    }

    pub fn with_settings(model: Arc<M>, settings: NumDiffSettings) -> ModelResult<Self> {
        settings.validate()?;
        Ok(Self { model, settings })
    }

    pub fn model(&self) -> &Arc<M> {
        &self.model
    }

    pub fn disturbance(&self) -> f64 {
        self.settings.disturbance
    }

    pub fn set_disturbance(&mut self, disturbance: f64) -> ModelResult<()> {
        let settings = NumDiffSettings {
            disturbance,
            ..self.settings
        };
        settings.validate()?;
        self.settings = settings;
        Ok(())
    }
}

impl<M: ControlParametrizationModel> ControlParametrizationModel
    for ControlParametrizationNumDiff<M>
{
    type Data = ControlParametrizationDataNumDiff<M::Data>;

    fn nw(&self) -> usize {
        self.model.nw()
    }

    fn nu(&self) -> usize {
        self.model.nu()
    }

    fn calc(&self, data: &mut Self::Data, t: f64, u: &DVector<f64>) -> ModelResult<()> {
        self.model.calc(&mut data.data_0, t, u)?;
        data.base.w.copy_from(&data.data_0.as_ref().w);
        Ok(())
    }

    fn calc_diff(&self, data: &mut Self::Data, t: f64, u: &DVector<f64>) -> ModelResult<()> {
        self.calc(data, t, u)?;
        let h = perturbation_step(self.settings.disturbance, u);
        data.step = h;
        data.up.copy_from(u);
        for i in 0..self.nu() {
            data.up[i] += h;
            self.model.calc(&mut data.data_u, t, &data.up)?;
            data.up[i] = u[i];
            difference_column(
                &mut data.base.dw_du,
                i,
                &data.data_u.as_ref().w,
                &data.data_0.as_ref().w,
                h,
            );
        }
        // The forwarded multiplications read the Jacobian from the wrapped data.
        data.data_0.as_mut().dw_du.copy_from(&data.base.dw_du);
        debug!(h, nu = self.nu(), "numerical dw_du");
        Ok(())
    }

    fn params(&self, data: &mut Self::Data, t: f64, w: &DVector<f64>) -> ModelResult<()> {
        self.model.params(&mut data.data_0, t, w)?;
        data.base.u_diff.copy_from(&data.data_0.as_ref().u_diff);
        Ok(())
    }

    fn convert_bounds(
        &self,
        w_lb: &DVector<f64>,
        w_ub: &DVector<f64>,
        u_lb: &mut DVector<f64>,
        u_ub: &mut DVector<f64>,
    ) -> ModelResult<()> {
        self.model.convert_bounds(w_lb, w_ub, u_lb, u_ub)
    }

    fn multiply_by_jacobian(
        &self,
        data: &Self::Data,
        a: DMatrixView<'_, f64>,
        out: DMatrixViewMut<'_, f64>,
        op: AssignmentOp,
    ) -> ModelResult<()> {
        self.model.multiply_by_jacobian(&data.data_0, a, out, op)
    }

    fn multiply_jacobian_transpose_by(
        &self,
        data: &Self::Data,
        a: DMatrixView<'_, f64>,
        out: DMatrixViewMut<'_, f64>,
        op: AssignmentOp,
    ) -> ModelResult<()> {
        self.model.multiply_jacobian_transpose_by(&data.data_0, a, out, op)
    }

    fn create_data(&self) -> Self::Data {
        let (nw, nu) = (self.nw(), self.nu());
        ControlParametrizationDataNumDiff {
            base: ControlParametrizationData::new(nw, nu),
            data_0: self.model.create_data(),
            data_u: self.model.create_data(),
            up: DVector::zeros(nu),
            step: 0.0,
        }
    }
}

// --- action ---

#[derive(Debug, Clone, PartialEq)]
pub struct ActionDataNumDiff<D> {
    pub base: ActionData,
    pub data_0: D,
    /// Scratch data for perturbed evaluations.
    pub data_p: D,
    /// Residual Jacobians, `nr × ndx` and `nr × nu`.
    pub rx: DMatrix<f64>,
    pub ru: DMatrix<f64>,
    dx: DVector<f64>,
    xp: DVector<f64>,
    up: DVector<f64>,
    xnext_diff: DVector<f64>,
}

impl<D> AsRef<ActionData> for ActionDataNumDiff<D> {
    fn as_ref(&self) -> &ActionData {
        &self.base
    }
}

impl<D> AsMut<ActionData> for ActionDataNumDiff<D> {
    fn as_mut(&mut self) -> &mut ActionData {
        &mut self.base
    }
}

/// Action model with forward-difference `Fx`, `Fu`, `Lx`, `Lu`.
///
/// State perturbations go through `state.integrate` and next-state
/// deviations through `state.difference`. Second-order terms are zero unless
/// `gauss_approx` is on and the model has a residual; then they are the
/// Gauss–Newton products of the residual Jacobians, which match the analytic
/// Hessians only for a quadratic activation.
#[derive(Debug, Clone)]
pub struct ActionModelNumDiff<M> {
    model: Arc<M>,
    settings: NumDiffSettings,
}

impl<M: ActionModel> ActionModelNumDiff<M> {
    pub fn new(model: Arc<M>) -> Self {
        Self {
            model,
            settings: NumDiffSettings::default(),
        }
    }

    pub fn with_settings(model: Arc<M>, settings: NumDiffSettings) -> ModelResult<Self> {
        settings.validate()?;
        Ok(Self { model, settings })
    }

    pub fn model(&self) -> &Arc<M> {
        &self.model
    }

    pub fn disturbance(&self) -> f64 {
        self.settings.disturbance
    }

    pub fn set_disturbance(&mut self, disturbance: f64) -> ModelResult<()> {
        let settings = NumDiffSettings {
            disturbance,
            ..self.settings
        };
        settings.validate()?;
        self.settings = settings;
        Ok(())
    }

    pub fn with_gauss_approx(mut self, gauss_approx: bool) -> Self {
        self.settings.gauss_approx = gauss_approx;
        self
    }

    pub fn gauss_approx(&self) -> bool {
        self.settings.gauss_approx
    }

    /// Whether `calc_diff` fills the Hessian blocks.
    pub fn computes_hessians(&self) -> bool {
        self.settings.gauss_approx && self.nr() > 0
    }
}

impl<M: ActionModel> ActionModel for ActionModelNumDiff<M> {
    type Data = ActionDataNumDiff<M::Data>;

    fn state(&self) -> &Arc<dyn StateManifold> {
        self.model.state()
    }

    fn nu(&self) -> usize {
        self.model.nu()
    }

    fn nr(&self) -> usize {
        self.model.nr()
    }

    fn calc(&self, data: &mut Self::Data, x: &DVector<f64>, u: &DVector<f64>) -> ModelResult<()> {
        self.model.calc(&mut data.data_0, x, u)?;
        let d0 = data.data_0.as_ref();
        data.base.xnext.copy_from(&d0.xnext);
        data.base.cost = d0.cost;
        data.base.r.copy_from(&d0.r);
        Ok(())
    }

    fn calc_diff(
        &self,
        data: &mut Self::Data,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> ModelResult<()> {
        self.calc(data, x, u)?;
        let state = self.model.state();
        let gauss = self.computes_hessians();

        let hx = perturbation_step(self.settings.disturbance, x);
        data.dx.fill(0.0);
        for i in 0..state.ndx() {
            data.dx[i] = hx;
            state.integrate(x, &data.dx, &mut data.xp)?;
            data.dx[i] = 0.0;
            self.model.calc(&mut data.data_p, &data.xp, u)?;

            let (d0, dp) = (data.data_0.as_ref(), data.data_p.as_ref());
            state.difference(&d0.xnext, &dp.xnext, &mut data.xnext_diff)?;
            scaled_column(&mut data.base.fx, i, &data.xnext_diff, hx);
            data.base.lx[i] = (dp.cost - d0.cost) / hx;
            if gauss {
                difference_column(&mut data.rx, i, &dp.r, &d0.r, hx);
            }
        }

        let hu = perturbation_step(self.settings.disturbance, u);
        data.up.copy_from(u);
        for i in 0..self.nu() {
            data.up[i] += hu;
            self.model.calc(&mut data.data_p, x, &data.up)?;
            data.up[i] = u[i];

            let (d0, dp) = (data.data_0.as_ref(), data.data_p.as_ref());
            state.difference(&d0.xnext, &dp.xnext, &mut data.xnext_diff)?;
            scaled_column(&mut data.base.fu, i, &data.xnext_diff, hu);
            data.base.lu[i] = (dp.cost - d0.cost) / hu;
            if gauss {
                difference_column(&mut data.ru, i, &dp.r, &d0.r, hu);
            }
        }

        if gauss {
            data.base.lxx.gemm_tr(1.0, &data.rx, &data.rx, 0.0);
            data.base.lxu.gemm_tr(1.0, &data.rx, &data.ru, 0.0);
            data.base.luu.gemm_tr(1.0, &data.ru, &data.ru, 0.0);
        } else {
            data.base.lxx.fill(0.0);
            data.base.lxu.fill(0.0);
            data.base.luu.fill(0.0);
        }
        debug!(hx, hu, gauss, "numerical action derivatives");
        Ok(())
    }

    fn create_data(&self) -> Self::Data {
        let state = self.model.state();
        let (nx, ndx, nu, nr) = (state.nx(), state.ndx(), self.nu(), self.nr());
        ActionDataNumDiff {
            base: ActionData::new(nx, ndx, nu, nr),
            data_0: self.model.create_data(),
            data_p: self.model.create_data(),
            rx: DMatrix::zeros(nr, ndx),
            ru: DMatrix::zeros(nr, nu),
            dx: DVector::zeros(ndx),
            xp: DVector::zeros(nx),
            up: DVector::zeros(nu),
            xnext_diff: DVector::zeros(ndx),
        }
    }
}

// --- actuation ---

#[derive(Debug, Clone, PartialEq)]
pub struct ActuationDataNumDiff<D> {
    pub base: ActuationData,
    pub data_0: D,
    pub data_p: D,
    dx: DVector<f64>,
    xp: DVector<f64>,
    up: DVector<f64>,
}

impl<D> AsRef<ActuationData> for ActuationDataNumDiff<D> {
    fn as_ref(&self) -> &ActuationData {
        &self.base
    }
}

impl<D> AsMut<ActuationData> for ActuationDataNumDiff<D> {
    fn as_mut(&mut self) -> &mut ActuationData {
        &mut self.base
    }
}

/// Actuation model with forward-difference `dtau_dx` and `dtau_du`.
#[derive(Debug, Clone)]
pub struct ActuationNumDiff<A> {
    model: Arc<A>,
    settings: NumDiffSettings,
}

impl<A: ActuationModel> ActuationNumDiff<A> {
    pub fn new(model: Arc<A>) -> Self {
        Self {
            model,
            settings: NumDiffSettings::default(),
        }
    }

    pub fn with_settings(model: Arc<A>, settings: NumDiffSettings) -> ModelResult<Self> {
        settings.validate()?;
        Ok(Self { model, settings })
    }

    pub fn disturbance(&self) -> f64 {
        self.settings.disturbance
    }
}

impl<A: ActuationModel> ActuationModel for ActuationNumDiff<A> {
    type Data = ActuationDataNumDiff<A::Data>;

    fn state(&self) -> &Arc<StateMultibody> {
        self.model.state()
    }

    fn nu(&self) -> usize {
        self.model.nu()
    }

    fn calc(&self, data: &mut Self::Data, x: &DVector<f64>, u: &DVector<f64>) -> ModelResult<()> {
        self.model.calc(&mut data.data_0, x, u)?;
        data.base.tau.copy_from(&data.data_0.as_ref().tau);
        Ok(())
    }

    fn calc_diff(
        &self,
        data: &mut Self::Data,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> ModelResult<()> {
        self.calc(data, x, u)?;
        let state = self.model.state();

        let hx = perturbation_step(self.settings.disturbance, x);
        data.dx.fill(0.0);
        for i in 0..state.ndx() {
            data.dx[i] = hx;
            state.integrate(x, &data.dx, &mut data.xp)?;
            data.dx[i] = 0.0;
            self.model.calc(&mut data.data_p, &data.xp, u)?;
            difference_column(
                &mut data.base.dtau_dx,
                i,
                &data.data_p.as_ref().tau,
                &data.data_0.as_ref().tau,
                hx,
            );
        }

        let hu = perturbation_step(self.settings.disturbance, u);
        data.up.copy_from(u);
        for i in 0..self.nu() {
            data.up[i] += hu;
            self.model.calc(&mut data.data_p, x, &data.up)?;
            data.up[i] = u[i];
            difference_column(
                &mut data.base.dtau_du,
                i,
                &data.data_p.as_ref().tau,
                &data.data_0.as_ref().tau,
                hu,
            );
        }
        debug!(hx, hu, "numerical actuation derivatives");
        Ok(())
    }

    fn create_data(&self) -> Self::Data {
        let state = self.model.state();
        let nu = self.nu();
        ActuationDataNumDiff {
            base: ActuationData::new(state.nv(), state.ndx(), nu),
            data_0: self.model.create_data(),
            data_p: self.model.create_data(),
            dx: DVector::zeros(state.ndx()),
            xp: DVector::zeros(state.nx()),
            up: DVector::zeros(nu),
        }
    }
}

// --- state ---

/// State manifold whose `jintegrate` / `jdiff` are forward differences of the
/// wrapped manifold's `integrate` / `difference`.
#[derive(Clone)]
pub struct StateNumDiff {
    state: Arc<dyn StateManifold>,
    settings: NumDiffSettings,
}

impl StateNumDiff {
    pub fn new(state: Arc<dyn StateManifold>) -> Self {
        Self {
            state,
            settings: NumDiffSettings::default(),
        }
    }

    pub fn with_settings(
        state: Arc<dyn StateManifold>,
        settings: NumDiffSettings,
    ) -> ModelResult<Self> {
        settings.validate()?;
        Ok(Self { state, settings })
    }

    pub fn disturbance(&self) -> f64 {
        self.settings.disturbance
    }

    fn check_jacobian(&self, what: &'static str, j: &DMatrix<f64>) -> ModelResult<()> {
        let ndx = self.state.ndx();
        check_shape(what, j, ndx, ndx)
    }
}

impl StateManifold for StateNumDiff {
    fn nx(&self) -> usize {
        self.state.nx()
    }

    fn ndx(&self) -> usize {
        self.state.ndx()
    }

    fn nq(&self) -> usize {
        self.state.nq()
    }

    fn nv(&self) -> usize {
        self.state.nv()
    }

    fn zero(&self) -> DVector<f64> {
        self.state.zero()
    }

    fn rand(&self) -> DVector<f64> {
        self.state.rand()
    }

    fn integrate(
        &self,
        x: &DVector<f64>,
        dx: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> ModelResult<()> {
        self.state.integrate(x, dx, out)
    }

    fn difference(
        &self,
        x0: &DVector<f64>,
        x1: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> ModelResult<()> {
        self.state.difference(x0, x1, out)
    }

    fn jintegrate(
        &self,
        x: &DVector<f64>,
        dx: &DVector<f64>,
        jfirst: &mut DMatrix<f64>,
        jsecond: &mut DMatrix<f64>,
        which: Jcomponent,
        op: AssignmentOp,
    ) -> ModelResult<()> {
        let ndx = self.ndx();
        let x1 = self.state.integrated(x, dx)?;
        let mut e = DVector::zeros(ndx);
        let mut xp = DVector::zeros(self.nx());
        let mut x1p = DVector::zeros(self.nx());
        let mut tangent = DVector::zeros(ndx);

        if which.first() {
            self.check_jacobian("Jfirst", jfirst)?;
            let h = perturbation_step(self.settings.disturbance, x);
            for i in 0..ndx {
                e[i] = h;
                self.state.integrate(x, &e, &mut xp)?;
                e[i] = 0.0;
                self.state.integrate(&xp, dx, &mut x1p)?;
                self.state.difference(&x1, &x1p, &mut tangent)?;
                tangent /= h;
                op.assign(&mut jfirst.column_mut(i), &tangent);
            }
        }
        if which.second() {
            self.check_jacobian("Jsecond", jsecond)?;
            let h = perturbation_step(self.settings.disturbance, dx);
            e.copy_from(dx);
            for i in 0..ndx {
                e[i] += h;
                self.state.integrate(x, &e, &mut x1p)?;
                e[i] = dx[i];
                self.state.difference(&x1, &x1p, &mut tangent)?;
                tangent /= h;
                op.assign(&mut jsecond.column_mut(i), &tangent);
            }
        }
        Ok(())
    }

    fn jdiff(
        &self,
        x0: &DVector<f64>,
        x1: &DVector<f64>,
        jfirst: &mut DMatrix<f64>,
        jsecond: &mut DMatrix<f64>,
        which: Jcomponent,
    ) -> ModelResult<()> {
        let ndx = self.ndx();
        let base = self.state.differenced(x0, x1)?;
        let mut e = DVector::zeros(ndx);
        let mut xp = DVector::zeros(self.nx());
        let mut perturbed = DVector::zeros(ndx);

        if which.first() {
            self.check_jacobian("Jfirst", jfirst)?;
            let h = perturbation_step(self.settings.disturbance, x0);
            for i in 0..ndx {
                e[i] = h;
                self.state.integrate(x0, &e, &mut xp)?;
                e[i] = 0.0;
                self.state.difference(&xp, x1, &mut perturbed)?;
                difference_column(jfirst, i, &perturbed, &base, h);
            }
        }
        if which.second() {
            self.check_jacobian("Jsecond", jsecond)?;
            let h = perturbation_step(self.settings.disturbance, x1);
            for i in 0..ndx {
                e[i] = h;
                self.state.integrate(x1, &e, &mut xp)?;
                e[i] = 0.0;
                self.state.difference(x0, &xp, &mut perturbed)?;
                difference_column(jsecond, i, &perturbed, &base, h);
            }
        }
        Ok(())
    }
}

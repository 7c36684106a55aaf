//! Actuation maps from control inputs to generalized forces.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::error::{ModelError, ModelResult};
use crate::math::{check_len, check_shape};
use crate::multibody::JointModel;
use crate::state::{StateManifold, StateMultibody};

/// Generalized force and its Jacobians.
#[derive(Debug, Clone, PartialEq)]
pub struct ActuationData {
    /// Generalized force (`nv`).
    pub tau: DVector<f64>,
    /// `nv × ndx`
    pub dtau_dx: DMatrix<f64>,
    /// `nv × nu`
    pub dtau_du: DMatrix<f64>,
}

impl ActuationData {
    pub fn new(nv: usize, ndx: usize, nu: usize) -> Self {
        Self {
            tau: DVector::zeros(nv),
            dtau_dx: DMatrix::zeros(nv, ndx),
            dtau_du: DMatrix::zeros(nv, nu),
        }
    }
}

impl AsRef<ActuationData> for ActuationData {
    fn as_ref(&self) -> &ActuationData {
        self
    }
}

impl AsMut<ActuationData> for ActuationData {
    fn as_mut(&mut self) -> &mut ActuationData {
        self
    }
}

pub trait ActuationModel: Send + Sync {
    type Data: AsRef<ActuationData> + AsMut<ActuationData>;

    fn state(&self) -> &Arc<StateMultibody>;

    /// Control dimension.
    fn nu(&self) -> usize;

    /// Writes `data.tau`.
    fn calc(&self, data: &mut Self::Data, x: &DVector<f64>, u: &DVector<f64>) -> ModelResult<()>;

    /// Writes `data.dtau_dx` and `data.dtau_du`.
    fn calc_diff(&self, data: &mut Self::Data, x: &DVector<f64>, u: &DVector<f64>)
        -> ModelResult<()>;

    fn create_data(&self) -> Self::Data;

    fn check_inputs(&self, x: &DVector<f64>, u: &DVector<f64>) -> ModelResult<()> {
        check_len("x", x, self.state().nx())?;
        check_len("u", u, self.nu())
    }
}

fn require_free_flyer(state: &StateMultibody) -> ModelResult<()> {
    if state.model().first_joint() != JointModel::FreeFlyer {
        return Err(ModelError::InvalidTopology(
            "the first joint has to be free-flyer".into(),
        ));
    }
    Ok(())
}

/// Every velocity coordinate is directly actuated: `tau = u`.
#[derive(Debug, Clone)]
pub struct ActuationFull {
    state: Arc<StateMultibody>,
}

impl ActuationFull {
    pub fn new(state: Arc<StateMultibody>) -> Self {
        Self { state }
    }
}

impl ActuationModel for ActuationFull {
    type Data = ActuationData;

    fn state(&self) -> &Arc<StateMultibody> {
        &self.state
    }

    fn nu(&self) -> usize {
        self.state.nv()
    }

    fn calc(&self, data: &mut ActuationData, x: &DVector<f64>, u: &DVector<f64>) -> ModelResult<()> {
        self.check_inputs(x, u)?;
        data.tau.copy_from(u);
        Ok(())
    }

    fn calc_diff(
        &self,
        _data: &mut ActuationData,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> ModelResult<()> {
        // Constant Jacobians, written in create_data.
        self.check_inputs(x, u)
    }

    fn create_data(&self) -> ActuationData {
        let nv = self.state.nv();
        let mut data = ActuationData::new(nv, self.state.ndx(), nv);
        data.dtau_du.fill_with_identity();
        data
    }
}

/// Floating base left unactuated, joints directly actuated: `tau = [0₆; u]`.
#[derive(Debug, Clone)]
pub struct ActuationFloatingBase {
    state: Arc<StateMultibody>,
}

impl ActuationFloatingBase {
    pub fn new(state: Arc<StateMultibody>) -> ModelResult<Self> {
        require_free_flyer(&state)?;
        Ok(Self { state })
    }
}

impl ActuationModel for ActuationFloatingBase {
    type Data = ActuationData;

    fn state(&self) -> &Arc<StateMultibody> {
        &self.state
    }

    fn nu(&self) -> usize {
        self.state.nv() - 6
    }

    fn calc(&self, data: &mut ActuationData, x: &DVector<f64>, u: &DVector<f64>) -> ModelResult<()> {
        self.check_inputs(x, u)?;
        data.tau.fixed_rows_mut::<6>(0).fill(0.0);
        data.tau.rows_mut(6, self.nu()).copy_from(u);
        Ok(())
    }

    fn calc_diff(
        &self,
        _data: &mut ActuationData,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> ModelResult<()> {
        self.check_inputs(x, u)
    }

    fn create_data(&self) -> ActuationData {
        let nu = self.nu();
        let mut data = ActuationData::new(self.state.nv(), self.state.ndx(), nu);
        data.dtau_du.view_mut((6, 0), (nu, nu)).fill_with_identity();
        data
    }
}

/// Multirotor base: rotor thrusts map to the base wrench through `tau_f`, any
/// remaining joints are directly actuated.
#[derive(Debug, Clone)]
pub struct ActuationMultiCopterBase {
    state: Arc<StateMultibody>,
    n_rotors: usize,
    /// Full `nv × nu` actuation map.
    tau_f: DMatrix<f64>,
}

impl ActuationMultiCopterBase {
    /// `tau_f` is the `6 × n_rotors` thrust-to-wrench map of the base.
    pub fn new(
        state: Arc<StateMultibody>,
        n_rotors: usize,
        tau_f: &DMatrix<f64>,
    ) -> ModelResult<Self> {
        require_free_flyer(&state)?;
        check_shape("tau_f", tau_f, 6, n_rotors)?;

        let nv = state.nv();
        let nu = nv - 6 + n_rotors;
        let mut full = DMatrix::zeros(nv, nu);
        full.view_mut((0, 0), (6, n_rotors)).copy_from(tau_f);
        if nu > n_rotors {
            full.view_mut((6, n_rotors), (nu - n_rotors, nu - n_rotors))
                .fill_with_identity();
        }
        debug!(n_rotors, nu, nv, "Built multicopter actuation map.");

        Ok(Self {
            state,
            n_rotors,
            tau_f: full,
        })
    }

    pub fn n_rotors(&self) -> usize {
        self.n_rotors
    }

    /// Full `nv × nu` actuation map.
    pub fn tau_f(&self) -> &DMatrix<f64> {
        &self.tau_f
    }

    /// Replaces the full actuation map. Data created earlier keeps the old map.
    pub fn set_tau_f(&mut self, tau_f: &DMatrix<f64>) -> ModelResult<()> {
        check_shape("tau_f", tau_f, self.state.nv(), self.nu())?;
        self.tau_f.copy_from(tau_f);
        Ok(())
    }
}

impl ActuationModel for ActuationMultiCopterBase {
    type Data = ActuationData;

    fn state(&self) -> &Arc<StateMultibody> {
        &self.state
    }

    fn nu(&self) -> usize {
        self.tau_f.ncols()
    }

    fn calc(&self, data: &mut ActuationData, x: &DVector<f64>, u: &DVector<f64>) -> ModelResult<()> {
        self.check_inputs(x, u)?;
        data.tau.gemv(1.0, &self.tau_f, u, 0.0);
        Ok(())
    }

    fn calc_diff(
        &self,
        _data: &mut ActuationData,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> ModelResult<()> {
        // dtau_du = tau_f and dtau_dx = 0 were set in create_data.
        self.check_inputs(x, u)
    }

    fn create_data(&self) -> ActuationData {
        let mut data = ActuationData::new(self.state.nv(), self.state.ndx(), self.nu());
        data.dtau_du.copy_from(&self.tau_f);
        data
    }
}

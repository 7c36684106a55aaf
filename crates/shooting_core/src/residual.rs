//! Residual vectors `r(x, u)` and their Jacobians.
//!
//! Residuals are the raw quantities that activations shape into costs and
//! that [`crate::constraint`] bounds.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::error::ModelResult;
use crate::math::check_len;
use crate::state::{Jcomponent, StateManifold};

#[derive(Debug, Clone, PartialEq)]
pub struct ResidualData {
    pub r: DVector<f64>,
    /// `nr × ndx`
    pub rx: DMatrix<f64>,
    /// `nr × nu`
    pub ru: DMatrix<f64>,
}

impl ResidualData {
    pub fn new(nr: usize, ndx: usize, nu: usize) -> Self {
        Self {
            r: DVector::zeros(nr),
            rx: DMatrix::zeros(nr, ndx),
            ru: DMatrix::zeros(nr, nu),
        }
    }
}

impl AsRef<ResidualData> for ResidualData {
    fn as_ref(&self) -> &ResidualData {
        self
    }
}

impl AsMut<ResidualData> for ResidualData {
    fn as_mut(&mut self) -> &mut ResidualData {
        self
    }
}

pub trait ResidualModel: Send + Sync {
    type Data: AsRef<ResidualData> + AsMut<ResidualData>;

    fn state(&self) -> &Arc<dyn StateManifold>;

    /// Residual dimension.
    fn nr(&self) -> usize;

    /// Control dimension.
    fn nu(&self) -> usize;

    /// Writes `data.r`.
    fn calc(&self, data: &mut Self::Data, x: &DVector<f64>, u: &DVector<f64>) -> ModelResult<()>;

    /// Writes `data.rx` and `data.ru` at `(x, u)`.
    fn calc_diff(&self, data: &mut Self::Data, x: &DVector<f64>, u: &DVector<f64>)
        -> ModelResult<()>;

    fn create_data(&self) -> Self::Data;

    fn check_inputs(&self, x: &DVector<f64>, u: &DVector<f64>) -> ModelResult<()> {
        check_len("x", x, self.state().nx())?;
        check_len("u", u, self.nu())
    }
}

/// `r = x ⊖ xref`
#[derive(Clone)]
pub struct ResidualModelState {
    state: Arc<dyn StateManifold>,
    xref: DVector<f64>,
    nu: usize,
}

impl ResidualModelState {
    pub fn new(state: Arc<dyn StateManifold>, xref: DVector<f64>, nu: usize) -> ModelResult<Self> {
        check_len("xref", &xref, state.nx())?;
        Ok(Self { state, xref, nu })
    }

    pub fn xref(&self) -> &DVector<f64> {
        &self.xref
    }
}

impl ResidualModel for ResidualModelState {
    type Data = ResidualData;

    fn state(&self) -> &Arc<dyn StateManifold> {
        &self.state
    }

    fn nr(&self) -> usize {
        self.state.ndx()
    }

    fn nu(&self) -> usize {
        self.nu
    }

    fn calc(&self, data: &mut ResidualData, x: &DVector<f64>, u: &DVector<f64>) -> ModelResult<()> {
        self.check_inputs(x, u)?;
        self.state.difference(&self.xref, x, &mut data.r)
    }

    fn calc_diff(
        &self,
        data: &mut ResidualData,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> ModelResult<()> {
        self.check_inputs(x, u)?;
        // Only the second Jacobian is requested.
        let mut unused = DMatrix::zeros(0, 0);
        self.state
            .jdiff(&self.xref, x, &mut unused, &mut data.rx, Jcomponent::Second)?;
        data.ru.fill(0.0);
        Ok(())
    }

    fn create_data(&self) -> ResidualData {
        ResidualData::new(self.nr(), self.state.ndx(), self.nu)
    }
}

/// `r = u − uref`
#[derive(Clone)]
pub struct ResidualModelControl {
    state: Arc<dyn StateManifold>,
    uref: DVector<f64>,
}

impl ResidualModelControl {
    pub fn new(state: Arc<dyn StateManifold>, uref: DVector<f64>) -> Self {
        Self { state, uref }
    }

    pub fn uref(&self) -> &DVector<f64> {
        &self.uref
    }
}

impl ResidualModel for ResidualModelControl {
    type Data = ResidualData;

    fn state(&self) -> &Arc<dyn StateManifold> {
        &self.state
    }

    fn nr(&self) -> usize {
        self.uref.len()
    }

    fn nu(&self) -> usize {
        self.uref.len()
    }

    fn calc(&self, data: &mut ResidualData, x: &DVector<f64>, u: &DVector<f64>) -> ModelResult<()> {
        self.check_inputs(x, u)?;
        data.r.copy_from(u);
        data.r -= &self.uref;
        Ok(())
    }

    fn calc_diff(
        &self,
        data: &mut ResidualData,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> ModelResult<()> {
        self.check_inputs(x, u)?;
        data.rx.fill(0.0);
        data.ru.fill_with_identity();
        Ok(())
    }

    fn create_data(&self) -> ResidualData {
        ResidualData::new(self.nr(), self.state.ndx(), self.nu())
    }
}

//! Control parametrizations: maps from optimization parameters `u` to the raw
//! control `w = g(t, u)` consumed by the dynamics.
//!
//! The solver folds `dw_du` into larger system matrices through
//! [`ControlParametrizationModel::multiply_by_jacobian`] and
//! [`ControlParametrizationModel::multiply_jacobian_transpose_by`], which write
//! into caller-owned views according to an [`AssignmentOp`].

use nalgebra::{DMatrix, DMatrixView, DMatrixViewMut, DVector};

use crate::error::{ModelError, ModelResult};
use crate::math::{check_len, check_shape, AssignmentOp};

#[derive(Debug, Clone, PartialEq)]
pub struct ControlParametrizationData {
    /// Raw control (`nw`).
    pub w: DVector<f64>,
    /// `nw × nu`
    pub dw_du: DMatrix<f64>,
    /// Parameters recovered by `params` (`nu`).
    pub u_diff: DVector<f64>,
}

impl ControlParametrizationData {
    pub fn new(nw: usize, nu: usize) -> Self {
        Self {
            w: DVector::zeros(nw),
            dw_du: DMatrix::zeros(nw, nu),
            u_diff: DVector::zeros(nu),
        }
    }
}

impl AsRef<ControlParametrizationData> for ControlParametrizationData {
    fn as_ref(&self) -> &ControlParametrizationData {
        self
    }
}

impl AsMut<ControlParametrizationData> for ControlParametrizationData {
    fn as_mut(&mut self) -> &mut ControlParametrizationData {
        self
    }
}

pub trait ControlParametrizationModel: Send + Sync {
    type Data: AsRef<ControlParametrizationData> + AsMut<ControlParametrizationData>;

    /// Raw control dimension.
    fn nw(&self) -> usize;

    /// Parameter dimension.
    fn nu(&self) -> usize;

    /// Writes `data.w = g(t, u)`.
    fn calc(&self, data: &mut Self::Data, t: f64, u: &DVector<f64>) -> ModelResult<()>;

    /// Writes `data.dw_du` at `(t, u)`.
    fn calc_diff(&self, data: &mut Self::Data, t: f64, u: &DVector<f64>) -> ModelResult<()>;

    /// Writes into `data.u_diff` some `u` with `g(t, u) = w`; the inverse need
    /// not be unique.
    fn params(&self, data: &mut Self::Data, t: f64, w: &DVector<f64>) -> ModelResult<()>;

    /// Maps box bounds on `w` to box bounds on `u`.
    fn convert_bounds(
        &self,
        w_lb: &DVector<f64>,
        w_ub: &DVector<f64>,
        u_lb: &mut DVector<f64>,
        u_ub: &mut DVector<f64>,
    ) -> ModelResult<()>;

    /// `out (op)= A · dw_du`, with `A` of shape `m × nw` and `out` `m × nu`.
    fn multiply_by_jacobian(
        &self,
        data: &Self::Data,
        a: DMatrixView<'_, f64>,
        mut out: DMatrixViewMut<'_, f64>,
        op: AssignmentOp,
    ) -> ModelResult<()> {
        check_shape("A", &a, a.nrows(), self.nw())?;
        op.gemm(&mut out, &a, &data.as_ref().dw_du)
    }

    /// `out (op)= dw_duᵗ · A`, with `A` of shape `nw × m` and `out` `nu × m`.
    fn multiply_jacobian_transpose_by(
        &self,
        data: &Self::Data,
        a: DMatrixView<'_, f64>,
        mut out: DMatrixViewMut<'_, f64>,
        op: AssignmentOp,
    ) -> ModelResult<()> {
        check_shape("A", &a, self.nw(), a.ncols())?;
        op.gemm_tr(&mut out, &data.as_ref().dw_du, &a)
    }

    fn create_data(&self) -> Self::Data;
}

fn check_bounds(
    w_lb: &DVector<f64>,
    w_ub: &DVector<f64>,
    u_lb: &DVector<f64>,
    u_ub: &DVector<f64>,
    nw: usize,
    nu: usize,
) -> ModelResult<()> {
    check_len("w_lb", w_lb, nw)?;
    check_len("w_ub", w_ub, nw)?;
    check_len("u_lb", u_lb, nu)?;
    check_len("u_ub", u_ub, nu)
}

/// Constant control over the interval: `w = u`.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlParametrizationPolyZero {
    nw: usize,
}

impl ControlParametrizationPolyZero {
    pub fn new(nw: usize) -> Self {
        Self { nw }
    }
}

impl ControlParametrizationModel for ControlParametrizationPolyZero {
    type Data = ControlParametrizationData;

    fn nw(&self) -> usize {
        self.nw
    }

    fn nu(&self) -> usize {
        self.nw
    }

    fn calc(&self, data: &mut Self::Data, _t: f64, u: &DVector<f64>) -> ModelResult<()> {
        check_len("u", u, self.nw)?;
        data.w.copy_from(u);
        Ok(())
    }

    fn calc_diff(&self, data: &mut Self::Data, _t: f64, u: &DVector<f64>) -> ModelResult<()> {
        check_len("u", u, self.nw)?;
        data.dw_du.fill_with_identity();
        Ok(())
    }

    fn params(&self, data: &mut Self::Data, _t: f64, w: &DVector<f64>) -> ModelResult<()> {
        check_len("w", w, self.nw)?;
        data.u_diff.copy_from(w);
        Ok(())
    }

    fn convert_bounds(
        &self,
        w_lb: &DVector<f64>,
        w_ub: &DVector<f64>,
        u_lb: &mut DVector<f64>,
        u_ub: &mut DVector<f64>,
    ) -> ModelResult<()> {
        check_bounds(w_lb, w_ub, u_lb, u_ub, self.nw, self.nw)?;
        u_lb.copy_from(w_lb);
        u_ub.copy_from(w_ub);
        Ok(())
    }

    fn multiply_by_jacobian(
        &self,
        _data: &Self::Data,
        a: DMatrixView<'_, f64>,
        mut out: DMatrixViewMut<'_, f64>,
        op: AssignmentOp,
    ) -> ModelResult<()> {
        check_shape("A", &a, a.nrows(), self.nw)?;
        check_shape("out", &out, a.nrows(), self.nw)?;
        op.assign(&mut out, &a);
        Ok(())
    }

    fn multiply_jacobian_transpose_by(
        &self,
        _data: &Self::Data,
        a: DMatrixView<'_, f64>,
        mut out: DMatrixViewMut<'_, f64>,
        op: AssignmentOp,
    ) -> ModelResult<()> {
        check_shape("A", &a, self.nw, a.ncols())?;
        check_shape("out", &out, self.nw, a.ncols())?;
        op.assign(&mut out, &a);
        Ok(())
    }

    fn create_data(&self) -> Self::Data {
        let mut data = ControlParametrizationData::new(self.nw, self.nw);
        data.dw_du.fill_with_identity();
        data
    }
}

/// Linear control over the normalized interval `t ∈ [0, 1]`.
///
/// `u = [p0; p1]` holds the control at the start and at the middle of the
/// interval, `w(t) = (1 − 2t)·p0 + 2t·p1`.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlParametrizationPolyOne {
    nw: usize,
}

impl ControlParametrizationPolyOne {
    pub fn new(nw: usize) -> Self {
        Self { nw }
    }

    fn coefficients(t: f64) -> ModelResult<(f64, f64)> {
        if !(0.0..=1.0).contains(&t) {
            return Err(ModelError::TimeOutOfRange(t));
        }
        let c1 = 2.0 * t;
        Ok((1.0 - c1, c1))
    }
}

impl ControlParametrizationModel for ControlParametrizationPolyOne {
    type Data = ControlParametrizationData;

    fn nw(&self) -> usize {
        self.nw
    }

    fn nu(&self) -> usize {
        2 * self.nw
    }

    fn calc(&self, data: &mut Self::Data, t: f64, u: &DVector<f64>) -> ModelResult<()> {
        check_len("u", u, self.nu())?;
        let (c0, c1) = Self::coefficients(t)?;
        let nw = self.nw;
        for i in 0..nw {
            data.w[i] = c0 * u[i] + c1 * u[nw + i];
        }
        Ok(())
    }

    fn calc_diff(&self, data: &mut Self::Data, t: f64, u: &DVector<f64>) -> ModelResult<()> {
        check_len("u", u, self.nu())?;
        let (c0, c1) = Self::coefficients(t)?;
        let nw = self.nw;
        data.dw_du.fill(0.0);
        for i in 0..nw {
            data.dw_du[(i, i)] = c0;
            data.dw_du[(i, nw + i)] = c1;
        }
        Ok(())
    }

    fn params(&self, data: &mut Self::Data, t: f64, w: &DVector<f64>) -> ModelResult<()> {
        check_len("w", w, self.nw)?;
        Self::coefficients(t)?;
        data.u_diff.rows_mut(0, self.nw).copy_from(w);
        data.u_diff.rows_mut(self.nw, self.nw).copy_from(w);
        Ok(())
    }

    fn convert_bounds(
        &self,
        w_lb: &DVector<f64>,
        w_ub: &DVector<f64>,
        u_lb: &mut DVector<f64>,
        u_ub: &mut DVector<f64>,
    ) -> ModelResult<()> {
        check_bounds(w_lb, w_ub, u_lb, u_ub, self.nw, self.nu())?;
        let nw = self.nw;
        u_lb.rows_mut(0, nw).copy_from(w_lb);
        u_lb.rows_mut(nw, nw).copy_from(w_lb);
        u_ub.rows_mut(0, nw).copy_from(w_ub);
        u_ub.rows_mut(nw, nw).copy_from(w_ub);
        Ok(())
    }

    fn create_data(&self) -> Self::Data {
        ControlParametrizationData::new(self.nw, self.nu())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn dyadic(rows: usize, cols: usize, offset: f64) -> DMatrix<f64> {
        DMatrix::from_fn(rows, cols, |i, j| (i as f64) * 0.5 - (j as f64) * 0.25 + offset)
    }

    #[test]
    fn poly_zero_is_identity() {
        let model = ControlParametrizationPolyZero::new(3);
        let mut data = model.create_data();
        let u = DVector::from_vec(vec![0.1, -0.2, 0.3]);
        model.calc(&mut data, 0.0, &u).expect("calc");
        model.calc_diff(&mut data, 0.0, &u).expect("calc_diff");
        assert_eq!(data.w, u);
        assert_eq!(data.dw_du, DMatrix::<f64>::identity(3, 3));

        model.params(&mut data, 0.0, &u).expect("params");
        assert_eq!(data.u_diff, u);
    }

    #[test]
    fn poly_one_interpolates() {
        let model = ControlParametrizationPolyOne::new(2);
        let mut data = model.create_data();
        let u = DVector::from_vec(vec![1.0, 2.0, 3.0, 6.0]);

        model.calc(&mut data, 0.0, &u).expect("calc");
        assert_eq!(data.w.as_slice(), &[1.0, 2.0]);
        model.calc(&mut data, 0.5, &u).expect("calc");
        assert_eq!(data.w.as_slice(), &[3.0, 6.0]);
        model.calc(&mut data, 0.25, &u).expect("calc");
        assert_eq!(data.w.as_slice(), &[2.0, 4.0]);

        model.calc_diff(&mut data, 0.25, &u).expect("calc_diff");
        assert_eq!(data.dw_du[(0, 0)], 0.5);
        assert_eq!(data.dw_du[(0, 2)], 0.5);
        assert_eq!(data.dw_du[(0, 1)], 0.0);
    }

    #[test]
    fn poly_one_params_reproduce_w() {
        let model = ControlParametrizationPolyOne::new(2);
        let mut data = model.create_data();
        let w = DVector::from_vec(vec![-1.0, 4.0]);
        model.params(&mut data, 0.3, &w).expect("params");
        let u = data.u_diff.clone();
        model.calc(&mut data, 0.3, &u).expect("calc");
        assert_relative_eq!(data.w, w, epsilon = 1e-14);
    }

    #[test]
    fn poly_one_rejects_time_outside_interval() {
        let model = ControlParametrizationPolyOne::new(1);
        let mut data = model.create_data();
        let err = model
            .calc(&mut data, 1.5, &DVector::zeros(2))
            .expect_err("time error");
        assert_eq!(err, ModelError::TimeOutOfRange(1.5));
        assert!(model.calc(&mut data, f64::NAN, &DVector::zeros(2)).is_err());
    }

    #[test]
    fn convert_bounds_duplicates_for_poly_one() {
        let model = ControlParametrizationPolyOne::new(2);
        let w_lb = DVector::from_vec(vec![-1.0, -2.0]);
        let w_ub = DVector::from_vec(vec![1.0, 2.0]);
        let mut u_lb = DVector::zeros(4);
        let mut u_ub = DVector::zeros(4);
        model
            .convert_bounds(&w_lb, &w_ub, &mut u_lb, &mut u_ub)
            .expect("bounds");
        assert_eq!(u_lb.as_slice(), &[-1.0, -2.0, -1.0, -2.0]);
        assert_eq!(u_ub.as_slice(), &[1.0, 2.0, 1.0, 2.0]);

        let mut short = DVector::zeros(3);
        assert!(model
            .convert_bounds(&w_lb, &w_ub, &mut short, &mut u_ub)
            .is_err());
    }

    #[test]
    fn multiply_by_jacobian_matches_product() {
        let model = ControlParametrizationPolyOne::new(2);
        let mut data = model.create_data();
        let u = DVector::from_vec(vec![0.1, 0.2, 0.3, 0.4]);
        model.calc_diff(&mut data, 0.4, &u).expect("calc_diff");
        let a = dyadic(3, 2, 1.0);
        let mut out = DMatrix::zeros(3, 4);
        model
            .multiply_by_jacobian(&data, a.as_view(), out.as_view_mut(), AssignmentOp::SetTo)
            .expect("multiply");
        assert_relative_eq!(out, &a * &data.dw_du, epsilon = 1e-14);

        let b = dyadic(2, 5, -0.5);
        let mut out_t = DMatrix::zeros(4, 5);
        model
            .multiply_jacobian_transpose_by(
                &data,
                b.as_view(),
                out_t.as_view_mut(),
                AssignmentOp::SetTo,
            )
            .expect("multiply transpose");
        assert_relative_eq!(out_t, data.dw_du.transpose() * &b, epsilon = 1e-14);
    }

    #[test]
    fn addto_then_rmfrom_restores_buffer() {
        let model = ControlParametrizationPolyOne::new(2);
        let mut data = model.create_data();
        model
            .calc_diff(&mut data, 0.25, &DVector::zeros(4))
            .expect("calc_diff");
        let a = dyadic(3, 2, 0.75);
        let mut out = dyadic(3, 4, 2.0);
        let original = out.clone();

        model
            .multiply_by_jacobian(&data, a.as_view(), out.as_view_mut(), AssignmentOp::AddTo)
            .expect("addto");
        assert_ne!(out, original);
        model
            .multiply_by_jacobian(&data, a.as_view(), out.as_view_mut(), AssignmentOp::RmFrom)
            .expect("rmfrom");
        assert_eq!(out, original);

        let b = dyadic(2, 3, 0.25);
        let mut out_t = dyadic(4, 3, -1.0);
        let original_t = out_t.clone();
        model
            .multiply_jacobian_transpose_by(
                &data,
                b.as_view(),
                out_t.as_view_mut(),
                AssignmentOp::AddTo,
            )
            .expect("addto");
        model
            .multiply_jacobian_transpose_by(
                &data,
                b.as_view(),
                out_t.as_view_mut(),
                AssignmentOp::RmFrom,
            )
            .expect("rmfrom");
        assert_eq!(out_t, original_t);
    }

    #[test]
    fn poly_zero_multiplication_writes_into_sub_block() {
        let model = ControlParametrizationPolyZero::new(2);
        let data = model.create_data();
        let a = dyadic(2, 2, 1.0);
        let mut system = DMatrix::zeros(4, 4);
        model
            .multiply_by_jacobian(
                &data,
                a.as_view(),
                system.view_mut((2, 2), (2, 2)),
                AssignmentOp::AddTo,
            )
            .expect("addto");
        assert_eq!(system.view((2, 2), (2, 2)).clone_owned(), a);
        assert_eq!(system[(0, 0)], 0.0);
    }

    #[test]
    fn multiply_rejects_wrong_shapes() {
        let model = ControlParametrizationPolyOne::new(2);
        let data = model.create_data();
        let a = DMatrix::zeros(3, 3);
        let mut out = DMatrix::zeros(3, 4);
        let err = model
            .multiply_by_jacobian(&data, a.as_view(), out.as_view_mut(), AssignmentOp::SetTo)
            .expect_err("shape error");
        assert!(format!("{err}").contains("A has wrong shape"));

        let a = DMatrix::zeros(3, 2);
        let mut out = DMatrix::zeros(3, 3);
        assert!(model
            .multiply_by_jacobian(&data, a.as_view(), out.as_view_mut(), AssignmentOp::AddTo)
            .is_err());
    }
}

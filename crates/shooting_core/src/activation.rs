//! Scalar shaping of residual vectors.
//!
//! An activation turns a residual `r` into a cost `a(r)` and provides the
//! gradient `Ar` and a (Gauss–Newton style) Hessian `Arr`.

use nalgebra::{DMatrix, DVector};

use crate::error::{ModelError, ModelResult};
use crate::math::check_len;

/// Output of an activation evaluation, sized to the residual dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationData {
    pub value: f64,
    pub ar: DVector<f64>,
    pub arr: DMatrix<f64>,
}

impl ActivationData {
    pub fn new(nr: usize) -> Self {
        Self {
            value: 0.0,
            ar: DVector::zeros(nr),
            arr: DMatrix::zeros(nr, nr),
        }
    }
}

pub trait ActivationModel: Send + Sync {
    /// Residual dimension.
    fn nr(&self) -> usize;

    /// Writes `data.value = a(r)`.
    fn calc(&self, data: &mut ActivationData, r: &DVector<f64>) -> ModelResult<()>;

    /// Writes `data.ar` and `data.arr` at `r`.
    fn calc_diff(&self, data: &mut ActivationData, r: &DVector<f64>) -> ModelResult<()>;

    fn create_data(&self) -> ActivationData {
        ActivationData::new(self.nr())
    }
}

/// `a(r) = ½‖r‖²`
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationQuad {
    nr: usize,
}

impl ActivationQuad {
    pub fn new(nr: usize) -> Self {
        Self { nr }
    }
}

impl ActivationModel for ActivationQuad {
    fn nr(&self) -> usize {
        self.nr
    }

    fn calc(&self, data: &mut ActivationData, r: &DVector<f64>) -> ModelResult<()> {
        check_len("r", r, self.nr)?;
        data.value = 0.5 * r.norm_squared();
        Ok(())
    }

    fn calc_diff(&self, data: &mut ActivationData, r: &DVector<f64>) -> ModelResult<()> {
        check_len("r", r, self.nr)?;
        data.ar.copy_from(r);
        data.arr.fill_with_identity();
        Ok(())
    }
}

/// `a(r) = ½ rᵗ diag(w) r`
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationWeightedQuad {
    weights: DVector<f64>,
}

impl ActivationWeightedQuad {
    pub fn new(weights: DVector<f64>) -> ModelResult<Self> {
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(ModelError::InvalidConfiguration(
                "activation weights must be finite".into(),
            ));
        }
        Ok(Self { weights })
    }

    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }
}

impl ActivationModel for ActivationWeightedQuad {
    fn nr(&self) -> usize {
        self.weights.len()
    }

    fn calc(&self, data: &mut ActivationData, r: &DVector<f64>) -> ModelResult<()> {
        check_len("r", r, self.nr())?;
        data.value = 0.5
            * r.iter()
                .zip(self.weights.iter())
                .map(|(ri, wi)| wi * ri * ri)
                .sum::<f64>();
        Ok(())
    }

    fn calc_diff(&self, data: &mut ActivationData, r: &DVector<f64>) -> ModelResult<()> {
        check_len("r", r, self.nr())?;
        data.ar.copy_from(&r.component_mul(&self.weights));
        data.arr.fill(0.0);
        data.arr.set_diagonal(&self.weights);
        Ok(())
    }
}

/// Smooth approximation of the 1-norm: `a(r) = Σ sqrt(eps + rᵢ²)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationSmoothAbs {
    nr: usize,
    eps: f64,
}

impl ActivationSmoothAbs {
    pub const DEFAULT_EPS: f64 = 1.0;

    pub fn new(nr: usize) -> Self {
        Self {
            nr,
            eps: Self::DEFAULT_EPS,
        }
    }

    pub fn with_eps(nr: usize, eps: f64) -> ModelResult<Self> {
        if eps.is_nan() || eps < 0.0 {
            return Err(ModelError::NegativeSmoothing(eps));
        }
        Ok(Self { nr, eps })
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }
}

impl ActivationModel for ActivationSmoothAbs {
    fn nr(&self) -> usize {
        self.nr
    }

    fn calc(&self, data: &mut ActivationData, r: &DVector<f64>) -> ModelResult<()> {
        check_len("r", r, self.nr)?;
        data.value = r.iter().map(|ri| (self.eps + ri * ri).sqrt()).sum();
        Ok(())
    }

    fn calc_diff(&self, data: &mut ActivationData, r: &DVector<f64>) -> ModelResult<()> {
        check_len("r", r, self.nr)?;
        data.arr.fill(0.0);
        for (i, ri) in r.iter().enumerate() {
            let a = (self.eps + ri * ri).sqrt();
            // a == 0 only when eps == 0 and r_i == 0: take the zero subgradient.
            if a == 0.0 {
                data.ar[i] = 0.0;
                continue;
            }
            data.ar[i] = ri / a;
            data.arr[(i, i)] = self.eps / (a * a * a);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn smooth_abs_at_origin_with_unit_eps() {
        let model = ActivationSmoothAbs::new(1);
        let mut data = model.create_data();
        let r = DVector::from_vec(vec![0.0]);
        model.calc(&mut data, &r).expect("calc");
        model.calc_diff(&mut data, &r).expect("calc_diff");
        assert_eq!(data.value, 1.0);
        assert_eq!(data.ar[0], 0.0);
        assert_eq!(data.arr[(0, 0)], 1.0);
    }

    #[test]
    fn smooth_abs_approaches_l1_norm() {
        let r = DVector::<f64>::from_vec(vec![1.5, -2.0, 0.25]);
        let l1: f64 = r.iter().map(|v| v.abs()).sum();
        let mut previous_gap = f64::INFINITY;
        for eps in [1e-2, 1e-4, 1e-8] {
            let model = ActivationSmoothAbs::with_eps(3, eps).expect("model");
            let mut data = model.create_data();
            model.calc(&mut data, &r).expect("calc");
            let gap = (data.value - l1).abs();
            assert!(gap < previous_gap);
            previous_gap = gap;
        }
        assert!(previous_gap < 1e-7);
    }

    #[test]
    fn smooth_abs_zero_eps_is_finite_at_origin() {
        let model = ActivationSmoothAbs::with_eps(2, 0.0).expect("model");
        let mut data = model.create_data();
        let r = DVector::from_vec(vec![0.0, -3.0]);
        model.calc(&mut data, &r).expect("calc");
        model.calc_diff(&mut data, &r).expect("calc_diff");
        assert_eq!(data.value, 3.0);
        assert!(data.ar.iter().all(|v| v.is_finite()));
        assert!(data.arr.iter().all(|v| v.is_finite()));
        assert_eq!(data.ar[0], 0.0);
        assert_eq!(data.ar[1], -1.0);
    }

    #[test]
    fn smooth_abs_gradient_matches_formula() {
        let model = ActivationSmoothAbs::with_eps(2, 0.5).expect("model");
        let mut data = model.create_data();
        let r = DVector::from_vec(vec![0.7, -1.2]);
        model.calc_diff(&mut data, &r).expect("calc_diff");
        for i in 0..2 {
            let a = (0.5 + r[i] * r[i]).sqrt();
            assert_relative_eq!(data.ar[i], r[i] / a, epsilon = 1e-14);
            assert_relative_eq!(data.arr[(i, i)], 0.5 / a.powi(3), epsilon = 1e-14);
        }
        assert_eq!(data.arr[(0, 1)], 0.0);
    }

    #[test]
    fn smooth_abs_gradient_agrees_with_finite_differences() {
        let model = ActivationSmoothAbs::new(3);
        let mut data = model.create_data();
        let r = DVector::from_vec(vec![0.3, -0.8, 1.7]);
        model.calc(&mut data, &r).expect("calc");
        let base = data.value;
        model.calc_diff(&mut data, &r).expect("calc_diff");
        let grad = data.ar.clone();
        let h = 1e-7;
        for i in 0..3 {
            let mut rp = r.clone();
            rp[i] += h;
            model.calc(&mut data, &rp).expect("calc");
            assert_relative_eq!((data.value - base) / h, grad[i], epsilon = 1e-5);
        }
    }

    #[test]
    fn smooth_abs_rejects_negative_eps() {
        let err = ActivationSmoothAbs::with_eps(2, -1e-3).expect_err("negative eps");
        assert_eq!(err, ModelError::NegativeSmoothing(-1e-3));
    }

    #[test]
    fn residual_length_is_validated() {
        let model = ActivationSmoothAbs::new(3);
        let mut data = model.create_data();
        let err = model
            .calc(&mut data, &DVector::zeros(2))
            .expect_err("length error");
        assert!(format!("{err}").contains("r has wrong dimension"));
        assert!(model.calc_diff(&mut data, &DVector::zeros(4)).is_err());
    }

    #[test]
    fn quad_and_weighted_quad() {
        let r = DVector::from_vec(vec![1.0, -2.0]);
        let quad = ActivationQuad::new(2);
        let mut data = quad.create_data();
        quad.calc(&mut data, &r).expect("calc");
        quad.calc_diff(&mut data, &r).expect("calc_diff");
        assert_eq!(data.value, 2.5);
        assert_eq!(data.ar, r);
        assert_eq!(data.arr, DMatrix::<f64>::identity(2, 2));

        let weighted =
            ActivationWeightedQuad::new(DVector::from_vec(vec![2.0, 0.5])).expect("weights");
        let mut data = weighted.create_data();
        weighted.calc(&mut data, &r).expect("calc");
        weighted.calc_diff(&mut data, &r).expect("calc_diff");
        assert_eq!(data.value, 2.0);
        assert_eq!(data.ar.as_slice(), &[2.0, -1.0]);
        assert_eq!(data.arr[(1, 1)], 0.5);
    }
}

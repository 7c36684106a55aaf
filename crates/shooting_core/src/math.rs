//! In-place combination primitives and operand validation.
//!
//! Composite Jacobians (cost gradient with respect to control parameters,
//! state-integration chains, ...) are folded into caller-owned buffers through
//! an explicit [`AssignmentOp`] instead of building temporaries.

use std::fmt;
use std::str::FromStr;

use nalgebra::{DVector, Dim, Dyn, Matrix, Storage, StorageMut};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// How a computed product is combined with the destination buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentOp {
    /// `out = value`
    SetTo,
    /// `out += value`
    AddTo,
    /// `out -= value`
    RmFrom,
}

impl AssignmentOp {
    /// `(alpha, beta)` such that `out = alpha * product + beta * out`.
    fn gemm_coefficients(self) -> (f64, f64) {
        match self {
            AssignmentOp::SetTo => (1.0, 0.0),
            AssignmentOp::AddTo => (1.0, 1.0),
            AssignmentOp::RmFrom => (-1.0, 1.0),
        }
    }

    /// Combines `a * b` into `out`.
    pub fn gemm<SO, SA, SB>(
        self,
        out: &mut Matrix<f64, Dyn, Dyn, SO>,
        a: &Matrix<f64, Dyn, Dyn, SA>,
        b: &Matrix<f64, Dyn, Dyn, SB>,
    ) -> ModelResult<()>
    where
        SO: StorageMut<f64, Dyn, Dyn>,
        SA: Storage<f64, Dyn, Dyn>,
        SB: Storage<f64, Dyn, Dyn>,
    {
        if a.ncols() != b.nrows() {
            return Err(ModelError::ShapeMismatch {
                what: "A",
                expected_rows: a.nrows(),
                expected_cols: b.nrows(),
                rows: a.nrows(),
                cols: a.ncols(),
            });
        }
        check_shape("out", out, a.nrows(), b.ncols())?;
        let (alpha, beta) = self.gemm_coefficients();
        out.gemm(alpha, a, b, beta);
        Ok(())
    }

    /// Combines `aᵗ * b` into `out`.
    pub fn gemm_tr<SO, SA, SB>(
        self,
        out: &mut Matrix<f64, Dyn, Dyn, SO>,
        a: &Matrix<f64, Dyn, Dyn, SA>,
        b: &Matrix<f64, Dyn, Dyn, SB>,
    ) -> ModelResult<()>
    where
        SO: StorageMut<f64, Dyn, Dyn>,
        SA: Storage<f64, Dyn, Dyn>,
        SB: Storage<f64, Dyn, Dyn>,
    {
        if a.nrows() != b.nrows() {
            return Err(ModelError::ShapeMismatch {
                what: "A",
                expected_rows: a.nrows(),
                expected_cols: a.ncols(),
                rows: b.nrows(),
                cols: b.ncols(),
            });
        }
        check_shape("out", out, a.ncols(), b.ncols())?;
        let (alpha, beta) = self.gemm_coefficients();
        out.gemm_tr(alpha, a, b, beta);
        Ok(())
    }

    /// Combines an already evaluated block into `out`.
    pub fn assign<R, C, SO, SB>(self, out: &mut Matrix<f64, R, C, SO>, block: &Matrix<f64, R, C, SB>)
    where
        R: Dim,
        C: Dim,
        SO: StorageMut<f64, R, C>,
        SB: Storage<f64, R, C>,
    {
        match self {
            AssignmentOp::SetTo => out.copy_from(block),
            AssignmentOp::AddTo => *out += block,
            AssignmentOp::RmFrom => *out -= block,
        }
    }

    /// Combines `scale * I` into a square `out`.
    pub fn assign_identity<R, C, SO>(self, out: &mut Matrix<f64, R, C, SO>, scale: f64)
    where
        R: Dim,
        C: Dim,
        SO: StorageMut<f64, R, C>,
    {
        let n = out.nrows().min(out.ncols());
        match self {
            AssignmentOp::SetTo => {
                out.fill(0.0);
                for i in 0..n {
                    out[(i, i)] = scale;
                }
            }
            AssignmentOp::AddTo => {
                for i in 0..n {
                    out[(i, i)] += scale;
                }
            }
            AssignmentOp::RmFrom => {
                for i in 0..n {
                    out[(i, i)] -= scale;
                }
            }
        }
    }
}

impl fmt::Display for AssignmentOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AssignmentOp::SetTo => "setto",
            AssignmentOp::AddTo => "addto",
            AssignmentOp::RmFrom => "rmfrom",
        };
        f.write_str(name)
    }
}

impl FromStr for AssignmentOp {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "setto" => Ok(AssignmentOp::SetTo),
            "addto" => Ok(AssignmentOp::AddTo),
            "rmfrom" => Ok(AssignmentOp::RmFrom),
            _ => Err(ModelError::InvalidAssignmentOp(s.to_string())),
        }
    }
}

/// Legacy integer tags: 0 = setto, 1 = addto, 2 = rmfrom.
impl TryFrom<u8> for AssignmentOp {
    type Error = ModelError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(AssignmentOp::SetTo),
            1 => Ok(AssignmentOp::AddTo),
            2 => Ok(AssignmentOp::RmFrom),
            other => Err(ModelError::InvalidAssignmentOp(other.to_string())),
        }
    }
}

pub(crate) fn check_len(what: &'static str, v: &DVector<f64>, expected: usize) -> ModelResult<()> {
    if v.len() != expected {
        return Err(ModelError::DimensionMismatch {
            what,
            expected,
            got: v.len(),
        });
    }
    Ok(())
}

pub(crate) fn check_shape<R, C, S>(
    what: &'static str,
    m: &Matrix<f64, R, C, S>,
    expected_rows: usize,
    expected_cols: usize,
) -> ModelResult<()>
where
    R: Dim,
    C: Dim,
    S: Storage<f64, R, C>,
{
    if m.nrows() != expected_rows || m.ncols() != expected_cols {
        return Err(ModelError::ShapeMismatch {
            what,
            expected_rows,
            expected_cols,
            rows: m.nrows(),
            cols: m.ncols(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, Matrix3};

    #[test]
    fn gemm_three_way_combination() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let b = DMatrix::identity(2, 2) * 2.0;
        let mut out = DMatrix::from_element(2, 2, 1.0);

        AssignmentOp::SetTo.gemm(&mut out, &a, &b).expect("setto");
        assert_eq!(out, &a * 2.0);

        AssignmentOp::AddTo.gemm(&mut out, &a, &b).expect("addto");
        assert_eq!(out, &a * 4.0);

        AssignmentOp::RmFrom.gemm(&mut out, &a, &b).expect("rmfrom");
        assert_eq!(out, &a * 2.0);
    }

    #[test]
    fn setto_ignores_previous_contents() {
        let a = DMatrix::identity(2, 2);
        let b = DMatrix::from_element(2, 2, 3.0);
        let mut out = DMatrix::from_element(2, 2, f64::NAN);
        AssignmentOp::SetTo.gemm(&mut out, &a, &b).expect("setto");
        assert!(out.iter().all(|v| *v == 3.0));
    }

    #[test]
    fn gemm_tr_uses_transpose() {
        let a = DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 2.0, 0.0, 1.0, 0.0]);
        let b = DMatrix::from_row_slice(2, 1, &[1.0, 1.0]);
        let mut out = DMatrix::zeros(3, 1);
        AssignmentOp::SetTo.gemm_tr(&mut out, &a, &b).expect("gemm_tr");
        assert_eq!(out.as_slice(), &[1.0, 1.0, 2.0]);
    }

    #[test]
    fn gemm_rejects_wrong_output_shape() {
        let a = DMatrix::identity(2, 2);
        let b = DMatrix::identity(2, 2);
        let mut out = DMatrix::zeros(3, 2);
        let err = AssignmentOp::AddTo
            .gemm(&mut out, &a, &b)
            .expect_err("shape error");
        assert!(format!("{err}").contains("out has wrong shape"));
    }

    #[test]
    fn assign_block_into_view() {
        let mut out = DMatrix::<f64>::zeros(4, 4);
        let block = Matrix3::new(1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0);
        AssignmentOp::SetTo.assign(&mut out.fixed_view_mut::<3, 3>(1, 1), &block);
        AssignmentOp::AddTo.assign(&mut out.fixed_view_mut::<3, 3>(1, 1), &block);
        assert_eq!(out[(1, 1)], 2.0);
        assert_eq!(out[(3, 3)], 18.0);
        assert_eq!(out[(0, 0)], 0.0);
    }

    #[test]
    fn assign_identity_round_trip() {
        let mut out = DMatrix::from_element(3, 3, 0.5);
        let before = out.clone();
        AssignmentOp::AddTo.assign_identity(&mut out, 2.0);
        assert_eq!(out[(1, 1)], 2.5);
        AssignmentOp::RmFrom.assign_identity(&mut out, 2.0);
        assert_eq!(out, before);
        AssignmentOp::SetTo.assign_identity(&mut out, 1.0);
        assert_eq!(out, DMatrix::identity(3, 3));
    }

    #[test]
    fn parse_operator_tags() {
        assert_eq!("addto".parse::<AssignmentOp>(), Ok(AssignmentOp::AddTo));
        assert_eq!(" RmFrom ".parse::<AssignmentOp>(), Ok(AssignmentOp::RmFrom));
        assert_eq!(AssignmentOp::try_from(0u8), Ok(AssignmentOp::SetTo));
        assert_eq!(AssignmentOp::SetTo.to_string(), "setto");

        let err = "mulby".parse::<AssignmentOp>().expect_err("unknown tag");
        assert!(matches!(err, ModelError::InvalidAssignmentOp(_)));
        let err = AssignmentOp::try_from(7u8).expect_err("unknown tag");
        assert!(format!("{err}").contains("allowed operators"));
    }
}

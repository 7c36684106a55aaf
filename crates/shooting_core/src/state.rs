//! State manifolds: local addition (`integrate`), subtraction (`difference`)
//! and their Jacobians.
//!
//! Points live in an ambient space of dimension `nx`; perturbations live in the
//! tangent space of dimension `ndx`. `difference(x0, x1)` returns `x1 ⊖ x0`, so
//! `difference(x, integrate(x, dx)) == dx` for small `dx`.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Matrix3, Quaternion, UnitQuaternion, Vector3};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};
use crate::math::{check_len, check_shape, AssignmentOp};
use crate::multibody::{JointModel, KinematicModel};

/// Selects which Jacobian(s) of a two-argument state operation are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Jcomponent {
    First,
    Second,
    Both,
}

impl Jcomponent {
    pub fn first(self) -> bool {
        matches!(self, Jcomponent::First | Jcomponent::Both)
    }

    pub fn second(self) -> bool {
        matches!(self, Jcomponent::Second | Jcomponent::Both)
    }
}

/// Manifold on which trajectories live.
///
/// Implementations are shared read-only configuration (`Arc<dyn StateManifold>`)
/// and must validate operand lengths on every call.
pub trait StateManifold: Send + Sync {
    /// Ambient dimension.
    fn nx(&self) -> usize;

    /// Tangent dimension.
    fn ndx(&self) -> usize;

    fn nq(&self) -> usize;

    fn nv(&self) -> usize;

    /// Neutral point.
    fn zero(&self) -> DVector<f64>;

    /// Random valid point.
    fn rand(&self) -> DVector<f64>;

    /// `out = x ⊕ dx`
    fn integrate(&self, x: &DVector<f64>, dx: &DVector<f64>, out: &mut DVector<f64>)
        -> ModelResult<()>;

    /// `out = x1 ⊖ x0`
    fn difference(&self, x0: &DVector<f64>, x1: &DVector<f64>, out: &mut DVector<f64>)
        -> ModelResult<()>;

    /// Jacobians of `integrate` with respect to `x` (first) and `dx` (second),
    /// combined into the destinations according to `op`.
    fn jintegrate(
        &self,
        x: &DVector<f64>,
        dx: &DVector<f64>,
        jfirst: &mut DMatrix<f64>,
        jsecond: &mut DMatrix<f64>,
        which: Jcomponent,
        op: AssignmentOp,
    ) -> ModelResult<()>;

    /// Jacobians of `difference` with respect to `x0` (first) and `x1` (second).
    fn jdiff(
        &self,
        x0: &DVector<f64>,
        x1: &DVector<f64>,
        jfirst: &mut DMatrix<f64>,
        jsecond: &mut DMatrix<f64>,
        which: Jcomponent,
    ) -> ModelResult<()>;

    fn integrated(&self, x: &DVector<f64>, dx: &DVector<f64>) -> ModelResult<DVector<f64>> {
        let mut out = DVector::zeros(self.nx());
        self.integrate(x, dx, &mut out)?;
        Ok(out)
    }

    fn differenced(&self, x0: &DVector<f64>, x1: &DVector<f64>) -> ModelResult<DVector<f64>> {
        let mut out = DVector::zeros(self.ndx());
        self.difference(x0, x1, &mut out)?;
        Ok(out)
    }
}

/// Euclidean state `R^nx`.
#[derive(Debug, Clone, PartialEq)]
pub struct StateVector {
    nx: usize,
}

impl StateVector {
    pub fn new(nx: usize) -> ModelResult<Self> {
        if nx == 0 {
            return Err(ModelError::InvalidConfiguration(
                "state dimension must be positive".into(),
            ));
        }
        Ok(Self { nx })
    }

    fn check_jacobian(&self, what: &'static str, j: &DMatrix<f64>) -> ModelResult<()> {
        check_shape(what, j, self.nx, self.nx)
    }
}

impl StateManifold for StateVector {
    fn nx(&self) -> usize {
        self.nx
    }

    fn ndx(&self) -> usize {
        self.nx
    }

    fn nq(&self) -> usize {
        self.nx
    }

    fn nv(&self) -> usize {
        0
    }

    fn zero(&self) -> DVector<f64> {
        DVector::zeros(self.nx)
    }

    fn rand(&self) -> DVector<f64> {
        let mut rng = rand::thread_rng();
        DVector::from_fn(self.nx, |_, _| rng.gen_range(-1.0..1.0))
    }

    fn integrate(
        &self,
        x: &DVector<f64>,
        dx: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> ModelResult<()> {
        check_len("x", x, self.nx)?;
        check_len("dx", dx, self.nx)?;
        check_len("xout", out, self.nx)?;
        out.copy_from(x);
        *out += dx;
        Ok(())
    }

    fn difference(
        &self,
        x0: &DVector<f64>,
        x1: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> ModelResult<()> {
        check_len("x0", x0, self.nx)?;
        check_len("x1", x1, self.nx)?;
        check_len("dxout", out, self.nx)?;
        out.copy_from(x1);
        *out -= x0;
        Ok(())
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
        check_len("x", x, self.nx)?;
        check_len("dx", dx, self.nx)?;
        if which.first() {
            self.check_jacobian("Jfirst", jfirst)?;
            op.assign_identity(jfirst, 1.0);
        }
        if which.second() {
            self.check_jacobian("Jsecond", jsecond)?;
            op.assign_identity(jsecond, 1.0);
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
        check_len("x0", x0, self.nx)?;
        check_len("x1", x1, self.nx)?;
        if which.first() {
            self.check_jacobian("Jfirst", jfirst)?;
            AssignmentOp::SetTo.assign_identity(jfirst, -1.0);
        }
        if which.second() {
            self.check_jacobian("Jsecond", jsecond)?;
            AssignmentOp::SetTo.assign_identity(jsecond, 1.0);
        }
        Ok(())
    }
}

/// Configuration/velocity state `x = [q; v]` of a kinematic model.
///
/// Free-flyer joints integrate their translation in the world frame and their
/// orientation on SO(3) (`R ← R·Exp(ω)`), spherical joints on SO(3) only.
/// Tangent vectors are `dx = [dq; dv]` with `dq` in velocity coordinates.
#[derive(Debug, Clone)]
pub struct StateMultibody {
    model: Arc<KinematicModel>,
}

impl StateMultibody {
    pub fn new(model: Arc<KinematicModel>) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &Arc<KinematicModel> {
        &self.model
    }

    fn check_jacobian(&self, what: &'static str, j: &DMatrix<f64>) -> ModelResult<()> {
        let ndx = self.ndx();
        check_shape(what, j, ndx, ndx)
    }

    /// Writes the block-diagonal integrate Jacobians of the configuration part.
    fn jintegrate_q(
        &self,
        dx: &DVector<f64>,
        j: &mut DMatrix<f64>,
        first: bool,
        op: AssignmentOp,
    ) {
        for (joint, _, iv) in self.model.joint_offsets() {
            match joint {
                JointModel::FreeFlyer => {
                    op.assign_identity(&mut j.fixed_view_mut::<3, 3>(iv, iv), 1.0);
                    let w = vector3_at(dx, iv + 3);
                    let block = if first {
                        exp3(&w).to_rotation_matrix().matrix().transpose()
                    } else {
                        right_jacobian(&w)
                    };
                    op.assign(&mut j.fixed_view_mut::<3, 3>(iv + 3, iv + 3), &block);
                }
                JointModel::Spherical => {
                    let w = vector3_at(dx, iv);
                    let block = if first {
                        exp3(&w).to_rotation_matrix().matrix().transpose()
                    } else {
                        right_jacobian(&w)
                    };
                    op.assign(&mut j.fixed_view_mut::<3, 3>(iv, iv), &block);
                }
                JointModel::Revolute | JointModel::Prismatic => {
                    op.assign_identity(&mut j.fixed_view_mut::<1, 1>(iv, iv), 1.0);
                }
            }
        }
    }

    /// Writes the block-diagonal difference Jacobians of the configuration part.
    fn jdiff_q(&self, x0: &DVector<f64>, x1: &DVector<f64>, j: &mut DMatrix<f64>, first: bool) {
        let sign = if first { -1.0 } else { 1.0 };
        for (joint, iq, iv) in self.model.joint_offsets() {
            match joint {
                JointModel::FreeFlyer => {
                    AssignmentOp::SetTo.assign_identity(&mut j.fixed_view_mut::<3, 3>(iv, iv), sign);
                    let w = log3(&(quaternion_at(x0, iq + 3).inverse() * quaternion_at(x1, iq + 3)));
                    j.fixed_view_mut::<3, 3>(iv + 3, iv + 3)
                        .copy_from(&jdiff_block(&w, first));
                }
                JointModel::Spherical => {
                    let w = log3(&(quaternion_at(x0, iq).inverse() * quaternion_at(x1, iq)));
                    j.fixed_view_mut::<3, 3>(iv, iv)
                        .copy_from(&jdiff_block(&w, first));
                }
                JointModel::Revolute | JointModel::Prismatic => {
                    j[(iv, iv)] = sign;
                }
            }
        }
    }
}

impl StateManifold for StateMultibody {
    fn nx(&self) -> usize {
        self.model.nq() + self.model.nv()
    }

    fn ndx(&self) -> usize {
        2 * self.model.nv()
    }

    fn nq(&self) -> usize {
        self.model.nq()
    }

    fn nv(&self) -> usize {
        self.model.nv()
    }

    fn zero(&self) -> DVector<f64> {
        let mut x = DVector::zeros(self.nx());
        for (joint, iq, _) in self.model.joint_offsets() {
            match joint {
                JointModel::FreeFlyer => x[iq + 6] = 1.0,
                JointModel::Spherical => x[iq + 3] = 1.0,
                JointModel::Revolute | JointModel::Prismatic => {}
            }
        }
        x
    }

    fn rand(&self) -> DVector<f64> {
        let mut rng = rand::thread_rng();
        let mut x = DVector::from_fn(self.nx(), |_, _| rng.gen_range(-1.0..1.0));
        for (joint, iq, _) in self.model.joint_offsets() {
            let quat_at = match joint {
                JointModel::FreeFlyer => iq + 3,
                JointModel::Spherical => iq,
                JointModel::Revolute | JointModel::Prismatic => continue,
            };
            let axis = Vector3::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            );
            write_quaternion(&mut x, quat_at, &exp3(&axis));
        }
        x
    }

    fn integrate(
        &self,
        x: &DVector<f64>,
        dx: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> ModelResult<()> {
        let (nq, nv) = (self.nq(), self.nv());
        check_len("x", x, self.nx())?;
        check_len("dx", dx, self.ndx())?;
        check_len("xout", out, self.nx())?;

        for (joint, iq, iv) in self.model.joint_offsets() {
            match joint {
                JointModel::FreeFlyer => {
                    for k in 0..3 {
                        out[iq + k] = x[iq + k] + dx[iv + k];
                    }
                    let rotated = quaternion_at(x, iq + 3) * exp3(&vector3_at(dx, iv + 3));
                    write_quaternion(out, iq + 3, &rotated);
                }
                JointModel::Spherical => {
                    let rotated = quaternion_at(x, iq) * exp3(&vector3_at(dx, iv));
                    write_quaternion(out, iq, &rotated);
                }
                JointModel::Revolute | JointModel::Prismatic => {
                    out[iq] = x[iq] + dx[iv];
                }
            }
        }
        for k in 0..nv {
            out[nq + k] = x[nq + k] + dx[nv + k];
        }
        Ok(())
    }

    fn difference(
        &self,
        x0: &DVector<f64>,
        x1: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> ModelResult<()> {
        let (nq, nv) = (self.nq(), self.nv());
        check_len("x0", x0, self.nx())?;
        check_len("x1", x1, self.nx())?;
        check_len("dxout", out, self.ndx())?;

        for (joint, iq, iv) in self.model.joint_offsets() {
            match joint {
                JointModel::FreeFlyer => {
                    for k in 0..3 {
                        out[iv + k] = x1[iq + k] - x0[iq + k];
                    }
                    let w = log3(&(quaternion_at(x0, iq + 3).inverse() * quaternion_at(x1, iq + 3)));
                    out.fixed_rows_mut::<3>(iv + 3).copy_from(&w);
                }
                JointModel::Spherical => {
                    let w = log3(&(quaternion_at(x0, iq).inverse() * quaternion_at(x1, iq)));
                    out.fixed_rows_mut::<3>(iv).copy_from(&w);
                }
                JointModel::Revolute | JointModel::Prismatic => {
                    out[iv] = x1[iq] - x0[iq];
                }
            }
        }
        for k in 0..nv {
            out[nv + k] = x1[nq + k] - x0[nq + k];
        }
        Ok(())
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
        let nv = self.nv();
        check_len("x", x, self.nx())?;
        check_len("dx", dx, self.ndx())?;
        if which.first() {
            self.check_jacobian("Jfirst", jfirst)?;
            if op == AssignmentOp::SetTo {
                jfirst.fill(0.0);
            }
            self.jintegrate_q(dx, jfirst, true, op);
            op.assign_identity(&mut jfirst.view_mut((nv, nv), (nv, nv)), 1.0);
        }
        if which.second() {
            self.check_jacobian("Jsecond", jsecond)?;
            if op == AssignmentOp::SetTo {
                jsecond.fill(0.0);
            }
            self.jintegrate_q(dx, jsecond, false, op);
            op.assign_identity(&mut jsecond.view_mut((nv, nv), (nv, nv)), 1.0);
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
        let nv = self.nv();
        check_len("x0", x0, self.nx())?;
        check_len("x1", x1, self.nx())?;
        if which.first() {
            self.check_jacobian("Jfirst", jfirst)?;
            jfirst.fill(0.0);
            self.jdiff_q(x0, x1, jfirst, true);
            AssignmentOp::SetTo.assign_identity(&mut jfirst.view_mut((nv, nv), (nv, nv)), -1.0);
        }
        if which.second() {
            self.check_jacobian("Jsecond", jsecond)?;
            jsecond.fill(0.0);
            self.jdiff_q(x0, x1, jsecond, false);
            AssignmentOp::SetTo.assign_identity(&mut jsecond.view_mut((nv, nv), (nv, nv)), 1.0);
        }
        Ok(())
    }
}

// --- SO(3) helpers ---

const SMALL_ANGLE: f64 = 1e-5;

/// Reads an `[x, y, z, w]` quaternion starting at `at`.
fn quaternion_at(x: &DVector<f64>, at: usize) -> UnitQuaternion<f64> {
    UnitQuaternion::from_quaternion(Quaternion::new(x[at + 3], x[at], x[at + 1], x[at + 2]))
}

fn write_quaternion(out: &mut DVector<f64>, at: usize, q: &UnitQuaternion<f64>) {
    let coords = &q.quaternion().coords;
    for k in 0..4 {
        out[at + k] = coords[k];
    }
}

fn vector3_at(v: &DVector<f64>, at: usize) -> Vector3<f64> {
    Vector3::new(v[at], v[at + 1], v[at + 2])
}

fn exp3(w: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*w)
}

/// Rotation vector of `q`, accurate for small angles.
fn log3(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    let quat = q.quaternion();
    let (w, v) = if quat.scalar() >= 0.0 {
        (quat.scalar(), quat.imag())
    } else {
        (-quat.scalar(), -quat.imag())
    };
    let vn = v.norm();
    if vn < 1e-12 {
        return v * (2.0 / w);
    }
    let theta = 2.0 * vn.atan2(w);
    v * (theta / vn)
}

fn right_jacobian(w: &Vector3<f64>) -> Matrix3<f64> {
    let theta = w.norm();
    let wx = w.cross_matrix();
    let wx2 = wx * wx;
    if theta < SMALL_ANGLE {
        return Matrix3::identity() - wx * 0.5 + wx2 * (1.0 / 6.0);
    }
    let theta2 = theta * theta;
    Matrix3::identity() - wx * ((1.0 - theta.cos()) / theta2)
        + wx2 * ((theta - theta.sin()) / (theta2 * theta))
}

fn right_jacobian_inv(w: &Vector3<f64>) -> Matrix3<f64> {
    let theta = w.norm();
    let wx = w.cross_matrix();
    let wx2 = wx * wx;
    if theta < SMALL_ANGLE {
        return Matrix3::identity() + wx * 0.5 + wx2 * (1.0 / 12.0);
    }
    let theta2 = theta * theta;
    let coeff = 1.0 / theta2 - (1.0 + theta.cos()) / (2.0 * theta * theta.sin());
    Matrix3::identity() + wx * 0.5 + wx2 * coeff
}

/// `d Log(R0ᵗR1) / dR0 = -Jl⁻¹(ω)`, `d Log(R0ᵗR1) / dR1 = Jr⁻¹(ω)`.
fn jdiff_block(w: &Vector3<f64>, first: bool) -> Matrix3<f64> {
    if first {
        -right_jacobian_inv(&(-w))
    } else {
        right_jacobian_inv(w)
    }
}

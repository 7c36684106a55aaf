//! Kinematic topology consumed by multibody states and actuation models.
//!
//! Rigid-body kinematics and dynamics live outside this crate. What the models
//! here need from them is the joint layout: how many configuration and velocity
//! coordinates each joint contributes and what kind of joint comes first.

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// Joint kinds supported by [`crate::state::StateMultibody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JointModel {
    /// 6-DoF floating base: position and `[x, y, z, w]` quaternion.
    FreeFlyer,
    /// 3-DoF ball joint: `[x, y, z, w]` quaternion.
    Spherical,
    Revolute,
    Prismatic,
}

impl JointModel {
    pub fn nq(&self) -> usize {
        match self {
            JointModel::FreeFlyer => 7,
            JointModel::Spherical => 4,
            JointModel::Revolute | JointModel::Prismatic => 1,
        }
    }

    pub fn nv(&self) -> usize {
        match self {
            JointModel::FreeFlyer => 6,
            JointModel::Spherical => 3,
            JointModel::Revolute | JointModel::Prismatic => 1,
        }
    }

    pub fn shortname(&self) -> &'static str {
        match self {
            JointModel::FreeFlyer => "JointModelFreeFlyer",
            JointModel::Spherical => "JointModelSpherical",
            JointModel::Revolute => "JointModelRevolute",
            JointModel::Prismatic => "JointModelPrismatic",
        }
    }
}

/// Ordered joint list with cached coordinate counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<JointModel>", into = "Vec<JointModel>")]
pub struct KinematicModel {
    joints: Vec<JointModel>,
    nq: usize,
    nv: usize,
}

impl KinematicModel {
    pub fn new(joints: Vec<JointModel>) -> ModelResult<Self> {
        if joints.is_empty() {
            return Err(ModelError::InvalidConfiguration(
                "kinematic model needs at least one joint".into(),
            ));
        }
        let nq = joints.iter().map(JointModel::nq).sum();
        let nv = joints.iter().map(JointModel::nv).sum();
        Ok(Self { joints, nq, nv })
    }

    /// A free-flyer base followed by `n_revolute` revolute joints.
    pub fn floating(n_revolute: usize) -> Self {
        let mut joints = Vec::with_capacity(n_revolute + 1);
        joints.push(JointModel::FreeFlyer);
        joints.extend(std::iter::repeat(JointModel::Revolute).take(n_revolute));
        let nq = 7 + n_revolute;
        let nv = 6 + n_revolute;
        Self { joints, nq, nv }
    }

    pub fn joints(&self) -> &[JointModel] {
        &self.joints
    }

    pub fn first_joint(&self) -> JointModel {
        self.joints[0]
    }

    pub fn nq(&self) -> usize {
        self.nq
    }

    pub fn nv(&self) -> usize {
        self.nv
    }

    /// Iterates `(joint, idx_q, idx_v)` in joint order.
    pub fn joint_offsets(&self) -> impl Iterator<Item = (JointModel, usize, usize)> + '_ {
        self.joints.iter().scan((0usize, 0usize), |(iq, iv), joint| {
            let item = (*joint, *iq, *iv);
            *iq += joint.nq();
            *iv += joint.nv();
            Some(item)
        })
    }
}

impl TryFrom<Vec<JointModel>> for KinematicModel {
    type Error = ModelError;

    fn try_from(joints: Vec<JointModel>) -> Result<Self, Self::Error> {
        Self::new(joints)
    }
}

impl From<KinematicModel> for Vec<JointModel> {
    fn from(model: KinematicModel) -> Self {
        model.joints
    }
}

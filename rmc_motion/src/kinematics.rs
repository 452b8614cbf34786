//! The kinematics seam.
//!
//! The motion loop talks to the machine geometry through this trait
//! only; a machine-specific implementation is injected at init. The
//! identity mapping (joint i == pose component i) is the default and
//! the only one shipped here.

use thiserror::Error;

use rmc_common::pose::{Pose, MAX_JOINTS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KinError {
    #[error("pose out of reach")]
    OutOfReach,
    #[error("singular configuration")]
    Singular,
}

/// Machine geometry classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KinematicsKind {
    /// Joints and world coordinates coincide; forward and inverse are
    /// both trivial and always defined.
    Identity,
    /// Forward is cheap, inverse may fail.
    Serial,
    /// Inverse is cheap, forward may fail.
    Parallel,
    Custom,
}

/// Forward/inverse mapping between joint space and Cartesian space.
pub trait Kinematics: Send {
    /// Joint positions → world pose.
    fn forward(&self, joints: &[f64; MAX_JOINTS]) -> Result<Pose, KinError>;

    /// World pose → joint positions. Implementations may use the
    /// incoming `joints` values as a solution hint and must leave
    /// them untouched on failure.
    fn inverse(&self, pose: &Pose, joints: &mut [f64; MAX_JOINTS]) -> Result<(), KinError>;

    fn kind(&self) -> KinematicsKind;
}

/// Trivial 1:1 kinematics.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityKins;

impl Kinematics for IdentityKins {
    fn forward(&self, joints: &[f64; MAX_JOINTS]) -> Result<Pose, KinError> {
        Ok(Pose::from_joints(joints))
    }

    fn inverse(&self, pose: &Pose, joints: &mut [f64; MAX_JOINTS]) -> Result<(), KinError> {
        *joints = pose.to_array();
        Ok(())
    }

    fn kind(&self) -> KinematicsKind {
        KinematicsKind::Identity
    }
}

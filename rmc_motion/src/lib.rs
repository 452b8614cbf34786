//! The servo domain: everything between the command channel and the
//! step ring.
//!
//! [`control::MotionLoop`] is the per-servo-tick orchestrator. It
//! drains commands, scans I/O, dispatches on motion mode (free /
//! coordinated / teleop), runs following-error and limit policy on
//! every joint, and feeds the step ring. The supporting modules are
//! the per-joint state ([`joint`]), the per-joint trapezoidal planner
//! ([`free`]), the homing state machine ([`homing`]), the cubic
//! servo-rate interpolator ([`cubic`]), the blended trajectory queue
//! ([`traj`]), and the kinematics seam ([`kinematics`]).

pub mod command;
pub mod comp;
pub mod control;
pub mod cubic;
pub mod error;
pub mod free;
pub mod homing;
pub mod joint;
pub mod kinematics;
pub mod segment;
pub mod traj;

pub use control::{IoInputs, JointIo, MotionLoop};
pub use error::MotionErrorKind;
pub use kinematics::{IdentityKins, Kinematics, KinematicsKind};

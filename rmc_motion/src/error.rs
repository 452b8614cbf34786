//! Motion-domain error classification.

use thiserror::Error;

/// Why motion dropped into the error state. Reported in status and on
/// the operator ring; cleared by the next enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MotionErrorKind {
    #[error("joint {0} following error")]
    FollowingError(usize),
    #[error("joint {0} hard limit")]
    HardLimit(usize),
    #[error("joint {0} soft limit")]
    SoftLimit(usize),
    #[error("joint {0} amp fault")]
    AmpFault(usize),
    #[error("kinematics cannot reach target")]
    Kinematics,
    #[error("enable input dropped")]
    EnableLost,
    #[error("trajectory aborted")]
    Aborted,
}

/// Errors returned by command processing before anything is enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandReject {
    #[error("joint {0} out of range")]
    BadJoint(usize),
    #[error("jog rejected: {0}")]
    JogRejected(&'static str),
    #[error("command requires coordinated mode")]
    NotCoordMode,
    #[error("command requires free mode")]
    NotFreeMode,
    #[error("command requires teleop mode")]
    NotTeleopMode,
    #[error("all joints must be homed first")]
    NotHomed,
    #[error("trajectory queue full")]
    QueueFull,
    #[error("rigid tap requires spindle sync mode")]
    TapWithoutSync,
    #[error("motion not enabled")]
    NotEnabled,
    #[error("compensation entries must be in ascending nominal order")]
    CompOutOfOrder,
    #[error("value out of range")]
    OutOfRange,
}

//! Motion command channel payloads (task → servo).
//!
//! Every command is one fixed-layout `MotionCommand` value. The enum
//! is `#[repr(C, u16)]`: the leading `u16` discriminant is the wire
//! `type` field, and the whole value is plain-old-data so the channel
//! can publish it with a single copy. The carrying message adds the
//! serial number (see `rmc_channel`).

use bitflags::bitflags;

use crate::pose::{Cart, Pose};

bitflags! {
    /// Which runtime multipliers apply to a geometric segment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SegmentEnables: u8 {
        /// Operator feed override scales velocity.
        const FEED_OVERRIDE    = 0x01;
        /// Operator spindle override scales spindle-synced feed.
        const SPINDLE_OVERRIDE = 0x02;
        /// Feed-hold input pauses the segment.
        const FEED_HOLD        = 0x04;
        /// Adaptive-feed input scales velocity.
        const ADAPTIVE_FEED    = 0x08;
    }
}

bitflags! {
    /// Per-joint homing behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HomeFlags: u8 {
        /// Latch on the encoder index pulse after the switch.
        const USE_INDEX     = 0x01;
        /// Limit switches are ignored while homing (shared switch).
        const IGNORE_LIMITS = 0x02;
        /// The home input is shared with other joints.
        const IS_SHARED     = 0x04;
    }
}

/// Classification tag carried by geometric segments, surfaced in
/// status so the operator display can tell a rapid from a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MotionType {
    Traverse = 1,
    Feed = 2,
    Arc = 3,
    ToolChange = 4,
    Probing = 5,
}

impl MotionType {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Traverse),
            2 => Some(Self::Feed),
            3 => Some(Self::Arc),
            4 => Some(Self::ToolChange),
            5 => Some(Self::Probing),
            _ => None,
        }
    }
}

/// How consecutive segments terminate/blend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TermCond {
    /// Decelerate to rest at every segment boundary.
    ExactStop = 0,
    /// Corner at the speed the geometry allows, no deviation.
    ExactPath = 1,
    /// Blend within a position tolerance.
    Blend = 2,
}

impl TermCond {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ExactStop),
            1 => Some(Self::ExactPath),
            2 => Some(Self::Blend),
            _ => None,
        }
    }
}

impl Default for TermCond {
    fn default() -> Self {
        Self::ExactStop
    }
}

/// Arguments shared by straight feeds and traverses.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct LineArgs {
    pub end: Pose,
    pub motion_type: MotionType,
    pub id: i32,
    pub vel: f64,
    pub ini_maxvel: f64,
    pub acc: f64,
    pub enables: SegmentEnables,
}

/// Arc segment arguments. `turn` counts full revolutions: 0 is the
/// short way round, ±n adds n full circles, sign selects direction.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct CircleArgs {
    pub end: Pose,
    pub center: Cart,
    pub normal: Cart,
    pub turn: i32,
    pub id: i32,
    pub vel: f64,
    pub ini_maxvel: f64,
    pub acc: f64,
    pub enables: SegmentEnables,
}

/// Rigid tap: feed to `end` synchronized to the spindle, reverse when
/// reached, return to the start point.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct RigidTapArgs {
    pub end: Pose,
    pub id: i32,
    pub vel: f64,
    pub ini_maxvel: f64,
    pub acc: f64,
}

/// Probe move: linear feed that aborts and latches position when the
/// probe input trips.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct ProbeArgs {
    pub end: Pose,
    pub motion_type: MotionType,
    pub id: i32,
    pub vel: f64,
    pub ini_maxvel: f64,
    pub acc: f64,
}

/// Per-joint homing parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct HomingParams {
    pub joint: u8,
    /// Final position commanded after homing completes.
    pub home: f64,
    /// Where the home switch/index reads on the motor scale.
    pub offset: f64,
    pub search_vel: f64,
    pub latch_vel: f64,
    pub flags: HomeFlags,
    /// Joints with equal sequence home together; batches run in
    /// ascending order. Negative joins the preceding batch.
    pub sequence: i8,
}

/// Synchronized digital output: set `start` at segment start and
/// `end` at segment completion, or apply immediately when `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SyncDoutArgs {
    pub index: u8,
    pub start: bool,
    pub end: bool,
    pub now: bool,
}

/// Synchronized analog output.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct SyncAoutArgs {
    pub index: u8,
    pub start: f64,
    pub end: f64,
    pub now: bool,
}

/// Spindle-on arguments: commanded speed, constant-surface-speed
/// factor, and the X offset used by the css computation.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct SpindleOnArgs {
    pub speed: f64,
    pub css_factor: f64,
    pub x_offset: f64,
}

/// One compensation-table entry for a joint.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct CompEntryArgs {
    pub joint: u8,
    pub nominal: f64,
    pub forward_trim: f64,
    pub reverse_trim: f64,
}

/// The motion command set. Discriminants are the wire `type` codes.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C, u16)]
pub enum MotionCommand {
    /// Decelerate everything to rest and flush the queue.
    Abort = 1,
    /// Stop one joint's free-mode motion.
    JointAbort { joint: u8 } = 2,
    Enable = 3,
    Disable = 4,
    /// Switch to per-joint (jog/home) planning.
    Free = 5,
    /// Switch to the coordinated trajectory queue; all joints must be
    /// homed.
    Coord = 6,
    /// Switch to Cartesian velocity jogging.
    Teleop = 7,
    SetNumJoints { joints: u8 } = 8,
    SetWorldHome { home: Pose } = 9,
    SetHomingParams(HomingParams) = 10,
    OverrideLimits { joint: i8 } = 11,
    SetMotorOffset { joint: u8, offset: f64 } = 12,
    SetPositionLimits { joint: u8, min: f64, max: f64 } = 13,
    SetBacklash { joint: u8, backlash: f64 } = 14,
    SetMaxFerror { joint: u8, ferror: f64 } = 15,
    SetMinFerror { joint: u8, ferror: f64 } = 16,
    JogCont { joint: u8, vel: f64 } = 17,
    JogIncr { joint: u8, vel: f64, incr: f64 } = 18,
    JogAbs { joint: u8, vel: f64, pos: f64 } = 19,
    SetTermCond { cond: TermCond, tolerance: f64 } = 20,
    /// Feed-per-revolution for following segments; 0 disables sync.
    SetSpindleSync { feed_per_rev: f64, wait_for_index: bool } = 21,
    SetLine(LineArgs) = 22,
    SetCircle(CircleArgs) = 23,
    SetRigidTap(RigidTapArgs) = 24,
    SetProbe(ProbeArgs) = 25,
    ClearProbeFlag = 26,
    Pause = 27,
    Resume = 28,
    /// Resume until the active interpreter line id changes.
    Step = 29,
    FeedScale { scale: f64 } = 30,
    SpindleScale { scale: f64 } = 31,
    FhEnable { enable: bool } = 32,
    FsEnable { enable: bool } = 33,
    SsEnable { enable: bool } = 34,
    AfEnable { enable: bool } = 35,
    SetVel { vel: f64, ini_maxvel: f64 } = 36,
    SetVelLimit { vel: f64 } = 37,
    SetAcc { acc: f64 } = 38,
    SetJointVelLimit { joint: u8, vel: f64 } = 39,
    SetJointAccLimit { joint: u8, acc: f64 } = 40,
    ActivateJoint { joint: u8 } = 41,
    DeactivateJoint { joint: u8 } = 42,
    EnableAmplifier { joint: u8 } = 43,
    DisableAmplifier { joint: u8 } = 44,
    Home { joint: u8 } = 45,
    SetAout(SyncAoutArgs) = 46,
    SetDout(SyncDoutArgs) = 47,
    SetSpindle(SpindleOnArgs) = 48,
    SpindleOff = 49,
    SpindleIncrease = 50,
    SpindleDecrease = 51,
    SpindleBrakeEngage = 52,
    SpindleBrakeRelease = 53,
    SetTeleopVector { vector: Pose } = 54,
    SetJointComp(CompEntryArgs) = 55,
    EnableWatchdog { timeout_ns: i64 } = 56,
    DisableWatchdog = 57,
}

impl MotionCommand {
    /// The wire `type` code (the enum discriminant).
    #[inline]
    pub fn code(&self) -> u16 {
        // repr(C, u16) lays the discriminant out first.
        unsafe { *(self as *const Self as *const u16) }
    }

    /// Commands that bypass the outstanding-echo check when published.
    #[inline]
    pub fn is_urgent(&self) -> bool {
        matches!(
            self,
            Self::Abort | Self::JointAbort { .. } | Self::Disable
        )
    }
}

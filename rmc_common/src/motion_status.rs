//! Motion status snapshot (servo → task).
//!
//! The servo loop assembles one `MotionStatus` per tick and publishes
//! it by double-buffer swap. The struct is `#[repr(C)]` POD: readers
//! on the other side of the channel get a torn-read-protected copy.

use bitflags::bitflags;
use static_assertions::const_assert;

use crate::pose::{Pose, MAX_JOINTS};
use crate::task_state::MotionMode;

bitflags! {
    /// Per-joint status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct JointFlags: u16 {
        /// Joint is configured and participating in motion.
        const ACTIVE          = 0x0001;
        /// Servo/amp enabled.
        const ENABLED         = 0x0002;
        /// Within the in-position band of its commanded position.
        const IN_POSITION     = 0x0004;
        /// Homing sequence in progress.
        const HOMING          = 0x0008;
        /// Homing completed since last unhome.
        const HOMED           = 0x0010;
        /// Following error tripped.
        const FERROR          = 0x0020;
        /// Positive hard limit input active.
        const POS_HARD_LIMIT  = 0x0040;
        /// Negative hard limit input active.
        const NEG_HARD_LIMIT  = 0x0080;
        /// Commanded position clamped at the positive soft limit.
        const POS_SOFT_LIMIT  = 0x0100;
        /// Commanded position clamped at the negative soft limit.
        const NEG_SOFT_LIMIT  = 0x0200;
        /// Amp fault input active.
        const FAULT           = 0x0400;
        /// Any error condition on this joint.
        const ERROR           = 0x0800;
        /// Soft limits are overridden (homing or operator override).
        const OVERRIDE_LIMITS = 0x1000;
    }
}

impl JointFlags {
    /// Flags that put the whole motion controller into error.
    pub const ERROR_MASK: Self = Self::from_bits_truncate(
        Self::FERROR.bits() | Self::FAULT.bits() | Self::ERROR.bits(),
    );
}

bitflags! {
    /// Controller-wide status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MotionFlags: u16 {
        const ENABLED        = 0x0001;
        /// All joints in position and queues empty.
        const IN_POSITION    = 0x0002;
        /// Coordinated queue active (segments queued or executing).
        const QUEUE_ACTIVE   = 0x0004;
        /// Any error latched since last enable.
        const ERROR          = 0x0008;
        /// Trajectory paused.
        const PAUSED         = 0x0010;
        /// Stepgen reported a ring underrun since last clear.
        const UNDERRUN       = 0x0020;
        /// Watchdog output toggling.
        const WATCHDOG       = 0x0040;
    }
}

/// Per-joint slice of the status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C)]
pub struct JointStatus {
    pub flags: JointFlags,
    /// Commanded joint position [units].
    pub pos_cmd: f64,
    /// Feedback joint position [units].
    pub pos_fb: f64,
    /// Commanded velocity [units/s].
    pub vel_cmd: f64,
    /// Motor-space commanded position (joint + backlash + offset).
    pub motor_pos_cmd: f64,
    /// Motor-space feedback position.
    pub motor_pos_fb: f64,
    /// Current following error.
    pub ferror: f64,
    /// Limit the following error is currently compared against.
    pub ferror_limit: f64,
    /// Largest following error seen since last clear.
    pub ferror_high_mark: f64,
    /// Raw step counter from the pulse generator.
    pub step_count: i64,
    /// Step-space position error reported by the pulse generator.
    pub pos_error_steps: i32,
    pub _pad: u32,
}

/// Spindle slice of the status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C)]
pub struct SpindleStatus {
    /// Commanded speed [rev/s], signed by direction.
    pub speed: f64,
    /// Constant-surface-speed factor (0 = rpm mode).
    pub css_factor: f64,
    pub x_offset: f64,
    /// Accumulated spindle revolutions from the feedback input.
    pub revs: f64,
    pub enabled: bool,
    pub brake: bool,
    /// +1 forward, −1 reverse, 0 stopped.
    pub direction: i8,
    pub _pad: [u8; 5],
}

/// Probe slice of the status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C)]
pub struct ProbeStatus {
    /// A probe move latched the input since the flag was last cleared.
    pub tripped: bool,
    /// A probe segment is currently executing.
    pub probing: bool,
    pub input: bool,
    pub _pad: [u8; 5],
    /// Position latched at the trip.
    pub probed_pos: Pose,
}

/// Complete servo-domain status, published once per servo tick.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct MotionStatus {
    /// Serial of the last command processed (the echo).
    pub echo_serial: i32,
    /// Monotonic servo tick counter.
    pub heartbeat: u64,
    pub mode: MotionMode,
    pub flags: MotionFlags,
    pub num_joints: u8,
    pub _pad0: [u8; 3],

    /// Commanded Cartesian position (after kinematics).
    pub position: Pose,
    /// Feedback Cartesian position.
    pub actual_position: Pose,
    /// Distance to go in the active segment.
    pub dtg: f64,
    /// Current path velocity [units/s].
    pub current_vel: f64,

    /// Trajectory queue depth (segments waiting + active).
    pub queue_depth: u16,
    /// Segments currently blended/executing.
    pub active_depth: u16,
    /// Queue is full; producer must hold off.
    pub queue_full: bool,
    pub _pad1: [u8; 3],
    /// Interpreter line id of the executing segment.
    pub active_id: i32,
    /// Feed scale actually applied this tick.
    pub feed_scale: f64,
    pub spindle_scale: f64,

    pub joints: [JointStatus; MAX_JOINTS],
    pub spindle: SpindleStatus,
    pub probe: ProbeStatus,

    /// Count of stepgen underruns observed.
    pub underruns: u32,
    /// Count of commands dropped at the channel (echo timeout).
    pub dropped_commands: u32,
    /// Motion-level error latched; cleared by enable.
    pub motion_error: bool,
    /// All homing sequences complete.
    pub all_homed: bool,
    pub _pad2: [u8; 6],
}

// Snapshots are copied across the channel each tick; keep the layout
// sane. The exact size is platform-stable under repr(C) with the
// explicit padding above.
const_assert!(core::mem::size_of::<MotionStatus>() < 2048);

impl Default for MotionStatus {
    fn default() -> Self {
        Self {
            echo_serial: 0,
            heartbeat: 0,
            mode: MotionMode::Free,
            flags: MotionFlags::empty(),
            num_joints: 0,
            _pad0: [0; 3],
            position: Pose::ZERO,
            actual_position: Pose::ZERO,
            dtg: 0.0,
            current_vel: 0.0,
            queue_depth: 0,
            active_depth: 0,
            queue_full: false,
            _pad1: [0; 3],
            active_id: 0,
            feed_scale: 1.0,
            spindle_scale: 1.0,
            joints: [JointStatus::default(); MAX_JOINTS],
            spindle: SpindleStatus::default(),
            probe: ProbeStatus::default(),
            underruns: 0,
            dropped_commands: 0,
            motion_error: false,
            all_homed: false,
            _pad2: [0; 6],
        }
    }
}

impl MotionStatus {
    /// True when motion and its queues are at rest.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.queue_depth == 0
            && !self.flags.contains(MotionFlags::QUEUE_ACTIVE)
            && self.flags.contains(MotionFlags::IN_POSITION)
    }

    /// Joint slice, or `None` past the configured count.
    #[inline]
    pub fn joint(&self, index: usize) -> Option<&JointStatus> {
        if index < self.num_joints as usize {
            self.joints.get(index)
        } else {
            None
        }
    }
}

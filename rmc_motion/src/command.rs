//! Motion command dispatch.
//!
//! One entry per channel message, mirroring the command set in
//! `rmc_common::motion_cmd`. Rejections never fault the controller:
//! they post an operator error and leave state untouched. Guards run
//! before any state change, so a rejected command is a no-op.

use rmc_common::motion_cmd::MotionCommand;
use rmc_common::motion_status::JointFlags;
use rmc_common::task_state::MotionMode;

use crate::control::{MotionLoop, SPINDLE_SPEED_STEP};
use crate::error::CommandReject;
use crate::free::{jog_ok, JogGate};
use crate::homing;

/// Feed/spindle override ceiling.
const MAX_OVERRIDE: f64 = 10.0;

/// Home-command joint value meaning "home everything in sequence".
pub const HOME_ALL: u8 = 0xFF;

impl MotionLoop {
    /// Post a typed rejection on the operator ring.
    fn reject(&mut self, why: CommandReject) {
        self.ops.error(&why.to_string());
    }

    fn joint_ok(&mut self, joint: u8) -> Option<usize> {
        let idx = joint as usize;
        if idx < self.num_joints {
            Some(idx)
        } else {
            self.reject(CommandReject::BadJoint(idx));
            None
        }
    }

    fn jog_gate(&self, idx: usize) -> JogGate {
        let joint = &self.joints[idx];
        JogGate {
            free_mode: self.mode == MotionMode::Free,
            enabled: self.enabled && !self.motion_error,
            any_joint_homing: self.any_homing(),
            feed_scale: self.feed_scale,
            on_pos_hard_limit: joint.flags.contains(JointFlags::POS_HARD_LIMIT),
            on_neg_hard_limit: joint.flags.contains(JointFlags::NEG_HARD_LIMIT),
            at_pos_soft_limit: joint.flags.contains(JointFlags::POS_SOFT_LIMIT),
            at_neg_soft_limit: joint.flags.contains(JointFlags::NEG_SOFT_LIMIT),
        }
    }

    fn start_jog(&mut self, idx: usize, vel: f64, target: f64) {
        let direction = if target >= self.joints[idx].free.curr_pos {
            1.0
        } else {
            -1.0
        };
        match jog_ok(&self.jog_gate(idx), direction) {
            Ok(()) => {
                let joint = &mut self.joints[idx];
                joint.free.pos_cmd = target.clamp(joint.min_pos_limit, joint.max_pos_limit);
                joint.free.max_vel = vel.abs().min(joint.vel_limit);
                joint.free.enable = true;
            }
            Err(refusal) => {
                self.reject(CommandReject::JogRejected(refusal.describe()));
            }
        }
    }

    /// Guard for queue-feeding commands.
    fn coord_ok(&mut self) -> bool {
        if self.mode != MotionMode::Coord {
            self.reject(CommandReject::NotCoordMode);
            return false;
        }
        if !self.enabled || self.motion_error {
            self.reject(CommandReject::NotEnabled);
            return false;
        }
        true
    }

    /// Endpoint sanity: every joint target must be reachable and
    /// within soft limits, checked before the segment is enqueued.
    fn endpoint_ok(&mut self, end: &rmc_common::pose::Pose) -> bool {
        let mut targets = [0.0; rmc_common::pose::MAX_JOINTS];
        for (i, j) in self.joints[..self.num_joints].iter().enumerate() {
            targets[i] = j.pos_cmd;
        }
        // Identity and serial machines check inverse reachability
        // here; the per-joint limits catch the rest. A violating
        // segment never enters the queue, and the violation is a
        // motion error: the queue is flushed and the task layer holds.
        if self.kins.inverse(end, &mut targets).is_err() {
            self.ops.error("target pose is out of reach");
            self.raise_error(crate::error::MotionErrorKind::Kinematics);
            return false;
        }
        for i in 0..self.num_joints {
            let joint = &self.joints[i];
            if targets[i] < joint.min_pos_limit || targets[i] > joint.max_pos_limit {
                self.ops.error(&format!(
                    "target exceeds joint {i} limits [{}, {}]",
                    joint.min_pos_limit, joint.max_pos_limit
                ));
                self.raise_error(crate::error::MotionErrorKind::SoftLimit(i));
                return false;
            }
        }
        true
    }

    pub(crate) fn handle_command(&mut self, cmd: MotionCommand) {
        use MotionCommand as C;
        match cmd {
            C::Abort => {
                self.traj.abort();
                for joint in self.joints.iter_mut() {
                    joint.free.stop();
                    homing::home_abort(joint);
                }
                self.seq.cancel();
            }
            C::JointAbort { joint } => {
                if let Some(idx) = self.joint_ok(joint) {
                    self.joints[idx].free.stop();
                    homing::home_abort(&mut self.joints[idx]);
                }
            }
            C::Enable => {
                self.enabled = true;
                self.motion_error = false;
                self.error_kind = None;
                for joint in self.joints.iter_mut() {
                    joint.clear_faults();
                    joint.flags.insert(JointFlags::ENABLED);
                }
                self.rebase_planners();
            }
            C::Disable => self.disable_motion(),
            C::Free => {
                if self.mode != MotionMode::Free {
                    self.mode = MotionMode::Free;
                    self.rebase_planners();
                }
            }
            C::Coord => {
                if !self.all_homed() {
                    self.reject(CommandReject::NotHomed);
                } else if self.mode != MotionMode::Coord {
                    self.mode = MotionMode::Coord;
                    self.rebase_planners();
                }
            }
            C::Teleop => {
                if !self.all_homed() {
                    self.reject(CommandReject::NotHomed);
                } else if self.mode != MotionMode::Teleop {
                    self.mode = MotionMode::Teleop;
                    self.teleop_vel = rmc_common::pose::Pose::ZERO;
                    self.rebase_planners();
                }
            }
            C::SetNumJoints { joints } => {
                let n = joints as usize;
                if n >= 1 && n <= self.joints.len() {
                    self.num_joints = n;
                } else {
                    self.ops.error(&format!("cannot set {joints} joints"));
                }
            }
            C::SetWorldHome { home } => self.world_home = home,
            C::SetHomingParams(p) => {
                if let Some(idx) = self.joint_ok(p.joint) {
                    self.joints[idx].set_homing_params(
                        p.home,
                        p.offset,
                        p.search_vel,
                        p.latch_vel,
                        p.flags,
                        p.sequence,
                    );
                }
            }
            C::OverrideLimits { joint } => {
                if joint < 0 {
                    self.limit_override = false;
                    for j in self.joints.iter_mut() {
                        j.flags.remove(JointFlags::OVERRIDE_LIMITS);
                    }
                } else if let Some(idx) = self.joint_ok(joint as u8) {
                    self.limit_override = true;
                    self.joints[idx].flags.insert(JointFlags::OVERRIDE_LIMITS);
                }
            }
            C::SetMotorOffset { joint, offset } => {
                if let Some(idx) = self.joint_ok(joint) {
                    self.joints[idx].motor_offset = offset;
                }
            }
            C::SetPositionLimits { joint, min, max } => {
                if let Some(idx) = self.joint_ok(joint) {
                    if min <= max {
                        self.joints[idx].set_position_limits(min, max);
                    } else {
                        self.ops.error("min limit exceeds max limit");
                    }
                }
            }
            C::SetBacklash { joint, backlash } => {
                if let Some(idx) = self.joint_ok(joint) {
                    self.joints[idx].set_backlash(backlash);
                }
            }
            C::SetMaxFerror { joint, ferror } => {
                if let Some(idx) = self.joint_ok(joint) {
                    self.joints[idx].set_max_ferror(ferror);
                }
            }
            C::SetMinFerror { joint, ferror } => {
                if let Some(idx) = self.joint_ok(joint) {
                    self.joints[idx].set_min_ferror(ferror);
                }
            }
            C::JogCont { joint, vel } => {
                if let Some(idx) = self.joint_ok(joint) {
                    let target = if vel >= 0.0 {
                        self.joints[idx].max_pos_limit
                    } else {
                        self.joints[idx].min_pos_limit
                    };
                    self.start_jog(idx, vel, target);
                }
            }
            C::JogIncr { joint, vel, incr } => {
                if let Some(idx) = self.joint_ok(joint) {
                    // Increments accumulate onto the pending target.
                    let base = if self.joints[idx].free.enable {
                        self.joints[idx].free.pos_cmd
                    } else {
                        self.joints[idx].free.curr_pos
                    };
                    let target = base + incr * vel.signum();
                    self.start_jog(idx, vel, target);
                }
            }
            C::JogAbs { joint, vel, pos } => {
                if let Some(idx) = self.joint_ok(joint) {
                    self.start_jog(idx, vel, pos);
                }
            }
            C::SetTermCond { cond, tolerance } => self.traj.set_term_cond(cond, tolerance),
            C::SetSpindleSync {
                feed_per_rev,
                wait_for_index,
            } => self.traj.set_spindle_sync(feed_per_rev, wait_for_index),
            C::SetLine(args) => {
                if self.coord_ok() && self.endpoint_ok(&args.end) {
                    if let Err(e) = self.traj.add_line(
                        args.id,
                        args.end,
                        args.motion_type,
                        args.vel,
                        args.ini_maxvel,
                        args.acc,
                        args.enables,
                    ) {
                        self.ops.error(&e.to_string());
                    }
                }
            }
            C::SetCircle(args) => {
                if self.coord_ok() && self.endpoint_ok(&args.end) {
                    if let Err(e) = self.traj.add_circle(
                        args.id,
                        args.end,
                        args.center,
                        args.normal,
                        args.turn,
                        args.vel,
                        args.ini_maxvel,
                        args.acc,
                        args.enables,
                    ) {
                        self.ops.error(&e.to_string());
                    }
                }
            }
            C::SetRigidTap(args) => {
                if self.coord_ok() && self.endpoint_ok(&args.end) {
                    if let Err(e) = self
                        .traj
                        .add_rigid_tap(args.id, args.end, args.vel, args.ini_maxvel, args.acc)
                    {
                        self.ops.error(&e.to_string());
                    }
                }
            }
            C::SetProbe(args) => {
                if self.coord_ok() && self.endpoint_ok(&args.end) {
                    if let Err(e) = self
                        .traj
                        .add_probe(args.id, args.end, args.vel, args.ini_maxvel, args.acc)
                    {
                        self.ops.error(&e.to_string());
                    }
                }
            }
            C::ClearProbeFlag => self.traj.clear_probe_flag(),
            C::Pause => self.traj.pause(),
            C::Resume => self.traj.resume(),
            C::Step => self.traj.step(),
            C::FeedScale { scale } => {
                self.feed_scale = scale.clamp(0.0, MAX_OVERRIDE);
            }
            C::SpindleScale { scale } => {
                self.spindle_scale = scale.clamp(0.0, MAX_OVERRIDE);
            }
            C::FhEnable { enable } => self.fh_enabled = enable,
            C::FsEnable { enable } => self.fs_enabled = enable,
            C::SsEnable { enable } => self.ss_enabled = enable,
            C::AfEnable { enable } => self.af_enabled = enable,
            C::SetVel { vel, ini_maxvel } => {
                if vel > 0.0 {
                    self.vel_default = vel.min(ini_maxvel);
                }
            }
            C::SetVelLimit { vel } => self.traj.set_limits(vel, 0.0),
            C::SetAcc { acc } => self.traj.set_limits(0.0, acc),
            C::SetJointVelLimit { joint, vel } => {
                if let Some(idx) = self.joint_ok(joint) {
                    if vel > 0.0 {
                        self.joints[idx].set_max_velocity(vel);
                    }
                }
            }
            C::SetJointAccLimit { joint, acc } => {
                if let Some(idx) = self.joint_ok(joint) {
                    if acc > 0.0 {
                        self.joints[idx].set_max_acceleration(acc);
                    }
                }
            }
            C::ActivateJoint { joint } => {
                if let Some(idx) = self.joint_ok(joint) {
                    self.joints[idx].activate();
                }
            }
            C::DeactivateJoint { joint } => {
                if let Some(idx) = self.joint_ok(joint) {
                    self.joints[idx].deactivate();
                }
            }
            C::EnableAmplifier { joint } => {
                if let Some(idx) = self.joint_ok(joint) {
                    self.joints[idx].flags.insert(JointFlags::ENABLED);
                }
            }
            C::DisableAmplifier { joint } => {
                if let Some(idx) = self.joint_ok(joint) {
                    self.joints[idx].flags.remove(JointFlags::ENABLED);
                }
            }
            C::Home { joint } => {
                if self.mode != MotionMode::Free {
                    self.reject(CommandReject::NotFreeMode);
                } else if !self.enabled {
                    self.reject(CommandReject::NotEnabled);
                } else if joint == HOME_ALL {
                    self.seq.start_all(&mut self.joints[..self.num_joints]);
                } else if let Some(idx) = self.joint_ok(joint) {
                    homing::home_start(&mut self.joints[idx]);
                }
            }
            C::SetAout(args) => {
                let mut outputs = core::mem::take(&mut self.outputs);
                self.traj.set_aout(args, &mut outputs);
                self.outputs = outputs;
            }
            C::SetDout(args) => {
                let mut outputs = core::mem::take(&mut self.outputs);
                self.traj.set_dout(args, &mut outputs);
                self.outputs = outputs;
            }
            C::SetSpindle(args) => {
                self.spindle.speed = args.speed;
                self.spindle.css_factor = args.css_factor;
                self.spindle.x_offset = args.x_offset;
                self.spindle.enabled = args.speed != 0.0;
                self.spindle.brake = false;
                self.spindle.direction = if args.speed > 0.0 {
                    1
                } else if args.speed < 0.0 {
                    -1
                } else {
                    0
                };
            }
            C::SpindleOff => {
                self.spindle.speed = 0.0;
                self.spindle.enabled = false;
                self.spindle.direction = 0;
            }
            C::SpindleIncrease => {
                if self.spindle.enabled {
                    self.spindle.speed += SPINDLE_SPEED_STEP * self.spindle.direction as f64;
                }
            }
            C::SpindleDecrease => {
                if self.spindle.enabled && self.spindle.speed.abs() > SPINDLE_SPEED_STEP {
                    self.spindle.speed -= SPINDLE_SPEED_STEP * self.spindle.direction as f64;
                }
            }
            C::SpindleBrakeEngage => {
                self.spindle.brake = true;
                self.spindle.speed = 0.0;
                self.spindle.enabled = false;
                self.spindle.direction = 0;
            }
            C::SpindleBrakeRelease => self.spindle.brake = false,
            C::SetTeleopVector { vector } => {
                if self.mode == MotionMode::Teleop {
                    self.teleop_vel = vector;
                } else {
                    self.reject(CommandReject::NotTeleopMode);
                }
            }
            C::SetJointComp(args) => {
                if let Some(idx) = self.joint_ok(args.joint) {
                    if let Err(e) = self.joints[idx].comp.insert(
                        args.nominal,
                        args.forward_trim,
                        args.reverse_trim,
                    ) {
                        self.ops.error(&e.to_string());
                    }
                }
            }
            C::EnableWatchdog { timeout_ns: _ } => self.watchdog_enabled = true,
            C::DisableWatchdog => self.watchdog_enabled = false,
        }
    }
}

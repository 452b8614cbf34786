//! The servo-period motion controller.
//!
//! One [`MotionLoop::tick`] per servo period, in a fixed order: drain
//! the command channel, take the I/O snapshot, police limits and the
//! enable chain, dispatch on motion mode, run per-joint policy
//! (soft limits, backlash, compensation, following error), feed the
//! step ring with DDS adders and the ±1-step error nudge, and publish
//! the status snapshot. The loop owns every joint and the trajectory
//! queue; nothing else writes them.

use std::sync::Arc;

use tracing::info;

use rmc_channel::{CommandReader, StatusWriter};
use rmc_common::error::OperatorMsgRing;
use rmc_common::motion_cmd::MotionCommand;
use rmc_common::motion_status::{JointFlags, MotionFlags, MotionStatus};
use rmc_common::pose::{Pose, MAX_JOINTS};
use rmc_common::task_state::MotionMode;
use rmc_stepgen::fiq::PHASE_STEP;
use rmc_stepgen::ring::{RingProducer, StepSegment};
use rmc_stepgen::FiqShared;

use crate::cubic::CubicInterp;
use crate::error::MotionErrorKind;
use crate::homing::{self, HomeInputs, HomingSequencer};
use crate::joint::Joint;
use crate::kinematics::Kinematics;
use crate::traj::{TrajInputs, TrajOutputs, TrajQueue};

/// Per-joint digital inputs sampled for one tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct JointIo {
    pub pos_limit: bool,
    pub neg_limit: bool,
    pub home_switch: bool,
    pub amp_fault: bool,
}

/// Everything the servo loop reads from the outside world each tick.
#[derive(Debug, Clone, Copy)]
pub struct IoInputs {
    pub joints: [JointIo; MAX_JOINTS],
    pub probe: bool,
    /// Scanner-sync input mirrored into axis 0 step segments.
    pub scan_sync: bool,
    /// 0..1 from the adaptive-feed input.
    pub adaptive_feed: f64,
    pub feed_hold: bool,
    /// External enable chain; dropping it disables motion.
    pub enable: bool,
    /// Accumulated spindle revolutions.
    pub spindle_revs: f64,
    /// Measured spindle speed [rev/s].
    pub spindle_speed_in: f64,
}

impl Default for IoInputs {
    fn default() -> Self {
        Self {
            joints: [JointIo::default(); MAX_JOINTS],
            probe: false,
            scan_sync: false,
            adaptive_feed: 1.0,
            feed_hold: false,
            enable: true,
            spindle_revs: 0.0,
            spindle_speed_in: 0.0,
        }
    }
}

/// How motor feedback is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackMode {
    /// Open-loop step/dir: feedback echoes the motor command (the
    /// step counters close the loop separately, in step space).
    Echo,
    /// Feedback is supplied externally (tests, future encoders).
    External,
}

/// Spindle command state.
#[derive(Debug, Clone, Default)]
pub(crate) struct SpindleCtl {
    pub speed: f64,
    pub css_factor: f64,
    pub x_offset: f64,
    pub enabled: bool,
    pub brake: bool,
    /// +1 forward, −1 reverse, 0 stopped.
    pub direction: i8,
}

/// Speed step for spindle increase/decrease commands [rev/s].
pub(crate) const SPINDLE_SPEED_STEP: f64 = 1.0;

pub struct MotionLoop {
    pub(crate) joints: Vec<Joint>,
    pub(crate) num_joints: usize,
    pub(crate) traj: TrajQueue,
    cubics: Vec<CubicInterp>,
    pub(crate) kins: Box<dyn Kinematics>,
    pub(crate) mode: MotionMode,
    pub(crate) enabled: bool,
    pub(crate) motion_error: bool,
    pub(crate) error_kind: Option<MotionErrorKind>,

    pub(crate) feed_scale: f64,
    pub(crate) spindle_scale: f64,
    pub(crate) fs_enabled: bool,
    pub(crate) ss_enabled: bool,
    pub(crate) fh_enabled: bool,
    pub(crate) af_enabled: bool,

    pub(crate) limit_override: bool,
    /// A joint may mirror another joint's command: a second motor on
    /// a shared axis.
    slave_of: [Option<usize>; MAX_JOINTS],
    pub(crate) teleop_vel: Pose,
    pub(crate) world_home: Pose,
    pub(crate) seq: HomingSequencer,
    pub(crate) feedback_mode: FeedbackMode,
    pub(crate) watchdog_enabled: bool,

    pub(crate) spindle: SpindleCtl,
    pub(crate) vel_default: f64,

    cmd_rx: CommandReader<MotionCommand>,
    status_tx: StatusWriter<MotionStatus>,
    ring: Option<RingProducer>,
    fiq: Option<Arc<FiqShared>>,

    // Step-space bookkeeping per joint.
    cmd_steps: [i64; MAX_JOINTS],
    fb_delay: [u32; MAX_JOINTS],
    pos_err_old: [i32; MAX_JOINTS],

    servo_period: f64,
    traj_period: f64,
    /// Servo ticks per trajectory tick.
    interp_rate: u32,
    traj_phase: u32,
    heartbeat: u64,
    underruns: u32,
    /// Ring was full last tick; trajectory advance is held.
    waiting_for_buffer: bool,

    pub(crate) ops: OperatorMsgRing,
    pub(crate) outputs: TrajOutputs,
}

impl MotionLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        joints: Vec<Joint>,
        kins: Box<dyn Kinematics>,
        vmax: f64,
        amax: f64,
        servo_period: f64,
        interp_rate: u32,
        cmd_rx: CommandReader<MotionCommand>,
        status_tx: StatusWriter<MotionStatus>,
        ring: Option<RingProducer>,
        fiq: Option<Arc<FiqShared>>,
    ) -> Self {
        let interp_rate = interp_rate.max(1);
        let traj_period = servo_period * interp_rate as f64;
        let num_joints = joints.len().min(MAX_JOINTS);
        let cubics = (0..num_joints)
            .map(|_| CubicInterp::new(interp_rate, traj_period))
            .collect();
        Self {
            joints,
            num_joints,
            traj: TrajQueue::new(vmax, amax),
            cubics,
            kins,
            mode: MotionMode::Free,
            enabled: false,
            motion_error: false,
            error_kind: None,
            feed_scale: 1.0,
            spindle_scale: 1.0,
            fs_enabled: true,
            ss_enabled: true,
            fh_enabled: true,
            af_enabled: true,
            limit_override: false,
            slave_of: [None; MAX_JOINTS],
            teleop_vel: Pose::ZERO,
            world_home: Pose::ZERO,
            seq: HomingSequencer::new(),
            feedback_mode: FeedbackMode::Echo,
            watchdog_enabled: false,
            spindle: SpindleCtl::default(),
            vel_default: 1.0,
            cmd_rx,
            status_tx,
            ring,
            fiq,
            cmd_steps: [0; MAX_JOINTS],
            fb_delay: [0; MAX_JOINTS],
            pos_err_old: [0; MAX_JOINTS],
            servo_period,
            traj_period,
            interp_rate,
            traj_phase: 0,
            heartbeat: 0,
            underruns: 0,
            waiting_for_buffer: false,
            ops: OperatorMsgRing::new(),
            outputs: TrajOutputs::default(),
        }
    }

    #[inline]
    pub fn mode(&self) -> MotionMode {
        self.mode
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[inline]
    pub fn joints(&self) -> &[Joint] {
        &self.joints
    }

    pub fn joints_mut(&mut self) -> &mut [Joint] {
        &mut self.joints
    }

    #[inline]
    pub fn traj(&self) -> &TrajQueue {
        &self.traj
    }

    pub fn operator_msgs(&mut self) -> &mut OperatorMsgRing {
        &mut self.ops
    }

    /// Watchdog output requested; the supervisor toggles the pin.
    #[inline]
    pub fn watchdog_enabled(&self) -> bool {
        self.watchdog_enabled
    }

    /// Declare slave joints: `slave_of[j] = Some(m)` makes joint `j`
    /// follow joint `m`'s commanded position (gantry second motor).
    pub fn set_slaves(&mut self, slave_of: [Option<usize>; MAX_JOINTS]) {
        self.slave_of = slave_of;
    }

    /// Side effects accumulated since the last call (synced outputs,
    /// spindle reversal). The caller applies them to hardware.
    pub fn take_outputs(&mut self) -> TrajOutputs {
        core::mem::take(&mut self.outputs)
    }

    pub(crate) fn all_homed(&self) -> bool {
        self.active_joints().all(|j| j.is_homed())
    }

    pub(crate) fn any_homing(&self) -> bool {
        self.joints[..self.num_joints]
            .iter()
            .any(|j| j.is_homing())
    }

    fn active_joints(&self) -> impl Iterator<Item = &Joint> {
        self.joints[..self.num_joints]
            .iter()
            .filter(|j| j.is_active())
    }

    /// Latch a motion error: abort everything, flag status.
    pub(crate) fn raise_error(&mut self, kind: MotionErrorKind) {
        if !self.motion_error {
            info!(%kind, "motion error");
            self.ops.error(&kind.to_string());
        }
        self.motion_error = true;
        self.error_kind = Some(kind);
        self.traj.abort();
        for joint in self.joints.iter_mut() {
            joint.free.stop();
            homing::home_abort(joint);
        }
        self.seq.cancel();
    }

    /// Current commanded Cartesian position through forward
    /// kinematics.
    pub(crate) fn commanded_pose(&self) -> Pose {
        let mut arr = [0.0; MAX_JOINTS];
        for (i, j) in self.joints[..self.num_joints].iter().enumerate() {
            arr[i] = j.pos_cmd;
        }
        self.kins.forward(&arr).unwrap_or(Pose::ZERO)
    }

    /// Sync the planners to the joints (mode entry, after homing).
    pub(crate) fn rebase_planners(&mut self) {
        let pose = self.commanded_pose();
        self.traj.set_position(pose);
        for (i, cubic) in self.cubics.iter_mut().enumerate() {
            cubic.reset(self.joints[i].pos_cmd);
        }
        for joint in self.joints.iter_mut() {
            joint.free.set_position(joint.pos_cmd);
        }
        self.traj_phase = 0;
    }

    // ─── The servo tick ─────────────────────────────────────────────

    pub fn tick(&mut self, io: &IoInputs) {
        self.heartbeat = self.heartbeat.wrapping_add(1);

        // 1. Drain the pending command.
        if let Some((head, cmd)) = self.cmd_rx.poll() {
            self.handle_command(cmd);
            self.cmd_rx.ack(head.serial);
        }

        // 2–3. Inputs, limit and enable policing.
        self.scan_inputs(io);

        // 4. Mode dispatch → joint position commands.
        match self.mode {
            MotionMode::Coord => self.tick_coord(io),
            MotionMode::Free => self.tick_free(io),
            MotionMode::Teleop => self.tick_teleop(),
        }

        // Slave joints mirror their master's command.
        for i in 0..self.num_joints {
            if let Some(master) = self.slave_of[i] {
                if master < self.num_joints && master != i {
                    self.joints[i].pos_cmd = self.joints[master].pos_cmd;
                    self.joints[i].vel_cmd = self.joints[master].vel_cmd;
                }
            }
        }

        // 5. Per-joint policy and motor command.
        self.tick_joints();

        // 6. Feed the step ring, read back counters.
        self.tick_stepgen(io.scan_sync);

        // 7. Publish status.
        self.publish_status(io);
    }

    fn scan_inputs(&mut self, io: &IoInputs) {
        if self.enabled && !io.enable {
            self.raise_error(MotionErrorKind::EnableLost);
            self.disable_motion();
        }

        let mut hard_limit: Option<usize> = None;
        let mut fault: Option<usize> = None;
        for i in 0..self.num_joints {
            let joint = &mut self.joints[i];
            let jio = &io.joints[i];
            joint.flags.set(JointFlags::POS_HARD_LIMIT, jio.pos_limit);
            joint.flags.set(JointFlags::NEG_HARD_LIMIT, jio.neg_limit);
            joint.flags.set(JointFlags::FAULT, jio.amp_fault);
            if !joint.is_active() {
                continue;
            }
            let ignoring = joint.is_homing()
                && joint
                    .home_flags
                    .contains(rmc_common::motion_cmd::HomeFlags::IGNORE_LIMITS);
            if (jio.pos_limit || jio.neg_limit) && !self.limit_override && !ignoring {
                hard_limit = Some(i);
            }
            if jio.amp_fault {
                fault = Some(i);
            }
        }
        if let Some(i) = hard_limit {
            if self.enabled && !self.motion_error {
                self.raise_error(MotionErrorKind::HardLimit(i));
            }
        }
        if let Some(i) = fault {
            if self.enabled && !self.motion_error {
                self.raise_error(MotionErrorKind::AmpFault(i));
            }
        }
    }

    pub(crate) fn disable_motion(&mut self) {
        self.enabled = false;
        self.traj.abort();
        for joint in self.joints.iter_mut() {
            joint.free.stop();
            homing::home_abort(joint);
            joint.flags.remove(JointFlags::ENABLED);
        }
        self.seq.cancel();
    }

    fn tick_coord(&mut self, io: &IoInputs) {
        // Waiting-for-buffer micro-state: hold the planner while the
        // ring has no room.
        if let Some(ring) = &self.ring {
            let stalled = ring.free() == 0;
            self.waiting_for_buffer = stalled;
            if stalled {
                return;
            }
        }

        self.traj_phase += 1;
        if self.traj_phase >= self.interp_rate {
            self.traj_phase = 0;
            let inputs = TrajInputs {
                feed_scale: self.feed_scale,
                spindle_scale: self.spindle_scale,
                adaptive_feed: io.adaptive_feed,
                feed_hold: io.feed_hold,
                probe_input: io.probe,
                spindle_revs: io.spindle_revs,
                fs_enabled: self.fs_enabled,
                ss_enabled: self.ss_enabled,
                fh_enabled: self.fh_enabled,
                af_enabled: self.af_enabled,
            };
            let pose = self.traj.tick(self.traj_period, &inputs, &mut self.outputs);

            let mut targets = [0.0; MAX_JOINTS];
            for (i, j) in self.joints[..self.num_joints].iter().enumerate() {
                targets[i] = j.pos_cmd;
            }
            match self.kins.inverse(&pose, &mut targets) {
                Ok(()) => {
                    for (i, cubic) in self.cubics.iter_mut().enumerate() {
                        cubic.add_point(targets[i]);
                    }
                }
                Err(_) => {
                    self.raise_error(MotionErrorKind::Kinematics);
                }
            }
        }

        for i in 0..self.num_joints {
            let (pos, vel) = self.cubics[i].interpolate();
            let joint = &mut self.joints[i];
            joint.pos_cmd = pos;
            joint.vel_cmd = vel;
        }
    }

    fn tick_free(&mut self, io: &IoInputs) {
        for i in 0..self.num_joints {
            if self.joints[i].homing.is_active() {
                let shared_busy = homing::shared_input_busy(&self.joints, i);
                let index_latched = self
                    .fiq
                    .as_ref()
                    .map(|f| f.index_result(i).is_some())
                    .unwrap_or(true);
                let joint = &mut self.joints[i];
                let actions = homing::home_tick(
                    joint,
                    HomeInputs {
                        switch: io.joints[i].home_switch,
                        index_latched,
                        shared_busy,
                    },
                );
                if actions.request_index {
                    if let Some(fiq) = &self.fiq {
                        fiq.request_index(i);
                    }
                }
            }
            let joint = &mut self.joints[i];
            let dt = self.servo_period;
            joint.pos_cmd = joint.free.update(dt);
            joint.vel_cmd = joint.free.curr_vel;
        }
        self.seq.tick(&mut self.joints[..self.num_joints]);
    }

    fn tick_teleop(&mut self) {
        // Integrate the operator's velocity vector, clamped per joint.
        let dt = self.servo_period;
        let pose = self.commanded_pose();
        let mut next = pose;
        for i in 0..MAX_JOINTS {
            next.set(i, pose.get(i) + self.teleop_vel.get(i) * dt);
        }
        let mut targets = [0.0; MAX_JOINTS];
        for (i, j) in self.joints[..self.num_joints].iter().enumerate() {
            targets[i] = j.pos_cmd;
        }
        if self.kins.inverse(&next, &mut targets).is_err() {
            self.raise_error(MotionErrorKind::Kinematics);
            return;
        }
        for i in 0..self.num_joints {
            let joint = &mut self.joints[i];
            let max_dp = joint.vel_limit * dt;
            let dp = (targets[i] - joint.pos_cmd).clamp(-max_dp, max_dp);
            joint.pos_cmd += dp;
            joint.vel_cmd = dp / dt;
        }
    }

    fn tick_joints(&mut self) {
        let mut ferrored: Option<usize> = None;
        let mut soft_limited: Option<usize> = None;
        let coord = self.mode == MotionMode::Coord;

        for i in 0..self.num_joints {
            let joint = &mut self.joints[i];

            // Soft limits: free mode clamps silently at the bound;
            // a coordinated move that reaches a bound is an error.
            let was_clamped = {
                joint.enforce_soft_limits();
                joint.flags.intersects(
                    JointFlags::POS_SOFT_LIMIT | JointFlags::NEG_SOFT_LIMIT,
                )
            };
            if was_clamped && coord {
                soft_limited = Some(i);
            }

            joint.update_motor_command(self.servo_period);
            if self.feedback_mode == FeedbackMode::Echo {
                joint.motor_pos_fb = joint.motor_pos_cmd;
            }
            joint.update_feedback();
            if joint.check_ferror() && ferrored.is_none() {
                ferrored = Some(i);
            }

            let in_pos = joint.vel_cmd.abs() < 1e-9 && !joint.free.active;
            joint.flags.set(JointFlags::IN_POSITION, in_pos);
        }

        if let Some(i) = soft_limited {
            if !self.motion_error {
                self.raise_error(MotionErrorKind::SoftLimit(i));
            }
        }
        if let Some(i) = ferrored {
            if !self.motion_error {
                self.raise_error(MotionErrorKind::FollowingError(i));
            }
        }
    }

    fn tick_stepgen(&mut self, scan_sync: bool) {
        // One step per FIQ tick is the physical ceiling.
        let max_steps = self.fiq_ticks_per_servo();
        let Some(ring) = self.ring.as_mut() else {
            return;
        };
        let Some(fiq) = self.fiq.as_ref() else {
            return;
        };

        if fiq.take_underrun() {
            self.underruns = self.underruns.wrapping_add(1);
        }

        if ring.free() == 0 {
            self.waiting_for_buffer = true;
            return;
        }
        self.waiting_for_buffer = false;

        let depth = ring.occupied() as u32;
        let mut segment = StepSegment::default();
        segment.axes[0].scan_sync = scan_sync;
        for i in 0..self.num_joints {
            let joint = &self.joints[i];
            let target_steps = (joint.motor_pos_cmd * joint.steps_per_unit).round() as i64;
            let mut delta = target_steps - self.cmd_steps[i];

            // ±1-step error correction with a dead band of ±1 and a
            // delay equal to the observed ring depth, so a nudge is
            // seen before the next one is issued.
            if self.fb_delay[i] == 0 {
                let err = fiq.pos_error(i);
                if err != self.pos_err_old[i] {
                    if err > 1 {
                        delta += 1;
                    } else if err < -1 {
                        delta -= 1;
                    }
                    self.pos_err_old[i] = err;
                }
                self.fb_delay[i] = depth.max(1);
            } else {
                self.fb_delay[i] -= 1;
            }

            let clamped = delta.clamp(-(max_steps as i64), max_steps as i64);
            self.cmd_steps[i] += clamped;

            let slot = &mut segment.axes[i];
            slot.cmd_position = self.cmd_steps[i];
            slot.direction = clamped < 0;
            slot.adder =
                ((clamped.unsigned_abs() as u64 * PHASE_STEP as u64) / max_steps as u64) as u32;
        }
        let _ = ring.publish(&segment);
    }

    /// FIQ ticks per servo period (the step budget per segment).
    fn fiq_ticks_per_servo(&self) -> u64 {
        let fiq_period = rmc_common::DEFAULT_FIQ_PERIOD_NS as f64 / 1e9;
        ((self.servo_period / fiq_period).round() as u64).max(1)
    }

    fn publish_status(&mut self, io: &IoInputs) {
        let mut status = MotionStatus {
            echo_serial: self.cmd_rx.echo(),
            heartbeat: self.heartbeat,
            mode: self.mode,
            num_joints: self.num_joints as u8,
            ..MotionStatus::default()
        };

        let traj = self.traj.status();
        status.queue_depth = traj.depth;
        status.active_depth = u16::from(traj.depth > 0);
        status.queue_full = traj.queue_full;
        status.active_id = traj.active_id;
        status.current_vel = traj.current_vel;
        status.dtg = traj.dtg;
        status.feed_scale = self.feed_scale;
        status.spindle_scale = self.spindle_scale;

        status.flags.set(MotionFlags::ENABLED, self.enabled);
        status.flags.set(MotionFlags::PAUSED, traj.paused);
        status.flags.set(MotionFlags::ERROR, self.motion_error);
        status
            .flags
            .set(MotionFlags::QUEUE_ACTIVE, traj.depth > 0);
        status
            .flags
            .set(MotionFlags::WATCHDOG, self.watchdog_enabled);
        status
            .flags
            .set(MotionFlags::UNDERRUN, self.underruns > 0);

        let mut all_in_pos = true;
        let mut arr_cmd = [0.0; MAX_JOINTS];
        let mut arr_fb = [0.0; MAX_JOINTS];
        for i in 0..self.num_joints {
            let joint = &self.joints[i];
            let mut js = joint.status();
            if let Some(fiq) = &self.fiq {
                js.step_count = fiq.step_count(i);
                js.pos_error_steps = fiq.pos_error(i);
            }
            status.joints[i] = js;
            all_in_pos &= !joint.is_active()
                || joint.flags.contains(JointFlags::IN_POSITION);
            arr_cmd[i] = joint.pos_cmd;
            arr_fb[i] = joint.pos_fb;
        }
        status
            .flags
            .set(MotionFlags::IN_POSITION, all_in_pos && self.traj.is_done());

        status.position = self.kins.forward(&arr_cmd).unwrap_or(Pose::ZERO);
        status.actual_position = self.kins.forward(&arr_fb).unwrap_or(Pose::ZERO);

        status.spindle.speed = self.spindle.speed;
        status.spindle.css_factor = self.spindle.css_factor;
        status.spindle.x_offset = self.spindle.x_offset;
        status.spindle.enabled = self.spindle.enabled;
        status.spindle.brake = self.spindle.brake;
        status.spindle.direction = self.spindle.direction;
        status.spindle.revs = io.spindle_revs;

        status.probe.tripped = traj.probe_tripped;
        status.probe.probing = traj.probing;
        status.probe.input = io.probe;
        status.probe.probed_pos = traj.probed_pos;

        status.underruns = self.underruns;
        status.motion_error = self.motion_error;
        status.all_homed = self.all_homed();

        self.status_tx.publish(&status);
    }
}

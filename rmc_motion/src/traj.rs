//! The blended trajectory queue.
//!
//! A bounded FIFO of motion segments with look-ahead velocity
//! planning. Planning assigns each segment an exit velocity: the
//! termination condition and corner geometry bound it from above, a
//! backward pass caps it by what the successor chain can shed, and a
//! forward pass caps it by what acceleration can build. Velocities
//! only ever decrease across passes, so the iteration reaches a fixed
//! point in at most queue-length rounds.
//!
//! Per servo tick the head segment advances by a velocity-profiled
//! `Δs`, scaled by the feed/spindle/adaptive/hold multipliers its
//! enables mask admits, or driven by spindle revolutions when the
//! segment is spindle-synced. Probe segments watch the probe input
//! and abort the queue on a trip; rigid taps reverse at the endpoint
//! and complete back at their start.

use std::collections::VecDeque;

use rmc_common::motion_cmd::{
    MotionType, SegmentEnables, SyncAoutArgs, SyncDoutArgs, TermCond,
};
use rmc_common::pose::{Cart, Pose};

use crate::error::CommandReject;
use crate::segment::{MotionSegment, SegGeom, TapPhase, ZERO_LENGTH};

/// Queue capacity (segments). Preallocated; the queue never grows.
pub const TRAJ_QUEUE_CAP: usize = 64;

/// Velocity below which the path is considered at rest.
const REST_VEL: f64 = 1e-7;

/// Inputs sampled by the servo loop for one trajectory tick.
#[derive(Debug, Clone, Copy)]
pub struct TrajInputs {
    pub feed_scale: f64,
    pub spindle_scale: f64,
    /// 0..1 from the adaptive-feed input.
    pub adaptive_feed: f64,
    pub feed_hold: bool,
    pub probe_input: bool,
    /// Accumulated spindle revolutions.
    pub spindle_revs: f64,
    /// Global enables toggled by operator commands.
    pub fs_enabled: bool,
    pub ss_enabled: bool,
    pub fh_enabled: bool,
    pub af_enabled: bool,
}

impl Default for TrajInputs {
    fn default() -> Self {
        Self {
            feed_scale: 1.0,
            spindle_scale: 1.0,
            adaptive_feed: 1.0,
            feed_hold: false,
            probe_input: false,
            spindle_revs: 0.0,
            fs_enabled: true,
            ss_enabled: true,
            fh_enabled: true,
            af_enabled: true,
        }
    }
}

/// Side effects of one trajectory tick.
#[derive(Debug, Default)]
pub struct TrajOutputs {
    pub douts: heapless::Vec<(u8, bool), 8>,
    pub aouts: heapless::Vec<(u8, f64), 8>,
    /// Rigid tap reached bottom: command the spindle to reverse.
    pub spindle_reverse: bool,
}

/// Planner-level status, folded into the servo snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrajStatus {
    pub depth: u16,
    pub active_id: i32,
    pub current_vel: f64,
    pub dtg: f64,
    pub paused: bool,
    pub queue_full: bool,
    pub probing: bool,
    pub probe_tripped: bool,
    pub probed_pos: Pose,
}

/// Runtime feed multiplier for a segment under the current inputs
/// and global enables.
fn runtime_scale(enables: SegmentEnables, inputs: &TrajInputs) -> f64 {
    let mut scale = 1.0;
    if inputs.fs_enabled && enables.contains(SegmentEnables::FEED_OVERRIDE) {
        scale *= inputs.feed_scale.max(0.0);
    }
    if inputs.af_enabled && enables.contains(SegmentEnables::ADAPTIVE_FEED) {
        scale *= inputs.adaptive_feed.clamp(0.0, 1.0);
    }
    if inputs.fh_enabled && enables.contains(SegmentEnables::FEED_HOLD) && inputs.feed_hold {
        scale = 0.0;
    }
    scale
}

/// The queue itself.
pub struct TrajQueue {
    queue: VecDeque<MotionSegment>,
    /// Where the next appended segment starts.
    end_pose: Pose,
    /// Commanded pose as of the last tick.
    current_pose: Pose,
    current_vel: f64,

    /// Global caps.
    vmax: f64,
    amax: f64,

    /// Termination state applied to subsequent appends.
    term: TermCond,
    tolerance: f64,

    /// Spindle-sync state applied to subsequent appends.
    sync_feed_per_rev: f64,
    pub sync_wait_index: bool,
    last_revs: f64,
    revs_primed: bool,

    /// Outputs staged for the next appended segment.
    pending_start_douts: heapless::Vec<(u8, bool), 4>,
    pending_end_douts: heapless::Vec<(u8, bool), 4>,
    pending_start_aouts: heapless::Vec<(u8, f64), 2>,
    pending_end_aouts: heapless::Vec<(u8, f64), 2>,

    paused: bool,
    stepping: bool,
    step_id: i32,
    aborting: bool,

    probe_tripped: bool,
    probed_pos: Pose,
}

impl TrajQueue {
    pub fn new(vmax: f64, amax: f64) -> Self {
        Self {
            queue: VecDeque::with_capacity(TRAJ_QUEUE_CAP),
            end_pose: Pose::ZERO,
            current_pose: Pose::ZERO,
            current_vel: 0.0,
            vmax,
            amax,
            term: TermCond::ExactStop,
            tolerance: 0.0,
            sync_feed_per_rev: 0.0,
            sync_wait_index: false,
            last_revs: 0.0,
            revs_primed: false,
            pending_start_douts: heapless::Vec::new(),
            pending_end_douts: heapless::Vec::new(),
            pending_start_aouts: heapless::Vec::new(),
            pending_end_aouts: heapless::Vec::new(),
            paused: false,
            stepping: false,
            step_id: 0,
            aborting: false,
            probe_tripped: false,
            probed_pos: Pose::ZERO,
        }
    }

    // ─── Configuration & queue management ───────────────────────────

    pub fn set_limits(&mut self, vmax: f64, amax: f64) {
        if vmax > 0.0 {
            self.vmax = vmax;
        }
        if amax > 0.0 {
            self.amax = amax;
        }
    }

    /// Rebase the queue origin (mode entry, homing completion).
    /// Only valid with an empty queue.
    pub fn set_position(&mut self, pose: Pose) {
        if self.queue.is_empty() {
            self.end_pose = pose;
            self.current_pose = pose;
            self.current_vel = 0.0;
        }
    }

    pub fn set_term_cond(&mut self, cond: TermCond, tolerance: f64) {
        self.term = cond;
        self.tolerance = tolerance.max(0.0);
    }

    /// Feed-per-revolution for subsequent segments; 0 disables sync.
    pub fn set_spindle_sync(&mut self, feed_per_rev: f64, wait_index: bool) {
        self.sync_feed_per_rev = feed_per_rev.max(0.0);
        self.sync_wait_index = wait_index;
    }

    #[inline]
    pub fn is_synced(&self) -> bool {
        self.sync_feed_per_rev > 0.0
    }

    /// Stage a synchronized digital output.
    pub fn set_dout(&mut self, args: SyncDoutArgs, outputs: &mut TrajOutputs) {
        if args.now {
            let _ = outputs.douts.push((args.index, args.start));
            return;
        }
        let _ = self.pending_start_douts.push((args.index, args.start));
        let _ = self.pending_end_douts.push((args.index, args.end));
    }

    /// Stage a synchronized analog output.
    pub fn set_aout(&mut self, args: SyncAoutArgs, outputs: &mut TrajOutputs) {
        if args.now {
            let _ = outputs.aouts.push((args.index, args.start));
            return;
        }
        let _ = self.pending_start_aouts.push((args.index, args.start));
        let _ = self.pending_end_aouts.push((args.index, args.end));
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.queue.len() >= TRAJ_QUEUE_CAP
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.queue.is_empty() && self.current_vel.abs() < REST_VEL
    }

    #[inline]
    pub fn end_pose(&self) -> Pose {
        self.end_pose
    }

    #[inline]
    pub fn current_pose(&self) -> Pose {
        self.current_pose
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn active_id(&self) -> i32 {
        self.queue.front().map(|s| s.id).unwrap_or(0)
    }

    /// Clear the probe-tripped latch.
    pub fn clear_probe_flag(&mut self) {
        self.probe_tripped = false;
    }

    // ─── Appending ──────────────────────────────────────────────────

    fn push(&mut self, mut seg: MotionSegment) -> Result<(), CommandReject> {
        if self.is_full() {
            return Err(CommandReject::QueueFull);
        }
        seg.douts_start = core::mem::take(&mut self.pending_start_douts);
        seg.douts_end = core::mem::take(&mut self.pending_end_douts);
        seg.aouts_start = core::mem::take(&mut self.pending_start_aouts);
        seg.aouts_end = core::mem::take(&mut self.pending_end_aouts);
        self.end_pose = seg.end;
        self.queue.push_back(seg);
        self.replan();
        Ok(())
    }

    /// Append a straight feed or traverse ending at `end`.
    pub fn add_line(
        &mut self,
        id: i32,
        end: Pose,
        motion_type: MotionType,
        vel: f64,
        ini_maxvel: f64,
        acc: f64,
        enables: SegmentEnables,
    ) -> Result<(), CommandReject> {
        let mut seg = MotionSegment::line(
            id,
            self.end_pose,
            end,
            motion_type,
            vel,
            ini_maxvel,
            acc,
            enables,
            self.term,
            self.tolerance,
        );
        seg.feed_per_rev = self.sync_feed_per_rev;
        self.push(seg)
    }

    /// Append an arc.
    #[allow(clippy::too_many_arguments)]
    pub fn add_circle(
        &mut self,
        id: i32,
        end: Pose,
        center: Cart,
        normal: Cart,
        turn: i32,
        vel: f64,
        ini_maxvel: f64,
        acc: f64,
        enables: SegmentEnables,
    ) -> Result<(), CommandReject> {
        let Some(mut seg) = MotionSegment::arc(
            id,
            self.end_pose,
            end,
            center,
            normal,
            turn,
            vel,
            ini_maxvel,
            acc,
            enables,
            self.term,
            self.tolerance,
        ) else {
            // Degenerate arc: treat as a line to the endpoint.
            return self.add_line(id, end, MotionType::Arc, vel, ini_maxvel, acc, enables);
        };
        seg.feed_per_rev = self.sync_feed_per_rev;
        self.push(seg)
    }

    /// Append a rigid tap. Caller must have spindle sync in effect.
    pub fn add_rigid_tap(
        &mut self,
        id: i32,
        end: Pose,
        vel: f64,
        ini_maxvel: f64,
        acc: f64,
    ) -> Result<(), CommandReject> {
        if !self.is_synced() {
            return Err(CommandReject::TapWithoutSync);
        }
        let seg = MotionSegment::rigid_tap(
            id,
            self.end_pose,
            end,
            vel,
            ini_maxvel,
            acc,
            self.sync_feed_per_rev,
        );
        self.push(seg)
    }

    /// Append a probe move: a straight feed that latches and aborts
    /// on the probe input.
    pub fn add_probe(
        &mut self,
        id: i32,
        end: Pose,
        vel: f64,
        ini_maxvel: f64,
        acc: f64,
    ) -> Result<(), CommandReject> {
        self.probe_tripped = false;
        let seg = MotionSegment::line(
            id,
            self.end_pose,
            end,
            MotionType::Probing,
            vel,
            ini_maxvel,
            acc,
            SegmentEnables::empty(),
            TermCond::ExactStop,
            0.0,
        );
        self.push(seg)
    }

    // ─── Execution control ──────────────────────────────────────────

    /// Decelerate to rest, then flush everything.
    pub fn abort(&mut self) {
        if self.queue.is_empty() && self.current_vel.abs() < REST_VEL {
            self.finish_abort();
        } else {
            self.aborting = true;
        }
    }

    fn finish_abort(&mut self) {
        self.queue.clear();
        self.end_pose = self.current_pose;
        self.current_vel = 0.0;
        self.aborting = false;
        self.paused = false;
        self.stepping = false;
        self.revs_primed = false;
        self.pending_start_douts.clear();
        self.pending_end_douts.clear();
        self.pending_start_aouts.clear();
        self.pending_end_aouts.clear();
    }

    pub fn pause(&mut self) {
        self.paused = true;
        self.stepping = false;
    }

    pub fn resume(&mut self) {
        self.paused = false;
        self.stepping = false;
    }

    /// Resume until the active line id changes, then pause again.
    pub fn step(&mut self) {
        if self.paused {
            self.stepping = true;
            self.step_id = self.active_id();
            self.paused = false;
        }
    }

    // ─── Planning ───────────────────────────────────────────────────

    /// Corner velocity permitted between `a` and `b` under `a`'s
    /// termination condition.
    fn corner_vel(&self, a: &MotionSegment, b: &MotionSegment) -> f64 {
        match a.term {
            TermCond::ExactStop => 0.0,
            TermCond::ExactPath | TermCond::Blend => {
                let t1 = a.tangent_out();
                let t2 = b.tangent_in();
                let delta = t2.sub(&t1);
                let dmag = delta.norm();
                let acc = a.acc.min(b.acc).min(self.amax);
                // Velocity discontinuity the joints can absorb in one
                // trajectory tick; collinear segments are unbounded
                // here and capped by the velocity limits below.
                let kink_cap = if dmag < 1e-9 {
                    f64::INFINITY
                } else {
                    acc * 0.01 / dmag
                };
                let cap = if a.term == TermCond::Blend {
                    // Blend within tolerance: deviation of a circular
                    // blend of radius r stays within τ when
                    // v² ≤ a·τ·cos(θ/2)/(1−cos(θ/2)).
                    let cos_half = ((t1.dot(&t2) + 1.0) / 2.0).clamp(0.0, 1.0).sqrt();
                    if 1.0 - cos_half < 1e-9 {
                        f64::INFINITY
                    } else {
                        (acc * a.tolerance * cos_half / (1.0 - cos_half))
                            .max(0.0)
                            .sqrt()
                            .max(kink_cap)
                    }
                } else {
                    kink_cap
                };
                cap.min(self.seg_vmax(a)).min(self.seg_vmax(b))
            }
        }
    }

    #[inline]
    fn seg_vmax(&self, seg: &MotionSegment) -> f64 {
        seg.reqvel.min(seg.maxvel).min(self.vmax)
    }

    /// Recompute exit velocities to a fixed point. Velocities only
    /// decrease, so `len` rounds bound the iteration.
    fn replan(&mut self) {
        let n = self.queue.len();
        if n == 0 {
            return;
        }

        // Upper bounds from termination conditions and geometry.
        let mut corner = vec![0.0f64; n];
        for i in 0..n {
            corner[i] = if i + 1 < n {
                self.corner_vel(&self.queue[i], &self.queue[i + 1])
            } else {
                0.0
            };
        }

        let mut exit: Vec<f64> = corner.clone();
        loop {
            let mut changed = false;
            // Backward: exit[i] limited by what segment i+1 can shed.
            for i in (0..n.saturating_sub(1)).rev() {
                let succ = &self.queue[i + 1];
                let reach = (exit[i + 1] * exit[i + 1]
                    + 2.0 * succ.acc.min(self.amax) * succ.length)
                    .sqrt();
                let cap = reach.min(self.seg_vmax(succ));
                if exit[i] > cap {
                    exit[i] = cap;
                    changed = true;
                }
            }
            // Forward: exit[i] limited by what segment i can build
            // from its entry.
            let mut entry = if let Some(head) = self.queue.front() {
                head.currentvel
            } else {
                0.0
            };
            for i in 0..n {
                let seg = &self.queue[i];
                let reach =
                    (entry * entry + 2.0 * seg.acc.min(self.amax) * seg.length).sqrt();
                if exit[i] > reach {
                    exit[i] = reach;
                    changed = true;
                }
                entry = exit[i];
            }
            if !changed {
                break;
            }
        }

        for (i, seg) in self.queue.iter_mut().enumerate() {
            seg.finalvel = exit[i];
        }
    }

    // ─── Per-tick execution ─────────────────────────────────────────

    /// Advance one servo tick; returns the commanded pose.
    pub fn tick(&mut self, dt: f64, inputs: &TrajInputs, outputs: &mut TrajOutputs) -> Pose {
        let dr = if self.revs_primed {
            inputs.spindle_revs - self.last_revs
        } else {
            0.0
        };
        self.last_revs = inputs.spindle_revs;
        self.revs_primed = true;

        // Consume any zero-length heads (they fire their outputs but
        // never move).
        while let Some(head) = self.queue.front() {
            if head.is_zero_length() && !matches!(head.geom, SegGeom::Tap(_)) {
                self.complete_head(outputs);
            } else {
                break;
            }
        }

        let Some(head) = self.queue.front_mut() else {
            // Idle or finishing an abort at rest.
            if self.aborting {
                self.finish_abort();
            }
            self.current_vel = 0.0;
            return self.current_pose;
        };

        if !head.active {
            head.active = true;
            for &(idx, level) in head.douts_start.iter() {
                let _ = outputs.douts.push((idx, level));
            }
            for &(idx, value) in head.aouts_start.iter() {
                let _ = outputs.aouts.push((idx, value));
            }
        }

        // Probe trip: latch and abort.
        if head.motion_type == MotionType::Probing && inputs.probe_input {
            self.probe_tripped = true;
            self.probed_pos = self.current_pose;
            self.aborting = true;
        }

        let stopping = self.paused || self.aborting;
        let vmax_global = self.vmax;
        let amax_global = self.amax;
        let head = self.queue.front_mut().unwrap();

        if let SegGeom::Tap(phase) = head.geom {
            return self.tick_tap(phase, dr, outputs);
        }

        let scale = if stopping {
            0.0
        } else {
            runtime_scale(head.enables, inputs)
        };

        let vcap = head.reqvel.min(head.maxvel).min(vmax_global);
        let acc = head.acc.min(amax_global);
        let remaining = head.remaining();

        let (new_vel, ds) = if head.feed_per_rev > 0.0 && !stopping {
            // Spindle-synced: distance follows the spindle.
            let ds = (head.feed_per_rev * dr).max(0.0).min(remaining);
            (ds / dt.max(1e-12), ds)
        } else {
            // Velocity that still honors the planned exit velocity.
            let target_exit = if stopping { 0.0 } else { head.finalvel };
            let v_allow = (target_exit * target_exit + 2.0 * acc * remaining)
                .sqrt()
                .min(vcap * scale)
                .max(0.0);
            let mut v = head.currentvel;
            let dv = acc * dt;
            if v_allow > v + dv {
                v += dv;
            } else if v_allow < v - dv {
                v -= dv;
            } else {
                v = v_allow;
            }
            let ds = (v * dt).clamp(0.0, remaining);
            (v, ds)
        };

        head.currentvel = new_vel;
        head.progress += ds;
        self.current_vel = new_vel;
        self.current_pose = head.pose_at(head.progress);

        let finished = head.remaining() <= ZERO_LENGTH
            && (head.finalvel > REST_VEL || new_vel <= REST_VEL);
        let exit_vel = head.currentvel;
        if finished && !stopping {
            self.complete_head(outputs);
            if let Some(next) = self.queue.front_mut() {
                next.currentvel = exit_vel;
            } else {
                self.current_vel = 0.0;
            }
        }

        if self.aborting && self.current_vel.abs() < REST_VEL {
            self.finish_abort();
        }

        self.current_pose
    }

    /// Rigid-tap phase machine; progress is driven by spindle
    /// revolutions in both directions.
    fn tick_tap(&mut self, phase: TapPhase, dr: f64, outputs: &mut TrajOutputs) -> Pose {
        let stopping = self.aborting;
        let head = self.queue.front_mut().unwrap();
        let ds = head.feed_per_rev * dr;

        match phase {
            TapPhase::Tapping => {
                head.progress += ds.max(0.0);
                if stopping {
                    // An abort mid-tap still reverses out.
                    head.geom = SegGeom::Tap(TapPhase::Reversing);
                    outputs.spindle_reverse = true;
                } else if head.progress >= head.length {
                    head.geom = SegGeom::Tap(TapPhase::Reversing);
                    outputs.spindle_reverse = true;
                }
            }
            TapPhase::Reversing => {
                // Spindle still coasting forward: follow the overshoot.
                head.progress += ds;
                if ds < 0.0 {
                    head.geom = SegGeom::Tap(TapPhase::Retracting);
                }
            }
            TapPhase::Retracting => {
                head.progress += ds.min(0.0);
                if head.progress <= 0.0 {
                    head.progress = 0.0;
                    self.current_pose = self.queue.front().unwrap().pose_at(0.0);
                    self.current_vel = 0.0;
                    self.complete_head(outputs);
                    if self.aborting {
                        self.finish_abort();
                    }
                    return self.current_pose;
                }
            }
        }

        let head = self.queue.front().unwrap();
        self.current_pose = head.pose_at(head.progress);
        self.current_vel = 0.0;
        self.current_pose
    }

    /// Pop the head, firing its end outputs and handling step mode.
    fn complete_head(&mut self, outputs: &mut TrajOutputs) {
        if let Some(done) = self.queue.pop_front() {
            for &(idx, level) in done.douts_end.iter() {
                let _ = outputs.douts.push((idx, level));
            }
            for &(idx, value) in done.aouts_end.iter() {
                let _ = outputs.aouts.push((idx, value));
            }
            if self.stepping {
                let next_id = self.active_id();
                if next_id != self.step_id {
                    self.paused = true;
                    self.stepping = false;
                }
            }
        }
        if self.queue.is_empty() {
            self.end_pose = self.current_pose;
        }
        self.replan();
    }

    /// Snapshot for the status publisher.
    pub fn status(&self) -> TrajStatus {
        TrajStatus {
            depth: self.queue.len() as u16,
            active_id: self.active_id(),
            current_vel: self.current_vel,
            dtg: self.queue.front().map(|s| s.remaining()).unwrap_or(0.0),
            paused: self.paused,
            queue_full: self.is_full(),
            probing: self
                .queue
                .front()
                .map(|s| s.motion_type == MotionType::Probing)
                .unwrap_or(false),
            probe_tripped: self.probe_tripped,
            probed_pos: self.probed_pos,
        }
    }
}

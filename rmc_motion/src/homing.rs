//! Per-joint homing state machine and the batch sequencer.
//!
//! One joint homes through the phases: search toward the switch at
//! `home_search_vel`, back off at `home_latch_vel` until the switch
//! releases, optionally ride on to the encoder index, latch the motor
//! offset so feedback reads `home_offset`, then rapid to `home`.
//! A joint that starts on the switch backs off first and searches
//! from clean air.
//!
//! The sequencer batches joints by `home_sequence` and runs batches
//! in ascending order; a negative sequence joins the preceding batch.
//! Joints whose home input is shared take turns searching.

use rmc_common::motion_cmd::HomeFlags;
use rmc_common::motion_status::JointFlags;

use crate::joint::Joint;

/// A target far beyond any real axis; the switch ends the move.
const SEARCH_SPAN: f64 = 1e9;

/// Settling window for the final move [units].
const HOME_SETTLE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum HomePhase {
    #[default]
    Idle,
    Start,
    InitialSearch,
    FinalBackoff,
    WaitForIndex,
    SetHome,
    FinalMove,
    Finished,
    Abort,
}

/// Homing runtime state carried by each joint.
#[derive(Debug, Clone, Copy, Default)]
pub struct HomingState {
    pub phase: HomePhase,
    /// The switch has been found (backoff is post-search).
    searched: bool,
}

impl HomingState {
    #[inline]
    pub fn is_active(&self) -> bool {
        !matches!(
            self.phase,
            HomePhase::Idle | HomePhase::Finished | HomePhase::Abort
        )
    }
}

/// Inputs sampled for one joint this servo tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct HomeInputs {
    /// Home switch level.
    pub switch: bool,
    /// The stepgen latched an index pulse since the last request.
    pub index_latched: bool,
    /// Another joint on the shared home input is mid-sequence.
    pub shared_busy: bool,
}

/// Requests the state machine makes of the caller this tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct HomeActions {
    /// Arm the stepgen index latch for this joint.
    pub request_index: bool,
}

/// Begin homing a joint. No-op if already in progress.
pub fn home_start(joint: &mut Joint) {
    if joint.homing.is_active() {
        return;
    }
    joint.homing = HomingState {
        phase: HomePhase::Start,
        searched: false,
    };
    joint.flags.insert(JointFlags::HOMING);
    joint.flags.remove(JointFlags::HOMED);
}

/// Abort a homing sequence in progress.
pub fn home_abort(joint: &mut Joint) {
    if !joint.homing.is_active() {
        return;
    }
    joint.free.stop();
    joint.homing.phase = HomePhase::Abort;
    joint.flags.remove(JointFlags::HOMING);
}

/// One servo tick of the homing state machine. The caller runs the
/// joint's free planner after this.
pub fn home_tick(joint: &mut Joint, inputs: HomeInputs) -> HomeActions {
    let mut actions = HomeActions::default();
    let mut state = joint.homing;

    match state.phase {
        HomePhase::Idle | HomePhase::Finished | HomePhase::Abort => {}

        HomePhase::Start => {
            if joint.home_flags.contains(HomeFlags::IS_SHARED) && inputs.shared_busy {
                // Hold until the neighbor releases the shared input.
            } else if joint.home_search_vel == 0.0 {
                // No switch configured: home in place.
                state.phase = HomePhase::SetHome;
            } else if inputs.switch {
                // Starting on the switch: back into clean air first.
                drive(joint, -search_sign(joint), joint.home_latch_vel.abs());
                state.searched = false;
                state.phase = HomePhase::FinalBackoff;
            } else {
                drive(joint, search_sign(joint), joint.home_search_vel.abs());
                state.phase = HomePhase::InitialSearch;
            }
        }

        HomePhase::InitialSearch => {
            if inputs.switch {
                // Found it. Creep back off at latch speed.
                drive(joint, -search_sign(joint), joint.home_latch_vel.abs());
                state.searched = true;
                state.phase = HomePhase::FinalBackoff;
            }
        }

        HomePhase::FinalBackoff => {
            if !inputs.switch {
                if !state.searched {
                    // Pre-search backoff done; search from clean air.
                    drive(joint, search_sign(joint), joint.home_search_vel.abs());
                    state.phase = HomePhase::InitialSearch;
                } else if joint.home_flags.contains(HomeFlags::USE_INDEX) {
                    actions.request_index = true;
                    // Keep creeping; the index ends the move.
                    state.phase = HomePhase::WaitForIndex;
                } else {
                    joint.free.stop();
                    state.phase = HomePhase::SetHome;
                }
            }
        }

        HomePhase::WaitForIndex => {
            if inputs.index_latched {
                joint.free.stop();
                state.phase = HomePhase::SetHome;
            }
        }

        HomePhase::SetHome => {
            joint.set_motor_offset_for(joint.home_offset);
            joint.flags.insert(JointFlags::HOMED);
            joint.free.pos_cmd = joint.home;
            joint.free.max_vel = joint.vel_limit;
            joint.free.enable = true;
            state.phase = HomePhase::FinalMove;
        }

        HomePhase::FinalMove => {
            if !joint.free.active && (joint.free.curr_pos - joint.home).abs() < HOME_SETTLE {
                joint.free.stop();
                joint.flags.remove(JointFlags::HOMING);
                state.phase = HomePhase::Finished;
            }
        }
    }

    joint.homing = state;
    actions
}

fn search_sign(joint: &Joint) -> f64 {
    if joint.home_search_vel >= 0.0 {
        1.0
    } else {
        -1.0
    }
}

fn drive(joint: &mut Joint, sign: f64, vel: f64) {
    joint.free.pos_cmd = joint.free.curr_pos + sign * SEARCH_SPAN;
    joint.free.max_vel = if vel > 0.0 { vel } else { joint.vel_limit };
    joint.free.enable = true;
}

// ─── Sequence driver ────────────────────────────────────────────────

/// Drives whole-machine homing in `home_sequence` order.
#[derive(Debug, Default)]
pub struct HomingSequencer {
    running: bool,
    current_batch: Option<i8>,
}

impl HomingSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Start homing every active joint, lowest batch first. A
    /// negative `home_sequence` maps onto the batch of its absolute
    /// value.
    pub fn start_all(&mut self, joints: &mut [Joint]) {
        self.running = true;
        self.current_batch = joints
            .iter()
            .filter(|j| j.is_active())
            .map(|j| j.home_sequence.abs())
            .min();
        if let Some(batch) = self.current_batch {
            Self::start_batch(joints, batch);
        } else {
            self.running = false;
        }
    }

    fn start_batch(joints: &mut [Joint], batch: i8) {
        for joint in joints.iter_mut() {
            if joint.is_active() && joint.home_sequence.abs() == batch {
                home_start(joint);
            }
        }
    }

    /// Advance the sequence: when the current batch has settled, kick
    /// off the next. Call once per servo tick, after `home_tick` ran
    /// for every joint.
    pub fn tick(&mut self, joints: &mut [Joint]) {
        if !self.running {
            return;
        }
        let Some(batch) = self.current_batch else {
            self.running = false;
            return;
        };
        let busy = joints
            .iter()
            .any(|j| j.home_sequence.abs() == batch && j.homing.is_active());
        if busy {
            return;
        }
        // Batch settled; retire its joints and find the next batch.
        for joint in joints.iter_mut() {
            if joint.homing.phase == HomePhase::Finished {
                joint.homing.phase = HomePhase::Idle;
            }
        }
        let aborted = joints
            .iter()
            .any(|j| j.home_sequence.abs() == batch && j.homing.phase == HomePhase::Abort);
        if aborted {
            self.running = false;
            self.current_batch = None;
            return;
        }
        self.current_batch = joints
            .iter()
            .filter(|j| j.is_active() && j.home_sequence.abs() > batch)
            .map(|j| j.home_sequence.abs())
            .min();
        match self.current_batch {
            Some(next) => Self::start_batch(joints, next),
            None => self.running = false,
        }
    }

    /// Stop sequencing (abort).
    pub fn cancel(&mut self) {
        self.running = false;
        self.current_batch = None;
    }
}

/// True while any other shared-input joint is mid-sequence; used to
/// fill [`HomeInputs::shared_busy`].
pub fn shared_input_busy(joints: &[Joint], me: usize) -> bool {
    joints.iter().enumerate().any(|(i, j)| {
        i != me
            && j.home_flags.contains(HomeFlags::IS_SHARED)
            && j.homing.is_active()
            && j.homing.phase != HomePhase::Start
    })
}

//! Per-joint trapezoidal planner for free mode.
//!
//! Drives one joint toward a target position under velocity and
//! acceleration limits, landing without overshoot. Used for all three
//! jog flavors and for the homing sub-moves. The velocity request is
//! chosen so the joint can always still stop at the target from its
//! current speed; the request is then rate-limited by the
//! acceleration bound and integrated.

/// Planner state for one joint.
#[derive(Debug, Clone, Default)]
pub struct FreePlanner {
    /// Target position [units].
    pub pos_cmd: f64,
    /// Velocity magnitude limit for this move [units/s].
    pub max_vel: f64,
    /// Acceleration limit [units/s²].
    pub max_acc: f64,
    /// Planner drives toward the target when set; when clear it
    /// decelerates to rest where it is.
    pub enable: bool,
    /// Integrated position [units].
    pub curr_pos: f64,
    /// Current velocity [units/s].
    pub curr_vel: f64,
    /// Moving this tick.
    pub active: bool,
}

impl FreePlanner {
    /// Jump the planner to a position at rest (feedback sync, homing
    /// offset rebase).
    pub fn set_position(&mut self, pos: f64) {
        self.curr_pos = pos;
        self.curr_vel = 0.0;
        self.pos_cmd = pos;
        self.active = false;
    }

    /// One servo tick; returns the new commanded position.
    pub fn update(&mut self, period: f64) -> f64 {
        let max_dv = self.max_acc * period;
        let tiny_dp = max_dv * period * 0.001;

        let vel_req = if self.enable {
            let pos_err = self.pos_cmd - self.curr_pos;
            // Velocity that tends to close the error but can still
            // stop at the target without overshoot.
            if pos_err > tiny_dp {
                -max_dv + (2.0 * self.max_acc * pos_err + max_dv * max_dv).sqrt()
            } else if pos_err < -tiny_dp {
                max_dv - (-2.0 * self.max_acc * pos_err + max_dv * max_dv).sqrt()
            } else {
                0.0
            }
        } else {
            0.0
        };

        let vel_req = vel_req.clamp(-self.max_vel, self.max_vel);

        // Ramp toward the request at the acceleration limit.
        if vel_req > self.curr_vel + max_dv {
            self.curr_vel += max_dv;
        } else if vel_req < self.curr_vel - max_dv {
            self.curr_vel -= max_dv;
        } else {
            self.curr_vel = vel_req;
        }

        self.active = self.curr_vel != 0.0;
        self.curr_pos += self.curr_vel * period;
        self.curr_pos
    }

    /// Stop where we are: retarget to the stopping point.
    pub fn stop(&mut self) {
        self.enable = false;
    }
}

/// Why a jog request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JogRefusal {
    NotFreeMode,
    NotEnabled,
    HomingActive,
    FeedHoldZero,
    IntoPositiveLimit,
    IntoNegativeLimit,
}

impl JogRefusal {
    pub const fn describe(&self) -> &'static str {
        match self {
            Self::NotFreeMode => "machine is not in free mode",
            Self::NotEnabled => "motion is not enabled",
            Self::HomingActive => "homing in progress",
            Self::FeedHoldZero => "feed override is zero",
            Self::IntoPositiveLimit => "jog would move into the positive limit",
            Self::IntoNegativeLimit => "jog would move into the negative limit",
        }
    }
}

/// Everything the jog gate needs to know about the current state.
#[derive(Debug, Clone, Copy)]
pub struct JogGate {
    pub free_mode: bool,
    pub enabled: bool,
    pub any_joint_homing: bool,
    pub feed_scale: f64,
    /// Limits as seen for this joint right now.
    pub on_pos_hard_limit: bool,
    pub on_neg_hard_limit: bool,
    pub at_pos_soft_limit: bool,
    pub at_neg_soft_limit: bool,
}

/// The jog safety gate: may joint motion start in `direction`
/// (+1 / −1)?
pub fn jog_ok(gate: &JogGate, direction: f64) -> Result<(), JogRefusal> {
    if !gate.free_mode {
        return Err(JogRefusal::NotFreeMode);
    }
    if !gate.enabled {
        return Err(JogRefusal::NotEnabled);
    }
    if gate.any_joint_homing {
        return Err(JogRefusal::HomingActive);
    }
    if gate.feed_scale < 1e-4 {
        return Err(JogRefusal::FeedHoldZero);
    }
    if direction > 0.0 && (gate.on_pos_hard_limit || gate.at_pos_soft_limit) {
        return Err(JogRefusal::IntoPositiveLimit);
    }
    if direction < 0.0 && (gate.on_neg_hard_limit || gate.at_neg_soft_limit) {
        return Err(JogRefusal::IntoNegativeLimit);
    }
    Ok(())
}

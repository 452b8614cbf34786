//! Per-joint kinematic state and policy.
//!
//! A `Joint` owns everything about one motor: limits, following-error
//! policy, backlash and screw compensation, its free-mode planner,
//! and its homing state. The motion loop is the only writer; other
//! domains see joints through the status snapshot.

use rmc_common::config::{AxisConfig, JointType};
use rmc_common::motion_cmd::HomeFlags;
use rmc_common::motion_status::{JointFlags, JointStatus};

use crate::comp::CompTable;
use crate::free::FreePlanner;
use crate::homing::HomingState;

#[derive(Debug)]
pub struct Joint {
    // Configuration.
    pub joint_type: JointType,
    pub units: f64,
    pub vel_limit: f64,
    pub acc_limit: f64,
    pub min_pos_limit: f64,
    pub max_pos_limit: f64,
    /// Following-error bound at full velocity.
    pub max_ferror: f64,
    /// Following-error floor near rest.
    pub min_ferror: f64,
    pub backlash: f64,
    pub home: f64,
    pub home_offset: f64,
    pub home_search_vel: f64,
    pub home_latch_vel: f64,
    pub home_flags: HomeFlags,
    pub home_sequence: i8,
    pub steps_per_unit: f64,
    pub comp: CompTable,

    // Dynamic state.
    pub flags: JointFlags,
    pub pos_cmd: f64,
    pub pos_fb: f64,
    pub vel_cmd: f64,
    pub motor_pos_cmd: f64,
    pub motor_pos_fb: f64,
    pub motor_offset: f64,
    pub ferror: f64,
    pub ferror_limit: f64,
    pub ferror_high_mark: f64,

    // Backlash ramp state.
    backlash_corr: f64,
    backlash_filt: f64,
    backlash_vel: f64,

    pub free: FreePlanner,
    pub homing: HomingState,
}

impl Joint {
    pub fn from_config(cfg: &AxisConfig) -> Self {
        let mut flags = HomeFlags::empty();
        flags.set(HomeFlags::USE_INDEX, cfg.home_use_index);
        flags.set(HomeFlags::IGNORE_LIMITS, cfg.home_ignore_limits);
        flags.set(HomeFlags::IS_SHARED, cfg.home_is_shared);
        Self {
            joint_type: cfg.joint_type,
            units: cfg.units,
            vel_limit: cfg.max_velocity,
            acc_limit: cfg.max_acceleration,
            min_pos_limit: cfg.min_limit,
            max_pos_limit: cfg.max_limit,
            max_ferror: cfg.ferror,
            min_ferror: cfg.min_ferror,
            backlash: cfg.backlash,
            home: cfg.home,
            home_offset: cfg.home_offset,
            home_search_vel: cfg.home_search_vel,
            home_latch_vel: cfg.home_latch_vel,
            home_flags: flags,
            home_sequence: cfg.home_sequence,
            steps_per_unit: cfg.steps_per_unit,
            comp: CompTable::new(),
            flags: JointFlags::empty(),
            pos_cmd: 0.0,
            pos_fb: 0.0,
            vel_cmd: 0.0,
            motor_pos_cmd: 0.0,
            motor_pos_fb: 0.0,
            motor_offset: 0.0,
            ferror: 0.0,
            ferror_limit: cfg.min_ferror,
            ferror_high_mark: 0.0,
            backlash_corr: 0.0,
            backlash_filt: 0.0,
            backlash_vel: 0.0,
            free: FreePlanner {
                max_vel: cfg.max_velocity,
                max_acc: cfg.max_acceleration,
                ..Default::default()
            },
            homing: HomingState::default(),
        }
    }

    // ─── Parameter setters (channel commands) ───────────────────────

    pub fn set_backlash(&mut self, backlash: f64) {
        self.backlash = backlash;
    }

    pub fn set_position_limits(&mut self, min: f64, max: f64) {
        self.min_pos_limit = min;
        self.max_pos_limit = max;
    }

    pub fn set_max_ferror(&mut self, ferror: f64) {
        self.max_ferror = ferror;
    }

    pub fn set_min_ferror(&mut self, ferror: f64) {
        self.min_ferror = ferror;
    }

    pub fn set_max_velocity(&mut self, vel: f64) {
        self.vel_limit = vel;
        self.free.max_vel = vel;
    }

    pub fn set_max_acceleration(&mut self, acc: f64) {
        self.acc_limit = acc;
        self.free.max_acc = acc;
    }

    pub fn set_homing_params(
        &mut self,
        home: f64,
        offset: f64,
        search_vel: f64,
        latch_vel: f64,
        flags: HomeFlags,
        sequence: i8,
    ) {
        self.home = home;
        self.home_offset = offset;
        self.home_search_vel = search_vel;
        self.home_latch_vel = latch_vel;
        self.home_flags = flags;
        self.home_sequence = sequence;
    }

    pub fn activate(&mut self) {
        self.flags.insert(JointFlags::ACTIVE);
    }

    pub fn deactivate(&mut self) {
        self.flags.remove(JointFlags::ACTIVE);
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.flags.contains(JointFlags::ACTIVE)
    }

    #[inline]
    pub fn is_homed(&self) -> bool {
        self.flags.contains(JointFlags::HOMED)
    }

    #[inline]
    pub fn is_homing(&self) -> bool {
        self.flags.contains(JointFlags::HOMING)
    }

    // ─── Per-tick computations ──────────────────────────────────────

    /// Update feedback-side state from the motor feedback position.
    pub fn update_feedback(&mut self) {
        self.pos_fb = self.motor_pos_fb - self.backlash_filt - self.motor_offset;
    }

    /// Clamp `pos_cmd` into the soft limits, maintaining the
    /// soft-limit flags. Skipped entirely while homing or when limits
    /// are overridden.
    pub fn enforce_soft_limits(&mut self) {
        if self.is_homing() || self.flags.contains(JointFlags::OVERRIDE_LIMITS) {
            self.flags
                .remove(JointFlags::POS_SOFT_LIMIT | JointFlags::NEG_SOFT_LIMIT);
            return;
        }
        if self.pos_cmd > self.max_pos_limit {
            self.pos_cmd = self.max_pos_limit;
            self.free.set_position(self.max_pos_limit);
            self.flags.insert(JointFlags::POS_SOFT_LIMIT);
        } else {
            self.flags.remove(JointFlags::POS_SOFT_LIMIT);
        }
        if self.pos_cmd < self.min_pos_limit {
            self.pos_cmd = self.min_pos_limit;
            self.free.set_position(self.min_pos_limit);
            self.flags.insert(JointFlags::NEG_SOFT_LIMIT);
        } else {
            self.flags.remove(JointFlags::NEG_SOFT_LIMIT);
        }
    }

    /// Compute the motor-space command from the joint command:
    /// backlash ramp on direction reversal, screw compensation, and
    /// the homing motor offset.
    pub fn update_motor_command(&mut self, period: f64) {
        // Direction-reversal backlash target.
        if self.vel_cmd > 0.0 {
            self.backlash_corr = 0.5 * self.backlash;
        } else if self.vel_cmd < 0.0 {
            self.backlash_corr = -0.5 * self.backlash;
        }

        // Ramp the filtered value toward the target, bounded by the
        // joint acceleration limit so the correction never commands a
        // step the drive cannot follow.
        let max_dv = self.acc_limit * period;
        let err = self.backlash_corr - self.backlash_filt;
        let stop_vel = (2.0 * self.acc_limit * err.abs()).sqrt();
        let vel_req = err.signum() * stop_vel.min(self.vel_limit);
        if vel_req > self.backlash_vel + max_dv {
            self.backlash_vel += max_dv;
        } else if vel_req < self.backlash_vel - max_dv {
            self.backlash_vel -= max_dv;
        } else {
            self.backlash_vel = vel_req;
        }
        self.backlash_filt += self.backlash_vel * period;
        if (self.backlash_filt - self.backlash_corr).abs() < 1e-12 {
            self.backlash_vel = 0.0;
            self.backlash_filt = self.backlash_corr;
        }

        let trim = self.comp.lookup(self.pos_cmd, self.vel_cmd >= 0.0);
        self.motor_pos_cmd = self.pos_cmd + self.backlash_filt + self.motor_offset + trim;
    }

    /// Following-error policy. Returns true when the joint trips.
    pub fn check_ferror(&mut self) -> bool {
        self.ferror = self.motor_pos_cmd - self.motor_pos_fb;
        let abs = self.ferror.abs();
        if abs > self.ferror_high_mark {
            self.ferror_high_mark = abs;
        }
        // Limit scales with speed, floored near rest.
        let scaled = if self.vel_limit > 0.0 {
            self.max_ferror * (self.vel_cmd.abs() / self.vel_limit)
        } else {
            self.max_ferror
        };
        self.ferror_limit = scaled.max(self.min_ferror);

        if abs > self.ferror_limit && self.is_active() {
            self.flags.insert(JointFlags::FERROR | JointFlags::ERROR);
            true
        } else {
            false
        }
    }

    /// Rebase the motor offset so the current feedback reads as
    /// `reading`. Used when homing latches.
    pub fn set_motor_offset_for(&mut self, reading: f64) {
        self.motor_offset = self.motor_pos_fb - self.backlash_filt - reading;
        self.update_feedback();
        self.pos_cmd = self.pos_fb;
        self.free.set_position(self.pos_fb);
    }

    /// Clear error latches (machine-on).
    pub fn clear_faults(&mut self) {
        self.flags
            .remove(JointFlags::FERROR | JointFlags::FAULT | JointFlags::ERROR);
        self.ferror_high_mark = 0.0;
    }

    /// Fill the status slice.
    pub fn status(&self) -> JointStatus {
        JointStatus {
            flags: self.flags,
            pos_cmd: self.pos_cmd,
            pos_fb: self.pos_fb,
            vel_cmd: self.vel_cmd,
            motor_pos_cmd: self.motor_pos_cmd,
            motor_pos_fb: self.motor_pos_fb,
            ferror: self.ferror,
            ferror_limit: self.ferror_limit,
            ferror_high_mark: self.ferror_high_mark,
            step_count: 0,
            pos_error_steps: 0,
            _pad: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmc_common::config::AxisConfig;

    const DT: f64 = 0.001;

    fn joint() -> Joint {
        let cfg = AxisConfig {
            max_velocity: 10.0,
            max_acceleration: 100.0,
            min_limit: -100.0,
            max_limit: 100.0,
            ferror: 1.0,
            min_ferror: 0.1,
            backlash: 0.2,
            ..Default::default()
        };
        let mut j = Joint::from_config(&cfg);
        j.activate();
        j
    }

    #[test]
    fn soft_limit_clamps_exactly() {
        let mut j = joint();
        j.pos_cmd = 150.0;
        j.enforce_soft_limits();
        assert_eq!(j.pos_cmd, 100.0);
        assert!(j.flags.contains(JointFlags::POS_SOFT_LIMIT));
        j.pos_cmd = 0.0;
        j.enforce_soft_limits();
        assert!(!j.flags.contains(JointFlags::POS_SOFT_LIMIT));
    }

    #[test]
    fn soft_limits_suspended_while_homing() {
        let mut j = joint();
        j.flags.insert(JointFlags::HOMING);
        j.pos_cmd = 150.0;
        j.enforce_soft_limits();
        assert_eq!(j.pos_cmd, 150.0);
    }

    #[test]
    fn backlash_ramp_is_bounded_and_converges() {
        let mut j = joint();
        j.vel_cmd = 1.0;
        let mut last_filt = 0.0;
        for _ in 0..2000 {
            j.update_motor_command(DT);
            let dv = (j.backlash_filt - last_filt).abs();
            // Never faster than the velocity bound allows.
            assert!(dv <= j.vel_limit * DT + 1e-9);
            last_filt = j.backlash_filt;
        }
        assert!((j.backlash_filt - 0.1).abs() < 1e-9);
        assert!((j.motor_pos_cmd - (j.pos_cmd + 0.1)).abs() < 1e-9);

        // Reverse: ramp to the other half of the band.
        j.vel_cmd = -1.0;
        for _ in 0..2000 {
            j.update_motor_command(DT);
        }
        assert!((j.backlash_filt + 0.1).abs() < 1e-9);
    }

    #[test]
    fn ferror_limit_scales_with_speed() {
        let mut j = joint();
        j.vel_cmd = 0.0;
        j.motor_pos_cmd = 0.05;
        j.motor_pos_fb = 0.0;
        assert!(!j.check_ferror());
        assert_eq!(j.ferror_limit, 0.1);

        j.vel_cmd = 10.0; // full speed: limit = max_ferror
        j.motor_pos_cmd = 0.5;
        assert!(!j.check_ferror());
        assert_eq!(j.ferror_limit, 1.0);

        j.motor_pos_cmd = 1.5;
        assert!(j.check_ferror());
        assert!(j.flags.contains(JointFlags::FERROR));
        assert_eq!(j.ferror_high_mark, 1.5);
    }

    #[test]
    fn inactive_joint_never_trips() {
        let mut j = joint();
        j.deactivate();
        j.motor_pos_cmd = 100.0;
        j.motor_pos_fb = 0.0;
        assert!(!j.check_ferror());
    }

    #[test]
    fn motor_offset_rebases_feedback() {
        let mut j = joint();
        j.motor_pos_fb = 37.5;
        j.set_motor_offset_for(2.0);
        assert!((j.pos_fb - 2.0).abs() < 1e-12);
        assert!((j.pos_cmd - 2.0).abs() < 1e-12);
        assert_eq!(j.free.curr_pos, j.pos_fb);
    }

    #[test]
    fn idempotent_parameter_sets() {
        let mut j = joint();
        j.set_max_velocity(7.5);
        let once = (j.vel_limit, j.free.max_vel);
        j.set_max_velocity(7.5);
        assert_eq!(once, (j.vel_limit, j.free.max_vel));
    }
}

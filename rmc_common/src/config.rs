//! Typed startup configuration loaded from the INI file.
//!
//! One struct per INI section family, each with defaults matching the
//! classic controller configuration and a `validate()` that turns a
//! bad entry into a fatal init error. Runtime reloads are limited to
//! the tool table; everything here is read once.

use serde::{Deserialize, Serialize};

use crate::error::CommonError;
use crate::ini::IniFile;
use crate::pose::{Pose, MAX_JOINTS};
use crate::{DEFAULT_SERVO_PERIOD_NS, DEFAULT_TRAJ_PERIOD_NS};

/// Joint kind from `[AXIS_n] TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum JointType {
    Linear = 0,
    Angular = 1,
}

impl Default for JointType {
    fn default() -> Self {
        Self::Linear
    }
}

/// `[EMC]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmcConfig {
    pub debug: u32,
    pub nml_file: String,
}

/// `[TRAJ]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajConfig {
    /// Number of configured joints (1..=9).
    pub joints: u8,
    /// Axis letter per joint ("X Y Z" or "XYZ"). A repeated letter
    /// makes the later joint a second motor on the same axis. Empty
    /// means joint i drives axis i.
    pub coordinates: String,
    /// Canonical linear unit scale (units per mm).
    pub linear_units: f64,
    /// Canonical angular unit scale (units per degree).
    pub angular_units: f64,
    /// Velocity used when a primitive does not carry one [units/s].
    pub default_velocity: f64,
    pub max_velocity: f64,
    pub max_acceleration: f64,
    /// Servo tick period [ns].
    pub servo_period_ns: i64,
    /// Trajectory planning period [ns]; integer multiple of servo.
    pub traj_period_ns: i64,
}

impl Default for TrajConfig {
    fn default() -> Self {
        Self {
            joints: 3,
            coordinates: String::new(),
            linear_units: 1.0,
            angular_units: 1.0,
            default_velocity: 1.0,
            max_velocity: 10.0,
            max_acceleration: 20.0,
            servo_period_ns: DEFAULT_SERVO_PERIOD_NS,
            traj_period_ns: DEFAULT_TRAJ_PERIOD_NS,
        }
    }
}

/// `[AXIS_n]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisConfig {
    pub joint_type: JointType,
    /// Units per canonical unit for this joint.
    pub units: f64,
    pub max_velocity: f64,
    pub max_acceleration: f64,
    pub backlash: f64,
    pub min_limit: f64,
    pub max_limit: f64,
    /// Following-error bound at full speed.
    pub ferror: f64,
    /// Following-error floor at rest.
    pub min_ferror: f64,
    pub home: f64,
    pub home_offset: f64,
    pub home_search_vel: f64,
    pub home_latch_vel: f64,
    pub home_use_index: bool,
    pub home_ignore_limits: bool,
    pub home_is_shared: bool,
    pub home_sequence: i8,
    /// Screw compensation file, empty = none.
    pub comp_file: String,
    /// 0 = trim-pair format, 1 = forward/reverse full-position format.
    pub comp_file_type: u8,
    /// Steps per joint unit for the pulse generator.
    pub steps_per_unit: f64,
    /// Logical step/dir pin indices, −1 = not driven.
    pub step_pin: i32,
    pub dir_pin: i32,
    pub dir_polarity: bool,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            joint_type: JointType::Linear,
            units: 1.0,
            max_velocity: 1.0,
            max_acceleration: 1.0,
            backlash: 0.0,
            min_limit: -1e99,
            max_limit: 1e99,
            ferror: 1.0,
            min_ferror: 0.01,
            home: 0.0,
            home_offset: 0.0,
            home_search_vel: 0.0,
            home_latch_vel: 0.0,
            home_use_index: false,
            home_ignore_limits: false,
            home_is_shared: false,
            home_sequence: 0,
            comp_file: String::new(),
            comp_file_type: 0,
            steps_per_unit: 3200.0,
            step_pin: -1,
            dir_pin: -1,
            dir_polarity: false,
        }
    }
}

/// `[EMCIO]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoConfig {
    pub cycle_time: f64,
    pub tool_table: String,
    pub tool_change_position: Option<Pose>,
    pub tool_holder_clear: Option<Pose>,
    /// Servo ticks between GPIO pin scans (1 = every tick).
    pub io_update_period: u32,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            cycle_time: 0.1,
            tool_table: "tool.tbl".to_string(),
            tool_change_position: None,
            tool_holder_clear: None,
            io_update_period: 1,
        }
    }
}

/// `[TASK]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub cycle_time: f64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self { cycle_time: 0.1 }
    }
}

/// Everything read at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub emc: EmcConfig,
    pub traj: TrajConfig,
    pub axes: Vec<AxisConfig>,
    pub io: IoConfig,
    pub task: TaskConfig,
}

impl Config {
    /// Load and validate the full configuration.
    pub fn from_ini(ini: &IniFile) -> Result<Self, CommonError> {
        let emc = EmcConfig {
            debug: ini.get_or("EMC", "DEBUG", 0),
            nml_file: ini.get("EMC", "NML_FILE").unwrap_or_default().to_string(),
        };

        let d = TrajConfig::default();
        let traj = TrajConfig {
            joints: ini.get_or("TRAJ", "AXES", d.joints),
            coordinates: ini.get("TRAJ", "COORDINATES").unwrap_or("").to_string(),
            linear_units: ini.get_or("TRAJ", "LINEAR_UNITS", d.linear_units),
            angular_units: ini.get_or("TRAJ", "ANGULAR_UNITS", d.angular_units),
            default_velocity: ini.get_or("TRAJ", "DEFAULT_VELOCITY", d.default_velocity),
            max_velocity: ini.get_or("TRAJ", "MAX_VELOCITY", d.max_velocity),
            max_acceleration: ini.get_or("TRAJ", "MAX_ACCELERATION", d.max_acceleration),
            servo_period_ns: ini.get_or("TRAJ", "SERVO_PERIOD", d.servo_period_ns),
            traj_period_ns: ini.get_or("TRAJ", "TRAJ_PERIOD", d.traj_period_ns),
        };

        let mut axes = Vec::new();
        for n in 0..traj.joints as usize {
            let section = format!("AXIS_{n}");
            if !ini.has_section(&section) {
                return Err(CommonError::Config(format!(
                    "[{section}] missing but [TRAJ] AXES = {}",
                    traj.joints
                )));
            }
            axes.push(Self::axis_from_ini(ini, &section)?);
        }

        let io = IoConfig {
            cycle_time: ini.get_or("EMCIO", "CYCLE_TIME", 0.1),
            tool_table: ini
                .get("EMCIO", "TOOL_TABLE")
                .unwrap_or("tool.tbl")
                .to_string(),
            tool_change_position: ini
                .get("EMCIO", "TOOL_CHANGE_POSITION")
                .and_then(parse_pose),
            tool_holder_clear: ini.get("EMCIO", "TOOL_HOLDER_CLEAR").and_then(parse_pose),
            io_update_period: ini.get_or("EMCIO", "IO_UPDATE_PERIOD", 1u32).max(1),
        };

        let task = TaskConfig {
            cycle_time: ini.get_or("TASK", "CYCLE_TIME", 0.1),
        };

        let config = Self {
            emc,
            traj,
            axes,
            io,
            task,
        };
        config.validate()?;
        Ok(config)
    }

    fn axis_from_ini(ini: &IniFile, section: &str) -> Result<AxisConfig, CommonError> {
        let d = AxisConfig::default();
        let joint_type = match ini.get(section, "TYPE") {
            Some("LINEAR") | None => JointType::Linear,
            Some("ANGULAR") => JointType::Angular,
            Some(other) => {
                return Err(CommonError::Config(format!(
                    "[{section}] TYPE = {other}: expected LINEAR or ANGULAR"
                )));
            }
        };
        Ok(AxisConfig {
            joint_type,
            units: ini.get_or(section, "UNITS", d.units),
            max_velocity: ini.get_or(section, "MAX_VELOCITY", d.max_velocity),
            max_acceleration: ini.get_or(section, "MAX_ACCELERATION", d.max_acceleration),
            backlash: ini.get_or(section, "BACKLASH", d.backlash),
            min_limit: ini.get_or(section, "MIN_LIMIT", d.min_limit),
            max_limit: ini.get_or(section, "MAX_LIMIT", d.max_limit),
            ferror: ini.get_or(section, "FERROR", d.ferror),
            min_ferror: ini.get_or(section, "MIN_FERROR", d.min_ferror),
            home: ini.get_or(section, "HOME", d.home),
            home_offset: ini.get_or(section, "HOME_OFFSET", d.home_offset),
            home_search_vel: ini.get_or(section, "HOME_SEARCH_VEL", d.home_search_vel),
            home_latch_vel: ini.get_or(section, "HOME_LATCH_VEL", d.home_latch_vel),
            home_use_index: ini.get_or(section, "HOME_USE_INDEX", 0i32) != 0,
            home_ignore_limits: ini.get_or(section, "HOME_IGNORE_LIMITS", 0i32) != 0,
            home_is_shared: ini.get_or(section, "HOME_IS_SHARED", 0i32) != 0,
            home_sequence: ini.get_or(section, "HOME_SEQUENCE", d.home_sequence),
            comp_file: ini.get(section, "COMP_FILE").unwrap_or("").to_string(),
            comp_file_type: ini.get_or(section, "COMP_FILE_TYPE", d.comp_file_type),
            steps_per_unit: ini.get_or(section, "STEPS_PER_UNIT", d.steps_per_unit),
            step_pin: ini.get_or(section, "STEP_PIN", d.step_pin),
            dir_pin: ini.get_or(section, "DIR_PIN", d.dir_pin),
            dir_polarity: ini.get_or(section, "DIR_POLARITY", 0i32) != 0,
        })
    }

    /// Cross-field validation; fatal at init.
    pub fn validate(&self) -> Result<(), CommonError> {
        if self.traj.joints == 0 || self.traj.joints as usize > MAX_JOINTS {
            return Err(CommonError::Config(format!(
                "[TRAJ] AXES = {}: expected 1..={MAX_JOINTS}",
                self.traj.joints
            )));
        }
        self.traj.axis_letter_map()?;
        if self.traj.servo_period_ns <= 0 || self.traj.traj_period_ns < self.traj.servo_period_ns {
            return Err(CommonError::Config(
                "[TRAJ] SERVO_PERIOD/TRAJ_PERIOD: traj period must be >= servo period".into(),
            ));
        }
        if self.traj.traj_period_ns % self.traj.servo_period_ns != 0 {
            return Err(CommonError::Config(
                "[TRAJ] TRAJ_PERIOD must be an integer multiple of SERVO_PERIOD".into(),
            ));
        }
        for (n, axis) in self.axes.iter().enumerate() {
            if axis.min_limit > axis.max_limit {
                return Err(CommonError::Config(format!(
                    "[AXIS_{n}] MIN_LIMIT {} > MAX_LIMIT {}",
                    axis.min_limit, axis.max_limit
                )));
            }
            if axis.max_velocity <= 0.0 || axis.max_acceleration <= 0.0 {
                return Err(CommonError::Config(format!(
                    "[AXIS_{n}] velocity and acceleration limits must be positive"
                )));
            }
            if axis.ferror < 0.0 || axis.min_ferror < 0.0 || axis.backlash < 0.0 {
                return Err(CommonError::Config(format!(
                    "[AXIS_{n}] FERROR/MIN_FERROR/BACKLASH must be non-negative"
                )));
            }
        }
        Ok(())
    }

    /// Substeps of the cubic interpolator per trajectory tick.
    #[inline]
    pub fn interpolation_rate(&self) -> u32 {
        (self.traj.traj_period_ns / self.traj.servo_period_ns) as u32
    }
}

impl TrajConfig {
    /// Pose-axis index driven by each joint, from the coordinate
    /// letters. A joint whose letter already appeared follows the
    /// earlier joint (a second motor on a shared axis).
    pub fn axis_letter_map(&self) -> Result<Vec<usize>, CommonError> {
        let n = self.joints as usize;
        if self.coordinates.trim().is_empty() {
            return Ok((0..n).collect());
        }
        let letters: Vec<char> = self
            .coordinates
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if letters.len() != n {
            return Err(CommonError::Config(format!(
                "[TRAJ] COORDINATES names {} axes but AXES = {n}",
                letters.len()
            )));
        }
        letters
            .iter()
            .map(|c| match c.to_ascii_uppercase() {
                'X' => Ok(0),
                'Y' => Ok(1),
                'Z' => Ok(2),
                'A' => Ok(3),
                'B' => Ok(4),
                'C' => Ok(5),
                'U' => Ok(6),
                'V' => Ok(7),
                'W' => Ok(8),
                other => Err(CommonError::Config(format!(
                    "[TRAJ] COORDINATES: unknown axis letter '{other}'"
                ))),
            })
            .collect()
    }
}

/// Parse a whitespace-separated pose, short entries zero-filled.
fn parse_pose(text: &str) -> Option<Pose> {
    let mut p = Pose::ZERO;
    for (i, field) in text.split_whitespace().enumerate() {
        if i >= MAX_JOINTS {
            return None;
        }
        p.set(i, field.parse().ok()?);
    }
    Some(p)
}

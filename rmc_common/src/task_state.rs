//! Task-layer state enums.
//!
//! The task coordinator is a three-level state machine: the machine
//! state (estop → on), the operating mode (manual / auto / mdi), and
//! the interpreter state within auto mode. `ExecState` tracks what the
//! currently-issued command is waiting on.

use serde::{Deserialize, Serialize};

/// Machine power/estop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TaskState {
    /// Emergency stop asserted; everything is inhibited.
    Estop = 0,
    /// Estop released, servos still off.
    EstopReset = 1,
    /// Machine explicitly turned off.
    Off = 2,
    /// Machine on; motion permitted subject to mode.
    On = 3,
}

impl TaskState {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Estop),
            1 => Some(Self::EstopReset),
            2 => Some(Self::Off),
            3 => Some(Self::On),
            _ => None,
        }
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::Estop
    }
}

/// Operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TaskMode {
    /// Jogging and homing; per-joint motion only.
    Manual = 0,
    /// Program execution through the interpreter.
    Auto = 1,
    /// Single-block manual data input.
    Mdi = 2,
}

impl TaskMode {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Manual),
            1 => Some(Self::Auto),
            2 => Some(Self::Mdi),
            _ => None,
        }
    }
}

impl Default for TaskMode {
    fn default() -> Self {
        Self::Manual
    }
}

/// Interpreter state within auto/mdi mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum InterpState {
    /// No program active.
    Idle = 0,
    /// Reading blocks and appending to the interp list.
    Reading = 1,
    /// Paused by the operator; resumable.
    Paused = 2,
    /// Blocked on a synchronization point, EOF, or error.
    Waiting = 3,
}

impl InterpState {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Idle),
            1 => Some(Self::Reading),
            2 => Some(Self::Paused),
            3 => Some(Self::Waiting),
            _ => None,
        }
    }
}

impl Default for InterpState {
    fn default() -> Self {
        Self::Idle
    }
}

/// What the currently-executing task command is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExecState {
    Error = 0,
    Done = 1,
    WaitingForMotion = 2,
    WaitingForIo = 3,
    WaitingForMotionAndIo = 4,
    WaitingForDelay = 5,
    WaitingForSystemCmd = 6,
    WaitingForPause = 7,
    /// Waiting for the motion queue to drain completely.
    WaitingForMotionQueue = 8,
}

impl ExecState {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Error),
            1 => Some(Self::Done),
            2 => Some(Self::WaitingForMotion),
            3 => Some(Self::WaitingForIo),
            4 => Some(Self::WaitingForMotionAndIo),
            5 => Some(Self::WaitingForDelay),
            6 => Some(Self::WaitingForSystemCmd),
            7 => Some(Self::WaitingForPause),
            8 => Some(Self::WaitingForMotionQueue),
            _ => None,
        }
    }

    /// True while the task must not issue the next queued command.
    #[inline]
    pub const fn is_waiting(&self) -> bool {
        !matches!(self, Self::Done | Self::Error)
    }
}

impl Default for ExecState {
    fn default() -> Self {
        Self::Done
    }
}

/// Motion-layer operating mode, selected by the task layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MotionMode {
    /// Per-joint planning: jogging and homing.
    Free = 0,
    /// Blended Cartesian trajectory queue.
    Coord = 1,
    /// Cartesian velocity-vector jogging.
    Teleop = 2,
}

impl MotionMode {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Free),
            1 => Some(Self::Coord),
            2 => Some(Self::Teleop),
            _ => None,
        }
    }
}

impl Default for MotionMode {
    fn default() -> Self {
        Self::Free
    }
}

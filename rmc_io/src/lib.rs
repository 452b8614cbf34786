//! The I/O controller: everything on the machine that is not a
//! coordinated axis. Tool carousel and offsets, coolant, lube, and
//! the auxiliary estop chain, driven over its own command/status
//! channel at the task cycle rate.

pub mod control;
pub mod tooltable;

pub use control::IoController;
pub use tooltable::{ToolEntry, ToolTable};

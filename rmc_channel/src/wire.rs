//! Wire payload contract for the command channel.

use rmc_common::io_cmd::IoCommand;
use rmc_common::motion_cmd::MotionCommand;

/// A payload the command channel can carry: plain-old-data with a
/// stable `type` code and an urgency classification.
pub trait WirePayload: Copy + Send + 'static {
    /// The wire `type` field.
    fn code(&self) -> u16;

    /// Urgent payloads bypass the outstanding-echo check.
    fn urgent(&self) -> bool {
        false
    }
}

impl WirePayload for MotionCommand {
    fn code(&self) -> u16 {
        MotionCommand::code(self)
    }

    fn urgent(&self) -> bool {
        self.is_urgent()
    }
}

impl WirePayload for IoCommand {
    fn code(&self) -> u16 {
        IoCommand::code(self)
    }

    fn urgent(&self) -> bool {
        self.is_urgent()
    }
}

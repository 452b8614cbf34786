//! I/O command channel payloads (task → io) and the io status
//! snapshot.
//!
//! Same fixed-layout discipline as the motion channel: every command
//! is a `#[repr(C, u16)]` POD value, file names travel as bounded
//! byte arrays.

/// Maximum bytes of a file path carried over the channel.
pub const IO_PATH_MAX: usize = 126;

/// A bounded file path for channel transport.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct IoPath {
    pub len: u16,
    pub bytes: [u8; IO_PATH_MAX],
}

impl PartialEq for IoPath {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl IoPath {
    /// Encode a path. `None` when it does not fit; never truncates.
    pub fn new(path: &str) -> Option<Self> {
        let bytes = path.as_bytes();
        if bytes.len() > IO_PATH_MAX {
            return None;
        }
        let mut buf = [0u8; IO_PATH_MAX];
        buf[..bytes.len()].copy_from_slice(bytes);
        Some(Self {
            len: bytes.len() as u16,
            bytes: buf,
        })
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

/// The io command set. Discriminants are the wire `type` codes.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C, u16)]
pub enum IoCommand {
    /// Spin the carousel / stage the pocket for the next tool.
    ToolPrepare { pocket: u16 } = 1,
    /// Load the prepared tool into the spindle.
    ToolLoad = 2,
    ToolUnload = 3,
    ToolLoadTable { file: IoPath } = 4,
    ToolSetOffset {
        tool: u16,
        length: f64,
        diameter: f64,
    } = 5,
    CoolantMistOn = 6,
    CoolantMistOff = 7,
    CoolantFloodOn = 8,
    CoolantFloodOff = 9,
    LubeOn = 10,
    LubeOff = 11,
    AuxEstopOn = 12,
    AuxEstopOff = 13,
    AuxEstopReset = 14,
}

impl IoCommand {
    /// The wire `type` code (the enum discriminant).
    #[inline]
    pub fn code(&self) -> u16 {
        unsafe { *(self as *const Self as *const u16) }
    }

    #[inline]
    pub fn is_urgent(&self) -> bool {
        matches!(self, Self::AuxEstopOn)
    }
}

/// I/O controller status snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct IoStatus {
    pub echo_serial: i32,
    pub heartbeat: u64,
    /// Estop chain asserted (aux input or commanded).
    pub estop: bool,
    pub coolant_mist: bool,
    pub coolant_flood: bool,
    pub lube: bool,
    pub lube_level_ok: bool,
    pub _pad0: [u8; 3],
    /// Tool currently in the spindle (0 = none).
    pub tool_in_spindle: u16,
    /// Pocket staged by the last prepare (−1 = none).
    pub pocket_prepped: i16,
    /// Current tool length offset applied by the task layer.
    pub tool_length_offset: f64,
    /// Queued command still executing.
    pub busy: bool,
    /// Last command failed; an operator error was posted.
    pub fault: bool,
    pub _pad1: [u8; 6],
}

impl Default for IoStatus {
    fn default() -> Self {
        Self {
            echo_serial: 0,
            heartbeat: 0,
            estop: true,
            coolant_mist: false,
            coolant_flood: false,
            lube: false,
            lube_level_ok: true,
            _pad0: [0; 3],
            tool_in_spindle: 0,
            pocket_prepped: -1,
            tool_length_offset: 0.0,
            busy: false,
            fault: false,
            _pad1: [0; 6],
        }
    }
}

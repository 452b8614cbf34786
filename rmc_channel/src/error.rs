//! Channel error types.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The previous command has not been echoed yet.
    #[error("previous command (serial {outstanding}) not yet echoed")]
    Outstanding { outstanding: i32 },
    /// Echo did not catch up within the bounded wait; the message was
    /// force-published and the drop counter incremented.
    #[error("echo timeout; command serial {serial} force-published")]
    EchoTimeout { serial: i32 },
    /// No message available.
    #[error("channel empty")]
    Empty,
    #[cfg(feature = "shm")]
    #[error("shared memory: {0}")]
    Shm(String),
}

//! Command/status channels between the task, servo, and io domains.
//!
//! Two primitives, both built on the same torn-read guard:
//!
//! - [`CommandChannel`]: one writer, one reader, one outstanding
//!   message. Each message carries `{type, serial, size}`; the reader
//!   echoes the last processed serial, and a normal publish waits
//!   (bounded) for the echo to catch up before overwriting. Urgent
//!   messages (abort, estop) force-publish past the check.
//! - [`StatusChannel`]: a double-buffered snapshot publisher. The
//!   writer fills the back buffer and swaps; readers copy the front
//!   buffer under the seq guard.
//!
//! The guard is the classic head/tail counter pair: the writer bumps
//! `head`, writes the payload, then bumps `tail`; a reader that
//! observes `head != tail` re-reads. No locks anywhere, suitable for
//! the servo side which must never block.

pub mod command;
pub mod error;
pub mod seqbuf;
pub mod status;
pub mod wire;

#[cfg(feature = "shm")]
pub mod shm;

pub use command::{CommandChannel, CommandReader, CommandWriter, PublishOutcome};
pub use error::ChannelError;
pub use status::{StatusChannel, StatusReader, StatusWriter};
pub use wire::WirePayload;

/// Bounded wait for the previous command's echo before forcing.
pub const ECHO_TIMEOUT: core::time::Duration = core::time::Duration::from_secs(5);

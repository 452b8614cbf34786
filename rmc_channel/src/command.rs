//! The command channel: one outstanding message with serial echo.
//!
//! The writer assigns serial numbers; the reader echoes the last
//! serial it finished processing. A publish with an un-echoed
//! predecessor waits (bounded) for the echo, then force-publishes with
//! an operator-visible warning and a drop count. Urgent messages skip
//! the wait entirely, which is what lets an abort overtake a stuck
//! command.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use static_assertions::const_assert_eq;
use tracing::warn;

use crate::error::ChannelError;
use crate::seqbuf::SeqBuf;
use crate::wire::WirePayload;
use crate::ECHO_TIMEOUT;

/// Fixed message head carried with every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MsgHead {
    pub msg_type: u16,
    pub size: u16,
    pub serial: i32,
}

const_assert_eq!(core::mem::size_of::<MsgHead>(), 8);

#[derive(Clone, Copy)]
#[repr(C)]
struct Msg<T> {
    head: MsgHead,
    payload: T,
}

struct Shared<T> {
    slot: SeqBuf<Msg<T>>,
    /// Last serial the reader finished processing.
    echo: AtomicI32,
    /// Messages force-published over an un-echoed predecessor.
    dropped: AtomicU32,
}

/// Outcome of a non-urgent publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The predecessor had been echoed; clean overwrite.
    Clean,
    /// Echo never caught up; published anyway after the bounded wait.
    Forced,
}

/// Construct a connected writer/reader pair.
pub struct CommandChannel;

impl CommandChannel {
    pub fn new<T: WirePayload>() -> (CommandWriter<T>, CommandReader<T>) {
        let shared = Arc::new(Shared {
            slot: SeqBuf::new(),
            echo: AtomicI32::new(0),
            dropped: AtomicU32::new(0),
        });
        (
            CommandWriter {
                shared: Arc::clone(&shared),
                next_serial: 1,
            },
            CommandReader {
                shared,
                last_seen: 0,
            },
        )
    }
}

/// Sending side. Owned by exactly one domain.
pub struct CommandWriter<T: WirePayload> {
    shared: Arc<Shared<T>>,
    next_serial: i32,
}

impl<T: WirePayload> CommandWriter<T> {
    /// Serial that the next publish will use.
    #[inline]
    pub fn next_serial(&self) -> i32 {
        self.next_serial
    }

    /// Last serial echoed by the reader.
    #[inline]
    pub fn echo(&self) -> i32 {
        self.shared.echo.load(Ordering::Acquire)
    }

    /// True when the previously published command has been processed.
    #[inline]
    pub fn is_acknowledged(&self) -> bool {
        self.echo() >= self.next_serial - 1
    }

    /// Publish without waiting. Fails with `Outstanding` when the
    /// predecessor is un-echoed and the payload is not urgent.
    pub fn try_publish(&mut self, payload: T) -> Result<i32, ChannelError> {
        if !payload.urgent() && !self.is_acknowledged() {
            return Err(ChannelError::Outstanding {
                outstanding: self.next_serial - 1,
            });
        }
        Ok(self.publish_now(payload))
    }

    /// Publish, waiting up to `timeout` for the predecessor's echo,
    /// then forcing. Urgent payloads never wait.
    pub fn publish_timeout(&mut self, payload: T, timeout: Duration) -> (i32, PublishOutcome) {
        if !payload.urgent() {
            let deadline = Instant::now() + timeout;
            while !self.is_acknowledged() {
                if Instant::now() >= deadline {
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        serial = self.next_serial,
                        "command echo timeout; force-publishing"
                    );
                    return (self.publish_now(payload), PublishOutcome::Forced);
                }
                std::thread::sleep(Duration::from_micros(200));
            }
        }
        (self.publish_now(payload), PublishOutcome::Clean)
    }

    /// Publish with the default bounded wait.
    pub fn publish(&mut self, payload: T) -> (i32, PublishOutcome) {
        self.publish_timeout(payload, ECHO_TIMEOUT)
    }

    fn publish_now(&mut self, payload: T) -> i32 {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);
        let msg = Msg {
            head: MsgHead {
                msg_type: payload.code(),
                size: core::mem::size_of::<T>() as u16,
                serial,
            },
            payload,
        };
        self.shared.slot.write(&msg);
        serial
    }

    /// Count of force-published messages.
    pub fn dropped(&self) -> u32 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// Receiving side. Owned by exactly one domain.
pub struct CommandReader<T: WirePayload> {
    shared: Arc<Shared<T>>,
    last_seen: i32,
}

impl<T: WirePayload> CommandReader<T> {
    /// Fetch the pending command, if a new one has arrived since the
    /// last poll. Does not echo; call [`Self::ack`] once processed.
    pub fn poll(&mut self) -> Option<(MsgHead, T)> {
        let msg = self.shared.slot.read()?;
        if msg.head.serial == self.last_seen {
            return None;
        }
        self.last_seen = msg.head.serial;
        Some((msg.head, msg.payload))
    }

    /// Echo a processed serial back to the writer.
    pub fn ack(&self, serial: i32) {
        self.shared.echo.store(serial, Ordering::Release);
    }

    /// Last serial echoed.
    pub fn echo(&self) -> i32 {
        self.shared.echo.load(Ordering::Acquire)
    }
}

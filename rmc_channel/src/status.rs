//! The status channel: double-buffered snapshot publication.
//!
//! The servo loop writes a full snapshot every tick; readers copy the
//! front buffer at their own pace. The writer alternates buffers and
//! flips the front index after the back buffer is complete, so a
//! reader copying the front never races the buffer being filled. The
//! seq guard on each buffer covers the flip-during-copy window.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::seqbuf::SeqBuf;

struct Shared<T> {
    bufs: [SeqBuf<T>; 2],
    front: AtomicU8,
}

/// Construct a connected writer/reader pair.
pub struct StatusChannel;

impl StatusChannel {
    pub fn new<T: Copy + Send + 'static>() -> (StatusWriter<T>, StatusReader<T>) {
        let shared = Arc::new(Shared {
            bufs: [SeqBuf::new(), SeqBuf::new()],
            front: AtomicU8::new(0),
        });
        (
            StatusWriter {
                shared: Arc::clone(&shared),
            },
            StatusReader { shared },
        )
    }
}

/// Publishing side; owned by the servo (or io) domain.
pub struct StatusWriter<T: Copy> {
    shared: Arc<Shared<T>>,
}

impl<T: Copy + Send + 'static> StatusWriter<T> {
    /// Fill the back buffer and swap it to the front.
    pub fn publish(&self, snapshot: &T) {
        let front = self.shared.front.load(Ordering::Relaxed);
        let back = front ^ 1;
        self.shared.bufs[back as usize].write(snapshot);
        self.shared.front.store(back, Ordering::Release);
    }
}

/// Reading side; any number of clones may coexist.
pub struct StatusReader<T: Copy> {
    shared: Arc<Shared<T>>,
}

impl<T: Copy + Send + 'static> StatusReader<T> {
    /// Copy the most recent snapshot; `None` before the first publish.
    pub fn read(&self) -> Option<T> {
        let front = self.shared.front.load(Ordering::Acquire);
        self.shared.bufs[front as usize].read()
    }

    /// Completed publishes into the current front buffer; cheap way
    /// for a reader to detect that anything new arrived.
    pub fn generation(&self) -> u32 {
        let front = self.shared.front.load(Ordering::Acquire);
        self.shared.bufs[front as usize].generation()
    }
}

impl<T: Copy> Clone for StatusReader<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

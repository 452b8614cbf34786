//! Torn-read-protected single-value buffer.
//!
//! Writer protocol: bump `head`, write the payload, bump `tail` to
//! match. Reader protocol: read `tail`, copy the payload, read `head`;
//! a mismatch means the copy raced a write and must be retried. One
//! writer; any number of readers.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{fence, AtomicU32, Ordering};

pub struct SeqBuf<T> {
    head: AtomicU32,
    tail: AtomicU32,
    value: UnsafeCell<MaybeUninit<T>>,
}

// The counter protocol makes concurrent access sound for Copy
// payloads: a racing read is detected and retried, never handed out.
unsafe impl<T: Copy + Send> Sync for SeqBuf<T> {}
unsafe impl<T: Copy + Send> Send for SeqBuf<T> {}

impl<T: Copy> SeqBuf<T> {
    pub const fn new() -> Self {
        Self {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Publish a value. Caller must be the sole writer.
    pub fn write(&self, value: &T) {
        let seq = self.head.load(Ordering::Relaxed).wrapping_add(1);
        self.head.store(seq, Ordering::Relaxed);
        fence(Ordering::Release);
        unsafe {
            (*self.value.get()).write(*value);
        }
        fence(Ordering::Release);
        self.tail.store(seq, Ordering::Release);
    }

    /// Copy the current value, retrying torn reads. `None` until the
    /// first write completes.
    pub fn read(&self) -> Option<T> {
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            if tail == 0 {
                return None;
            }
            fence(Ordering::Acquire);
            // The counters bracket this copy; a torn value is thrown
            // away below, never used.
            let copy = unsafe { core::ptr::read_volatile(self.value.get()) };
            fence(Ordering::Acquire);
            let head = self.head.load(Ordering::Acquire);
            if head == tail {
                return Some(unsafe { copy.assume_init() });
            }
            core::hint::spin_loop();
        }
    }

    /// Number of completed writes (wrapping).
    #[inline]
    pub fn generation(&self) -> u32 {
        self.tail.load(Ordering::Acquire)
    }
}

impl<T: Copy> Default for SeqBuf<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn empty_until_first_write() {
        let buf: SeqBuf<u64> = SeqBuf::new();
        assert!(buf.read().is_none());
        buf.write(&42);
        assert_eq!(buf.read(), Some(42));
    }

    #[test]
    fn last_write_wins() {
        let buf: SeqBuf<u64> = SeqBuf::new();
        for i in 0..100u64 {
            buf.write(&i);
        }
        assert_eq!(buf.read(), Some(99));
        assert_eq!(buf.generation(), 100);
    }

    #[test]
    fn concurrent_reader_never_sees_torn_pair() {
        // Payload is a pair that must stay internally consistent.
        let buf: Arc<SeqBuf<(u64, u64)>> = Arc::new(SeqBuf::new());
        buf.write(&(0, 0));

        let reader = {
            let buf = Arc::clone(&buf);
            std::thread::spawn(move || {
                for _ in 0..100_000 {
                    let (a, b) = buf.read().unwrap();
                    assert_eq!(a, b, "torn read observed");
                }
            })
        };

        for i in 1..=100_000u64 {
            buf.write(&(i, i));
        }
        reader.join().unwrap();
    }
}

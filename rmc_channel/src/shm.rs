//! Optional `/dev/shm` mirror for external monitors.
//!
//! The in-process channels are authoritative; this module republishes
//! a `#[repr(C)]` snapshot into a named shared-memory file so tools
//! outside the supervisor process (dashboards, loggers) can watch the
//! controller without a socket. Same head/tail torn-read guard as the
//! in-process buffers, laid out in the mapping itself.

use std::fs::OpenOptions;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::atomic::{fence, AtomicU32, Ordering};

use memmap2::MmapMut;

use crate::error::ChannelError;

/// Magic bytes identifying an RMC mirror segment.
pub const MIRROR_MAGIC: u32 = 0x524D_4331; // "RMC1"

#[repr(C)]
struct MirrorHeader {
    magic: u32,
    /// `size_of::<T>()`, checked on attach.
    payload_size: u32,
    head: AtomicU32,
    tail: AtomicU32,
}

fn segment_path(name: &str) -> PathBuf {
    PathBuf::from(format!("/dev/shm/rmc_{name}"))
}

/// Writer side of a mirror segment. Creates (or truncates) the file.
pub struct MirrorWriter<T: Copy> {
    map: MmapMut,
    path: PathBuf,
    _marker: PhantomData<T>,
}

impl<T: Copy> MirrorWriter<T> {
    pub fn create(name: &str) -> Result<Self, ChannelError> {
        let path = segment_path(name);
        let total = core::mem::size_of::<MirrorHeader>() + core::mem::size_of::<T>();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| ChannelError::Shm(format!("create {}: {e}", path.display())))?;
        file.set_len(total as u64)
            .map_err(|e| ChannelError::Shm(format!("size {}: {e}", path.display())))?;
        let mut map = unsafe {
            MmapMut::map_mut(&file)
                .map_err(|e| ChannelError::Shm(format!("map {}: {e}", path.display())))?
        };
        let header = unsafe { &mut *(map.as_mut_ptr() as *mut MirrorHeader) };
        header.magic = MIRROR_MAGIC;
        header.payload_size = core::mem::size_of::<T>() as u32;
        header.head = AtomicU32::new(0);
        header.tail = AtomicU32::new(0);
        fence(Ordering::Release);
        Ok(Self {
            map,
            path,
            _marker: PhantomData,
        })
    }

    /// Republish a snapshot into the mapping.
    pub fn publish(&mut self, value: &T) {
        let base = self.map.as_mut_ptr();
        let header = unsafe { &*(base as *const MirrorHeader) };
        let seq = header.head.load(Ordering::Relaxed).wrapping_add(1);
        header.head.store(seq, Ordering::Relaxed);
        fence(Ordering::Release);
        unsafe {
            let payload = base.add(core::mem::size_of::<MirrorHeader>()) as *mut T;
            core::ptr::write_volatile(payload, *value);
        }
        fence(Ordering::Release);
        header.tail.store(seq, Ordering::Release);
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl<T: Copy> Drop for MirrorWriter<T> {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Reader side; attaches to an existing segment.
pub struct MirrorReader<T: Copy> {
    map: MmapMut,
    _marker: PhantomData<T>,
}

impl<T: Copy> MirrorReader<T> {
    pub fn attach(name: &str) -> Result<Self, ChannelError> {
        let path = segment_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| ChannelError::Shm(format!("open {}: {e}", path.display())))?;
        let map = unsafe {
            MmapMut::map_mut(&file)
                .map_err(|e| ChannelError::Shm(format!("map {}: {e}", path.display())))?
        };
        let header = unsafe { &*(map.as_ptr() as *const MirrorHeader) };
        if header.magic != MIRROR_MAGIC {
            return Err(ChannelError::Shm(format!(
                "{}: bad magic {:#010x}",
                path.display(),
                header.magic
            )));
        }
        if header.payload_size as usize != core::mem::size_of::<T>() {
            return Err(ChannelError::Shm(format!(
                "{}: payload size {} != expected {}",
                path.display(),
                header.payload_size,
                core::mem::size_of::<T>()
            )));
        }
        Ok(Self {
            map,
            _marker: PhantomData,
        })
    }

    /// Copy the current snapshot; `None` before the first publish.
    pub fn read(&self) -> Option<T> {
        let base = self.map.as_ptr();
        let header = unsafe { &*(base as *const MirrorHeader) };
        loop {
            let tail = header.tail.load(Ordering::Acquire);
            if tail == 0 {
                return None;
            }
            fence(Ordering::Acquire);
            let copy = unsafe {
                let payload = base.add(core::mem::size_of::<MirrorHeader>()) as *const T;
                core::ptr::read_volatile(payload)
            };
            fence(Ordering::Acquire);
            if header.head.load(Ordering::Acquire) == tail {
                return Some(copy);
            }
            core::hint::spin_loop();
        }
    }
}

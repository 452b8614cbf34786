//! Real-time plumbing for the servo thread.
//!
//! Setup sequence: lock pages, prefault the stack, pin to a core,
//! switch to SCHED_FIFO. Pacing uses absolute-time sleeps on
//! `CLOCK_MONOTONIC` so the period does not drift with load. All of
//! it compiles to no-ops without the `rt` feature, which is what the
//! simulator and the test suite run under.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RtError {
    #[error("rt setup: {0}")]
    Setup(String),
}

/// O(1) per-cycle timing statistics for the servo loop.
#[derive(Debug, Clone)]
pub struct ServoStats {
    pub cycles: u64,
    pub last_ns: i64,
    pub min_ns: i64,
    pub max_ns: i64,
    pub sum_ns: i64,
    pub overruns: u64,
}

impl ServoStats {
    pub const fn new() -> Self {
        Self {
            cycles: 0,
            last_ns: 0,
            min_ns: i64::MAX,
            max_ns: 0,
            sum_ns: 0,
            overruns: 0,
        }
    }

    #[inline]
    pub fn record(&mut self, duration_ns: i64, budget_ns: i64) {
        self.cycles += 1;
        self.last_ns = duration_ns;
        if duration_ns < self.min_ns {
            self.min_ns = duration_ns;
        }
        if duration_ns > self.max_ns {
            self.max_ns = duration_ns;
        }
        self.sum_ns += duration_ns;
        if duration_ns > budget_ns {
            self.overruns += 1;
        }
    }

    pub fn avg_ns(&self) -> i64 {
        if self.cycles == 0 {
            0
        } else {
            self.sum_ns / self.cycles as i64
        }
    }
}

/// Lock all current and future pages.
#[cfg(feature = "rt")]
fn rt_mlockall() -> Result<(), RtError> {
    use nix::sys::mman::{mlockall, MlockAllFlags};
    mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE)
        .map_err(|e| RtError::Setup(format!("mlockall failed: {e}")))
}

#[cfg(not(feature = "rt"))]
fn rt_mlockall() -> Result<(), RtError> {
    Ok(())
}

/// Touch a chunk of stack so the RT loop never page-faults growing it.
fn prefault_stack() {
    let mut buf = [0u8; 256 * 1024];
    for byte in buf.iter_mut() {
        unsafe { core::ptr::write_volatile(byte, 0xFF) };
    }
    core::hint::black_box(&buf);
}

#[cfg(feature = "rt")]
fn rt_set_affinity(cpu: usize) -> Result<(), RtError> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;
    let mut cpuset = CpuSet::new();
    cpuset
        .set(cpu)
        .map_err(|e| RtError::Setup(format!("CpuSet::set({cpu}): {e}")))?;
    sched_setaffinity(Pid::from_raw(0), &cpuset)
        .map_err(|e| RtError::Setup(format!("sched_setaffinity: {e}")))
}

#[cfg(not(feature = "rt"))]
fn rt_set_affinity(_cpu: usize) -> Result<(), RtError> {
    Ok(())
}

#[cfg(feature = "rt")]
fn rt_set_scheduler(priority: i32) -> Result<(), RtError> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(RtError::Setup(format!(
            "sched_setscheduler(SCHED_FIFO, {priority}): {err}"
        )));
    }
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_set_scheduler(_priority: i32) -> Result<(), RtError> {
    Ok(())
}

/// Full setup sequence for the calling thread.
pub fn rt_setup(cpu_core: usize, rt_priority: i32) -> Result<(), RtError> {
    rt_mlockall()?;
    prefault_stack();
    rt_set_affinity(cpu_core)?;
    rt_set_scheduler(rt_priority)?;
    Ok(())
}

/// Drift-free periodic pacer.
pub struct Pacer {
    period_ns: i64,
    #[cfg(feature = "rt")]
    next_wake: nix::sys::time::TimeSpec,
    #[cfg(not(feature = "rt"))]
    next_wake: std::time::Instant,
}

impl Pacer {
    pub fn new(period_ns: i64) -> Self {
        Self {
            period_ns,
            #[cfg(feature = "rt")]
            next_wake: nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
                .unwrap_or(nix::sys::time::TimeSpec::new(0, 0)),
            #[cfg(not(feature = "rt"))]
            next_wake: std::time::Instant::now(),
        }
    }

    /// Sleep until the next period boundary (absolute time).
    #[cfg(feature = "rt")]
    pub fn wait(&mut self) {
        use nix::time::{clock_nanosleep, ClockId, ClockNanosleepFlags};
        self.next_wake = timespec_add_ns(self.next_wake, self.period_ns);
        let _ = clock_nanosleep(
            ClockId::CLOCK_MONOTONIC,
            ClockNanosleepFlags::TIMER_ABSTIME,
            &self.next_wake,
        );
    }

    #[cfg(not(feature = "rt"))]
    pub fn wait(&mut self) {
        self.next_wake += std::time::Duration::from_nanos(self.period_ns as u64);
        let now = std::time::Instant::now();
        if let Some(remaining) = self.next_wake.checked_duration_since(now) {
            std::thread::sleep(remaining);
        } else {
            // Fell behind; re-anchor rather than burst.
            self.next_wake = now;
        }
    }
}

#[cfg(feature = "rt")]
fn timespec_add_ns(ts: nix::sys::time::TimeSpec, ns: i64) -> nix::sys::time::TimeSpec {
    use nix::sys::time::TimeSpec;
    let mut secs = ts.tv_sec();
    let mut nanos = ts.tv_nsec() + ns;
    while nanos >= 1_000_000_000 {
        secs += 1;
        nanos -= 1_000_000_000;
    }
    TimeSpec::new(secs, nanos)
}

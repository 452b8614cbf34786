//! The step-pulse domain.
//!
//! Three pieces, mirroring the hardware layering: [`ring`] is the
//! SPSC queue of per-servo-tick step segments, [`gpio`] is the
//! logical pin table with batched set/clear shadows, and [`fiq`] is
//! the periodic handler that turns segments into step/direction edges
//! with DDS phase accumulation.
//!
//! Nothing in this crate blocks, allocates after construction, or
//! logs: the FIQ handler may run from the highest-priority context in
//! the system and talks to the servo domain only through atomics.

pub mod fiq;
pub mod gpio;
pub mod ring;

pub use fiq::{FiqShared, FiqStepgen, PwmConfig, StepAxisConfig};
pub use gpio::{GpioMap, PinDesc, PinMode};
pub use ring::{RingConsumer, RingError, RingProducer, StepRing, StepSegment, StepSlot};

/// Axes the pulse generator can drive; matches the joint bound.
pub const MAX_STEP_AXES: usize = rmc_common::pose::MAX_JOINTS;

/// Hard upper bound on ring capacity.
pub const MAX_RING_DEPTH: usize = 128;

/// Default ring capacity: small keeps the command-to-pulse latency
/// down, at the cost of underrun margin on a loaded system.
pub const DEFAULT_RING_DEPTH: usize = 16;

/// PWM channels maintained by the FIQ handler.
pub const MAX_PWM: usize = 2;

/// PWM period in FIQ ticks.
pub const PWM_PERIOD_TICKS: u32 = 100;

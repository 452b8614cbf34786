//! The periodic step-emission handler.
//!
//! Runs at the FIQ period (nominally 10 µs). Each invocation advances
//! a 32-bit DDS phase accumulator per axis by the head segment's
//! `adder` and emits one step edge on carry out of bit 30, so an
//! adder of `PHASE_STEP` produces exactly one step per tick. A
//! segment is consumed after `ticks_per_servo` invocations — one
//! segment per servo period.
//!
//! The handler never blocks, never allocates, and never logs. Its
//! only exports to the servo domain are the atomics in [`FiqShared`]:
//! signed step counters, per-axis position error, the underrun flag,
//! index-latch handshake, and the PWM duty words.

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use crate::gpio::GpioMap;
use crate::ring::RingConsumer;
use crate::{MAX_PWM, MAX_STEP_AXES, PWM_PERIOD_TICKS};

/// Accumulator value that yields one step per tick.
pub const PHASE_STEP: u32 = 1 << 31;

/// Phase mask applied after a step fires.
const PHASE_MASK: u32 = PHASE_STEP - 1;

/// Per-axis wiring of the step generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepAxisConfig {
    /// GPIO table indices; `None` leaves the axis undriven.
    pub step_pin: Option<usize>,
    pub dir_pin: Option<usize>,
    /// XORed into the direction level.
    pub dir_polarity: bool,
    /// Optional encoder index input for homing.
    pub index_pin: Option<usize>,
}

impl StepAxisConfig {
    #[inline]
    pub fn configured(&self) -> bool {
        self.step_pin.is_some() && self.dir_pin.is_some()
    }
}

/// PWM channel wiring.
#[derive(Debug, Clone, Copy, Default)]
pub struct PwmConfig {
    pub pin: Option<usize>,
}

/// State the FIQ publishes to (and accepts from) the servo domain.
pub struct FiqShared {
    step_count: [AtomicI64; MAX_STEP_AXES],
    pos_error: [AtomicI32; MAX_STEP_AXES],
    underrun: AtomicBool,
    underruns: AtomicU32,
    index_enable: [AtomicBool; MAX_STEP_AXES],
    index_latched: [AtomicBool; MAX_STEP_AXES],
    index_latch: [AtomicI64; MAX_STEP_AXES],
    /// Duty per channel in percent 0..=100 (writer scales from the
    /// 0..=10000 external range).
    pwm_duty: [AtomicU32; MAX_PWM],
}

impl FiqShared {
    fn new() -> Self {
        Self {
            step_count: core::array::from_fn(|_| AtomicI64::new(0)),
            pos_error: core::array::from_fn(|_| AtomicI32::new(0)),
            underrun: AtomicBool::new(false),
            underruns: AtomicU32::new(0),
            index_enable: core::array::from_fn(|_| AtomicBool::new(false)),
            index_latched: core::array::from_fn(|_| AtomicBool::new(false)),
            index_latch: core::array::from_fn(|_| AtomicI64::new(0)),
            pwm_duty: core::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    /// Signed emitted-step counter for an axis.
    #[inline]
    pub fn step_count(&self, axis: usize) -> i64 {
        self.step_count[axis].load(Ordering::Acquire)
    }

    /// `cmd_position − step_count` as of the last tick [steps].
    #[inline]
    pub fn pos_error(&self, axis: usize) -> i32 {
        self.pos_error[axis].load(Ordering::Acquire)
    }

    /// Read and clear the underrun flag.
    pub fn take_underrun(&self) -> bool {
        self.underrun.swap(false, Ordering::AcqRel)
    }

    /// Total underruns since start.
    pub fn underruns(&self) -> u32 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Arm the index latch for a homing joint.
    pub fn request_index(&self, axis: usize) {
        self.index_latched[axis].store(false, Ordering::Release);
        self.index_enable[axis].store(true, Ordering::Release);
    }

    /// Step count latched at the index pulse, once seen.
    pub fn index_result(&self, axis: usize) -> Option<i64> {
        if self.index_latched[axis].load(Ordering::Acquire) {
            Some(self.index_latch[axis].load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// Set a PWM duty in the external 0..=10000 range.
    pub fn set_pwm_duty(&self, channel: usize, value: i32) {
        if channel >= MAX_PWM {
            return;
        }
        let percent = (value.clamp(0, 10_000) as u32) * 100 / 10_000;
        self.pwm_duty[channel].store(percent, Ordering::Release);
    }

    /// Force the step counter (homing establishes a new origin).
    pub fn preset_step_count(&self, axis: usize, steps: i64) {
        self.step_count[axis].store(steps, Ordering::Release);
    }
}

struct AxisRt {
    cfg: StepAxisConfig,
    accum: u32,
    /// Direction currently on the wire.
    dir: bool,
    /// Step output currently high; lowered at the next tick.
    step_high: bool,
    index_level: bool,
}

struct PwmRt {
    cfg: PwmConfig,
    counter: u32,
    level: bool,
}

/// The handler itself. Owned by whatever drives the FIQ period.
pub struct FiqStepgen {
    shared: Arc<FiqShared>,
    consumer: RingConsumer,
    gpio: Arc<GpioMap>,
    axes: [AxisRt; MAX_STEP_AXES],
    pwm: [PwmRt; MAX_PWM],
    /// Optional scanner-sync output mirrored from axis 0 segments.
    scan_sync_pin: Option<usize>,
    ticks_per_servo: u32,
    tick_in_segment: u32,
}

impl FiqStepgen {
    pub fn new(
        consumer: RingConsumer,
        gpio: Arc<GpioMap>,
        axes: [StepAxisConfig; MAX_STEP_AXES],
        pwm: [PwmConfig; MAX_PWM],
        scan_sync_pin: Option<usize>,
        ticks_per_servo: u32,
    ) -> (Self, Arc<FiqShared>) {
        let shared = Arc::new(FiqShared::new());
        let r#gen = Self {
            shared: Arc::clone(&shared),
            consumer,
            gpio,
            axes: axes.map(|cfg| AxisRt {
                cfg,
                accum: 0,
                dir: false,
                step_high: false,
                index_level: false,
            }),
            pwm: pwm.map(|cfg| PwmRt {
                cfg,
                counter: 0,
                level: false,
            }),
            scan_sync_pin,
            ticks_per_servo: ticks_per_servo.max(1),
            tick_in_segment: 0,
        };
        (r#gen, shared)
    }

    /// One FIQ invocation.
    pub fn tick(&mut self) {
        self.consumer.absorb_updates();
        self.gpio.apply_shadows();

        // Finish last tick's step pulses (pulse width = one period).
        for axis in self.axes.iter_mut() {
            if axis.step_high {
                if let Some(pin) = axis.cfg.step_pin {
                    if let Some(desc) = self.gpio.desc(pin) {
                        self.gpio.write_direct(desc.port, 1 << desc.bit, false);
                    }
                }
                axis.step_high = false;
            }
        }

        self.run_pwm();

        let Some(head) = self.consumer.peek() else {
            // Nothing to emit. No catch-up: the next segment starts a
            // fresh allotment.
            if self.any_configured() {
                self.shared.underrun.store(true, Ordering::Release);
                self.shared.underruns.fetch_add(1, Ordering::Relaxed);
            }
            self.tick_in_segment = 0;
            return;
        };

        if let Some(pin) = self.scan_sync_pin {
            if let Some(desc) = self.gpio.desc(pin) {
                self.gpio
                    .write_direct(desc.port, 1 << desc.bit, head.axes[0].scan_sync);
            }
        }

        for (i, axis) in self.axes.iter_mut().enumerate() {
            if !axis.cfg.configured() {
                continue;
            }
            let slot = &head.axes[i];

            // A direction flip takes effect one full tick before any
            // step edge in the new direction.
            if slot.direction != axis.dir {
                axis.dir = slot.direction;
                if let Some(pin) = axis.cfg.dir_pin {
                    if let Some(desc) = self.gpio.desc(pin) {
                        self.gpio.write_direct(
                            desc.port,
                            1 << desc.bit,
                            slot.direction ^ axis.cfg.dir_polarity,
                        );
                    }
                }
            } else {
                axis.accum = axis.accum.wrapping_add(slot.adder);
                if axis.accum & PHASE_STEP != 0 {
                    axis.accum &= PHASE_MASK;
                    if let Some(pin) = axis.cfg.step_pin {
                        if let Some(desc) = self.gpio.desc(pin) {
                            self.gpio.write_direct(desc.port, 1 << desc.bit, true);
                        }
                    }
                    axis.step_high = true;
                    let delta = if axis.dir { -1 } else { 1 };
                    self.shared.step_count[i].fetch_add(delta, Ordering::AcqRel);
                }
            }

            let count = self.shared.step_count[i].load(Ordering::Relaxed);
            let err = slot.cmd_position.saturating_sub(count);
            self.shared.pos_error[i]
                .store(err.clamp(i32::MIN as i64, i32::MAX as i64) as i32, Ordering::Release);

            // Index pulse latch for homing.
            if let Some(pin) = axis.cfg.index_pin {
                let level = self.gpio.get_pin(pin).unwrap_or(false);
                let rising = level && !axis.index_level;
                axis.index_level = level;
                if rising && self.shared.index_enable[i].load(Ordering::Acquire) {
                    self.shared.index_latch[i].store(count, Ordering::Release);
                    self.shared.index_enable[i].store(false, Ordering::Release);
                    self.shared.index_latched[i].store(true, Ordering::Release);
                }
            }
        }

        self.tick_in_segment += 1;
        if self.tick_in_segment >= self.ticks_per_servo {
            self.consumer.advance();
            self.tick_in_segment = 0;
        }
    }

    fn run_pwm(&mut self) {
        for (ch, pwm) in self.pwm.iter_mut().enumerate() {
            let Some(pin) = pwm.cfg.pin else { continue };
            pwm.counter = (pwm.counter + 1) % PWM_PERIOD_TICKS;
            let duty = self.shared.pwm_duty[ch].load(Ordering::Relaxed);
            let level = pwm.counter < duty;
            if level != pwm.level {
                pwm.level = level;
                if let Some(desc) = self.gpio.desc(pin) {
                    self.gpio.write_direct(desc.port, 1 << desc.bit, level);
                }
            }
        }
    }

    fn any_configured(&self) -> bool {
        self.axes.iter().any(|a| a.cfg.configured())
    }

    /// Ring occupancy as seen by the consumer.
    pub fn queue_len(&self) -> usize {
        self.consumer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::PinDesc;
    use crate::ring::{StepRing, StepSegment};
    use crate::DEFAULT_RING_DEPTH;

    const TICKS: u32 = 100;

    fn rig() -> (FiqStepgen, Arc<FiqShared>, crate::ring::RingProducer, Arc<GpioMap>) {
        let gpio = Arc::new(
            GpioMap::new(vec![
                PinDesc::output(0, 0, "STEP0"),
                PinDesc::output(0, 1, "DIR0"),
                PinDesc::input(1, 0, "INDEX0"),
            ])
            .unwrap(),
        );
        for i in 0..3 {
            gpio.configure(i).unwrap();
        }
        let (producer, consumer) = StepRing::with_capacity(DEFAULT_RING_DEPTH).unwrap();
        let mut axes = [StepAxisConfig::default(); MAX_STEP_AXES];
        axes[0] = StepAxisConfig {
            step_pin: Some(0),
            dir_pin: Some(1),
            dir_polarity: false,
            index_pin: Some(2),
        };
        let (r#gen, shared) = FiqStepgen::new(
            consumer,
            Arc::clone(&gpio),
            axes,
            [PwmConfig::default(); MAX_PWM],
            None,
            TICKS,
        );
        (r#gen, shared, producer, gpio)
    }

    fn seg(cmd_position: i64, adder: u32, direction: bool) -> StepSegment {
        let mut s = StepSegment::default();
        s.axes[0].cmd_position = cmd_position;
        s.axes[0].adder = adder;
        s.axes[0].direction = direction;
        s
    }

    #[test]
    fn full_rate_adder_steps_every_tick() {
        let (mut r#gen, shared, mut producer, _) = rig();
        producer.publish(&seg(TICKS as i64, PHASE_STEP, false)).unwrap();
        for _ in 0..TICKS {
            r#gen.tick();
        }
        assert_eq!(shared.step_count(0), TICKS as i64);
        assert_eq!(shared.pos_error(0), 0);
    }

    #[test]
    fn half_rate_adder_steps_half_the_ticks() {
        let (mut r#gen, shared, mut producer, _) = rig();
        producer
            .publish(&seg(TICKS as i64 / 2, PHASE_STEP / 2, false))
            .unwrap();
        for _ in 0..TICKS {
            r#gen.tick();
        }
        assert_eq!(shared.step_count(0), TICKS as i64 / 2);
    }

    #[test]
    fn segment_consumed_after_its_allotment() {
        let (mut r#gen, _, mut producer, _) = rig();
        producer.publish(&seg(1, 0, false)).unwrap();
        producer.publish(&seg(1, 0, false)).unwrap();
        r#gen.tick();
        assert_eq!(r#gen.queue_len(), 2);
        for _ in 1..TICKS {
            r#gen.tick();
        }
        assert_eq!(r#gen.queue_len(), 1);
        for _ in 0..TICKS {
            r#gen.tick();
        }
        assert_eq!(r#gen.queue_len(), 0);
    }

    #[test]
    fn direction_change_delays_first_step_one_tick() {
        let (mut r#gen, shared, mut producer, gpio) = rig();
        // Reverse at full rate: first tick only flips the dir pin.
        producer.publish(&seg(-(TICKS as i64), PHASE_STEP, true)).unwrap();
        r#gen.tick();
        assert_eq!(shared.step_count(0), 0);
        assert!(gpio.get_pin(1).unwrap(), "dir pin should lead steps");
        for _ in 1..TICKS {
            r#gen.tick();
        }
        assert_eq!(shared.step_count(0), -(TICKS as i64 - 1));
    }

    #[test]
    fn negative_direction_decrements() {
        let (mut r#gen, shared, mut producer, _) = rig();
        producer.publish(&seg(0, 0, true)).unwrap();
        for _ in 0..TICKS {
            r#gen.tick();
        }
        producer.publish(&seg(-10, PHASE_STEP / 10, true)).unwrap();
        for _ in 0..TICKS {
            r#gen.tick();
        }
        assert!(shared.step_count(0) < 0);
    }

    #[test]
    fn underrun_sets_flag_and_recovers() {
        let (mut r#gen, shared, mut producer, _) = rig();
        r#gen.tick();
        assert!(shared.take_underrun());
        assert!(!shared.take_underrun());
        assert_eq!(shared.underruns(), 1);

        // Producer resumes: next tick emits normally.
        producer.publish(&seg(1, PHASE_STEP, false)).unwrap();
        r#gen.tick();
        assert!(!shared.take_underrun());
        assert_eq!(shared.step_count(0), 1);
    }

    #[test]
    fn pos_error_tracks_shortfall() {
        let (mut r#gen, shared, mut producer, _) = rig();
        // Command claims 10 steps but the adder emits none.
        producer.publish(&seg(10, 0, false)).unwrap();
        for _ in 0..TICKS {
            r#gen.tick();
        }
        assert_eq!(shared.pos_error(0), 10);
    }

    #[test]
    fn index_latch_handshake() {
        let (mut r#gen, shared, mut producer, gpio) = rig();
        producer.publish(&seg(TICKS as i64, PHASE_STEP, false)).unwrap();
        shared.request_index(0);
        for _ in 0..10 {
            r#gen.tick();
        }
        assert!(shared.index_result(0).is_none());
        gpio.drive_input(2, true).unwrap();
        r#gen.tick();
        let latched = shared.index_result(0).expect("index should latch");
        assert!(latched > 0);
        // Latch is edge-triggered and one-shot.
        let before = latched;
        r#gen.tick();
        assert_eq!(shared.index_result(0), Some(before));
    }

    #[test]
    fn pwm_duty_scales_to_period() {
        let gpio = Arc::new(GpioMap::new(vec![PinDesc::output(2, 0, "PWM0")]).unwrap());
        gpio.configure(0).unwrap();
        let (_, consumer) = StepRing::with_capacity(4).unwrap();
        let mut pwm = [PwmConfig::default(); MAX_PWM];
        pwm[0] = PwmConfig { pin: Some(0) };
        let (mut r#gen, shared) = FiqStepgen::new(
            consumer,
            Arc::clone(&gpio),
            [StepAxisConfig::default(); MAX_STEP_AXES],
            pwm,
            None,
            TICKS,
        );
        shared.set_pwm_duty(0, 2_500); // 25%
        let mut high = 0u32;
        for _ in 0..PWM_PERIOD_TICKS {
            r#gen.tick();
            if gpio.get_pin(0).unwrap() {
                high += 1;
            }
        }
        assert_eq!(high, 25);
    }
}

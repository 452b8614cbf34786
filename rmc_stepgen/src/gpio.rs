//! Logical GPIO map with batched set/clear shadows.
//!
//! A static table maps logical pin index → (port, bit, declared
//! mode). Pins are configured and reserved once at init; runtime
//! writers OR bitmasks into per-port set/clear shadow registers, and
//! the FIQ handler applies both shadows to the port data registers in
//! one pass. That lets many pins change on a single tick without the
//! servo loop racing the step emitter on the same port.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use thiserror::Error;

/// Ports this map can address.
pub const MAX_PORTS: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GpioError {
    #[error("pin index {0} out of range")]
    BadPin(usize),
    #[error("pin {0} already configured")]
    InUse(usize),
    #[error("pin {0} not configured")]
    NotConfigured(usize),
    #[error("pin mode mismatch: declared {declared:?}, requested {requested:?}")]
    ModeMismatch {
        declared: PinMode,
        requested: PinMode,
    },
    #[error("port index {0} out of range")]
    BadPort(u8),
}

/// Pin electrical role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PinMode {
    /// Unconfigured.
    None = 0,
    Input = 1,
    Output = 2,
    /// Driven by a peripheral block (PWM timer).
    Peripheral = 3,
    /// Configured and claimed by the step generator; not available
    /// for general i/o.
    Reserved = 4,
}

/// One row of the static pin table.
#[derive(Debug, Clone, Copy)]
pub struct PinDesc {
    pub port: u8,
    pub bit: u8,
    pub mode: PinMode,
    /// XORed into the level at the boundary, both directions.
    pub invert: bool,
    pub name: &'static str,
}

impl PinDesc {
    pub const fn output(port: u8, bit: u8, name: &'static str) -> Self {
        Self {
            port,
            bit,
            mode: PinMode::Output,
            invert: false,
            name,
        }
    }

    pub const fn input(port: u8, bit: u8, name: &'static str) -> Self {
        Self {
            port,
            bit,
            mode: PinMode::Input,
            invert: false,
            name,
        }
    }

    /// Same pin, active-low on the wire.
    pub const fn inverted(mut self) -> Self {
        self.invert = true;
        self
    }

    #[inline]
    const fn mask(&self) -> u32 {
        1 << self.bit
    }
}

/// The pin table plus runtime shadow state.
pub struct GpioMap {
    table: Vec<PinDesc>,
    in_use: Vec<AtomicU32>, // PinMode as u32; atomic for concurrent query
    /// Bits to set, per port; writer ORs, consumer drains.
    set_shadow: [AtomicU32; MAX_PORTS],
    /// Bits to clear, per port.
    clr_shadow: [AtomicU32; MAX_PORTS],
    /// Simulated/mirrored port data registers.
    levels: [AtomicU32; MAX_PORTS],
    /// Shadows carry news for the consumer.
    changed: AtomicBool,
}

impl GpioMap {
    pub fn new(table: Vec<PinDesc>) -> Result<Self, GpioError> {
        for desc in &table {
            if desc.port as usize >= MAX_PORTS {
                return Err(GpioError::BadPort(desc.port));
            }
        }
        let in_use = table.iter().map(|_| AtomicU32::new(0)).collect();
        Ok(Self {
            table,
            in_use,
            set_shadow: core::array::from_fn(|_| AtomicU32::new(0)),
            clr_shadow: core::array::from_fn(|_| AtomicU32::new(0)),
            levels: core::array::from_fn(|_| AtomicU32::new(0)),
            changed: AtomicBool::new(false),
        })
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn desc(&self, index: usize) -> Option<&PinDesc> {
        self.table.get(index)
    }

    /// Find a pin by table name.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.table.iter().position(|d| d.name == name)
    }

    /// Configure a pin in its declared mode. Fails if already taken.
    pub fn configure(&self, index: usize) -> Result<(), GpioError> {
        let desc = self.table.get(index).ok_or(GpioError::BadPin(index))?;
        let slot = &self.in_use[index];
        if slot
            .compare_exchange(
                PinMode::None as u32,
                desc.mode as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(GpioError::InUse(index));
        }
        Ok(())
    }

    /// Mark a configured pin as owned by the step generator.
    pub fn reserve(&self, index: usize) -> Result<(), GpioError> {
        if index >= self.table.len() {
            return Err(GpioError::BadPin(index));
        }
        let slot = &self.in_use[index];
        if slot.load(Ordering::Acquire) == PinMode::None as u32 {
            return Err(GpioError::NotConfigured(index));
        }
        slot.store(PinMode::Reserved as u32, Ordering::Release);
        Ok(())
    }

    /// Current runtime mode.
    pub fn mode(&self, index: usize) -> PinMode {
        match self.in_use.get(index).map(|m| m.load(Ordering::Acquire)) {
            Some(1) => PinMode::Input,
            Some(2) => PinMode::Output,
            Some(3) => PinMode::Peripheral,
            Some(4) => PinMode::Reserved,
            _ => PinMode::None,
        }
    }

    /// Queue a level change for an output pin. Applied by the
    /// consumer's next [`Self::apply_shadows`].
    pub fn set_pin(&self, index: usize, value: bool) -> Result<(), GpioError> {
        let desc = self.table.get(index).ok_or(GpioError::BadPin(index))?;
        match self.mode(index) {
            PinMode::Output | PinMode::Reserved => {}
            declared => {
                return Err(GpioError::ModeMismatch {
                    declared,
                    requested: PinMode::Output,
                })
            }
        }
        let port = desc.port as usize;
        let level = value ^ desc.invert;
        if level {
            self.set_shadow[port].fetch_or(desc.mask(), Ordering::AcqRel);
            self.clr_shadow[port].fetch_and(!desc.mask(), Ordering::AcqRel);
        } else {
            self.clr_shadow[port].fetch_or(desc.mask(), Ordering::AcqRel);
            self.set_shadow[port].fetch_and(!desc.mask(), Ordering::AcqRel);
        }
        self.changed.store(true, Ordering::Release);
        Ok(())
    }

    /// Read a pin level from the port data register.
    pub fn get_pin(&self, index: usize) -> Result<bool, GpioError> {
        let desc = self.table.get(index).ok_or(GpioError::BadPin(index))?;
        if self.mode(index) == PinMode::None {
            return Err(GpioError::NotConfigured(index));
        }
        let raw = self.levels[desc.port as usize].load(Ordering::Acquire) & desc.mask() != 0;
        Ok(raw ^ desc.invert)
    }

    /// Consumer side: fold both shadows into the data registers.
    /// Cheap no-op when nothing changed.
    pub fn apply_shadows(&self) {
        if !self.changed.swap(false, Ordering::AcqRel) {
            return;
        }
        for port in 0..MAX_PORTS {
            let set = self.set_shadow[port].swap(0, Ordering::AcqRel);
            let clr = self.clr_shadow[port].swap(0, Ordering::AcqRel);
            if set != 0 {
                self.levels[port].fetch_or(set, Ordering::AcqRel);
            }
            if clr != 0 {
                self.levels[port].fetch_and(!clr, Ordering::AcqRel);
            }
        }
    }

    /// Immediate pin write from the FIQ itself (step/dir edges bypass
    /// the shadow round-trip; the FIQ is the consumer).
    #[inline]
    pub fn write_direct(&self, port: u8, mask: u32, value: bool) {
        let port = port as usize & (MAX_PORTS - 1);
        if value {
            self.levels[port].fetch_or(mask, Ordering::AcqRel);
        } else {
            self.levels[port].fetch_and(!mask, Ordering::AcqRel);
        }
    }

    /// Test/simulation hook: drive an input pin level.
    pub fn drive_input(&self, index: usize, value: bool) -> Result<(), GpioError> {
        let desc = self.table.get(index).ok_or(GpioError::BadPin(index))?;
        self.write_direct(desc.port, desc.mask(), value);
        Ok(())
    }

    /// Raw port level register (diagnostics).
    pub fn port_level(&self, port: usize) -> u32 {
        self.levels[port & (MAX_PORTS - 1)].load(Ordering::Acquire)
    }
}

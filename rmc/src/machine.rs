//! Machine wiring: from a validated config to running threads.
//!
//! The supervisor builds one canonical GPIO plan (step/dir rows per
//! axis, four general outputs, two PWM rows, limit/home/index/probe
//! inputs), hands the output half to the FIQ and the input half to
//! the servo scan, and owns both real-time threads plus the task and
//! io loops.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{info, warn};

use rmc_channel::{CommandChannel, StatusChannel};
use rmc_common::config::Config;
use rmc_common::error::CommonError;
use rmc_common::io_cmd::{IoCommand, IoStatus};
use rmc_common::motion_cmd::MotionCommand;
use rmc_common::motion_status::MotionStatus;
use rmc_common::params::ParamFile;
use rmc_common::pose::MAX_JOINTS;
use rmc_common::DEFAULT_FIQ_PERIOD_NS;
use rmc_io::{IoController, ToolTable};
use rmc_motion::comp::CompFileType;
use rmc_motion::control::{IoInputs, MotionLoop};
use rmc_motion::joint::Joint;
use rmc_motion::IdentityKins;
use rmc_stepgen::fiq::{FiqStepgen, PwmConfig, StepAxisConfig};
use rmc_stepgen::gpio::{GpioMap, PinDesc};
use rmc_stepgen::ring::StepRing;
use rmc_stepgen::{DEFAULT_RING_DEPTH, MAX_PWM, MAX_STEP_AXES};
use rmc_task::TaskFsm;

use crate::rt::{self, Pacer, ServoStats};

// Names must be 'static for the pin table; one row per possible axis.
static STEP_NAMES: [&str; MAX_JOINTS] = [
    "STEP0", "STEP1", "STEP2", "STEP3", "STEP4", "STEP5", "STEP6", "STEP7", "STEP8",
];
static DIR_NAMES: [&str; MAX_JOINTS] = [
    "DIR0", "DIR1", "DIR2", "DIR3", "DIR4", "DIR5", "DIR6", "DIR7", "DIR8",
];
static DOUT_NAMES: [&str; 4] = ["DOUT0", "DOUT1", "DOUT2", "DOUT3"];
static PWM_NAMES: [&str; MAX_PWM] = ["PWM0", "PWM1"];
static POS_LIMIT_NAMES: [&str; MAX_JOINTS] = [
    "LIMP0", "LIMP1", "LIMP2", "LIMP3", "LIMP4", "LIMP5", "LIMP6", "LIMP7", "LIMP8",
];
static NEG_LIMIT_NAMES: [&str; MAX_JOINTS] = [
    "LIMN0", "LIMN1", "LIMN2", "LIMN3", "LIMN4", "LIMN5", "LIMN6", "LIMN7", "LIMN8",
];
static HOME_NAMES: [&str; MAX_JOINTS] = [
    "HOME0", "HOME1", "HOME2", "HOME3", "HOME4", "HOME5", "HOME6", "HOME7", "HOME8",
];
static INDEX_NAMES: [&str; MAX_JOINTS] = [
    "INDEX0", "INDEX1", "INDEX2", "INDEX3", "INDEX4", "INDEX5", "INDEX6", "INDEX7", "INDEX8",
];

/// Resolved pin rows for the canonical plan.
#[derive(Debug, Clone, Default)]
pub struct PinPlan {
    pub step: [Option<usize>; MAX_JOINTS],
    pub dir: [Option<usize>; MAX_JOINTS],
    pub pos_limit: [Option<usize>; MAX_JOINTS],
    pub neg_limit: [Option<usize>; MAX_JOINTS],
    pub home: [Option<usize>; MAX_JOINTS],
    pub index: [Option<usize>; MAX_JOINTS],
    pub dout: [Option<usize>; 4],
    pub pwm: [Option<usize>; MAX_PWM],
    pub watchdog: Option<usize>,
    pub probe: Option<usize>,
    /// Enable chain input, active low on the wire.
    pub enable: Option<usize>,
}

/// Build the canonical pin table for the configured axes.
pub fn build_pin_plan(config: &Config) -> (Vec<PinDesc>, PinPlan) {
    let mut table = Vec::new();
    let mut plan = PinPlan::default();
    let n = config.traj.joints as usize;

    for i in 0..n {
        let axis = &config.axes[i];
        if axis.step_pin < 0 || axis.dir_pin < 0 {
            continue;
        }
        plan.step[i] = Some(table.len());
        table.push(PinDesc::output(0, i as u8, STEP_NAMES[i]));
        plan.dir[i] = Some(table.len());
        table.push(PinDesc::output(0, 9 + i as u8, DIR_NAMES[i]));
    }
    for (d, &name) in DOUT_NAMES.iter().enumerate() {
        plan.dout[d] = Some(table.len());
        table.push(PinDesc::output(1, d as u8, name));
    }
    for (p, &name) in PWM_NAMES.iter().enumerate() {
        plan.pwm[p] = Some(table.len());
        table.push(PinDesc::output(1, 8 + p as u8, name));
    }
    plan.watchdog = Some(table.len());
    table.push(PinDesc::output(1, 12, "WATCHDOG"));

    for i in 0..n {
        plan.pos_limit[i] = Some(table.len());
        table.push(PinDesc::input(2, i as u8, POS_LIMIT_NAMES[i]));
        plan.neg_limit[i] = Some(table.len());
        table.push(PinDesc::input(2, 9 + i as u8, NEG_LIMIT_NAMES[i]));
        plan.home[i] = Some(table.len());
        table.push(PinDesc::input(3, i as u8, HOME_NAMES[i]));
        plan.index[i] = Some(table.len());
        table.push(PinDesc::input(3, 9 + i as u8, INDEX_NAMES[i]));
    }
    plan.probe = Some(table.len());
    table.push(PinDesc::input(4, 0, "PROBE"));
    plan.enable = Some(table.len());
    table.push(PinDesc::input(4, 1, "ENABLE_N"));

    (table, plan)
}

/// Sample the servo-side inputs from the pin plan.
fn scan_inputs(gpio: &GpioMap, plan: &PinPlan, n: usize) -> IoInputs {
    let read = |pin: Option<usize>| pin.map(|p| gpio.get_pin(p).unwrap_or(false)).unwrap_or(false);
    let mut io = IoInputs::default();
    for i in 0..n {
        io.joints[i].pos_limit = read(plan.pos_limit[i]);
        io.joints[i].neg_limit = read(plan.neg_limit[i]);
        io.joints[i].home_switch = read(plan.home[i]);
    }
    io.probe = read(plan.probe);
    // Enable chain is wired active-low.
    io.enable = !read(plan.enable);
    io
}

pub struct Machine {
    task: TaskFsm,
    io_ctl: IoController,
    gpio: Arc<GpioMap>,
    stop: Arc<AtomicBool>,
    servo_thread: Option<JoinHandle<ServoStats>>,
    fiq_thread: Option<JoinHandle<()>>,
    params: ParamFile,
}

impl Machine {
    /// Construct everything and start the real-time threads.
    pub fn bring_up(
        config: &Config,
        params: ParamFile,
        servo_cpu: usize,
        servo_priority: i32,
    ) -> Result<Self, CommonError> {
        let n = config.traj.joints as usize;
        let (table, plan) = build_pin_plan(config);
        let gpio = Arc::new(GpioMap::new(table).map_err(|e| CommonError::Config(e.to_string()))?);
        for idx in 0..gpio.len() {
            gpio.configure(idx)
                .map_err(|e| CommonError::Config(e.to_string()))?;
        }
        for i in 0..n {
            if let (Some(s), Some(d)) = (plan.step[i], plan.dir[i]) {
                gpio.reserve(s).ok();
                gpio.reserve(d).ok();
            }
        }

        // Step ring + FIQ handler.
        let ticks_per_servo =
            (config.traj.servo_period_ns / DEFAULT_FIQ_PERIOD_NS).max(1) as u32;
        let (ring_tx, ring_rx) = StepRing::with_capacity(DEFAULT_RING_DEPTH)
            .map_err(|e| CommonError::Config(e.to_string()))?;
        let mut axis_cfgs = [StepAxisConfig::default(); MAX_STEP_AXES];
        for i in 0..n {
            axis_cfgs[i] = StepAxisConfig {
                step_pin: plan.step[i],
                dir_pin: plan.dir[i],
                dir_polarity: config.axes[i].dir_polarity,
                index_pin: plan.index[i],
            };
        }
        let mut pwm_cfgs = [PwmConfig::default(); MAX_PWM];
        for p in 0..MAX_PWM {
            pwm_cfgs[p] = PwmConfig { pin: plan.pwm[p] };
        }
        let (mut fiq, fiq_shared) = FiqStepgen::new(
            ring_rx,
            Arc::clone(&gpio),
            axis_cfgs,
            pwm_cfgs,
            None,
            ticks_per_servo,
        );

        // Channels.
        let (motion_cmd_tx, motion_cmd_rx) = CommandChannel::new::<MotionCommand>();
        let (io_cmd_tx, io_cmd_rx) = CommandChannel::new::<IoCommand>();
        let (motion_status_tx, motion_status_rx) = StatusChannel::new::<MotionStatus>();
        let (io_status_tx, io_status_rx) = StatusChannel::new::<IoStatus>();

        // Joints, with screw compensation loaded where configured.
        let mut joints = Vec::with_capacity(n);
        for (i, axis) in config.axes.iter().enumerate() {
            let mut joint = Joint::from_config(axis);
            if !axis.comp_file.is_empty() {
                let file_type = CompFileType::from_u8(axis.comp_file_type).ok_or_else(|| {
                    CommonError::Config(format!(
                        "[AXIS_{i}] COMP_FILE_TYPE = {}: expected 0 or 1",
                        axis.comp_file_type
                    ))
                })?;
                let entries = joint.comp.load(Path::new(&axis.comp_file), file_type)?;
                info!(joint = i, entries, file = %axis.comp_file, "compensation loaded");
            }
            joint.activate();
            joints.push(joint);
        }

        let servo_period = config.traj.servo_period_ns as f64 / 1e9;
        let mut motion = MotionLoop::new(
            joints,
            Box::new(IdentityKins),
            config.traj.max_velocity,
            config.traj.max_acceleration,
            servo_period,
            config.interpolation_rate(),
            motion_cmd_rx,
            motion_status_tx,
            Some(ring_tx),
            Some(Arc::clone(&fiq_shared)),
        );

        // Repeated coordinate letters make later joints slave motors
        // on the earlier joint's axis.
        let letters = config.traj.axis_letter_map()?;
        let mut slave_of = [None; MAX_JOINTS];
        for (j, &axis) in letters.iter().enumerate() {
            if let Some(master) = letters[..j].iter().position(|&a| a == axis) {
                slave_of[j] = Some(master);
                info!(joint = j, master, "slave joint");
            }
        }
        motion.set_slaves(slave_of);

        let stop = Arc::new(AtomicBool::new(false));

        // FIQ thread. On target hardware this handler runs from the
        // high-priority timer interrupt; the hosted build paces it
        // with a thread.
        let fiq_stop = Arc::clone(&stop);
        let fiq_thread = std::thread::Builder::new()
            .name("rmc-fiq".into())
            .spawn(move || {
                let mut pacer = Pacer::new(DEFAULT_FIQ_PERIOD_NS);
                while !fiq_stop.load(Ordering::Acquire) {
                    fiq.tick();
                    pacer.wait();
                }
            })
            .map_err(CommonError::Io)?;

        // Servo thread.
        let servo_stop = Arc::clone(&stop);
        let servo_gpio = Arc::clone(&gpio);
        let servo_plan = plan.clone();
        let servo_period_ns = config.traj.servo_period_ns;
        let io_update_period = config.io.io_update_period;
        let servo_thread = std::thread::Builder::new()
            .name("rmc-servo".into())
            .spawn(move || {
                if let Err(e) = rt::rt_setup(servo_cpu, servo_priority) {
                    warn!("servo thread running without rt guarantees: {e}");
                }
                let mut stats = ServoStats::new();
                let mut pacer = Pacer::new(servo_period_ns);
                let mut watchdog_level = false;
                let mut io = IoInputs::default();
                let mut scan_phase = 0u32;
                while !servo_stop.load(Ordering::Acquire) {
                    let started = std::time::Instant::now();
                    // Pin scans are decimated; between scans the last
                    // snapshot stands.
                    if scan_phase == 0 {
                        io = scan_inputs(&servo_gpio, &servo_plan, motion.joints().len());
                    }
                    scan_phase = (scan_phase + 1) % io_update_period;
                    motion.tick(&io);

                    let outputs = motion.take_outputs();
                    for &(idx, level) in outputs.douts.iter() {
                        if let Some(pin) = servo_plan.dout.get(idx as usize).copied().flatten() {
                            let _ = servo_gpio.set_pin(pin, level);
                        }
                    }
                    for &(idx, value) in outputs.aouts.iter() {
                        fiq_shared.set_pwm_duty(idx as usize, (value * 10_000.0) as i32);
                    }
                    if motion.watchdog_enabled() {
                        watchdog_level = !watchdog_level;
                        if let Some(pin) = servo_plan.watchdog {
                            let _ = servo_gpio.set_pin(pin, watchdog_level);
                        }
                    }

                    stats.record(started.elapsed().as_nanos() as i64, servo_period_ns);
                    pacer.wait();
                }
                stats
            })
            .map_err(CommonError::Io)?;

        // Tool table: a bad line is fatal at init, a missing file is
        // an empty changer.
        let table_path = std::path::PathBuf::from(&config.io.tool_table);
        let tool_table = match ToolTable::load(&table_path) {
            Ok(t) => t,
            Err(CommonError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %table_path.display(), "tool table missing; starting empty");
                ToolTable::new()
            }
            Err(e) => return Err(e),
        };
        let io_ctl = IoController::new(io_cmd_rx, io_status_tx, tool_table, Some(table_path));

        let task = TaskFsm::new(
            motion_cmd_tx,
            io_cmd_tx,
            motion_status_rx,
            io_status_rx,
            config.task.cycle_time,
        );

        Ok(Self {
            task,
            io_ctl,
            gpio,
            stop,
            servo_thread: Some(servo_thread),
            fiq_thread: Some(fiq_thread),
            params,
        })
    }

    /// Access for an embedding transport (tests, external frontends).
    pub fn task_mut(&mut self) -> &mut TaskFsm {
        &mut self.task
    }

    pub fn gpio(&self) -> &Arc<GpioMap> {
        &self.gpio
    }

    /// The cooperative task-domain loop; returns on shutdown request.
    pub fn task_loop(&mut self, config: &Config) {
        let period_ns = (config.task.cycle_time * 1e9) as i64;
        let mut pacer = Pacer::new(period_ns.max(1_000_000));
        while !crate::shutdown_requested() {
            self.task.cycle();
            self.io_ctl.cycle();
            while let Some(msg) = self.task.ops.pop() {
                info!(serial = msg.serial, "operator: {}", msg.text.as_str());
            }
            while let Some(msg) = self.io_ctl.ops.pop() {
                info!(serial = msg.serial, "io: {}", msg.text.as_str());
            }
            pacer.wait();
        }
        info!("shutdown requested");
    }

    /// Stop the threads and surrender the parameter store for saving.
    pub fn tear_down(mut self) -> ParamFile {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.servo_thread.take() {
            if let Ok(stats) = handle.join() {
                info!(
                    cycles = stats.cycles,
                    avg_ns = stats.avg_ns(),
                    max_ns = stats.max_ns,
                    overruns = stats.overruns,
                    "servo thread stopped"
                );
            }
        }
        if let Some(handle) = self.fiq_thread.take() {
            let _ = handle.join();
        }
        self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmc_common::ini::IniFile;

    fn test_config() -> Config {
        let text = r#"
[TRAJ]
AXES = 2
MAX_VELOCITY = 30.0
MAX_ACCELERATION = 300.0
SERVO_PERIOD = 1000000
TRAJ_PERIOD = 10000000

[AXIS_0]
TYPE = LINEAR
MAX_VELOCITY = 10.0
MAX_ACCELERATION = 100.0
MIN_LIMIT = -100
MAX_LIMIT = 100
STEP_PIN = 0
DIR_PIN = 1

[AXIS_1]
TYPE = LINEAR
MAX_VELOCITY = 10.0
MAX_ACCELERATION = 100.0
STEP_PIN = 2
DIR_PIN = 3
"#;
        let ini = IniFile::parse("test.ini", text).unwrap();
        Config::from_ini(&ini).unwrap()
    }

    #[test]
    fn pin_plan_covers_all_roles() {
        let config = test_config();
        let (table, plan) = build_pin_plan(&config);
        assert!(plan.step[0].is_some());
        assert!(plan.dir[1].is_some());
        assert!(plan.step[2].is_none());
        assert!(plan.probe.is_some());
        assert!(plan.enable.is_some());
        assert!(plan.watchdog.is_some());
        // Every referenced row exists in the table.
        for idx in [plan.step[0], plan.dir[0], plan.probe, plan.enable] {
            assert!(idx.unwrap() < table.len());
        }
        // Names resolve.
        let gpio = GpioMap::new(table).unwrap();
        assert_eq!(gpio.find("STEP0"), plan.step[0]);
        assert_eq!(gpio.find("PROBE"), plan.probe);
    }

    #[test]
    fn scan_inputs_inverts_enable() {
        let config = test_config();
        let (table, plan) = build_pin_plan(&config);
        let gpio = GpioMap::new(table).unwrap();
        for idx in 0..gpio.len() {
            gpio.configure(idx).unwrap();
        }
        // Wire low: enable chain closed.
        let io = scan_inputs(&gpio, &plan, 2);
        assert!(io.enable);
        gpio.drive_input(plan.enable.unwrap(), true).unwrap();
        let io = scan_inputs(&gpio, &plan, 2);
        assert!(!io.enable);
    }

    #[test]
    fn machine_brings_up_and_tears_down() {
        let config = test_config();
        let machine =
            Machine::bring_up(&config, ParamFile::new(), 0, 0).expect("bring-up failed");
        std::thread::sleep(std::time::Duration::from_millis(20));
        let _params = machine.tear_down();
    }
}

//! The task state machine: the gate between operator intent and the
//! motion/io domains.
//!
//! Every operator command lands in [`TaskFsm::accept`], which decides
//! — from machine state, mode, and interpreter state — whether it
//! runs now, is queued behind the interpreter list, or is rejected
//! with an operator error. [`TaskFsm::cycle`] is the periodic task
//! tick: it settles waits, drains the list subject to per-command
//! preconditions, and keeps the interpreter read pipeline full.

use std::process::{Child, Command, Stdio};

use tracing::{debug, info};

use rmc_channel::{CommandWriter, StatusReader};
use rmc_common::error::{OperatorMsgKind, OperatorMsgRing};
use rmc_common::io_cmd::{IoCommand, IoStatus};
use rmc_common::motion_cmd::MotionCommand;
use rmc_common::motion_status::MotionStatus;
use rmc_common::task_state::{ExecState, InterpState, TaskMode, TaskState};

use crate::interp::{Interpreter, PlanReadResult};
use crate::interp_list::{InterpList, TaskItem, TaskOp};

/// What `accept` did with a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Executed (or forwarded) immediately.
    Accepted,
    /// Appended to the task queue for ordered execution.
    Queued,
    /// Refused in the current state; an operator error was posted.
    Rejected,
}

/// Operator-side commands, the task FSM's input alphabet.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCmd {
    EstopOn,
    EstopReset,
    MachineOn,
    MachineOff,
    SetMode(TaskMode),
    Abort,

    JogCont { joint: u8, vel: f64 },
    JogIncr { joint: u8, vel: f64, incr: f64 },
    JogAbs { joint: u8, vel: f64, pos: f64 },
    JogStop { joint: u8 },
    Home { joint: u8 },
    OverrideLimits { joint: i8 },

    Run,
    Pause,
    Resume,
    Step,
    MdiExecute(Vec<TaskItem>),

    FeedScale(f64),
    SpindleScale(f64),
    FhEnable(bool),
    FsEnable(bool),
    SsEnable(bool),
    AfEnable(bool),

    SpindleOn { speed: f64 },
    SpindleOff,
    SpindleIncrease,
    SpindleDecrease,
    SpindleBrakeEngage,
    SpindleBrakeRelease,

    CoolantMist(bool),
    CoolantFlood(bool),
    Lube(bool),

    ToolPrepare(u16),
    ToolLoadTable(String),
    ToolSetOffset { tool: u16, length: f64, diameter: f64 },

    SetDebug(u32),
}

pub struct TaskFsm {
    state: TaskState,
    mode: TaskMode,
    interp_state: InterpState,
    exec_state: ExecState,

    list: InterpList,
    program: Option<Box<dyn Interpreter>>,
    read_eof: bool,
    /// A synchronization barrier is in flight; reads hold until it
    /// settles.
    barrier_pending: bool,

    motion_tx: CommandWriter<MotionCommand>,
    io_tx: CommandWriter<IoCommand>,
    motion_status: StatusReader<MotionStatus>,
    io_status: StatusReader<IoStatus>,
    last_motion: MotionStatus,
    last_io: IoStatus,

    /// Single-step: only items from `step_line` may issue until the
    /// next step command moves the line forward.
    stepping: bool,
    step_line: i32,

    delay_remaining: f64,
    system_child: Option<Child>,

    cycle_period: f64,
    pub ops: OperatorMsgRing,
}

impl TaskFsm {
    pub fn new(
        motion_tx: CommandWriter<MotionCommand>,
        io_tx: CommandWriter<IoCommand>,
        motion_status: StatusReader<MotionStatus>,
        io_status: StatusReader<IoStatus>,
        cycle_period: f64,
    ) -> Self {
        Self {
            state: TaskState::Estop,
            mode: TaskMode::Manual,
            interp_state: InterpState::Idle,
            exec_state: ExecState::Done,
            list: InterpList::new(),
            program: None,
            read_eof: false,
            barrier_pending: false,
            motion_tx,
            io_tx,
            motion_status,
            io_status,
            last_motion: MotionStatus::default(),
            last_io: IoStatus::default(),
            stepping: false,
            step_line: 0,
            delay_remaining: 0.0,
            system_child: None,
            cycle_period,
            ops: OperatorMsgRing::new(),
        }
    }

    // ─── Introspection ──────────────────────────────────────────────

    #[inline]
    pub fn state(&self) -> TaskState {
        self.state
    }

    #[inline]
    pub fn mode(&self) -> TaskMode {
        self.mode
    }

    #[inline]
    pub fn interp_state(&self) -> InterpState {
        self.interp_state
    }

    #[inline]
    pub fn exec_state(&self) -> ExecState {
        self.exec_state
    }

    #[inline]
    pub fn queued(&self) -> usize {
        self.list.len()
    }

    /// Install the program source used by `Run`.
    pub fn set_program(&mut self, program: Box<dyn Interpreter>) {
        self.program = Some(program);
    }

    fn reject(&mut self, why: &str) -> Disposition {
        self.ops.error(why);
        Disposition::Rejected
    }

    fn motion_done(&self) -> bool {
        self.last_motion.is_done() && self.motion_tx.is_acknowledged()
    }

    fn io_done(&self) -> bool {
        !self.last_io.busy && self.io_tx.is_acknowledged()
    }

    // ─── The command gate ───────────────────────────────────────────

    pub fn accept(&mut self, cmd: OperatorCmd) -> Disposition {
        use OperatorCmd as O;

        // Commands legal in every state.
        match &cmd {
            O::EstopOn => {
                self.enter_estop();
                return Disposition::Accepted;
            }
            O::Abort => {
                self.abort_everything("operator abort");
                return Disposition::Accepted;
            }
            O::FeedScale(v) => {
                self.motion_tx.publish(MotionCommand::FeedScale { scale: *v });
                return Disposition::Accepted;
            }
            O::SpindleScale(v) => {
                self.motion_tx
                    .publish(MotionCommand::SpindleScale { scale: *v });
                return Disposition::Accepted;
            }
            O::FhEnable(b) => {
                self.motion_tx.publish(MotionCommand::FhEnable { enable: *b });
                return Disposition::Accepted;
            }
            O::FsEnable(b) => {
                self.motion_tx.publish(MotionCommand::FsEnable { enable: *b });
                return Disposition::Accepted;
            }
            O::SsEnable(b) => {
                self.motion_tx.publish(MotionCommand::SsEnable { enable: *b });
                return Disposition::Accepted;
            }
            O::AfEnable(b) => {
                self.motion_tx.publish(MotionCommand::AfEnable { enable: *b });
                return Disposition::Accepted;
            }
            O::SetDebug(level) => {
                debug!(level, "debug level set");
                return Disposition::Accepted;
            }
            _ => {}
        }

        match self.state {
            TaskState::Estop => match cmd {
                O::EstopReset => {
                    self.state = TaskState::EstopReset;
                    self.io_tx.publish(IoCommand::AuxEstopReset);
                    Disposition::Accepted
                }
                O::SetMode(m) => self.set_mode(m),
                _ => self.reject("machine is in estop"),
            },
            TaskState::EstopReset | TaskState::Off => match cmd {
                O::MachineOn => {
                    self.state = TaskState::On;
                    self.motion_tx.publish(MotionCommand::Enable);
                    Disposition::Accepted
                }
                O::EstopReset => Disposition::Accepted,
                O::SetMode(m) => self.set_mode(m),
                _ => self.reject("machine is not on"),
            },
            TaskState::On => self.accept_when_on(cmd),
        }
    }

    fn accept_when_on(&mut self, cmd: OperatorCmd) -> Disposition {
        use OperatorCmd as O;
        match cmd {
            O::MachineOff => {
                self.abort_everything("machine off");
                self.state = TaskState::Off;
                self.motion_tx.try_publish(MotionCommand::Disable).ok();
                Disposition::Accepted
            }
            O::EstopReset | O::MachineOn => Disposition::Accepted,
            O::SetMode(m) => self.set_mode(m),

            // Free-mode motion.
            O::JogCont { joint, vel } => {
                self.manual_motion(MotionCommand::JogCont { joint, vel }, "jog")
            }
            O::JogIncr { joint, vel, incr } => {
                self.manual_motion(MotionCommand::JogIncr { joint, vel, incr }, "jog")
            }
            O::JogAbs { joint, vel, pos } => {
                self.manual_motion(MotionCommand::JogAbs { joint, vel, pos }, "jog")
            }
            O::JogStop { joint } => {
                self.motion_tx.try_publish(MotionCommand::JointAbort { joint }).ok();
                Disposition::Accepted
            }
            O::Home { joint } => self.manual_motion(MotionCommand::Home { joint }, "home"),
            O::OverrideLimits { joint } => {
                self.manual_motion(MotionCommand::OverrideLimits { joint }, "override limits")
            }

            // Program execution.
            O::Run => self.start_run(),
            O::Pause => match (self.mode, self.interp_state) {
                (TaskMode::Auto | TaskMode::Mdi, InterpState::Reading | InterpState::Waiting) => {
                    self.motion_tx.publish(MotionCommand::Pause);
                    self.interp_state = InterpState::Paused;
                    Disposition::Accepted
                }
                _ => self.reject("nothing to pause"),
            },
            O::Resume => match (self.mode, self.interp_state) {
                (TaskMode::Auto | TaskMode::Mdi, InterpState::Paused) => {
                    self.motion_tx.publish(MotionCommand::Resume);
                    self.interp_state = InterpState::Reading;
                    self.stepping = false;
                    Disposition::Accepted
                }
                (TaskMode::Auto | TaskMode::Mdi, InterpState::Reading) => {
                    // Nothing is paused; resuming a running program
                    // succeeds as a no-op.
                    Disposition::Accepted
                }
                _ => self.reject("nothing to resume"),
            },
            O::Step => match (self.mode, self.interp_state) {
                (TaskMode::Auto, InterpState::Paused | InterpState::Reading) => {
                    // Advance the step fence to the next pending line.
                    self.stepping = true;
                    self.step_line = self.list.front().map(|i| i.line_id).unwrap_or(self.step_line);
                    self.motion_tx.publish(MotionCommand::Step);
                    if self.interp_state == InterpState::Paused {
                        self.interp_state = InterpState::Reading;
                    }
                    Disposition::Accepted
                }
                _ => self.reject("step requires a paused program"),
            },
            O::MdiExecute(items) => {
                if self.mode != TaskMode::Mdi {
                    return self.reject("mdi execute requires mdi mode");
                }
                if !self.last_motion.all_homed {
                    return self.reject("mdi requires all joints homed");
                }
                self.motion_tx.publish(MotionCommand::Coord);
                for item in items {
                    if !self.list.push(item) {
                        return self.reject("task queue full");
                    }
                }
                // Execute is an immediate command in mdi mode; only
                // tool operations queue.
                Disposition::Accepted
            }

            // Spindle & coolant: immediate in manual-ish states, never
            // while a program block is mid-flight.
            O::SpindleOn { speed } => self.io_side(MotionCommand::SetSpindle(
                rmc_common::motion_cmd::SpindleOnArgs {
                    speed,
                    css_factor: 0.0,
                    x_offset: 0.0,
                },
            )),
            O::SpindleOff => self.io_side(MotionCommand::SpindleOff),
            O::SpindleIncrease => self.io_side(MotionCommand::SpindleIncrease),
            O::SpindleDecrease => self.io_side(MotionCommand::SpindleDecrease),
            O::SpindleBrakeEngage => self.io_side(MotionCommand::SpindleBrakeEngage),
            O::SpindleBrakeRelease => self.io_side(MotionCommand::SpindleBrakeRelease),

            O::CoolantMist(on) => self.io_cmd(if on {
                IoCommand::CoolantMistOn
            } else {
                IoCommand::CoolantMistOff
            }),
            O::CoolantFlood(on) => self.io_cmd(if on {
                IoCommand::CoolantFloodOn
            } else {
                IoCommand::CoolantFloodOff
            }),
            O::Lube(on) => self.io_cmd(if on { IoCommand::LubeOn } else { IoCommand::LubeOff }),

            // Tool operations queue behind whatever is running.
            O::ToolPrepare(pocket) => self.queue_io(IoCommand::ToolPrepare { pocket }),
            O::ToolLoadTable(path) => match rmc_common::io_cmd::IoPath::new(&path) {
                Some(file) => self.queue_io(IoCommand::ToolLoadTable { file }),
                None => self.reject("tool table path too long"),
            },
            O::ToolSetOffset {
                tool,
                length,
                diameter,
            } => self.queue_io(IoCommand::ToolSetOffset {
                tool,
                length,
                diameter,
            }),

            O::EstopOn
            | O::Abort
            | O::FeedScale(_)
            | O::SpindleScale(_)
            | O::FhEnable(_)
            | O::FsEnable(_)
            | O::SsEnable(_)
            | O::AfEnable(_)
            | O::SetDebug(_) => Disposition::Accepted,
        }
    }

    fn manual_motion(&mut self, cmd: MotionCommand, what: &str) -> Disposition {
        if self.mode != TaskMode::Manual {
            return self.reject(&format!("cannot {what} outside manual mode"));
        }
        if self.interp_state != InterpState::Idle {
            return self.reject(&format!("cannot {what} while a program is active"));
        }
        self.motion_tx.publish(cmd);
        Disposition::Accepted
    }

    fn io_side(&mut self, cmd: MotionCommand) -> Disposition {
        if self.mode == TaskMode::Auto && self.interp_state == InterpState::Reading {
            return self.reject("spindle control is program-owned while running");
        }
        self.motion_tx.publish(cmd);
        Disposition::Accepted
    }

    fn io_cmd(&mut self, cmd: IoCommand) -> Disposition {
        self.io_tx.publish(cmd);
        Disposition::Accepted
    }

    fn queue_io(&mut self, cmd: IoCommand) -> Disposition {
        if matches!(self.interp_state, InterpState::Paused) {
            return self.reject("tool operations cannot run while paused");
        }
        if self.list.push(TaskItem {
            line_id: -1,
            op: TaskOp::Io(cmd),
        }) {
            Disposition::Queued
        } else {
            self.reject("task queue full")
        }
    }

    fn set_mode(&mut self, mode: TaskMode) -> Disposition {
        if self.mode == mode {
            return Disposition::Accepted;
        }
        if self.interp_state != InterpState::Idle || !self.list.is_empty() {
            return self.reject("cannot change mode while a program is active");
        }
        if self.state == TaskState::On && !self.motion_done() {
            return self.reject("cannot change mode while moving");
        }
        self.mode = mode;
        if self.state == TaskState::On && mode == TaskMode::Manual {
            self.motion_tx.publish(MotionCommand::Free);
        }
        info!(?mode, "task mode");
        Disposition::Accepted
    }

    fn start_run(&mut self) -> Disposition {
        if self.mode != TaskMode::Auto {
            return self.reject("run requires auto mode");
        }
        if self.interp_state != InterpState::Idle {
            return self.reject("a program is already active");
        }
        if !self.last_motion.all_homed {
            return self.reject("run requires all joints homed");
        }
        let Some(program) = self.program.as_mut() else {
            return self.reject("no program loaded");
        };
        program.reset();
        self.read_eof = false;
        self.list.clear();
        self.stepping = false;
        self.motion_tx.publish(MotionCommand::Coord);
        self.interp_state = InterpState::Reading;
        self.exec_state = ExecState::Done;
        info!("program start");
        Disposition::Accepted
    }

    fn enter_estop(&mut self) {
        self.abort_everything("estop");
        self.state = TaskState::Estop;
        self.io_tx.try_publish(IoCommand::AuxEstopOn).ok();
        self.motion_tx.try_publish(MotionCommand::Disable).ok();
    }

    fn abort_everything(&mut self, why: &str) {
        info!(why, "task abort");
        self.list.clear();
        self.motion_tx.try_publish(MotionCommand::Abort).ok();
        self.interp_state = InterpState::Idle;
        self.exec_state = ExecState::Done;
        self.stepping = false;
        self.barrier_pending = false;
        self.delay_remaining = 0.0;
        if let Some(mut child) = self.system_child.take() {
            let _ = child.kill();
        }
        if let Some(program) = self.program.as_mut() {
            program.resync();
        }
    }

    // ─── The periodic cycle ─────────────────────────────────────────

    pub fn cycle(&mut self) {
        if let Some(status) = self.motion_status.read() {
            self.last_motion = status;
        }
        if let Some(status) = self.io_status.read() {
            self.last_io = status;
        }

        // A motion error parks the task in waiting until the operator
        // intervenes.
        if self.last_motion.motion_error
            && self.state == TaskState::On
            && self.interp_state == InterpState::Reading
        {
            self.ops.error("motion error: program held");
            self.list.clear();
            self.interp_state = InterpState::Waiting;
            self.exec_state = ExecState::Error;
        }

        self.settle_waits();

        if self.state != TaskState::On {
            return;
        }

        // Drain the list: auto/mdi execution plus queued tool ops in
        // manual mode.
        if self.exec_state == ExecState::Done {
            self.issue_from_list();
        }

        // Keep the read pipeline full.
        if self.mode == TaskMode::Auto && self.interp_state == InterpState::Reading && !self.read_eof
        {
            self.plan_reads();
        }

        // Program teardown: everything read, issued, and settled.
        if self.mode == TaskMode::Auto
            && self.interp_state == InterpState::Reading
            && self.read_eof
            && self.list.is_empty()
            && self.exec_state == ExecState::Done
            && self.motion_done()
            && self.io_done()
        {
            info!("program complete");
            self.interp_state = InterpState::Idle;
        }
        if self.mode == TaskMode::Mdi
            && self.list.is_empty()
            && self.exec_state == ExecState::Done
        {
            self.interp_state = InterpState::Idle;
        }
    }

    fn settle_waits(&mut self) {
        match self.exec_state {
            ExecState::WaitingForDelay => {
                self.delay_remaining -= self.cycle_period;
                if self.delay_remaining <= 0.0 {
                    self.exec_state = ExecState::Done;
                }
            }
            ExecState::WaitingForSystemCmd => {
                let done = match self.system_child.as_mut() {
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => {
                            if !status.success() {
                                self.ops.error(&format!("system command failed: {status}"));
                            }
                            true
                        }
                        Ok(None) => false,
                        Err(e) => {
                            self.ops.error(&format!("system command lost: {e}"));
                            true
                        }
                    },
                    None => true,
                };
                if done {
                    self.system_child = None;
                    self.exec_state = ExecState::Done;
                }
            }
            ExecState::WaitingForMotion => {
                if self.motion_done() {
                    self.exec_state = ExecState::Done;
                }
            }
            ExecState::WaitingForIo => {
                if self.io_done() {
                    self.exec_state = ExecState::Done;
                }
            }
            ExecState::WaitingForMotionAndIo | ExecState::WaitingForMotionQueue => {
                if self.motion_done() && self.io_done() {
                    if self.exec_state == ExecState::WaitingForMotionQueue {
                        // Barrier settled: resync the interpreter's
                        // world model, release the read pipeline.
                        if let Some(program) = self.program.as_mut() {
                            program.resync();
                        }
                        self.barrier_pending = false;
                    }
                    self.exec_state = ExecState::Done;
                }
            }
            ExecState::WaitingForPause => {
                if self.interp_state != InterpState::Paused {
                    self.exec_state = ExecState::Done;
                }
            }
            ExecState::Done | ExecState::Error => {}
        }
    }

    /// Exec-state precondition for an operation: what must settle
    /// before it is issued.
    fn precondition(op: &TaskOp) -> ExecState {
        match op {
            TaskOp::Motion(cmd) => match cmd {
                MotionCommand::SetProbe(_)
                | MotionCommand::SetRigidTap(_)
                | MotionCommand::ClearProbeFlag => ExecState::WaitingForMotionAndIo,
                MotionCommand::SetWorldHome { .. } | MotionCommand::SetMotorOffset { .. } => {
                    ExecState::WaitingForMotion
                }
                MotionCommand::SetSpindle(_)
                | MotionCommand::SpindleOff
                | MotionCommand::SpindleBrakeEngage
                | MotionCommand::SpindleBrakeRelease => ExecState::WaitingForMotionAndIo,
                // Lines, arcs, velocity/termination parameters stream
                // behind the queue; they only need io settled.
                _ => ExecState::WaitingForIo,
            },
            TaskOp::Io(_) => ExecState::WaitingForMotionAndIo,
            TaskOp::Dwell { .. } => ExecState::WaitingForMotionAndIo,
            TaskOp::SystemCmd(_) | TaskOp::OperatorMessage(_) => ExecState::WaitingForMotionAndIo,
            TaskOp::Barrier => ExecState::WaitingForMotionQueue,
            TaskOp::End => ExecState::WaitingForMotionAndIo,
        }
    }

    fn precondition_met(&self, pre: ExecState) -> bool {
        match pre {
            ExecState::WaitingForMotion => self.motion_done(),
            ExecState::WaitingForIo => self.io_done(),
            ExecState::WaitingForMotionAndIo | ExecState::WaitingForMotionQueue => {
                self.motion_done() && self.io_done()
            }
            _ => true,
        }
    }

    fn issue_from_list(&mut self) {
        while self.exec_state == ExecState::Done {
            let Some(front) = self.list.front() else {
                break;
            };

            // Step fence: only the armed line may issue.
            if self.stepping && front.line_id >= 0 && front.line_id != self.step_line {
                break;
            }

            let pre = Self::precondition(&front.op);
            if !self.precondition_met(pre) {
                self.exec_state = pre;
                break;
            }
            if matches!(front.op, TaskOp::Motion(_))
                && (self.last_motion.queue_full || !self.motion_tx.is_acknowledged())
            {
                break;
            }

            let item = self.list.pop().unwrap();
            match item.op {
                TaskOp::Motion(cmd) => {
                    self.motion_tx.try_publish(cmd).ok();
                }
                TaskOp::Io(cmd) => {
                    self.io_tx.publish(cmd);
                    self.exec_state = ExecState::WaitingForIo;
                }
                TaskOp::Dwell { seconds } => {
                    self.delay_remaining = seconds;
                    self.exec_state = ExecState::WaitingForDelay;
                }
                TaskOp::SystemCmd(cmd) => match Command::new("sh")
                    .arg("-c")
                    .arg(&cmd)
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()
                {
                    Ok(child) => {
                        self.system_child = Some(child);
                        self.exec_state = ExecState::WaitingForSystemCmd;
                    }
                    Err(e) => {
                        self.ops.error(&format!("cannot run '{cmd}': {e}"));
                        self.exec_state = ExecState::Error;
                    }
                },
                TaskOp::OperatorMessage(text) => {
                    self.ops.post(OperatorMsgKind::Text, &text);
                }
                TaskOp::Barrier => {
                    self.exec_state = ExecState::WaitingForMotionQueue;
                }
                TaskOp::End => {
                    self.read_eof = true;
                }
            }
        }
    }

    fn plan_reads(&mut self) {
        if self.barrier_pending {
            return;
        }
        let Some(program) = self.program.as_mut() else {
            return;
        };
        while self.list.below_resume_mark() && !self.read_eof {
            let mut emitted = Vec::new();
            let result = program.plan_read(&mut |item| emitted.push(item));
            for item in emitted {
                if !self.list.push(item) {
                    self.ops.error("interp list overflow; program held");
                    self.interp_state = InterpState::Waiting;
                    return;
                }
            }
            match result {
                PlanReadResult::Ok => {}
                PlanReadResult::ExecuteFinish => {
                    // Synchronization point: barrier blocks issuing
                    // and reading until everything drains.
                    let line = program.line();
                    self.list.push(TaskItem {
                        line_id: line,
                        op: TaskOp::Barrier,
                    });
                    self.barrier_pending = true;
                    break;
                }
                PlanReadResult::Eof => {
                    self.read_eof = true;
                }
                PlanReadResult::Error(msg) => {
                    self.ops.error(&format!("interpreter error: {msg}"));
                    self.list.clear();
                    self.interp_state = InterpState::Waiting;
                    self.exec_state = ExecState::Error;
                    return;
                }
            }
        }
    }
}

//! Task FSM against a live servo loop: mode gating, program
//! execution, stepping, and estop.

use rmc_channel::{CommandChannel, CommandReader, StatusChannel, StatusWriter};
use rmc_common::config::AxisConfig;
use rmc_common::io_cmd::{IoCommand, IoStatus};
use rmc_common::motion_cmd::MotionCommand;
use rmc_common::motion_status::MotionStatus;
use rmc_common::pose::Pose;
use rmc_common::task_state::{ExecState, InterpState, TaskMode, TaskState};
use rmc_motion::control::{IoInputs, MotionLoop};
use rmc_motion::joint::Joint;
use rmc_motion::IdentityKins;
use rmc_task::interp::ScriptInterp;
use rmc_task::{CanonAdapter, Disposition, OperatorCmd, PlanReadResult, TaskFsm};

const SERVO_DT: f64 = 0.001;
const TASK_DT: f64 = 0.02;

/// Whole-controller rig: task FSM + motion loop + stub io echo.
struct Rig {
    task: TaskFsm,
    motion: MotionLoop,
    io_rx: CommandReader<IoCommand>,
    io_status_tx: StatusWriter<IoStatus>,
    io_state: IoStatus,
    io: IoInputs,
}

impl Rig {
    fn new(num_joints: usize) -> Self {
        let (motion_tx, motion_rx) = CommandChannel::new::<MotionCommand>();
        let (io_tx, io_rx) = CommandChannel::new::<IoCommand>();
        let (motion_status_tx, motion_status_rx) = StatusChannel::new::<MotionStatus>();
        let (io_status_tx, io_status_rx) = StatusChannel::new::<IoStatus>();

        let cfg = AxisConfig {
            max_velocity: 20.0,
            max_acceleration: 200.0,
            min_limit: -100.0,
            max_limit: 100.0,
            ..Default::default()
        };
        let joints = (0..num_joints)
            .map(|_| {
                let mut j = Joint::from_config(&cfg);
                j.activate();
                j
            })
            .collect();
        let motion = MotionLoop::new(
            joints,
            Box::new(IdentityKins),
            50.0,
            1000.0,
            SERVO_DT,
            10,
            motion_rx,
            motion_status_tx,
            None,
            None,
        );
        let task = TaskFsm::new(motion_tx, io_tx, motion_status_rx, io_status_rx, TASK_DT);
        Self {
            task,
            motion,
            io_rx,
            io_status_tx,
            io_state: IoStatus::default(),
            io: IoInputs::default(),
        }
    }

    /// One task cycle's worth of real time: servo ticks plus the io
    /// echo stub.
    fn spin(&mut self) {
        self.task.cycle();
        for _ in 0..((TASK_DT / SERVO_DT) as usize) {
            self.motion.tick(&self.io);
        }
        // Trivial io controller: acknowledge everything immediately.
        if let Some((head, cmd)) = self.io_rx.poll() {
            match cmd {
                IoCommand::AuxEstopOn => self.io_state.estop = true,
                IoCommand::AuxEstopReset | IoCommand::AuxEstopOff => {
                    self.io_state.estop = false
                }
                IoCommand::ToolPrepare { pocket } => {
                    self.io_state.pocket_prepped = pocket as i16
                }
                _ => {}
            }
            self.io_state.echo_serial = head.serial;
            self.io_rx.ack(head.serial);
        }
        self.io_state.heartbeat += 1;
        self.io_status_tx.publish(&self.io_state);
    }

    fn spin_n(&mut self, n: usize) {
        for _ in 0..n {
            self.spin();
        }
    }

    /// Bring the machine to on/manual with all joints homed.
    fn bring_up(&mut self) {
        assert_eq!(self.task.accept(OperatorCmd::EstopReset), Disposition::Accepted);
        self.spin();
        assert_eq!(self.task.accept(OperatorCmd::MachineOn), Disposition::Accepted);
        self.spin();
        assert_eq!(
            self.task.accept(OperatorCmd::Home { joint: 0xFF }),
            Disposition::Accepted
        );
        self.spin_n(50);
    }
}

fn pose(x: f64, y: f64) -> Pose {
    Pose {
        x,
        y,
        ..Pose::ZERO
    }
}

/// A two-line program: feed to (10,0), then to (10,10), then end.
fn two_line_program() -> ScriptInterp {
    let mut canon = CanonAdapter::new(50.0, 200.0);
    canon.set_feed_rate(20.0);
    canon.set_line_number(1);
    let l1 = canon.straight_feed(pose(10.0, 0.0));
    canon.set_line_number(2);
    let l2 = canon.straight_feed(pose(10.0, 10.0));
    canon.set_line_number(3);
    let end = canon.program_end();
    ScriptInterp::new(vec![
        (vec![l1], PlanReadResult::Ok),
        (vec![l2], PlanReadResult::Ok),
        (vec![end], PlanReadResult::Eof),
    ])
}

#[test]
fn estop_gates_everything() {
    let mut rig = Rig::new(1);
    // In estop: motion commands rejected, estop reset accepted.
    assert_eq!(
        rig.task.accept(OperatorCmd::JogCont { joint: 0, vel: 5.0 }),
        Disposition::Rejected
    );
    assert_eq!(rig.task.accept(OperatorCmd::Run), Disposition::Rejected);
    assert_eq!(
        rig.task.accept(OperatorCmd::SpindleOn { speed: 100.0 }),
        Disposition::Rejected
    );
    // Parameter sets pass even in estop.
    assert_eq!(
        rig.task.accept(OperatorCmd::FeedScale(0.5)),
        Disposition::Accepted
    );
    assert_eq!(rig.task.state(), TaskState::Estop);
    assert_eq!(rig.task.accept(OperatorCmd::EstopReset), Disposition::Accepted);
    assert_eq!(rig.task.state(), TaskState::EstopReset);
}

#[test]
fn machine_on_enables_motion() {
    let mut rig = Rig::new(1);
    rig.task.accept(OperatorCmd::EstopReset);
    rig.spin();
    rig.task.accept(OperatorCmd::MachineOn);
    rig.spin_n(2);
    assert_eq!(rig.task.state(), TaskState::On);
    assert!(rig.motion.is_enabled());
}

#[test]
fn jog_accepted_only_in_manual() {
    let mut rig = Rig::new(1);
    rig.bring_up();
    assert_eq!(
        rig.task.accept(OperatorCmd::JogCont { joint: 0, vel: 5.0 }),
        Disposition::Accepted
    );
    rig.spin_n(10);
    rig.task.accept(OperatorCmd::JogStop { joint: 0 });
    rig.spin_n(20);

    rig.task.accept(OperatorCmd::SetMode(TaskMode::Auto));
    rig.spin();
    assert_eq!(rig.task.mode(), TaskMode::Auto);
    assert_eq!(
        rig.task.accept(OperatorCmd::JogCont { joint: 0, vel: 5.0 }),
        Disposition::Rejected
    );
}

#[test]
fn run_requires_auto_homed_and_program() {
    let mut rig = Rig::new(2);
    rig.bring_up();
    // Manual mode: run rejected.
    assert_eq!(rig.task.accept(OperatorCmd::Run), Disposition::Rejected);
    rig.task.accept(OperatorCmd::SetMode(TaskMode::Auto));
    rig.spin();
    // No program loaded.
    assert_eq!(rig.task.accept(OperatorCmd::Run), Disposition::Rejected);

    rig.task.set_program(Box::new(two_line_program()));
    assert_eq!(rig.task.accept(OperatorCmd::Run), Disposition::Accepted);
    assert_eq!(rig.task.interp_state(), InterpState::Reading);
}

#[test]
fn program_runs_to_completion() {
    let mut rig = Rig::new(2);
    rig.bring_up();
    rig.task.accept(OperatorCmd::SetMode(TaskMode::Auto));
    rig.spin();
    rig.task.set_program(Box::new(two_line_program()));
    rig.task.accept(OperatorCmd::Run);

    let mut cycles = 0;
    while rig.task.interp_state() != InterpState::Idle && cycles < 5_000 {
        rig.spin();
        cycles += 1;
    }
    assert_eq!(rig.task.interp_state(), InterpState::Idle, "program hung");
    assert_eq!(rig.task.exec_state(), ExecState::Done);

    // The machine ended at the program's final point.
    let joints = rig.motion.joints();
    assert!((joints[0].pos_cmd - 10.0).abs() < 1e-2);
    assert!((joints[1].pos_cmd - 10.0).abs() < 1e-2);
}

#[test]
fn pause_and_resume_mid_program() {
    let mut rig = Rig::new(2);
    rig.bring_up();
    rig.task.accept(OperatorCmd::SetMode(TaskMode::Auto));
    rig.spin();
    rig.task.set_program(Box::new(two_line_program()));
    rig.task.accept(OperatorCmd::Run);
    rig.spin_n(10);

    // Resuming a program that is not paused succeeds as a no-op.
    assert_eq!(rig.task.accept(OperatorCmd::Resume), Disposition::Accepted);
    assert_eq!(rig.task.interp_state(), InterpState::Reading);

    assert_eq!(rig.task.accept(OperatorCmd::Pause), Disposition::Accepted);
    assert_eq!(rig.task.interp_state(), InterpState::Paused);
    rig.spin_n(5);
    let x_at_pause = rig.motion.joints()[0].pos_cmd;
    rig.spin_n(20);
    // Held: no motion while paused.
    assert!((rig.motion.joints()[0].pos_cmd - x_at_pause).abs() < 0.2);

    assert_eq!(rig.task.accept(OperatorCmd::Resume), Disposition::Accepted);
    let mut cycles = 0;
    while rig.task.interp_state() != InterpState::Idle && cycles < 5_000 {
        rig.spin();
        cycles += 1;
    }
    assert_eq!(rig.task.interp_state(), InterpState::Idle);
}

#[test]
fn dwell_holds_the_pipeline() {
    let mut rig = Rig::new(1);
    rig.bring_up();
    rig.task.accept(OperatorCmd::SetMode(TaskMode::Auto));
    rig.spin();

    let mut canon = CanonAdapter::new(50.0, 200.0);
    canon.set_line_number(1);
    let dwell = canon.dwell(0.1);
    canon.set_line_number(2);
    let end = canon.program_end();
    rig.task.set_program(Box::new(ScriptInterp::new(vec![
        (vec![dwell], PlanReadResult::Ok),
        (vec![end], PlanReadResult::Eof),
    ])));
    rig.task.accept(OperatorCmd::Run);

    rig.spin_n(2);
    assert_eq!(rig.task.exec_state(), ExecState::WaitingForDelay);
    // 0.1 s at 0.02 s per cycle: done within ~7 more cycles.
    rig.spin_n(7);
    assert_eq!(rig.task.exec_state(), ExecState::Done);
}

#[test]
fn tool_prepare_queues_and_executes() {
    let mut rig = Rig::new(1);
    rig.bring_up();
    assert_eq!(
        rig.task.accept(OperatorCmd::ToolPrepare(4)),
        Disposition::Queued
    );
    rig.spin_n(5);
    assert_eq!(rig.io_state.pocket_prepped, 4);
}

#[test]
fn estop_mid_program_clears_everything() {
    let mut rig = Rig::new(2);
    rig.bring_up();
    rig.task.accept(OperatorCmd::SetMode(TaskMode::Auto));
    rig.spin();
    rig.task.set_program(Box::new(two_line_program()));
    rig.task.accept(OperatorCmd::Run);
    rig.spin_n(5);

    rig.task.accept(OperatorCmd::EstopOn);
    rig.spin_n(3);
    assert_eq!(rig.task.state(), TaskState::Estop);
    assert_eq!(rig.task.interp_state(), InterpState::Idle);
    assert_eq!(rig.task.queued(), 0);
    assert!(!rig.motion.is_enabled());
    assert!(rig.io_state.estop);
}

#[test]
fn mode_switch_rejected_while_program_active() {
    let mut rig = Rig::new(2);
    rig.bring_up();
    rig.task.accept(OperatorCmd::SetMode(TaskMode::Auto));
    rig.spin();
    rig.task.set_program(Box::new(two_line_program()));
    rig.task.accept(OperatorCmd::Run);
    rig.spin_n(3);
    assert_eq!(
        rig.task.accept(OperatorCmd::SetMode(TaskMode::Manual)),
        Disposition::Rejected
    );
}

#[test]
fn barrier_waits_for_drain() {
    let mut rig = Rig::new(1);
    rig.bring_up();
    rig.task.accept(OperatorCmd::SetMode(TaskMode::Auto));
    rig.spin();

    let mut canon = CanonAdapter::new(50.0, 200.0);
    canon.set_feed_rate(20.0);
    canon.set_line_number(1);
    let l1 = canon.straight_feed(pose(5.0, 0.0));
    canon.set_line_number(2);
    let l2 = canon.straight_feed(pose(10.0, 0.0));
    canon.set_line_number(3);
    let end = canon.program_end();
    // Block 1 asks for an execute-finish sync after the first move.
    rig.task.set_program(Box::new(ScriptInterp::new(vec![
        (vec![l1], PlanReadResult::ExecuteFinish),
        (vec![l2], PlanReadResult::Ok),
        (vec![end], PlanReadResult::Eof),
    ])));
    rig.task.accept(OperatorCmd::Run);

    // While the barrier is pending, the second line must not issue.
    let mut saw_barrier_wait = false;
    let mut cycles = 0;
    while rig.task.interp_state() != InterpState::Idle && cycles < 5_000 {
        rig.spin();
        if rig.task.exec_state() == ExecState::WaitingForMotionQueue {
            saw_barrier_wait = true;
            // The follow-on line is still queued (or unread).
            assert!(rig.motion.joints()[0].pos_cmd < 5.5);
        }
        cycles += 1;
    }
    assert!(saw_barrier_wait, "barrier never gated execution");
    assert_eq!(rig.task.interp_state(), InterpState::Idle);
    assert!((rig.motion.joints()[0].pos_cmd - 10.0).abs() < 1e-2);
}

#[test]
fn mdi_executes_single_block() {
    let mut rig = Rig::new(1);
    rig.bring_up();
    rig.task.accept(OperatorCmd::SetMode(TaskMode::Mdi));
    rig.spin();

    let mut canon = CanonAdapter::new(50.0, 200.0);
    canon.set_feed_rate(20.0);
    canon.set_line_number(1);
    let item = canon.straight_feed(pose(3.0, 0.0));
    assert_eq!(
        rig.task.accept(OperatorCmd::MdiExecute(vec![item])),
        Disposition::Accepted
    );
    let mut cycles = 0;
    while (rig.task.queued() > 0 || rig.motion.traj().depth() > 0) && cycles < 5_000 {
        rig.spin();
        cycles += 1;
    }
    rig.spin_n(20);
    assert!((rig.motion.joints()[0].pos_cmd - 3.0).abs() < 1e-2);
}

#[test]
fn interp_error_parks_in_waiting() {
    let mut rig = Rig::new(1);
    rig.bring_up();
    rig.task.accept(OperatorCmd::SetMode(TaskMode::Auto));
    rig.spin();
    rig.task.set_program(Box::new(ScriptInterp::new(vec![(
        vec![],
        PlanReadResult::Error("bad G-code".into()),
    )])));
    rig.task.accept(OperatorCmd::Run);
    rig.spin_n(2);
    assert_eq!(rig.task.interp_state(), InterpState::Waiting);
    assert_eq!(rig.task.exec_state(), ExecState::Error);
    // Abort recovers to idle.
    rig.task.accept(OperatorCmd::Abort);
    assert_eq!(rig.task.interp_state(), InterpState::Idle);
}

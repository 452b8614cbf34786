//! Servo-tick latency benchmarks: the numbers that decide whether a
//! 1 ms period is comfortable.

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use rmc_channel::{CommandChannel, StatusChannel};
use rmc_common::config::AxisConfig;
use rmc_common::motion_cmd::{LineArgs, MotionCommand, MotionType, SegmentEnables};
use rmc_common::motion_status::MotionStatus;
use rmc_common::pose::Pose;
use rmc_motion::control::{IoInputs, MotionLoop};
use rmc_motion::joint::Joint;
use rmc_motion::IdentityKins;

fn build_loop(joints: usize) -> (MotionLoop, rmc_channel::CommandWriter<MotionCommand>) {
    let (cmd_tx, cmd_rx) = CommandChannel::new::<MotionCommand>();
    let (status_tx, _status_rx) = StatusChannel::new::<MotionStatus>();
    let cfg = AxisConfig {
        max_velocity: 50.0,
        max_acceleration: 500.0,
        min_limit: -1000.0,
        max_limit: 1000.0,
        ..Default::default()
    };
    let joints = (0..joints)
        .map(|_| {
            let mut j = Joint::from_config(&cfg);
            j.activate();
            j
        })
        .collect();
    let motion = MotionLoop::new(
        joints,
        Box::new(IdentityKins),
        100.0,
        1000.0,
        0.001,
        10,
        cmd_rx,
        status_tx,
        None,
        None,
    );
    (motion, cmd_tx)
}

fn bench_free_tick(c: &mut Criterion) {
    let (mut motion, mut cmd) = build_loop(9);
    let io = IoInputs::default();
    cmd.try_publish(MotionCommand::Enable).unwrap();
    motion.tick(&io);
    cmd.try_publish(MotionCommand::JogCont {
        joint: 0,
        vel: 10.0,
    })
    .unwrap();
    motion.tick(&io);

    c.bench_function("servo_tick_free_9_joints", |b| {
        b.iter(|| {
            motion.tick(black_box(&io));
        })
    });
}

fn bench_coord_tick(c: &mut Criterion) {
    let (mut motion, mut cmd) = build_loop(9);
    let io = IoInputs::default();
    cmd.try_publish(MotionCommand::Enable).unwrap();
    motion.tick(&io);
    cmd.try_publish(MotionCommand::Home {
        joint: rmc_motion::command::HOME_ALL,
    })
    .unwrap();
    for _ in 0..10_000 {
        motion.tick(&io);
    }
    cmd.try_publish(MotionCommand::Coord).unwrap();
    motion.tick(&io);

    // Keep the queue fed so the bench measures steady-state planning.
    let mut x = 0.0;
    for id in 0..32 {
        x += 10.0;
        cmd.try_publish(MotionCommand::SetLine(LineArgs {
            end: Pose {
                x,
                ..Pose::ZERO
            },
            motion_type: MotionType::Feed,
            id,
            vel: 20.0,
            ini_maxvel: 100.0,
            acc: 200.0,
            enables: SegmentEnables::FEED_OVERRIDE,
        }))
        .unwrap();
        motion.tick(&io);
    }

    c.bench_function("servo_tick_coord_9_joints", |b| {
        b.iter(|| {
            motion.tick(black_box(&io));
        })
    });
}

criterion_group!(benches, bench_free_tick, bench_coord_tick);
criterion_main!(benches);

//! RMC supervisor.
//!
//! Owns the whole bring-up order: configuration → parameter file →
//! GPIO table → step ring and FIQ handler → servo thread → task and
//! io loops — and the teardown mirror of it on SIGINT/SIGTERM. Exit
//! codes: 0 for a clean run, 1 for an init failure.
//!
//! The operator transport is an external collaborator; this binary
//! exposes the machine only to it, not to a UI of its own.

mod machine;
mod rt;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rmc_common::config::Config;
use rmc_common::ini::IniFile;
use rmc_common::params::ParamFile;

use machine::Machine;

/// Shutdown request latched by the signal handler.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: i32) {
    SHUTDOWN.store(true, Ordering::Release);
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::Acquire)
}

#[derive(Debug, Parser)]
#[command(name = "rmc", about = "Realtime motion controller supervisor")]
struct Cli {
    /// Machine configuration (INI).
    ini: PathBuf,

    /// G-code parameter file; defaults to rmc.var beside the INI.
    #[arg(long)]
    var_file: Option<PathBuf>,

    /// CPU core for the servo thread (rt builds).
    #[arg(long, default_value_t = 1)]
    servo_cpu: usize,

    /// SCHED_FIFO priority for the servo thread (rt builds).
    #[arg(long, default_value_t = 80)]
    servo_priority: i32,

    /// Dump the resolved configuration as JSON and exit.
    #[arg(long)]
    dump_config: bool,
}

fn install_signal_handlers() {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        let _ = sigaction(Signal::SIGINT, &action);
        let _ = sigaction(Signal::SIGTERM, &action);
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("init failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let ini = IniFile::load(&cli.ini)?;
    let config = Config::from_ini(&ini)?;

    if cli.dump_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let var_path = cli
        .var_file
        .clone()
        .unwrap_or_else(|| cli.ini.with_file_name("rmc.var"));
    let params = ParamFile::load(&var_path)?;
    info!(
        params = params.len(),
        var_file = %var_path.display(),
        "parameter file loaded"
    );

    install_signal_handlers();

    let mut machine = Machine::bring_up(&config, params, cli.servo_cpu, cli.servo_priority)?;
    info!(joints = config.traj.joints, "machine up");

    machine.task_loop(&config);

    let params = machine.tear_down();
    params.save(&var_path)?;
    info!(var_file = %var_path.display(), "parameters saved");
    Ok(())
}

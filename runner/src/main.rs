use clap::{Parser, Subcommand};
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use retrieval_runner::{
    config::SchedulerConfig,
    ledger::{InputWarningLedger, RetrievalStatusLedger},
    scheduler::Scheduler,
    shutdown::Shutdown,
    sync::InstanceLock,
};
use std::{error::Error, path::PathBuf, process::ExitCode};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Runs retrievals for every sensor-day whose inputs are complete")]
struct Args {
    /// YAML configuration file
    #[arg(long, short = 'c', default_value = "config.yml")]
    config: PathBuf,

    /// Log filter, `RUST_LOG` takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Dispatch retrievals until the queue is exhausted
    Run,
    /// Print the order in which items would be dispatched
    Queue,
    /// Print the retrieval status ledger
    Status,
    /// Print sensor-days with incomplete inputs
    Warnings,
    /// Clear the retrieval status ledger
    ResetStatus,
    /// Ask a running scheduler to terminate
    Stop,
}

fn status(config: &SchedulerConfig) {
    let ledger = RetrievalStatusLedger::new(config.state.status_path(), config.state.lock_timeout());

    for entry in ledger.load() {
        println!(
            "{}/{} {:<14} ifgs={:<5} exit={:<4} {}",
            entry.sensor_id,
            entry.from_datetime.format("%Y%m%d"),
            entry.container_id.as_deref().unwrap_or("-"),
            entry.ifg_count.map_or(String::from("-"), |count| count.to_string()),
            entry.exit_code.map_or(String::from("-"), |code| code.to_string()),
            match (entry.is_orphaned(), entry.outcome) {
                (true, _) => String::from("ORPHANED"),
                (false, Some(outcome)) => format!("{outcome:?}").to_lowercase(),
                (false, None) => String::from("pending"),
            }
        );
    }
}

fn warnings(config: &SchedulerConfig) {
    let ledger = InputWarningLedger::new(config.state.warnings_path(), config.state.lock_timeout());

    for (key, warning) in ledger.load() {
        println!(
            "{key} {} {}",
            warning.last_checked.format("%Y-%m-%dT%H:%M:%S"),
            warning.message
        );
    }
}

fn stop(config: &SchedulerConfig) -> Result<(), Box<dyn Error>> {
    let lock_path = config.state.instance_lock_path();

    if !InstanceLock::is_held(&lock_path) {
        info!("No scheduler is running");
        return Ok(());
    }
    let pid = InstanceLock::read_pid(&lock_path)
        .ok_or_else(|| format!("Lock file {lock_path:?} does not contain a pid"))?;

    kill(Pid::from_raw(pid), Signal::SIGTERM)?;
    info!(pid, "Sent SIGTERM to the running scheduler");

    Ok(())
}

fn execute(args: Args) -> Result<(), Box<dyn Error>> {
    let config = SchedulerConfig::load(&args.config)?;

    match args.command {
        Commands::Run => {
            let shutdown = Shutdown::new();
            shutdown.install_handler()?;
            let summary = Scheduler::new(config)?.with_shutdown(shutdown).run()?;

            if summary.cancelled > 0 {
                warn!("{} retrievals were stopped and stay pending", summary.cancelled);
            }
            if summary.failed > 0 || summary.not_launched > 0 {
                return Err(format!(
                    "{} retrievals failed, {} could not be launched",
                    summary.failed, summary.not_launched
                )
                .into());
            }
        }
        Commands::Queue => {
            for item in Scheduler::new(config)?.preview_queue()? {
                println!("{} priority={} {:?}", item, item.priority, item.origin);
            }
        }
        Commands::Status => status(&config),
        Commands::Warnings => warnings(&config),
        Commands::ResetStatus => {
            if InstanceLock::is_held(&config.state.instance_lock_path()) {
                return Err("A scheduler is running, refusing to reset its ledger".into());
            }
            RetrievalStatusLedger::new(config.state.status_path(), config.state.lock_timeout()).reset();
        }
        Commands::Stop => stop(&config)?,
    }

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    match execute(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

//! systemd-lock-handler - Systemd user daemon bridging logind signals to units.
//!
//! Starts `sleep.target` before suspend, `lock.target` when the session is
//! locked and `unlock.target` when it is unlocked.

use std::convert::Infallible;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use nix::unistd::{Uid, User};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};
use tracing_subscriber::EnvFilter;

use systemd_lock_handler::bus::{self, BusSignalSource};
use systemd_lock_handler::config::{Config, Target};
use systemd_lock_handler::notify;
use systemd_lock_handler::systemd::SystemdDispatcher;
use systemd_lock_handler::toggle::{Orchestrator, TargetError};

type TargetTasks = JoinSet<(String, Result<Infallible, TargetError>)>;

/// Logind signal handler for systemd user sessions.
///
/// Starts systemd targets on sleep, lock and unlock.
#[derive(Parser, Debug)]
#[command(name = "systemd-lock-handler")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    dump_config: bool,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            let code = e.downcast_ref::<TargetError>().map_or(1, TargetError::exit_code);
            ExitCode::from(code)
        }
    }
}

/// Initialize logging with the specified level.
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(format!("systemd_lock_handler={level}"))
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Invalid log level")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let config =
        Config::load_or_default(args.config.as_deref()).context("Failed to load configuration")?;

    if args.dump_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    info!("systemd-lock-handler v{} starting", env!("CARGO_PKG_VERSION"));
    config.validate().context("Invalid configuration")?;
    if args.check {
        info!("Configuration OK ({} targets)", config.targets.len());
        return Ok(());
    }

    let username = current_username()?;
    info!("Running for user: {}", username);

    let mut tasks = TargetTasks::new();
    for target in &config.targets {
        spawn_target(&mut tasks, target.clone(), &config, &username)
            .await
            .with_context(|| format!("Failed to set up {}", target.unit))?;
    }

    info!("Initialization complete.");

    match notify::ready() {
        Ok(true) => debug!("Sent READY=1"),
        Ok(false) => info!("Couldn't call sd_notify. Not running via systemd?"),
        Err(e) => warn!("Call to sd_notify failed: {:#}", e),
    }

    supervise(tasks).await
}

/// Subscribe a target's signals and start its loop.
///
/// Subscription errors surface here, before readiness is reported.
async fn spawn_target(
    tasks: &mut TargetTasks,
    target: Target,
    config: &Config,
    username: &str,
) -> Result<(), TargetError> {
    let conn = bus::connect_system().await?;
    let source = BusSignalSource::subscribe(&conn, &target.filter, config.queue_capacity).await?;
    let hooks = target.strategy.build(username, &config.inhibit);

    let unit = target.unit.clone();
    let span = info_span!("target", unit = %unit);
    let orchestrator = Orchestrator::new(target, source, hooks, SystemdDispatcher::new());

    tasks.spawn(async move { (unit, orchestrator.run().await) }.instrument(span));
    Ok(())
}

/// Wait for the first target to fail or for a termination signal.
async fn supervise(mut tasks: TargetTasks) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    let outcome = tokio::select! {
        Some(joined) = tasks.join_next() => match joined {
            Ok((unit, Err(e))) => {
                Err(anyhow::Error::new(e).context(format!("Target {unit} stopped")))
            }
            Err(e) => Err(anyhow::anyhow!("Target task panicked: {e}")),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
            Ok(())
        }
    };

    if let Err(e) = notify::stopping() {
        warn!("Call to sd_notify failed: {:#}", e);
    }

    // Aborting drops held inhibitor locks
    tasks.shutdown().await;
    outcome
}

/// Name of the user running the daemon.
fn current_username() -> Result<String> {
    let uid = Uid::current();
    let user = User::from_uid(uid)
        .context("Failed to get username")?
        .ok_or_else(|| anyhow::anyhow!("No passwd entry for uid {}", uid))?;
    Ok(user.name)
}

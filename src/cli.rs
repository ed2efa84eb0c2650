use crate::config::settings::Settings;
use crate::config::types::SandboxError;
use crate::kernel::signal::{self, Registration, TERMINATION_SIGNALS};
use crate::pool::output::TaskReport;
use crate::pool::SandboxPool;
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Runs after the per-run forwarders have signalled their coordinators
const SHUTDOWN_PRIORITY: i32 = 10;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Internal role selector (hidden; used by the re-exec paths)
    #[arg(long, hide = true)]
    internal_role: Option<String>,
    /// Sentinel sleep for the internal sentinel role
    #[arg(long, hide = true)]
    timeout_ms: Option<u64>,
    /// Worker process group the sentinel cleans up if the coordinator dies
    #[arg(long, hide = true)]
    worker_pgid: Option<i32>,
    /// JSON launch plan for the internal guest-exec role
    #[arg(long, hide = true)]
    plan: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run task artifacts through the sandbox pool, one JSON report per line
    Run {
        /// Settings file (JSON), merged over the built-in defaults
        #[arg(long)]
        config: Option<PathBuf>,
        /// Per-run timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Number of sandbox instances
        #[arg(long)]
        instances: Option<usize>,
        /// Task archives to run
        #[arg(required = true)]
        artifacts: Vec<PathBuf>,
    },
    /// Show the pool configuration as an idle status report
    Status {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

pub fn run() -> Result<()> {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();

    let cli = Cli::parse();
    if let Some(role) = cli.internal_role.as_deref() {
        return run_internal_role(role, cli.timeout_ms, cli.worker_pgid, cli.plan.as_deref());
    }

    match cli.command.ok_or_else(|| anyhow!("missing command"))? {
        Commands::Run {
            config,
            timeout,
            instances,
            artifacts,
        } => {
            let settings = load_settings(config.as_deref(), timeout, instances)?;
            run_artifacts(&settings, &artifacts)
        }
        Commands::Status { config } => {
            let settings = load_settings(config.as_deref(), None, None)?;
            let pool = SandboxPool::from_settings(&settings)?;
            println!("{}", serde_json::to_string_pretty(&pool.status())?);
            Ok(())
        }
    }
}

fn run_internal_role(
    role: &str,
    timeout_ms: Option<u64>,
    worker_pgid: Option<i32>,
    plan: Option<&str>,
) -> Result<()> {
    match role {
        "coordinator" => crate::core::coordinator::run_coordinator_role(),
        "sentinel" => {
            let timeout_ms = timeout_ms
                .ok_or_else(|| anyhow!("--timeout-ms is required for --internal-role=sentinel"))?;
            crate::core::coordinator::run_sentinel_role(timeout_ms, worker_pgid)
        }
        "guest-exec" => {
            let plan =
                plan.ok_or_else(|| anyhow!("--plan is required for --internal-role=guest-exec"))?;
            crate::guest::exec::run_guest_exec_role(plan)
        }
        other => Err(anyhow!("unsupported internal role: {}", other)),
    }
}

fn load_settings(config: Option<&Path>, timeout: Option<u64>, instances: Option<usize>) -> Result<Settings> {
    let mut settings = Settings::load(config)?;
    let mut overrides = serde_json::Map::new();
    if let Some(timeout) = timeout {
        overrides.insert("timeout_secs".to_string(), timeout.into());
    }
    if let Some(instances) = instances {
        overrides.insert("max_instances".to_string(), instances.into());
    }
    if !overrides.is_empty() {
        settings = settings.merge(serde_json::Value::Object(overrides))?;
    }
    Ok(settings)
}

fn print_report(report: &TaskReport) -> Result<()> {
    println!("{}", serde_json::to_string(report)?);
    Ok(())
}

/// Print reports as they arrive until `pending` reaches zero or shutdown
fn drain(rx: &Receiver<TaskReport>, pending: &mut usize, shutdown: &AtomicBool, block: bool) -> Result<()> {
    while *pending > 0 && !shutdown.load(Ordering::SeqCst) {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(report) => {
                *pending -= 1;
                print_report(&report)?;
                if !block {
                    return Ok(());
                }
            }
            Err(RecvTimeoutError::Timeout) if block => continue,
            Err(RecvTimeoutError::Timeout) => return Ok(()),
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
    Ok(())
}

fn run_artifacts(settings: &Settings, artifacts: &[PathBuf]) -> Result<()> {
    let pool = Arc::new(SandboxPool::from_settings(settings)?);
    let shutdown = Arc::new(AtomicBool::new(false));

    let on_signal = {
        let pool = pool.clone();
        let shutdown = shutdown.clone();
        signal::callback(move |sig| {
            if shutdown.swap(true, Ordering::SeqCst) {
                return;
            }
            warn!("Received {}; stopping all sandboxes", sig);
            if let Err(e) = pool.shut_down() {
                warn!("Shutdown incomplete: {}", e);
            }
        })
    };
    let _registration = Registration::new(&TERMINATION_SIGNALS, &on_signal, SHUTDOWN_PRIORITY)?;

    let (tx, rx) = unbounded::<TaskReport>();
    let mut pending = 0usize;

    'artifacts: for artifact in artifacts {
        let artifact = std::fs::canonicalize(artifact)
            .with_context(|| format!("artifact {}", artifact.display()))?;
        loop {
            if shutdown.load(Ordering::SeqCst) {
                break 'artifacts;
            }
            let Some(slot) = pool.claim_idle() else {
                if pending == 0 {
                    // reported, but the slot's callback has not returned yet
                    std::thread::sleep(Duration::from_millis(10));
                } else {
                    drain(&rx, &mut pending, &shutdown, false)?;
                }
                continue;
            };
            let tx = tx.clone();
            match slot.start(&artifact, move |report| {
                let _ = tx.send(report);
            }) {
                Ok(run_id) => {
                    info!("Submitted {} as run {}", artifact.display(), run_id);
                    pending += 1;
                    break;
                }
                Err(SandboxError::SlotBusy(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
    drop(tx);

    drain(&rx, &mut pending, &shutdown, true)?;
    pool.wait_all();

    if shutdown.load(Ordering::SeqCst) {
        return Err(anyhow!("interrupted; {} run(s) abandoned", pending));
    }
    pool.plugins().shut_down();
    Ok(())
}

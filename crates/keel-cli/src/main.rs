//! `keel` – service supervisor command line.
//!
//! ```text
//! keel run -c services.yaml [-o logs] [--logfile] [-v...] [--settings path] [--telemetry-log path]
//! keel start [--socket path]
//! keel config [--write]
//! ```
//!
//! `run` holds the singleton lock, boots the services, waits for the
//! readiness gate and supervises until SIGINT/SIGTERM.  Its exit status is
//! `0` after a clean shutdown, `2` when another instance holds the lock, `3`
//! when booting failed and `4` on a runtime fault.
//!
//! `start` sends the readiness token to a running supervisor.

mod config;
mod services;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{ArgAction, Args, Parser, Subcommand};
use colored::Colorize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use keel_hal::{OsProcessControl, SysinfoMetrics};
use keel_kernel::{ReadinessGate, SingletonGuard};
use keel_middleware::{
    EventBus, FileParams, ParamStore, SocketStartChannel, TelemetryRecorder, Topic, send_start,
};
use keel_runtime::logging::init_tracing;
use keel_runtime::{RunError, Supervisor, TelemetryPublisher};
use keel_types::{EventPayload, ExitKind, KeelError, ManagerState, Platform, ServiceDescriptor};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "keel", version, about = "Supervise a fixed set of long-running services")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Boot and supervise the services in a service list.
    Run(RunArgs),
    /// Open the readiness gate of a running supervisor.
    Start {
        /// Start socket (defaults to `start_socket` from the settings file).
        #[arg(long)]
        socket: Option<PathBuf>,
        #[arg(long)]
        settings: Option<PathBuf>,
    },
    /// Print the effective settings.
    Config {
        #[arg(long)]
        settings: Option<PathBuf>,
        /// Write them back to the settings file.
        #[arg(long)]
        write: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Service list (YAML).
    #[arg(short = 'c', long = "config")]
    services: PathBuf,
    /// Directory for per-service log files.
    #[arg(short = 'o', long = "output", default_value = ".")]
    log_dir: PathBuf,
    /// Redirect each service's stdout/stderr to `<output>/<service>.log`.
    #[arg(long)]
    logfile: bool,
    /// Raise log verbosity (`-v` debug, `-vv` trace).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    /// Settings file (defaults to `~/.keel/config.toml`).
    #[arg(long)]
    settings: Option<PathBuf>,
    /// Append every telemetry event to this JSON-lines file.
    #[arg(long)]
    telemetry_log: Option<PathBuf>,
}

impl RunArgs {
    fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run(args) => run(&args),
        Command::Start { socket, settings } => start(socket, settings),
        Command::Config { settings, write } => show_config(settings, write),
    };
    std::process::exit(code);
}

// ─────────────────────────────────────────────────────────────────────────────
// keel run
// ─────────────────────────────────────────────────────────────────────────────

fn run(args: &RunArgs) -> i32 {
    let _tracing = init_tracing("keel", args.log_level());

    let cfg = match config::resolve(args.settings.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return ExitKind::BootFailure.exit_code();
        }
    };
    let services = match services::load(&args.services, Platform::current()) {
        Ok(services) => services,
        Err(e) => {
            eprintln!("{}: {}", "Service list error".red(), e);
            return ExitKind::BootFailure.exit_code();
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    install_signal_handler(Arc::clone(&shutdown));

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Runtime error".red(), e);
            return ExitKind::BootFailure.exit_code();
        }
    };

    match runtime.block_on(supervise(&cfg, args, services, shutdown)) {
        Ok(()) => {
            println!("{}", "  ✓ keel stopped cleanly.".green());
            ExitKind::Clean.exit_code()
        }
        Err(e) => {
            eprintln!("{} {}", "✗".red().bold(), e);
            e.exit_code()
        }
    }
}

fn install_signal_handler(shutdown: Arc<AtomicBool>) {
    // SIGINT and SIGTERM (`termination` feature) both land here.
    if let Err(e) = ctrlc::set_handler(move || {
        if shutdown.swap(true, Ordering::SeqCst) {
            eprintln!("{}", "  already shutting down …".dimmed());
        } else {
            eprintln!();
            eprintln!("{}", "⚠  Termination requested – stopping services …".yellow().bold());
        }
    }) {
        warn!(error = %e, "Failed to install signal handler; services will not be stopped on Ctrl-C");
    }
}

fn boot(source: KeelError) -> RunError {
    RunError::new(ExitKind::BootFailure, source)
}

async fn supervise(
    cfg: &Config,
    args: &RunArgs,
    services: Vec<ServiceDescriptor>,
    shutdown: Arc<AtomicBool>,
) -> Result<(), RunError> {
    // Lock first: a second instance must not unlink the running one's socket.
    let guard = SingletonGuard::acquire(&cfg.lock_dir, &cfg.lock_name).map_err(RunError::lock)?;

    let params: Arc<dyn ParamStore> = Arc::new(FileParams::open(&cfg.params_dir).map_err(boot)?);
    let start = SocketStartChannel::bind(&cfg.start_socket).map_err(boot)?;
    info!(socket = %start.path().display(), "listening for start token");

    let log_dir = args.logfile.then(|| args.log_dir.clone());

    let bus = EventBus::default();
    let recorder = match &args.telemetry_log {
        Some(path) => Some(TelemetryRecorder::create(path).map_err(boot)?.spawn(&bus)),
        None => None,
    };
    let printer = spawn_status_printer(&bus);

    let gate = ReadinessGate::new(Arc::clone(&params), Box::new(start), cfg.trusted_images.clone());
    let publisher = TelemetryPublisher::new(
        Arc::new(bus.clone()),
        Box::new(SysinfoMetrics::new()),
        Box::new(SysinfoMetrics::new()),
    );
    let passive = config::passive_from(std::env::var("PASSIVE").ok().as_deref());

    let outcome = Supervisor::new(
        cfg.supervisor_config(log_dir, passive),
        Box::new(OsProcessControl::new()),
        params,
        gate,
        publisher,
    )
    .with_guard(guard)
    .with_shutdown(shutdown)
    .run(services)
    .await;

    // Closing the bus lets the observers drain and exit.
    drop(bus);
    for task in recorder.into_iter().chain(Some(printer)) {
        if let Err(e) = task.await {
            debug!(error = %e, "telemetry observer ended abnormally");
        }
    }
    outcome
}

fn spawn_status_printer(bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe_to(Topic::ManagerState);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let EventPayload::ManagerState(state) = event.payload {
                        println!("{}", status_line(&state));
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// `ready  ui  controlsd(2)  plannerd` – green running, red not running.
fn status_line(state: &ManagerState) -> String {
    let mut line = if state.ready {
        "ready    ".green().bold().to_string()
    } else {
        "not ready".yellow().bold().to_string()
    };
    for p in &state.processes {
        let label = if p.restart_count > 0 {
            format!("{}({})", p.name, p.restart_count)
        } else {
            p.name.clone()
        };
        let label = if p.running {
            label.green()
        } else if p.should_be_running {
            label.red()
        } else {
            label.red().strikethrough()
        };
        line.push_str("  ");
        line.push_str(&label.to_string());
    }
    line
}

// ─────────────────────────────────────────────────────────────────────────────
// keel start / keel config
// ─────────────────────────────────────────────────────────────────────────────

fn start(socket: Option<PathBuf>, settings: Option<PathBuf>) -> i32 {
    let socket = match socket {
        Some(socket) => socket,
        None => match config::resolve(settings.as_deref()) {
            Ok(cfg) => cfg.start_socket,
            Err(e) => {
                eprintln!("{}: {}", "Config error".red(), e);
                return 1;
            }
        },
    };
    match send_start(&socket) {
        Ok(()) => {
            println!("  {} start token sent to {}", "✓".green(), socket.display().to_string().bold());
            0
        }
        Err(e) => {
            eprintln!("{}: {}", "Start failed".red(), e);
            1
        }
    }
}

fn show_config(settings: Option<PathBuf>, write: bool) -> i32 {
    let path = settings.unwrap_or_else(config::config_path);
    let cfg = match config::resolve(Some(&path)) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return 1;
        }
    };
    match toml::to_string_pretty(&cfg) {
        Ok(raw) => print!("{raw}"),
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return 1;
        }
    }
    if write {
        if let Err(e) = config::save_to(&cfg, &path) {
            eprintln!("{}: {}", "Config error".red(), e);
            return 1;
        }
        println!("  {} saved to {}", "✓".green(), path.display().to_string().bold());
    }
    0
}

//! IEDSim RPC - Unix-socket msgpack backend for the simulator GUI.
//!
//! Binds the IPC socket, serves `server.*` and `client.*` actions through a
//! worker pool and runs until SIGINT or SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use iedsim_core::config::IpcConfig;
use iedsim_core::engine::SimEngine;
use iedsim_core::network::SystemNetwork;
use iedsim_core::{ActionRegistry, BackendContext, IpcListener, Router, WorkerPool};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "iedsim-rpc")]
#[command(version, about = "IPC backend for the IEC 61850 device simulator")]
struct Args {
    /// Unix socket path to listen on
    #[arg(long, default_value = IpcConfig::DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Socket path given positionally (overrides --socket)
    #[arg(value_name = "SOCKET")]
    socket_path: Option<PathBuf>,

    /// Number of request worker threads
    #[arg(
        short,
        long,
        default_value_t = IpcConfig::DEFAULT_WORKER_THREADS,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    workers: usize,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Exit when the parent process dies (Linux)
    #[arg(long)]
    pdeathsig: bool,
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();
}

/// Ask the kernel for SIGTERM when the parent exits. Returns false if the
/// parent is already gone.
#[cfg(target_os = "linux")]
fn apply_pdeathsig() -> Result<bool> {
    use nix::sys::prctl;
    use nix::sys::signal::Signal;

    prctl::set_pdeathsig(Signal::SIGTERM).context("failed to set parent death signal")?;
    Ok(nix::unistd::getppid().as_raw() != 1)
}

#[cfg(not(target_os = "linux"))]
fn apply_pdeathsig() -> Result<bool> {
    Ok(true)
}

/// Signal streams installed before the READY line so an early SIGTERM
/// still takes the clean shutdown path.
#[cfg(unix)]
struct ShutdownSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn install() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?,
            terminate: signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?,
        })
    }

    async fn wait(mut self) -> Result<()> {
        tokio::select! {
            _ = self.interrupt.recv() => {}
            _ = self.terminate.recv() => {}
        }
        Ok(())
    }
}

#[cfg(not(unix))]
struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    fn install() -> Result<Self> {
        Ok(Self)
    }

    async fn wait(self) -> Result<()> {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.pdeathsig && !apply_pdeathsig()? {
        std::process::exit(1);
    }

    init_logging(args.debug);

    let socket_path = args.socket_path.unwrap_or(args.socket);
    info!("Starting IEDSim RPC backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Socket: {}", socket_path.display());
    info!(
        "Parent death signal: {}",
        if args.pdeathsig { "enabled" } else { "disabled" }
    );

    let context = BackendContext::new(Arc::new(SimEngine::new()), Arc::new(SystemNetwork));
    let router = Arc::new(Router::new(
        ActionRegistry::with_default_actions(),
        Arc::new(context),
    ));
    let handler = {
        let router = router.clone();
        Arc::new(move |body: &[u8]| router.handle_request(body))
    };
    let pool = Arc::new(WorkerPool::new(args.workers, handler)?);

    let mut handle = IpcListener::start(&socket_path, pool)
        .with_context(|| format!("failed to start IPC server at {}", socket_path.display()))?;

    let signals = ShutdownSignals::install()?;

    // Readiness line for the parent process (intentional stdout for IPC)
    println!("READY socket={}", socket_path.display());
    std::io::stdout().flush()?;

    signals.wait().await?;
    info!("Shutdown signal received, exiting");

    tokio::task::spawn_blocking(move || handle.stop()).await?;
    drop(router);

    Ok(())
}

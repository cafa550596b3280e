//! ish - interactive shells over a local socket
//!
//! **Daemon** (`ish daemon`): listens on a Unix domain socket and gives every
//! connection its own shell on a fresh pseudo-terminal.
//!
//! **Connect** (`ish connect`, or no subcommand): attaches the local terminal
//! to a new shell on a running daemon.

use clap::{Parser as ClapParser, Subcommand};
use ish::{client, config, server, terminal};
use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ish - interactive shells over a local socket
#[derive(ClapParser, Debug)]
#[command(name = "ish", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the session daemon
    Daemon {
        /// Path to the Unix domain socket
        #[arg(long, env = "ISH_SOCKET")]
        socket: Option<PathBuf>,

        /// Config file (defaults to <config dir>/ish/config.toml)
        #[arg(long, env = "ISH_CONFIG")]
        config: Option<PathBuf>,

        /// Shell to spawn for each connection (overrides $SHELL)
        #[arg(long)]
        shell: Option<String>,

        /// Seconds a shell gets to exit after SIGTERM before it is killed
        #[arg(long)]
        grace_period: Option<u64>,
    },

    /// Open a shell on a running daemon
    Connect {
        /// Path to the Unix domain socket
        #[arg(long, env = "ISH_SOCKET")]
        socket: Option<PathBuf>,
    },
}

#[derive(Error, Debug)]
pub enum IshError {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("config file not found: {}", .0.display())]
    MissingConfig(PathBuf),

    #[error("terminal error: {0}")]
    Terminal(#[from] terminal::TerminalError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), IshError> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Daemon {
            socket,
            config,
            shell,
            grace_period,
        }) => {
            init_tracing();
            run_daemon(socket, config, shell, grace_period).await
        }
        Some(Commands::Connect { socket }) => {
            init_tracing_stderr();
            run_connect(socket).await
        }
        None => {
            init_tracing_stderr();
            run_connect(None).await
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ish=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize tracing with stderr output.
///
/// The client's stdout carries the remote terminal, so logs go to stderr and
/// default to warnings only.
fn init_tracing_stderr() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ish=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Daemon ─────────────────────────────────────────────────────────

async fn run_daemon(
    socket: Option<PathBuf>,
    config_path: Option<PathBuf>,
    shell: Option<String>,
    grace_period: Option<u64>,
) -> Result<(), IshError> {
    let mut config = match config_path {
        Some(path) => config::Config::load(&path)?.ok_or(IshError::MissingConfig(path))?,
        None => match config::default_config_path() {
            Some(path) => config::Config::load(&path)?.unwrap_or_default(),
            None => config::Config::default(),
        },
    };

    if let Some(socket) = socket {
        config.socket_path = Some(socket);
    }
    if let Some(shell) = shell {
        config.shell.program = Some(shell);
    }
    if let Some(secs) = grace_period {
        config.grace_period_secs = secs;
    }

    tracing::info!(
        shell = %config.shell.program(),
        grace_period = ?config.grace_period(),
        "ish daemon starting"
    );

    server::run_daemon(config, shutdown_signal()).await?;

    tracing::info!("ish daemon exiting");
    Ok(())
}

/// Resolves on SIGINT, SIGTERM or SIGQUIT.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut term, mut quit) = match (signal(SignalKind::terminate()), signal(SignalKind::quit())) {
        (Ok(term), Ok(quit)) => (term, quit),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(?e, "failed to install signal handlers, only Ctrl+C stops the daemon");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
        _ = term.recv() => tracing::info!("received SIGTERM"),
        _ = quit.recv() => tracing::info!("received SIGQUIT"),
    }
}

// ── Client ─────────────────────────────────────────────────────────

async fn run_connect(socket: Option<PathBuf>) -> Result<(), IshError> {
    let socket_path = socket
        .or_else(configured_socket_path)
        .unwrap_or_else(server::default_socket_path);

    let c = match client::Client::connect(&socket_path).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!(
                "ish: failed to connect to daemon at {}: {}",
                socket_path.display(),
                e
            );
            std::process::exit(1);
        }
    };

    let initial_size = match terminal::window_size() {
        Ok(size) => Some(size),
        Err(e) => {
            tracing::warn!(%e, "could not read terminal size");
            None
        }
    };

    let raw_guard = terminal::RawModeGuard::new()?;
    let result = c.run_streaming(initial_size).await;
    drop(raw_guard);

    if let Err(e) = result {
        eprintln!("ish: streaming error: {}", e);
        return Err(IshError::Io(e));
    }

    Ok(())
}

/// Socket path from the default config file, if one sets it.
fn configured_socket_path() -> Option<PathBuf> {
    let path = config::default_config_path()?;
    match config::Config::load(&path) {
        Ok(config) => config?.socket_path,
        Err(e) => {
            tracing::warn!(%e, "ignoring config file");
            None
        }
    }
}

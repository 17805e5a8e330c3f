#![forbid(unsafe_code)]

//! `copilot-acp-proxy`: agent-SDK compatible stdio server backed by ACP
//! agents.
//!
//! Accepts the vendor CLI's flags so an SDK can spawn it in place of the
//! vendor binary, serves the client protocol on stdin/stdout, and logs to
//! stderr or a file.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, EnvFilter};

use copilot_acp_proxy::backend::ProcessLauncher;
use copilot_acp_proxy::frontend::FrontendListener;
use copilot_acp_proxy::session::SessionManager;
use copilot_acp_proxy::{AppError, ProxyConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogLevel {
    None,
    Off,
    Error,
    Warning,
    Info,
    Debug,
    All,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            Self::None | Self::Off => "off",
            Self::Error => "error",
            Self::Warning => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::All => "trace",
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "copilot-acp-proxy",
    about = "Serve the agent-SDK protocol on stdio using ACP agents",
    version,
    long_about = None
)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Run as a detached stdio service.
    #[arg(long)]
    headless: bool,

    /// Serve on stdin/stdout (the only transport).
    #[arg(long)]
    stdio: bool,

    /// Accepted for compatibility.
    #[arg(long)]
    server: bool,

    /// TCP port; only 0 is accepted.
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Log verbosity; `RUST_LOG` takes precedence when set.
    #[arg(long, value_enum, env = "ACP_PROXY_LOG_LEVEL", default_value_t = LogLevel::Warning)]
    log_level: LogLevel,

    /// Append logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Default backend kind.
    #[arg(long, env = "ACP_PROXY_BACKEND")]
    backend: Option<String>,

    /// Extra arguments passed to every backend launch.
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    backend_args: Vec<String>,

    /// Default working directory for sessions.
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Ignored; backends authenticate themselves.
    #[arg(long, hide = true)]
    auth_token_env: Option<String>,

    /// Ignored; backends authenticate themselves.
    #[arg(long, hide = true)]
    no_auto_login: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(&args)?;

    if args.port != 0 {
        return Err(AppError::Config(format!(
            "--port {} requested but only stdio is supported",
            args.port
        )));
    }
    if !args.headless {
        info!("not started with --headless; serving stdio anyway");
    }

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ProxyConfig::load_from_path(path)?,
        None => ProxyConfig::default(),
    };
    let cwd = match args.cwd {
        Some(dir) => Some(
            dir.canonicalize()
                .map_err(|err| AppError::Config(format!("invalid --cwd {}: {err}", dir.display())))?,
        ),
        None => std::env::current_dir().ok(),
    };
    config.apply_overrides(args.backend, args.backend_args, cwd)?;
    info!(
        backend = %config.default_backend,
        cwd = %config.default_cwd.display(),
        "configuration loaded"
    );

    let manager = SessionManager::new(Arc::new(config), Arc::new(ProcessLauncher));
    let shutdown = CancellationToken::new();
    let signal_ct = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_ct.cancel();
    });

    let listener = FrontendListener::new(manager, shutdown);
    let result = listener
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await;
    info!("copilot-acp-proxy shut down");
    result
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(args: &Cli) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.directive()));

    // stdout carries the protocol; logs never go there.
    let (writer, ansi) = match &args.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| AppError::Config(format!("cannot open log file {}: {err}", path.display())))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(writer)
        .with_ansi(ansi);

    match args.log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}

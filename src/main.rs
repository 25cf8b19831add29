//! collabedit-server — collaborative editing server binary.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use collabedit::config::ConfigFile;
use collabedit::server::{CollabServer, ServerConfig, ServerError};

#[derive(Parser, Debug)]
#[command(
    name = "collabedit-server",
    version,
    about = "Real-time collaborative text editing server"
)]
struct Cli {
    /// Port to listen on (overrides the config file).
    #[arg(long)]
    port: Option<u16>,

    /// Path to a KEY=VALUE configuration file.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Worker threads; 0 means hardware parallelism (minimum 2).
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Seconds between idle-session sweeps.
    #[arg(long = "cleanup-interval", default_value_t = 300)]
    cleanup_interval: u64,

    /// Seconds of inactivity before a session is evicted.
    #[arg(long = "max-idle", default_value_t = 3600)]
    max_idle: u64,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => match ConfigFile::load(path) {
            Ok(file) => file,
            Err(e) => {
                log::error!("cannot load config {}: {e}", path.display());
                return ExitCode::from(1);
            }
        },
        None => ConfigFile::default(),
    };

    let port = cli.port.unwrap_or_else(|| file.server_port());
    let threads = match cli.threads {
        0 => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .max(2),
        n => n.max(2),
    };

    let config = ServerConfig {
        bind_addr: format!("0.0.0.0:{port}"),
        max_idle: Duration::from_secs(cli.max_idle),
        cleanup_interval: Duration::from_secs(cli.cleanup_interval),
        ..ServerConfig::default()
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    log::info!("starting on port {port} with {threads} worker threads");
    let result = runtime.block_on(async {
        let server = CollabServer::new(config);
        server.run_with_shutdown(shutdown_signal()).await
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ ServerError::Bind(_)) => {
            log::error!("{e}");
            ExitCode::from(1)
        }
        Err(e) => {
            log::error!("{e}");
            ExitCode::from(2)
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                log::warn!("cannot install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => log::info!("SIGINT received"),
            _ = term.recv() => log::info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("ctrl-c received");
    }
}

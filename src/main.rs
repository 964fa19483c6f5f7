//! pipecho: a pipelined TCP echo server
//!
//! Every connection runs through a chain of handler stages:
//! - optional TLS termination (rustls)
//! - optional traffic logging
//! - echo
//!
//! Connections are accepted on a dedicated thread and spread round-robin
//! over a group of mio worker loops.

mod config;
mod error;
mod pipeline;
mod runtime;
mod server;
mod tls;

use config::ServerConfig;
use server::Server;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let config = match ServerConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        tls = config.tls,
        workers = ?config.workers,
        grace_secs = config.shutdown_grace.as_secs(),
        "Starting pipecho"
    );

    let tls = match provision_tls(&config) {
        Ok(tls) => tls,
        Err(e) => {
            error!(error = %e, "TLS setup failed");
            return ExitCode::FAILURE;
        }
    };

    let mut server = match Server::start(&config, tls) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to start server");
            return ExitCode::FAILURE;
        }
    };

    info!(addr = %server.local_addr(), "Serving until SIGINT or SIGTERM");
    if let Err(e) = wait_for_stop(&server) {
        error!(error = %e, "Signal handling failed, shutting down");
    }
    info!(halted = server.is_closed(), "Stopping");

    let report = server.shutdown();
    info!(
        drained = report.drained,
        undelivered_connections = report.undelivered_connections,
        undelivered_bytes = report.undelivered_bytes,
        "Shutdown complete"
    );

    match report.acceptor_failure {
        Some(e) => {
            error!(error = %e, "Listening socket failed");
            ExitCode::FAILURE
        }
        None => ExitCode::SUCCESS,
    }
}

/// Load the configured certificate, or generate a self-signed one.
fn provision_tls(
    config: &ServerConfig,
) -> Result<Option<Arc<rustls::ServerConfig>>, tls::TlsError> {
    if !config.tls {
        return Ok(None);
    }
    match (&config.cert, &config.key) {
        (Some(cert), Some(key)) => {
            info!(cert = %cert.display(), "Loading TLS certificate");
            tls::Identity::from_pem_files(cert, key)?.server_config().map(Some)
        }
        _ => {
            warn!("No certificate configured, using a self-signed one for localhost");
            tls::self_signed(&["localhost".to_string()]).map(Some)
        }
    }
}

/// Block until SIGINT, SIGTERM, or the server halting on its own.
fn wait_for_stop(server: &Server) -> std::io::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res?;
                    info!("Received SIGINT");
                }
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = server.closed() => warn!("Server halted"),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res?;
                    info!("Received Ctrl+C");
                }
                _ = server.closed() => warn!("Server halted"),
            }
        }
        Ok(())
    })
}

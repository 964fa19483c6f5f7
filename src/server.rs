//! Server lifecycle: bind, start the loop threads, shut them down.
//!
//! Startup order is bind, worker group, acceptor. A bind failure therefore
//! leaves nothing running. Shutdown runs the other way round: the acceptor
//! stops accepting, workers drain within the grace period and are joined,
//! then the acceptor thread is joined.

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::pipeline::PipelineFactory;
use crate::runtime::{
    Acceptor, AcceptorHandle, HaltSignal, LoopGroup, WorkerReport, WorkerSettings,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Outcome of `Server::shutdown`.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Connections closed during the grace period.
    pub drained: usize,
    /// Connections dropped at the deadline with output still queued.
    pub undelivered_connections: usize,
    pub undelivered_bytes: usize,
    /// Set if the listening socket failed before shutdown.
    pub acceptor_failure: Option<ServerError>,
}

impl ShutdownReport {
    fn add(&mut self, worker: WorkerReport) {
        self.drained += worker.drained;
        self.undelivered_connections += worker.undelivered_connections;
        self.undelivered_bytes += worker.undelivered_bytes;
    }

    pub fn is_clean(&self) -> bool {
        self.undelivered_connections == 0 && self.acceptor_failure.is_none()
    }
}

/// A running server.
///
/// Dropping the server shuts it down.
pub struct Server {
    local_addr: SocketAddr,
    group: Arc<LoopGroup>,
    workers: Vec<JoinHandle<WorkerReport>>,
    acceptor: AcceptorHandle,
    acceptor_thread: Option<JoinHandle<Result<(), ServerError>>>,
    open: Arc<AtomicUsize>,
    halted: watch::Receiver<bool>,
    stopped: bool,
}

impl Server {
    /// Bind the listening socket and start the acceptor and worker loops.
    ///
    /// `tls` is required when the config enables TLS; certificate
    /// provisioning happens outside the server.
    pub fn start(
        config: &ServerConfig,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Result<Server, ServerError> {
        let listen = config.listen_addr();
        let addr: SocketAddr = listen.parse().map_err(|source| ServerError::Address {
            addr: listen.clone(),
            source,
        })?;

        let listener = bind(addr, config.backlog)?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;
        Server::launch(config, tls, listener, local_addr)
    }

    /// Start the loops on an already listening socket.
    fn launch(
        config: &ServerConfig,
        tls: Option<Arc<rustls::ServerConfig>>,
        listener: std::net::TcpListener,
        local_addr: SocketAddr,
    ) -> Result<Server, ServerError> {
        let (halt, halted) = HaltSignal::new();
        let open = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(PipelineFactory::new(tls, config.log_traffic));
        let tls_enabled = factory.tls_enabled();
        let settings = WorkerSettings {
            read_buffer_size: config.read_buffer_size,
            write_high_watermark: config.write_high_watermark,
            shutdown_grace: config.shutdown_grace,
        };

        let (group, workers) = LoopGroup::spawn(
            config.size_policy(),
            factory,
            Arc::clone(&open),
            settings,
            &halt,
        )?;
        let group = Arc::new(group);

        let spawned = Acceptor::new(
            listener,
            Arc::clone(&group),
            Arc::clone(&open),
            config.max_connections,
        )
        .and_then(|(acceptor, handle)| {
            let thread = thread::Builder::new()
                .name("acceptor".to_string())
                .spawn(move || {
                    let result = acceptor.run();
                    if let Err(e) = &result {
                        error!(error = %e, "Acceptor failed");
                    }
                    halt.raise();
                    result
                })?;
            Ok((handle, thread))
        });

        let (acceptor, acceptor_thread) = match spawned {
            Ok(spawned) => spawned,
            Err(source) => {
                group.shutdown();
                for worker in workers {
                    let _ = worker.join();
                }
                return Err(ServerError::Spawn {
                    name: "acceptor".to_string(),
                    source,
                });
            }
        };

        info!(
            addr = %local_addr,
            workers = group.len(),
            tls = tls_enabled,
            backlog = config.backlog,
            "Server listening"
        );

        Ok(Server {
            local_addr,
            group,
            workers,
            acceptor,
            acceptor_thread: Some(acceptor_thread),
            open,
            halted,
            stopped: false,
        })
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections currently owned by worker loops.
    pub fn connection_count(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Completes once the listening socket is closed or a loop thread fails.
    pub async fn closed(&self) {
        let mut halted = self.halted.clone();
        let _ = halted.wait_for(|halted| *halted).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.halted.borrow()
    }

    /// Stop accepting, drain connections, join every loop thread.
    ///
    /// Only the first call does anything; later calls return an empty report.
    pub fn shutdown(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if self.stopped {
            return report;
        }
        self.stopped = true;
        info!(connections = self.connection_count(), "Shutting down");

        self.acceptor.stop();
        self.group.shutdown();

        for worker in self.workers.drain(..) {
            match worker.join() {
                Ok(worker_report) => report.add(worker_report),
                Err(_) => error!("Worker thread panicked"),
            }
        }

        if let Some(thread) = self.acceptor_thread.take() {
            match thread.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => report.acceptor_failure = Some(e),
                Err(_) => error!("Acceptor thread panicked"),
            }
        }

        if report.undelivered_connections > 0 {
            warn!(
                connections = report.undelivered_connections,
                bytes = report.undelivered_bytes,
                "Shutdown left output undelivered"
            );
        }
        info!(drained = report.drained, "Server stopped");
        report
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Create the listening socket with the configured backlog.
///
/// `SO_REUSEADDR` only: a second server on the same port must fail to bind.
fn bind(addr: SocketAddr, backlog: u32) -> Result<std::net::TcpListener, ServerError> {
    let bind_error = |source: io::Error| ServerError::Bind { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_error)?;
    socket.set_reuse_address(true).map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;
    socket.bind(&addr.into()).map_err(bind_error)?;
    socket
        .listen(i32::try_from(backlog).unwrap_or(i32::MAX))
        .map_err(bind_error)?;

    Ok(socket.into())
}

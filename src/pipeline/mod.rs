//! Per-connection handler pipeline.
//!
//! A `Pipeline` is an ordered chain of `Handler` stages bound to one
//! connection. Inbound bytes (socket to application) travel front to back;
//! outbound bytes (application to socket) travel back to front. A stage at
//! the front, such as TLS, therefore sees every byte in both directions and
//! the stages behind it never know it is there.
//!
//! ## Dispatch
//!
//! Stages never call each other. They emit events through a `Context`:
//!
//! ```text
//! ctx.fire_read(bytes)  -> queued for stage i + 1
//! ctx.write(bytes)      -> queued for stage i - 1 (or the socket when i == 0)
//! ```
//!
//! The pipeline drains its queue in FIFO order. Every stage sees its own
//! inputs in the order they were produced, and a stage may write outbound
//! while the stage in front of it is still handling the inbound chunk that
//! triggered the write.

mod echo;
mod logging;
mod tls;

pub use echo::EchoHandler;
pub use logging::LoggingStage;
pub use tls::TlsStage;

use crate::error::ConnectionError;
use crate::runtime::ConnectionId;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

/// One stage of a pipeline.
///
/// The defaults forward data unchanged, so a stage only overrides the
/// directions it cares about.
pub trait Handler: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Bytes arriving from the stage in front (or the socket).
    fn on_inbound(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<(), ConnectionError> {
        ctx.fire_read(data);
        Ok(())
    }

    /// Bytes written by the stage behind this one.
    fn on_outbound(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<(), ConnectionError> {
        ctx.write(data);
        Ok(())
    }

    /// The connection is closing. Called front to back.
    fn on_close(&mut self, _ctx: &mut Context<'_>) {}

    /// The connection failed and is about to be closed.
    fn on_error(&mut self, _ctx: &mut Context<'_>, _cause: &ConnectionError) {}
}

enum Event {
    Inbound { stage: usize, data: Bytes },
    /// `stage` is the next handler to run; `None` means the socket.
    Outbound { stage: Option<usize>, data: Bytes },
}

/// A stage's view of its pipeline while it handles an event.
pub struct Context<'a> {
    stage: usize,
    conn: ConnectionId,
    queue: &'a mut VecDeque<Event>,
    close_requested: &'a mut bool,
}

impl Context<'_> {
    /// Forward bytes to the next stage toward the application.
    pub fn fire_read(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.queue.push_back(Event::Inbound {
            stage: self.stage + 1,
            data,
        });
    }

    /// Send bytes toward the socket, through every stage in front of this one.
    pub fn write(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.queue.push_back(Event::Outbound {
            stage: self.stage.checked_sub(1),
            data,
        });
    }

    /// Ask the owning worker to close the connection once queued output drains.
    pub fn close(&mut self) {
        *self.close_requested = true;
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn
    }
}

/// Ordered chain of handlers for one connection.
///
/// The handler order is fixed at construction.
pub struct Pipeline {
    conn: ConnectionId,
    stages: Vec<Box<dyn Handler>>,
    queue: VecDeque<Event>,
    close_requested: bool,
}

impl Pipeline {
    pub fn new(conn: ConnectionId, stages: Vec<Box<dyn Handler>>) -> Self {
        Self {
            conn,
            stages,
            queue: VecDeque::new(),
            close_requested: false,
        }
    }

    /// Stage names, front to back.
    #[cfg(test)]
    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Whether a stage asked for the connection to be closed.
    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    /// Feed bytes read from the socket to the first stage.
    ///
    /// Bytes that come out the front of the pipeline are appended to `sink`.
    pub fn push_inbound(&mut self, data: Bytes, sink: &mut BytesMut) -> Result<(), ConnectionError> {
        if data.is_empty() {
            return Ok(());
        }
        self.queue.push_back(Event::Inbound { stage: 0, data });
        self.run(sink)
    }

    /// Write bytes from the application end, through every stage, toward the socket.
    pub fn push_outbound(&mut self, data: Bytes, sink: &mut BytesMut) -> Result<(), ConnectionError> {
        if data.is_empty() {
            return Ok(());
        }
        self.queue.push_back(Event::Outbound {
            stage: self.stages.len().checked_sub(1),
            data,
        });
        self.run(sink)
    }

    /// Notify every stage, front to back, that the connection is closing.
    ///
    /// Output produced while closing (a TLS `close_notify`, say) is appended
    /// to `sink`. Errors at this point are logged, not returned.
    pub fn close(&mut self, sink: &mut BytesMut) {
        for stage in 0..self.stages.len() {
            let mut ctx = Context {
                stage,
                conn: self.conn,
                queue: &mut self.queue,
                close_requested: &mut self.close_requested,
            };
            self.stages[stage].on_close(&mut ctx);
            if let Err(e) = self.run(sink) {
                debug!(conn = %self.conn, error = %e, "Error while closing pipeline");
            }
        }
    }

    /// Notify every stage, front to back, that the connection failed.
    pub fn fail(&mut self, cause: &ConnectionError, sink: &mut BytesMut) {
        for stage in 0..self.stages.len() {
            let mut ctx = Context {
                stage,
                conn: self.conn,
                queue: &mut self.queue,
                close_requested: &mut self.close_requested,
            };
            self.stages[stage].on_error(&mut ctx, cause);
        }
        // Only socket-bound output survives a failure.
        self.drain_to_socket(sink);
    }

    fn run(&mut self, sink: &mut BytesMut) -> Result<(), ConnectionError> {
        while let Some(event) = self.queue.pop_front() {
            let result = match event {
                Event::Inbound { stage, data } => match self.stages.get_mut(stage) {
                    Some(handler) => {
                        let mut ctx = Context {
                            stage,
                            conn: self.conn,
                            queue: &mut self.queue,
                            close_requested: &mut self.close_requested,
                        };
                        handler.on_inbound(&mut ctx, data)
                    }
                    None => {
                        trace!(conn = %self.conn, bytes = data.len(), "Inbound bytes reached end of pipeline");
                        Ok(())
                    }
                },
                Event::Outbound {
                    stage: Some(stage),
                    data,
                } => match self.stages.get_mut(stage) {
                    Some(handler) => {
                        let mut ctx = Context {
                            stage,
                            conn: self.conn,
                            queue: &mut self.queue,
                            close_requested: &mut self.close_requested,
                        };
                        handler.on_outbound(&mut ctx, data)
                    }
                    None => Ok(()),
                },
                Event::Outbound { stage: None, data } => {
                    sink.extend_from_slice(&data);
                    Ok(())
                }
            };

            if let Err(e) = result {
                self.drain_to_socket(sink);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Deliver queued socket-bound bytes and drop everything else.
    fn drain_to_socket(&mut self, sink: &mut BytesMut) {
        for event in self.queue.drain(..) {
            if let Event::Outbound { stage: None, data } = event {
                sink.extend_from_slice(&data);
            }
        }
    }
}

/// Builds the pipeline for each new connection.
///
/// Stage order: TLS (if configured), traffic logging (if enabled), echo.
#[derive(Clone)]
pub struct PipelineFactory {
    tls: Option<Arc<rustls::ServerConfig>>,
    log_traffic: bool,
}

impl PipelineFactory {
    pub fn new(tls: Option<Arc<rustls::ServerConfig>>, log_traffic: bool) -> Self {
        Self { tls, log_traffic }
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    pub fn build(&self, conn: ConnectionId) -> Result<Pipeline, ConnectionError> {
        let mut stages: Vec<Box<dyn Handler>> = Vec::with_capacity(3);
        if let Some(config) = &self.tls {
            stages.push(Box::new(TlsStage::new(Arc::clone(config))?));
        }
        if self.log_traffic {
            stages.push(Box::new(LoggingStage::new()));
        }
        stages.push(Box::new(EchoHandler));
        Ok(Pipeline::new(conn, stages))
    }
}

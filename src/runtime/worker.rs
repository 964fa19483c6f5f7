//! Worker loop: a mio event loop that owns a set of connections.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls and drive each connection's
//! pipeline. Connections arrive through a mailbox; the acceptor wakes the
//! poller after each send.
//!
//! ## Shutdown
//!
//! On `Shutdown` every connection stops reading, runs its close hooks and
//! flushes. The loop keeps polling for writability until every connection
//! has drained or the grace period runs out; whatever is still unwritten at
//! that point is reported, not silently dropped.

use super::connection::{ConnState, Connection, ConnectionId, ReadOutcome};
use crate::error::ConnectionError;
use crate::pipeline::PipelineFactory;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Events processed per poll.
const EVENT_CAPACITY: usize = 1024;

/// Mailbox messages for a worker.
pub(crate) enum WorkerMsg {
    Assign {
        id: ConnectionId,
        stream: TcpStream,
        peer: SocketAddr,
    },
    Shutdown,
}

/// Per-worker tuning, copied from the server config.
#[derive(Debug, Clone)]
pub(crate) struct WorkerSettings {
    pub read_buffer_size: usize,
    pub write_high_watermark: usize,
    pub shutdown_grace: Duration,
}

/// What a worker did during shutdown.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    /// Connections closed during the grace period.
    pub drained: usize,
    /// Connections dropped at the grace deadline with bytes still queued.
    pub undelivered_connections: usize,
    /// Bytes those connections never delivered.
    pub undelivered_bytes: usize,
}

/// Sending side of a worker's mailbox.
pub(crate) struct WorkerHandle {
    pub id: usize,
    tx: Sender<WorkerMsg>,
    waker: Arc<Waker>,
}

impl WorkerHandle {
    /// Hand a freshly accepted socket to this worker.
    pub fn assign(&self, id: ConnectionId, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        self.send(WorkerMsg::Assign { id, stream, peer })
    }

    pub fn shutdown(&self) -> io::Result<()> {
        self.send(WorkerMsg::Shutdown)
    }

    fn send(&self, msg: WorkerMsg) -> io::Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker has exited"))?;
        self.waker.wake()
    }
}

pub(crate) struct Worker {
    id: usize,
    poll: Poll,
    mailbox: Receiver<WorkerMsg>,
    connections: Slab<Connection>,
    scratch: Vec<u8>,
    factory: Arc<PipelineFactory>,
    open: Arc<AtomicUsize>,
    settings: WorkerSettings,
    /// Set once shutdown starts.
    deadline: Option<Instant>,
    report: WorkerReport,
}

impl Worker {
    /// Create a worker and its mailbox handle. The worker does nothing until `run`.
    pub fn new(
        id: usize,
        factory: Arc<PipelineFactory>,
        open: Arc<AtomicUsize>,
        settings: WorkerSettings,
    ) -> io::Result<(Worker, WorkerHandle)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (tx, mailbox) = std::sync::mpsc::channel();

        let worker = Worker {
            id,
            poll,
            mailbox,
            connections: Slab::new(),
            scratch: vec![0u8; settings.read_buffer_size],
            factory,
            open,
            settings,
            deadline: None,
            report: WorkerReport::default(),
        };
        Ok((worker, WorkerHandle { id, tx, waker }))
    }

    /// Run until shutdown completes. Only a poller failure returns an error.
    pub fn run(mut self) -> io::Result<WorkerReport> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        info!(worker = self.id, "Worker started");

        loop {
            if let Some(deadline) = self.deadline {
                if self.connections.is_empty() {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    self.abandon_remaining();
                    break;
                }
                self.poll_once(&mut events, Some(deadline - now))?;
            } else {
                self.poll_once(&mut events, None)?;
            }
        }

        info!(
            worker = self.id,
            drained = self.report.drained,
            undelivered = self.report.undelivered_connections,
            "Worker stopped"
        );
        Ok(self.report)
    }

    fn poll_once(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for event in events.iter() {
            match event.token() {
                WAKER_TOKEN => self.drain_mailbox(),
                Token(key) => {
                    let readable = event.is_readable() || event.is_read_closed();
                    let writable = event.is_writable() || event.is_write_closed();
                    self.on_ready(key, readable, writable);
                }
            }
        }
        Ok(())
    }

    fn drain_mailbox(&mut self) {
        loop {
            match self.mailbox.try_recv() {
                Ok(WorkerMsg::Assign { id, stream, peer }) => self.assign(id, stream, peer),
                Ok(WorkerMsg::Shutdown) => self.begin_shutdown(),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.begin_shutdown();
                    break;
                }
            }
        }
    }

    /// Register a new connection for readiness monitoring.
    fn assign(&mut self, id: ConnectionId, mut stream: TcpStream, peer: SocketAddr) {
        if self.deadline.is_some() {
            debug!(worker = self.id, conn = %id, "Refusing connection during shutdown");
            return;
        }

        let pipeline = match self.factory.build(id) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                warn!(worker = self.id, conn = %id, error = %e, "Failed to build pipeline");
                return;
            }
        };

        let entry = self.connections.vacant_entry();
        let key = entry.key();
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, Token(key), Interest::READABLE)
        {
            warn!(worker = self.id, conn = %id, error = %e, "Failed to register connection");
            return;
        }
        entry.insert(Connection::new(id, peer, stream, pipeline));
        self.open.fetch_add(1, Ordering::SeqCst);

        debug!(worker = self.id, conn = %id, peer = %peer, "Accepted connection");
    }

    fn on_ready(&mut self, key: usize, readable: bool, writable: bool) {
        if !self.connections.contains(key) {
            return;
        }

        if readable || self.connections[key].read_paused {
            if let Err(e) = self.on_readable(key) {
                self.fail(key, e);
                return;
            }
        }

        if writable {
            if let Err(e) = self.on_writable(key) {
                self.fail(key, e.into());
                return;
            }
        }

        self.update_interest(key);
    }

    /// Read until the socket would block, feeding each chunk to the pipeline.
    ///
    /// At the high watermark the output is flushed first; if the socket
    /// cannot take enough of it, reading pauses until a later writable event.
    fn on_readable(&mut self, key: usize) -> Result<(), ConnectionError> {
        let high_watermark = self.settings.write_high_watermark.max(1);
        let conn = &mut self.connections[key];
        conn.read_paused = false;

        while conn.state == ConnState::Open {
            if conn.pending() >= high_watermark {
                conn.flush()?;
                if conn.pending() >= high_watermark {
                    conn.read_paused = true;
                    break;
                }
            }
            match conn.read_into_pipeline(&mut self.scratch)? {
                ReadOutcome::Data(_) => {
                    if conn.pipeline.close_requested() {
                        conn.begin_close();
                    }
                }
                ReadOutcome::WouldBlock => break,
                ReadOutcome::Eof => {
                    debug!(worker = self.id, conn = %conn.id, "Peer closed");
                    conn.begin_close();
                }
            }
        }

        conn.flush()?;
        Ok(())
    }

    fn on_writable(&mut self, key: usize) -> io::Result<()> {
        self.connections[key].flush()
    }

    /// Release finished connections; otherwise re-arm the poller if needed.
    fn update_interest(&mut self, key: usize) {
        let high_watermark = self.settings.write_high_watermark;
        let conn = &mut self.connections[key];

        if conn.is_finished() {
            self.release(key);
            return;
        }

        let interest = conn.desired_interest(high_watermark);
        if interest == conn.interest {
            return;
        }
        match self
            .poll
            .registry()
            .reregister(&mut conn.stream, Token(key), interest)
        {
            Ok(()) => conn.interest = interest,
            Err(e) => self.fail(key, e.into()),
        }
    }

    /// Close a failed connection: notify its stages, flush what we can, release it.
    fn fail(&mut self, key: usize, cause: ConnectionError) {
        let conn = &mut self.connections[key];
        if cause.is_handshake() {
            debug!(worker = self.id, conn = %conn.id, peer = %conn.peer, error = %cause, "Handshake failed");
        } else {
            debug!(worker = self.id, conn = %conn.id, error = %cause, "Connection error");
        }
        conn.fail(&cause);
        let _ = conn.flush();
        self.release(key);
    }

    fn release(&mut self, key: usize) {
        if let Some(mut conn) = self.connections.try_remove(key) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            conn.close();
            self.open.fetch_sub(1, Ordering::SeqCst);
            if self.deadline.is_some() {
                self.report.drained += 1;
            }
            debug!(worker = self.id, conn = %conn.id, "Connection closed");
        }
    }

    fn begin_shutdown(&mut self) {
        if self.deadline.is_some() {
            return;
        }
        self.deadline = Some(Instant::now() + self.settings.shutdown_grace);
        debug!(
            worker = self.id,
            connections = self.connections.len(),
            "Draining connections"
        );

        let keys: Vec<usize> = self.connections.iter().map(|(key, _)| key).collect();
        for key in keys {
            let conn = &mut self.connections[key];
            conn.begin_close();
            match conn.flush() {
                Ok(()) => self.update_interest(key),
                Err(e) => self.fail(key, e.into()),
            }
        }
    }

    /// Grace period expired: report and drop everything still queued.
    fn abandon_remaining(&mut self) {
        for (_, conn) in self.connections.iter_mut() {
            warn!(
                worker = self.id,
                conn = %conn.id,
                undelivered = conn.pending(),
                "Dropping connection with undelivered bytes"
            );
            self.report.undelivered_connections += 1;
            self.report.undelivered_bytes += conn.pending();
            let _ = self.poll.registry().deregister(&mut conn.stream);
            conn.close();
        }
        self.open.fetch_sub(self.connections.len(), Ordering::SeqCst);
        self.connections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::thread;

    fn settings(grace: Duration) -> WorkerSettings {
        WorkerSettings {
            read_buffer_size: 4096,
            write_high_watermark: 64 * 1024,
            shutdown_grace: grace,
        }
    }

    fn spawn_worker(
        grace: Duration,
    ) -> (WorkerHandle, thread::JoinHandle<io::Result<WorkerReport>>, Arc<AtomicUsize>) {
        let open = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(PipelineFactory::new(None, false));
        let (worker, handle) = Worker::new(0, factory, Arc::clone(&open), settings(grace)).unwrap();
        let thread = thread::spawn(move || worker.run());
        (handle, thread, open)
    }

    fn connect_pair() -> (TcpStream, SocketAddr, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), peer, client)
    }

    fn wait_for(open: &AtomicUsize, expected: usize) {
        for _ in 0..400 {
            if open.load(Ordering::SeqCst) == expected {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("connection count never reached {expected}");
    }

    #[test]
    fn test_worker_moves_to_its_thread() {
        fn assert_send<T: Send>() {}
        assert_send::<Worker>();
        assert_send::<Connection>();
        assert_send::<WorkerMsg>();
    }

    #[test]
    fn test_assign_echo_and_release() {
        let (handle, thread, open) = spawn_worker(Duration::from_secs(1));
        let (stream, peer, mut client) = connect_pair();
        handle.assign(ConnectionId(1), stream, peer).unwrap();
        wait_for(&open, 1);

        client.write_all(b"worker echo").unwrap();
        let mut buf = [0u8; 11];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"worker echo");

        drop(client);
        wait_for(&open, 0);

        handle.shutdown().unwrap();
        let report = thread.join().unwrap().unwrap();
        assert_eq!(report, WorkerReport::default());
    }

    #[test]
    fn test_shutdown_closes_idle_connections() {
        let (handle, thread, open) = spawn_worker(Duration::from_secs(1));
        let (stream, peer, mut client) = connect_pair();
        handle.assign(ConnectionId(1), stream, peer).unwrap();
        wait_for(&open, 1);

        handle.shutdown().unwrap();
        let report = thread.join().unwrap().unwrap();
        assert_eq!(report.drained, 1);
        assert_eq!(report.undelivered_connections, 0);
        assert_eq!(open.load(Ordering::SeqCst), 0);

        // The server side is gone: the client sees EOF.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_assign_after_shutdown_fails() {
        let (handle, thread, _open) = spawn_worker(Duration::from_millis(100));
        handle.shutdown().unwrap();
        thread.join().unwrap().unwrap();

        let (stream, peer, _client) = connect_pair();
        assert!(handle.assign(ConnectionId(2), stream, peer).is_err());
    }
}

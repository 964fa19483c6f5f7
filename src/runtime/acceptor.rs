//! Acceptor loop: owns the listening socket and hands every accepted
//! connection to the worker group.
//!
//! Runs on its own thread with its own mio poller. A waker plus a stop flag
//! ends the loop; dropping the acceptor closes the listening socket.

use super::group::LoopGroup;
use super::ConnectionId;
use crate::error::ServerError;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// How the accept loop should react to an accept error.
#[derive(Debug, PartialEq, Eq)]
enum AcceptFault {
    /// The failed connection is gone; try the next one right away.
    Retry,
    /// Out of descriptors or memory; wait for the next readiness event.
    Backoff,
    /// The listening socket itself is broken.
    Fatal,
}

fn classify(err: &io::Error) -> AcceptFault {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::TimedOut => return AcceptFault::Retry,
        _ => {}
    }
    match err.raw_os_error() {
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => AcceptFault::Backoff,
        Some(libc::EPROTO | libc::EPERM) => AcceptFault::Retry,
        _ => AcceptFault::Fatal,
    }
}

/// Stops a running acceptor from another thread.
pub(crate) struct AcceptorHandle {
    stop: Arc<AtomicBool>,
    waker: Waker,
}

impl AcceptorHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake acceptor");
        }
    }
}

pub(crate) struct Acceptor {
    poll: Poll,
    listener: TcpListener,
    group: Arc<LoopGroup>,
    open: Arc<AtomicUsize>,
    max_connections: usize,
    stop: Arc<AtomicBool>,
    next_id: u64,
}

impl Acceptor {
    pub fn new(
        listener: std::net::TcpListener,
        group: Arc<LoopGroup>,
        open: Arc<AtomicUsize>,
        max_connections: usize,
    ) -> io::Result<(Acceptor, AcceptorHandle)> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let stop = Arc::new(AtomicBool::new(false));

        let acceptor = Acceptor {
            poll,
            listener,
            group,
            open,
            max_connections,
            stop: Arc::clone(&stop),
            next_id: 0,
        };
        Ok((acceptor, AcceptorHandle { stop, waker }))
    }

    /// Accept until stopped. Returns an error only if the listening socket fails.
    pub fn run(mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(64);

        while !self.stop.load(Ordering::SeqCst) {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ServerError::AcceptorFatal(e)),
            }

            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    self.accept_ready()?;
                }
            }
        }

        info!(accepted = self.next_id, "Acceptor stopped");
        Ok(())
    }

    /// Drain the listen backlog.
    fn accept_ready(&mut self) -> Result<(), ServerError> {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            match self.listener.accept() {
                Ok((stream, peer)) => self.dispatch(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => match classify(&e) {
                    AcceptFault::Retry => debug!(error = %e, "Accept failed, continuing"),
                    AcceptFault::Backoff => {
                        warn!(error = %e, "Accept failed, waiting for next readiness");
                        return Ok(());
                    }
                    AcceptFault::Fatal => return Err(ServerError::AcceptorFatal(e)),
                },
            }
        }
    }

    fn dispatch(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.open.load(Ordering::SeqCst) >= self.max_connections {
            warn!(peer = %peer, limit = self.max_connections, "Connection limit reached");
            return;
        }

        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(conn = %id, error = %e, "Failed to set TCP_NODELAY");
        }

        match self.group.dispatch(id, stream, peer) {
            Ok(worker) => debug!(conn = %id, peer = %peer, worker, "Dispatched connection"),
            Err(e) => warn!(conn = %id, peer = %peer, error = %e, "Failed to dispatch connection"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_accept_errors() {
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(classify(&aborted), AcceptFault::Retry);

        let reset = io::Error::from_raw_os_error(libc::ECONNRESET);
        assert_eq!(classify(&reset), AcceptFault::Retry);

        let emfile = io::Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(classify(&emfile), AcceptFault::Backoff);

        let badf = io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(classify(&badf), AcceptFault::Fatal);

        let inval = io::Error::from_raw_os_error(libc::EINVAL);
        assert_eq!(classify(&inval), AcceptFault::Fatal);
    }
}

//! Event-loop runtime built on mio (epoll on Linux, kqueue on macOS).
//!
//! Two kinds of loop threads:
//! - `Acceptor`: one thread that owns the listening socket.
//! - `Worker`: N threads, each owning the connections assigned to it.
//!
//! The only state shared between threads is the round-robin counter in
//! `LoopGroup`, the open-connection counter and the `HaltSignal`.

mod acceptor;
mod connection;
mod group;
mod worker;

pub use connection::ConnectionId;
pub use group::SizePolicy;
pub use worker::WorkerReport;

pub(crate) use acceptor::{Acceptor, AcceptorHandle};
pub(crate) use group::LoopGroup;
pub(crate) use worker::WorkerSettings;

use std::sync::Arc;
use tokio::sync::watch;

/// Raised when shared infrastructure stops: the listening socket closed or
/// a loop thread failed.
#[derive(Clone)]
pub(crate) struct HaltSignal(Arc<watch::Sender<bool>>);

impl HaltSignal {
    pub fn new() -> (HaltSignal, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (HaltSignal(Arc::new(tx)), rx)
    }

    pub fn raise(&self) {
        self.0.send_replace(true);
    }
}

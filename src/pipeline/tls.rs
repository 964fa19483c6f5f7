//! TLS stage built on rustls' sans-I/O `ServerConnection`.
//!
//! Always the first stage. Ciphertext arrives from the socket, plaintext
//! leaves toward the stages behind; plaintext written by those stages is
//! encrypted before it reaches the socket.
//!
//! ```text
//! Handshaking --(handshake done)--> Established --(close)--> Closed
//!      |                                                       ^
//!      +----------------(handshake error)----------------------+
//! ```
//!
//! Plaintext written while handshaking is held until the session is
//! established. A handshake error sends whatever alert rustls queued and
//! fails the connection; no bytes reach the stages behind.

use super::{Context, Handler};
use crate::error::ConnectionError;
use bytes::{Bytes, BytesMut};
use rustls::{ServerConfig, ServerConnection};
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsState {
    Handshaking,
    Established,
    Closed,
}

pub struct TlsStage {
    session: ServerConnection,
    state: TlsState,
    /// Plaintext written before the handshake finished.
    pending: BytesMut,
}

impl TlsStage {
    pub fn new(config: Arc<ServerConfig>) -> Result<Self, ConnectionError> {
        let mut session = ServerConnection::new(config).map_err(ConnectionError::Tls)?;
        // Records are drained after every write, so rustls never holds much.
        session.set_buffer_limit(None);
        Ok(Self {
            session,
            state: TlsState::Handshaking,
            pending: BytesMut::new(),
        })
    }

    /// Move every queued TLS record toward the socket.
    fn flush_records(&mut self, ctx: &mut Context<'_>) -> Result<(), ConnectionError> {
        while self.session.wants_write() {
            let mut records = Vec::new();
            self.session.write_tls(&mut records)?;
            ctx.write(records.into());
        }
        Ok(())
    }

    fn fail(&mut self, ctx: &mut Context<'_>, err: rustls::Error) -> ConnectionError {
        // Best effort: rustls queues an alert describing the failure.
        let _ = self.flush_records(ctx);
        let was_handshaking = self.state == TlsState::Handshaking;
        self.state = TlsState::Closed;
        self.pending.clear();

        if was_handshaking {
            ConnectionError::Handshake(err)
        } else {
            ConnectionError::Tls(err)
        }
    }

    fn establish(&mut self, ctx: &mut Context<'_>) -> Result<(), ConnectionError> {
        self.state = TlsState::Established;
        debug!(
            conn = %ctx.connection_id(),
            version = ?self.session.protocol_version(),
            "TLS handshake complete"
        );
        if !self.pending.is_empty() {
            let held = self.pending.split().freeze();
            self.session.writer().write_all(&held)?;
        }
        Ok(())
    }
}

impl Handler for TlsStage {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn on_inbound(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<(), ConnectionError> {
        if self.state == TlsState::Closed {
            trace!(conn = %ctx.connection_id(), bytes = data.len(), "Dropping ciphertext after close");
            return Ok(());
        }

        let mut input: &[u8] = &data;
        while !input.is_empty() {
            self.session.read_tls(&mut input)?;

            let io_state = match self.session.process_new_packets() {
                Ok(io_state) => io_state,
                Err(e) => return Err(self.fail(ctx, e)),
            };

            if self.state == TlsState::Handshaking && !self.session.is_handshaking() {
                self.establish(ctx)?;
            }

            let available = io_state.plaintext_bytes_to_read();
            if available > 0 {
                let mut plain = vec![0u8; available];
                self.session.reader().read_exact(&mut plain)?;
                ctx.fire_read(plain.into());
            }

            if io_state.peer_has_closed() {
                debug!(conn = %ctx.connection_id(), "Peer sent close_notify");
                ctx.close();
            }
        }

        self.flush_records(ctx)
    }

    fn on_outbound(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<(), ConnectionError> {
        match self.state {
            TlsState::Handshaking => {
                self.pending.extend_from_slice(&data);
                Ok(())
            }
            TlsState::Established => {
                self.session.writer().write_all(&data)?;
                self.flush_records(ctx)
            }
            TlsState::Closed => {
                trace!(conn = %ctx.connection_id(), bytes = data.len(), "Dropping plaintext after close");
                Ok(())
            }
        }
    }

    fn on_close(&mut self, ctx: &mut Context<'_>) {
        if self.state == TlsState::Closed {
            return;
        }
        self.state = TlsState::Closed;
        self.pending.clear();
        self.session.send_close_notify();
        if let Err(e) = self.flush_records(ctx) {
            debug!(conn = %ctx.connection_id(), error = %e, "Failed to queue close_notify");
        }
    }

    fn on_error(&mut self, _ctx: &mut Context<'_>, _cause: &ConnectionError) {
        self.state = TlsState::Closed;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{EchoHandler, Pipeline};
    use crate::runtime::ConnectionId;
    use crate::tls::Identity;
    use rustls::pki_types::ServerName;
    use rustls::ClientConnection;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts inbound bytes that made it past the TLS stage.
    struct Counter(Arc<AtomicUsize>);

    impl Handler for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn on_inbound(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<(), ConnectionError> {
            self.0.fetch_add(data.len(), Ordering::SeqCst);
            ctx.fire_read(data);
            Ok(())
        }
    }

    struct Setup {
        client: ClientConnection,
        pipeline: Pipeline,
        reached: Arc<AtomicUsize>,
    }

    fn setup() -> Setup {
        let identity = Identity::generate(&["localhost".to_string()]).unwrap();
        let server_config = identity.server_config().unwrap();
        let client_config = identity.client_config().unwrap();

        let reached = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new(
            ConnectionId(1),
            vec![
                Box::new(TlsStage::new(server_config).unwrap()),
                Box::new(Counter(Arc::clone(&reached))),
                Box::new(EchoHandler),
            ],
        );
        let client =
            ClientConnection::new(client_config, ServerName::try_from("localhost").unwrap())
                .unwrap();

        Setup {
            client,
            pipeline,
            reached,
        }
    }

    /// Deliver server output to the client.
    fn deliver(client: &mut ClientConnection, mut wire: &[u8]) {
        while !wire.is_empty() {
            client.read_tls(&mut wire).unwrap();
            client.process_new_packets().unwrap();
        }
    }

    /// Shuttle records between client and pipeline until the client is quiet.
    fn pump(client: &mut ClientConnection, pipeline: &mut Pipeline) -> Result<(), ConnectionError> {
        loop {
            let mut wire = Vec::new();
            while client.wants_write() {
                client.write_tls(&mut wire).unwrap();
            }
            if wire.is_empty() {
                return Ok(());
            }
            let mut sink = BytesMut::new();
            pipeline.push_inbound(wire.into(), &mut sink)?;
            deliver(client, &sink);
        }
    }

    fn read_plaintext(client: &mut ClientConnection) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match client.reader().read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        out
    }

    #[test]
    fn test_echo_over_tls() {
        let Setup {
            mut client,
            mut pipeline,
            reached,
        } = setup();

        pump(&mut client, &mut pipeline).unwrap();
        assert!(!client.is_handshaking());

        client.writer().write_all(b"hello over tls").unwrap();
        pump(&mut client, &mut pipeline).unwrap();

        assert_eq!(read_plaintext(&mut client), b"hello over tls");
        assert_eq!(reached.load(Ordering::SeqCst), b"hello over tls".len());
    }

    #[test]
    fn test_handshake_failure_never_reaches_echo() {
        let Setup {
            mut pipeline,
            reached,
            ..
        } = setup();

        let mut sink = BytesMut::new();
        let err = pipeline
            .push_inbound(
                Bytes::from_static(b"GET / HTTP/1.1\r\nHost: example\r\n\r\n"),
                &mut sink,
            )
            .unwrap_err();

        assert!(err.is_handshake(), "unexpected error: {err}");
        assert_eq!(reached.load(Ordering::SeqCst), 0);

        // Later bytes are dropped, the stage stays closed.
        let mut sink = BytesMut::new();
        pipeline
            .push_inbound(Bytes::from_static(b"more"), &mut sink)
            .unwrap();
        assert!(sink.is_empty());
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_plaintext_held_until_established() {
        let Setup {
            mut client,
            mut pipeline,
            ..
        } = setup();

        let mut sink = BytesMut::new();
        pipeline
            .push_outbound(Bytes::from_static(b"early"), &mut sink)
            .unwrap();
        assert!(sink.is_empty());

        pump(&mut client, &mut pipeline).unwrap();
        assert_eq!(read_plaintext(&mut client), b"early");
    }

    #[test]
    fn test_close_sends_close_notify() {
        let Setup {
            mut client,
            mut pipeline,
            ..
        } = setup();
        pump(&mut client, &mut pipeline).unwrap();

        let mut sink = BytesMut::new();
        pipeline.close(&mut sink);
        assert!(!sink.is_empty());

        let mut wire: &[u8] = &sink;
        let mut closed = false;
        while !wire.is_empty() {
            client.read_tls(&mut wire).unwrap();
            closed |= client.process_new_packets().unwrap().peer_has_closed();
        }
        assert!(closed);
    }

    #[test]
    fn test_peer_close_notify_requests_close() {
        let Setup {
            mut client,
            mut pipeline,
            ..
        } = setup();
        pump(&mut client, &mut pipeline).unwrap();
        assert!(!pipeline.close_requested());

        client.send_close_notify();
        pump(&mut client, &mut pipeline).unwrap();
        assert!(pipeline.close_requested());
    }
}

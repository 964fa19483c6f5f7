//! Connection state machine.
//!
//! A connection is one accepted socket, its pipeline and the bytes waiting
//! to be written back. Exactly one worker owns it for its whole life.

use crate::error::ConnectionError;
use crate::pipeline::Pipeline;
use bytes::{Buf, Bytes, BytesMut};
use mio::net::TcpStream;
use mio::Interest;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

/// Server-wide connection identifier, assigned by the acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Reading and echoing.
    Open,
    /// No more reads; draining outbound bytes before the socket closes.
    Closing,
    /// Released by its worker.
    Closed,
}

/// Result of one non-blocking read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were read and fed to the pipeline.
    Data(usize),
    /// Nothing available right now.
    WouldBlock,
    /// The peer closed its write side.
    Eof,
}

/// A single client connection.
pub struct Connection {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub stream: TcpStream,
    pub pipeline: Pipeline,
    pub state: ConnState,
    /// Bytes produced by the pipeline, not yet accepted by the socket.
    outbound: BytesMut,
    /// Interest currently registered with the poller.
    pub interest: Interest,
    /// Reading stopped at the write high watermark with input possibly
    /// left in the socket. No readiness edge will report that input again.
    pub read_paused: bool,
}

impl Connection {
    /// Create a new connection in the open state.
    pub fn new(id: ConnectionId, peer: SocketAddr, stream: TcpStream, pipeline: Pipeline) -> Self {
        Self {
            id,
            peer,
            stream,
            pipeline,
            state: ConnState::Open,
            outbound: BytesMut::new(),
            interest: Interest::READABLE,
            read_paused: false,
        }
    }

    /// Bytes still waiting to be written.
    pub fn pending(&self) -> usize {
        self.outbound.len()
    }

    /// Read once from the socket and push the bytes through the pipeline.
    pub fn read_into_pipeline(&mut self, scratch: &mut [u8]) -> Result<ReadOutcome, ConnectionError> {
        let n = loop {
            match self.stream.read(scratch) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::WouldBlock)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };

        self.pipeline
            .push_inbound(Bytes::copy_from_slice(&scratch[..n]), &mut self.outbound)?;
        Ok(ReadOutcome::Data(n))
    }

    /// Write as much pending output as the socket accepts.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                Ok(n) => self.outbound.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Stop reading and run every stage's close hook, front to back.
    pub fn begin_close(&mut self) {
        if self.state != ConnState::Open {
            return;
        }
        self.state = ConnState::Closing;
        self.pipeline.close(&mut self.outbound);
    }

    /// Tell every stage the connection failed. Socket-bound output survives.
    pub fn fail(&mut self, cause: &ConnectionError) {
        self.state = ConnState::Closing;
        self.pipeline.fail(cause, &mut self.outbound);
    }

    /// Mark the connection closed; the caller drops it afterwards.
    pub fn close(&mut self) {
        self.state = ConnState::Closed;
    }

    /// Whether the connection is done and can be released.
    pub fn is_finished(&self) -> bool {
        self.state == ConnState::Closing && self.outbound.is_empty()
    }

    /// Readiness interest for the current state.
    ///
    /// An open connection stops reading once `high_watermark` bytes are
    /// waiting to be written.
    pub fn desired_interest(&self, high_watermark: usize) -> Interest {
        match self.state {
            ConnState::Open if self.outbound.is_empty() => Interest::READABLE,
            ConnState::Open if self.outbound.len() >= high_watermark => Interest::WRITABLE,
            ConnState::Open => Interest::READABLE | Interest::WRITABLE,
            ConnState::Closing | ConnState::Closed => Interest::WRITABLE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineFactory;
    use std::time::Duration;

    /// A connected (server-side mio stream, client-side std stream) pair.
    fn socket_pair() -> (TcpStream, SocketAddr, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), peer, client)
    }

    fn open_connection() -> (Connection, std::net::TcpStream) {
        let (stream, peer, client) = socket_pair();
        let pipeline = PipelineFactory::new(None, false)
            .build(ConnectionId(1))
            .unwrap();
        (Connection::new(ConnectionId(1), peer, stream, pipeline), client)
    }

    /// Read until the socket is readable, retrying briefly on WouldBlock.
    fn read_until_data(conn: &mut Connection, scratch: &mut [u8]) -> ReadOutcome {
        for _ in 0..200 {
            match conn.read_into_pipeline(scratch).unwrap() {
                ReadOutcome::WouldBlock => std::thread::sleep(Duration::from_millis(5)),
                other => return other,
            }
        }
        ReadOutcome::WouldBlock
    }

    #[test]
    fn test_connection_state_transitions() {
        let (mut conn, _client) = open_connection();
        assert_eq!(conn.state, ConnState::Open);
        assert_eq!(conn.desired_interest(1024), Interest::READABLE);

        conn.begin_close();
        assert_eq!(conn.state, ConnState::Closing);
        assert!(conn.is_finished());

        // Closing twice has no further effect.
        conn.begin_close();
        assert_eq!(conn.state, ConnState::Closing);

        conn.close();
        assert_eq!(conn.state, ConnState::Closed);
    }

    #[test]
    fn test_read_echo_flush() {
        let (mut conn, mut client) = open_connection();
        let mut scratch = [0u8; 64];

        std::io::Write::write_all(&mut client, b"hello").unwrap();
        assert_eq!(read_until_data(&mut conn, &mut scratch), ReadOutcome::Data(5));
        assert_eq!(conn.pending(), 5);
        assert_eq!(
            conn.desired_interest(1024),
            Interest::READABLE | Interest::WRITABLE
        );
        assert_eq!(conn.desired_interest(4), Interest::WRITABLE);

        conn.flush().unwrap();
        assert_eq!(conn.pending(), 0);

        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"hello");
    }

    #[test]
    fn test_eof_detected() {
        let (mut conn, client) = open_connection();
        drop(client);
        let mut scratch = [0u8; 64];
        assert_eq!(read_until_data(&mut conn, &mut scratch), ReadOutcome::Eof);
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(42).to_string(), "#42");
    }
}

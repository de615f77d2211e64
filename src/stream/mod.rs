//! MySQL stream layer: per half-flow packet framing, payload dispatch, and
//! the replay handlers driven by reassembled capture traffic.

mod assembler;
mod handler;
mod replay;

pub use assembler::{FactoryOptions, MySQLStreamConn, MySQLStreamFactory};
pub use handler::{trace_handler_factory, HandlerFactory, RejectHandler, StreamHandler, TraceHandler};
pub use replay::ReplayOptions;

use std::fmt;
use std::net::SocketAddr;
use std::time::SystemTime;

use bytes::Bytes;

/// Direction of data flow within a connection. Client→server is the
/// orientation of the first segment observed for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToServer => "client->server",
            Direction::ServerToClient => "server->client",
        }
    }
}

/// Four-tuple identity of a directed flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl ConnKey {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        Self { src, dst }
    }

    pub fn src_addr(&self) -> String {
        self.src.to_string()
    }

    pub fn dst_addr(&self) -> String {
        self.dst.to_string()
    }

    /// The same connection seen from the other end.
    pub fn reverse(&self) -> ConnKey {
        ConnKey {
            src: self.dst,
            dst: self.src,
        }
    }
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.src_addr(), self.dst_addr())
    }
}

/// An ordered batch of fully-framed MySQL packets emitted by one
/// reassembler callback cycle.
#[derive(Debug, Clone)]
pub struct MySQLPayload {
    /// Capture timestamp of the last contributing frame.
    pub ts: SystemTime,
    pub key: ConnKey,
    pub dir: Direction,
    /// Sequence byte of the first wire packet, or -1 when this emission
    /// resumed a partial packet and must not be treated as a command start.
    pub start_seq: i32,
    pub packets: Vec<Bytes>,
}

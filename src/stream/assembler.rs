use std::sync::Arc;
use std::time::SystemTime;

use bytes::BytesMut;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use crate::capture::TcpSegment;
use crate::protocol::{peek_packet_len, peek_seq, read_packet};
use crate::stats;

use super::handler::HandlerFactory;
use super::{ConnKey, Direction, MySQLPayload, StreamHandler};

#[derive(Debug, Clone, Copy, Default)]
pub struct FactoryOptions {
    /// Per-connection payload queue capacity. Zero keeps the queue as
    /// tight as the channel allows, serializing the executor with the
    /// assembler; larger values trade memory for ingestion smoothness.
    pub conn_cache_size: usize,
}

/// Creates the per-connection handler, dispatch queue, and half-flow
/// assemblers when the reassembler sees a new flow.
pub struct MySQLStreamFactory {
    new_handler: HandlerFactory,
    opts: FactoryOptions,
}

impl MySQLStreamFactory {
    pub fn new(new_handler: HandlerFactory, opts: FactoryOptions) -> Self {
        Self { new_handler, opts }
    }

    /// Open the stream machinery for one connection and spawn its
    /// dispatch task. Must run inside a tokio runtime.
    pub fn open(&self, key: ConnKey) -> MySQLStreamConn {
        let handler = (self.new_handler)(key);
        let (tx, mut rx) = mpsc::channel::<MySQLPayload>(self.opts.conn_cache_size.max(1));
        let (done_tx, done_rx) = oneshot::channel();

        let consumer = handler.clone();
        tokio::spawn(async move {
            while let Some(p) = rx.recv().await {
                consumer.on_payload(p).await;
            }
            let _ = done_tx.send(());
        });

        MySQLStreamConn {
            handler,
            upstream: MySQLStream::new(key, Direction::ClientToServer, tx.clone()),
            downstream: MySQLStream::new(key, Direction::ServerToClient, tx),
            done: Some(done_rx),
        }
    }
}

/// Per-connection stream state: the shared handler, one framing
/// assembler per direction, and the completion signal of the dispatch
/// task.
pub struct MySQLStreamConn {
    handler: Arc<dyn StreamHandler>,
    upstream: MySQLStream,
    downstream: MySQLStream,
    done: Option<oneshot::Receiver<()>>,
}

impl MySQLStreamConn {
    /// Ask the handler whether this flow should be buffered.
    pub fn accept(&self, tcp: &TcpSegment, dir: Direction, next_seq: u32) -> bool {
        self.handler.accept(tcp, dir, next_seq)
    }

    /// Feed a contiguous byte run for one direction. Suspends when the
    /// dispatch queue is full.
    pub async fn reassembled(&mut self, dir: Direction, data: &[u8], ts: SystemTime) {
        match dir {
            Direction::ClientToServer => self.upstream.reassembled(data, ts).await,
            Direction::ServerToClient => self.downstream.reassembled(data, ts).await,
        }
    }

    /// Close the payload queue, wait for the dispatch task to drain it,
    /// then invoke `on_close`.
    pub async fn complete(mut self) {
        self.upstream.close();
        self.downstream.close();
        if let Some(done) = self.done.take() {
            let _ = done.await;
        }
        self.handler.on_close().await;
    }
}

/// Framing state for one directional half-flow: a carry buffer holding
/// strictly less than one complete wire packet, and the cached sequence
/// byte of the packet it starts with.
struct MySQLStream {
    key: ConnKey,
    dir: Direction,
    carry: BytesMut,
    /// Sequence byte of the first buffered packet; -1 when unknown.
    cached_seq: i32,
    /// False while the carry buffer resumes a packet left over from a
    /// previous emission; such emissions never report a command start.
    at_boundary: bool,
    tx: Option<mpsc::Sender<MySQLPayload>>,
}

impl MySQLStream {
    fn new(key: ConnKey, dir: Direction, tx: mpsc::Sender<MySQLPayload>) -> Self {
        stats::add(stats::STREAMS, 1);
        Self {
            key,
            dir,
            carry: BytesMut::new(),
            cached_seq: -1,
            at_boundary: true,
            tx: Some(tx),
        }
    }

    async fn reassembled(&mut self, data: &[u8], ts: SystemTime) {
        if data.is_empty() {
            return;
        }
        let Some(tx) = self.tx.clone() else { return };

        self.carry.extend_from_slice(data);
        if self.at_boundary && self.cached_seq < 0 {
            if let Some(seq) = peek_seq(&self.carry) {
                self.cached_seq = seq as i32;
            }
        }

        let mut packets = Vec::new();
        loop {
            // Consume only when every chunk of the logical packet is
            // buffered; a partial tail carries over to the next callback.
            let Some(total) = peek_packet_len(&self.carry) else {
                break;
            };
            // The only failure left is a continuation sequence mismatch,
            // which consumes the first chunk, so the loop always makes
            // progress and resumes on the remainder.
            match read_packet(&mut self.carry) {
                Ok(body) => packets.push(body),
                Err(e) => {
                    error!(
                        conn = %self.key,
                        dir = self.dir.as_str(),
                        total,
                        rest = self.carry.len(),
                        error = %e,
                        "read mysql packet"
                    );
                }
            }
        }

        if packets.is_empty() {
            // Partial frame: keep the carry buffer and cached sequence id.
            return;
        }

        let payload = MySQLPayload {
            ts,
            key: self.key,
            dir: self.dir,
            start_seq: self.cached_seq,
            packets,
        };
        self.cached_seq = -1;
        self.at_boundary = self.carry.is_empty();

        if tx.send(payload).await.is_err() {
            warn!(conn = %self.key, dir = self.dir.as_str(), "payload queue closed");
            return;
        }
        stats::add(stats::PACKETS, 1);
    }

    fn close(&mut self) {
        if self.tx.take().is_some() {
            stats::add(stats::STREAMS, -1);
        }
    }
}

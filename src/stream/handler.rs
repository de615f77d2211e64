use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::capture::TcpSegment;

use super::{ConnKey, Direction, MySQLPayload};

/// Per-connection consumer of reassembled MySQL traffic.
///
/// `accept` is consulted by the reassembler for every segment and may
/// refuse the flow; `on_payload` receives framed payload batches in
/// arrival order from the dispatch task; `on_close` runs exactly once
/// after the queue has drained.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    fn accept(&self, tcp: &TcpSegment, dir: Direction, next_seq: u32) -> bool;

    async fn on_payload(&self, p: MySQLPayload);

    async fn on_close(&self);
}

/// Constructor invoked once per connection.
pub type HandlerFactory = Arc<dyn Fn(ConnKey) -> Arc<dyn StreamHandler> + Send + Sync>;

/// Accepts everything and logs payloads as hex. Used when no replay
/// target is configured.
pub struct TraceHandler {
    key: ConnKey,
}

impl TraceHandler {
    pub fn new(key: ConnKey) -> Self {
        info!(conn = %key, "open");
        Self { key }
    }
}

#[async_trait]
impl StreamHandler for TraceHandler {
    fn accept(&self, _tcp: &TcpSegment, _dir: Direction, _next_seq: u32) -> bool {
        true
    }

    async fn on_payload(&self, p: MySQLPayload) {
        let pkts: Vec<String> = p.packets.iter().map(hex::encode).collect();
        info!(
            conn = %self.key,
            t = ?p.ts,
            dir = p.dir.as_str(),
            start_seq = p.start_seq,
            pkts = ?pkts,
            "send"
        );
    }

    async fn on_close(&self) {
        info!(conn = %self.key, "close");
    }
}

/// Handler factory producing [`TraceHandler`]s.
pub fn trace_handler_factory() -> HandlerFactory {
    Arc::new(|key| Arc::new(TraceHandler::new(key)))
}

/// Refuses the flow; the reassembler buffers nothing for it.
pub struct RejectHandler;

#[async_trait]
impl StreamHandler for RejectHandler {
    fn accept(&self, _tcp: &TcpSegment, _dir: Direction, _next_seq: u32) -> bool {
        false
    }

    async fn on_payload(&self, _p: MySQLPayload) {}

    async fn on_close(&self) {}
}

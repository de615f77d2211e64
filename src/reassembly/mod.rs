//! TCP reassembly driving the MySQL stream layer.
//!
//! One flow entry per connection, keyed by the orientation of the first
//! segment observed (lookups try the reverse key before creating a new
//! entry). Contiguous byte runs are forwarded to the per half-flow stream
//! assemblers; the handler's `accept` gates buffering per segment.

mod buffer;

pub use buffer::SeqBuffer;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::SystemTime;

use tracing::debug;

use crate::capture::CapturedPacket;
use crate::stream::{ConnKey, Direction, MySQLStreamConn, MySQLStreamFactory};

struct Flow {
    conn: MySQLStreamConn,
    up: SeqBuffer,
    down: SeqBuffer,
    last_seen: SystemTime,
}

impl Flow {
    fn buffer(&mut self, dir: Direction) -> &mut SeqBuffer {
        match dir {
            Direction::ClientToServer => &mut self.up,
            Direction::ServerToClient => &mut self.down,
        }
    }

    /// Connection teardown observed: both directions closed, or a reset.
    fn terminated(&self) -> bool {
        self.up.rst || self.down.rst || (self.up.fin && self.down.fin)
    }
}

pub struct Assembler {
    factory: MySQLStreamFactory,
    flows: HashMap<ConnKey, Flow>,
}

impl Assembler {
    pub fn new(factory: MySQLStreamFactory) -> Self {
        Self {
            factory,
            flows: HashMap::new(),
        }
    }

    /// Feed one captured segment. Creates the flow on first sight,
    /// forwards any newly contiguous bytes, and completes the flow when
    /// the connection tears down.
    pub async fn assemble(&mut self, pkt: CapturedPacket) {
        let key = ConnKey::new(
            SocketAddr::new(pkt.src_ip, pkt.tcp.src_port),
            SocketAddr::new(pkt.dst_ip, pkt.tcp.dst_port),
        );

        let (canon, dir) = if self.flows.contains_key(&key) {
            (key, Direction::ClientToServer)
        } else if self.flows.contains_key(&key.reverse()) {
            (key.reverse(), Direction::ServerToClient)
        } else {
            debug!(conn = %key, "new flow");
            self.flows.insert(
                key,
                Flow {
                    conn: self.factory.open(key),
                    up: SeqBuffer::new(),
                    down: SeqBuffer::new(),
                    last_seen: pkt.ts,
                },
            );
            (key, Direction::ClientToServer)
        };

        let flow = match self.flows.get_mut(&canon) {
            Some(flow) => flow,
            None => return,
        };
        flow.last_seen = pkt.ts;

        let next_seq = flow.buffer(dir).expected_seq();
        if !flow.conn.accept(&pkt.tcp, dir, next_seq) {
            return;
        }

        let buf = flow.buffer(dir);
        if pkt.tcp.syn {
            buf.set_initial_seq(pkt.tcp.seq);
        }
        buf.add_segment(pkt.tcp.seq, &pkt.tcp.payload);
        if pkt.tcp.fin {
            buf.fin = true;
        }
        if pkt.tcp.rst {
            buf.rst = true;
        }

        let run = buf.take_ready();
        if !run.is_empty() {
            flow.conn.reassembled(dir, &run, pkt.ts).await;
        }

        if flow.terminated() {
            self.close_flow(canon).await;
        }
    }

    /// Evict flows whose last capture timestamp is older than `deadline`.
    pub async fn flush_close_older_than(&mut self, deadline: SystemTime) {
        let stale: Vec<ConnKey> = self
            .flows
            .iter()
            .filter(|(_, flow)| flow.last_seen < deadline)
            .map(|(key, _)| *key)
            .collect();
        for key in stale {
            debug!(conn = %key, "flush idle flow");
            self.close_flow(key).await;
        }
    }

    /// Complete every live flow. Called once the capture source is
    /// exhausted.
    pub async fn flush_all(&mut self) {
        let keys: Vec<ConnKey> = self.flows.keys().copied().collect();
        for key in keys {
            self.close_flow(key).await;
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    async fn close_flow(&mut self, key: ConnKey) {
        let Some(mut flow) = self.flows.remove(&key) else {
            return;
        };
        // Hand over whatever is still contiguous before closing.
        let ts = flow.last_seen;
        for dir in [Direction::ClientToServer, Direction::ServerToClient] {
            let run = flow.buffer(dir).take_ready();
            if !run.is_empty() {
                flow.conn.reassembled(dir, &run, ts).await;
            }
        }
        flow.conn.complete().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::TcpSegment;
    use crate::stream::{
        FactoryOptions, MySQLPayload, RejectHandler, StreamHandler,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::net::IpAddr;
    use std::sync::Arc;
    use std::time::{Duration, UNIX_EPOCH};

    struct RecordingHandler {
        payloads: Mutex<Vec<MySQLPayload>>,
        closed: Mutex<u32>,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                payloads: Mutex::new(Vec::new()),
                closed: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl StreamHandler for RecordingHandler {
        fn accept(&self, _tcp: &TcpSegment, _dir: Direction, _next_seq: u32) -> bool {
            true
        }

        async fn on_payload(&self, p: MySQLPayload) {
            self.payloads.lock().push(p);
        }

        async fn on_close(&self) {
            *self.closed.lock() += 1;
        }
    }

    fn assembler_with(handler: Arc<RecordingHandler>) -> Assembler {
        let factory = MySQLStreamFactory::new(
            Arc::new(move |_| handler.clone() as Arc<dyn StreamHandler>),
            FactoryOptions::default(),
        );
        Assembler::new(factory)
    }

    fn client_ip() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    fn server_ip() -> IpAddr {
        "10.0.0.2".parse().unwrap()
    }

    fn client_pkt(seq: u32, payload: &[u8]) -> CapturedPacket {
        CapturedPacket {
            ts: UNIX_EPOCH + Duration::from_secs(1),
            src_ip: client_ip(),
            dst_ip: server_ip(),
            tcp: TcpSegment {
                src_port: 50000,
                dst_port: 4000,
                seq,
                syn: false,
                fin: false,
                rst: false,
                payload: payload.to_vec(),
            },
        }
    }

    fn server_pkt(seq: u32, payload: &[u8]) -> CapturedPacket {
        CapturedPacket {
            ts: UNIX_EPOCH + Duration::from_secs(1),
            src_ip: server_ip(),
            dst_ip: client_ip(),
            tcp: TcpSegment {
                src_port: 4000,
                dst_port: 50000,
                seq,
                syn: false,
                fin: false,
                rst: false,
                payload: payload.to_vec(),
            },
        }
    }

    fn wire(seq: u8, body: &[u8]) -> Vec<u8> {
        let len = body.len();
        let mut out = vec![
            (len & 0xFF) as u8,
            ((len >> 8) & 0xFF) as u8,
            ((len >> 16) & 0xFF) as u8,
            seq,
        ];
        out.extend_from_slice(body);
        out
    }

    #[tokio::test]
    async fn test_flow_lifecycle() {
        let handler = RecordingHandler::new();
        let mut asm = assembler_with(handler.clone());

        let mut syn = client_pkt(999, b"");
        syn.tcp.syn = true;
        asm.assemble(syn).await;
        assert_eq!(asm.len(), 1);

        asm.assemble(client_pkt(1000, &wire(0, b"\x03SEL1"))).await;
        asm.flush_all().await;

        assert!(asm.is_empty());
        let payloads = handler.payloads.lock();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].dir, Direction::ClientToServer);
        assert_eq!(payloads[0].key.to_string(), "10.0.0.1:50000->10.0.0.2:4000");
        assert_eq!(*handler.closed.lock(), 1);
    }

    #[tokio::test]
    async fn test_direction_by_first_seen_orientation() {
        let handler = RecordingHandler::new();
        let mut asm = assembler_with(handler.clone());

        asm.assemble(client_pkt(1, &wire(0, b"\x03SEL1"))).await;
        asm.assemble(server_pkt(1, &wire(1, b"\x00"))).await;
        asm.flush_all().await;

        let payloads = handler.payloads.lock();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0].dir, Direction::ClientToServer);
        assert_eq!(payloads[1].dir, Direction::ServerToClient);
        // Both directions share the connection identity.
        assert_eq!(payloads[1].key, payloads[0].key);
    }

    #[tokio::test]
    async fn test_out_of_order_segments_reframed() {
        let handler = RecordingHandler::new();
        let mut asm = assembler_with(handler.clone());

        let mut syn = client_pkt(999, b"");
        syn.tcp.syn = true;
        asm.assemble(syn).await;

        let bytes = wire(0, b"\x03SELECT 1");
        let (a, b) = bytes.split_at(5);
        // Second half arrives first and is parked until the gap fills.
        asm.assemble(client_pkt(1005, b)).await;
        assert!(handler.payloads.lock().is_empty());
        asm.assemble(client_pkt(1000, a)).await;
        asm.flush_all().await;

        let payloads = handler.payloads.lock();
        assert_eq!(payloads.len(), 1);
        assert_eq!(&payloads[0].packets[0][..], b"\x03SELECT 1");
    }

    #[tokio::test]
    async fn test_fin_both_ways_completes() {
        let handler = RecordingHandler::new();
        let mut asm = assembler_with(handler.clone());

        asm.assemble(client_pkt(1, &wire(0, b"\x0e"))).await;
        let mut fin1 = client_pkt(6, b"");
        fin1.tcp.fin = true;
        asm.assemble(fin1).await;
        assert_eq!(asm.len(), 1);

        let mut fin2 = server_pkt(1, b"");
        fin2.tcp.fin = true;
        asm.assemble(fin2).await;

        assert!(asm.is_empty());
        assert_eq!(*handler.closed.lock(), 1);
    }

    #[tokio::test]
    async fn test_rst_completes() {
        let handler = RecordingHandler::new();
        let mut asm = assembler_with(handler.clone());

        asm.assemble(client_pkt(1, &wire(0, b"\x0e"))).await;
        let mut rst = client_pkt(6, b"");
        rst.tcp.rst = true;
        asm.assemble(rst).await;

        assert!(asm.is_empty());
        assert_eq!(*handler.closed.lock(), 1);
    }

    #[tokio::test]
    async fn test_idle_flush() {
        let handler = RecordingHandler::new();
        let mut asm = assembler_with(handler.clone());

        asm.assemble(client_pkt(1, &wire(0, b"\x0e"))).await;
        // Deadline before the packet timestamp: nothing evicted.
        asm.flush_close_older_than(UNIX_EPOCH).await;
        assert_eq!(asm.len(), 1);
        // Deadline after: evicted and closed.
        asm.flush_close_older_than(UNIX_EPOCH + Duration::from_secs(120))
            .await;
        assert!(asm.is_empty());
        assert_eq!(*handler.closed.lock(), 1);
    }

    #[tokio::test]
    async fn test_counters_return_to_baseline() {
        use crate::stats;
        use crate::stream::ReplayOptions;

        // Dry-run off with a parseable DSN: the pool is created lazily,
        // so no server is contacted until a query executes.
        let opts = ReplayOptions {
            target_dsn: "mysql://root@127.0.0.1:3306/test".to_string(),
            filter_in: "^never matches".to_string(),
            ..Default::default()
        };
        let factory = MySQLStreamFactory::new(opts.handler_factory(), FactoryOptions::default());
        let mut asm = Assembler::new(factory);

        let streams_before = stats::get(stats::STREAMS);
        let conns_before = stats::get(stats::CONNECTIONS);

        // First connection tears down via FIN from both sides.
        let mut syn = client_pkt(999, b"");
        syn.tcp.syn = true;
        asm.assemble(syn).await;
        asm.assemble(client_pkt(1000, &wire(0, b"\x03SELECT 1"))).await;
        let mut fin1 = client_pkt(1013, b"");
        fin1.tcp.fin = true;
        asm.assemble(fin1).await;
        let mut fin2 = server_pkt(1, b"");
        fin2.tcp.fin = true;
        asm.assemble(fin2).await;

        // Second connection stays open until the final flush.
        let mut other = client_pkt(1, &wire(0, b"\x0e"));
        other.tcp.src_port = 50001;
        asm.assemble(other).await;
        assert_eq!(asm.len(), 1);

        asm.flush_all().await;
        assert!(asm.is_empty());

        assert_eq!(stats::get(stats::STREAMS), streams_before);
        assert_eq!(stats::get(stats::CONNECTIONS), conns_before);
    }

    #[tokio::test]
    async fn test_rejected_flow_buffers_nothing() {
        let factory = MySQLStreamFactory::new(
            Arc::new(|_| Arc::new(RejectHandler) as Arc<dyn StreamHandler>),
            FactoryOptions::default(),
        );
        let mut asm = Assembler::new(factory);

        asm.assemble(client_pkt(1, &wire(0, b"\x03SEL1"))).await;
        asm.flush_all().await;
        assert!(asm.is_empty());
    }
}

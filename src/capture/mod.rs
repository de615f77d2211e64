//! Capture-file ingestion: pcap/pcapng reading and TCP packet decode.

mod reader;

pub use reader::CaptureFile;

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::SystemTime;

/// TCP header fields and payload carried by a captured frame.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: Vec<u8>,
}

/// One admitted frame: capture timestamp, addressing, and its TCP segment.
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub ts: SystemTime,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub tcp: TcpSegment,
}

/// Destination-port inclusion filter.
#[derive(Debug, Clone)]
pub struct PortFilter {
    ports: HashSet<u16>,
}

impl PortFilter {
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            ports: ports.into_iter().collect(),
        }
    }

    /// A packet is admitted iff its TCP destination port is in the set.
    pub fn admits(&self, pkt: &CapturedPacket) -> bool {
        self.ports.contains(&pkt.tcp.dst_port)
    }
}

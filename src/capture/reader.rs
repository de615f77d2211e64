use std::fs::File;
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use etherparse::{
    EtherType, Ethernet2HeaderSlice, IpNumber, Ipv4HeaderSlice, Ipv6HeaderSlice, TcpHeaderSlice,
};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError, PcapNGReader};
use tracing::debug;

use super::{CapturedPacket, TcpSegment};

/// Buffer size for reading capture files (64KB).
const BUFFER_SIZE: usize = 65536;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid capture format: {reason}")]
    InvalidFormat { reason: String },
}

enum ReaderInner {
    Legacy(LegacyPcapReader<File>),
    Ng(PcapNGReader<File>),
}

/// Sequential reader over one pcap or pcapng file, yielding only frames
/// that decode as IPv4/IPv6 + TCP.
pub struct CaptureFile {
    inner: ReaderInner,
}

impl CaptureFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|source| CaptureError::Open {
            path: path.display().to_string(),
            source,
        })?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)
            .map_err(|_| CaptureError::InvalidFormat {
                reason: "file too short to read magic number".to_string(),
            })?;
        let file = File::open(path).map_err(|source| CaptureError::Open {
            path: path.display().to_string(),
            source,
        })?;

        let inner = match &magic {
            [0xd4, 0xc3, 0xb2, 0xa1]
            | [0xa1, 0xb2, 0xc3, 0xd4]
            | [0x4d, 0x3c, 0xb2, 0xa1]
            | [0xa1, 0xb2, 0x3c, 0x4d] => ReaderInner::Legacy(
                LegacyPcapReader::new(BUFFER_SIZE, file).map_err(|e| {
                    CaptureError::InvalidFormat {
                        reason: format!("pcap header: {e}"),
                    }
                })?,
            ),
            [0x0a, 0x0d, 0x0d, 0x0a] => {
                ReaderInner::Ng(PcapNGReader::new(BUFFER_SIZE, file).map_err(|e| {
                    CaptureError::InvalidFormat {
                        reason: format!("pcapng header: {e}"),
                    }
                })?)
            }
            _ => {
                return Err(CaptureError::InvalidFormat {
                    reason: format!("unknown magic number: {magic:02x?}"),
                })
            }
        };

        Ok(Self { inner })
    }

    /// Next decodable TCP packet, or None at end of file. Frames that are
    /// not Ethernet + IP + TCP are skipped.
    pub fn next_packet(&mut self) -> Result<Option<CapturedPacket>, CaptureError> {
        if matches!(self.inner, ReaderInner::Legacy(_)) {
            self.next_legacy()
        } else {
            self.next_ng()
        }
    }

    fn next_legacy(&mut self) -> Result<Option<CapturedPacket>, CaptureError> {
        let reader = match &mut self.inner {
            ReaderInner::Legacy(r) => r,
            ReaderInner::Ng(_) => unreachable!(),
        };
        loop {
            match reader.next() {
                Ok((offset, block)) => {
                    let decoded = match block {
                        PcapBlockOwned::Legacy(packet) => {
                            let ts = UNIX_EPOCH
                                + Duration::new(packet.ts_sec as u64, packet.ts_usec * 1_000);
                            decode_frame(ts, packet.data)
                        }
                        _ => None,
                    };
                    reader.consume(offset);
                    if decoded.is_some() {
                        return Ok(decoded);
                    }
                }
                Err(PcapError::Eof) => return Ok(None),
                Err(PcapError::Incomplete(_)) => {
                    reader.refill().map_err(|e| CaptureError::InvalidFormat {
                        reason: format!("refill: {e}"),
                    })?;
                }
                Err(e) => {
                    return Err(CaptureError::InvalidFormat {
                        reason: format!("parse: {e}"),
                    })
                }
            }
        }
    }

    fn next_ng(&mut self) -> Result<Option<CapturedPacket>, CaptureError> {
        let reader = match &mut self.inner {
            ReaderInner::Ng(r) => r,
            ReaderInner::Legacy(_) => unreachable!(),
        };
        loop {
            match reader.next() {
                Ok((offset, block)) => {
                    let decoded = match block {
                        PcapBlockOwned::NG(pcap_parser::pcapng::Block::EnhancedPacket(epb)) => {
                            // Interface time units default to microseconds.
                            let micros = ((epb.ts_high as u64) << 32) | epb.ts_low as u64;
                            let ts = UNIX_EPOCH + Duration::from_micros(micros);
                            decode_frame(ts, epb.data)
                        }
                        PcapBlockOwned::NG(pcap_parser::pcapng::Block::SimplePacket(spb)) => {
                            decode_frame(UNIX_EPOCH, spb.data)
                        }
                        _ => None,
                    };
                    reader.consume(offset);
                    if decoded.is_some() {
                        return Ok(decoded);
                    }
                }
                Err(PcapError::Eof) => return Ok(None),
                Err(PcapError::Incomplete(_)) => {
                    reader.refill().map_err(|e| CaptureError::InvalidFormat {
                        reason: format!("refill: {e}"),
                    })?;
                }
                Err(e) => {
                    return Err(CaptureError::InvalidFormat {
                        reason: format!("parse: {e}"),
                    })
                }
            }
        }
    }
}

/// Decode Ethernet → IPv4/IPv6 → TCP. Returns None for anything else
/// (ARP, UDP, truncated frames, ...).
fn decode_frame(ts: SystemTime, data: &[u8]) -> Option<CapturedPacket> {
    let eth = Ethernet2HeaderSlice::from_slice(data).ok()?;
    let ip_data = &data[eth.slice().len()..];

    let ether_type = eth.ether_type();
    let (src_ip, dst_ip, tcp_data): (IpAddr, IpAddr, &[u8]) = if ether_type == EtherType::IPV4 {
        let ip = Ipv4HeaderSlice::from_slice(ip_data).ok()?;
        if ip.protocol() != IpNumber::TCP {
            return None;
        }
        let header_len = ip.slice().len();
        // Trim link-layer padding past the IP total length.
        let end = (ip.total_len() as usize).min(ip_data.len());
        if end < header_len {
            return None;
        }
        (
            ip.source_addr().into(),
            ip.destination_addr().into(),
            &ip_data[header_len..end],
        )
    } else if ether_type == EtherType::IPV6 {
        let ip = Ipv6HeaderSlice::from_slice(ip_data).ok()?;
        // Extension header chains are rare on database traffic; skip them.
        if ip.next_header() != IpNumber::TCP {
            return None;
        }
        let header_len = ip.slice().len();
        let end = (header_len + ip.payload_length() as usize).min(ip_data.len());
        (
            ip.source_addr().into(),
            ip.destination_addr().into(),
            &ip_data[header_len..end],
        )
    } else {
        debug!(ether_type = ?ether_type, "skip non-IP frame");
        return None;
    };

    let tcp = TcpHeaderSlice::from_slice(tcp_data).ok()?;
    let payload = tcp_data[tcp.slice().len()..].to_vec();

    Some(CapturedPacket {
        ts,
        src_ip,
        dst_ip,
        tcp: TcpSegment {
            src_port: tcp.source_port(),
            dst_port: tcp.destination_port(),
            seq: tcp.sequence_number(),
            syn: tcp.syn(),
            fin: tcp.fin(),
            rst: tcp.rst(),
            payload,
        },
    })
}

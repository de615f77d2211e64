use bytes::{Buf, Bytes, BytesMut};

/// MySQL packet header size: 3 bytes length + 1 byte sequence
pub const PACKET_HEADER_SIZE: usize = 4;
/// Maximum packet payload size (16MB - 1); a body of exactly this length
/// continues in the next wire packet.
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// COM_QUERY command byte
pub const COM_QUERY: u8 = 0x03;
/// COM_FIELD_LIST command byte
pub const COM_FIELD_LIST: u8 = 0x04;

/// Framing failures. Short reads leave the source buffer partially
/// consumed; callers resume on whatever remains.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("short read: need {needed} bytes, {available} buffered")]
    ShortRead { needed: usize, available: usize },

    #[error("invalid sequence: {got} != {want}")]
    InvalidSequence { got: u8, want: u8 },
}

/// One MySQL wire packet
#[derive(Debug, Clone)]
pub struct Packet {
    pub seq: u8,
    pub body: Bytes,
}

/// Body length declared by the header, or None with fewer than 3 bytes
/// buffered.
pub fn peek_size(buf: &[u8]) -> Option<usize> {
    if buf.len() < 3 {
        return None;
    }
    Some(buf[0] as usize | (buf[1] as usize) << 8 | (buf[2] as usize) << 16)
}

/// Sequence byte of the packet at the head of the buffer, or None with
/// fewer than 4 bytes buffered.
pub fn peek_seq(buf: &[u8]) -> Option<u8> {
    if buf.len() < PACKET_HEADER_SIZE {
        return None;
    }
    Some(buf[3])
}

/// Total wire length (headers included) of the logical packet at the head
/// of the buffer, or None until every continuation chunk is buffered.
pub fn peek_packet_len(buf: &[u8]) -> Option<usize> {
    let mut offset = 0;
    loop {
        let size = peek_size(&buf[offset..])?;
        if offset + PACKET_HEADER_SIZE + size > buf.len() {
            return None;
        }
        offset += PACKET_HEADER_SIZE + size;
        if size < MAX_PACKET_SIZE {
            return Some(offset);
        }
    }
}

/// Read exactly one wire packet, optionally enforcing its sequence byte.
pub fn read_one(src: &mut BytesMut, expected_seq: Option<u8>) -> Result<Packet, FrameError> {
    if src.len() < PACKET_HEADER_SIZE {
        return Err(FrameError::ShortRead {
            needed: PACKET_HEADER_SIZE,
            available: src.len(),
        });
    }
    let size = src[0] as usize | (src[1] as usize) << 8 | (src[2] as usize) << 16;
    let seq = src[3];
    if let Some(want) = expected_seq {
        if seq != want {
            return Err(FrameError::InvalidSequence { got: seq, want });
        }
    }
    src.advance(PACKET_HEADER_SIZE);
    if src.len() < size {
        let available = src.len();
        src.advance(available);
        return Err(FrameError::ShortRead {
            needed: size,
            available,
        });
    }
    let body = src.split_to(size).freeze();
    Ok(Packet { seq, body })
}

/// Read one logical packet, concatenating continuation chunks while the
/// body length sits at [`MAX_PACKET_SIZE`]. Continuations must carry
/// incrementing sequence bytes starting at `first_seq + 1`.
pub fn read_packet(src: &mut BytesMut) -> Result<Bytes, FrameError> {
    let first = read_one(src, None)?;
    if first.body.len() < MAX_PACKET_SIZE {
        return Ok(first.body);
    }

    let mut data = BytesMut::from(&first.body[..]);
    let mut seq = first.seq;
    loop {
        seq = seq.wrapping_add(1);
        let chunk = read_one(src, Some(seq))?;
        let done = chunk.body.len() < MAX_PACKET_SIZE;
        data.extend_from_slice(&chunk.body);
        if done {
            return Ok(data.freeze());
        }
    }
}

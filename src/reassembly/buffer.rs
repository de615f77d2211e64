use std::collections::BTreeMap;

/// Sequence-ordered byte buffer for one direction of a TCP connection.
///
/// In-order data lands in the ready run; out-of-order segments are parked
/// until the gap before them fills. Retransmitted and overlapping bytes
/// are trimmed. Comparisons are wraparound-safe.
#[derive(Debug, Default)]
pub struct SeqBuffer {
    /// Next expected sequence number.
    expected_seq: u32,
    /// Set from the SYN, or inferred from the first segment seen.
    initial_seq: Option<u32>,
    /// Out-of-order segments keyed by sequence number.
    pending: BTreeMap<u32, Vec<u8>>,
    /// Contiguous reassembled bytes not yet handed out.
    ready: Vec<u8>,
    pub fin: bool,
    pub rst: bool,
}

impl SeqBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the initial sequence number from a SYN (which consumes one
    /// sequence slot).
    pub fn set_initial_seq(&mut self, seq: u32) {
        self.initial_seq = Some(seq);
        self.expected_seq = seq.wrapping_add(1);
    }

    /// Add a data segment.
    pub fn add_segment(&mut self, seq: u32, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        // Mid-stream start: the first segment seen sets the base.
        if self.initial_seq.is_none() {
            self.initial_seq = Some(seq);
            self.expected_seq = seq;
        }

        if seq_lt(seq, self.expected_seq) {
            let seg_end = seq_add(seq, data.len());
            if seq_le(seg_end, self.expected_seq) {
                // Pure retransmit.
                return;
            }
            // Partial overlap: trim the already-delivered prefix.
            let overlap = self.expected_seq.wrapping_sub(seq) as usize;
            self.insert(self.expected_seq, &data[overlap..]);
            return;
        }

        self.insert(seq, data);
    }

    fn insert(&mut self, seq: u32, data: &[u8]) {
        if seq == self.expected_seq {
            self.ready.extend_from_slice(data);
            self.expected_seq = seq_add(seq, data.len());
            self.flush_pending();
        } else {
            self.pending.insert(seq, data.to_vec());
        }
    }

    fn flush_pending(&mut self) {
        while let Some((&seq, _)) = self.pending.first_key_value() {
            if seq == self.expected_seq {
                let data = self.pending.remove(&seq).unwrap_or_default();
                self.ready.extend_from_slice(&data);
                self.expected_seq = seq_add(seq, data.len());
            } else if seq_lt(seq, self.expected_seq) {
                // A retransmit that arrived late.
                self.pending.remove(&seq);
            } else {
                break;
            }
        }
    }

    /// Next expected sequence number for this direction.
    pub fn expected_seq(&self) -> u32 {
        self.expected_seq
    }

    /// Drain the contiguous run accumulated so far.
    pub fn take_ready(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.ready)
    }

    pub fn available(&self) -> usize {
        self.ready.len()
    }
}

fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

fn seq_add(a: u32, n: usize) -> u32 {
    a.wrapping_add(n as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order() {
        let mut buf = SeqBuffer::new();
        buf.add_segment(1000, b"Hello");
        buf.add_segment(1005, b" World");
        assert_eq!(buf.take_ready(), b"Hello World");
        assert_eq!(buf.available(), 0);
    }

    #[test]
    fn test_out_of_order() {
        let mut buf = SeqBuffer::new();
        buf.add_segment(1000, b"Hello");
        buf.add_segment(1010, b"World");
        assert_eq!(buf.available(), 5); // gap before "World"
        buf.add_segment(1005, b"Big, ");
        assert_eq!(buf.take_ready(), b"HelloBig, World");
    }

    #[test]
    fn test_retransmit_dropped() {
        let mut buf = SeqBuffer::new();
        buf.add_segment(1000, b"Hello");
        buf.add_segment(1000, b"Hello");
        assert_eq!(buf.take_ready(), b"Hello");
    }

    #[test]
    fn test_overlap_trimmed() {
        let mut buf = SeqBuffer::new();
        buf.add_segment(1000, b"Hello");
        buf.add_segment(1003, b"loWorld");
        assert_eq!(buf.take_ready(), b"HelloWorld");
    }

    #[test]
    fn test_syn_consumes_one() {
        let mut buf = SeqBuffer::new();
        buf.set_initial_seq(999);
        assert_eq!(buf.expected_seq(), 1000);
        buf.add_segment(1000, b"data");
        assert_eq!(buf.take_ready(), b"data");
        assert_eq!(buf.expected_seq(), 1004);
    }

    #[test]
    fn test_wraparound() {
        let mut buf = SeqBuffer::new();
        let near_max = u32::MAX - 2;
        buf.add_segment(near_max, b"ABC");
        buf.add_segment(near_max.wrapping_add(3), b"DEF");
        assert_eq!(buf.take_ready(), b"ABCDEF");
    }

    #[test]
    fn test_take_ready_is_incremental() {
        let mut buf = SeqBuffer::new();
        buf.add_segment(1, b"one");
        assert_eq!(buf.take_ready(), b"one");
        buf.add_segment(4, b"two");
        assert_eq!(buf.take_ready(), b"two");
    }
}

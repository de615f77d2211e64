pub mod packet;

pub use packet::{
    peek_packet_len, peek_seq, peek_size, read_one, read_packet, FrameError, Packet,
    COM_FIELD_LIST, COM_QUERY, MAX_PACKET_SIZE, PACKET_HEADER_SIZE,
};

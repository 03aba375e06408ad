//! The stream wire block header (§6): the only thing a real transport would
//! put on the wire in front of a block's payload bytes. The in-process
//! multiplexer never needs to serialize this for loopback traffic (§4.4),
//! but every non-loopback dispatch round-trips it through [`BlockHeader::encode`]/
//! [`BlockHeader::decode`] so the wire contract stays exercised even though
//! the real socket transport is out of scope here.

use flux_core::{FluxError, Result};

pub const HEADER_LEN: usize = 32;

/// Bit 0 of `flags`: this is the last block from `source_worker` to
/// `target_worker` on this stream; the receiving queue should close.
pub const FLAG_END_OF_STREAM: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub stream_id: u64,
    pub source_worker: u32,
    pub target_worker: u32,
    pub payload_len: u32,
    pub item_count: u32,
    pub first_item_offset: u32,
    pub flags: u32,
}

impl BlockHeader {
    pub fn is_end_of_stream(&self) -> bool {
        self.flags & FLAG_END_OF_STREAM != 0
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..8].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.source_worker.to_le_bytes());
        buf[12..16].copy_from_slice(&self.target_worker.to_le_bytes());
        buf[16..20].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[20..24].copy_from_slice(&self.item_count.to_le_bytes());
        buf[24..28].copy_from_slice(&self.first_item_offset.to_le_bytes());
        buf[28..32].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(FluxError::protocol("truncated stream block header"));
        }
        let field = |range: std::ops::Range<usize>| -> [u8; 4] {
            let mut a = [0u8; 4];
            a.copy_from_slice(&buf[range]);
            a
        };
        let mut stream_id_bytes = [0u8; 8];
        stream_id_bytes.copy_from_slice(&buf[0..8]);
        Ok(BlockHeader {
            stream_id: u64::from_le_bytes(stream_id_bytes),
            source_worker: u32::from_le_bytes(field(8..12)),
            target_worker: u32::from_le_bytes(field(12..16)),
            payload_len: u32::from_le_bytes(field(16..20)),
            item_count: u32::from_le_bytes(field(20..24)),
            first_item_offset: u32::from_le_bytes(field(24..28)),
            flags: u32::from_le_bytes(field(28..32)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips_through_the_wire_format() {
        let header = BlockHeader {
            stream_id: 0x0001_0002_0003_0004,
            source_worker: 3,
            target_worker: 7,
            payload_len: 2048,
            item_count: 12,
            first_item_offset: 4,
            flags: FLAG_END_OF_STREAM,
        };
        let encoded = header.encode();
        let decoded = BlockHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.is_end_of_stream());
    }

    #[test]
    fn truncated_header_is_a_protocol_violation() {
        let header = BlockHeader {
            stream_id: 1,
            source_worker: 0,
            target_worker: 1,
            payload_len: 0,
            item_count: 0,
            first_item_offset: 0,
            flags: 0,
        };
        let encoded = header.encode();
        assert!(BlockHeader::decode(&encoded[..HEADER_LEN - 1]).is_err());
    }
}

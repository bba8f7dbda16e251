//! Segment header and tail bookends.

use crate::codec::{
    decode_versioned, pad_to_block, put_journal_seq, put_segment_id, Reader, ENVELOPE_OVERHEAD,
    JOURNAL_SEQ_LEN, SEGMENT_ID_LEN,
};
use crate::types::{
    DataCategory, JournalSeq, ReclaimGen, SegmentNonce, SegmentSeq, SegmentType,
};
use bytes::{BufMut, Bytes, BytesMut};
use seglog_device::SegmentId;
use std::fmt;

const HEADER_V: u8 = 1;
const TAIL_V: u8 = 1;

/// Written at offset 0 of every segment when it is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Sequence of the segment in its stream.
    pub segment_seq: SegmentSeq,
    /// The segment the header was written to.
    pub physical_segment_id: SegmentId,
    /// Journal dirty tail at open time (null for out-of-line segments).
    pub dirty_tail: JournalSeq,
    /// Journal alloc tail at open time (null for out-of-line segments).
    pub alloc_tail: JournalSeq,
    /// Nonce stamped into every record group of the segment.
    pub segment_nonce: SegmentNonce,
    /// What the segment holds.
    pub seg_type: SegmentType,
    /// Category of the owning stream.
    pub category: DataCategory,
    /// Reclaim generation of the owning stream.
    pub generation: ReclaimGen,
}

impl SegmentHeader {
    const PAYLOAD_LEN: usize = 4 + SEGMENT_ID_LEN + 2 * JOURNAL_SEQ_LEN + 4 + 3;

    /// Encoded size before block padding.
    pub const ENCODED_LEN: usize = Self::PAYLOAD_LEN + ENVELOPE_OVERHEAD;

    /// Encodes the header into one zero-padded block.
    #[must_use]
    pub fn encode_block(&self, block_size: u32) -> Bytes {
        let mut payload = BytesMut::with_capacity(Self::PAYLOAD_LEN);
        payload.put_u32_le(self.segment_seq.as_u32());
        put_segment_id(&mut payload, self.physical_segment_id);
        put_journal_seq(&mut payload, self.dirty_tail);
        put_journal_seq(&mut payload, self.alloc_tail);
        payload.put_u32_le(self.segment_nonce);
        payload.put_u8(self.seg_type.as_byte());
        payload.put_u8(self.category.as_byte());
        payload.put_u8(self.generation.0);

        pad_to_block(&payload, HEADER_V, block_size)
    }

    /// Decodes a header from the start of `buf`.
    ///
    /// Returns `None` for anything that is not a valid header, including a
    /// never-written (zeroed) block.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let (_, payload) = decode_versioned(buf, HEADER_V)?;
        let mut reader = Reader::new(payload);
        Some(Self {
            segment_seq: SegmentSeq::new(reader.u32()?),
            physical_segment_id: reader.segment_id()?,
            dirty_tail: reader.journal_seq()?,
            alloc_tail: reader.journal_seq()?,
            segment_nonce: reader.u32()?,
            seg_type: SegmentType::from_byte(reader.u8()?)?,
            category: DataCategory::from_byte(reader.u8()?)?,
            generation: ReclaimGen(reader.u8()?),
        })
    }
}

impl fmt::Display for SegmentHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "segment_header(seq={}, {}, dirty_tail={}, alloc_tail={}, nonce={:#x}, {} {}_G{})",
            self.segment_seq,
            self.physical_segment_id,
            self.dirty_tail,
            self.alloc_tail,
            self.segment_nonce,
            self.seg_type,
            self.category,
            self.generation
        )
    }
}

/// Written in the last block of a segment when it is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentTail {
    /// Sequence of the segment in its stream.
    pub segment_seq: SegmentSeq,
    /// The segment the tail was written to.
    pub physical_segment_id: SegmentId,
    /// Nonce of the segment.
    pub segment_nonce: SegmentNonce,
    /// What the segment holds.
    pub seg_type: SegmentType,
    /// Latest modify time of the records written to the segment.
    pub modify_time: u64,
    /// Number of extents written to the segment.
    pub num_extents: u64,
}

impl SegmentTail {
    const PAYLOAD_LEN: usize = 4 + SEGMENT_ID_LEN + 4 + 1 + 8 + 8;

    /// Encoded size before block padding.
    pub const ENCODED_LEN: usize = Self::PAYLOAD_LEN + ENVELOPE_OVERHEAD;

    /// Encodes the tail into one zero-padded block.
    #[must_use]
    pub fn encode_block(&self, block_size: u32) -> Bytes {
        let mut payload = BytesMut::with_capacity(Self::PAYLOAD_LEN);
        payload.put_u32_le(self.segment_seq.as_u32());
        put_segment_id(&mut payload, self.physical_segment_id);
        payload.put_u32_le(self.segment_nonce);
        payload.put_u8(self.seg_type.as_byte());
        payload.put_u64_le(self.modify_time);
        payload.put_u64_le(self.num_extents);

        pad_to_block(&payload, TAIL_V, block_size)
    }

    /// Decodes a tail from the start of `buf`.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let (_, payload) = decode_versioned(buf, TAIL_V)?;
        let mut reader = Reader::new(payload);
        Some(Self {
            segment_seq: SegmentSeq::new(reader.u32()?),
            physical_segment_id: reader.segment_id()?,
            segment_nonce: reader.u32()?,
            seg_type: SegmentType::from_byte(reader.u8()?)?,
            modify_time: reader.u64()?,
            num_extents: reader.u64()?,
        })
    }
}

impl fmt::Display for SegmentTail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "segment_tail(seq={}, {}, nonce={:#x}, {}, modify_time={}, num_extents={})",
            self.segment_seq,
            self.physical_segment_id,
            self.segment_nonce,
            self.seg_type,
            self.modify_time,
            self.num_extents
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Paddr;
    use seglog_device::DeviceId;

    const BLOCK: u32 = 4096;

    fn header() -> SegmentHeader {
        let id = SegmentId::new(DeviceId::new(1), 3);
        let tail = JournalSeq::new(SegmentSeq(2), Paddr::segment(id, 4096));
        SegmentHeader {
            segment_seq: SegmentSeq(5),
            physical_segment_id: id,
            dirty_tail: tail,
            alloc_tail: tail,
            segment_nonce: 0xDEAD_BEEF,
            seg_type: SegmentType::Journal,
            category: DataCategory::Metadata,
            generation: ReclaimGen(0),
        }
    }

    #[test]
    fn header_block_decodes() {
        let block = header().encode_block(BLOCK);
        assert_eq!(block.len(), BLOCK as usize);
        assert_eq!(SegmentHeader::decode(&block), Some(header()));
    }

    #[test]
    fn zeroed_block_has_no_header() {
        assert!(SegmentHeader::decode(&vec![0u8; BLOCK as usize]).is_none());
        assert!(SegmentTail::decode(&vec![0u8; BLOCK as usize]).is_none());
    }

    #[test]
    fn corrupted_header_is_rejected() {
        let mut block = header().encode_block(BLOCK).to_vec();
        block[10] ^= 0x40;
        assert!(SegmentHeader::decode(&block).is_none());
    }

    #[test]
    fn tail_block_decodes() {
        let tail = SegmentTail {
            segment_seq: SegmentSeq(5),
            physical_segment_id: SegmentId::new(DeviceId::new(1), 3),
            segment_nonce: 7,
            seg_type: SegmentType::Ool,
            modify_time: 1_700_000_000,
            num_extents: 12,
        };
        let block = tail.encode_block(BLOCK);
        assert_eq!(SegmentTail::decode(&block), Some(tail));
        // a tail is not a header
        assert!(SegmentHeader::decode(&block).is_none());
    }
}

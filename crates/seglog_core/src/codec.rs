//! Little-endian field codecs and the versioned envelope.
//!
//! ## Envelope Format
//!
//! ```text
//! | struct_v (1) | compat_v (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! The checksum covers every byte before it. Decoding rejects envelopes
//! whose compat version is newer than the reader understands.

use crate::types::{JournalSeq, Paddr, SegmentSeq};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use seglog_device::{DeviceId, SegmentId};
use uuid::Uuid;

/// Encoded size of a [`Paddr`].
pub(crate) const PADDR_LEN: usize = 14;

/// Encoded size of a [`JournalSeq`].
pub(crate) const JOURNAL_SEQ_LEN: usize = 4 + PADDR_LEN;

/// Encoded size of a [`SegmentId`].
pub(crate) const SEGMENT_ID_LEN: usize = 5;

/// Bytes the envelope adds around its payload.
pub(crate) const ENVELOPE_OVERHEAD: usize = 1 + 1 + 4 + 4;

const PADDR_NULL: u8 = 0;
const PADDR_SEGMENT: u8 = 1;
const PADDR_BLOCK: u8 = 2;

pub(crate) fn put_segment_id(buf: &mut BytesMut, id: SegmentId) {
    buf.put_u8(id.device_id().as_u8());
    buf.put_u32_le(id.device_segment_id());
}

pub(crate) fn put_paddr(buf: &mut BytesMut, paddr: Paddr) {
    match paddr {
        Paddr::Null => {
            buf.put_u8(PADDR_NULL);
            buf.put_u8(0);
            buf.put_u32_le(0);
            buf.put_u64_le(0);
        }
        Paddr::Segment { segment, offset } => {
            buf.put_u8(PADDR_SEGMENT);
            put_segment_id(buf, segment);
            buf.put_u64_le(u64::from(offset));
        }
        Paddr::Block { device, addr } => {
            buf.put_u8(PADDR_BLOCK);
            buf.put_u8(device.as_u8());
            buf.put_u32_le(0);
            buf.put_u64_le(addr);
        }
    }
}

pub(crate) fn put_journal_seq(buf: &mut BytesMut, seq: JournalSeq) {
    buf.put_u32_le(seq.segment_seq.as_u32());
    put_paddr(buf, seq.offset);
}

/// Bounds-checked reader over a byte slice.
///
/// Every getter returns `None` instead of panicking when the input is short.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn u8(&mut self) -> Option<u8> {
        (self.buf.remaining() >= 1).then(|| self.buf.get_u8())
    }

    pub(crate) fn u32(&mut self) -> Option<u32> {
        (self.buf.remaining() >= 4).then(|| self.buf.get_u32_le())
    }

    pub(crate) fn u64(&mut self) -> Option<u64> {
        (self.buf.remaining() >= 8).then(|| self.buf.get_u64_le())
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.buf.len() < len {
            return None;
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Some(head)
    }

    pub(crate) fn uuid(&mut self) -> Option<Uuid> {
        let raw = self.bytes(16)?;
        Uuid::from_slice(raw).ok()
    }

    pub(crate) fn segment_id(&mut self) -> Option<SegmentId> {
        let device = DeviceId::new(self.u8()?);
        let segment = self.u32()?;
        Some(SegmentId::new(device, segment))
    }

    pub(crate) fn paddr(&mut self) -> Option<Paddr> {
        let tag = self.u8()?;
        let device = DeviceId::new(self.u8()?);
        let a = self.u32()?;
        let b = self.u64()?;
        match tag {
            PADDR_NULL => Some(Paddr::Null),
            PADDR_SEGMENT => Some(Paddr::segment(
                SegmentId::new(device, a),
                u32::try_from(b).ok()?,
            )),
            PADDR_BLOCK => Some(Paddr::block(device, b)),
            _ => None,
        }
    }

    pub(crate) fn journal_seq(&mut self) -> Option<JournalSeq> {
        let seq = SegmentSeq::new(self.u32()?);
        let offset = self.paddr()?;
        Some(JournalSeq::new(seq, offset))
    }
}

/// Wraps `payload` in a versioned, checksummed envelope.
pub(crate) fn encode_versioned(struct_v: u8, compat_v: u8, payload: &[u8], out: &mut BytesMut) {
    let start = out.len();
    out.put_u8(struct_v);
    out.put_u8(compat_v);
    out.put_u32_le(payload.len() as u32);
    out.put_slice(payload);
    let crc = crc32fast::hash(&out[start..]);
    out.put_u32_le(crc);
}

/// Wraps `payload` in an envelope zero-padded to one block.
pub(crate) fn pad_to_block(payload: &[u8], version: u8, block_size: u32) -> Bytes {
    let mut block = BytesMut::with_capacity(block_size as usize);
    encode_versioned(version, version, payload, &mut block);
    debug_assert!(block.len() <= block_size as usize);
    block.resize(block_size as usize, 0);
    block.freeze()
}

/// Unwraps an envelope, returning its struct version and payload.
///
/// Returns `None` if the envelope is truncated, its checksum does not
/// match, or it requires a newer reader than `supported_v`.
pub(crate) fn decode_versioned(buf: &[u8], supported_v: u8) -> Option<(u8, &[u8])> {
    let mut reader = Reader::new(buf);
    let struct_v = reader.u8()?;
    let compat_v = reader.u8()?;
    let len = reader.u32()? as usize;
    let payload = reader.bytes(len)?;
    let stored_crc = reader.u32()?;

    let covered = 6 + len;
    if crc32fast::hash(&buf[..covered]) != stored_crc {
        return None;
    }
    if compat_v > supported_v {
        return None;
    }
    Some((struct_v, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paddr_encoding_is_fixed_size() {
        let mut buf = BytesMut::new();
        put_paddr(&mut buf, Paddr::Null);
        put_paddr(
            &mut buf,
            Paddr::segment(SegmentId::new(DeviceId::new(1), 2), 4096),
        );
        put_paddr(&mut buf, Paddr::block(DeviceId::new(7), 1 << 40));
        assert_eq!(buf.len(), 3 * PADDR_LEN);

        let mut reader = Reader::new(&buf);
        assert_eq!(reader.paddr(), Some(Paddr::Null));
        assert_eq!(
            reader.paddr(),
            Some(Paddr::segment(SegmentId::new(DeviceId::new(1), 2), 4096))
        );
        assert_eq!(
            reader.paddr(),
            Some(Paddr::block(DeviceId::new(7), 1 << 40))
        );
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn unknown_paddr_tag_is_rejected() {
        let mut raw = [0u8; PADDR_LEN];
        raw[0] = 9;
        assert!(Reader::new(&raw).paddr().is_none());
    }

    #[test]
    fn short_input_is_rejected() {
        let mut reader = Reader::new(&[1, 2, 3]);
        assert!(reader.u32().is_none());
        assert!(reader.journal_seq().is_none());
    }

    #[test]
    fn envelope_detects_corruption() {
        let mut buf = BytesMut::new();
        encode_versioned(1, 1, b"payload", &mut buf);
        assert_eq!(buf.len(), 7 + ENVELOPE_OVERHEAD);
        assert_eq!(decode_versioned(&buf, 1), Some((1, &b"payload"[..])));

        let mut corrupted = buf.to_vec();
        corrupted[8] ^= 0xFF;
        assert!(decode_versioned(&corrupted, 1).is_none());
    }

    #[test]
    fn envelope_rejects_newer_compat() {
        let mut buf = BytesMut::new();
        encode_versioned(3, 2, b"x", &mut buf);
        assert!(decode_versioned(&buf, 1).is_none());
        assert!(decode_versioned(&buf, 2).is_some());
    }

    #[test]
    fn zeroed_block_is_not_an_envelope() {
        let zeroes = vec![0u8; 4096];
        assert!(decode_versioned(&zeroes, 1).is_none());
    }
}

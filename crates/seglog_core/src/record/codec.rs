//! Bit-exact encoding of record groups.
//!
//! ## Record Group Format
//!
//! ```text
//! metadata (mdlength bytes, block aligned):
//! | md_crc (4) | records (4) | mdlength (4) | dlength (4) | nonce (4) |
//! | committed_to (18) | data_crc (4) |
//! | per record: extents (4) | deltas (4) | modify_time (8) |
//! | per extent: length (4) |
//! | per delta: length (4) | bytes (N) |
//! | zero padding |
//! data (dlength bytes):
//! | extents, in record order |
//! ```
//!
//! `md_crc` covers the metadata after itself, padding included. `data_crc`
//! covers the whole data area. All integers are little-endian.

use super::model::{RecordGroup, RecordGroupHeader, RecordGroupSize, RECORD_HEADER_LEN};
use crate::codec::{put_journal_seq, Reader};
use crate::error::{JournalError, JournalResult};
use crate::types::{JournalSeq, Paddr, SegmentNonce};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

/// A record recovered from an encoded group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    /// The record's modify time.
    pub modify_time: u64,
    /// The record's data extents.
    pub extents: Vec<Bytes>,
    /// The record's deltas.
    pub deltas: Vec<Bytes>,
}

/// The deltas of one record together with the address of its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDeltas {
    /// Address of the record's first data block.
    pub record_block_base: Paddr,
    /// The record's modify time.
    pub modify_time: u64,
    /// The record's deltas.
    pub deltas: Vec<Bytes>,
}

/// Header fields `(mdlength, dlength)` of a group of `size`.
///
/// Every per-record count and length is bounded by one of the two.
fn header_lengths(size: &RecordGroupSize) -> JournalResult<(u32, u32)> {
    let mdlength = u32::try_from(size.mdlength()).map_err(|_| {
        JournalError::invalid_argument(format!("metadata length {:#x} overflows", size.mdlength()))
    })?;
    let dlength = u32::try_from(size.dlength).map_err(|_| {
        JournalError::invalid_argument(format!("data length {:#x} overflows", size.dlength))
    })?;
    Ok((mdlength, dlength))
}

/// Encodes every record of `group` into one buffer of exactly
/// `group.size().encoded_length()` bytes.
///
/// # Errors
///
/// Returns `InvalidArgument` if the metadata or data length does not fit
/// the 32-bit header fields.
pub fn encode_records(
    group: &RecordGroup,
    committed_to: JournalSeq,
    segment_nonce: SegmentNonce,
) -> JournalResult<Bytes> {
    let size = group.size();
    let (header_mdlength, header_dlength) = header_lengths(size)?;
    let mdlength = header_mdlength as usize;
    let encoded_length = size.encoded_length() as usize;

    let mut data_crc = crc32fast::Hasher::new();
    for record in group.records() {
        for extent in record.extents() {
            data_crc.update(extent);
        }
    }

    let mut buf = BytesMut::with_capacity(encoded_length);
    buf.put_u32_le(0); // md_crc, filled in below
    buf.put_u32_le(group.len() as u32);
    buf.put_u32_le(header_mdlength);
    buf.put_u32_le(header_dlength);
    buf.put_u32_le(segment_nonce);
    put_journal_seq(&mut buf, committed_to);
    buf.put_u32_le(data_crc.finalize());

    for record in group.records() {
        buf.put_u32_le(record.extents().len() as u32);
        buf.put_u32_le(record.deltas().len() as u32);
        buf.put_u64_le(record.modify_time());
    }
    for record in group.records() {
        for extent in record.extents() {
            buf.put_u32_le(extent.len() as u32);
        }
    }
    for record in group.records() {
        for delta in record.deltas() {
            buf.put_u32_le(delta.len() as u32);
            buf.put_slice(delta);
        }
    }
    debug_assert_eq!(buf.len() as u64, size.raw_mdlength());
    buf.resize(mdlength, 0);

    let md_crc = crc32fast::hash(&buf[4..mdlength]);
    buf[..4].copy_from_slice(&md_crc.to_le_bytes());

    for record in group.records() {
        for extent in record.extents() {
            buf.put_slice(extent);
        }
    }
    debug_assert_eq!(buf.len(), encoded_length);
    Ok(buf.freeze())
}

/// Decodes the group header at the start of `block`.
///
/// Returns `None` if the block is too short, a field is malformed, or the
/// nonce does not match `expected_nonce`.
#[must_use]
pub fn try_decode_records_header(
    block: &[u8],
    expected_nonce: SegmentNonce,
) -> Option<RecordGroupHeader> {
    let mut reader = Reader::new(block);
    let _md_crc = reader.u32()?;
    let header = RecordGroupHeader {
        records: reader.u32()?,
        mdlength: reader.u32()?,
        dlength: reader.u32()?,
        segment_nonce: reader.u32()?,
        committed_to: reader.journal_seq()?,
        data_crc: reader.u32()?,
    };
    if header.segment_nonce != expected_nonce {
        debug!(
            "record group nonce mismatch: found {:#x}, expected {:#x}",
            header.segment_nonce, expected_nonce
        );
        return None;
    }
    Some(header)
}

/// Checks the metadata checksum of a complete metadata area.
#[must_use]
pub fn validate_records_metadata(md: &[u8]) -> bool {
    let mut reader = Reader::new(md);
    let Some(stored) = reader.u32() else {
        return false;
    };
    let computed = crc32fast::hash(&md[4..]);
    if stored != computed {
        debug!("record group metadata checksum mismatch: {stored:#x} != {computed:#x}");
        return false;
    }
    true
}

/// Checks the data area against the header's data checksum.
#[must_use]
pub fn validate_records_data(header: &RecordGroupHeader, data: &[u8]) -> bool {
    let computed = crc32fast::hash(data);
    if computed != header.data_crc {
        debug!(
            "record group data checksum mismatch: {:#x} != {computed:#x}",
            header.data_crc
        );
        return false;
    }
    true
}

struct RecordLayout {
    modify_time: u64,
    extent_lens: Vec<usize>,
    deltas: Vec<Bytes>,
}

fn decode_layout(header: &RecordGroupHeader, md: &Bytes) -> Option<Vec<RecordLayout>> {
    let body = md.get(super::model::RECORD_GROUP_HEADER_LEN as usize..)?;
    let mut reader = Reader::new(body);

    let count = header.records as usize;
    // A corrupt count must not drive a huge allocation.
    if count.saturating_mul(RECORD_HEADER_LEN as usize) > body.len() {
        return None;
    }
    let mut counts = Vec::with_capacity(count);
    for _ in 0..count {
        let extents = reader.u32()? as usize;
        let deltas = reader.u32()? as usize;
        let modify_time = reader.u64()?;
        counts.push((extents, deltas, modify_time));
    }

    let mut layouts = Vec::with_capacity(count);
    for &(extents, _, modify_time) in &counts {
        if extents.saturating_mul(4) > reader.remaining() {
            return None;
        }
        let mut extent_lens = Vec::with_capacity(extents);
        for _ in 0..extents {
            extent_lens.push(reader.u32()? as usize);
        }
        layouts.push(RecordLayout {
            modify_time,
            extent_lens,
            deltas: Vec::new(),
        });
    }

    let body_start = md.len() - body.len();
    for (layout, &(_, deltas, _)) in layouts.iter_mut().zip(&counts) {
        if deltas.saturating_mul(4) > reader.remaining() {
            return None;
        }
        for _ in 0..deltas {
            let len = reader.u32()? as usize;
            let start = body_start + (body.len() - reader.remaining());
            reader.bytes(len)?;
            layout.deltas.push(md.slice(start..start + len));
        }
    }
    Some(layouts)
}

/// Recovers every record of a group from its metadata and data areas.
///
/// Returns `None` if the layout is inconsistent with the header.
#[must_use]
pub fn try_decode_records(
    header: &RecordGroupHeader,
    md: &Bytes,
    data: &Bytes,
) -> Option<Vec<DecodedRecord>> {
    let layouts = decode_layout(header, md)?;
    let mut offset = 0usize;
    let mut records = Vec::with_capacity(layouts.len());
    for layout in layouts {
        let mut extents = Vec::with_capacity(layout.extent_lens.len());
        for len in layout.extent_lens {
            let end = offset.checked_add(len)?;
            if end > data.len() {
                return None;
            }
            extents.push(data.slice(offset..end));
            offset = end;
        }
        records.push(DecodedRecord {
            modify_time: layout.modify_time,
            extents,
            deltas: layout.deltas,
        });
    }
    if offset != header.dlength as usize {
        return None;
    }
    Some(records)
}

/// Recovers the deltas of every record in a group, addressing each record
/// from `record_block_base`, the start of the group's data area.
///
/// Returns `None` if the layout is inconsistent with the header.
#[must_use]
pub fn try_decode_record_deltas(
    header: &RecordGroupHeader,
    md: &Bytes,
    record_block_base: Paddr,
) -> Option<Vec<RecordDeltas>> {
    let layouts = decode_layout(header, md)?;
    let mut offset = 0u64;
    let mut result = Vec::with_capacity(layouts.len());
    for layout in layouts {
        result.push(RecordDeltas {
            record_block_base: record_block_base.add_offset(offset),
            modify_time: layout.modify_time,
            deltas: layout.deltas,
        });
        offset += layout.extent_lens.iter().map(|l| *l as u64).sum::<u64>();
    }
    if offset != u64::from(header.dlength) {
        return None;
    }
    Some(result)
}

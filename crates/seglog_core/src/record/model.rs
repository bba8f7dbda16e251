//! Records, record groups and their encoded sizes.

use crate::error::{JournalError, JournalResult};
use crate::types::{align_up, JournalSeq, SegmentNonce};
use bytes::Bytes;

/// Encoded size of one per-record header: extent count, delta count and
/// modify time.
pub const RECORD_HEADER_LEN: u64 = 4 + 4 + 8;

/// Encoded size of the record group header including its leading
/// metadata checksum.
pub const RECORD_GROUP_HEADER_LEN: u64 = 4 + 4 + 4 + 4 + 4 + 18 + 4;

/// Metadata and data lengths of one record, before block rounding of the
/// metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordSize {
    /// Unpadded metadata bytes: header, extent lengths and deltas.
    pub plain_mdlength: u64,
    /// Data bytes: the sum of the block-aligned extents.
    pub dlength: u64,
}

/// One logical append request.
///
/// Extents are opaque block-aligned payloads; deltas are small opaque
/// buffers stored in the metadata area and handed back on replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    extents: Vec<Bytes>,
    deltas: Vec<Bytes>,
    modify_time: u64,
    size: RecordSize,
}

impl Record {
    /// Creates a record and precomputes its size.
    #[must_use]
    pub fn new(extents: Vec<Bytes>, deltas: Vec<Bytes>, modify_time: u64) -> Self {
        let plain_mdlength = RECORD_HEADER_LEN
            + 4 * extents.len() as u64
            + deltas.iter().map(|d| 4 + d.len() as u64).sum::<u64>();
        let dlength = extents.iter().map(|e| e.len() as u64).sum();
        Self {
            extents,
            deltas,
            modify_time,
            size: RecordSize {
                plain_mdlength,
                dlength,
            },
        }
    }

    /// Creates a record carrying only deltas.
    #[must_use]
    pub fn from_deltas(deltas: Vec<Bytes>) -> Self {
        Self::new(Vec::new(), deltas, 0)
    }

    /// Returns the data extents.
    #[must_use]
    pub fn extents(&self) -> &[Bytes] {
        &self.extents
    }

    /// Returns the deltas.
    #[must_use]
    pub fn deltas(&self) -> &[Bytes] {
        &self.deltas
    }

    /// Returns the modify time recorded with the record.
    #[must_use]
    pub const fn modify_time(&self) -> u64 {
        self.modify_time
    }

    /// Returns the precomputed size.
    #[must_use]
    pub const fn size(&self) -> &RecordSize {
        &self.size
    }

    /// Checks that every extent is a whole number of blocks.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a misaligned extent.
    pub fn check_alignment(&self, block_size: u32) -> JournalResult<()> {
        let block = block_size as usize;
        if let Some((i, extent)) = self
            .extents
            .iter()
            .enumerate()
            .find(|(_, e)| e.len() % block != 0)
        {
            return Err(JournalError::invalid_argument(format!(
                "extent {i} has length {} not aligned to block size {block_size}",
                extent.len()
            )));
        }
        Ok(())
    }
}

/// Running encoded size of a record group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordGroupSize {
    /// Sum of the records' unpadded metadata.
    pub plain_mdlength: u64,
    /// Sum of the records' data.
    pub dlength: u64,
    /// Block size the metadata is rounded to.
    pub block_size: u32,
}

impl RecordGroupSize {
    /// Creates the size of an empty group.
    #[must_use]
    pub const fn new(block_size: u32) -> Self {
        Self {
            plain_mdlength: 0,
            dlength: 0,
            block_size,
        }
    }

    /// Creates the size of a group holding one record.
    #[must_use]
    pub fn from_record(size: &RecordSize, block_size: u32) -> Self {
        let mut group = Self::new(block_size);
        group.account(size);
        group
    }

    /// Adds a record to the running size.
    pub fn account(&mut self, size: &RecordSize) {
        self.plain_mdlength += size.plain_mdlength;
        self.dlength += size.dlength;
    }

    /// Metadata length before padding, group header included.
    #[must_use]
    pub const fn raw_mdlength(&self) -> u64 {
        RECORD_GROUP_HEADER_LEN + self.plain_mdlength
    }

    /// Metadata length rounded up to the block size.
    #[must_use]
    pub const fn mdlength(&self) -> u64 {
        align_up(self.raw_mdlength(), self.block_size as u64)
    }

    /// Total bytes the group occupies on disk.
    #[must_use]
    pub const fn encoded_length(&self) -> u64 {
        self.mdlength() + self.dlength
    }

    /// Size the group would have after adding a record, without changing
    /// `self`.
    #[must_use]
    pub fn encoded_length_after(&self, size: &RecordSize) -> Self {
        let mut after = *self;
        after.account(size);
        after
    }

    /// Ratio of useful bytes to encoded bytes.
    #[must_use]
    pub fn fullness(&self) -> f64 {
        let encoded = self.encoded_length();
        if encoded == 0 {
            return 0.0;
        }
        (self.raw_mdlength() + self.dlength) as f64 / encoded as f64
    }
}

/// Records destined for one physical write.
#[derive(Debug, Clone)]
pub struct RecordGroup {
    records: Vec<Record>,
    size: RecordGroupSize,
}

impl RecordGroup {
    /// Creates an empty group.
    #[must_use]
    pub fn new(block_size: u32) -> Self {
        Self {
            records: Vec::new(),
            size: RecordGroupSize::new(block_size),
        }
    }

    /// Creates a group holding one record.
    #[must_use]
    pub fn from_record(record: Record, block_size: u32) -> Self {
        let mut group = Self::new(block_size);
        group.push(record);
        group
    }

    /// Appends a record.
    pub fn push(&mut self, record: Record) {
        self.size.account(record.size());
        self.records.push(record);
    }

    /// Returns the records in order.
    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the group holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns the running size.
    #[must_use]
    pub const fn size(&self) -> &RecordGroupSize {
        &self.size
    }

    /// Removes every record, keeping the block size.
    pub fn clear(&mut self) {
        self.records.clear();
        self.size = RecordGroupSize::new(self.size.block_size);
    }
}

/// On-disk header of one written record group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordGroupHeader {
    /// Number of records in the group.
    pub records: u32,
    /// Block-aligned metadata length.
    pub mdlength: u32,
    /// Block-aligned data length.
    pub dlength: u32,
    /// Nonce of the segment or journal the group was written to.
    pub segment_nonce: SegmentNonce,
    /// Highest position known durable when the group was encoded.
    pub committed_to: JournalSeq,
    /// Checksum of the data area.
    pub data_crc: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: u32 = 4096;

    #[test]
    fn record_size_counts_metadata_and_data() {
        let record = Record::new(
            vec![Bytes::from(vec![0; 4096]), Bytes::from(vec![0; 8192])],
            vec![Bytes::from_static(b"abc")],
            7,
        );
        assert_eq!(record.size().plain_mdlength, 16 + 8 + 4 + 3);
        assert_eq!(record.size().dlength, 12288);
    }

    #[test]
    fn misaligned_extent_is_rejected() {
        let record = Record::new(vec![Bytes::from(vec![0; 100])], Vec::new(), 0);
        assert!(record.check_alignment(BLOCK).is_err());

        let aligned = Record::new(vec![Bytes::from(vec![0; 4096])], Vec::new(), 0);
        assert!(aligned.check_alignment(BLOCK).is_ok());
    }

    #[test]
    fn group_metadata_is_block_rounded() {
        let record = Record::from_deltas(vec![Bytes::from(vec![1; 100])]);
        let size = RecordGroupSize::from_record(record.size(), BLOCK);
        assert_eq!(size.raw_mdlength(), 42 + 16 + 104);
        assert_eq!(size.mdlength(), 4096);
        assert_eq!(size.encoded_length(), 4096);
    }

    #[test]
    fn encoded_length_after_does_not_mutate() {
        let record = Record::from_deltas(vec![Bytes::from(vec![1; 5000])]);
        let empty = RecordGroupSize::new(BLOCK);
        let after = empty.encoded_length_after(record.size());
        assert_eq!(empty.plain_mdlength, 0);
        assert_eq!(after.mdlength(), 8192);
    }

    #[test]
    fn fullness_reflects_padding() {
        let small = Record::from_deltas(vec![Bytes::from(vec![1; 10])]);
        let size = RecordGroupSize::from_record(small.size(), BLOCK);
        assert!(size.fullness() < 0.1);

        let big = Record::new(vec![Bytes::from(vec![0; 4096 * 16])], Vec::new(), 0);
        let size = RecordGroupSize::from_record(big.size(), BLOCK);
        assert!(size.fullness() < 1.0);
        assert!(size.fullness() > 0.9);
    }

    #[test]
    fn group_push_and_clear() {
        let mut group = RecordGroup::new(BLOCK);
        group.push(Record::from_deltas(vec![Bytes::from_static(b"a")]));
        group.push(Record::from_deltas(vec![Bytes::from_static(b"b")]));
        assert_eq!(group.len(), 2);
        assert_eq!(group.size().plain_mdlength, 2 * (16 + 5));

        group.clear();
        assert!(group.is_empty());
        assert_eq!(group.size().block_size, BLOCK);
    }
}

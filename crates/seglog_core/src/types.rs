//! Core type definitions.

use seglog_device::{DeviceId, SegmentId};
use std::fmt;

/// Tag derived per segment that marks records as belonging to it.
pub type SegmentNonce = u32;

/// Rounds `value` up to a multiple of `align`.
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Sequence number of a journal segment (or a circulation of a circular
/// journal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentSeq(pub u32);

/// The null segment sequence.
pub const NULL_SEG_SEQ: SegmentSeq = SegmentSeq(u32::MAX);

impl SegmentSeq {
    /// Creates a new segment sequence.
    #[must_use]
    pub const fn new(seq: u32) -> Self {
        Self(seq)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns true for [`NULL_SEG_SEQ`].
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == u32::MAX
    }

    /// Returns the following sequence.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for SegmentSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("NULL_SEG_SEQ")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// A physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Paddr {
    /// No address.
    #[default]
    Null,
    /// An offset inside a segment.
    Segment {
        /// The segment.
        segment: SegmentId,
        /// Byte offset within the segment.
        offset: u32,
    },
    /// An absolute address on a random block device.
    Block {
        /// The device.
        device: DeviceId,
        /// Absolute byte address.
        addr: u64,
    },
}

impl Paddr {
    /// Creates a segment address.
    #[must_use]
    pub const fn segment(segment: SegmentId, offset: u32) -> Self {
        Self::Segment { segment, offset }
    }

    /// Creates a block device address.
    #[must_use]
    pub const fn block(device: DeviceId, addr: u64) -> Self {
        Self::Block { device, addr }
    }

    /// Returns true for [`Paddr::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the device holding this address.
    #[must_use]
    pub const fn device_id(&self) -> Option<DeviceId> {
        match self {
            Self::Null => None,
            Self::Segment { segment, .. } => Some(segment.device_id()),
            Self::Block { device, .. } => Some(*device),
        }
    }

    /// Returns the segment and offset of a segment address.
    #[must_use]
    pub const fn as_segment(&self) -> Option<(SegmentId, u32)> {
        match self {
            Self::Segment { segment, offset } => Some((*segment, *offset)),
            _ => None,
        }
    }

    /// Returns the absolute address of a block device address.
    #[must_use]
    pub const fn as_block(&self) -> Option<u64> {
        match self {
            Self::Block { addr, .. } => Some(*addr),
            _ => None,
        }
    }

    /// Returns the offset used for alignment checks: the segment offset or
    /// the absolute block address.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        match self {
            Self::Null => 0,
            Self::Segment { offset, .. } => *offset as u64,
            Self::Block { addr, .. } => *addr,
        }
    }

    /// Returns this address moved forward by `delta` bytes.
    ///
    /// The null address stays null.
    #[must_use]
    pub const fn add_offset(self, delta: u64) -> Self {
        match self {
            Self::Null => Self::Null,
            Self::Segment { segment, offset } => Self::Segment {
                segment,
                offset: offset + delta as u32,
            },
            Self::Block { device, addr } => Self::Block {
                device,
                addr: addr + delta,
            },
        }
    }
}

impl fmt::Display for Paddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("P_ADDR_NULL"),
            Self::Segment { segment, offset } => write!(f, "{segment}+{offset:#x}"),
            Self::Block { device, addr } => write!(f, "{device}@{addr:#x}"),
        }
    }
}

/// A position in the journal: the segment sequence plus the address.
///
/// Ordered by sequence first, so positions in later segments (or later
/// circulations) compare greater regardless of address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JournalSeq {
    /// Sequence of the segment or circulation.
    pub segment_seq: SegmentSeq,
    /// Address within the journal.
    pub offset: Paddr,
}

/// The null journal sequence.
pub const JOURNAL_SEQ_NULL: JournalSeq = JournalSeq {
    segment_seq: NULL_SEG_SEQ,
    offset: Paddr::Null,
};

impl JournalSeq {
    /// Creates a new journal sequence.
    #[must_use]
    pub const fn new(segment_seq: SegmentSeq, offset: Paddr) -> Self {
        Self {
            segment_seq,
            offset,
        }
    }

    /// Returns true for [`JOURNAL_SEQ_NULL`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.segment_seq.is_null() && self.offset.is_null()
    }

    /// Returns this position moved forward by `delta` bytes in the same
    /// segment.
    #[must_use]
    pub const fn add_offset(self, delta: u64) -> Self {
        Self {
            segment_seq: self.segment_seq,
            offset: self.offset.add_offset(delta),
        }
    }
}

impl Default for JournalSeq {
    fn default() -> Self {
        JOURNAL_SEQ_NULL
    }
}

impl fmt::Display for JournalSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("JOURNAL_SEQ_NULL")
        } else {
            write!(f, "({}, {})", self.segment_seq, self.offset)
        }
    }
}

/// What a segment is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SegmentType {
    /// Holds journal record groups.
    Journal = 0,
    /// Holds out-of-line extents.
    Ool = 1,
}

impl SegmentType {
    /// Converts a byte to a segment type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Journal),
            1 => Some(Self::Ool),
            _ => None,
        }
    }

    /// Converts the segment type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for SegmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Journal => f.write_str("JOURNAL"),
            Self::Ool => f.write_str("OOL"),
        }
    }
}

/// Category of the data written to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataCategory {
    /// Metadata extents and deltas.
    Metadata = 0,
    /// User data extents.
    Data = 1,
}

impl DataCategory {
    /// Converts a byte to a category.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Metadata),
            1 => Some(Self::Data),
            _ => None,
        }
    }

    /// Converts the category to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metadata => f.write_str("METADATA"),
            Self::Data => f.write_str("DATA"),
        }
    }
}

/// Reclaim generation of a write stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ReclaimGen(pub u8);

impl fmt::Display for ReclaimGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which journal implementation is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalType {
    /// Record groups in rolling segments.
    SegmentedJournal,
    /// One circular region on a random block device.
    RandomBlock,
}

/// Outcome of one physical write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    /// Where the written group starts.
    pub start_seq: JournalSeq,
    /// Bytes written. Zero for every record of a batch but the first.
    pub length: u64,
}

impl WriteResult {
    /// Returns the position just past the write.
    #[must_use]
    pub const fn end_seq(&self) -> JournalSeq {
        self.start_seq.add_offset(self.length)
    }
}

impl fmt::Display for WriteResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "write_result({}, len={:#x})", self.start_seq, self.length)
    }
}

/// Durable location of one record, returned to its submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocator {
    /// Address of the record's first data block.
    pub record_block_base: Paddr,
    /// The write that carried the record.
    pub write_result: WriteResult,
}

impl fmt::Display for RecordLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "record_locator(base={}, {})",
            self.record_block_base, self.write_result
        )
    }
}

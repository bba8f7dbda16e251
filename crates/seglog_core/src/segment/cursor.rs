//! Replay cursor over one segment.

use crate::error::{JournalError, JournalResult};
use crate::record::RecordGroupHeader;
use crate::types::{JournalSeq, Paddr, JOURNAL_SEQ_NULL};
use bytes::Bytes;
use seglog_device::SegmentId;
use std::collections::VecDeque;
use std::fmt;

/// A record group whose header has been read but which has not yet been
/// delivered.
#[derive(Debug, Clone)]
pub struct FoundRecordGroup {
    /// Address of the group's metadata.
    pub offset: Paddr,
    /// The decoded header.
    pub header: RecordGroupHeader,
    /// The complete metadata area.
    pub mdbuffer: Bytes,
}

/// Scan state for one segment.
///
/// Tracks the next read position, the highest `committed_to` seen, and the
/// groups read but not yet known to be committed.
#[derive(Debug, Clone)]
pub struct ScanValidRecordsCursor {
    seq: JournalSeq,
    segment: SegmentId,
    segment_offset: u32,
    last_committed: JournalSeq,
    num_consumed_records: usize,
    last_valid_header_found: bool,
    pending_record_groups: VecDeque<FoundRecordGroup>,
}

impl ScanValidRecordsCursor {
    /// Creates a cursor starting at `seq`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `seq` is not a segment address.
    pub fn new(seq: JournalSeq) -> JournalResult<Self> {
        let (segment, segment_offset) = seq.offset.as_segment().ok_or_else(|| {
            JournalError::invalid_argument(format!("scan must start in a segment, got {seq}"))
        })?;
        Ok(Self {
            seq,
            segment,
            segment_offset,
            last_committed: JOURNAL_SEQ_NULL,
            num_consumed_records: 0,
            last_valid_header_found: false,
            pending_record_groups: VecDeque::new(),
        })
    }

    /// Returns true once no valid header lies ahead and every pending group
    /// has been delivered or dropped.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.last_valid_header_found && self.pending_record_groups.is_empty()
    }

    /// Returns the segment being scanned.
    #[must_use]
    pub const fn segment_id(&self) -> SegmentId {
        self.segment
    }

    /// Returns the next read offset within the segment.
    #[must_use]
    pub const fn segment_offset(&self) -> u32 {
        self.segment_offset
    }

    /// Returns the next read position.
    #[must_use]
    pub const fn seq(&self) -> JournalSeq {
        self.seq
    }

    /// Returns the highest `committed_to` seen so far.
    #[must_use]
    pub const fn last_committed(&self) -> JournalSeq {
        self.last_committed
    }

    /// Returns the number of groups delivered through this cursor.
    #[must_use]
    pub const fn num_consumed_records(&self) -> usize {
        self.num_consumed_records
    }

    /// Returns the number of groups waiting to be delivered.
    #[must_use]
    pub fn num_pending(&self) -> usize {
        self.pending_record_groups.len()
    }

    /// Moves the read position forward.
    pub fn increment_seq(&mut self, delta: u32) {
        self.segment_offset += delta;
        self.seq = self.seq.add_offset(u64::from(delta));
    }

    /// Queues a group found at the current position and moves past it.
    pub fn emplace_record_group(&mut self, header: RecordGroupHeader, mdbuffer: Bytes) {
        let committed_to = header.committed_to;
        if !committed_to.is_null()
            && (self.last_committed.is_null() || committed_to > self.last_committed)
        {
            self.last_committed = committed_to;
        }
        self.pending_record_groups.push_back(FoundRecordGroup {
            offset: self.seq.offset,
            header,
            mdbuffer,
        });
        self.increment_seq(header.mdlength + header.dlength);
        debug_assert!(committed_to.is_null() || committed_to < self.seq);
    }

    /// Returns the oldest pending group.
    #[must_use]
    pub fn front(&self) -> Option<&FoundRecordGroup> {
        self.pending_record_groups.front()
    }

    /// Removes the oldest pending group after it has been delivered.
    pub fn pop_record_group(&mut self) -> Option<FoundRecordGroup> {
        let group = self.pending_record_groups.pop_front()?;
        self.num_consumed_records += 1;
        Some(group)
    }

    pub(crate) fn mark_last_valid_header_found(&mut self) {
        self.last_valid_header_found = true;
    }

    pub(crate) const fn last_valid_header_found(&self) -> bool {
        self.last_valid_header_found
    }

    pub(crate) fn clear_pending(&mut self) {
        self.pending_record_groups.clear();
    }
}

impl fmt::Display for ScanValidRecordsCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cursor(seq={}, last_committed={}, consumed={}, pending={}, header_exhausted={})",
            self.seq,
            self.last_committed,
            self.num_consumed_records,
            self.pending_record_groups.len(),
            self.last_valid_header_found
        )
    }
}

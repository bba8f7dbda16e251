//! Journals and the write path beneath them.
//!
//! ## Write Path
//!
//! ```text
//! Journal::submit_record
//!   -> RecordSubmitter   (batching, io-depth, rolling)
//!   -> RecordBatch       (pending records sharing one write)
//!   -> SegmentAllocator  (open segment, write cursor)
//!   -> Segment::write
//! ```
//!
//! The circular journal skips the submitter: it has a single write
//! position and writes each record as its own group.
//!
//! ## Recovery
//!
//! [`Journal::replay`] walks the written region from the journal tail and
//! hands every valid record group to a [`DeltaHandler`] in write order.
//! Mounting a segmented journal requires a replay first, since the replay
//! restores the tails and the segment sequence.

mod allocator;
mod batch;
mod circular;
mod promise;
mod segmented;
mod submitter;

pub use allocator::{segment_nonce, SegmentAllocator};
pub use batch::{BatchState, RecordBatch, SubmitEvaluation};
pub use circular::{CbjHeader, CircularBoundedJournal, CBJOURNAL_MAGIC};
pub use segmented::SegmentedJournal;
pub use submitter::{IoState, RecordSubmitter, SubmitAction, SubmitterStats};

use crate::error::JournalResult;
use crate::record::Record;
use crate::segment::FoundRecordHandler;
use crate::types::{JournalSeq, JournalType, RecordLocator};
use async_trait::async_trait;

/// Receives each replayed record group with its locator, header and
/// metadata area. An error aborts the replay.
pub type DeltaHandler<'a> = FoundRecordHandler<'a>;

/// A durable, replayable record log.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Which implementation this is.
    fn journal_type(&self) -> JournalType;

    /// Opens a freshly created journal and returns its first write position.
    async fn open_for_mkfs(&self) -> JournalResult<JournalSeq>;

    /// Opens an existing journal for writing and returns the write position.
    async fn open_for_mount(&self) -> JournalResult<JournalSeq>;

    /// Appends a record and resolves once it is durable.
    async fn submit_record(&self, record: Record) -> JournalResult<RecordLocator>;

    /// Delivers every committed record group from the journal tail on.
    async fn replay(&self, handler: &mut DeltaHandler<'_>) -> JournalResult<()>;

    /// Stops writing. Outstanding submissions must have completed.
    async fn close(&self) -> JournalResult<()>;
}

//! # SegLog Core
//!
//! The journaling layer of a log-structured storage engine.
//!
//! Records are appended durably to block storage, batched so that
//! concurrent writers share physical writes, and replayed on restart to
//! rebuild whatever state was derived from them.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │        Journal (Segmented / Circular)      │
//! ├────────────────────────────────────────────┤
//! │  RecordSubmitter  │  replay / scan cursor  │
//! ├───────────────────┼────────────────────────┤
//! │  RecordBatch      │  SegmentManagerGroup   │
//! │  SegmentAllocator │                        │
//! ├───────────────────┴────────────────────────┤
//! │        seglog_device (segments, blocks)    │
//! └────────────────────────────────────────────┘
//! ```
//!
//! ## Durability
//!
//! A record is durable once the future returned for it resolves. Every
//! record group carries the position of the latest group known durable
//! when it was written (`committed_to`); replay only trusts a group once a
//! later group vouches for it or its data checksum validates.
//!
//! ## Example
//!
//! ```rust
//! use bytes::Bytes;
//! use seglog_core::{
//!     FifoSegmentProvider, InMemoryTrimmer, Journal, Record, SegmentManagerGroup,
//!     SegmentedJournal, SubmitterConfig,
//! };
//! use seglog_device::{DeviceId, InMemorySegmentManager, SegmentManager};
//! use std::sync::Arc;
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let device = InMemorySegmentManager::new(DeviceId::new(0), 4096, 16 * 4096, 4);
//! let group = SegmentManagerGroup::new(vec![Arc::new(device) as Arc<dyn SegmentManager>]).unwrap();
//! let provider = Arc::new(FifoSegmentProvider::new(Arc::new(group)));
//! let journal = SegmentedJournal::new(
//!     provider,
//!     Arc::new(InMemoryTrimmer::new()),
//!     &SubmitterConfig::default(),
//! )
//! .unwrap();
//!
//! journal.open_for_mkfs().await.unwrap();
//! let record = Record::from_deltas(vec![Bytes::from_static(b"hello")]);
//! let locator = journal.submit_record(record).await.unwrap();
//! assert!(!locator.write_result.start_seq.is_null());
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod config;
mod error;
mod journal;
mod record;
mod segment;
mod trimmer;
mod types;

pub use config::{
    CbjConfig, SubmitterConfig, DEFAULT_BLOCK_SIZE, DEFAULT_CBJ_DEVICE_ID, DEFAULT_CBJ_SIZE,
};
pub use error::{JournalError, JournalResult};
pub use journal::{
    segment_nonce, BatchState, CbjHeader, CircularBoundedJournal, DeltaHandler, IoState, Journal,
    RecordBatch, RecordSubmitter, SegmentAllocator, SegmentedJournal, SubmitAction,
    SubmitEvaluation, SubmitterStats, CBJOURNAL_MAGIC,
};
pub use record::{
    encode_records, try_decode_record_deltas, try_decode_records, try_decode_records_header,
    validate_records_data, validate_records_metadata, DecodedRecord, Record, RecordDeltas,
    RecordGroup, RecordGroupHeader, RecordGroupSize, RecordSize, RECORD_GROUP_HEADER_LEN,
    RECORD_HEADER_LEN,
};
pub use segment::{
    FifoSegmentProvider, FoundRecordGroup, FoundRecordHandler, ScanValidRecordsCursor,
    SegmentHeader, SegmentInfo, SegmentManagerGroup, SegmentProvider, SegmentSeqAllocator,
    SegmentTail,
};
pub use trimmer::{InMemoryTrimmer, JournalTrimmer};
pub use types::{
    align_up, DataCategory, JournalSeq, JournalType, Paddr, ReclaimGen, RecordLocator,
    SegmentNonce, SegmentSeq, SegmentType, WriteResult, JOURNAL_SEQ_NULL, NULL_SEG_SEQ,
};

//! Accumulation of records into one physical write.

use super::promise::SharedPromise;
use crate::error::{JournalError, JournalResult};
use crate::record::{encode_records, Record, RecordGroup, RecordGroupSize, RecordSize};
use crate::types::{JournalSeq, RecordLocator, SegmentNonce, WriteResult};
use bytes::Bytes;
use std::future::Future;
use tracing::{error, trace};

/// Lifecycle of a [`RecordBatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Holds no records.
    Empty,
    /// Accumulating records.
    Pending,
    /// Encoded and being written; rejects new records.
    Submitting,
}

/// Outcome of [`RecordBatch::evaluate_submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitEvaluation {
    /// Group size if the record were added.
    pub submit_size: RecordGroupSize,
    /// Whether that size exceeds the flush threshold.
    pub is_full: bool,
}

#[derive(Debug, Clone, Copy)]
struct PromiseResult {
    write_result: WriteResult,
    mdlength: u64,
}

/// Records destined for one physical write, plus the completion shared by
/// their submitters.
#[derive(Debug)]
pub struct RecordBatch {
    index: usize,
    state: BatchState,
    pending: RecordGroup,
    batch_capacity: usize,
    batch_flush_size: u64,
    submitting_size: usize,
    submitting_length: u64,
    submitting_mdlength: u64,
    io_promise: Option<SharedPromise<PromiseResult>>,
}

impl RecordBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new(index: usize, block_size: u32, batch_capacity: usize, batch_flush_size: u64) -> Self {
        Self {
            index,
            state: BatchState::Empty,
            pending: RecordGroup::new(block_size),
            batch_capacity,
            batch_flush_size,
            submitting_size: 0,
            submitting_length: 0,
            submitting_mdlength: 0,
            io_promise: None,
        }
    }

    /// Slot index within the owning submitter.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> BatchState {
        self.state
    }

    /// Returns true if the batch holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state == BatchState::Empty
    }

    /// Returns true while records accumulate.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state == BatchState::Pending
    }

    /// Returns true while the batch is being written.
    #[must_use]
    pub fn is_submitting(&self) -> bool {
        self.state == BatchState::Submitting
    }

    /// Number of pending records.
    #[must_use]
    pub fn num_records(&self) -> usize {
        self.pending.len()
    }

    /// Maximum number of records before a flush is due.
    #[must_use]
    pub const fn batch_capacity(&self) -> usize {
        self.batch_capacity
    }

    /// Encoded size of the pending records.
    #[must_use]
    pub fn submit_size(&self) -> RecordGroupSize {
        *self.pending.size()
    }

    /// Number of records in the write in flight.
    #[must_use]
    pub const fn submitting_size(&self) -> usize {
        self.submitting_size
    }

    /// Returns true if the pending records should be written now.
    ///
    /// Never true unless the batch is pending.
    #[must_use]
    pub fn needs_flush(&self) -> bool {
        if self.state != BatchState::Pending {
            return false;
        }
        debug_assert!(self.pending.len() <= self.batch_capacity);
        self.pending.len() >= self.batch_capacity
            || self.pending.size().encoded_length() > self.batch_flush_size
    }

    /// Computes what adding a record of `size` would do, without adding it.
    #[must_use]
    pub fn evaluate_submit(&self, size: &RecordSize) -> SubmitEvaluation {
        debug_assert!(!self.is_submitting());
        let submit_size = self.pending.size().encoded_length_after(size);
        SubmitEvaluation {
            submit_size,
            is_full: submit_size.encoded_length() > self.batch_flush_size,
        }
    }

    /// Adds a record to the batch.
    ///
    /// The returned future resolves once the batch has been written. Every
    /// record of the batch shares the group's start sequence; only the first
    /// one carries the group length.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the batch is being submitted. The
    /// future fails with an I/O error if the write fails.
    pub fn add_pending(
        &mut self,
        name: &str,
        record: Record,
    ) -> JournalResult<impl Future<Output = JournalResult<RecordLocator>> + Send + 'static> {
        if self.is_submitting() {
            return Err(JournalError::invalid_argument(format!(
                "{name} batch {} is submitting",
                self.index
            )));
        }
        let record_index = self.pending.len();
        let dlength_offset = self.pending.size().dlength;
        self.pending.push(record);
        trace!(
            "{name} batches={}, write_size={}, dlength_offset={dlength_offset}",
            self.pending.len(),
            self.pending.size().encoded_length()
        );

        let promise = self.io_promise.get_or_insert_with(SharedPromise::new);
        let future = promise.get_shared_future();
        self.state = BatchState::Pending;

        let name = name.to_string();
        Ok(async move {
            let Some(result) = future.wait().await else {
                error!("{name} write failed");
                return Err(JournalError::io(format!("{name} record group write failed")));
            };
            let mut write_result = result.write_result;
            if record_index != 0 {
                write_result.length = 0;
            }
            let locator = RecordLocator {
                record_block_base: result
                    .write_result
                    .start_seq
                    .offset
                    .add_offset(result.mdlength + dlength_offset),
                write_result,
            };
            trace!("{name} write finish with {locator}");
            Ok(locator)
        })
    }

    /// Encodes the pending records and marks the batch submitting.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the batch is not pending or too large to
    /// encode; the batch is then left unchanged.
    pub fn encode_batch(
        &mut self,
        committed_to: JournalSeq,
        segment_nonce: SegmentNonce,
    ) -> JournalResult<(Bytes, RecordGroupSize)> {
        if !self.is_pending() {
            return Err(JournalError::invalid_argument(format!(
                "cannot encode batch {} in state {:?}",
                self.index, self.state
            )));
        }
        let size = *self.pending.size();
        let encoded = encode_records(&self.pending, committed_to, segment_nonce)?;
        self.state = BatchState::Submitting;
        self.submitting_size = self.pending.len();
        self.submitting_length = size.encoded_length();
        self.submitting_mdlength = size.mdlength();
        self.pending.clear();
        debug_assert_eq!(encoded.len() as u64, self.submitting_length);
        Ok((encoded, size))
    }

    /// Resolves every record of the submitted batch and empties it.
    ///
    /// `None` fails every record with an I/O error.
    pub fn set_result(&mut self, write_result: Option<WriteResult>) {
        debug_assert!(self.is_submitting());
        let promise = self.io_promise.take();
        if let (Some(promise), Some(write_result)) = (&promise, write_result) {
            debug_assert_eq!(write_result.length, self.submitting_length);
            promise.set_value(PromiseResult {
                write_result,
                mdlength: self.submitting_mdlength,
            });
        }
        // an unset promise is dropped here, failing its waiters
        drop(promise);
        self.state = BatchState::Empty;
        self.submitting_size = 0;
        self.submitting_length = 0;
        self.submitting_mdlength = 0;
    }

    /// Fails every pending record without writing it.
    pub(crate) fn abort_pending(&mut self) {
        if self.is_pending() {
            self.io_promise = None;
            self.pending.clear();
            self.state = BatchState::Empty;
        }
    }

    /// Encodes a single record on its own, bypassing the batch.
    ///
    /// The batch must be empty and stays empty.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the batch is not empty.
    pub fn submit_pending_fast(
        &self,
        record: Record,
        committed_to: JournalSeq,
        segment_nonce: SegmentNonce,
    ) -> JournalResult<(Bytes, RecordGroupSize)> {
        if !self.is_empty() {
            return Err(JournalError::invalid_argument(format!(
                "fast submit needs empty batch {}, found {:?}",
                self.index, self.state
            )));
        }
        let group = RecordGroup::from_record(record, self.pending.size().block_size);
        let size = *group.size();
        let encoded = encode_records(&group, committed_to, segment_nonce)?;
        debug_assert_eq!(encoded.len() as u64, size.encoded_length());
        Ok((encoded, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{try_decode_records, try_decode_records_header};
    use crate::types::{Paddr, SegmentSeq, JOURNAL_SEQ_NULL};
    use seglog_device::{DeviceId, SegmentId};

    const BLOCK: u32 = 4096;

    fn batch(capacity: usize, flush_size: u64) -> RecordBatch {
        RecordBatch::new(0, BLOCK, capacity, flush_size)
    }

    fn small(tag: u8) -> Record {
        Record::from_deltas(vec![Bytes::from(vec![tag; 100])])
    }

    fn with_extent(tag: u8) -> Record {
        Record::new(vec![Bytes::from(vec![tag; BLOCK as usize])], Vec::new(), 1)
    }

    fn write_at(offset: u32, length: u64) -> WriteResult {
        WriteResult {
            start_seq: JournalSeq::new(
                SegmentSeq(0),
                Paddr::segment(SegmentId::new(DeviceId::new(0), 0), offset),
            ),
            length,
        }
    }

    #[test]
    fn state_machine() {
        let mut b = batch(4, 1 << 20);
        assert!(b.is_empty());
        assert!(!b.needs_flush());

        let _fut = b.add_pending("test", small(1)).unwrap();
        assert!(b.is_pending());
        assert_eq!(b.num_records(), 1);

        let (encoded, size) = b.encode_batch(JOURNAL_SEQ_NULL, 1).unwrap();
        assert!(b.is_submitting());
        assert!(!b.needs_flush());
        assert_eq!(encoded.len() as u64, size.encoded_length());
        assert!(b.add_pending("test", small(2)).is_err());

        b.set_result(Some(write_at(4096, size.encoded_length())));
        assert!(b.is_empty());
        assert_eq!(b.num_records(), 0);
    }

    #[test]
    fn needs_flush_on_capacity_and_size() {
        let mut b = batch(2, 1 << 20);
        let _a = b.add_pending("test", small(1)).unwrap();
        assert!(!b.needs_flush());
        let _b = b.add_pending("test", small(2)).unwrap();
        assert!(b.needs_flush());

        let mut b = batch(16, u64::from(BLOCK));
        let _a = b.add_pending("test", with_extent(1)).unwrap();
        assert!(b.needs_flush());
    }

    #[test]
    fn evaluate_submit_does_not_mutate() {
        let b = batch(16, 2 * u64::from(BLOCK));
        let record = with_extent(1);
        let eval = b.evaluate_submit(record.size());
        assert_eq!(eval.submit_size.encoded_length(), 2 * u64::from(BLOCK));
        assert!(!eval.is_full);
        assert!(b.is_empty());

        let two = Record::new(
            vec![Bytes::from(vec![0; 2 * BLOCK as usize])],
            Vec::new(),
            0,
        );
        assert!(b.evaluate_submit(two.size()).is_full);
    }

    #[tokio::test]
    async fn records_share_one_write() {
        let mut b = batch(4, 1 << 20);
        let futs: Vec<_> = (0..3)
            .map(|i| b.add_pending("test", with_extent(i)).unwrap())
            .collect();
        let (encoded, size) = b.encode_batch(JOURNAL_SEQ_NULL, 9).unwrap();
        assert_eq!(size.dlength, 3 * u64::from(BLOCK));

        let header = try_decode_records_header(&encoded, 9).unwrap();
        let md = encoded.slice(..header.mdlength as usize);
        let data = encoded.slice(header.mdlength as usize..);
        let records = try_decode_records(&header, &md, &data).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].extents[0][0], 2);

        let result = write_at(4096, size.encoded_length());
        b.set_result(Some(result));

        let mut bases = Vec::new();
        for (i, fut) in futs.into_iter().enumerate() {
            let locator = fut.await.unwrap();
            assert_eq!(locator.write_result.start_seq, result.start_seq);
            let expected_len = if i == 0 { result.length } else { 0 };
            assert_eq!(locator.write_result.length, expected_len);
            bases.push(locator.record_block_base);
        }
        let md = size.mdlength();
        for (i, base) in bases.iter().enumerate() {
            assert_eq!(
                *base,
                result
                    .start_seq
                    .offset
                    .add_offset(md + i as u64 * u64::from(BLOCK))
            );
        }
    }

    #[tokio::test]
    async fn failed_write_fails_every_record() {
        let mut b = batch(4, 1 << 20);
        let first = b.add_pending("test", small(1)).unwrap();
        let second = b.add_pending("test", small(2)).unwrap();
        b.encode_batch(JOURNAL_SEQ_NULL, 0).unwrap();
        b.set_result(None);

        assert!(first.await.unwrap_err().is_io());
        assert!(second.await.unwrap_err().is_io());
        assert!(b.is_empty());
    }

    #[tokio::test]
    async fn aborted_batch_fails_records() {
        let mut b = batch(4, 1 << 20);
        let fut = b.add_pending("test", small(1)).unwrap();
        b.abort_pending();
        assert!(b.is_empty());
        assert!(fut.await.unwrap_err().is_io());
    }

    #[test]
    fn fast_submit_leaves_batch_empty() {
        let b = batch(4, 1 << 20);
        let (encoded, size) = b.submit_pending_fast(small(1), JOURNAL_SEQ_NULL, 3).unwrap();
        assert!(b.is_empty());
        assert_eq!(encoded.len() as u64, size.encoded_length());
        assert_eq!(size.mdlength(), u64::from(BLOCK));
    }
}

//! Journal over a group of segmented devices.

use super::allocator::SegmentAllocator;
use super::submitter::{RecordSubmitter, SubmitAction};
use super::{DeltaHandler, Journal};
use crate::config::SubmitterConfig;
use crate::error::{JournalError, JournalResult};
use crate::record::{Record, RecordGroupHeader, RecordGroupSize};
use crate::segment::{ScanValidRecordsCursor, SegmentHeader, SegmentProvider, SegmentSeqAllocator};
use crate::trimmer::JournalTrimmer;
use crate::types::{
    DataCategory, JournalSeq, JournalType, Paddr, ReclaimGen, RecordLocator, JOURNAL_SEQ_NULL,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use seglog_device::SegmentId;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of one submission attempt.
enum Attempt {
    Submitted(JoinHandle<JournalResult<RecordLocator>>),
    Unavailable(Record),
    Rolling(Record, BoxFuture<'static, JournalResult<()>>),
}

/// The metadata journal: one write stream rolled across segments.
///
/// Completed submissions are finalized in submission order: the committed
/// watermark and the trimmer's journal head only move once every earlier
/// submission has finished.
pub struct SegmentedJournal {
    provider: Arc<dyn SegmentProvider>,
    trimmer: Arc<dyn JournalTrimmer>,
    seq_allocator: Arc<SegmentSeqAllocator>,
    submitter: RecordSubmitter,
    next_ticket: Mutex<u64>,
    finalize_turn: Arc<watch::Sender<u64>>,
}

impl std::fmt::Debug for SegmentedJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedJournal")
            .field("submitter", &self.submitter)
            .field("next_segment_seq", &self.seq_allocator.next_segment_seq())
            .finish_non_exhaustive()
    }
}

impl SegmentedJournal {
    /// Creates a journal writing through `provider`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `config` is invalid.
    pub fn new(
        provider: Arc<dyn SegmentProvider>,
        trimmer: Arc<dyn JournalTrimmer>,
        config: &SubmitterConfig,
    ) -> JournalResult<Self> {
        let seq_allocator = Arc::new(SegmentSeqAllocator::new());
        let allocator = Arc::new(SegmentAllocator::new(
            Some(Arc::clone(&trimmer)),
            DataCategory::Metadata,
            ReclaimGen(0),
            Arc::clone(&provider),
            Arc::clone(&seq_allocator),
        ));
        let submitter = RecordSubmitter::new(config, allocator)?;
        let (finalize_turn, _) = watch::channel(0);
        Ok(Self {
            provider,
            trimmer,
            seq_allocator,
            submitter,
            next_ticket: Mutex::new(0),
            finalize_turn: Arc::new(finalize_turn),
        })
    }

    /// The submitter in front of the journal stream.
    #[must_use]
    pub fn submitter(&self) -> &RecordSubmitter {
        &self.submitter
    }

    /// Segment sequence counter, shared with out-of-line streams.
    #[must_use]
    pub fn segment_seq_allocator(&self) -> &Arc<SegmentSeqAllocator> {
        &self.seq_allocator
    }

    /// The trimmer holding the journal tails and head.
    #[must_use]
    pub fn trimmer(&self) -> &Arc<dyn JournalTrimmer> {
        &self.trimmer
    }

    fn try_submit(&self, record: Record) -> Attempt {
        let mut next_ticket = self.next_ticket.lock();
        if !self.submitter.is_available() {
            return Attempt::Unavailable(record);
        }
        if self.submitter.check_action(record.size()) == SubmitAction::Roll {
            debug!("{} rolling for {:?}", self.submitter.name(), record.size());
            return Attempt::Rolling(record, self.submitter.roll_segment());
        }
        let ticket = *next_ticket;
        *next_ticket += 1;
        let write = self.submitter.submit(record);

        let submitter = self.submitter.clone();
        let trimmer = Arc::clone(&self.trimmer);
        let finalize_turn = Arc::clone(&self.finalize_turn);
        let mut turn = finalize_turn.subscribe();
        Attempt::Submitted(tokio::spawn(async move {
            let result = write.await;
            // cannot fail while this task holds the sender
            let _ = turn.wait_for(|next| *next == ticket).await;
            if let Ok(locator) = &result {
                let start = locator.write_result.start_seq;
                submitter.update_committed_to(start);
                trimmer.set_journal_head(start);
            }
            finalize_turn.send_modify(|next| *next += 1);
            result
        }))
    }

    async fn scan_segments(
        &self,
        headers: &[(SegmentId, SegmentHeader)],
        replay_from: JournalSeq,
        handler: &mut DeltaHandler<'_>,
    ) -> JournalResult<JournalSeq> {
        let group = self.provider.segment_manager_group();
        let mut last_head = JOURNAL_SEQ_NULL;
        for (id, header) in headers
            .iter()
            .filter(|(_, h)| h.segment_seq >= replay_from.segment_seq)
        {
            let start = match replay_from.offset.as_segment() {
                Some((tail_segment, _))
                    if header.segment_seq == replay_from.segment_seq && tail_segment == *id =>
                {
                    replay_from
                }
                _ => JournalSeq::new(header.segment_seq, Paddr::segment(*id, 0)),
            };
            info!("replaying segment {id} from {start}");
            let mut cursor = ScanValidRecordsCursor::new(start)?;
            let mut track_head =
                |locator: RecordLocator, group_header: &RecordGroupHeader, md: &Bytes| {
                    last_head = locator.write_result.start_seq;
                    handler(locator, group_header, md)
                };
            group
                .scan_valid_records(&mut cursor, header.segment_nonce, usize::MAX, &mut track_head)
                .await?;
        }
        Ok(last_head)
    }
}

#[async_trait]
impl Journal for SegmentedJournal {
    fn journal_type(&self) -> JournalType {
        JournalType::SegmentedJournal
    }

    async fn open_for_mkfs(&self) -> JournalResult<JournalSeq> {
        self.submitter.open(true).await
    }

    async fn open_for_mount(&self) -> JournalResult<JournalSeq> {
        self.submitter.open(false).await
    }

    async fn submit_record(&self, record: Record) -> JournalResult<RecordLocator> {
        let max = u64::from(self.submitter.allocator().max_write_length());
        let length =
            RecordGroupSize::from_record(record.size(), self.submitter.allocator().block_size())
                .encoded_length();
        if length > max {
            return Err(JournalError::invalid_argument(format!(
                "record of {length:#x} bytes exceeds max write length {max:#x}"
            )));
        }

        let mut record = record;
        loop {
            match self.try_submit(record) {
                Attempt::Submitted(handle) => {
                    return match handle.await {
                        Ok(result) => result,
                        Err(e) => Err(JournalError::io(format!("submit task failed: {e}"))),
                    };
                }
                Attempt::Unavailable(pending) => {
                    record = pending;
                    self.submitter.wait_available().await?;
                }
                Attempt::Rolling(pending, roll) => {
                    record = pending;
                    roll.await?;
                }
            }
        }
    }

    async fn replay(&self, handler: &mut DeltaHandler<'_>) -> JournalResult<()> {
        let group = self.provider.segment_manager_group();
        let mut headers = group.find_journal_segment_headers().await?;
        headers.sort_by_key(|(_, header)| header.segment_seq);
        let Some((newest_id, newest)) = headers.last() else {
            return Err(JournalError::no_entity("no journal segment found"));
        };
        let (dirty_tail, alloc_tail) = (newest.dirty_tail, newest.alloc_tail);
        if dirty_tail.is_null() || alloc_tail.is_null() {
            return Err(JournalError::no_data(format!(
                "journal segment {newest_id} carries null tails"
            )));
        }
        info!(
            "found {} journal segments, newest {newest}, dirty_tail={dirty_tail}, alloc_tail={alloc_tail}",
            headers.len()
        );

        self.trimmer.update_journal_tails(dirty_tail, alloc_tail);
        self.seq_allocator
            .set_next_segment_seq(newest.segment_seq.next());
        for (id, header) in &headers {
            self.provider.init_mark_segment_closed(
                *id,
                header.segment_seq,
                header.seg_type,
                header.category,
                header.generation,
            );
        }

        let replay_from = dirty_tail.min(alloc_tail);
        let last_head = self.scan_segments(&headers, replay_from, handler).await?;
        if last_head.is_null() {
            warn!("replay from {replay_from} found no record group");
        } else {
            info!("replay done, journal head {last_head}");
            self.trimmer.set_journal_head(last_head);
            self.submitter.update_committed_to(last_head);
        }
        Ok(())
    }

    async fn close(&self) -> JournalResult<()> {
        self.submitter.close().await
    }
}

//! Cross-crate integration test helpers.
//!
//! Provides a harness that tracks what was submitted to a journal and
//! verifies it against a replay after restart.

use crate::fixtures::{delta_record, extent_record, ReplayLog, SegmentedFixture};
use bytes::Bytes;
use seglog_core::{Journal, RecordLocator, SubmitterConfig};
use std::sync::Arc;

/// A test harness for integration testing.
pub struct IntegrationHarness {
    /// The journal under test.
    pub fixture: Arc<SegmentedFixture>,
    /// Deltas acknowledged so far, in submission order.
    submitted: Vec<Bytes>,
}

impl IntegrationHarness {
    /// Creates a harness with a freshly created journal.
    pub async fn new(config: SubmitterConfig, num_segments: u32) -> Self {
        Self {
            fixture: Arc::new(SegmentedFixture::mkfs(config, num_segments).await),
            submitted: Vec::new(),
        }
    }

    /// Submits one delta record and tracks it.
    pub async fn submit(&mut self, tag: u8, len: usize) -> RecordLocator {
        let locator = self
            .fixture
            .journal
            .submit_record(delta_record(tag, len))
            .await
            .expect("Failed to submit record");
        self.submitted.push(Bytes::from(vec![tag; len]));
        locator
    }

    /// Submits `count` one-block extent records from concurrent tasks and
    /// waits for all.
    ///
    /// Returns the locators in write order.
    pub async fn submit_concurrently(&mut self, count: usize) -> Vec<RecordLocator> {
        let handles: Vec<_> = (0..count)
            .map(|i| {
                let fixture = Arc::clone(&self.fixture);
                let tag = (i % 251) as u8;
                tokio::spawn(async move {
                    let locator = fixture.journal.submit_record(extent_record(tag, 1)).await;
                    (tag, locator)
                })
            })
            .collect();

        let mut results = Vec::with_capacity(count);
        for (tag, locator) in futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.expect("Submit task panicked"))
        {
            results.push((locator.expect("Failed to submit record"), tag));
        }
        // replay order is write order
        results.sort_by_key(|(locator, _)| {
            (locator.write_result.start_seq, locator.record_block_base)
        });
        self.submitted
            .extend(results.iter().map(|(_, tag)| Bytes::from(vec![*tag; 16])));
        results.into_iter().map(|(locator, _)| locator).collect()
    }

    /// Number of acknowledged records.
    pub fn num_submitted(&self) -> usize {
        self.submitted.len()
    }

    /// Closes the journal, restarts over the same device and checks that
    /// the replay returns exactly what was acknowledged.
    pub async fn close_and_verify(&self) -> ReplayLog {
        self.fixture
            .journal
            .close()
            .await
            .expect("Failed to close journal");
        let restarted = self.fixture.restart();
        let log = ReplayLog::collect(&restarted.journal)
            .await
            .expect("Failed to replay journal");
        assert_eq!(log.deltas(), self.submitted, "replayed deltas differ");
        log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{CbjFixture, TEST_BLOCK_SIZE};
    use seglog_core::{
        IoState, JournalError, JournalSeq, Paddr, RecordGroupHeader, SegmentSeq, SubmitAction,
    };
    use seglog_device::DeviceId;

    const BLOCK: u64 = TEST_BLOCK_SIZE as u64;

    #[tokio::test]
    async fn three_records_share_one_write() {
        let fixture = SegmentedFixture::mkfs(SubmitterConfig::new().batch_capacity(4), 4).await;
        let submitter = fixture.journal.submitter();
        fixture.device.faults().hold_writes();

        // keep one write in flight so the next records batch up
        let head = submitter.submit(extent_record(0, 1));
        let batched: Vec<_> = (1..=3)
            .map(|tag| submitter.submit(extent_record(tag, 1)))
            .collect();
        assert_eq!(submitter.num_outstanding_io(), 1);

        fixture.device.faults().release_writes();
        head.await.unwrap();
        let locators: Vec<_> = futures::future::join_all(batched)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        let start = locators[0].write_result.start_seq;
        assert!(locators.iter().all(|l| l.write_result.start_seq == start));
        let mut bases: Vec<_> = locators.iter().map(|l| l.record_block_base).collect();
        bases.dedup();
        assert_eq!(bases.len(), 3);
        assert_eq!(submitter.stats().num_io, 2);
    }

    #[tokio::test]
    async fn io_depth_one_blocks_until_completion() {
        let fixture = Arc::new(SegmentedFixture::mkfs(SubmitterConfig::new().io_depth(1), 4).await);
        let submitter = fixture.journal.submitter();
        fixture.device.faults().hold_writes();

        let first = submitter.submit(extent_record(1, 1));
        assert_eq!(submitter.io_state(), IoState::Full);
        assert!(!submitter.is_available());

        let second = {
            let fixture = Arc::clone(&fixture);
            tokio::spawn(async move { fixture.journal.submit_record(extent_record(2, 1)).await })
        };
        tokio::task::yield_now().await;
        assert!(!second.is_finished());

        fixture.device.faults().release_writes();
        let first = first.await.unwrap();
        let second = second.await.unwrap().unwrap();
        assert!(second.write_result.start_seq > first.write_result.start_seq);
        assert!(submitter.is_available());
    }

    #[tokio::test]
    async fn roll_happens_exactly_at_capacity() {
        let fixture = SegmentedFixture::mkfs(SubmitterConfig::default(), 4).await;
        let submitter = fixture.journal.submitter();
        let allocator = submitter.allocator();

        // 16-block segment: header at block 0, tail at block 15
        let fill = extent_record(1, 13);
        assert_eq!(submitter.check_action(fill.size()), SubmitAction::SubmitNotFull);
        fixture.journal.submit_record(fill).await.unwrap();
        assert_eq!(allocator.written_to().offset.offset(), 15 * BLOCK);
        assert!(!allocator.needs_roll(0));
        assert!(allocator.needs_roll(1));

        let next = delta_record(2, 8);
        assert_eq!(submitter.check_action(next.size()), SubmitAction::Roll);
        let locator = fixture.journal.submit_record(next).await.unwrap();
        assert_eq!(locator.write_result.start_seq.segment_seq, SegmentSeq(1));
    }

    #[tokio::test]
    async fn replay_is_idempotent() {
        let mut harness = IntegrationHarness::new(SubmitterConfig::default(), 8).await;
        for tag in 0..10 {
            harness.submit(tag, 100).await;
        }
        harness.submit_concurrently(30).await;
        let first = harness.close_and_verify().await;

        let restarted = harness.fixture.restart();
        let again = ReplayLog::collect(&restarted.journal).await.unwrap();
        assert_eq!(first.starts(), again.starts());
        assert_eq!(first.deltas(), again.deltas());
        assert_eq!(again.num_records(), harness.num_submitted());
    }

    #[tokio::test]
    async fn replay_handler_error_aborts() {
        let mut harness = IntegrationHarness::new(SubmitterConfig::default(), 4).await;
        harness.submit(1, 16).await;
        harness.submit(2, 16).await;
        harness.fixture.journal.close().await.unwrap();

        let restarted = harness.fixture.restart();
        let mut calls = 0;
        let result = restarted
            .journal
            .replay(&mut |_, _: &RecordGroupHeader, _: &Bytes| {
                calls += 1;
                Err(JournalError::invalid_argument("stop"))
            })
            .await;
        assert!(matches!(result, Err(JournalError::InvalidArgument { .. })));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn write_error_latches_through_journal() {
        let fixture = SegmentedFixture::mkfs(SubmitterConfig::default(), 4).await;
        fixture.device.faults().fail_next_writes(1);
        let err = fixture
            .journal
            .submit_record(delta_record(1, 16))
            .await
            .unwrap_err();
        assert!(err.is_io());
        let err = fixture
            .journal
            .submit_record(delta_record(2, 16))
            .await
            .unwrap_err();
        assert!(err.is_io());
        assert!(fixture.journal.submitter().has_io_error());
    }

    #[tokio::test]
    async fn circular_journal_wraps_and_replays() {
        let fixture = CbjFixture::mkfs(9).await;
        let journal = &fixture.journal;
        let mut starts = Vec::new();
        for tag in 0..3 {
            starts.push(journal.submit_record(extent_record(tag, 1)).await.unwrap());
        }
        let tail = starts[2].write_result.start_seq;
        journal.update_journal_tail(tail, tail).await.unwrap();

        let wrapped = journal.submit_record(extent_record(9, 2)).await.unwrap();
        assert_eq!(
            wrapped.write_result.start_seq,
            JournalSeq::new(SegmentSeq(1), Paddr::block(DeviceId::new(1), BLOCK))
        );
        journal.close().await.unwrap();

        let restarted = fixture.restart();
        let log = ReplayLog::collect(&restarted).await.unwrap();
        assert_eq!(log.starts(), vec![tail, wrapped.write_result.start_seq]);
        assert_eq!(
            log.deltas(),
            vec![Bytes::from(vec![2u8; 16]), Bytes::from(vec![9u8; 16])]
        );
        let mount = restarted.open_for_mount().await.unwrap();
        assert_eq!(mount, journal.written_to());
    }

    #[tokio::test]
    async fn circular_mount_recovers_header() {
        let fixture = CbjFixture::mkfs(32).await;
        fixture.journal.close().await.unwrap();
        let restarted = fixture.restart();
        restarted.open_for_mount().await.unwrap();
        let header = restarted.current_header().unwrap();
        assert_eq!(header.size, fixture.config.total_size);
        assert_eq!(header.block_size, fixture.config.block_size);
        assert_eq!(header.device_id, fixture.config.device_id);
    }
}

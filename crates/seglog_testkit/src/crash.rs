//! Crash recovery testing for the segmented journal.
//!
//! This module simulates crashes at various points of the write path and
//! verifies that a restarted journal replays exactly the acknowledged
//! records and keeps writing after them.
//!
//! ## Test Strategy
//!
//! 1. **Crash after acknowledgement** - The open segment has no tail
//! 2. **Torn last group** - The last group's metadata never landed
//! 3. **Trailing garbage** - Junk follows the last valid group
//! 4. **Crash after roll** - The newest segment holds only its header
//!
//! ## Usage
//!
//! ```rust,ignore
//! use seglog_testkit::crash::{CrashPoint, CrashRecoveryHarness};
//!
//! let harness = CrashRecoveryHarness::new(SubmitterConfig::default(), 8);
//! let result = harness.run(CrashPoint::TornLastGroup, 10).await;
//! assert!(result.passed, "{result:?}");
//! ```

use crate::fixtures::{delta_record, ReplayLog, SegmentedFixture};
use bytes::Bytes;
use seglog_core::{Journal, RecordLocator, SubmitterConfig};

/// Points at which a crash can be simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// Crash after every write was acknowledged.
    AfterAck,
    /// Crash while the last group's metadata was being written.
    TornLastGroup,
    /// Crash with stale bytes following the last group.
    TrailingGarbage,
    /// Crash right after a segment roll.
    AfterRoll,
}

impl CrashPoint {
    /// Every crash point.
    pub const ALL: [CrashPoint; 4] = [
        CrashPoint::AfterAck,
        CrashPoint::TornLastGroup,
        CrashPoint::TrailingGarbage,
        CrashPoint::AfterRoll,
    ];
}

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// Records expected after recovery.
    pub expected_records: usize,
    /// Records actually replayed.
    pub actual_records: usize,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    /// Creates a passing result.
    pub fn pass(description: &str, records: usize) -> Self {
        Self {
            passed: true,
            description: description.to_string(),
            expected_records: records,
            actual_records: records,
            error: None,
        }
    }

    /// Creates a failing result.
    pub fn fail(description: &str, expected: usize, actual: usize, error: &str) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            expected_records: expected,
            actual_records: actual,
            error: Some(error.to_string()),
        }
    }
}

/// Drives a segmented journal into a crash and recovers it.
#[derive(Debug, Clone)]
pub struct CrashRecoveryHarness {
    config: SubmitterConfig,
    num_segments: u32,
}

impl CrashRecoveryHarness {
    /// Creates a harness whose journals use `config` over `num_segments`
    /// segments.
    pub fn new(config: SubmitterConfig, num_segments: u32) -> Self {
        Self {
            config,
            num_segments,
        }
    }

    /// Writes `num_records` records, crashes at `point`, restarts and
    /// checks the replay.
    pub async fn run(&self, point: CrashPoint, num_records: usize) -> CrashRecoveryResult {
        let description = format!("{point:?} after {num_records} records");
        let fixture = SegmentedFixture::mkfs(self.config.clone(), self.num_segments).await;

        let mut locators: Vec<RecordLocator> = Vec::with_capacity(num_records);
        let mut deltas = Vec::with_capacity(num_records);
        for i in 0..num_records {
            let tag = (i % 251) as u8;
            match fixture.journal.submit_record(delta_record(tag, 48)).await {
                Ok(locator) => locators.push(locator),
                Err(e) => {
                    return CrashRecoveryResult::fail(&description, num_records, 0, &e.to_string())
                }
            }
            deltas.push(Bytes::from(vec![tag; 48]));
        }

        let expected = match self.crash(&fixture, point, &locators).await {
            Ok(lost) => num_records - lost,
            Err(e) => return CrashRecoveryResult::fail(&description, num_records, 0, &e),
        };

        let restarted = fixture.restart();
        let log = match ReplayLog::collect(&restarted.journal).await {
            Ok(log) => log,
            Err(e) => {
                return CrashRecoveryResult::fail(&description, expected, 0, &e.to_string())
            }
        };
        let actual = log.num_records();
        if actual != expected {
            return CrashRecoveryResult::fail(
                &description,
                expected,
                actual,
                "record count mismatch",
            );
        }
        if log.deltas()[..] != deltas[..expected] {
            return CrashRecoveryResult::fail(&description, expected, actual, "delta mismatch");
        }

        if let Err(e) = restarted.journal.open_for_mount().await {
            return CrashRecoveryResult::fail(&description, expected, actual, &e.to_string());
        }
        match restarted.journal.submit_record(delta_record(0xEE, 48)).await {
            Ok(locator) => {
                let newest = log.starts().into_iter().max();
                if newest.is_some_and(|seq| locator.write_result.start_seq <= seq) {
                    return CrashRecoveryResult::fail(
                        &description,
                        expected,
                        actual,
                        "new write does not follow replayed records",
                    );
                }
            }
            Err(e) => {
                return CrashRecoveryResult::fail(&description, expected, actual, &e.to_string())
            }
        }
        CrashRecoveryResult::pass(&description, actual)
    }

    /// Runs every crash point.
    pub async fn run_all(&self, num_records: usize) -> Vec<CrashRecoveryResult> {
        let mut results = Vec::with_capacity(CrashPoint::ALL.len());
        for point in CrashPoint::ALL {
            results.push(self.run(point, num_records).await);
        }
        results
    }

    /// Applies the crash and returns how many acknowledged records it
    /// destroys.
    async fn crash(
        &self,
        fixture: &SegmentedFixture,
        point: CrashPoint,
        locators: &[RecordLocator],
    ) -> Result<usize, String> {
        match point {
            CrashPoint::AfterAck => Ok(0),
            CrashPoint::TornLastGroup => {
                let Some(last) = locators.last() else {
                    return Ok(0);
                };
                let (segment, offset) = last
                    .write_result
                    .start_seq
                    .offset
                    .as_segment()
                    .ok_or("locator is not in a segment")?;
                fixture
                    .device
                    .corrupt(segment, offset, &[0xFF; 64])
                    .map_err(|e| e.to_string())?;
                Ok(1)
            }
            CrashPoint::TrailingGarbage => {
                let allocator = fixture.journal.submitter().allocator();
                let written_to = allocator.written_to();
                let Some((segment, offset)) = written_to.offset.as_segment() else {
                    return Err("no open segment".to_string());
                };
                if offset + 2 * allocator.block_size()
                    <= allocator.segment_manager_group().segment_size()
                {
                    fixture
                        .device
                        .corrupt(segment, offset, &[0xAB; 512])
                        .map_err(|e| e.to_string())?;
                }
                Ok(0)
            }
            CrashPoint::AfterRoll => {
                fixture
                    .journal
                    .submitter()
                    .roll_segment()
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(0)
            }
        }
    }
}

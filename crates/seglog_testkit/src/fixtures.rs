//! Test fixtures and journal helpers.
//!
//! Provides convenience functions for setting up journals over in-memory
//! and file-backed devices, building records, and collecting replays.

use bytes::Bytes;
use seglog_core::{
    try_decode_record_deltas, CbjConfig, CircularBoundedJournal, FifoSegmentProvider,
    InMemoryTrimmer, Journal, JournalResult, JournalSeq, Record, RecordGroupHeader,
    RecordLocator, SegmentManagerGroup, SegmentedJournal, SubmitterConfig,
};
use seglog_device::{
    DeviceId, FileBlockDevice, InMemoryBlockDevice, InMemorySegmentManager, RandomBlockDevice,
    SegmentManager,
};
use std::sync::Arc;
use tempfile::TempDir;

/// Block size used by the fixtures.
pub const TEST_BLOCK_SIZE: u32 = 4096;

/// Segment size used by the fixtures.
pub const TEST_SEGMENT_SIZE: u32 = 16 * TEST_BLOCK_SIZE;

/// Installs a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to `warn`.
pub fn init_test_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// A record carrying one delta of `len` bytes filled with `tag`.
pub fn delta_record(tag: u8, len: usize) -> Record {
    Record::new(Vec::new(), vec![Bytes::from(vec![tag; len])], u64::from(tag))
}

/// A record carrying `blocks` data blocks filled with `tag` and a short
/// delta naming the tag.
pub fn extent_record(tag: u8, blocks: usize) -> Record {
    Record::new(
        vec![Bytes::from(vec![tag; blocks * TEST_BLOCK_SIZE as usize])],
        vec![Bytes::from(vec![tag; 16])],
        u64::from(tag),
    )
}

/// One record group delivered by a replay.
#[derive(Debug, Clone)]
pub struct ReplayedGroup {
    /// Where the group was found.
    pub locator: RecordLocator,
    /// The group header.
    pub header: RecordGroupHeader,
    /// Deltas of each record in the group.
    pub deltas: Vec<Vec<Bytes>>,
}

/// Everything a replay delivered, in delivery order.
#[derive(Debug, Clone, Default)]
pub struct ReplayLog {
    /// Delivered groups.
    pub groups: Vec<ReplayedGroup>,
}

impl ReplayLog {
    /// Replays `journal` and records every delivered group.
    pub async fn collect(journal: &dyn Journal) -> JournalResult<Self> {
        let mut groups = Vec::new();
        journal
            .replay(&mut |locator: RecordLocator, header: &RecordGroupHeader, md: &Bytes| {
                let deltas = try_decode_record_deltas(header, md, locator.record_block_base)
                    .map(|records| records.into_iter().map(|r| r.deltas).collect())
                    .unwrap_or_default();
                groups.push(ReplayedGroup {
                    locator,
                    header: *header,
                    deltas,
                });
                Ok(())
            })
            .await?;
        Ok(Self { groups })
    }

    /// Number of records across all groups.
    pub fn num_records(&self) -> usize {
        self.groups.iter().map(|g| g.header.records as usize).sum()
    }

    /// Start position of each group.
    pub fn starts(&self) -> Vec<JournalSeq> {
        self.groups
            .iter()
            .map(|g| g.locator.write_result.start_seq)
            .collect()
    }

    /// Every delta, flattened in replay order.
    pub fn deltas(&self) -> Vec<Bytes> {
        self.groups
            .iter()
            .flat_map(|g| g.deltas.iter().flatten().cloned())
            .collect()
    }
}

/// A segmented journal over one in-memory segment device.
pub struct SegmentedFixture {
    /// The device; clones share its contents.
    pub device: InMemorySegmentManager,
    /// The journal instance.
    pub journal: SegmentedJournal,
    /// The trimmer the journal reports to.
    pub trimmer: Arc<InMemoryTrimmer>,
    config: SubmitterConfig,
}

impl SegmentedFixture {
    /// Creates a journal on a fresh device without opening it.
    pub fn new(config: SubmitterConfig, num_segments: u32) -> Self {
        let device = InMemorySegmentManager::new(
            DeviceId::new(0),
            TEST_BLOCK_SIZE,
            TEST_SEGMENT_SIZE,
            num_segments,
        );
        Self::on_device(device, config)
    }

    /// Creates and opens a journal on a fresh device.
    pub async fn mkfs(config: SubmitterConfig, num_segments: u32) -> Self {
        let fixture = Self::new(config, num_segments);
        fixture
            .journal
            .open_for_mkfs()
            .await
            .expect("Failed to mkfs journal");
        fixture
    }

    /// Creates an unopened journal over an existing device.
    pub fn on_device(device: InMemorySegmentManager, config: SubmitterConfig) -> Self {
        let group = SegmentManagerGroup::new(vec![Arc::new(device.clone()) as Arc<dyn SegmentManager>])
            .expect("Failed to build segment group");
        let provider = Arc::new(FifoSegmentProvider::new(Arc::new(group)));
        let trimmer = Arc::new(InMemoryTrimmer::new());
        let journal = SegmentedJournal::new(provider, trimmer.clone(), &config)
            .expect("Failed to create journal");
        Self {
            device,
            journal,
            trimmer,
            config,
        }
    }

    /// A new, unopened journal over the same device, as after a restart.
    pub fn restart(&self) -> Self {
        Self::on_device(self.device.clone(), self.config.clone())
    }
}

/// A circular journal over an in-memory block device.
pub struct CbjFixture {
    /// The device; clones share its contents.
    pub device: InMemoryBlockDevice,
    /// The journal instance.
    pub journal: CircularBoundedJournal,
    /// The configuration the journal was created with.
    pub config: CbjConfig,
}

impl CbjFixture {
    /// Creates, formats and opens a journal of `blocks` blocks.
    pub async fn mkfs(blocks: u64) -> Self {
        let size = blocks * u64::from(TEST_BLOCK_SIZE);
        let device = InMemoryBlockDevice::new(DeviceId::new(1), TEST_BLOCK_SIZE, size);
        let config = CbjConfig::new()
            .block_size(TEST_BLOCK_SIZE)
            .total_size(size)
            .device_id(DeviceId::new(1));
        let journal = circular_on(Arc::new(device.clone()));
        journal.mkfs(&config).await.expect("Failed to mkfs journal");
        journal
            .open_for_mkfs()
            .await
            .expect("Failed to open journal for mkfs");
        Self {
            device,
            journal,
            config,
        }
    }

    /// A new, unopened journal over the same device, as after a restart.
    pub fn restart(&self) -> CircularBoundedJournal {
        circular_on(Arc::new(self.device.clone()))
    }
}

/// A circular journal over a file in a temporary directory.
pub struct FileCbjFixture {
    /// The device file.
    pub device: FileBlockDevice,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: TempDir,
}

impl FileCbjFixture {
    /// Creates a device file of `blocks` blocks.
    pub fn new(blocks: u64) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("journal.bin");
        let device = FileBlockDevice::create(
            &path,
            DeviceId::new(2),
            TEST_BLOCK_SIZE,
            blocks * u64::from(TEST_BLOCK_SIZE),
        )
        .expect("Failed to create device file");
        Self {
            device,
            _temp_dir: temp_dir,
        }
    }

    /// Configuration covering the whole file.
    pub fn config(&self) -> CbjConfig {
        CbjConfig::new()
            .block_size(TEST_BLOCK_SIZE)
            .total_size(self.device.size())
            .device_id(DeviceId::new(2))
    }

    /// A new, unopened journal over the file.
    pub fn journal(&self) -> CircularBoundedJournal {
        circular_on(Arc::new(self.device.clone()))
    }
}

fn circular_on(device: Arc<dyn RandomBlockDevice>) -> CircularBoundedJournal {
    CircularBoundedJournal::new(device, Arc::new(InMemoryTrimmer::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn segmented_fixture_replays_after_restart() {
        let fixture = SegmentedFixture::mkfs(SubmitterConfig::default(), 4).await;
        fixture
            .journal
            .submit_record(delta_record(1, 32))
            .await
            .unwrap();
        fixture.journal.close().await.unwrap();

        let restarted = fixture.restart();
        let log = ReplayLog::collect(&restarted.journal).await.unwrap();
        assert_eq!(log.num_records(), 1);
        assert_eq!(log.deltas(), vec![Bytes::from(vec![1u8; 32])]);
    }

    #[tokio::test]
    async fn cbj_fixture_is_open() {
        let fixture = CbjFixture::mkfs(16).await;
        assert_eq!(
            fixture.journal.total_size().unwrap(),
            15 * u64::from(TEST_BLOCK_SIZE)
        );
    }

    #[tokio::test]
    async fn file_fixture_survives_restart() {
        let fixture = FileCbjFixture::new(16);
        let journal = fixture.journal();
        journal.mkfs(&fixture.config()).await.unwrap();
        journal.open_for_mkfs().await.unwrap();
        journal.submit_record(extent_record(5, 1)).await.unwrap();
        journal.close().await.unwrap();

        let log = ReplayLog::collect(&fixture.journal()).await.unwrap();
        assert_eq!(log.num_records(), 1);
    }

    #[test]
    fn record_helpers_are_aligned() {
        assert!(extent_record(1, 2).check_alignment(TEST_BLOCK_SIZE).is_ok());
        assert_eq!(delta_record(1, 10).size().dlength, 0);
    }
}

//! The open segment of one write stream.

use crate::error::{JournalError, JournalResult};
use crate::record::Record;
use crate::segment::{SegmentHeader, SegmentManagerGroup, SegmentProvider, SegmentSeqAllocator, SegmentTail};
use crate::trimmer::JournalTrimmer;
use crate::types::{
    DataCategory, JournalSeq, Paddr, ReclaimGen, SegmentNonce, SegmentSeq, SegmentType, WriteResult,
    JOURNAL_SEQ_NULL,
};
use bytes::Bytes;
use parking_lot::Mutex;
use seglog_device::{SegmentId, SegmentRef};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, trace};
use uuid::Uuid;

/// Derives the nonce stamped into every record group of a segment.
#[must_use]
pub fn segment_nonce(seq: SegmentSeq, store_id: &Uuid) -> SegmentNonce {
    let mut hasher = crc32fast::Hasher::new_with_initial(seq.as_u32());
    hasher.update(store_id.as_bytes());
    hasher.finalize()
}

struct AllocatorState {
    print_name: String,
    current: Option<SegmentRef>,
    current_seq: SegmentSeq,
    written_to: u32,
    nonce: SegmentNonce,
}

impl std::fmt::Debug for AllocatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatorState")
            .field("print_name", &self.print_name)
            .field("segment", &self.current.as_ref().map(|s| s.segment_id()))
            .field("current_seq", &self.current_seq)
            .field("written_to", &self.written_to)
            .field("nonce", &self.nonce)
            .finish()
    }
}

impl AllocatorState {
    fn reset(&mut self) {
        self.current = None;
        self.written_to = 0;
        self.nonce = 0;
    }
}

/// Decrements the in-flight write count when a write finishes or is dropped.
struct InflightGuard(Arc<watch::Sender<usize>>);

impl InflightGuard {
    fn new(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(Arc::clone(counter))
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n -= 1);
    }
}

/// Owns the open segment of one (category, generation) stream.
///
/// The write cursor advances when a write is issued, not when it
/// completes, so several writes may be in flight at once. Callers check
/// [`SegmentAllocator::needs_roll`] before writing.
pub struct SegmentAllocator {
    trimmer: Option<Arc<dyn JournalTrimmer>>,
    seg_type: SegmentType,
    category: DataCategory,
    generation: ReclaimGen,
    provider: Arc<dyn SegmentProvider>,
    group: Arc<SegmentManagerGroup>,
    seq_allocator: Arc<SegmentSeqAllocator>,
    state: Mutex<AllocatorState>,
    inflight: Arc<watch::Sender<usize>>,
}

impl std::fmt::Debug for SegmentAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SegmentAllocator")
            .field("name", &state.print_name)
            .field("segment", &state.current.as_ref().map(|s| s.segment_id()))
            .field("written_to", &state.written_to)
            .finish_non_exhaustive()
    }
}

impl SegmentAllocator {
    /// Creates an allocator.
    ///
    /// With a trimmer the stream writes journal segments, otherwise
    /// out-of-line segments.
    #[must_use]
    pub fn new(
        trimmer: Option<Arc<dyn JournalTrimmer>>,
        category: DataCategory,
        generation: ReclaimGen,
        provider: Arc<dyn SegmentProvider>,
        seq_allocator: Arc<SegmentSeqAllocator>,
    ) -> Self {
        let seg_type = if trimmer.is_some() {
            SegmentType::Journal
        } else {
            SegmentType::Ool
        };
        let (inflight, _) = watch::channel(0);
        Self {
            trimmer,
            seg_type,
            category,
            generation,
            group: provider.segment_manager_group(),
            provider,
            seq_allocator,
            state: Mutex::new(AllocatorState {
                print_name: format!("{category}_G{generation}"),
                current: None,
                current_seq: SegmentSeq(0),
                written_to: 0,
                nonce: 0,
            }),
            inflight: Arc::new(inflight),
        }
    }

    /// Name used in log lines, such as `D0_D1_METADATA_G0`.
    #[must_use]
    pub fn print_name(&self) -> String {
        self.state.lock().print_name.clone()
    }

    /// Kind of segment this stream writes.
    #[must_use]
    pub const fn seg_type(&self) -> SegmentType {
        self.seg_type
    }

    /// Block size of the underlying devices.
    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.group.block_size()
    }

    /// Largest record group a fresh segment can hold.
    #[must_use]
    pub fn max_write_length(&self) -> u32 {
        self.group.segment_size()
            - self.group.rounded_header_length()
            - self.group.rounded_tail_length()
    }

    /// Returns true while a segment is open.
    #[must_use]
    pub fn can_write(&self) -> bool {
        self.state.lock().current.is_some()
    }

    /// The open segment, if any.
    #[must_use]
    pub fn segment_id(&self) -> Option<SegmentId> {
        self.state.lock().current.as_ref().map(|s| s.segment_id())
    }

    /// Nonce of the open segment.
    #[must_use]
    pub fn nonce(&self) -> SegmentNonce {
        self.state.lock().nonce
    }

    /// Position the next write will start at.
    #[must_use]
    pub fn written_to(&self) -> JournalSeq {
        let state = self.state.lock();
        match &state.current {
            Some(segment) => JournalSeq::new(
                state.current_seq,
                Paddr::segment(segment.segment_id(), state.written_to),
            ),
            None => JOURNAL_SEQ_NULL,
        }
    }

    /// Returns the devices this stream writes to.
    #[must_use]
    pub fn segment_manager_group(&self) -> &Arc<SegmentManagerGroup> {
        &self.group
    }

    /// Reports a record's modify time to the provider.
    pub fn update_modify_time(&self, record: &Record) {
        if let Some(id) = self.segment_id() {
            self.provider
                .update_modify_time(id, record.modify_time(), record.extents().len() as u64);
        }
    }

    /// Opens the first segment of the stream.
    ///
    /// Returns the position of the first record group.
    ///
    /// # Errors
    ///
    /// Returns `NoEntity` if no segment is free, `InvalidArgument` if the
    /// trimmer tails do not match `is_mkfs`, or the device error.
    pub async fn open(&self, is_mkfs: bool) -> JournalResult<JournalSeq> {
        {
            let mut state = self.state.lock();
            let devices: String = self
                .group
                .device_ids()
                .iter()
                .map(|d| format!("{d}_"))
                .collect();
            state.print_name = format!("{devices}{}_G{}", self.category, self.generation);
            debug!("{}", state.print_name);
        }
        self.do_open(is_mkfs).await
    }

    async fn do_open(&self, is_mkfs: bool) -> JournalResult<JournalSeq> {
        let name = self.print_name();
        if self.can_write() {
            return Err(JournalError::invalid_argument(format!(
                "{name} already has an open segment"
            )));
        }

        match (&self.trimmer, is_mkfs) {
            (Some(trimmer), true) => {
                if !trimmer.dirty_tail().is_null() || !trimmer.alloc_tail().is_null() {
                    return Err(JournalError::invalid_argument(format!(
                        "{name} mkfs found existing journal tails"
                    )));
                }
            }
            (Some(trimmer), false) => {
                if trimmer.dirty_tail().is_null() || trimmer.alloc_tail().is_null() {
                    return Err(JournalError::invalid_argument(format!(
                        "{name} journal tails are unset"
                    )));
                }
            }
            (None, true) => {
                return Err(JournalError::invalid_argument(format!(
                    "{name} out-of-line stream cannot mkfs"
                )));
            }
            (None, false) => {}
        }

        let new_segment_seq = self.seq_allocator.get_and_inc_next_segment_seq();
        let nonce = segment_nonce(new_segment_seq, &self.group.meta().seastore_id);
        let segment_id = self
            .provider
            .allocate_segment(new_segment_seq, self.seg_type, self.category, self.generation)
            .ok_or_else(|| JournalError::no_entity(format!("{name} found no free segment")))?;
        let segment = self.group.open(segment_id).await?;

        let (dirty_tail, alloc_tail) = match &self.trimmer {
            Some(trimmer) if is_mkfs => {
                let mkfs_seq = JournalSeq::new(new_segment_seq, Paddr::segment(segment_id, 0));
                trimmer.update_journal_tails(mkfs_seq, mkfs_seq);
                (mkfs_seq, mkfs_seq)
            }
            Some(trimmer) => (trimmer.dirty_tail(), trimmer.alloc_tail()),
            None => (JOURNAL_SEQ_NULL, JOURNAL_SEQ_NULL),
        };

        let header = SegmentHeader {
            segment_seq: new_segment_seq,
            physical_segment_id: segment_id,
            dirty_tail,
            alloc_tail,
            segment_nonce: nonce,
            seg_type: self.seg_type,
            category: self.category,
            generation: self.generation,
        };
        info!("{name} writing header {header}");
        let header_length = self.group.rounded_header_length();
        segment
            .write(0, header.encode_block(header_length))
            .await?;

        let new_journal_seq =
            JournalSeq::new(new_segment_seq, Paddr::segment(segment_id, header_length));
        {
            let mut state = self.state.lock();
            state.current = Some(segment);
            state.current_seq = new_segment_seq;
            state.written_to = header_length;
            state.nonce = nonce;
        }
        self.provider
            .update_segment_avail_bytes(self.seg_type, new_journal_seq.offset);
        debug!("{name} rolled new segment id={segment_id}");
        Ok(new_journal_seq)
    }

    /// Returns true if `length` more bytes do not fit in front of the tail
    /// block of the open segment.
    #[must_use]
    pub fn needs_roll(&self, length: u64) -> bool {
        let state = self.state.lock();
        match &state.current {
            Some(segment) => {
                let write_capacity =
                    segment.write_capacity() - self.group.rounded_tail_length();
                length + u64::from(state.written_to) > u64::from(write_capacity)
            }
            None => true,
        }
    }

    /// Issues a write of `data` at the cursor and advances the cursor.
    ///
    /// The cursor moves before this returns; the returned future performs
    /// the device write.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if no segment is open or `data` does not
    /// fit. The future returns the device error if the write fails.
    pub fn write(
        &self,
        data: Bytes,
    ) -> JournalResult<impl Future<Output = JournalResult<WriteResult>> + Send + 'static> {
        let length = data.len() as u64;
        if self.needs_roll(length) {
            return Err(JournalError::invalid_argument(format!(
                "{} cannot write {length:#x} bytes without a roll",
                self.print_name()
            )));
        }
        let mut state = self.state.lock();
        let Some(segment) = state.current.clone() else {
            return Err(JournalError::invalid_argument(format!(
                "{} has no open segment",
                state.print_name
            )));
        };
        let segment_id = segment.segment_id();
        let start_offset = state.written_to;
        let result = WriteResult {
            start_seq: JournalSeq::new(state.current_seq, Paddr::segment(segment_id, start_offset)),
            length,
        };
        trace!("{} {}~{length:#x}", state.print_name, result.start_seq);
        state.written_to += length as u32;
        self.provider
            .update_segment_avail_bytes(self.seg_type, Paddr::segment(segment_id, state.written_to));
        drop(state);

        let guard = InflightGuard::new(&self.inflight);
        Ok(async move {
            let _guard = guard;
            segment.write(start_offset, data).await?;
            Ok(result)
        })
    }

    /// Closes the open segment and opens the next one.
    ///
    /// # Errors
    ///
    /// Returns an error if closing or opening fails.
    pub async fn roll(&self) -> JournalResult<()> {
        self.close_segment().await?;
        self.do_open(false).await.map(|_| ())
    }

    /// Closes the open segment, if any.
    ///
    /// # Errors
    ///
    /// Returns the device error if the tail cannot be written.
    pub async fn close(&self) -> JournalResult<()> {
        let result = if self.can_write() {
            debug!("{} close current segment", self.print_name());
            self.close_segment().await
        } else {
            info!("{} no current segment", self.print_name());
            Ok(())
        };
        self.state.lock().reset();
        result
    }

    async fn close_segment(&self) -> JournalResult<()> {
        let (segment, nonce, written_to, name) = {
            let mut state = self.state.lock();
            let Some(segment) = state.current.take() else {
                return Err(JournalError::invalid_argument(format!(
                    "{} has no segment to close",
                    state.print_name
                )));
            };
            (segment, state.nonce, state.written_to, state.print_name.clone())
        };
        self.state.lock().reset();

        // writes issued to the segment must land before its tail
        let mut inflight = self.inflight.subscribe();
        inflight
            .wait_for(|n| *n == 0)
            .await
            .map_err(|e| JournalError::io(format!("{name} in-flight tracking lost: {e}")))?;

        let segment_id = segment.segment_id();
        let info = self.provider.seg_info(segment_id).ok_or_else(|| {
            JournalError::no_entity(format!("{name} provider does not know {segment_id}"))
        })?;
        let tail = SegmentTail {
            segment_seq: info.seq,
            physical_segment_id: segment_id,
            segment_nonce: nonce,
            seg_type: self.seg_type,
            modify_time: info.modify_time,
            num_extents: info.num_extents,
        };
        info!("{name} close segment {tail}, written_to={written_to:#x}");

        let tail_offset = self.group.segment_size() - self.group.rounded_tail_length();
        segment.advance_wp(tail_offset).await?;
        segment
            .write(tail_offset, tail.encode_block(self.group.rounded_tail_length()))
            .await?;
        segment.close().await?;
        self.provider.close_segment(segment_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{encode_records, RecordGroup};
    use crate::segment::FifoSegmentProvider;
    use crate::trimmer::InMemoryTrimmer;
    use seglog_device::{DeviceId, InMemorySegmentManager, SegmentManager, SegmentState};

    const BLOCK: u32 = 4096;
    const SEGMENT: u32 = 8 * BLOCK;

    struct Fixture {
        device: InMemorySegmentManager,
        trimmer: Arc<InMemoryTrimmer>,
        provider: Arc<FifoSegmentProvider>,
        allocator: SegmentAllocator,
    }

    fn fixture() -> Fixture {
        let device = InMemorySegmentManager::new(DeviceId::new(0), BLOCK, SEGMENT, 4);
        let group = SegmentManagerGroup::new(vec![Arc::new(device.clone()) as Arc<dyn SegmentManager>])
            .unwrap();
        let provider = Arc::new(FifoSegmentProvider::new(Arc::new(group)));
        let trimmer = Arc::new(InMemoryTrimmer::new());
        let allocator = SegmentAllocator::new(
            Some(trimmer.clone()),
            DataCategory::Metadata,
            ReclaimGen(0),
            provider.clone(),
            Arc::new(SegmentSeqAllocator::new()),
        );
        Fixture {
            device,
            trimmer,
            provider,
            allocator,
        }
    }

    fn blocks(n: u32) -> Bytes {
        Bytes::from(vec![0xAB; (n * BLOCK) as usize])
    }

    fn seg(n: u32) -> SegmentId {
        SegmentId::new(DeviceId::new(0), n)
    }

    #[tokio::test]
    async fn mkfs_open_writes_header_and_sets_tails() {
        let f = fixture();
        let start = f.allocator.open(true).await.unwrap();
        assert_eq!(start, JournalSeq::new(SegmentSeq(0), Paddr::segment(seg(0), BLOCK)));
        assert_eq!(f.allocator.print_name(), "D0_METADATA_G0");

        let mkfs_seq = JournalSeq::new(SegmentSeq(0), Paddr::segment(seg(0), 0));
        assert_eq!(f.trimmer.dirty_tail(), mkfs_seq);

        let group = f.allocator.segment_manager_group();
        let header = group.read_segment_header(seg(0)).await.unwrap();
        assert_eq!(header.dirty_tail, mkfs_seq);
        assert_eq!(header.segment_nonce, f.allocator.nonce());
        assert_eq!(header.seg_type, SegmentType::Journal);
    }

    #[tokio::test]
    async fn mount_open_requires_tails() {
        let f = fixture();
        assert!(matches!(
            f.allocator.open(false).await,
            Err(JournalError::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn needs_roll_boundary() {
        let f = fixture();
        assert!(f.allocator.needs_roll(0));
        f.allocator.open(true).await.unwrap();

        // header and tail take one block each
        let remaining = u64::from(SEGMENT - 2 * BLOCK);
        assert_eq!(u64::from(f.allocator.max_write_length()), remaining);
        assert!(!f.allocator.needs_roll(remaining));
        assert!(f.allocator.needs_roll(remaining + 1));
    }

    #[tokio::test]
    async fn write_advances_cursor_at_issue() {
        let f = fixture();
        f.allocator.open(true).await.unwrap();

        let first = f.allocator.write(blocks(1)).unwrap();
        let second = f.allocator.write(blocks(2)).unwrap();
        assert_eq!(
            f.allocator.written_to().offset,
            Paddr::segment(seg(0), 4 * BLOCK)
        );

        // complete out of order
        let second = second.await.unwrap();
        let first = first.await.unwrap();
        assert_eq!(first.start_seq.offset, Paddr::segment(seg(0), BLOCK));
        assert_eq!(second.start_seq.offset, Paddr::segment(seg(0), 2 * BLOCK));
        assert_eq!(second.length, u64::from(2 * BLOCK));
        assert_eq!(f.provider.seg_info(seg(0)).unwrap().written_to, 4 * BLOCK);

        // one block of the 8-block segment is reserved for the tail
        assert!(f.allocator.write(blocks(4)).is_err());
        assert_eq!(
            f.allocator.written_to().offset,
            Paddr::segment(seg(0), 4 * BLOCK)
        );
        let exact = f.allocator.write(blocks(3)).unwrap().await.unwrap();
        assert_eq!(exact.start_seq.offset, Paddr::segment(seg(0), 4 * BLOCK));
        assert!(f.allocator.write(blocks(1)).is_err());
    }

    #[test]
    fn state_debug_names_the_open_segment() {
        let f = fixture();
        let state = format!("{:?}", f.allocator.state.lock());
        assert!(state.contains("segment: None"), "{state}");
    }

    #[tokio::test]
    async fn roll_closes_with_tail_and_opens_next() {
        let f = fixture();
        f.allocator.open(true).await.unwrap();
        let group = RecordGroup::from_record(
            Record::new(vec![blocks(1)], Vec::new(), 42),
            BLOCK,
        );
        f.allocator.update_modify_time(&group.records()[0]);
        let encoded = encode_records(&group, JOURNAL_SEQ_NULL, f.allocator.nonce()).unwrap();
        f.allocator.write(encoded).unwrap().await.unwrap();

        f.allocator.roll().await.unwrap();
        assert_eq!(f.allocator.segment_id(), Some(seg(1)));
        assert_eq!(f.device.segment_state(seg(0)).unwrap(), SegmentState::Closed);

        let tail = f
            .allocator
            .segment_manager_group()
            .read_segment_tail(seg(0))
            .await
            .unwrap();
        assert_eq!(tail.segment_seq, SegmentSeq(0));
        assert_eq!(tail.modify_time, 42);
        assert_eq!(tail.num_extents, 1);

        // the new segment keeps the journal tails from mkfs
        let header = f
            .allocator
            .segment_manager_group()
            .read_segment_header(seg(1))
            .await
            .unwrap();
        assert_eq!(header.segment_seq, SegmentSeq(1));
        assert_eq!(header.dirty_tail, f.trimmer.dirty_tail());
        assert_ne!(header.segment_nonce, tail.segment_nonce);
    }

    #[tokio::test]
    async fn roll_waits_for_inflight_writes() {
        let f = fixture();
        f.allocator.open(true).await.unwrap();
        f.device.faults().hold_writes();
        let write = tokio::spawn(f.allocator.write(blocks(1)).unwrap());

        let allocator = Arc::new(f.allocator);
        let roller = {
            let allocator = Arc::clone(&allocator);
            tokio::spawn(async move { allocator.roll().await })
        };
        tokio::task::yield_now().await;
        assert!(!roller.is_finished());

        f.device.faults().release_writes();
        write.await.unwrap().unwrap();
        roller.await.unwrap().unwrap();
        assert_eq!(allocator.segment_id(), Some(seg(1)));
    }

    #[tokio::test]
    async fn exhausted_provider_fails_roll() {
        let f = fixture();
        f.allocator.open(true).await.unwrap();
        for _ in 0..3 {
            f.allocator.roll().await.unwrap();
        }
        assert!(matches!(
            f.allocator.roll().await,
            Err(JournalError::NoEntity { .. })
        ));
        assert!(!f.allocator.can_write());
    }

    #[tokio::test]
    async fn close_writes_tail_and_resets() {
        let f = fixture();
        f.allocator.open(true).await.unwrap();
        f.allocator.close().await.unwrap();
        assert!(!f.allocator.can_write());
        assert!(f.allocator.written_to().is_null());
        assert_eq!(f.device.segment_state(seg(0)).unwrap(), SegmentState::Closed);
        // closing twice is harmless
        f.allocator.close().await.unwrap();
    }

    #[test]
    fn nonce_depends_on_sequence() {
        let id = Uuid::new_v4();
        assert_ne!(segment_nonce(SegmentSeq(0), &id), segment_nonce(SegmentSeq(1), &id));
        assert_eq!(segment_nonce(SegmentSeq(3), &id), segment_nonce(SegmentSeq(3), &id));
    }
}

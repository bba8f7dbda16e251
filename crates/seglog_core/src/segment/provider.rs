//! Segment allocation decisions and per-segment bookkeeping.

use super::group::SegmentManagerGroup;
use crate::types::{DataCategory, Paddr, ReclaimGen, SegmentSeq, SegmentType, NULL_SEG_SEQ};
use parking_lot::Mutex;
use seglog_device::{SegmentId, SegmentState};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// What the provider knows about one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    /// The segment.
    pub id: SegmentId,
    /// Lifecycle state as seen by the provider.
    pub state: SegmentState,
    /// Sequence assigned when the segment was allocated.
    pub seq: SegmentSeq,
    /// What the segment holds.
    pub seg_type: SegmentType,
    /// Category of the owning stream.
    pub category: DataCategory,
    /// Reclaim generation of the owning stream.
    pub generation: ReclaimGen,
    /// Offset up to which writes have been issued.
    pub written_to: u32,
    /// Latest modify time of records written to the segment.
    pub modify_time: u64,
    /// Number of extents written to the segment.
    pub num_extents: u64,
}

impl SegmentInfo {
    fn empty(id: SegmentId) -> Self {
        Self {
            id,
            state: SegmentState::Empty,
            seq: NULL_SEG_SEQ,
            seg_type: SegmentType::Journal,
            category: DataCategory::Metadata,
            generation: ReclaimGen(0),
            written_to: 0,
            modify_time: 0,
            num_extents: 0,
        }
    }
}

/// Source of segments for the allocators.
///
/// Decides which segment a stream writes next and records what the
/// streams report about their segments. Reclamation is not part of this
/// interface.
pub trait SegmentProvider: Send + Sync {
    /// Picks an empty segment for a stream and marks it open.
    ///
    /// Returns `None` when no empty segment is left.
    fn allocate_segment(
        &self,
        seq: SegmentSeq,
        seg_type: SegmentType,
        category: DataCategory,
        generation: ReclaimGen,
    ) -> Option<SegmentId>;

    /// Marks a segment closed.
    fn close_segment(&self, id: SegmentId);

    /// Returns what is known about a segment.
    fn seg_info(&self, id: SegmentId) -> Option<SegmentInfo>;

    /// Records that a stream has issued writes up to `offset`.
    fn update_segment_avail_bytes(&self, seg_type: SegmentType, offset: Paddr);

    /// Records the modify time and extent count of a written record.
    fn update_modify_time(&self, id: SegmentId, modify_time: u64, num_extents: u64);

    /// Marks a segment found on disk at mount time as closed.
    fn init_mark_segment_closed(
        &self,
        id: SegmentId,
        seq: SegmentSeq,
        seg_type: SegmentType,
        category: DataCategory,
        generation: ReclaimGen,
    );

    /// Returns the devices segments are allocated from.
    fn segment_manager_group(&self) -> Arc<SegmentManagerGroup>;
}

/// Hands out empty segments in device and index order.
#[derive(Debug)]
pub struct FifoSegmentProvider {
    group: Arc<SegmentManagerGroup>,
    segments: Mutex<BTreeMap<SegmentId, SegmentInfo>>,
}

impl FifoSegmentProvider {
    /// Creates a provider that treats every segment of `group` as empty.
    #[must_use]
    pub fn new(group: Arc<SegmentManagerGroup>) -> Self {
        let segments = group
            .segment_managers()
            .flat_map(|manager| {
                let device_id = manager.device_id();
                (0..manager.num_segments()).map(move |index| SegmentId::new(device_id, index))
            })
            .map(|id| (id, SegmentInfo::empty(id)))
            .collect();
        Self {
            group,
            segments: Mutex::new(segments),
        }
    }

    /// Returns the number of segments still empty.
    #[must_use]
    pub fn num_empty(&self) -> usize {
        self.segments
            .lock()
            .values()
            .filter(|info| info.state == SegmentState::Empty)
            .count()
    }
}

impl SegmentProvider for FifoSegmentProvider {
    fn allocate_segment(
        &self,
        seq: SegmentSeq,
        seg_type: SegmentType,
        category: DataCategory,
        generation: ReclaimGen,
    ) -> Option<SegmentId> {
        let mut segments = self.segments.lock();
        let info = segments
            .values_mut()
            .find(|info| info.state == SegmentState::Empty)?;
        *info = SegmentInfo {
            state: SegmentState::Open,
            seq,
            seg_type,
            category,
            generation,
            ..SegmentInfo::empty(info.id)
        };
        info!("allocated {} seq={seq} {seg_type} {category}_G{generation}", info.id);
        Some(info.id)
    }

    fn close_segment(&self, id: SegmentId) {
        if let Some(info) = self.segments.lock().get_mut(&id) {
            info.state = SegmentState::Closed;
            debug!("closed {id}, written_to={:#x}", info.written_to);
        }
    }

    fn seg_info(&self, id: SegmentId) -> Option<SegmentInfo> {
        self.segments.lock().get(&id).copied()
    }

    fn update_segment_avail_bytes(&self, _seg_type: SegmentType, offset: Paddr) {
        if let Some((id, written_to)) = offset.as_segment() {
            if let Some(info) = self.segments.lock().get_mut(&id) {
                info.written_to = info.written_to.max(written_to);
            }
        }
    }

    fn update_modify_time(&self, id: SegmentId, modify_time: u64, num_extents: u64) {
        if let Some(info) = self.segments.lock().get_mut(&id) {
            info.modify_time = info.modify_time.max(modify_time);
            info.num_extents += num_extents;
        }
    }

    fn init_mark_segment_closed(
        &self,
        id: SegmentId,
        seq: SegmentSeq,
        seg_type: SegmentType,
        category: DataCategory,
        generation: ReclaimGen,
    ) {
        if let Some(info) = self.segments.lock().get_mut(&id) {
            *info = SegmentInfo {
                state: SegmentState::Closed,
                seq,
                seg_type,
                category,
                generation,
                ..SegmentInfo::empty(id)
            };
        }
    }

    fn segment_manager_group(&self) -> Arc<SegmentManagerGroup> {
        Arc::clone(&self.group)
    }
}

/// Next segment sequence, shared by the streams of one journal.
#[derive(Debug, Default)]
pub struct SegmentSeqAllocator {
    next: AtomicU32,
}

impl SegmentSeqAllocator {
    /// Creates an allocator starting at sequence 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next sequence and advances the counter.
    pub fn get_and_inc_next_segment_seq(&self) -> SegmentSeq {
        SegmentSeq(self.next.fetch_add(1, Ordering::SeqCst))
    }

    /// Restarts the counter, used after replay.
    pub fn set_next_segment_seq(&self, seq: SegmentSeq) {
        debug!("next segment seq set to {seq}");
        self.next.store(seq.as_u32(), Ordering::SeqCst);
    }

    /// Returns the sequence the next call will hand out.
    #[must_use]
    pub fn next_segment_seq(&self) -> SegmentSeq {
        SegmentSeq(self.next.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seglog_device::{DeviceId, InMemorySegmentManager, SegmentManager};

    fn provider() -> FifoSegmentProvider {
        let a = InMemorySegmentManager::new(DeviceId::new(0), 4096, 8 * 4096, 2);
        let b = InMemorySegmentManager::with_meta(DeviceId::new(1), 4096, 8 * 4096, 2, a.meta());
        let group =
            SegmentManagerGroup::new(vec![Arc::new(a) as Arc<dyn SegmentManager>, Arc::new(b)])
                .unwrap();
        FifoSegmentProvider::new(Arc::new(group))
    }

    fn allocate(p: &FifoSegmentProvider, seq: u32) -> Option<SegmentId> {
        p.allocate_segment(
            SegmentSeq(seq),
            SegmentType::Journal,
            DataCategory::Metadata,
            ReclaimGen(0),
        )
    }

    #[test]
    fn allocates_in_device_order_until_exhausted() {
        let p = provider();
        let ids: Vec<_> = (0..4).map(|s| allocate(&p, s).unwrap()).collect();
        assert_eq!(ids[0], SegmentId::new(DeviceId::new(0), 0));
        assert_eq!(ids[2], SegmentId::new(DeviceId::new(1), 0));
        assert!(allocate(&p, 4).is_none());
    }

    #[test]
    fn closed_segments_are_not_reallocated() {
        let p = provider();
        let id = SegmentId::new(DeviceId::new(0), 0);
        p.init_mark_segment_closed(
            id,
            SegmentSeq(7),
            SegmentType::Journal,
            DataCategory::Metadata,
            ReclaimGen(0),
        );
        assert_eq!(p.seg_info(id).unwrap().seq, SegmentSeq(7));
        assert_eq!(p.num_empty(), 3);
        assert_ne!(allocate(&p, 8).unwrap(), id);
    }

    #[test]
    fn tracks_written_to_and_modify_time() {
        let p = provider();
        let id = allocate(&p, 0).unwrap();
        p.update_segment_avail_bytes(SegmentType::Journal, Paddr::segment(id, 8192));
        p.update_segment_avail_bytes(SegmentType::Journal, Paddr::segment(id, 4096));
        p.update_modify_time(id, 10, 2);
        p.update_modify_time(id, 5, 1);
        p.close_segment(id);

        let info = p.seg_info(id).unwrap();
        assert_eq!(info.written_to, 8192);
        assert_eq!(info.modify_time, 10);
        assert_eq!(info.num_extents, 3);
        assert_eq!(info.state, SegmentState::Closed);
    }

    #[test]
    fn seq_allocator_counts_and_resets() {
        let seqs = SegmentSeqAllocator::new();
        assert_eq!(seqs.get_and_inc_next_segment_seq(), SegmentSeq(0));
        assert_eq!(seqs.get_and_inc_next_segment_seq(), SegmentSeq(1));
        seqs.set_next_segment_seq(SegmentSeq(10));
        assert_eq!(seqs.next_segment_seq(), SegmentSeq(10));
    }
}

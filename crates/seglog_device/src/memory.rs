//! In-memory devices for testing.

use crate::block::{check_range, RandomBlockDevice};
use crate::error::{DeviceError, DeviceResult};
use crate::fault::FaultInjector;
use crate::ids::{DeviceId, DeviceMeta, SegmentId};
use crate::segment::{Segment, SegmentManager, SegmentRef, SegmentState};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

#[derive(Debug)]
struct SegmentedStore {
    data: RwLock<Vec<u8>>,
    states: Mutex<Vec<SegmentState>>,
    faults: FaultInjector,
}

/// An in-memory segmented device.
///
/// All segments start empty and read back as zeroes. Cloning the manager
/// yields another handle to the same storage, which is how tests simulate
/// a restart: drop the journal, keep a clone of the device, mount again.
///
/// # Example
///
/// ```rust
/// use seglog_device::{DeviceId, InMemorySegmentManager, SegmentManager};
///
/// let sm = InMemorySegmentManager::new(DeviceId::new(0), 4096, 64 * 1024, 8);
/// assert_eq!(sm.num_segments(), 8);
/// ```
#[derive(Debug, Clone)]
pub struct InMemorySegmentManager {
    device_id: DeviceId,
    block_size: u32,
    segment_size: u32,
    num_segments: u32,
    meta: DeviceMeta,
    store: Arc<SegmentedStore>,
}

impl InMemorySegmentManager {
    /// Creates a device with a freshly generated store identity.
    #[must_use]
    pub fn new(device_id: DeviceId, block_size: u32, segment_size: u32, num_segments: u32) -> Self {
        Self::with_meta(
            device_id,
            block_size,
            segment_size,
            num_segments,
            DeviceMeta::generate(),
        )
    }

    /// Creates a device that shares `meta` with other devices of one store.
    #[must_use]
    pub fn with_meta(
        device_id: DeviceId,
        block_size: u32,
        segment_size: u32,
        num_segments: u32,
        meta: DeviceMeta,
    ) -> Self {
        debug_assert!(block_size > 0 && segment_size % block_size == 0);
        let total = segment_size as usize * num_segments as usize;
        Self {
            device_id,
            block_size,
            segment_size,
            num_segments,
            meta,
            store: Arc::new(SegmentedStore {
                data: RwLock::new(vec![0u8; total]),
                states: Mutex::new(vec![SegmentState::Empty; num_segments as usize]),
                faults: FaultInjector::new(),
            }),
        }
    }

    /// Returns the fault injector shared by every segment of this device.
    #[must_use]
    pub fn faults(&self) -> &FaultInjector {
        &self.store.faults
    }

    /// Returns the current state of a segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment is unknown.
    pub fn segment_state(&self, id: SegmentId) -> DeviceResult<SegmentState> {
        let index = self.index_of(id)?;
        Ok(self.store.states.lock()[index])
    }

    /// Overwrites bytes in place, bypassing segment state checks.
    ///
    /// Useful for simulating media corruption in recovery tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the range leaves the segment.
    pub fn corrupt(&self, id: SegmentId, offset: u32, bytes: &[u8]) -> DeviceResult<()> {
        let index = self.index_of(id)?;
        let end = offset as usize + bytes.len();
        if end > self.segment_size as usize {
            return Err(DeviceError::OutOfRange {
                offset: u64::from(offset),
                len: bytes.len(),
                size: u64::from(self.segment_size),
            });
        }
        let base = index * self.segment_size as usize + offset as usize;
        self.store.data.write()[base..base + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn index_of(&self, id: SegmentId) -> DeviceResult<usize> {
        if id.device_id() != self.device_id || id.device_segment_id() >= self.num_segments {
            return Err(DeviceError::UnknownSegment(id));
        }
        Ok(id.device_segment_id() as usize)
    }

    fn write_at(&self, index: usize, offset: u32, data: &[u8]) {
        let base = index * self.segment_size as usize + offset as usize;
        self.store.data.write()[base..base + data.len()].copy_from_slice(data);
    }
}

#[async_trait]
impl SegmentManager for InMemorySegmentManager {
    fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn segment_size(&self) -> u32 {
        self.segment_size
    }

    fn num_segments(&self) -> u32 {
        self.num_segments
    }

    fn meta(&self) -> DeviceMeta {
        self.meta
    }

    async fn open(&self, id: SegmentId) -> DeviceResult<SegmentRef> {
        let index = self.index_of(id)?;
        let mut states = self.store.states.lock();
        if states[index] != SegmentState::Empty {
            return Err(DeviceError::InvalidSegmentState {
                segment: id,
                state: states[index].as_str(),
                operation: "open",
            });
        }
        states[index] = SegmentState::Open;
        Ok(Arc::new(InMemorySegment {
            id,
            index,
            manager: self.clone(),
            write_ptr: Mutex::new(0),
        }))
    }

    async fn release(&self, id: SegmentId) -> DeviceResult<()> {
        let index = self.index_of(id)?;
        {
            let mut states = self.store.states.lock();
            if states[index] == SegmentState::Open {
                return Err(DeviceError::InvalidSegmentState {
                    segment: id,
                    state: states[index].as_str(),
                    operation: "release",
                });
            }
            states[index] = SegmentState::Empty;
        }
        let zeroes = vec![0u8; self.segment_size as usize];
        self.write_at(index, 0, &zeroes);
        Ok(())
    }

    async fn read(&self, id: SegmentId, offset: u32, len: usize) -> DeviceResult<Bytes> {
        let index = self.index_of(id)?;
        check_range(
            u64::from(offset),
            len,
            self.block_size,
            u64::from(self.segment_size),
        )?;
        let base = index * self.segment_size as usize + offset as usize;
        let data = self.store.data.read();
        Ok(Bytes::copy_from_slice(&data[base..base + len]))
    }
}

#[derive(Debug)]
struct InMemorySegment {
    id: SegmentId,
    index: usize,
    manager: InMemorySegmentManager,
    write_ptr: Mutex<u32>,
}

impl InMemorySegment {
    fn check_open(&self, operation: &'static str) -> DeviceResult<()> {
        let state = self.manager.store.states.lock()[self.index];
        if state != SegmentState::Open {
            return Err(DeviceError::InvalidSegmentState {
                segment: self.id,
                state: state.as_str(),
                operation,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Segment for InMemorySegment {
    fn segment_id(&self) -> SegmentId {
        self.id
    }

    fn write_ptr(&self) -> u32 {
        *self.write_ptr.lock()
    }

    fn write_capacity(&self) -> u32 {
        self.manager.segment_size
    }

    async fn write(&self, offset: u32, data: Bytes) -> DeviceResult<()> {
        self.check_open("write")?;
        check_range(
            u64::from(offset),
            data.len(),
            self.manager.block_size,
            u64::from(self.manager.segment_size),
        )?;
        self.manager.store.faults.before_write().await?;
        // Re-check: the segment may have been closed while the write was parked.
        self.check_open("write")?;
        self.manager.write_at(self.index, offset, &data);

        let end = offset + data.len() as u32;
        let mut write_ptr = self.write_ptr.lock();
        *write_ptr = (*write_ptr).max(end);
        Ok(())
    }

    async fn advance_wp(&self, offset: u32) -> DeviceResult<()> {
        self.check_open("advance write pointer")?;
        if offset > self.manager.segment_size {
            return Err(DeviceError::OutOfRange {
                offset: u64::from(offset),
                len: 0,
                size: u64::from(self.manager.segment_size),
            });
        }
        let mut write_ptr = self.write_ptr.lock();
        *write_ptr = (*write_ptr).max(offset);
        Ok(())
    }

    async fn close(&self) -> DeviceResult<()> {
        self.check_open("close")?;
        self.manager.store.states.lock()[self.index] = SegmentState::Closed;
        Ok(())
    }
}

#[derive(Debug)]
struct BlockStore {
    data: RwLock<Vec<u8>>,
    faults: FaultInjector,
}

/// An in-memory random block device.
///
/// Cloning yields another handle to the same storage.
#[derive(Debug, Clone)]
pub struct InMemoryBlockDevice {
    device_id: DeviceId,
    block_size: u32,
    store: Arc<BlockStore>,
}

impl InMemoryBlockDevice {
    /// Creates a zero-filled device of `size` bytes.
    #[must_use]
    pub fn new(device_id: DeviceId, block_size: u32, size: u64) -> Self {
        Self {
            device_id,
            block_size,
            store: Arc::new(BlockStore {
                data: RwLock::new(vec![0u8; size as usize]),
                faults: FaultInjector::new(),
            }),
        }
    }

    /// Returns the fault injector for this device.
    #[must_use]
    pub fn faults(&self) -> &FaultInjector {
        &self.store.faults
    }

    /// Overwrites bytes in place without alignment checks.
    ///
    /// # Errors
    ///
    /// Returns an error if the range leaves the device.
    pub fn corrupt(&self, offset: u64, bytes: &[u8]) -> DeviceResult<()> {
        let mut data = self.store.data.write();
        let size = data.len() as u64;
        let end = offset.saturating_add(bytes.len() as u64);
        if end > size {
            return Err(DeviceError::OutOfRange {
                offset,
                len: bytes.len(),
                size,
            });
        }
        data[offset as usize..end as usize].copy_from_slice(bytes);
        Ok(())
    }
}

#[async_trait]
impl RandomBlockDevice for InMemoryBlockDevice {
    fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn size(&self) -> u64 {
        self.store.data.read().len() as u64
    }

    async fn read(&self, offset: u64, len: usize) -> DeviceResult<Bytes> {
        let data = self.store.data.read();
        check_range(offset, len, self.block_size, data.len() as u64)?;
        let start = offset as usize;
        Ok(Bytes::copy_from_slice(&data[start..start + len]))
    }

    async fn write(&self, offset: u64, bytes: Bytes) -> DeviceResult<()> {
        check_range(offset, bytes.len(), self.block_size, self.size())?;
        self.store.faults.before_write().await?;
        let start = offset as usize;
        self.store.data.write()[start..start + bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: u32 = 4096;

    fn manager() -> InMemorySegmentManager {
        InMemorySegmentManager::new(DeviceId::new(0), BLOCK, 4 * BLOCK, 4)
    }

    #[tokio::test]
    async fn memory_new_segments_are_empty_and_zeroed() {
        let sm = manager();
        let id = SegmentId::new(DeviceId::new(0), 1);
        assert_eq!(sm.segment_state(id).unwrap(), SegmentState::Empty);
        let data = sm.read(id, 0, BLOCK as usize).await.unwrap();
        assert!(data.iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn memory_segment_write_then_read() {
        let sm = manager();
        let id = SegmentId::new(DeviceId::new(0), 2);
        let seg = sm.open(id).await.unwrap();
        seg.write(BLOCK, Bytes::from(vec![0xAB; BLOCK as usize]))
            .await
            .unwrap();
        assert_eq!(seg.write_ptr(), 2 * BLOCK);

        let data = sm.read(id, BLOCK, BLOCK as usize).await.unwrap();
        assert!(data.iter().all(|b| *b == 0xAB));
    }

    #[tokio::test]
    async fn memory_writes_may_land_out_of_order() {
        let sm = manager();
        let seg = sm.open(SegmentId::new(DeviceId::new(0), 0)).await.unwrap();
        seg.write(2 * BLOCK, Bytes::from(vec![2; BLOCK as usize]))
            .await
            .unwrap();
        seg.write(BLOCK, Bytes::from(vec![1; BLOCK as usize]))
            .await
            .unwrap();
        assert_eq!(seg.write_ptr(), 3 * BLOCK);
    }

    #[tokio::test]
    async fn memory_misaligned_write_fails() {
        let sm = manager();
        let seg = sm.open(SegmentId::new(DeviceId::new(0), 0)).await.unwrap();
        let result = seg.write(10, Bytes::from(vec![0; BLOCK as usize])).await;
        assert!(matches!(result, Err(DeviceError::Misaligned { .. })));
    }

    #[tokio::test]
    async fn memory_write_past_segment_fails() {
        let sm = manager();
        let seg = sm.open(SegmentId::new(DeviceId::new(0), 0)).await.unwrap();
        let result = seg
            .write(3 * BLOCK, Bytes::from(vec![0; 2 * BLOCK as usize]))
            .await;
        assert!(matches!(result, Err(DeviceError::OutOfRange { .. })));
    }

    #[tokio::test]
    async fn memory_closed_segment_rejects_writes() {
        let sm = manager();
        let id = SegmentId::new(DeviceId::new(0), 0);
        let seg = sm.open(id).await.unwrap();
        seg.close().await.unwrap();
        assert_eq!(sm.segment_state(id).unwrap(), SegmentState::Closed);

        let result = seg.write(0, Bytes::from(vec![0; BLOCK as usize])).await;
        assert!(matches!(
            result,
            Err(DeviceError::InvalidSegmentState { .. })
        ));
    }

    #[tokio::test]
    async fn memory_open_twice_fails() {
        let sm = manager();
        let id = SegmentId::new(DeviceId::new(0), 0);
        let _seg = sm.open(id).await.unwrap();
        assert!(sm.open(id).await.is_err());
    }

    #[tokio::test]
    async fn memory_release_zeroes_segment() {
        let sm = manager();
        let id = SegmentId::new(DeviceId::new(0), 3);
        let seg = sm.open(id).await.unwrap();
        seg.write(0, Bytes::from(vec![9; BLOCK as usize]))
            .await
            .unwrap();
        assert!(sm.release(id).await.is_err());

        seg.close().await.unwrap();
        sm.release(id).await.unwrap();
        assert_eq!(sm.segment_state(id).unwrap(), SegmentState::Empty);
        let data = sm.read(id, 0, BLOCK as usize).await.unwrap();
        assert!(data.iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn memory_unknown_segment_fails() {
        let sm = manager();
        let foreign = SegmentId::new(DeviceId::new(1), 0);
        assert!(matches!(
            sm.read(foreign, 0, BLOCK as usize).await,
            Err(DeviceError::UnknownSegment(_))
        ));
        let past_end = SegmentId::new(DeviceId::new(0), 4);
        assert!(sm.open(past_end).await.is_err());
    }

    #[tokio::test]
    async fn memory_injected_fault_fails_write() {
        let sm = manager();
        let seg = sm.open(SegmentId::new(DeviceId::new(0), 0)).await.unwrap();
        sm.faults().fail_next_writes(1);
        let result = seg.write(0, Bytes::from(vec![0; BLOCK as usize])).await;
        assert!(matches!(result, Err(DeviceError::InjectedFault)));
        assert!(seg
            .write(0, Bytes::from(vec![0; BLOCK as usize]))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn memory_clone_shares_storage() {
        let sm = manager();
        let id = SegmentId::new(DeviceId::new(0), 0);
        let seg = sm.open(id).await.unwrap();
        seg.write(0, Bytes::from(vec![5; BLOCK as usize]))
            .await
            .unwrap();

        let other = sm.clone();
        let data = other.read(id, 0, BLOCK as usize).await.unwrap();
        assert_eq!(data[0], 5);
    }

    #[tokio::test]
    async fn block_device_write_read() {
        let dev = InMemoryBlockDevice::new(DeviceId::new(3), BLOCK, 8 * u64::from(BLOCK));
        dev.write(u64::from(BLOCK), Bytes::from(vec![1; 2 * BLOCK as usize]))
            .await
            .unwrap();
        let data = dev
            .read(u64::from(BLOCK), 2 * BLOCK as usize)
            .await
            .unwrap();
        assert!(data.iter().all(|b| *b == 1));
    }

    #[tokio::test]
    async fn block_device_out_of_range() {
        let dev = InMemoryBlockDevice::new(DeviceId::new(3), BLOCK, 2 * u64::from(BLOCK));
        let result = dev.read(u64::from(BLOCK), 2 * BLOCK as usize).await;
        assert!(matches!(result, Err(DeviceError::OutOfRange { .. })));
    }

    #[tokio::test]
    async fn block_device_corrupt_changes_bytes() {
        let dev = InMemoryBlockDevice::new(DeviceId::new(3), BLOCK, 2 * u64::from(BLOCK));
        dev.corrupt(17, &[0xFF]).unwrap();
        let data = dev.read(0, BLOCK as usize).await.unwrap();
        assert_eq!(data[17], 0xFF);
    }
}

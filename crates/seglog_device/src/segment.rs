//! Segmented device traits.

use crate::error::DeviceResult;
use crate::ids::{DeviceId, DeviceMeta, SegmentId};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of one segment on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Never opened, or released since.
    Empty,
    /// Opened for writes.
    Open,
    /// Closed; readable but no longer writable.
    Closed,
}

impl SegmentState {
    /// Returns a static name for error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared handle to an open segment.
pub type SegmentRef = Arc<dyn Segment>;

/// One open segment.
///
/// # Invariants
///
/// - Writes are block aligned and lie within `write_capacity`
/// - Several writes may be in flight at once and may complete in any order
/// - After `close` the segment rejects further writes
#[async_trait]
pub trait Segment: Send + Sync {
    /// Returns the identifier of this segment.
    fn segment_id(&self) -> SegmentId;

    /// Returns the highest offset written or advanced to so far.
    fn write_ptr(&self) -> u32;

    /// Returns the number of bytes the segment can hold.
    fn write_capacity(&self) -> u32;

    /// Writes `data` at `offset` within the segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment is not open, the write is misaligned,
    /// extends past the capacity, or the device fails.
    async fn write(&self, offset: u32, data: Bytes) -> DeviceResult<()>;

    /// Moves the write pointer forward to `offset` without writing.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment is not open or `offset` is out of range.
    async fn advance_wp(&self, offset: u32) -> DeviceResult<()>;

    /// Closes the segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment is not open.
    async fn close(&self) -> DeviceResult<()>;
}

/// A device divided into equally sized segments.
///
/// # Implementors
///
/// - [`super::InMemorySegmentManager`] - For tests
#[async_trait]
pub trait SegmentManager: Send + Sync {
    /// Returns the identifier of this device.
    fn device_id(&self) -> DeviceId;

    /// Returns the device block size in bytes.
    fn block_size(&self) -> u32;

    /// Returns the size of every segment in bytes.
    fn segment_size(&self) -> u32;

    /// Returns the number of segments on the device.
    fn num_segments(&self) -> u32;

    /// Returns the store identity recorded on the device.
    fn meta(&self) -> DeviceMeta;

    /// Opens an empty segment for writing.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment is unknown or not empty.
    async fn open(&self, id: SegmentId) -> DeviceResult<SegmentRef>;

    /// Releases a closed segment, making it empty again.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment is unknown or still open.
    async fn release(&self, id: SegmentId) -> DeviceResult<()>;

    /// Reads `len` bytes at `offset` within segment `id`.
    ///
    /// Segments that were never written read back as zeroes.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment is unknown, the range is misaligned
    /// or leaves the segment, or the device fails.
    async fn read(&self, id: SegmentId, offset: u32, len: usize) -> DeviceResult<Bytes>;
}

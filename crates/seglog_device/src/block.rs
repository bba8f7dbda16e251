//! Random-access block device trait.

use crate::error::DeviceResult;
use crate::ids::DeviceId;
use async_trait::async_trait;
use bytes::Bytes;

/// A device addressed by absolute byte offset.
///
/// Unlike a [`super::SegmentManager`], there is no segment lifecycle: any
/// aligned range may be overwritten at any time.
///
/// # Invariants
///
/// - `read` returns exactly the bytes last written at that range, or zeroes
/// - Offsets and lengths are multiples of `block_size`
///
/// # Implementors
///
/// - [`super::InMemoryBlockDevice`] - For testing
/// - [`super::FileBlockDevice`] - For persistent storage
#[async_trait]
pub trait RandomBlockDevice: Send + Sync {
    /// Returns the identifier of this device.
    fn device_id(&self) -> DeviceId;

    /// Returns the device block size in bytes.
    fn block_size(&self) -> u32;

    /// Returns the usable size of the device in bytes.
    fn size(&self) -> u64;

    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is misaligned, extends past the end of
    /// the device, or an I/O error occurs.
    async fn read(&self, offset: u64, len: usize) -> DeviceResult<Bytes>;

    /// Writes `data` starting at `offset`.
    ///
    /// After this returns successfully the data is durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is misaligned, extends past the end of
    /// the device, or an I/O error occurs.
    async fn write(&self, offset: u64, data: Bytes) -> DeviceResult<()>;
}

/// Checks that `[offset, offset + len)` is block aligned and inside `size`.
pub(crate) fn check_range(
    offset: u64,
    len: usize,
    block_size: u32,
    size: u64,
) -> DeviceResult<()> {
    use crate::error::DeviceError;

    let block = u64::from(block_size);
    if offset % block != 0 || len as u64 % block != 0 {
        return Err(DeviceError::Misaligned {
            offset,
            len,
            block_size,
        });
    }
    let end = offset.saturating_add(len as u64);
    if offset > size || end > size {
        return Err(DeviceError::OutOfRange { offset, len, size });
    }
    Ok(())
}

//! Error types for device operations.

use crate::ids::SegmentId;
use std::io;
use thiserror::Error;

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors that can occur during device operations.
///
/// Every variant is an input/output class failure from the journal's
/// point of view: the operation in progress fails and is not retried.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to access beyond the end of the device or segment.
    #[error("access out of range: offset {offset}, len {len}, size {size}")]
    OutOfRange {
        /// The requested offset.
        offset: u64,
        /// The requested length.
        len: usize,
        /// The size of the addressed region.
        size: u64,
    },

    /// Offset or length is not a multiple of the device block size.
    #[error("misaligned access: offset {offset}, len {len}, block size {block_size}")]
    Misaligned {
        /// The requested offset.
        offset: u64,
        /// The requested length.
        len: usize,
        /// The device block size.
        block_size: u32,
    },

    /// The segment does not exist on this device.
    #[error("unknown segment {0}")]
    UnknownSegment(SegmentId),

    /// The segment is not in a state that permits the operation.
    #[error("segment {segment} is {state}, cannot {operation}")]
    InvalidSegmentState {
        /// The addressed segment.
        segment: SegmentId,
        /// The state the segment was found in.
        state: &'static str,
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// A write failed because a fault was injected.
    #[error("injected write failure")]
    InjectedFault,
}

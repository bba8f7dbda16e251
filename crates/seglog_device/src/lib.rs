//! # SegLog Device
//!
//! Device traits and implementations for SegLog.
//!
//! This crate provides the lowest-level storage abstraction for the journal.
//! Devices are **opaque block stores** - they do not interpret the data
//! they store.
//!
//! ## Device Kinds
//!
//! - [`SegmentManager`] - A device divided into fixed-size segments. A
//!   segment is opened, written, closed and eventually released as a unit.
//! - [`RandomBlockDevice`] - A device addressed by absolute byte offset,
//!   used by the circular journal.
//!
//! ## Design Principles
//!
//! - All reads and writes are block aligned
//! - No knowledge of record groups, segment headers or journal tails
//! - Must be `Send + Sync`; every I/O call is asynchronous
//!
//! ## Available Implementations
//!
//! - [`InMemorySegmentManager`] - For tests and ephemeral journals
//! - [`InMemoryBlockDevice`] - For tests of the circular journal
//! - [`FileBlockDevice`] - Persistent random block device over a file
//!
//! ## Example
//!
//! ```rust
//! use bytes::Bytes;
//! use seglog_device::{DeviceId, InMemoryBlockDevice, RandomBlockDevice};
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let device = InMemoryBlockDevice::new(DeviceId::new(0), 4096, 16 * 4096);
//! device.write(4096, Bytes::from(vec![7u8; 4096])).await.unwrap();
//! let data = device.read(4096, 4096).await.unwrap();
//! assert_eq!(data[0], 7);
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod block;
mod error;
mod fault;
mod file;
mod ids;
mod memory;
mod segment;

pub use block::RandomBlockDevice;
pub use error::{DeviceError, DeviceResult};
pub use fault::FaultInjector;
pub use file::FileBlockDevice;
pub use ids::{DeviceId, DeviceMeta, DeviceSegmentId, SegmentId};
pub use memory::{InMemoryBlockDevice, InMemorySegmentManager};
pub use segment::{Segment, SegmentManager, SegmentRef, SegmentState};

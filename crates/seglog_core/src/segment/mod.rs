//! Segments: bookends, the device group, the replay scanner and the
//! allocation seam.
//!
//! ## Segment layout
//!
//! ```text
//! +--------+---------------+---------------+-----+------+
//! | header | record group  | record group  | ... | tail |
//! +--------+---------------+---------------+-----+------+
//!  1 block                                        1 block
//! ```
//!
//! The header is written when the segment is opened and the tail when it
//! is closed. A segment that crashed while open has no tail; its end is
//! found by scanning for the first record group that does not validate.

mod cursor;
mod group;
mod header;
mod provider;

pub use cursor::{FoundRecordGroup, ScanValidRecordsCursor};
pub use group::{FoundRecordHandler, SegmentManagerGroup};
pub use header::{SegmentHeader, SegmentTail};
pub use provider::{FifoSegmentProvider, SegmentInfo, SegmentProvider, SegmentSeqAllocator};

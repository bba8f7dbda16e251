//! Records and the on-disk record group format.
//!
//! A record is one caller's append request. Records submitted close
//! together are written as one record group: a block-aligned metadata
//! area holding the group header, per-record headers and deltas, followed
//! by the records' data extents.
//!
//! ## Invariants
//!
//! - `mdlength >= block_size` and `mdlength % block_size == 0`
//! - `dlength % block_size == 0`
//! - In a segment, a group's `committed_to` lies strictly before the group;
//!   in a circular journal it is the group's own position
//! - Decoding never panics: malformed input yields `None`

mod codec;
mod model;

pub use codec::{
    encode_records, try_decode_record_deltas, try_decode_records, try_decode_records_header,
    validate_records_data, validate_records_metadata, DecodedRecord, RecordDeltas,
};
pub use model::{
    Record, RecordGroup, RecordGroupHeader, RecordGroupSize, RecordSize,
    RECORD_GROUP_HEADER_LEN, RECORD_HEADER_LEN,
};

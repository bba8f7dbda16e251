//! Segment devices viewed as one group, and the replay scanner.

use super::cursor::ScanValidRecordsCursor;
use super::header::{SegmentHeader, SegmentTail};
use crate::error::{JournalError, JournalResult};
use crate::record::{try_decode_records_header, validate_records_data, validate_records_metadata, RecordGroupHeader};
use crate::types::{align_up, JournalSeq, Paddr, RecordLocator, SegmentNonce, SegmentType, WriteResult};
use bytes::{Bytes, BytesMut};
use seglog_device::{DeviceId, DeviceMeta, SegmentId, SegmentManager, SegmentRef};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Callback invoked once per replayed record group with the group's
/// locator, header and metadata area.
///
/// Returning an error aborts the scan with that error.
pub type FoundRecordHandler<'a> =
    dyn FnMut(RecordLocator, &RecordGroupHeader, &Bytes) -> JournalResult<()> + Send + 'a;

/// A set of segment devices sharing geometry and store identity.
///
/// # Invariants
///
/// - Every device has the same block size, segment size and meta
/// - Device ids are unique
pub struct SegmentManagerGroup {
    managers: BTreeMap<DeviceId, Arc<dyn SegmentManager>>,
    block_size: u32,
    segment_size: u32,
    meta: DeviceMeta,
}

impl fmt::Debug for SegmentManagerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentManagerGroup")
            .field("devices", &self.device_ids())
            .field("block_size", &self.block_size)
            .field("segment_size", &self.segment_size)
            .finish_non_exhaustive()
    }
}

impl SegmentManagerGroup {
    /// Creates a group from one or more devices.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `managers` is empty or the devices are
    /// inconsistent.
    pub fn new(managers: Vec<Arc<dyn SegmentManager>>) -> JournalResult<Self> {
        let mut iter = managers.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| JournalError::invalid_argument("segment manager group needs a device"))?;

        let block_size = first.block_size();
        let segment_size = first.segment_size();
        if block_size == 0 {
            return Err(JournalError::invalid_argument(format!(
                "device {} reports a zero block size",
                first.device_id()
            )));
        }
        let mut group = Self {
            managers: BTreeMap::new(),
            block_size,
            segment_size,
            meta: first.meta(),
        };
        let min_segment = group.rounded_header_length() + group.rounded_tail_length() + block_size;
        if segment_size % block_size != 0 || segment_size < min_segment {
            return Err(JournalError::invalid_argument(format!(
                "unusable segment geometry: block size {block_size}, segment size {segment_size}"
            )));
        }
        group.add_segment_manager(first)?;
        for manager in iter {
            group.add_segment_manager(manager)?;
        }
        Ok(group)
    }

    /// Adds another device to the group.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the device id is taken or its geometry
    /// or meta differ from the group.
    pub fn add_segment_manager(&mut self, manager: Arc<dyn SegmentManager>) -> JournalResult<()> {
        let device_id = manager.device_id();
        if self.managers.contains_key(&device_id) {
            return Err(JournalError::invalid_argument(format!(
                "device {device_id} already in group"
            )));
        }
        if manager.block_size() != self.block_size || manager.segment_size() != self.segment_size {
            return Err(JournalError::invalid_argument(format!(
                "device {device_id} geometry {}/{} differs from group {}/{}",
                manager.block_size(),
                manager.segment_size(),
                self.block_size,
                self.segment_size
            )));
        }
        if manager.meta() != self.meta {
            return Err(JournalError::invalid_argument(format!(
                "device {device_id} belongs to another store"
            )));
        }
        debug!("add {device_id} with {} segments", manager.num_segments());
        self.managers.insert(device_id, manager);
        Ok(())
    }

    /// Returns the device ids in ascending order.
    #[must_use]
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.managers.keys().copied().collect()
    }

    /// Returns true if the group holds `device`.
    #[must_use]
    pub fn has_device(&self, device: DeviceId) -> bool {
        self.managers.contains_key(&device)
    }

    /// Returns the devices in device id order.
    pub fn segment_managers(&self) -> impl Iterator<Item = &Arc<dyn SegmentManager>> {
        self.managers.values()
    }

    /// Returns the shared block size.
    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Returns the shared segment size.
    #[must_use]
    pub const fn segment_size(&self) -> u32 {
        self.segment_size
    }

    /// Returns the shared store identity.
    #[must_use]
    pub const fn meta(&self) -> DeviceMeta {
        self.meta
    }

    /// Space reserved for the segment header.
    #[must_use]
    pub const fn rounded_header_length(&self) -> u32 {
        align_up(SegmentHeader::ENCODED_LEN as u64, self.block_size as u64) as u32
    }

    /// Space reserved for the segment tail.
    #[must_use]
    pub const fn rounded_tail_length(&self) -> u32 {
        align_up(SegmentTail::ENCODED_LEN as u64, self.block_size as u64) as u32
    }

    fn manager(&self, device: DeviceId) -> JournalResult<&Arc<dyn SegmentManager>> {
        self.managers
            .get(&device)
            .ok_or_else(|| JournalError::no_entity(format!("device {device} not in group")))
    }

    /// Opens an empty segment for writing.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is unknown or the open fails.
    pub async fn open(&self, id: SegmentId) -> JournalResult<SegmentRef> {
        Ok(self.manager(id.device_id())?.open(id).await?)
    }

    /// Releases a closed segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is unknown or the release fails.
    pub async fn release(&self, id: SegmentId) -> JournalResult<()> {
        Ok(self.manager(id.device_id())?.release(id).await?)
    }

    /// Reads bytes from a segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is unknown or the read fails.
    pub async fn read(&self, id: SegmentId, offset: u32, len: usize) -> JournalResult<Bytes> {
        Ok(self.manager(id.device_id())?.read(id, offset, len).await?)
    }

    /// Reads and decodes the header of a segment.
    ///
    /// # Errors
    ///
    /// Returns `NoData` if the block does not hold a header, `NoEntity` if
    /// the device is unknown, or the device error if the read fails.
    pub async fn read_segment_header(&self, id: SegmentId) -> JournalResult<SegmentHeader> {
        let block = self
            .read(id, 0, self.rounded_header_length() as usize)
            .await?;
        match SegmentHeader::decode(&block) {
            Some(header) => {
                trace!("segment {id} header {header}");
                Ok(header)
            }
            None => {
                trace!("segment {id} unable to decode header, skipping");
                Err(JournalError::no_data(format!("segment {id} has no header")))
            }
        }
    }

    /// Reads and decodes the tail of a segment.
    ///
    /// # Errors
    ///
    /// Returns `NoData` if the block does not hold a tail, `NoEntity` if the
    /// device is unknown, or the device error if the read fails.
    pub async fn read_segment_tail(&self, id: SegmentId) -> JournalResult<SegmentTail> {
        let tail_length = self.rounded_tail_length();
        let block = self
            .read(id, self.segment_size - tail_length, tail_length as usize)
            .await?;
        match SegmentTail::decode(&block) {
            Some(tail) => {
                trace!("segment {id} tail {tail}");
                Ok(tail)
            }
            None => {
                trace!("segment {id} unable to decode tail, skipping");
                Err(JournalError::no_data(format!("segment {id} has no tail")))
            }
        }
    }

    /// Reads the metadata of the record group at `start` and validates it.
    ///
    /// Returns `Ok(None)` for anything that is not a valid group written
    /// with `nonce`: a short read, a malformed or foreign header, lengths
    /// that are misaligned or overflow the segment, or a bad checksum.
    ///
    /// # Errors
    ///
    /// Returns an error only if the device fails.
    pub async fn read_validate_record_metadata(
        &self,
        start: Paddr,
        nonce: SegmentNonce,
    ) -> JournalResult<Option<(RecordGroupHeader, Bytes)>> {
        let (segment, offset) = start.as_segment().ok_or_else(|| {
            JournalError::invalid_argument(format!("{start} is not a segment address"))
        })?;
        let block_size = u64::from(self.block_size);
        let capacity = u64::from(self.segment_size - self.rounded_tail_length());
        if u64::from(offset) + block_size > capacity {
            debug!("record group header block {start} exceeds segment capacity {capacity}");
            return Ok(None);
        }

        trace!("reading record group header block {start}");
        let first = self.read(segment, offset, self.block_size as usize).await?;
        let Some(header) = try_decode_records_header(&first, nonce) else {
            return Ok(None);
        };

        let mdlength = u64::from(header.mdlength);
        let dlength = u64::from(header.dlength);
        let committed_misaligned =
            !header.committed_to.is_null() && header.committed_to.offset.offset() % block_size != 0;
        if mdlength < block_size
            || mdlength % block_size != 0
            || dlength % block_size != 0
            || committed_misaligned
            || u64::from(offset) + mdlength + dlength > capacity
        {
            debug!("invalid record group header at {start}: {header:?}");
            return Ok(None);
        }

        let md = if mdlength == block_size {
            first
        } else {
            let rest_offset = offset + self.block_size;
            let rest_len = (mdlength - block_size) as usize;
            trace!("reading record group header rest {segment}+{rest_offset:#x}~{rest_len}");
            let rest = self.read(segment, rest_offset, rest_len).await?;
            let mut md = BytesMut::with_capacity(mdlength as usize);
            md.extend_from_slice(&first);
            md.extend_from_slice(&rest);
            md.freeze()
        };

        if validate_records_metadata(&md) {
            Ok(Some((header, md)))
        } else {
            Ok(None)
        }
    }

    /// Reads the data area of the group at `record_base` and checks it
    /// against the header's checksum.
    ///
    /// # Errors
    ///
    /// Returns an error only if the device fails.
    pub async fn read_validate_data(
        &self,
        record_base: Paddr,
        header: &RecordGroupHeader,
    ) -> JournalResult<bool> {
        let data_addr = record_base.add_offset(u64::from(header.mdlength));
        let (segment, offset) = data_addr.as_segment().ok_or_else(|| {
            JournalError::invalid_argument(format!("{data_addr} is not a segment address"))
        })?;
        trace!("reading record group data blocks {data_addr}~{}", header.dlength);
        let data = if header.dlength == 0 {
            Bytes::new()
        } else {
            self.read(segment, offset, header.dlength as usize).await?
        };
        Ok(validate_records_data(header, &data))
    }

    fn consume_next_records(
        cursor: &mut ScanValidRecordsCursor,
        handler: &mut FoundRecordHandler<'_>,
        budget_used: &mut usize,
    ) -> JournalResult<()> {
        let segment_seq = cursor.seq().segment_seq;
        let Some(next) = cursor.front() else {
            return Ok(());
        };
        let total_length = u64::from(next.header.mdlength) + u64::from(next.header.dlength);
        *budget_used += total_length as usize;
        let locator = RecordLocator {
            record_block_base: next.offset.add_offset(u64::from(next.header.mdlength)),
            write_result: WriteResult {
                start_seq: JournalSeq::new(segment_seq, next.offset),
                length: total_length,
            },
        };
        debug!("processing {:?} at {locator}, budget_used={budget_used}", next.header);
        handler(locator, &next.header, &next.mdbuffer)?;
        cursor.pop_record_group();
        if cursor.is_complete() {
            info!("complete at {cursor}, no more record group");
        }
        Ok(())
    }

    /// Delivers the committed record groups of one segment to `handler`.
    ///
    /// Headers are read ahead and queued. A queued group is delivered only
    /// once a later group's `committed_to` proves it durable, or, after the
    /// last valid header, once its data checksum verifies. The first group
    /// with invalid data ends the scan. Scanning stops when the segment is
    /// exhausted or `budget` bytes have been delivered.
    ///
    /// Returns the number of bytes delivered.
    ///
    /// # Errors
    ///
    /// Returns an error if the device fails or `handler` fails.
    pub async fn scan_valid_records(
        &self,
        cursor: &mut ScanValidRecordsCursor,
        nonce: SegmentNonce,
        budget: usize,
        handler: &mut FoundRecordHandler<'_>,
    ) -> JournalResult<usize> {
        if !self.has_device(cursor.segment_id().device_id()) {
            return Err(JournalError::no_entity(format!(
                "device of {} not in group",
                cursor.segment_id()
            )));
        }
        if cursor.segment_offset() == 0 {
            info!("start to scan segment {}", cursor.segment_id());
            cursor.increment_seq(self.rounded_header_length());
        }
        debug!("starting at {cursor}, budget={budget}");

        let mut budget_used = 0usize;
        loop {
            if cursor.last_valid_header_found() {
                let Some(next) = cursor.front() else {
                    break;
                };
                let (offset, header) = (next.offset, next.header);
                if self.read_validate_data(offset, &header).await? {
                    Self::consume_next_records(cursor, handler, &mut budget_used)?;
                } else {
                    info!("complete at {cursor}, invalid record group data at {offset}");
                    cursor.clear_pending();
                }
            } else {
                match self
                    .read_validate_record_metadata(cursor.seq().offset, nonce)
                    .await?
                {
                    Some((header, md)) => {
                        debug!("found valid {header:?} at {}", cursor.seq());
                        cursor.emplace_record_group(header, md);
                    }
                    None => {
                        cursor.mark_last_valid_header_found();
                        if cursor.is_complete() {
                            info!("complete at {cursor}, invalid record group metadata");
                        } else {
                            debug!(
                                "found invalid record group metadata at {}, processing {} pending record groups",
                                cursor.seq(),
                                cursor.num_pending()
                            );
                        }
                    }
                }

                // deliver what the latest committed_to proves durable
                while let Some(next) = cursor.front() {
                    let next_seq = JournalSeq::new(cursor.seq().segment_seq, next.offset);
                    let last_committed = cursor.last_committed();
                    if last_committed.is_null() || next_seq > last_committed {
                        break;
                    }
                    Self::consume_next_records(cursor, handler, &mut budget_used)?;
                }
            }

            if cursor.is_complete() || budget_used >= budget {
                debug!("finish at {cursor}, budget_used={budget_used}, budget={budget}");
                break;
            }
        }
        Ok(budget_used)
    }

    /// Returns the header of every journal segment on every device.
    ///
    /// Segments without a decodable header are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a device read fails.
    pub async fn find_journal_segment_headers(
        &self,
    ) -> JournalResult<Vec<(SegmentId, SegmentHeader)>> {
        let mut found = Vec::new();
        for manager in self.managers.values() {
            let device_id = manager.device_id();
            let num_segments = manager.num_segments();
            debug!("processing {device_id} with {num_segments} segments");
            for index in 0..num_segments {
                let id = SegmentId::new(device_id, index);
                match self.read_segment_header(id).await {
                    Ok(header) if header.seg_type == SegmentType::Journal => {
                        found.push((id, header));
                    }
                    Ok(_) | Err(JournalError::NoData { .. } | JournalError::NoEntity { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(found)
    }
}

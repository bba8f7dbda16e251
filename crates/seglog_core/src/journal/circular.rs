//! Journal over one circular region of a random block device.
//!
//! ## Layout
//!
//! ```text
//! 0          block_size                                       total_size
//! +----------+------------------------------------------------+
//! |  header  |  record groups, wrapping back to block_size    |
//! +----------+------------------------------------------------+
//! ```
//!
//! Positions are journal sequences whose segment part counts how many
//! times the write position has wrapped. Each record group stamps its own
//! position as `committed_to`, so a group left over from an earlier lap
//! never validates at the same address in a later one.

use super::{DeltaHandler, Journal};
use crate::codec::{decode_versioned, pad_to_block, put_journal_seq, Reader, ENVELOPE_OVERHEAD, JOURNAL_SEQ_LEN};
use crate::config::CbjConfig;
use crate::error::{JournalError, JournalResult};
use crate::record::{
    encode_records, try_decode_records_header, validate_records_data, validate_records_metadata,
    Record, RecordGroup, RecordGroupHeader,
};
use crate::trimmer::JournalTrimmer;
use crate::types::{
    JournalSeq, JournalType, Paddr, RecordLocator, SegmentNonce, SegmentSeq, WriteResult,
};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use seglog_device::{DeviceId, RandomBlockDevice};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Magic number identifying a circular journal header.
pub const CBJOURNAL_MAGIC: u64 = 0xCCCC;

const CBJ_HEADER_V: u8 = 1;

/// Persistent header at address 0 of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CbjHeader {
    /// Always [`CBJOURNAL_MAGIC`].
    pub magic: u64,
    /// Identity of the journal instance.
    pub uuid: Uuid,
    /// Block size of the journal.
    pub block_size: u32,
    /// Bytes used by the journal, header block included.
    pub size: u64,
    /// Oldest position whose deltas are still needed.
    pub dirty_tail: JournalSeq,
    /// Oldest position whose allocation records are still needed.
    pub alloc_tail: JournalSeq,
    /// Device id used in record addresses.
    pub device_id: DeviceId,
}

impl CbjHeader {
    const PAYLOAD_LEN: usize = 8 + 16 + 4 + 8 + 2 * JOURNAL_SEQ_LEN + 1;

    /// Encoded size before block padding.
    pub const ENCODED_LEN: usize = Self::PAYLOAD_LEN + ENVELOPE_OVERHEAD;

    /// Encodes the header into one zero-padded block.
    #[must_use]
    pub fn encode_block(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(Self::PAYLOAD_LEN);
        payload.put_u64_le(self.magic);
        payload.put_slice(self.uuid.as_bytes());
        payload.put_u32_le(self.block_size);
        payload.put_u64_le(self.size);
        put_journal_seq(&mut payload, self.dirty_tail);
        put_journal_seq(&mut payload, self.alloc_tail);
        payload.put_u8(self.device_id.as_u8());
        pad_to_block(&payload, CBJ_HEADER_V, self.block_size)
    }

    /// Decodes a header; `None` if the block holds no valid header.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let (_, payload) = decode_versioned(buf, CBJ_HEADER_V)?;
        let mut reader = Reader::new(payload);
        Some(Self {
            magic: reader.u64()?,
            uuid: reader.uuid()?,
            block_size: reader.u32()?,
            size: reader.u64()?,
            dirty_tail: reader.journal_seq()?,
            alloc_tail: reader.journal_seq()?,
            device_id: DeviceId::new(reader.u8()?),
        })
    }

    /// First byte of the circular region.
    #[must_use]
    pub const fn start_addr(&self) -> u64 {
        self.block_size as u64
    }

    /// One past the last byte of the circular region.
    #[must_use]
    pub const fn journal_end(&self) -> u64 {
        self.size
    }

    /// Bytes in the circular region.
    #[must_use]
    pub const fn region_size(&self) -> u64 {
        self.size - self.block_size as u64
    }

    /// Nonce stamped into every record group.
    #[must_use]
    pub fn nonce(&self) -> SegmentNonce {
        crc32fast::hash(self.uuid.as_bytes())
    }

    fn tail(&self) -> JournalSeq {
        self.dirty_tail.min(self.alloc_tail)
    }
}

impl fmt::Display for CbjHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cbj_header(magic={:#x}, uuid={}, block_size={:#x}, size={:#x}, dirty_tail={}, alloc_tail={}, {})",
            self.magic,
            self.uuid,
            self.block_size,
            self.size,
            self.dirty_tail,
            self.alloc_tail,
            self.device_id
        )
    }
}

#[derive(Debug)]
struct CbjState {
    header: Option<CbjHeader>,
    written_to: JournalSeq,
    replayed: bool,
    has_io_error: bool,
}

fn block_addr(seq: &JournalSeq) -> JournalResult<u64> {
    seq.offset
        .as_block()
        .ok_or_else(|| JournalError::invalid_argument(format!("{seq} is not a block address")))
}

/// Bytes between `tail` and `written_to` going forward around the region.
fn used_between(header: &CbjHeader, written_to: u64, tail: u64) -> u64 {
    if written_to >= tail {
        written_to - tail
    } else {
        header.journal_end() - tail + written_to - header.start_addr()
    }
}

/// Position following a write of `length` at `seq`, wrapping at the end.
fn advance(header: &CbjHeader, seq: JournalSeq, addr: u64, length: u64) -> JournalSeq {
    let next = addr + length;
    if next >= header.journal_end() {
        JournalSeq::new(
            seq.segment_seq.next(),
            Paddr::block(header.device_id, header.start_addr()),
        )
    } else {
        JournalSeq::new(seq.segment_seq, Paddr::block(header.device_id, next))
    }
}

fn wrap_to_start(header: &CbjHeader, seq: JournalSeq) -> JournalSeq {
    JournalSeq::new(
        seq.segment_seq.next(),
        Paddr::block(header.device_id, header.start_addr()),
    )
}

/// A self-contained journal on a single random block device.
///
/// There is one write position and no roll: when the region between the
/// write position and the journal tail is exhausted, submissions fail with
/// `OutOfRange` until [`CircularBoundedJournal::update_journal_tail`]
/// frees space.
pub struct CircularBoundedJournal {
    device: Arc<dyn RandomBlockDevice>,
    trimmer: Arc<dyn JournalTrimmer>,
    state: Mutex<CbjState>,
}

impl fmt::Debug for CircularBoundedJournal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CircularBoundedJournal")
            .field("device", &self.device.device_id())
            .field("header", &state.header)
            .field("written_to", &state.written_to)
            .finish()
    }
}

impl CircularBoundedJournal {
    /// Creates a journal on `device`. Nothing is read until it is opened.
    #[must_use]
    pub fn new(device: Arc<dyn RandomBlockDevice>, trimmer: Arc<dyn JournalTrimmer>) -> Self {
        Self {
            device,
            trimmer,
            state: Mutex::new(CbjState {
                header: None,
                written_to: crate::types::JOURNAL_SEQ_NULL,
                replayed: false,
                has_io_error: false,
            }),
        }
    }

    /// Writes a fresh header, discarding any existing journal.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `config` does not fit the device, or the
    /// device error.
    pub async fn mkfs(&self, config: &CbjConfig) -> JournalResult<()> {
        config.validate(self.device.block_size(), self.device.size())?;
        let start = JournalSeq::new(
            SegmentSeq::new(0),
            Paddr::block(config.device_id, u64::from(config.block_size)),
        );
        let header = CbjHeader {
            magic: CBJOURNAL_MAGIC,
            uuid: config.uuid,
            block_size: config.block_size,
            size: config.total_size,
            dirty_tail: start,
            alloc_tail: start,
            device_id: config.device_id,
        };
        info!("mkfs {header}");
        self.device.write(0, header.encode_block()).await?;
        let mut state = self.state.lock();
        state.header = None;
        state.replayed = false;
        Ok(())
    }

    async fn read_header(&self) -> JournalResult<CbjHeader> {
        let block_size = self.device.block_size();
        let buf = self.device.read(0, block_size as usize).await?;
        let header = CbjHeader::decode(&buf)
            .ok_or_else(|| JournalError::no_data("no circular journal header"))?;
        if header.magic != CBJOURNAL_MAGIC {
            return Err(JournalError::invalid_argument(format!(
                "bad magic {:#x}",
                header.magic
            )));
        }
        let block = u64::from(header.block_size);
        if header.block_size != block_size
            || header.size % block != 0
            || header.size < 3 * block
            || header.size > self.device.size()
        {
            return Err(JournalError::invalid_argument(format!(
                "{header} does not fit device {} of {:#x} bytes",
                self.device.device_id(),
                self.device.size()
            )));
        }
        debug!("read {header}");
        Ok(header)
    }

    fn header(&self) -> JournalResult<CbjHeader> {
        self.state
            .lock()
            .header
            .ok_or_else(|| JournalError::invalid_argument("circular journal is not open"))
    }

    /// The position the next record is written at.
    #[must_use]
    pub fn written_to(&self) -> JournalSeq {
        self.state.lock().written_to
    }

    /// Bytes between the journal tail and the write position.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the journal is not open.
    pub fn used_size(&self) -> JournalResult<u64> {
        let state = self.state.lock();
        let header = state
            .header
            .ok_or_else(|| JournalError::invalid_argument("circular journal is not open"))?;
        Ok(used_between(
            &header,
            block_addr(&state.written_to)?,
            block_addr(&header.tail())?,
        ))
    }

    /// Bytes that may still be written before the tail must advance.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the journal is not open.
    pub fn available_size(&self) -> JournalResult<u64> {
        let used = self.used_size()?;
        Ok(self.header()?.region_size() - used)
    }

    /// Bytes in the circular region.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the journal is not open.
    pub fn total_size(&self) -> JournalResult<u64> {
        Ok(self.header()?.region_size())
    }

    /// First address of the circular region.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the journal is not open.
    pub fn start_addr(&self) -> JournalResult<u64> {
        Ok(self.header()?.start_addr())
    }

    /// End address of the circular region.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the journal is not open.
    pub fn journal_end(&self) -> JournalResult<u64> {
        Ok(self.header()?.journal_end())
    }

    /// The header as last read or written.
    #[must_use]
    pub fn current_header(&self) -> Option<CbjHeader> {
        self.state.lock().header
    }

    /// Advances the persisted tails and rewrites the header.
    ///
    /// Everything before the older of the two tails becomes free.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the journal is not open, a tail is not
    /// a block address inside the region, or a tail moves backwards or past
    /// the write position. Returns the device error if the header cannot be
    /// written; the in-memory tails are then left unchanged.
    pub async fn update_journal_tail(
        &self,
        dirty_tail: JournalSeq,
        alloc_tail: JournalSeq,
    ) -> JournalResult<()> {
        let updated = {
            let state = self.state.lock();
            let mut header = state
                .header
                .ok_or_else(|| JournalError::invalid_argument("circular journal is not open"))?;
            for (name, old, new) in [
                ("dirty", header.dirty_tail, dirty_tail),
                ("alloc", header.alloc_tail, alloc_tail),
            ] {
                let addr = block_addr(&new)?;
                if addr < header.start_addr() || addr >= header.journal_end() {
                    return Err(JournalError::invalid_argument(format!(
                        "{name} tail {new} is outside the journal region"
                    )));
                }
                if new < old || new > state.written_to {
                    return Err(JournalError::invalid_argument(format!(
                        "{name} tail {new} is not within [{old}, {}]",
                        state.written_to
                    )));
                }
            }
            header.dirty_tail = dirty_tail;
            header.alloc_tail = alloc_tail;
            header
        };
        debug!("update journal tails: dirty={dirty_tail}, alloc={alloc_tail}");
        self.device.write(0, updated.encode_block()).await?;
        if let Some(header) = self.state.lock().header.as_mut() {
            header.dirty_tail = dirty_tail;
            header.alloc_tail = alloc_tail;
        }
        self.trimmer.update_journal_tails(dirty_tail, alloc_tail);
        Ok(())
    }

    async fn read_validate_record(
        &self,
        header: &CbjHeader,
        seq: JournalSeq,
    ) -> JournalResult<Option<(RecordGroupHeader, Bytes)>> {
        let addr = block_addr(&seq)?;
        let block = u64::from(header.block_size);
        if addr + block > header.journal_end() {
            return Ok(None);
        }
        let first = self.device.read(addr, block as usize).await?;
        let Some(group) = try_decode_records_header(&first, header.nonce()) else {
            return Ok(None);
        };
        let mdlength = u64::from(group.mdlength);
        let dlength = u64::from(group.dlength);
        if group.committed_to != seq
            || mdlength < block
            || mdlength % block != 0
            || dlength % block != 0
            || addr + mdlength + dlength > header.journal_end()
        {
            trace!("stale or invalid record group at {seq}: {group:?}");
            return Ok(None);
        }

        let md = if mdlength == block {
            first
        } else {
            let rest = self.device.read(addr + block, (mdlength - block) as usize).await?;
            let mut md = BytesMut::with_capacity(mdlength as usize);
            md.extend_from_slice(&first);
            md.extend_from_slice(&rest);
            md.freeze()
        };
        if !validate_records_metadata(&md) {
            return Ok(None);
        }
        let data = if dlength == 0 {
            Bytes::new()
        } else {
            self.device.read(addr + mdlength, dlength as usize).await?
        };
        if !validate_records_data(&group, &data) {
            return Ok(None);
        }
        Ok(Some((group, md)))
    }

    /// Scans forward from the tail, delivering every valid group, and
    /// returns the position after the last one.
    async fn scan(
        &self,
        header: &CbjHeader,
        handler: &mut DeltaHandler<'_>,
    ) -> JournalResult<JournalSeq> {
        let tail = header.tail();
        let tail_addr = block_addr(&tail)?;
        let mut cursor = tail;
        let mut written_to = tail;
        let mut wrapped = false;
        loop {
            let addr = block_addr(&cursor)?;
            if wrapped && addr >= tail_addr {
                break;
            }
            match self.read_validate_record(header, cursor).await? {
                Some((group, md)) => {
                    let length = u64::from(group.mdlength) + u64::from(group.dlength);
                    let locator = RecordLocator {
                        record_block_base: Paddr::block(
                            header.device_id,
                            addr + u64::from(group.mdlength),
                        ),
                        write_result: WriteResult {
                            start_seq: cursor,
                            length,
                        },
                    };
                    trace!("replaying {locator}");
                    handler(locator, &group, &md)?;
                    let next = advance(header, cursor, addr, length);
                    if next.segment_seq != cursor.segment_seq {
                        if wrapped {
                            written_to = next;
                            break;
                        }
                        wrapped = true;
                    }
                    cursor = next;
                    written_to = next;
                }
                None if wrapped => break,
                None => {
                    debug!("no valid record group at {cursor}, trying the next lap");
                    wrapped = true;
                    cursor = wrap_to_start(header, cursor);
                }
            }
        }
        Ok(written_to)
    }
}

#[async_trait]
impl Journal for CircularBoundedJournal {
    fn journal_type(&self) -> JournalType {
        JournalType::RandomBlock
    }

    async fn open_for_mkfs(&self) -> JournalResult<JournalSeq> {
        let header = self.read_header().await?;
        let start = header.tail();
        self.trimmer
            .update_journal_tails(header.dirty_tail, header.alloc_tail);
        let mut state = self.state.lock();
        state.header = Some(header);
        state.written_to = start;
        state.replayed = true;
        state.has_io_error = false;
        info!("opened for mkfs at {start}");
        Ok(start)
    }

    async fn open_for_mount(&self) -> JournalResult<JournalSeq> {
        if !self.state.lock().replayed {
            self.replay(&mut |_, _, _| Ok(())).await?;
        }
        let written_to = self.written_to();
        info!("opened for mount at {written_to}");
        Ok(written_to)
    }

    async fn submit_record(&self, record: Record) -> JournalResult<RecordLocator> {
        let header = self.header()?;
        record.check_alignment(header.block_size)?;
        let group = RecordGroup::from_record(record, header.block_size);
        let length = group.size().encoded_length();
        let mdlength = group.size().mdlength();

        let (encoded, start_seq, addr) = {
            let mut state = self.state.lock();
            if state.has_io_error {
                return Err(JournalError::io("circular journal has a failed write"));
            }
            let mut seq = state.written_to;
            let mut addr = block_addr(&seq)?;
            let wasted = if addr + length > header.journal_end() {
                header.journal_end() - addr
            } else {
                0
            };
            let available =
                header.region_size() - used_between(&header, addr, block_addr(&header.tail())?);
            if length + wasted >= available {
                return Err(JournalError::out_of_range(format!(
                    "record of {length:#x} bytes (+{wasted:#x} wasted) does not fit in {available:#x} available"
                )));
            }
            if wasted > 0 {
                seq = wrap_to_start(&header, seq);
                addr = header.start_addr();
                debug!("wrapping to {seq}, {wasted:#x} bytes skipped");
            }
            // the group stamps its own position
            let encoded = encode_records(&group, seq, header.nonce())?;
            state.written_to = advance(&header, seq, addr, length);
            (encoded, seq, addr)
        };

        trace!("writing {length:#x} bytes at {start_seq}");
        if let Err(e) = self.device.write(addr, encoded).await {
            // replay stops at the hole this write leaves
            error!("write at {start_seq} failed: {e}");
            self.state.lock().has_io_error = true;
            return Err(e.into());
        }
        self.trimmer.set_journal_head(start_seq);
        Ok(RecordLocator {
            record_block_base: Paddr::block(header.device_id, addr + mdlength),
            write_result: WriteResult { start_seq, length },
        })
    }

    async fn replay(&self, handler: &mut DeltaHandler<'_>) -> JournalResult<()> {
        let header = self.read_header().await?;
        info!("replaying from {}", header.tail());
        self.trimmer
            .update_journal_tails(header.dirty_tail, header.alloc_tail);
        let written_to = self.scan(&header, handler).await?;
        info!("replay done, written_to={written_to}");
        let mut state = self.state.lock();
        state.header = Some(header);
        state.written_to = written_to;
        state.replayed = true;
        state.has_io_error = false;
        Ok(())
    }

    async fn close(&self) -> JournalResult<()> {
        let encoded = {
            let mut state = self.state.lock();
            state.replayed = false;
            let Some(header) = state.header.take() else {
                warn!("close without open");
                return Ok(());
            };
            header.encode_block()
        };
        self.device.write(0, encoded).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trimmer::InMemoryTrimmer;
    use seglog_device::InMemoryBlockDevice;

    const BLOCK: u32 = 4096;

    fn device(blocks: u64) -> InMemoryBlockDevice {
        InMemoryBlockDevice::new(DeviceId::new(1), BLOCK, blocks * u64::from(BLOCK))
    }

    fn config(blocks: u64) -> CbjConfig {
        CbjConfig::new()
            .block_size(BLOCK)
            .total_size(blocks * u64::from(BLOCK))
            .device_id(DeviceId::new(1))
    }

    fn journal(device: &InMemoryBlockDevice) -> CircularBoundedJournal {
        CircularBoundedJournal::new(Arc::new(device.clone()), Arc::new(InMemoryTrimmer::new()))
    }

    fn record(data_blocks: usize, tag: u8) -> Record {
        Record::new(
            vec![Bytes::from(vec![tag; data_blocks * BLOCK as usize])],
            vec![Bytes::from(vec![tag; 32])],
            u64::from(tag),
        )
    }

    async fn replay_tags(journal: &CircularBoundedJournal) -> Vec<JournalSeq> {
        let mut found = Vec::new();
        journal
            .replay(&mut |locator: RecordLocator, _: &RecordGroupHeader, _: &Bytes| {
                found.push(locator.write_result.start_seq);
                Ok(())
            })
            .await
            .unwrap();
        found
    }

    #[test]
    fn header_round_trips() {
        let seq = JournalSeq::new(SegmentSeq(3), Paddr::block(DeviceId::new(1), 8192));
        let header = CbjHeader {
            magic: CBJOURNAL_MAGIC,
            uuid: Uuid::new_v4(),
            block_size: BLOCK,
            size: 1 << 20,
            dirty_tail: seq,
            alloc_tail: seq,
            device_id: DeviceId::new(1),
        };
        let block = header.encode_block();
        assert_eq!(block.len(), BLOCK as usize);
        assert_eq!(CbjHeader::decode(&block), Some(header));
        assert_eq!(CbjHeader::decode(&[0; 64]), None);
    }

    #[tokio::test]
    async fn mkfs_then_mount_recovers_geometry() {
        let device = device(16);
        let journal = journal(&device);
        let cfg = config(16);
        journal.mkfs(&cfg).await.unwrap();
        journal.open_for_mkfs().await.unwrap();
        journal.close().await.unwrap();

        let mounted = self::journal(&device);
        let start = mounted.open_for_mount().await.unwrap();
        let header = mounted.current_header().unwrap();
        assert_eq!(header.size, cfg.total_size);
        assert_eq!(header.block_size, BLOCK);
        assert_eq!(header.device_id, cfg.device_id);
        assert_eq!(header.uuid, cfg.uuid);
        assert_eq!(start.offset, Paddr::block(DeviceId::new(1), u64::from(BLOCK)));
        assert_eq!(mounted.total_size().unwrap(), 15 * u64::from(BLOCK));
    }

    #[tokio::test]
    async fn mkfs_rejects_oversized_config() {
        let device = device(8);
        let result = journal(&device).mkfs(&config(16)).await;
        assert!(matches!(result, Err(JournalError::InvalidArgument { .. })));
    }

    #[tokio::test]
    async fn open_without_mkfs_is_no_data() {
        let device = device(8);
        let result = journal(&device).open_for_mkfs().await;
        assert!(matches!(result, Err(JournalError::NoData { .. })));
    }

    #[tokio::test]
    async fn submit_then_replay() {
        let device = device(16);
        let journal = journal(&device);
        journal.mkfs(&config(16)).await.unwrap();
        journal.open_for_mkfs().await.unwrap();

        let a = journal.submit_record(record(1, 1)).await.unwrap();
        let b = journal.submit_record(record(2, 2)).await.unwrap();
        assert_eq!(a.record_block_base, Paddr::block(DeviceId::new(1), 2 * u64::from(BLOCK)));
        assert_eq!(b.write_result.start_seq.offset.offset(), 3 * u64::from(BLOCK));
        assert_eq!(journal.used_size().unwrap(), 5 * u64::from(BLOCK));

        let mounted = self::journal(&device);
        let found = replay_tags(&mounted).await;
        assert_eq!(found, vec![a.write_result.start_seq, b.write_result.start_seq]);
        assert_eq!(mounted.written_to(), journal.written_to());
        // replay is repeatable
        assert_eq!(replay_tags(&mounted).await, found);
    }

    #[tokio::test]
    async fn full_journal_is_out_of_range() {
        let device = device(9);
        let journal = journal(&device);
        journal.mkfs(&config(9)).await.unwrap();
        journal.open_for_mkfs().await.unwrap();

        for tag in 0..3 {
            journal.submit_record(record(1, tag)).await.unwrap();
        }
        assert_eq!(journal.available_size().unwrap(), 2 * u64::from(BLOCK));
        let result = journal.submit_record(record(1, 9)).await;
        assert!(matches!(result, Err(JournalError::OutOfRange { .. })));
    }

    #[tokio::test]
    async fn record_past_end_wraps_to_start() {
        // 8-block region: records at blocks 1, 3, 5; the write position is 7
        let device = device(9);
        let journal = journal(&device);
        journal.mkfs(&config(9)).await.unwrap();
        journal.open_for_mkfs().await.unwrap();
        let mut locators = Vec::new();
        for tag in 0..3 {
            locators.push(journal.submit_record(record(1, tag)).await.unwrap());
        }
        let third = locators[2].write_result.start_seq;
        journal.update_journal_tail(third, third).await.unwrap();

        // three blocks do not fit in the two before the end
        let wrapped = journal.submit_record(record(2, 7)).await.unwrap();
        assert_eq!(
            wrapped.write_result.start_seq,
            JournalSeq::new(SegmentSeq(1), Paddr::block(DeviceId::new(1), u64::from(BLOCK)))
        );
        assert_eq!(journal.used_size().unwrap(), 7 * u64::from(BLOCK));

        let mounted = self::journal(&device);
        let found = replay_tags(&mounted).await;
        assert_eq!(found, vec![third, wrapped.write_result.start_seq]);
        assert_eq!(mounted.written_to(), journal.written_to());
    }

    #[tokio::test]
    async fn failed_write_fails_later_submits() {
        let device = device(16);
        let journal = journal(&device);
        journal.mkfs(&config(16)).await.unwrap();
        journal.open_for_mkfs().await.unwrap();
        let a = journal.submit_record(record(1, 1)).await.unwrap();

        device.faults().fail_next_writes(1);
        let err = journal.submit_record(record(1, 2)).await.unwrap_err();
        assert!(err.is_io());
        let err = journal.submit_record(record(1, 3)).await.unwrap_err();
        assert!(err.is_io());

        // nothing acknowledged is missing after a restart
        let mounted = self::journal(&device);
        assert_eq!(replay_tags(&mounted).await, vec![a.write_result.start_seq]);
        let c = mounted.submit_record(record(1, 3)).await.unwrap();
        assert_eq!(
            replay_tags(&self::journal(&device)).await,
            vec![a.write_result.start_seq, c.write_result.start_seq]
        );
    }

    #[tokio::test]
    async fn tail_update_is_validated() {
        let device = device(16);
        let journal = journal(&device);
        journal.mkfs(&config(16)).await.unwrap();
        let start = journal.open_for_mkfs().await.unwrap();
        let a = journal.submit_record(record(1, 1)).await.unwrap();
        let b = journal.submit_record(record(1, 2)).await.unwrap();
        let (a, b) = (a.write_result.start_seq, b.write_result.start_seq);

        let at = |block: u64| {
            JournalSeq::new(SegmentSeq(0), Paddr::block(DeviceId::new(1), block * u64::from(BLOCK)))
        };
        let beyond = at(12);
        assert!(journal.update_journal_tail(beyond, beyond).await.is_err());
        assert!(journal.update_journal_tail(at(0), b).await.is_err());

        journal.update_journal_tail(b, b).await.unwrap();
        assert!(journal.update_journal_tail(a, b).await.is_err());
        assert!(journal.update_journal_tail(start, start).await.is_err());

        // a failed header write keeps the old tails
        device.faults().fail_next_writes(1);
        let end = journal.written_to();
        assert!(journal.update_journal_tail(end, end).await.is_err());
        let header = journal.current_header().unwrap();
        assert_eq!((header.dirty_tail, header.alloc_tail), (b, b));
    }

    #[tokio::test]
    async fn corrupted_record_ends_replay() {
        let device = device(16);
        let journal = journal(&device);
        journal.mkfs(&config(16)).await.unwrap();
        journal.open_for_mkfs().await.unwrap();
        let a = journal.submit_record(record(1, 1)).await.unwrap();
        let b = journal.submit_record(record(1, 2)).await.unwrap();
        journal.submit_record(record(1, 3)).await.unwrap();

        // flip a data byte of the second record
        let data_addr = b.record_block_base.offset();
        device.corrupt(data_addr, &[0xFF]).unwrap();

        let mounted = self::journal(&device);
        let found = replay_tags(&mounted).await;
        assert_eq!(found, vec![a.write_result.start_seq]);
        assert_eq!(mounted.written_to(), b.write_result.start_seq);
    }
}

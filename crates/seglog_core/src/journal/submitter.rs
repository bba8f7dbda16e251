//! Batching and io-depth control in front of a segment allocator.
//!
//! Submitting a record is a synchronous decision: the record is either
//! written on its own (the fast path, taken when a write is due and the
//! current batch is empty) or appended to the current batch, which is
//! flushed once it is full, dense enough, or the device goes idle. The
//! decision returns a future that resolves when the record is durable.
//!
//! ## I/O States
//!
//! ```text
//! IDLE  (0 writes in flight)
//!   -> PENDING (fewer than io_depth in flight)
//!   -> FULL (io_depth in flight)
//! ```
//!
//! `FULL` is left only when a write completes. While `FULL`, rolling, or
//! after a write error, the submitter is unavailable and callers wait in
//! [`RecordSubmitter::wait_available`].

use super::allocator::SegmentAllocator;
use super::batch::RecordBatch;
use super::promise::SharedPromise;
use crate::config::SubmitterConfig;
use crate::error::{JournalError, JournalResult};
use crate::record::{Record, RecordGroupSize, RecordSize};
use crate::types::{JournalSeq, RecordLocator, WriteResult, JOURNAL_SEQ_NULL};
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, trace};

/// What a caller must do before submitting a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitAction {
    /// The segment cannot take the record; roll first.
    Roll,
    /// The record fills the batch, which will be flushed at once.
    SubmitFull,
    /// The record joins the batch.
    SubmitNotFull,
}

/// Outstanding write level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoState {
    /// No writes in flight.
    Idle,
    /// Some writes in flight, below the limit.
    Pending,
    /// The io-depth limit is reached.
    Full,
}

/// Counters kept by a submitter since it was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitterStats {
    /// Records written.
    pub num_records: u64,
    /// Record groups written.
    pub num_record_groups: u64,
    /// Physical writes issued.
    pub num_io: u64,
    /// Sum of the outstanding write count seen at each issue.
    pub io_depth_sum: u64,
    /// Zero bytes padding metadata up to the block size.
    pub record_group_padding_bytes: u64,
    /// Unpadded metadata bytes.
    pub record_group_metadata_bytes: u64,
    /// Data bytes.
    pub record_group_data_bytes: u64,
}

#[derive(Debug)]
struct SubmitterState {
    io_state: IoState,
    num_outstanding_io: usize,
    committed_to: JournalSeq,
    batches: Vec<RecordBatch>,
    current: usize,
    free_batches: VecDeque<usize>,
    rolling: Option<SharedPromise<()>>,
    io_slot_waiters: Option<SharedPromise<()>>,
    has_io_error: bool,
    stats: SubmitterStats,
}

impl SubmitterState {
    fn is_available(&self) -> bool {
        self.io_state != IoState::Full && self.rolling.is_none() && !self.has_io_error
    }

    fn current_batch(&self) -> &RecordBatch {
        &self.batches[self.current]
    }

    fn update_io_state(&mut self, limit: usize) {
        self.io_state = if self.num_outstanding_io == 0 {
            IoState::Idle
        } else if self.num_outstanding_io < limit {
            IoState::Pending
        } else {
            if self.num_outstanding_io > limit {
                error!(
                    "io-depth overflow: {} outstanding, limit {limit}",
                    self.num_outstanding_io
                );
            }
            IoState::Full
        };
    }

    fn increment_io(&mut self, limit: usize, name: &str) {
        self.num_outstanding_io += 1;
        self.stats.num_io += 1;
        self.stats.io_depth_sum += self.num_outstanding_io as u64;
        self.update_io_state(limit);
        if self.io_state == IoState::Full {
            debug!(
                "{name} outstanding_io={} reaches limit, unavailable",
                self.num_outstanding_io
            );
            self.io_slot_waiters.get_or_insert_with(SharedPromise::new);
        }
    }

    fn account_submission(&mut self, num: usize, size: &RecordGroupSize) {
        self.stats.num_records += num as u64;
        self.stats.num_record_groups += 1;
        self.stats.record_group_padding_bytes += size.mdlength() - size.raw_mdlength();
        self.stats.record_group_metadata_bytes += size.raw_mdlength();
        self.stats.record_group_data_bytes += size.dlength;
    }

    /// Fails everything not yet written and keeps failing from now on.
    fn latch_io_error(&mut self) {
        self.has_io_error = true;
        let current = self.current;
        self.batches[current].abort_pending();
    }
}

struct SubmitterInner {
    io_depth_limit: usize,
    preferred_fullness: f64,
    allocator: Arc<SegmentAllocator>,
    state: Mutex<SubmitterState>,
}

impl SubmitterInner {
    fn name(&self) -> String {
        self.allocator.print_name()
    }

    fn submit(
        self: &Arc<Self>,
        record: Record,
    ) -> JournalResult<BoxFuture<'static, JournalResult<RecordLocator>>> {
        let name = self.name();
        record.check_alignment(self.allocator.block_size())?;

        let mut state = self.state.lock();
        if state.has_io_error {
            error!("{name} I/O is failed before submit");
            return Err(JournalError::io(format!("{name} has failed writes")));
        }
        if !state.is_available() {
            return Err(JournalError::invalid_argument(format!(
                "{name} is unavailable, wait first"
            )));
        }
        let eval = state.current_batch().evaluate_submit(record.size());
        if self
            .allocator
            .needs_roll(eval.submit_size.encoded_length())
        {
            return Err(JournalError::invalid_argument(format!(
                "{name} needs a segment roll before this record"
            )));
        }
        self.allocator.update_modify_time(&record);

        let batch = state.current_batch();
        let needs_flush = state.io_state == IoState::Idle
            || eval.submit_size.fullness() > self.preferred_fullness
            || eval.is_full
            || batch.num_records() + 1 >= batch.batch_capacity();

        if batch.is_empty() && needs_flush && state.io_state != IoState::Full {
            // fast path with direct write
            let committed_to = state.committed_to;
            let (to_write, sizes) =
                batch.submit_pending_fast(record, committed_to, self.allocator.nonce())?;
            let write = self.allocator.write(to_write)?;
            state.increment_io(self.io_depth_limit, &name);
            state.account_submission(1, &sizes);
            debug!(
                "{name} fast submit {sizes:?}, committed_to={committed_to}, outstanding_io={} ...",
                state.num_outstanding_io
            );
            drop(state);

            let mdlength = sizes.mdlength();
            let inner = Arc::clone(self);
            let handle = tokio::spawn(async move {
                let result = write.await;
                {
                    let mut state = inner.state.lock();
                    if let Err(e) = &result {
                        error!("{} fast submit got error {e}", inner.name());
                        state.latch_io_error();
                    }
                    inner.decrement_io_with_flush(&mut state);
                }
                result.map(|write_result| RecordLocator {
                    record_block_base: write_result.start_seq.offset.add_offset(mdlength),
                    write_result,
                })
            });
            return Ok(async move {
                match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(JournalError::io(format!("write task failed: {e}"))),
                }
            }
            .boxed());
        }

        // indirect batched write
        let current = state.current;
        let write_fut = state.batches[current].add_pending(&name, record)?;
        if needs_flush {
            debug!("{name} added pending, flush");
            self.flush_current_batch(&mut state);
        } else {
            debug!(
                "{name} added with {} pending, outstanding_io={}",
                state.current_batch().num_records(),
                state.num_outstanding_io
            );
        }
        Ok(write_fut.boxed())
    }

    fn flush_current_batch(self: &Arc<Self>, state: &mut SubmitterState) {
        let name = self.name();
        let index = state.current;
        if !state.batches[index].is_pending() {
            return;
        }
        let Some(next) = state.free_batches.pop_front() else {
            error!("{name} no free batch slot, flush deferred");
            return;
        };
        state.current = next;

        let num = state.batches[index].num_records();
        let committed_to = state.committed_to;
        let (to_write, sizes) =
            match state.batches[index].encode_batch(committed_to, self.allocator.nonce()) {
                Ok(encoded) => encoded,
                Err(e) => {
                    error!("{name} cannot encode batch: {e}");
                    state.batches[index].abort_pending();
                    state.free_batches.push_front(next);
                    state.current = index;
                    return;
                }
            };
        let write = match self.allocator.write(to_write) {
            Ok(write) => write,
            Err(e) => {
                error!("{name} {num} records, {sizes:?}, got error {e}");
                state.batches[index].set_result(None);
                state.free_batches.push_back(index);
                state.latch_io_error();
                return;
            }
        };
        state.increment_io(self.io_depth_limit, &name);
        state.account_submission(num, &sizes);
        debug!(
            "{name} {num} records, {sizes:?}, committed_to={committed_to}, outstanding_io={} ...",
            state.num_outstanding_io
        );

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = match write.await {
                Ok(write_result) => {
                    trace!("{} {num} records, write done with {write_result}", inner.name());
                    Some(write_result)
                }
                Err(e) => {
                    error!("{} {num} records, got error {e}", inner.name());
                    None
                }
            };
            inner.finish_submit_batch(index, result);
        });
    }

    fn finish_submit_batch(self: &Arc<Self>, index: usize, result: Option<WriteResult>) {
        let mut state = self.state.lock();
        if result.is_none() {
            state.latch_io_error();
        }
        state.batches[index].set_result(result);
        state.free_batches.push_back(index);
        self.decrement_io_with_flush(&mut state);
    }

    fn decrement_io_with_flush(self: &Arc<Self>, state: &mut SubmitterState) {
        debug_assert!(state.num_outstanding_io > 0);
        let prev = state.io_state;
        state.num_outstanding_io = state.num_outstanding_io.saturating_sub(1);
        state.update_io_state(self.io_depth_limit);

        if prev == IoState::Full {
            if let Some(waiters) = state.io_slot_waiters.take() {
                debug!("{} available", self.name());
                waiters.set_value(());
            }
        }
        if state.has_io_error {
            return;
        }

        let batch = state.current_batch();
        let needs_flush = !batch.is_empty()
            && (state.io_state == IoState::Idle
                || batch.submit_size().fullness() > self.preferred_fullness
                || batch.needs_flush());
        if needs_flush {
            debug!("{} flush", self.name());
            self.flush_current_batch(state);
        }
    }
}

/// Concurrency governor in front of one [`SegmentAllocator`].
///
/// Cloning yields another handle to the same submitter.
#[derive(Clone)]
pub struct RecordSubmitter {
    inner: Arc<SubmitterInner>,
}

impl std::fmt::Debug for RecordSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RecordSubmitter")
            .field("io_state", &state.io_state)
            .field("outstanding_io", &state.num_outstanding_io)
            .field("committed_to", &state.committed_to)
            .field("has_io_error", &state.has_io_error)
            .finish_non_exhaustive()
    }
}

impl RecordSubmitter {
    /// Creates a submitter with `io_depth + 1` batch slots.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `config` is invalid.
    pub fn new(config: &SubmitterConfig, allocator: Arc<SegmentAllocator>) -> JournalResult<Self> {
        config.validate()?;
        info!(
            "{} io_depth_limit={}, batch_capacity={}, batch_flush_size={}, preferred_fullness={}",
            allocator.print_name(),
            config.io_depth,
            config.batch_capacity,
            config.batch_flush_size,
            config.preferred_fullness
        );
        let block_size = allocator.block_size();
        let batches: Vec<_> = (0..=config.io_depth)
            .map(|i| RecordBatch::new(i, block_size, config.batch_capacity, config.batch_flush_size))
            .collect();
        let free_batches = (1..=config.io_depth).collect();
        Ok(Self {
            inner: Arc::new(SubmitterInner {
                io_depth_limit: config.io_depth,
                preferred_fullness: config.preferred_fullness,
                allocator,
                state: Mutex::new(SubmitterState {
                    io_state: IoState::Idle,
                    num_outstanding_io: 0,
                    committed_to: JOURNAL_SEQ_NULL,
                    batches,
                    current: 0,
                    free_batches,
                    rolling: None,
                    io_slot_waiters: None,
                    has_io_error: false,
                    stats: SubmitterStats::default(),
                }),
            }),
        })
    }

    /// Log name of the underlying stream.
    #[must_use]
    pub fn name(&self) -> String {
        self.inner.name()
    }

    /// The allocator writes go through.
    #[must_use]
    pub fn allocator(&self) -> &Arc<SegmentAllocator> {
        &self.inner.allocator
    }

    /// Opens the allocator and resets the counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocator cannot open a segment.
    pub async fn open(&self, is_mkfs: bool) -> JournalResult<JournalSeq> {
        let start = self.inner.allocator.open(is_mkfs).await?;
        self.inner.state.lock().stats = SubmitterStats::default();
        debug!("{} opened at {start}", self.name());
        Ok(start)
    }

    /// Closes the allocator and clears the error latch.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if writes are still in flight or pending,
    /// or the allocator error.
    pub async fn close(&self) -> JournalResult<()> {
        {
            let mut state = self.inner.state.lock();
            if state.num_outstanding_io != 0
                || !state.current_batch().is_empty()
                || state.rolling.is_some()
            {
                return Err(JournalError::invalid_argument(format!(
                    "{} cannot close with writes in flight",
                    self.name()
                )));
            }
            state.committed_to = JOURNAL_SEQ_NULL;
            state.has_io_error = false;
        }
        self.inner.allocator.close().await
    }

    /// Returns true if a record may be submitted now.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.inner.state.lock().is_available()
    }

    /// Current outstanding write level.
    #[must_use]
    pub fn io_state(&self) -> IoState {
        self.inner.state.lock().io_state
    }

    /// Number of physical writes in flight.
    #[must_use]
    pub fn num_outstanding_io(&self) -> usize {
        self.inner.state.lock().num_outstanding_io
    }

    /// Returns true once a write has failed.
    #[must_use]
    pub fn has_io_error(&self) -> bool {
        self.inner.state.lock().has_io_error
    }

    /// Waits until the current reason for unavailability clears.
    ///
    /// Availability must be checked again afterwards.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a write failed before or during the wait.
    pub async fn wait_available(&self) -> JournalResult<()> {
        let name = self.name();
        let waiters = {
            let state = self.inner.state.lock();
            if state.has_io_error {
                error!("{name} I/O is failed before wait");
                return Err(JournalError::io(format!("{name} has failed writes")));
            }
            [&state.rolling, &state.io_slot_waiters]
                .into_iter()
                .flatten()
                .map(SharedPromise::get_shared_future)
                .collect::<Vec<_>>()
        };
        for waiter in waiters {
            waiter.wait().await;
        }
        if self.inner.state.lock().has_io_error {
            error!("{name} I/O is failed after wait");
            return Err(JournalError::io(format!("{name} has failed writes")));
        }
        Ok(())
    }

    /// Decides how a record of `size` must be submitted.
    #[must_use]
    pub fn check_action(&self, size: &RecordSize) -> SubmitAction {
        let eval = self.inner.state.lock().current_batch().evaluate_submit(size);
        if self
            .inner
            .allocator
            .needs_roll(eval.submit_size.encoded_length())
        {
            SubmitAction::Roll
        } else if eval.is_full {
            SubmitAction::SubmitFull
        } else {
            SubmitAction::SubmitNotFull
        }
    }

    /// Flushes the pending batch, then closes the segment and opens the
    /// next one in the background. Submissions are refused until it is
    /// done.
    ///
    /// The roll starts before this returns; the future waits for it.
    /// Fails with `InvalidArgument` if a roll is already running, or an
    /// I/O error if the roll failed.
    pub fn roll_segment(&self) -> BoxFuture<'static, JournalResult<()>> {
        let name = self.name();
        {
            let mut state = self.inner.state.lock();
            if state.rolling.is_some() {
                return future::ready(Err(JournalError::invalid_argument(format!(
                    "{name} is already rolling"
                ))))
                .boxed();
            }
            if state.has_io_error {
                return future::ready(Err(JournalError::io(format!(
                    "{name} has failed writes"
                ))))
                .boxed();
            }
            // block concurrent submissions due to rolling
            state.rolling = Some(SharedPromise::new());
            if state.current_batch().is_pending() {
                debug!("{name} flush");
                self.inner.flush_current_batch(&mut state);
            }
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = inner.allocator.roll().await;
            let mut state = inner.state.lock();
            match result {
                Ok(()) => debug!("{} rolling done, available", inner.name()),
                Err(e) => {
                    error!("{} got error {e}, available", inner.name());
                    state.latch_io_error();
                }
            }
            if let Some(rolling) = state.rolling.take() {
                rolling.set_value(());
            }
        });
        let this = self.clone();
        async move { this.wait_available().await }.boxed()
    }

    /// Submits a record.
    ///
    /// The decision to write now or batch is made before this returns; the
    /// future only waits for the outcome. The submitter must be available
    /// and the record must not need a roll.
    pub fn submit(&self, record: Record) -> BoxFuture<'static, JournalResult<RecordLocator>> {
        match self.inner.submit(record) {
            Ok(fut) => fut,
            Err(e) => future::ready(Err(e)).boxed(),
        }
    }

    /// Raises the watermark stamped into subsequent record groups.
    ///
    /// Null or lower values are ignored.
    pub fn update_committed_to(&self, committed_to: JournalSeq) {
        let mut state = self.inner.state.lock();
        if committed_to.is_null() {
            return;
        }
        if state.committed_to.is_null() || committed_to > state.committed_to {
            state.committed_to = committed_to;
        } else {
            trace!(
                "{} ignore committed_to {committed_to} behind {}",
                self.inner.name(),
                state.committed_to
            );
        }
    }

    /// The current committed watermark.
    #[must_use]
    pub fn committed_to(&self) -> JournalSeq {
        self.inner.state.lock().committed_to
    }

    /// Counters since the last open.
    #[must_use]
    pub fn stats(&self) -> SubmitterStats {
        self.inner.state.lock().stats
    }
}

//! Journal tail and head tracking.

use crate::types::{JournalSeq, JOURNAL_SEQ_NULL};
use parking_lot::Mutex;
use tracing::debug;

/// Owner of the journal's trim watermarks.
///
/// The journal reports its head as records become durable and reads the
/// tails when it opens a segment or rewrites its header. Reclamation
/// policy lives behind this trait.
pub trait JournalTrimmer: Send + Sync {
    /// Oldest position whose deltas are still needed on replay.
    fn dirty_tail(&self) -> JournalSeq;

    /// Oldest position whose allocation records are still needed.
    fn alloc_tail(&self) -> JournalSeq;

    /// Replaces both tails.
    fn update_journal_tails(&self, dirty_tail: JournalSeq, alloc_tail: JournalSeq);

    /// Reports the start of the latest durable record group.
    fn set_journal_head(&self, head: JournalSeq);

    /// Returns the latest reported head.
    fn journal_head(&self) -> JournalSeq;
}

#[derive(Debug)]
struct TrimmerState {
    dirty_tail: JournalSeq,
    alloc_tail: JournalSeq,
    head: JournalSeq,
}

/// A trimmer that only remembers the watermarks.
#[derive(Debug)]
pub struct InMemoryTrimmer {
    state: Mutex<TrimmerState>,
}

impl Default for InMemoryTrimmer {
    fn default() -> Self {
        Self {
            state: Mutex::new(TrimmerState {
                dirty_tail: JOURNAL_SEQ_NULL,
                alloc_tail: JOURNAL_SEQ_NULL,
                head: JOURNAL_SEQ_NULL,
            }),
        }
    }
}

impl InMemoryTrimmer {
    /// Creates a trimmer with null tails and head.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl JournalTrimmer for InMemoryTrimmer {
    fn dirty_tail(&self) -> JournalSeq {
        self.state.lock().dirty_tail
    }

    fn alloc_tail(&self) -> JournalSeq {
        self.state.lock().alloc_tail
    }

    fn update_journal_tails(&self, dirty_tail: JournalSeq, alloc_tail: JournalSeq) {
        debug!("update journal tails: dirty={dirty_tail}, alloc={alloc_tail}");
        let mut state = self.state.lock();
        state.dirty_tail = dirty_tail;
        state.alloc_tail = alloc_tail;
    }

    fn set_journal_head(&self, head: JournalSeq) {
        let mut state = self.state.lock();
        // heads reported out of order never move the head backwards
        if state.head.is_null() || head > state.head {
            state.head = head;
        }
    }

    fn journal_head(&self) -> JournalSeq {
        self.state.lock().head
    }
}

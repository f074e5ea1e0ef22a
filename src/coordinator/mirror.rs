//! In-memory mirror of the remote run state.
//!
//! The mirror holds the latest full snapshot and nothing else. Each ingestion replaces
//! the snapshot wholesale through a single swap on a `watch` channel, so readers always
//! see a complete snapshot. Fetches are ticketed: a snapshot whose ticket is older than
//! the last one ingested (or issued before a `clear`) is dropped.

use chrono::{DateTime, Utc};
use reelforge_common::PipelineRun;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// Ordering token taken before a fetch is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FetchTicket(u64);

/// What the mirror currently holds.
#[derive(Debug, Clone, Default)]
pub struct MirrorState {
    pub run: Option<Arc<PipelineRun>>,
    /// Incremented whenever the mirrored snapshot actually changes
    pub version: u64,
    pub fetched_at: Option<DateTime<Utc>>,
    last_ticket: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Replaced,
    /// Identical to what was already mirrored.
    Unchanged,
    /// Older than a snapshot already ingested, or issued before the last clear.
    Stale,
}

#[derive(Debug)]
pub struct RunMirror {
    tx: watch::Sender<MirrorState>,
    next_ticket: AtomicU64,
}

impl RunMirror {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(MirrorState::default());
        Self {
            tx,
            next_ticket: AtomicU64::new(0),
        }
    }

    /// The mirrored snapshot, if a run is being tracked.
    pub fn current(&self) -> Option<Arc<PipelineRun>> {
        self.tx.borrow().run.clone()
    }

    pub fn state(&self) -> MirrorState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MirrorState> {
        self.tx.subscribe()
    }

    pub(crate) fn issue_ticket(&self) -> FetchTicket {
        FetchTicket(self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Replace the mirrored snapshot with `snapshot`, verbatim.
    pub(crate) fn ingest(&self, ticket: FetchTicket, snapshot: PipelineRun) -> IngestOutcome {
        let mut outcome = IngestOutcome::Stale;
        self.tx.send_if_modified(|state| {
            if ticket.0 <= state.last_ticket {
                return false;
            }
            state.last_ticket = ticket.0;
            state.fetched_at = Some(Utc::now());
            if state.run.as_deref() == Some(&snapshot) {
                outcome = IngestOutcome::Unchanged;
                return false;
            }
            state.run = Some(Arc::new(snapshot));
            state.version += 1;
            outcome = IngestOutcome::Replaced;
            true
        });
        outcome
    }

    /// Drop the mirrored run. Tickets issued before this call become stale.
    pub(crate) fn clear(&self) {
        let floor = self.next_ticket.load(Ordering::SeqCst);
        self.tx.send_modify(|state| {
            state.run = None;
            state.fetched_at = None;
            state.version += 1;
            state.last_ticket = state.last_ticket.max(floor);
        });
    }
}

impl Default for RunMirror {
    fn default() -> Self {
        Self::new()
    }
}

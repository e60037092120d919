//! Run-wide shared state: the abort signal and the counters every stage reads.

use crate::error::Error;
use serde::Serialize;
use std::sync::{
    Mutex, OnceLock,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every fragment was emitted
    Drained,
    /// Cumulative cost exceeded the budget
    Budget,
    /// The configured number of outputs was emitted
    OutputLimit,
    /// The run-time limit elapsed
    TimeLimit,
    /// A fatal error stopped the run
    Fatal,
}

impl StopReason {
    /// Whether the run stopped before all input was processed.
    #[must_use]
    pub const fn is_early(self) -> bool {
        !matches!(self, Self::Drained)
    }
}

/// State shared by the reader, the workers and the printer of one run.
///
/// The first call to [`RunState::stop`] wins: it records the reason and
/// cancels the token every stage selects on.
#[derive(Debug, Default)]
pub(crate) struct RunState {
    cancel: CancellationToken,
    stop_reason: OnceLock<StopReason>,
    fatal: Mutex<Option<Error>>,

    /// Sum of costs of accepted attempts
    pub(crate) cost: AtomicU64,
    /// Fragments that exhausted their attempts
    pub(crate) failures: AtomicUsize,
    /// Generation calls currently running
    pub(crate) in_flight: AtomicUsize,
    /// Fragments created but not yet emitted
    pub(crate) outstanding: AtomicUsize,
    /// Generation attempts started
    pub(crate) attempts: AtomicUsize,
    /// Input files the reader managed to open
    pub(crate) files_opened: AtomicUsize,
    /// Fragments created by the reader
    pub(crate) fragments_read: AtomicUsize,
    /// Fragments emitted by the printer
    pub(crate) emitted: AtomicUsize,
    /// Successful fragments emitted by the printer
    pub(crate) succeeded: AtomicUsize,

    finished_reading: AtomicBool,
    reading_done: Notify,
}

impl RunState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when the run stops for any reason.
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Requests a cooperative stop. Later calls keep the first reason.
    pub(crate) fn stop(&self, reason: StopReason) {
        if self.stop_reason.set(reason).is_ok() {
            debug!(?reason, "Stopping run");
        }
        self.cancel.cancel();
    }

    /// Stops the run because of an error that must surface to the caller.
    pub(crate) fn fail(&self, error: Error) {
        if let Ok(mut slot) = self.fatal.lock() {
            slot.get_or_insert(error);
        }
        self.stop(StopReason::Fatal);
    }

    pub(crate) fn take_fatal(&self) -> Option<Error> {
        self.fatal.lock().ok().and_then(|mut slot| slot.take())
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason.get().copied()
    }

    /// Adds the cost of an accepted attempt and returns the new total.
    pub(crate) fn add_cost(&self, cost: u64) -> u64 {
        self.cost.fetch_add(cost, Ordering::SeqCst) + cost
    }

    pub(crate) fn file_opened(&self) {
        self.files_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fragment_created(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.fragments_read.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one emission; returns the total number emitted so far.
    pub(crate) fn fragment_emitted(&self, successful: bool) -> usize {
        if successful {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        }
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.emitted.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn finish_reading(&self) {
        self.finished_reading.store(true, Ordering::SeqCst);
        self.reading_done.notify_waiters();
    }

    /// Resolves once the reader has pushed its last fragment.
    pub(crate) async fn reading_finished(&self) {
        let notified = self.reading_done.notified();
        if self.finished_reading.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }

    /// Reader finished and every created fragment has been emitted.
    pub(crate) fn is_drained(&self) -> bool {
        self.finished_reading.load(Ordering::SeqCst) && self.outstanding.load(Ordering::SeqCst) == 0
    }
}

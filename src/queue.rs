use crate::fragment::Fragment;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

/// Input queue between the reader and the workers.
///
/// Fresh fragments go through a bounded lane, so the reader suspends once
/// `capacity` fragments are waiting. Fragments sent back for another attempt
/// go through an unbounded retry lane that workers drain first; the number of
/// fragments in it never exceeds the number of workers, and a worker can
/// always requeue without waiting on the other workers.
#[derive(Debug, Clone)]
pub(crate) struct WorkQueue {
    fresh: mpsc::Sender<Fragment>,
    retry: mpsc::UnboundedSender<Fragment>,
    receivers: Arc<Mutex<Receivers>>,
}

#[derive(Debug)]
struct Receivers {
    fresh: mpsc::Receiver<Fragment>,
    retry: mpsc::UnboundedReceiver<Fragment>,
}

impl WorkQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let (fresh, fresh_rx) = mpsc::channel(capacity.max(1));
        let (retry, retry_rx) = mpsc::unbounded_channel();

        Self {
            fresh,
            retry,
            receivers: Arc::new(Mutex::new(Receivers {
                fresh: fresh_rx,
                retry: retry_rx,
            })),
        }
    }

    /// Pushes a new fragment, waiting while the queue is full.
    ///
    /// Returns `false` if the queue has been closed.
    pub(crate) async fn push(&self, fragment: Fragment) -> bool {
        self.fresh.send(fragment).await.is_ok()
    }

    /// Sends a fragment back for another attempt without waiting.
    pub(crate) fn requeue(&self, fragment: Fragment) -> bool {
        self.retry.send(fragment).is_ok()
    }

    /// Takes the next fragment, preferring retries over fresh work.
    ///
    /// Returns `None` once both lanes are closed and empty.
    pub(crate) async fn pop(&self) -> Option<Fragment> {
        let mut rx = self.receivers.lock().await;
        let Receivers { fresh, retry } = &mut *rx;

        tokio::select! {
            biased;
            Some(fragment) = retry.recv() => Some(fragment),
            Some(fragment) = fresh.recv() => Some(fragment),
            else => None,
        }
    }
}

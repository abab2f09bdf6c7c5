use std::future::pending;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

// Cooperative cancellation. A `CancelSource` is held by whoever owns an
// activity; `Cancel` handles are passed down into every suspension point so
// that storage flushes, outbound RPCs, and timer waits can all be
// interrupted. Once a cancel has fired, the activity it interrupted must
// not be resumed.
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        CancelSource { tx }
    }

    // Returns a handle that observes this source.
    pub fn signal(&self) -> Cancel {
        Cancel {
            rx: Some(self.tx.subscribe()),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// A cheap, cloneable view of a `CancelSource`.
#[derive(Clone)]
pub struct Cancel {
    // None means "never fires"; see `Cancel::never`.
    rx: Option<watch::Receiver<bool>>,
}

impl Cancel {
    // Returns a handle that never fires, for callers that have no owner to
    // answer to (mostly tests).
    pub fn never() -> Self {
        Cancel { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        match &self.rx {
            Some(rx) => *rx.borrow(),
            None => false,
        }
    }

    // Resolves once the source has fired. Pends forever on a `never` handle,
    // and also when the source is dropped without firing: destruction
    // without cancellation means the owner never asked us to stop.
    pub async fn cancelled(&self) {
        let mut rx = match &self.rx {
            Some(rx) => rx.clone(),
            None => return pending::<()>().await,
        };
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return pending::<()>().await;
            }
        }
    }
}

// Holds on to the handle of a spawned activity and aborts it upon
// destruction. Callers drop the guard (or replace it) to stop the activity,
// ensuring nothing keeps running past its owner.
pub(crate) struct TaskGuard {
    name: String,
    handle: JoinHandle<()>,
}

impl TaskGuard {
    pub(crate) fn new(name: &str, handle: JoinHandle<()>) -> Self {
        TaskGuard {
            name: name.to_string(),
            handle,
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.handle.abort();
        debug!(name = %self.name, "aborted task");
    }
}

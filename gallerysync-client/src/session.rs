use std::time::Duration;

use gallerysync_core::{EVENT_DATA_PROCESSED, EVENT_PROCESSING_ERROR, ProcessingFailed};
use serde_json::Value;
use tokio::{sync::watch, task::JoinHandle, time::timeout};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

use crate::{
    channel::{Channel, Subscription},
    error::ValidationError,
    gallery::{DuplicatePolicy, GallerySnapshot, GalleryStore},
    pending::{PendingTracker, SharedPending},
};

/// A mounted gallery: the subscriptions plus the loop that reconciles them
/// into a [`GalleryStore`].
///
/// The subscriptions live inside the loop task, so unmounting (or dropping the
/// view) releases them and a torn-down view can never be updated again.
#[derive(Debug)]
pub struct GalleryView {
    snapshot_rx: watch::Receiver<GallerySnapshot>,
    task: Option<JoinHandle<()>>,
}

impl GalleryView {
    pub fn mount(channel: &Channel, policy: DuplicatePolicy, pending: SharedPending) -> Self {
        let results = channel.subscribe(EVENT_DATA_PROCESSED);
        let failures = channel.subscribe(EVENT_PROCESSING_ERROR);
        let store = GalleryStore::new(policy);
        let snapshot_rx = store.subscribe();

        let task = tokio::spawn(reconcile(store, results, failures, pending));
        debug!(?policy, "gallery view mounted");

        Self {
            snapshot_rx,
            task: Some(task),
        }
    }

    pub fn snapshot(&self) -> GallerySnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Current snapshot first, then one per change.
    pub fn snapshots(&self) -> WatchStream<GallerySnapshot> {
        WatchStream::new(self.snapshot_rx.clone())
    }

    /// Waits until a snapshot satisfies `predicate`, or `None` after `within`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&GallerySnapshot) -> bool,
        within: Duration,
    ) -> Option<GallerySnapshot> {
        let mut rx = self.snapshot_rx.clone();
        match timeout(within, rx.wait_for(predicate)).await {
            Ok(Ok(snapshot)) => Some(snapshot.clone()),
            _ => None,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub async fn unmount(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        info!("gallery view unmounted");
    }
}

impl Drop for GalleryView {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn reconcile(
    mut store: GalleryStore,
    mut results: Subscription,
    mut failures: Subscription,
    pending: SharedPending,
) {
    loop {
        tokio::select! {
            raw = results.recv() => {
                let Some(raw) = raw else { break };
                match store.on_result_event(&raw) {
                    Ok(item) => {
                        PendingTracker::lock(&pending).resolve(&item.text);
                        info!(
                            sid = %item.id,
                            human_count = item.human_count,
                            total = store.len(),
                            "gallery item added"
                        );
                    }
                    Err(ValidationError::DuplicateId(sid)) => {
                        // Rejection runs after full validation, so the text is present.
                        let text = raw.get("text").and_then(Value::as_str).unwrap_or_default();
                        PendingTracker::lock(&pending).resolve(text);
                        warn!(sid = %sid, "dropping {} event: duplicate id", EVENT_DATA_PROCESSED);
                    }
                    Err(err) => warn!("dropping {} event: {}", EVENT_DATA_PROCESSED, err),
                }
            }
            raw = failures.recv() => {
                let Some(raw) = raw else { break };
                match serde_json::from_value::<ProcessingFailed>(raw) {
                    Ok(failed) => {
                        PendingTracker::lock(&pending).resolve(&failed.text);
                        warn!(text = %failed.text, "remote processing failed: {}", failed.reason);
                    }
                    Err(err) => {
                        warn!("dropping malformed {} event: {}", EVENT_PROCESSING_ERROR, err);
                    }
                }
            }
        }
    }
    debug!("reconciliation loop stopped");
}

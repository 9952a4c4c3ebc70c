use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

/// A submission that was emitted and has not been answered yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSubmission {
    pub text: String,
    pub emitted_at: Instant,
}

pub type SharedPending = Arc<Mutex<PendingTracker>>;

/// Emitted-but-unanswered submissions, oldest first.
///
/// Results carry no request id, so they are matched back by text, falling
/// back to the oldest entry.
#[derive(Debug, Default)]
pub struct PendingTracker {
    entries: VecDeque<PendingSubmission>,
}

impl PendingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedPending {
        Arc::new(Mutex::new(Self::new()))
    }

    // Nothing panics while the lock is held, so a poisoned tracker is still consistent.
    pub fn lock(shared: &SharedPending) -> MutexGuard<'_, PendingTracker> {
        shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&mut self, text: impl Into<String>, emitted_at: Instant) {
        self.entries.push_back(PendingSubmission {
            text: text.into(),
            emitted_at,
        });
    }

    pub fn resolve(&mut self, text: &str) -> Option<PendingSubmission> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.text == text)
            .unwrap_or(0);
        self.entries.remove(index)
    }

    /// Entries outstanding for longer than `timeout` as of `now`.
    pub fn overdue(&self, now: Instant, timeout: Duration) -> Vec<PendingSubmission> {
        self.entries
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.emitted_at) > timeout)
            .cloned()
            .collect()
    }

    /// Removes and returns the entries [`overdue`](Self::overdue) would list.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<PendingSubmission> {
        let (expired, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| now.saturating_duration_since(entry.emitted_at) > timeout);
        self.entries = kept;
        expired.into()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

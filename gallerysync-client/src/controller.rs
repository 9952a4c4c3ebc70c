use std::{path::PathBuf, time::Instant};

use gallerysync_core::{EVENT_PROCESS_DATA, MAX_SUBMISSION_FILE_BYTES, MAX_TEXT_BYTES, ProcessData};
use tracing::{debug, info, warn};

use crate::{
    channel::Channel,
    encoder::encode_file,
    error::SubmitError,
    pending::{PendingTracker, SharedPending},
};

/// What the user has picked and typed so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormState {
    pub file: Option<PathBuf>,
    pub text: String,
}

impl FormState {
    pub fn is_ready(&self) -> bool {
        self.file.is_some() && !self.text.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionPhase {
    Idle,
    Encoding,
    Emitted,
}

#[derive(Debug)]
pub enum SubmitOutcome {
    /// No file or no text; nothing happened.
    Skipped,
    Emitted,
    /// Nothing was sent and the form was left as it was.
    Abandoned(SubmitError),
}

/// Turns the form into a `process_data` event.
///
/// Owns only transient form state. It never waits on the service: the result
/// shows up later through the gallery view's subscription.
#[derive(Debug)]
pub struct SubmissionController {
    channel: Channel,
    pending: SharedPending,
    form: FormState,
    phase: SubmissionPhase,
    max_file_bytes: u64,
}

impl SubmissionController {
    pub fn new(channel: Channel, pending: SharedPending) -> Self {
        Self {
            channel,
            pending,
            form: FormState::default(),
            phase: SubmissionPhase::Idle,
            max_file_bytes: MAX_SUBMISSION_FILE_BYTES as u64,
        }
    }

    #[must_use]
    pub fn with_max_file_bytes(mut self, max_file_bytes: u64) -> Self {
        self.max_file_bytes = max_file_bytes.min(MAX_SUBMISSION_FILE_BYTES as u64);
        self
    }

    pub fn select_file(&mut self, path: impl Into<PathBuf>) {
        self.form.file = Some(path.into());
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.form.text = text.into();
    }

    pub fn form(&self) -> &FormState {
        &self.form
    }

    pub fn phase(&self) -> SubmissionPhase {
        self.phase
    }

    pub async fn submit(&mut self) -> SubmitOutcome {
        let Some(path) = self.form.file.clone().filter(|_| self.form.is_ready()) else {
            debug!("submit ignored: form is incomplete");
            return SubmitOutcome::Skipped;
        };
        if self.form.text.len() > MAX_TEXT_BYTES {
            warn!(bytes = self.form.text.len(), "submission abandoned: description too long");
            return SubmitOutcome::Abandoned(SubmitError::TextTooLong);
        }

        self.phase = SubmissionPhase::Encoding;
        let image = match encode_file(&path, self.max_file_bytes).await {
            Ok(image) => image,
            Err(err) => {
                warn!(file = %path.display(), "submission abandoned: {}", err);
                self.phase = SubmissionPhase::Idle;
                return SubmitOutcome::Abandoned(err.into());
            }
        };

        let request = ProcessData {
            text: self.form.text.clone(),
            image,
        };
        if let Err(err) = self.channel.emit(EVENT_PROCESS_DATA, &request) {
            warn!(file = %path.display(), "submission abandoned: {}", err);
            self.phase = SubmissionPhase::Idle;
            return SubmitOutcome::Abandoned(err.into());
        }
        self.phase = SubmissionPhase::Emitted;

        PendingTracker::lock(&self.pending).record(request.text.clone(), Instant::now());
        info!(
            file = %path.display(),
            media_type = request.image.media_type(),
            bytes = request.image.decoded_len(),
            "submission emitted"
        );

        self.form = FormState::default();
        self.phase = SubmissionPhase::Idle;
        SubmitOutcome::Emitted
    }
}

use std::{io, path::PathBuf, time::Duration};

use gallerysync_core::{CoreError, MAX_TEXT_BYTES};
use thiserror::Error;

/// The selected file could not be turned into a transport encoding.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} is empty", .path.display())]
    Empty { path: PathBuf },
    #[error("{} is {size} bytes, limit is {max}", .path.display())]
    TooLarge { path: PathBuf, size: u64, max: u64 },
    #[error("file read was interrupted: {0}")]
    Interrupted(String),
    #[error("could not encode file: {0}")]
    Encoding(#[from] CoreError),
}

/// An inbound `data_processed` payload was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),
    #[error("field `human_count` must be a non-negative integer, got {0}")]
    InvalidCount(String),
    #[error("invalid image: {0}")]
    InvalidImage(CoreError),
    #[error("item `{0}` is already in the gallery")]
    DuplicateId(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid server URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported URL scheme `{0}`, expected ws or wss")]
    UnsupportedScheme(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("could not frame outbound event: {0}")]
    Frame(#[from] CoreError),
}

/// Why a submission was abandoned before anything was emitted.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("description exceeds {} bytes", MAX_TEXT_BYTES)]
    TextTooLong,
}

use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

pub const EVENT_PROCESS_DATA: &str = "process_data";
pub const EVENT_DATA_PROCESSED: &str = "data_processed";
pub const EVENT_PROCESSING_ERROR: &str = "processing_error";

pub const MAX_EVENT_FRAME_BYTES: usize = 8 * 1024 * 1024;
pub const MAX_EVENT_NAME_LEN: usize = 64;
pub const MAX_MEDIA_TYPE_LEN: usize = 128;
pub const MAX_TEXT_BYTES: usize = 16 * 1024;
/// Room left in a `process_data` frame for the envelope and the text field.
pub const FRAME_OVERHEAD_RESERVE: usize = 64 * 1024;
/// Largest raw file that still fits in a `process_data` frame once base64-encoded.
pub const MAX_SUBMISSION_FILE_BYTES: usize =
    (MAX_EVENT_FRAME_BYTES - FRAME_OVERHEAD_RESERVE) / 4 * 3;

pub const RESULT_MEDIA_TYPE: &str = "image/jpeg";
pub const FALLBACK_MEDIA_TYPE: &str = "application/octet-stream";

const DATA_URL_SCHEME: &str = "data:";
const BASE64_MARKER: &str = ";base64,";

pub type ItemId = String;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("event name must be non-empty and <= 64 chars")]
    InvalidEventName,
    #[error("event frame is {size} bytes, limit is {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("no image data")]
    MissingImage,
    #[error("malformed data URL")]
    MalformedDataUrl,
    #[error("media type must be of the form type/subtype and <= 128 chars")]
    InvalidMediaType,
    #[error("corrupt base64 payload: {0}")]
    InvalidBase64(String),
}

/// One named event on the wire: `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn from_payload<T: Serialize>(event: &str, payload: &T) -> Result<Self, CoreError> {
        let data =
            serde_json::to_value(payload).map_err(|err| CoreError::Serialization(err.to_string()))?;
        Ok(Self::new(event, data))
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, CoreError> {
        T::deserialize(&self.data).map_err(|err| CoreError::Serialization(err.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessData {
    pub text: String,
    pub image: TransportEncoding,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataProcessed {
    pub sid: ItemId,
    /// Raw base64 JPEG bytes, without a data URL header.
    pub image: String,
    pub text: String,
    pub human_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessingFailed {
    pub reason: String,
    #[serde(default)]
    pub text: String,
}

pub fn encode_event_frame(envelope: &EventEnvelope) -> Result<String, CoreError> {
    validate_event_name(&envelope.event)?;
    let frame =
        serde_json::to_string(envelope).map_err(|err| CoreError::Serialization(err.to_string()))?;
    if frame.len() > MAX_EVENT_FRAME_BYTES {
        return Err(CoreError::FrameTooLarge {
            size: frame.len(),
            max: MAX_EVENT_FRAME_BYTES,
        });
    }
    Ok(frame)
}

pub fn decode_event_frame(frame: &str) -> Result<EventEnvelope, CoreError> {
    if frame.len() > MAX_EVENT_FRAME_BYTES {
        return Err(CoreError::FrameTooLarge {
            size: frame.len(),
            max: MAX_EVENT_FRAME_BYTES,
        });
    }
    let envelope: EventEnvelope =
        serde_json::from_str(frame).map_err(|err| CoreError::Serialization(err.to_string()))?;
    validate_event_name(&envelope.event)?;
    Ok(envelope)
}

fn validate_event_name(name: &str) -> Result<(), CoreError> {
    if name.trim().is_empty() || name.len() > MAX_EVENT_NAME_LEN {
        return Err(CoreError::InvalidEventName);
    }
    Ok(())
}

/// Binary data carried as text: `data:<media-type>;base64,<payload>`.
///
/// Construction always validates, so a value of this type is known to carry
/// a non-empty, decodable payload. Parsing keeps "no image" (`MissingImage`)
/// apart from a corrupt header or payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransportEncoding {
    media_type: String,
    data: String,
}

impl TransportEncoding {
    pub fn from_bytes(media_type: &str, bytes: &[u8]) -> Result<Self, CoreError> {
        validate_media_type(media_type)?;
        if bytes.is_empty() {
            return Err(CoreError::MissingImage);
        }
        Ok(Self {
            media_type: media_type.to_owned(),
            data: STANDARD.encode(bytes),
        })
    }

    /// Wraps an already base64-encoded payload with a media-type header.
    pub fn from_raw_base64(media_type: &str, raw: &str) -> Result<Self, CoreError> {
        validate_media_type(media_type)?;
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CoreError::MissingImage);
        }
        STANDARD
            .decode(raw)
            .map_err(|err| CoreError::InvalidBase64(err.to_string()))?;
        Ok(Self {
            media_type: media_type.to_owned(),
            data: raw.to_owned(),
        })
    }

    pub fn parse(value: &str) -> Result<Self, CoreError> {
        if value.trim().is_empty() {
            return Err(CoreError::MissingImage);
        }
        let rest = value
            .strip_prefix(DATA_URL_SCHEME)
            .ok_or(CoreError::MalformedDataUrl)?;
        let (media_type, payload) = rest
            .split_once(BASE64_MARKER)
            .ok_or(CoreError::MalformedDataUrl)?;
        Self::from_raw_base64(media_type, payload)
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// The base64 payload without the header.
    pub fn base64_data(&self) -> &str {
        &self.data
    }

    pub fn decode(&self) -> Result<Vec<u8>, CoreError> {
        STANDARD
            .decode(&self.data)
            .map_err(|err| CoreError::InvalidBase64(err.to_string()))
    }

    /// Length of the decoded payload, computed without decoding.
    pub fn decoded_len(&self) -> usize {
        let padding = self.data.bytes().rev().take_while(|b| *b == b'=').count();
        (self.data.len() / 4 * 3).saturating_sub(padding)
    }
}

impl fmt::Display for TransportEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{DATA_URL_SCHEME}{}{BASE64_MARKER}{}", self.media_type, self.data)
    }
}

impl From<TransportEncoding> for String {
    fn from(value: TransportEncoding) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for TransportEncoding {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

fn validate_media_type(media_type: &str) -> Result<(), CoreError> {
    let valid_chars = media_type
        .bytes()
        .all(|b| b.is_ascii_graphic() && b != b';' && b != b',');
    let shape_ok = media_type
        .split_once('/')
        .is_some_and(|(kind, subtype)| !kind.is_empty() && !subtype.is_empty());
    if media_type.len() > MAX_MEDIA_TYPE_LEN || !valid_chars || !shape_ok {
        return Err(CoreError::InvalidMediaType);
    }
    Ok(())
}

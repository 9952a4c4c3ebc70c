use std::{
    fs,
    path::{Path, PathBuf},
};

use gallerysync_core::{FALLBACK_MEDIA_TYPE, TransportEncoding};

use crate::error::EncodeError;

/// Reads the whole file and wraps it as a data URL.
///
/// The read runs on the blocking pool, so the calling task suspends without
/// stalling the runtime. Nothing is retried and no partial encoding is ever
/// returned.
pub async fn encode_file(path: &Path, max_bytes: u64) -> Result<TransportEncoding, EncodeError> {
    let owned = path.to_path_buf();
    let (media_type, data) = tokio::task::spawn_blocking(move || read_file(owned, max_bytes))
        .await
        .map_err(|err| EncodeError::Interrupted(err.to_string()))??;

    Ok(TransportEncoding::from_bytes(media_type, &data)?)
}

fn read_file(path: PathBuf, max_bytes: u64) -> Result<(&'static str, Vec<u8>), EncodeError> {
    let meta = fs::metadata(&path).map_err(|source| EncodeError::Io {
        path: path.clone(),
        source,
    })?;
    if meta.len() > max_bytes {
        return Err(EncodeError::TooLarge {
            path,
            size: meta.len(),
            max: max_bytes,
        });
    }

    let data = fs::read(&path).map_err(|source| EncodeError::Io {
        path: path.clone(),
        source,
    })?;

    // The file may have changed since the metadata call.
    let size = data.len() as u64;
    if size == 0 {
        return Err(EncodeError::Empty { path });
    }
    if size > max_bytes {
        return Err(EncodeError::TooLarge {
            path,
            size,
            max: max_bytes,
        });
    }

    Ok((detect_media_type(&path, &data), data))
}

/// Magic bytes win over the extension; unknown content is `application/octet-stream`.
pub fn detect_media_type(path: &Path, bytes: &[u8]) -> &'static str {
    sniff_media_type(bytes)
        .or_else(|| media_type_from_extension(path))
        .unwrap_or(FALLBACK_MEDIA_TYPE)
}

fn sniff_media_type(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        [0xFF, 0xD8, 0xFF, ..] => Some("image/jpeg"),
        [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some("image/png"),
        [b'G', b'I', b'F', b'8', ..] => Some("image/gif"),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some("image/webp"),
        [b'B', b'M', ..] => Some("image/bmp"),
        _ => None,
    }
}

fn media_type_from_extension(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "jpg" | "jpeg" | "jfif" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        "tif" | "tiff" => Some("image/tiff"),
        "heic" => Some("image/heic"),
        "avif" => Some("image/avif"),
        _ => None,
    }
}

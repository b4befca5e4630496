//! Media server abstraction.
//!
//! Backends without native uploads (IRC, XMPP) need in-band file bytes
//! turned into durable URLs. A [`MediaServer`] does exactly one thing:
//! accept a file and return a public download URL. Three variants exist,
//! selected from the `[general]` section:
//!
//! - `MediaServerUpload = "http(s)://…"` — HTTP PUT to an operator endpoint
//! - `MediaServerUpload = "s3://<bucket>[/<prefix>]"` — S3-compatible store
//! - empty upload URL with `MediaDownloadPath` set — local filesystem
//!
//! Files are stored under `<sha1-prefix>/<sanitized-name>`, where the
//! prefix is the first eight hex characters of the SHA-1 of the bytes.

mod http_put;
mod local;
mod s3;

use std::sync::Arc;

use async_trait::async_trait;
use sha1::{Digest, Sha1};

use chatweave_types::config::GeneralConfig;
use chatweave_types::{ChatweaveError, FileInfo, Result};

pub use http_put::HttpPutMedia;
pub use local::LocalMedia;
pub use s3::S3Media;

// ---------------------------------------------------------------------------
// MediaServer trait
// ---------------------------------------------------------------------------

/// A pluggable file re-hoster.
#[async_trait]
pub trait MediaServer: Send + Sync + std::fmt::Debug {
    /// Stores the file's bytes and returns the public download URL.
    async fn upload(&self, file: &FileInfo) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Builds the configured media server, if any.
///
/// Returns `Ok(None)` when neither `MediaServerUpload` nor
/// `MediaDownloadPath` is set. The S3 variant performs a HEAD on the bucket
/// here so a misconfigured store fails at startup, not on the first upload.
pub async fn from_config(general: &GeneralConfig) -> Result<Option<Arc<dyn MediaServer>>> {
    if general.media_server_upload.is_empty() && general.media_download_path.is_empty() {
        return Ok(None);
    }

    if !general.media_server_upload.is_empty() {
        let upload = general.media_server_upload.as_str();
        if upload.starts_with("http://") || upload.starts_with("https://") {
            return Ok(Some(Arc::new(HttpPutMedia::new(
                upload,
                &general.media_server_download,
            )?)));
        }
        if upload.starts_with("s3://") {
            return Ok(Some(Arc::new(S3Media::new(general).await?)));
        }
        return Err(ChatweaveError::Config {
            reason: format!("unknown scheme for MediaServerUpload: '{upload}'"),
        });
    }

    Ok(Some(Arc::new(LocalMedia::new(
        &general.media_download_path,
        &general.media_server_download,
    ))))
}

// ---------------------------------------------------------------------------
// Naming rules
// ---------------------------------------------------------------------------

/// First eight hex characters of the SHA-1 of the bytes.
pub fn sha1_prefix(data: &[u8]) -> String {
    let digest = Sha1::digest(data);
    hex::encode(digest)[..8].to_string()
}

/// Replaces runs of non-alphanumeric characters in the stem with a single
/// underscore; the extension is reattached untouched.
pub fn sanitize_filename(name: &str) -> String {
    let (stem, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    };

    let mut out = String::with_capacity(stem.len());
    let mut in_run = false;
    for ch in stem.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out.push_str(ext);
    out
}

/// Extracts the bytes of a file, or errors when none were delivered
/// in-band.
pub(crate) fn file_bytes(file: &FileInfo) -> Result<&[u8]> {
    file.data
        .as_deref()
        .ok_or_else(|| ChatweaveError::Media {
            reason: format!("file '{}' has no in-band bytes to upload", file.name),
        })
}

/// Joins a download prefix and a storage key with exactly one slash.
pub(crate) fn join_url(prefix: &str, key: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), key.trim_start_matches('/'))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

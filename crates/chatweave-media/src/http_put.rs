//! HTTP PUT media variant.
//!
//! Puts the bytes to `<upload-base>/<sha1-prefix>/<name>` and hands back
//! `<download-base>/<sha1-prefix>/<name>`. The receiving endpoint is
//! operator-provided (typically a webdav-ish store fronted by a static
//! webserver).

use std::time::Duration;

use async_trait::async_trait;

use chatweave_types::{ChatweaveError, FileInfo, Result};

use crate::{file_bytes, join_url, sha1_prefix, MediaServer};

/// Upload timeout; media blobs are small by policy (`MediaDownloadSize`).
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct HttpPutMedia {
    client: reqwest::Client,
    upload_base: String,
    download_base: String,
}

impl HttpPutMedia {
    pub fn new(upload_base: &str, download_base: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .map_err(|e| ChatweaveError::Media {
                reason: format!("http client build failed: {e}"),
            })?;
        Ok(Self {
            client,
            upload_base: upload_base.trim_end_matches('/').to_string(),
            download_base: download_base.trim_end_matches('/').to_string(),
        })
    }

    /// The storage key for a file: `<sha1-prefix>/<name>`.
    fn key(file: &FileInfo, data: &[u8]) -> String {
        format!("{}/{}", sha1_prefix(data), file.name)
    }
}

#[async_trait]
impl MediaServer for HttpPutMedia {
    async fn upload(&self, file: &FileInfo) -> Result<String> {
        let data = file_bytes(file)?;
        let key = Self::key(file, data);
        let put_url = join_url(&self.upload_base, &key);

        tracing::debug!(url = %put_url, bytes = data.len(), "media PUT");

        let resp = self
            .client
            .put(&put_url)
            .header("content-type", "binary/octet-stream")
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| ChatweaveError::Media {
                reason: format!("PUT {put_url} failed: {e}"),
            })?;

        if !resp.status().is_success() {
            return Err(ChatweaveError::Media {
                reason: format!("PUT {put_url} returned code {}", resp.status().as_u16()),
            });
        }

        Ok(join_url(&self.download_base, &key))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

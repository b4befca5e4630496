//! S3-compatible media variant.
//!
//! `MediaServerUpload = "s3://<bucket>[/<prefix>]"` selects this variant.
//! The client uses static credentials, optional path-style addressing and a
//! custom endpoint for non-AWS stores. A HEAD on the bucket at construction
//! fails fast on bad credentials or a missing bucket. Objects are stored
//! with `Content-Type: application/octet-stream`; multipart upload is not
//! used — `MediaDownloadSize` keeps blobs small.
//!
//! With `S3Presign` the returned URL is a presigned GET valid for seven
//! days; otherwise it is `MediaServerDownload` plus the object key.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;

use chatweave_types::config::GeneralConfig;
use chatweave_types::{ChatweaveError, FileInfo, Result};

use crate::{file_bytes, join_url, sha1_prefix, MediaServer};

/// Presigned GET validity; seven days is the SigV4 maximum.
const PRESIGN_VALIDITY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Region used when the operator sets none; S3-compatible stores ignore it
/// but the signer requires one.
const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug)]
pub struct S3Media {
    client: aws_sdk_s3::Client,
    bucket: String,
    key_prefix: String,
    download_base: String,
    presign: bool,
}

/// Splits `s3://<bucket>[/<prefix>]` into bucket and key prefix.
fn parse_s3_url(url: &str) -> Result<(String, String)> {
    let rest = url
        .strip_prefix("s3://")
        .ok_or_else(|| ChatweaveError::Config {
            reason: format!("not an s3:// URL: '{url}'"),
        })?;
    let (bucket, prefix) = match rest.split_once('/') {
        Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
        None => (rest, ""),
    };
    if bucket.is_empty() {
        return Err(ChatweaveError::Config {
            reason: format!("no bucket specified in '{url}'"),
        });
    }
    Ok((bucket.to_string(), prefix.to_string()))
}

/// The object key for a file: `[<prefix>/]<sha1-prefix>/<name>`.
fn object_key(key_prefix: &str, sha: &str, name: &str) -> String {
    if key_prefix.is_empty() {
        format!("{sha}/{name}")
    } else {
        format!("{key_prefix}/{sha}/{name}")
    }
}

impl S3Media {
    /// Builds the client and verifies the bucket is reachable.
    pub async fn new(general: &GeneralConfig) -> Result<Self> {
        let (bucket, key_prefix) = parse_s3_url(&general.media_server_upload)?;

        if general.s3_access_key.is_empty() || general.s3_secret_key.is_empty() {
            return Err(ChatweaveError::Config {
                reason: "S3 media server requires S3AccessKey and S3SecretKey".into(),
            });
        }

        let region = if general.s3_region.is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            general.s3_region.clone()
        };

        let credentials = Credentials::new(
            general.s3_access_key.clone(),
            general.s3_secret_key.clone(),
            None,
            None,
            "chatweave-static",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(general.s3_force_path_style);
        if !general.s3_endpoint.is_empty() {
            builder = builder.endpoint_url(&general.s3_endpoint);
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());

        // Fail fast on a missing bucket or bad credentials.
        client
            .head_bucket()
            .bucket(&bucket)
            .send()
            .await
            .map_err(|e| ChatweaveError::Config {
                reason: format!("S3 bucket '{bucket}' not reachable: {e}"),
            })?;

        tracing::debug!(%bucket, prefix = %key_prefix, "s3 media server ready");

        Ok(Self {
            client,
            bucket,
            key_prefix,
            download_base: general.media_server_download.trim_end_matches('/').to_string(),
            presign: general.s3_presign,
        })
    }
}

#[async_trait]
impl MediaServer for S3Media {
    async fn upload(&self, file: &FileInfo) -> Result<String> {
        let data = file_bytes(file)?;
        let key = object_key(&self.key_prefix, &sha1_prefix(data), &file.name);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type("application/octet-stream")
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| ChatweaveError::Media {
                reason: format!("s3 put of '{key}' failed: {e}"),
            })?;

        tracing::debug!(bucket = %self.bucket, %key, bytes = data.len(), "s3 object stored");

        if self.presign {
            let config = PresigningConfig::expires_in(PRESIGN_VALIDITY).map_err(|e| {
                ChatweaveError::Media {
                    reason: format!("presign config: {e}"),
                }
            })?;
            let presigned = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .presigned(config)
                .await
                .map_err(|e| ChatweaveError::Media {
                    reason: format!("presigning '{key}' failed: {e}"),
                })?;
            return Ok(presigned.uri().to_string());
        }

        Ok(join_url(&self.download_base, &key))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

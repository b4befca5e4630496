//! Per-adapter HTTP helper.
//!
//! Wraps one `reqwest::Client` per adapter with the bridge-wide timeout,
//! the adapter's optional proxy and auth header, the download size cap and
//! the filename blocklist. Adapters call these helpers from background
//! tasks so their reader loop never blocks on I/O.

use std::time::Duration;

use regex::Regex;

use chatweave_types::config::GeneralConfig;
use chatweave_types::{ChatweaveError, Envelope, FileInfo, Result};

/// Bridge-wide timeout for direct HTTP calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout when routing through a proxy, which tends to be slower.
const HTTP_PROXY_TIMEOUT: Duration = Duration::from_secs(15);

/// Builds a per-adapter client with the bridge-wide timeout and an
/// optional proxy. Backs the default `Adapter::new_http_client`.
pub fn new_client(proxy: &str) -> Result<reqwest::Client> {
    if proxy.is_empty() {
        reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| ChatweaveError::Http {
                reason: format!("client build failed: {e}"),
            })
    } else {
        let proxy = reqwest::Proxy::all(proxy).map_err(|e| ChatweaveError::Config {
            reason: format!("invalid http_proxy '{proxy}': {e}"),
        })?;
        reqwest::Client::builder()
            .timeout(HTTP_PROXY_TIMEOUT)
            .proxy(proxy)
            .build()
            .map_err(|e| ChatweaveError::Http {
                reason: format!("client build failed: {e}"),
            })
    }
}

/// Builds a plain request. Backs the default `Adapter::new_http_request`;
/// adapters with an auth header decorate on top of this.
pub fn new_request(method: &str, uri: &str, body: Option<Vec<u8>>) -> Result<reqwest::Request> {
    let method =
        reqwest::Method::from_bytes(method.as_bytes()).map_err(|e| ChatweaveError::Http {
            reason: format!("invalid method '{method}': {e}"),
        })?;
    let url = reqwest::Url::parse(uri).map_err(|e| ChatweaveError::Http {
        reason: format!("invalid uri '{uri}': {e}"),
    })?;
    let mut request = reqwest::Request::new(method, url);
    if let Some(bytes) = body {
        *request.body_mut() = Some(bytes.into());
    }
    Ok(request)
}

/// Per-adapter HTTP client plus download policy.
#[derive(Debug)]
pub struct HttpHelper {
    client: reqwest::Client,
    /// Extra header applied to every request (auth cookie/token), if any.
    auth_header: Option<(String, String)>,
    download_cap: u64,
    blocklist: Vec<Regex>,
}

impl HttpHelper {
    /// Builds the helper for one adapter.
    ///
    /// `proxy` is the adapter's `http_proxy` setting; empty means direct.
    /// The size cap and blocklist come from `[general]`.
    pub fn new(proxy: &str, general: &GeneralConfig) -> Result<Self> {
        let client = new_client(proxy)?;

        let mut blocklist = Vec::new();
        for pattern in &general.media_download_blacklist {
            let re = Regex::new(pattern).map_err(|e| ChatweaveError::Config {
                reason: format!("invalid MediaDownloadBlackList regex '{pattern}': {e}"),
            })?;
            blocklist.push(re);
        }

        Ok(Self {
            client,
            auth_header: None,
            download_cap: general.media_download_size,
            blocklist,
        })
    }

    /// Decorates every outgoing request with a static header.
    ///
    /// Used by adapters whose downloads require a cookie or token.
    pub fn with_auth_header(mut self, name: &str, value: &str) -> Self {
        self.auth_header = Some((name.to_string(), value.to_string()));
        self
    }

    fn request(&self, method: reqwest::Method, uri: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, uri);
        if let Some((name, value)) = &self.auth_header {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }

    /// True when the filename matches any blocklist regex.
    pub fn is_blocklisted(&self, filename: &str) -> bool {
        self.blocklist.iter().any(|re| re.is_match(filename))
    }

    /// Downloads a resource. Only HTTP 200 is accepted; the advertised and
    /// actual body sizes are checked against the download cap.
    pub async fn get_bytes(&self, uri: &str) -> Result<Vec<u8>> {
        let resp = self
            .request(reqwest::Method::GET, uri)
            .send()
            .await
            .map_err(|e| ChatweaveError::Http {
                reason: format!("GET {uri} failed: {e}"),
            })?;

        if resp.status() != reqwest::StatusCode::OK {
            return Err(ChatweaveError::Http {
                reason: format!("GET {uri} returned code {}", resp.status().as_u16()),
            });
        }

        if let Some(len) = resp.content_length() {
            if len > self.download_cap {
                return Err(ChatweaveError::Attachment {
                    reason: format!(
                        "{uri} advertises {len} bytes, cap is {}",
                        self.download_cap
                    ),
                });
            }
        }

        let body = resp.bytes().await.map_err(|e| ChatweaveError::Http {
            reason: format!("reading body of {uri} failed: {e}"),
        })?;

        if body.len() as u64 > self.download_cap {
            return Err(ChatweaveError::Attachment {
                reason: format!(
                    "{uri} delivered {} bytes, cap is {}",
                    body.len(),
                    self.download_cap
                ),
            });
        }

        Ok(body.to_vec())
    }

    /// Uploads a body and accepts any status in the explicit ok-set.
    pub async fn upload(
        &self,
        method: &str,
        uri: &str,
        headers: &[(&str, &str)],
        body: Vec<u8>,
        ok_statuses: &[u16],
    ) -> Result<()> {
        let method =
            reqwest::Method::from_bytes(method.as_bytes()).map_err(|e| ChatweaveError::Http {
                reason: format!("invalid method '{method}': {e}"),
            })?;
        let mut builder = self.request(method, uri).body(body);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let resp = builder.send().await.map_err(|e| ChatweaveError::Http {
            reason: format!("upload to {uri} failed: {e}"),
        })?;

        let status = resp.status().as_u16();
        if !ok_statuses.contains(&status) {
            return Err(ChatweaveError::Http {
                reason: format!("upload to {uri} returned code {status}"),
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Attachment helpers
    // -----------------------------------------------------------------------

    /// Attaches a file by URL; the bytes are downloaded first.
    pub async fn add_attachment_from_url(
        &self,
        msg: &mut Envelope,
        filename: &str,
        native_id: &str,
        comment: &str,
        uri: &str,
    ) -> Result<()> {
        self.add(msg, filename, native_id, comment, Some(uri), None, false)
            .await
    }

    /// Attaches a file from in-band bytes.
    pub async fn add_attachment_from_bytes(
        &self,
        msg: &mut Envelope,
        filename: &str,
        native_id: &str,
        comment: &str,
        data: Vec<u8>,
    ) -> Result<()> {
        self.add(msg, filename, native_id, comment, None, Some(data), false)
            .await
    }

    /// Attaches an avatar by URL.
    pub async fn add_avatar_from_url(
        &self,
        msg: &mut Envelope,
        filename: &str,
        native_id: &str,
        comment: &str,
        uri: &str,
    ) -> Result<()> {
        self.add(msg, filename, native_id, comment, Some(uri), None, true)
            .await
    }

    /// Attaches an avatar from in-band bytes.
    pub async fn add_avatar_from_bytes(
        &self,
        msg: &mut Envelope,
        filename: &str,
        native_id: &str,
        comment: &str,
        data: Vec<u8>,
    ) -> Result<()> {
        self.add(msg, filename, native_id, comment, None, Some(data), true)
            .await
    }

    /// Common attachment path: fetch if needed, enforce the cap and the
    /// blocklist, then append to the envelope.
    ///
    /// An attachment with neither bytes nor URL indicates a bug in the
    /// calling adapter and aborts the process.
    async fn add(
        &self,
        msg: &mut Envelope,
        filename: &str,
        native_id: &str,
        comment: &str,
        uri: Option<&str>,
        data: Option<Vec<u8>>,
        avatar: bool,
    ) -> Result<()> {
        let data = match (data, uri) {
            (Some(data), _) => data,
            (None, Some(uri)) => self.get_bytes(uri).await?,
            (None, None) => {
                panic!("logic error: attachment '{filename}' has neither bytes nor URL");
            }
        };

        if data.len() as u64 > self.download_cap {
            return Err(ChatweaveError::Attachment {
                reason: format!(
                    "file '{filename}' too large to relay ({} bytes, cap {})",
                    data.len(),
                    self.download_cap
                ),
            });
        }

        if self.is_blocklisted(filename) {
            return Err(ChatweaveError::Attachment {
                reason: format!("file '{filename}' matches the download blocklist"),
            });
        }

        tracing::debug!(file = %filename, bytes = data.len(), "attachment accepted");
        let size = data.len() as u64;
        msg.push_file(FileInfo {
            name: filename.to_string(),
            data: Some(data),
            url: uri.map(str::to_string),
            comment: comment.to_string(),
            size,
            avatar,
            sha: String::new(),
            native_id: native_id.to_string(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! TOML configuration model with startup validation.
//!
//! The file layout follows the operator-facing convention: a `[general]`
//! section, one `[<protocol>.<instance>]` section per adapter, and one or
//! more `[[gateway]]` sections with `in`/`out`/`inout` channel lists.
//! Key names are PascalCase on the wire (`MediaServerUpload`,
//! `ShowJoinPart`); `http_proxy` is lowercase for historical reasons.
//!
//! Per-adapter keys fall back to the same key in `[general]` when unset,
//! so fleet-wide defaults (e.g. `RemoteNickFormat`) are written once.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{split_account, ChatweaveError, Result};

fn default_true() -> bool {
    true
}

fn default_media_download_size() -> u64 {
    1_000_000
}

// ---------------------------------------------------------------------------
// AdapterConfig
// ---------------------------------------------------------------------------

/// One `[<protocol>.<instance>]` section.
///
/// Backend-specific keys (`Login`, `Server`, …) are passed through to the
/// adapter factory untouched; routing-relevant keys are resolved against
/// `[general]` via [`AdapterConfig::settings`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AdapterConfig {
    #[serde(default, rename = "Login")]
    pub login: String,
    #[serde(default, rename = "Password")]
    pub password: String,
    #[serde(default, rename = "Server")]
    pub server: String,
    #[serde(default, rename = "Nick")]
    pub nick: String,
    /// Listen address for adapters that run their own HTTP surface.
    #[serde(default, rename = "BindAddress")]
    pub bind_address: String,
    /// Static bearer token for adapters with an API surface.
    #[serde(default, rename = "Token")]
    pub token: String,
    /// In-memory message buffer size for the api adapter.
    #[serde(default, rename = "Buffer")]
    pub buffer: Option<usize>,
    /// Proxy URL for this adapter's HTTP client.
    #[serde(default, rename = "http_proxy")]
    pub http_proxy: String,
    #[serde(default, rename = "ShowJoinPart")]
    pub show_join_part: Option<bool>,
    #[serde(default, rename = "ShowTopicChange")]
    pub show_topic_change: Option<bool>,
    #[serde(default, rename = "SyncTopic")]
    pub sync_topic: Option<bool>,
    #[serde(default, rename = "PreserveThreading")]
    pub preserve_threading: Option<bool>,
    /// Milliseconds to sleep between consecutive channel joins.
    #[serde(default, rename = "JoinDelay")]
    pub join_delay: Option<u64>,
    /// Template applied to relayed usernames; supports `{NICK}`, `{BRIDGE}`,
    /// `{PROTOCOL}` and `{GATEWAY}` placeholders.
    #[serde(default, rename = "RemoteNickFormat")]
    pub remote_nick_format: Option<String>,
    /// `[match-regex, extract-regex]` pairs for relay-bot nick recovery.
    #[serde(default, rename = "ExtractNicks")]
    pub extract_nicks: Vec<Vec<String>>,
    #[serde(default, rename = "MessageFormat")]
    pub message_format: String,
    /// Nicks whose messages are never relayed (exact match, space separated).
    #[serde(default, rename = "IgnoreNicks")]
    pub ignore_nicks: String,
    /// Regexes; matching message texts are never relayed (space separated).
    #[serde(default, rename = "IgnoreMessages")]
    pub ignore_messages: String,
}

/// Routing-relevant adapter settings with `[general]` fallback applied.
#[derive(Clone, Debug, Default)]
pub struct AdapterSettings {
    pub show_join_part: bool,
    pub show_topic_change: bool,
    pub sync_topic: bool,
    pub preserve_threading: bool,
    pub join_delay_ms: u64,
    pub remote_nick_format: String,
    pub extract_nicks: Vec<(String, String)>,
    pub ignore_nicks: Vec<String>,
    pub ignore_messages: Vec<String>,
    pub http_proxy: String,
    /// `"plain"` flattens markdown on delivery to this adapter.
    pub message_format: String,
}

impl AdapterConfig {
    /// Resolves this section against the `[general]` defaults.
    pub fn settings(&self, general: &GeneralConfig) -> AdapterSettings {
        let g = &general.defaults;
        let extract_nicks = if self.extract_nicks.is_empty() {
            &g.extract_nicks
        } else {
            &self.extract_nicks
        };
        let ignore_nicks = if self.ignore_nicks.is_empty() {
            &g.ignore_nicks
        } else {
            &self.ignore_nicks
        };
        let ignore_messages = if self.ignore_messages.is_empty() {
            &g.ignore_messages
        } else {
            &self.ignore_messages
        };
        AdapterSettings {
            show_join_part: self.show_join_part.or(g.show_join_part).unwrap_or(false),
            show_topic_change: self
                .show_topic_change
                .or(g.show_topic_change)
                .unwrap_or(false),
            sync_topic: self.sync_topic.or(g.sync_topic).unwrap_or(false),
            preserve_threading: self
                .preserve_threading
                .or(g.preserve_threading)
                .unwrap_or(false),
            join_delay_ms: self.join_delay.or(g.join_delay).unwrap_or(0),
            remote_nick_format: self
                .remote_nick_format
                .clone()
                .or_else(|| g.remote_nick_format.clone())
                .unwrap_or_default(),
            extract_nicks: extract_nicks
                .iter()
                .filter(|pair| pair.len() == 2)
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect(),
            ignore_nicks: ignore_nicks
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            ignore_messages: ignore_messages
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            http_proxy: self.http_proxy.clone(),
            message_format: if self.message_format.is_empty() {
                g.message_format.clone()
            } else {
                self.message_format.clone()
            },
        }
    }
}

// ---------------------------------------------------------------------------
// GeneralConfig
// ---------------------------------------------------------------------------

/// The `[general]` section: media-server selection plus fleet-wide adapter
/// defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Media-server selection. `http(s)://` chooses the HTTP PUT variant,
    /// `s3://<bucket>[/<prefix>]` the S3 variant; empty with
    /// `MediaDownloadPath` set chooses the local filesystem variant.
    #[serde(default, rename = "MediaServerUpload")]
    pub media_server_upload: String,
    /// Public prefix prepended to media download paths.
    #[serde(default, rename = "MediaServerDownload")]
    pub media_server_download: String,
    /// Directory for the local filesystem media variant.
    #[serde(default, rename = "MediaDownloadPath")]
    pub media_download_path: String,
    /// Byte cap on attachment downloads.
    #[serde(default = "default_media_download_size", rename = "MediaDownloadSize")]
    pub media_download_size: u64,
    /// Filename regexes that are refused outright.
    #[serde(default, rename = "MediaDownloadBlackList")]
    pub media_download_blacklist: Vec<String>,
    #[serde(default, rename = "S3Endpoint")]
    pub s3_endpoint: String,
    #[serde(default, rename = "S3Region")]
    pub s3_region: String,
    #[serde(default, rename = "S3AccessKey")]
    pub s3_access_key: String,
    #[serde(default, rename = "S3SecretKey")]
    pub s3_secret_key: String,
    #[serde(default, rename = "S3ForcePathStyle")]
    pub s3_force_path_style: bool,
    /// When set, the S3 variant returns presigned GET URLs instead of
    /// `MediaServerDownload`-prefixed ones.
    #[serde(default, rename = "S3Presign")]
    pub s3_presign: bool,
    /// Fleet-wide defaults for the per-adapter keys.
    #[serde(flatten)]
    pub defaults: AdapterConfig,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            media_server_upload: String::new(),
            media_server_download: String::new(),
            media_download_path: String::new(),
            media_download_size: default_media_download_size(),
            media_download_blacklist: Vec::new(),
            s3_endpoint: String::new(),
            s3_region: String::new(),
            s3_access_key: String::new(),
            s3_secret_key: String::new(),
            s3_force_path_style: false,
            s3_presign: false,
            defaults: AdapterConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway sections
// ---------------------------------------------------------------------------

/// Per-channel options on a gateway entry.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// Join key / password for backends that require one.
    #[serde(default, rename = "Key")]
    pub key: String,
}

/// One entry in a gateway's `in`/`out`/`inout` list.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChannelEntry {
    /// Adapter account (`"<protocol>.<instance>"`).
    pub account: String,
    /// Room label as the adapter knows it.
    pub channel: String,
    #[serde(default)]
    pub options: ChannelOptions,
}

/// A channel as handed to an adapter's `join_channel`.
#[derive(Clone, Debug, Default)]
pub struct ChannelInfo {
    pub name: String,
    pub options: ChannelOptions,
}

/// One `[[gateway]]` section.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default, rename = "in")]
    pub inbound: Vec<ChannelEntry>,
    #[serde(default, rename = "out")]
    pub outbound: Vec<ChannelEntry>,
    #[serde(default)]
    pub inout: Vec<ChannelEntry>,
}

impl GatewayConfig {
    /// All channel entries regardless of direction.
    pub fn entries(&self) -> impl Iterator<Item = &ChannelEntry> {
        self.inbound
            .iter()
            .chain(self.outbound.iter())
            .chain(self.inout.iter())
    }
}

// ---------------------------------------------------------------------------
// RootConfig
// ---------------------------------------------------------------------------

/// The whole configuration file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RootConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default, rename = "gateway")]
    pub gateways: Vec<GatewayConfig>,
    /// `[<protocol>.<instance>]` sections, keyed by protocol then instance.
    #[serde(flatten)]
    pub protocols: HashMap<String, HashMap<String, AdapterConfig>>,
}

impl RootConfig {
    /// Parses a configuration from TOML text and validates it.
    pub fn from_toml(text: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(text).map_err(|e| ChatweaveError::Config {
            reason: format!("TOML parse failed: {e}"),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ChatweaveError::Config {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::from_toml(&text)
    }

    /// Looks up the section for an account string.
    pub fn adapter(&self, account: &str) -> Option<&AdapterConfig> {
        let (protocol, name) = split_account(account).ok()?;
        self.protocols.get(protocol)?.get(name)
    }

    /// Accounts referenced by at least one enabled gateway.
    pub fn referenced_accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = Vec::new();
        for gw in self.gateways.iter().filter(|g| g.enable) {
            for entry in gw.entries() {
                if !accounts.contains(&entry.account) {
                    accounts.push(entry.account.clone());
                }
            }
        }
        accounts
    }

    /// Validates the configuration.
    ///
    /// Checks: at least one enabled gateway, unique gateway names,
    /// well-formed account references pointing at declared sections, and
    /// well-formed `ExtractNicks` pairs.
    pub fn validate(&self) -> Result<()> {
        if !self.gateways.iter().any(|g| g.enable) {
            return Err(ChatweaveError::Config {
                reason: "no enabled gateway defined".into(),
            });
        }

        let mut seen_names: Vec<&str> = Vec::new();
        for gw in &self.gateways {
            if gw.name.is_empty() {
                return Err(ChatweaveError::Config {
                    reason: "gateway with empty name".into(),
                });
            }
            if seen_names.contains(&gw.name.as_str()) {
                return Err(ChatweaveError::Config {
                    reason: format!("duplicate gateway name '{}'", gw.name),
                });
            }
            seen_names.push(&gw.name);

            for entry in gw.entries() {
                split_account(&entry.account)?;
                if self.adapter(&entry.account).is_none() {
                    return Err(ChatweaveError::Config {
                        reason: format!(
                            "gateway '{}' references undeclared account '{}'",
                            gw.name, entry.account
                        ),
                    });
                }
                if entry.channel.is_empty() {
                    return Err(ChatweaveError::Config {
                        reason: format!(
                            "gateway '{}' has an entry for '{}' with an empty channel",
                            gw.name, entry.account
                        ),
                    });
                }
            }
        }

        for (protocol, instances) in &self.protocols {
            for (name, section) in instances {
                for pair in &section.extract_nicks {
                    if pair.len() != 2 {
                        return Err(ChatweaveError::Config {
                            reason: format!(
                                "[{protocol}.{name}] ExtractNicks entries must be [match, extract] pairs"
                            ),
                        });
                    }
                }
            }
        }

        if !self.general.media_server_upload.is_empty()
            && self.general.media_server_download.is_empty()
        {
            return Err(ChatweaveError::Config {
                reason: "MediaServerUpload requires MediaServerDownload".into(),
            });
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

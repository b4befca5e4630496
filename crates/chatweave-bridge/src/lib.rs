//! Adapter capability contract and per-adapter runtime state.
//!
//! An [`Adapter`] is the protocol-specific half of a backend connection:
//! it speaks the wire protocol and publishes normalized envelopes onto the
//! shared ingress channel it received at construction. A [`Bridge`] wraps
//! one adapter with the protocol-neutral runtime state the router needs:
//! the configured channel set, the joined set, the latest membership
//! snapshot, the lifecycle state and the serial send token.
//!
//! Adapters never reference each other; the only shared handle is the
//! ingress sender.

pub mod http;
pub mod nick_cache;
pub mod reconnect;
pub mod registry;
pub mod retry;

#[cfg(feature = "api")]
pub mod api;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex as StdMutex;
use std::sync::RwLock as StdRwLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use chatweave_types::config::{AdapterConfig, AdapterSettings, ChannelInfo, GeneralConfig};
use chatweave_types::{ChannelMemberList, ChatweaveError, Envelope, Result};

/// Maps a poisoned lock to the central error type, as the rest of the
/// workspace does for this failure mode.
pub(crate) fn lock_poisoned(what: &str) -> ChatweaveError {
    ChatweaveError::Protocol {
        reason: format!("{what} lock poisoned"),
    }
}

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

/// The capability set every backend adapter must provide.
///
/// `connect` must complete the initial handshake and start the adapter's
/// reader task before returning. `send` returns the backend-native ID of the
/// resulting message, or an empty string when the event produces no durable
/// message (typing indications, some delete acks).
///
/// The two HTTP factories carry defaults so every adapter has them without
/// ceremony; the download/upload plumbing in [`http::HttpHelper`] composes
/// on top.
#[async_trait]
pub trait Adapter: Send + Sync + std::fmt::Debug {
    async fn connect(&self) -> Result<()>;

    /// Idempotent; signals the reader task to stop.
    async fn disconnect(&self) -> Result<()>;

    /// Must be safe to call repeatedly for the same channel.
    async fn join_channel(&self, channel: &ChannelInfo) -> Result<()>;

    async fn send(&self, msg: &Envelope) -> Result<String>;

    /// Returns a request pre-decorated with this adapter's auth header,
    /// if any. The default builds a plain request; adapters whose
    /// downloads require a cookie or token override it.
    fn new_http_request(
        &self,
        method: &str,
        uri: &str,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Request> {
        http::new_request(method, uri, body)
    }

    /// Returns a client with the bridge-wide timeout and optional proxy.
    fn new_http_client(&self, proxy: &str) -> Result<reqwest::Client> {
        http::new_client(proxy)
    }
}

/// Everything an adapter factory needs to construct an adapter instance.
pub struct AdapterContext {
    /// Logical identifier `"<protocol>.<instance>"`.
    pub account: String,
    pub protocol: String,
    pub name: String,
    /// The adapter's own `[<protocol>.<instance>]` section.
    pub config: AdapterConfig,
    /// The `[general]` section, for fallback keys and media limits.
    pub general: GeneralConfig,
    /// Shared ingress channel all adapters publish into.
    pub ingress: mpsc::Sender<Envelope>,
}

/// Constructor signature registered in the protocol factory table.
pub type Factory = fn(AdapterContext) -> Result<Box<dyn Adapter>>;

// ---------------------------------------------------------------------------
// BridgeState
// ---------------------------------------------------------------------------

/// Lifecycle state of a bridged adapter.
///
/// ```text
/// Disconnected ──connect()──▶ Connected ──join_channels()──▶ Joined
///      ▲                                                        │
///      └───────────── failure / operator stop ──────────────────┘
/// ```
///
/// `Connecting` is held by the reconnect controller while a backoff loop is
/// in flight, and doubles as a guard against concurrent reconnect attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Connected,
    Joined,
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Joined => write!(f, "joined"),
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// One running adapter plus its protocol-neutral runtime state.
pub struct Bridge {
    pub account: String,
    pub protocol: String,
    pub name: String,
    /// Routing-relevant settings with `[general]` fallback applied.
    pub settings: AdapterSettings,
    adapter: Box<dyn Adapter>,
    /// Channels this account participates in, merged over all gateways.
    channels: StdRwLock<HashMap<String, ChannelInfo>>,
    /// Channels successfully joined since the last (re)connect.
    joined: StdMutex<HashSet<String>>,
    /// Latest membership snapshot from `get-channel-members`, if any.
    members: StdRwLock<Option<ChannelMemberList>>,
    /// Serial token: every outbound send holds this, so a stalled
    /// rate-limit retry backs up subsequent sends to the same backend.
    pub(crate) send_lock: Mutex<()>,
    state: StdMutex<BridgeState>,
}

impl Bridge {
    /// Wraps a constructed adapter.
    pub fn new(
        account: &str,
        protocol: &str,
        name: &str,
        settings: AdapterSettings,
        adapter: Box<dyn Adapter>,
    ) -> Self {
        Self {
            account: account.to_string(),
            protocol: protocol.to_string(),
            name: name.to_string(),
            settings,
            adapter,
            channels: StdRwLock::new(HashMap::new()),
            joined: StdMutex::new(HashSet::new()),
            members: StdRwLock::new(None),
            send_lock: Mutex::new(()),
            state: StdMutex::new(BridgeState::Disconnected),
        }
    }

    pub(crate) fn adapter(&self) -> &dyn Adapter {
        self.adapter.as_ref()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> Result<BridgeState> {
        Ok(*self.state.lock().map_err(|_| lock_poisoned("state"))?)
    }

    pub(crate) fn set_state(&self, next: BridgeState) -> Result<()> {
        *self.state.lock().map_err(|_| lock_poisoned("state"))? = next;
        Ok(())
    }

    /// Moves to `Connecting` unless a reconnect is already in flight.
    ///
    /// Returns false when another task holds the reconnect.
    pub fn begin_connecting(&self) -> Result<bool> {
        let mut state = self.state.lock().map_err(|_| lock_poisoned("state"))?;
        if *state == BridgeState::Connecting {
            return Ok(false);
        }
        *state = BridgeState::Connecting;
        Ok(true)
    }

    /// Registers a channel this account participates in.
    pub fn add_channel(&self, channel: ChannelInfo) -> Result<()> {
        self.channels
            .write()
            .map_err(|_| lock_poisoned("channels"))?
            .insert(channel.name.clone(), channel);
        Ok(())
    }

    /// Names of all configured channels.
    pub fn channel_names(&self) -> Result<Vec<String>> {
        Ok(self
            .channels
            .read()
            .map_err(|_| lock_poisoned("channels"))?
            .keys()
            .cloned()
            .collect())
    }

    /// Performs the initial connect. Single attempt; the reconnect
    /// controller owns retries.
    pub async fn connect(&self) -> Result<()> {
        self.adapter.connect().await?;
        self.set_state(BridgeState::Connected)?;
        tracing::info!(account = %self.account, "connected");
        Ok(())
    }

    /// Disconnects the adapter. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        let result = self.adapter.disconnect().await;
        self.set_state(BridgeState::Disconnected)?;
        result
    }

    /// Joins every configured channel not yet in the joined set, sleeping
    /// the configured `JoinDelay` before each join (server anti-flood).
    pub async fn join_channels(&self) -> Result<()> {
        let channels: Vec<ChannelInfo> = {
            self.channels
                .read()
                .map_err(|_| lock_poisoned("channels"))?
                .values()
                .cloned()
                .collect()
        };
        for channel in channels {
            let already = {
                self.joined
                    .lock()
                    .map_err(|_| lock_poisoned("joined"))?
                    .contains(&channel.name)
            };
            if already {
                continue;
            }
            if self.settings.join_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.settings.join_delay_ms)).await;
            }
            tracing::info!(account = %self.account, channel = %channel.name, "joining");
            self.adapter.join_channel(&channel).await?;
            self.joined
                .lock()
                .map_err(|_| lock_poisoned("joined"))?
                .insert(channel.name.clone());
        }
        self.set_state(BridgeState::Joined)?;
        Ok(())
    }

    /// Clears the joined set; the next `join_channels` re-joins everything.
    pub fn clear_joined(&self) -> Result<()> {
        self.joined
            .lock()
            .map_err(|_| lock_poisoned("joined"))?
            .clear();
        Ok(())
    }

    /// Stores a membership snapshot received from the adapter.
    pub fn set_channel_members(&self, members: ChannelMemberList) -> Result<()> {
        *self.members.write().map_err(|_| lock_poisoned("members"))? = Some(members);
        Ok(())
    }

    /// Latest membership snapshot, if one was received.
    pub fn channel_members(&self) -> Result<Option<ChannelMemberList>> {
        Ok(self
            .members
            .read()
            .map_err(|_| lock_poisoned("members"))?
            .clone())
    }
}

// ---------------------------------------------------------------------------
// Control-event helpers
// ---------------------------------------------------------------------------

/// Builds the `failure` control envelope an adapter emits on unrecoverable
/// disconnect.
pub fn failure_event(account: &str, protocol: &str, reason: &str) -> Envelope {
    Envelope {
        account: account.to_string(),
        protocol: protocol.to_string(),
        event: chatweave_types::EventKind::Failure,
        text: reason.to_string(),
        ..Envelope::default()
    }
}

/// Builds the `rejoin-channels` control envelope emitted after a successful
/// reconnect cycle.
pub fn rejoin_event(account: &str, protocol: &str) -> Envelope {
    Envelope {
        account: account.to_string(),
        protocol: protocol.to_string(),
        event: chatweave_types::EventKind::RejoinChannels,
        ..Envelope::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

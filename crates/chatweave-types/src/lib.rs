//! Core shared types for the Chatweave relay.
//!
//! This crate defines the types exchanged between adapters, the router and
//! the gateways. No other crate should define shared types — everything
//! lives here.

pub mod config;
pub mod envelope;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use envelope::{ChannelMember, ChannelMemberList, Envelope, ExtraValue, FileInfo};

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

/// Kind of event carried by an [`Envelope`].
///
/// The wire representation (api adapter, logs) uses the historical string
/// names; a regular chat message is the empty string.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// Regular chat message.
    #[default]
    #[serde(rename = "")]
    Message,
    /// The origin message was deleted.
    MsgDelete,
    /// "/me"-style action message.
    UserAction,
    /// A user joined or left the origin channel.
    JoinLeave,
    /// The origin channel topic changed.
    TopicChange,
    /// A new avatar byte blob arrived for a user.
    AvatarDownload,
    /// A user is typing in the origin channel.
    UserTyping,
    /// The adapter hit an unrecoverable transport error; the router
    /// reconnects it.
    Failure,
    /// The adapter finished a reconnect cycle; the router re-joins its
    /// configured channels.
    RejoinChannels,
    /// The adapter produced a channel membership snapshot.
    GetChannelMembers,
    /// One or more attachments were refused for exceeding the download cap.
    FileFailureSize,
}

impl EventKind {
    /// Returns the wire string for this event kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "",
            Self::MsgDelete => "msg-delete",
            Self::UserAction => "user-action",
            Self::JoinLeave => "join-leave",
            Self::TopicChange => "topic-change",
            Self::AvatarDownload => "avatar-download",
            Self::UserTyping => "user-typing",
            Self::Failure => "failure",
            Self::RejoinChannels => "rejoin-channels",
            Self::GetChannelMembers => "get-channel-members",
            Self::FileFailureSize => "file-failure-size",
        }
    }

    /// True for the control events the router intercepts before routing.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Self::Failure | Self::RejoinChannels | Self::GetChannelMembers
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ChatweaveError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "" => Self::Message,
            "msg-delete" => Self::MsgDelete,
            "user-action" => Self::UserAction,
            "join-leave" => Self::JoinLeave,
            "topic-change" => Self::TopicChange,
            "avatar-download" => Self::AvatarDownload,
            "user-typing" => Self::UserTyping,
            "failure" => Self::Failure,
            "rejoin-channels" => Self::RejoinChannels,
            "get-channel-members" => Self::GetChannelMembers,
            "file-failure-size" => Self::FileFailureSize,
            other => {
                return Err(ChatweaveError::Protocol {
                    reason: format!("unknown event kind '{other}'"),
                })
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Splits a logical account identifier `"<protocol>.<instance>"` into its
/// protocol and instance parts.
///
/// The account string is the unique identifier of a running adapter; it is
/// what gateway channel entries reference.
pub fn split_account(account: &str) -> Result<(&str, &str)> {
    match account.split_once('.') {
        Some((protocol, name)) if !protocol.is_empty() && !name.is_empty() => {
            Ok((protocol, name))
        }
        _ => Err(ChatweaveError::Config {
            reason: format!(
                "account '{account}' is not of the form <protocol>.<instance>"
            ),
        }),
    }
}

// ---------------------------------------------------------------------------
// ChatweaveError
// ---------------------------------------------------------------------------

/// Central error type for the Chatweave system.
///
/// All crates in the workspace convert their internal errors into variants
/// of this enum, ensuring a unified error handling surface.
#[derive(Debug, Error)]
pub enum ChatweaveError {
    /// A configuration value is invalid or missing. Fatal at startup.
    #[error("config error: {reason}")]
    Config {
        /// Human-readable description of the configuration problem.
        reason: String,
    },

    /// A transport-level failure (connect, read, write). Drives reconnect.
    #[error("transport error: {reason}")]
    Transport {
        /// Human-readable description of the transport failure.
        reason: String,
    },

    /// The backend asked us to slow down. Handled inside the retry harness,
    /// never surfaced to callers.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Server-suggested wait before the same send may be retried.
        retry_after: Duration,
    },

    /// An outbound send failed for a non-rate-limit reason. The delivery is
    /// skipped; other destinations are still attempted.
    #[error("send failed: {reason}")]
    SendFailed {
        /// Human-readable description of the send failure.
        reason: String,
    },

    /// An attachment was refused or could not be fetched. The attachment is
    /// dropped; text and remaining attachments continue.
    #[error("attachment error: {reason}")]
    Attachment {
        /// Human-readable description of the attachment failure.
        reason: String,
    },

    /// A media server operation failed.
    #[error("media server error: {reason}")]
    Media {
        /// Human-readable description of the media failure.
        reason: String,
    },

    /// An HTTP helper operation failed.
    #[error("http error: {reason}")]
    Http {
        /// Human-readable description of the HTTP failure.
        reason: String,
    },

    /// A protocol-level error (unknown event, malformed payload).
    #[error("protocol error: {reason}")]
    Protocol {
        /// Human-readable description of the protocol failure.
        reason: String,
    },
}

/// Convenience result type using [`ChatweaveError`].
pub type Result<T> = std::result::Result<T, ChatweaveError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

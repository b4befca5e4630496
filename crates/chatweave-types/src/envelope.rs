//! The protocol-neutral message record.
//!
//! Every inbound backend message is normalized into an [`Envelope`] before
//! it enters the ingress channel; every outbound send receives one. The
//! envelope deliberately carries origin identity (`account`, `protocol`,
//! `id`) so that edits, deletes and replies can be correlated across hops.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::EventKind;

/// Extra-map key under which file attachments are stored.
pub const EXTRA_FILE: &str = "file";

// ---------------------------------------------------------------------------
// FileInfo
// ---------------------------------------------------------------------------

/// A single file attachment riding in an envelope's extra map.
///
/// Either `data` or `url` must be set; an attachment with neither is a logic
/// error (a bug in the producing adapter, not an operational condition).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileInfo {
    /// Filename as the origin backend reported it.
    pub name: String,
    /// Raw bytes, when the origin delivered them in-band.
    #[serde(skip)]
    pub data: Option<Vec<u8>>,
    /// Download URL, either origin-native or assigned by the media server.
    #[serde(default)]
    pub url: Option<String>,
    /// Caption or comment attached to the file.
    #[serde(default)]
    pub comment: String,
    /// Size in bytes as reported by the origin (0 when unknown).
    #[serde(default)]
    pub size: u64,
    /// True when this file is a user avatar rather than a shared file.
    #[serde(default)]
    pub avatar: bool,
    /// First 8 hex characters of the SHA-1 of `data`, filled after
    /// media-server handling.
    #[serde(default)]
    pub sha: String,
    /// The origin backend's own identifier for this upload, if any.
    #[serde(default)]
    pub native_id: String,
}

// ---------------------------------------------------------------------------
// Channel members
// ---------------------------------------------------------------------------

/// One member in a channel membership snapshot.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChannelMember {
    /// Display name.
    pub username: String,
    /// Nickname, when the backend distinguishes it from the username.
    #[serde(default)]
    pub nick: String,
    /// Stable per-backend user identifier.
    pub user_id: String,
    /// Backend-internal channel identifier the member was seen in.
    #[serde(default)]
    pub channel_id: String,
}

/// Channel membership snapshot emitted via `get-channel-members`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChannelMemberList(pub Vec<ChannelMember>);

// ---------------------------------------------------------------------------
// ExtraValue
// ---------------------------------------------------------------------------

/// A value in the envelope's extra map.
///
/// The map is keyed by purpose (`"file"`, `"get-channel-members"`,
/// `"file-failure-size"`) and each key holds an ordered list of values.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtraValue {
    /// A file attachment.
    File(FileInfo),
    /// A channel membership snapshot.
    Members(ChannelMemberList),
    /// An out-of-band diagnostic note (e.g. an oversize-attachment notice).
    Note(String),
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The in-memory record exchanged between adapters, router and gateways.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Message body. May be empty on control events.
    #[serde(default)]
    pub text: String,
    /// Display name as the origin backend sees it.
    #[serde(default)]
    pub username: String,
    /// Stable per-backend identifier of the sender.
    #[serde(default)]
    pub user_id: String,
    /// Origin room label as referenced in configuration (not the backend's
    /// internal ID).
    #[serde(default)]
    pub channel: String,
    /// Logical identifier `"<protocol>.<instance>"` of the origin adapter.
    #[serde(default)]
    pub account: String,
    /// Protocol family of the origin adapter (`"irc"`, `"xmpp"`, …).
    #[serde(default)]
    pub protocol: String,
    /// Owning gateway name; stamped by the router during dispatch.
    #[serde(default)]
    pub gateway: String,
    /// Origin backend's message ID; empty when the backend exposes none.
    #[serde(default)]
    pub id: String,
    /// Origin backend's ID of the message being replied to, if any.
    #[serde(default)]
    pub parent_id: String,
    /// Event kind; [`EventKind::Message`] for a regular message.
    #[serde(default)]
    pub event: EventKind,
    /// Avatar URL, or empty.
    #[serde(default)]
    pub avatar: String,
    /// Receipt time at the origin adapter. Informational only.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Out-of-band payloads keyed by purpose.
    #[serde(default)]
    pub extra: HashMap<String, Vec<ExtraValue>>,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            text: String::new(),
            username: String::new(),
            user_id: String::new(),
            channel: String::new(),
            account: String::new(),
            protocol: String::new(),
            gateway: String::new(),
            id: String::new(),
            parent_id: String::new(),
            event: EventKind::Message,
            avatar: String::new(),
            timestamp: Utc::now(),
            extra: HashMap::new(),
        }
    }
}

impl Envelope {
    /// Returns the attached files, if any.
    pub fn files(&self) -> impl Iterator<Item = &FileInfo> {
        self.extra
            .get(EXTRA_FILE)
            .into_iter()
            .flatten()
            .filter_map(|v| match v {
                ExtraValue::File(fi) => Some(fi),
                _ => None,
            })
    }

    /// Mutable access to the attached files.
    pub fn files_mut(&mut self) -> impl Iterator<Item = &mut FileInfo> {
        self.extra
            .get_mut(EXTRA_FILE)
            .into_iter()
            .flatten()
            .filter_map(|v| match v {
                ExtraValue::File(fi) => Some(fi),
                _ => None,
            })
    }

    /// True when at least one file attachment is present.
    pub fn has_files(&self) -> bool {
        self.files().next().is_some()
    }

    /// Appends a file attachment.
    pub fn push_file(&mut self, file: FileInfo) {
        self.extra
            .entry(EXTRA_FILE.to_string())
            .or_default()
            .push(ExtraValue::File(file));
    }

    /// Appends a diagnostic note under the given extra key.
    pub fn push_note(&mut self, key: &str, note: String) {
        self.extra
            .entry(key.to_string())
            .or_default()
            .push(ExtraValue::Note(note));
    }

    /// True when the envelope carries content worth relaying: text, a file
    /// attachment, or a non-message event.
    pub fn has_content(&self) -> bool {
        !self.text.is_empty() || self.has_files() || self.event != EventKind::Message
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;

    #[test]
    fn default_envelope_has_no_content() {
        let env = Envelope::default();
        assert!(!env.has_content());
        assert!(!env.has_files());
    }

    #[test]
    fn push_file_makes_content() {
        let mut env = Envelope::default();
        env.push_file(FileInfo {
            name: "cat.png".into(),
            data: Some(vec![1, 2, 3]),
            ..FileInfo::default()
        });
        assert!(env.has_files());
        assert!(env.has_content());
        assert_eq!(env.files().count(), 1);
    }

    #[test]
    fn files_mut_edits_in_place() {
        let mut env = Envelope::default();
        env.push_file(FileInfo {
            name: "a.txt".into(),
            data: Some(b"hello".to_vec()),
            ..FileInfo::default()
        });
        for fi in env.files_mut() {
            fi.sha = "deadbeef".into();
            fi.url = Some("https://cdn/deadbeef/a.txt".into());
        }
        let fi = env.files().next().expect("file present");
        assert_eq!(fi.sha, "deadbeef");
        assert_eq!(fi.url.as_deref(), Some("https://cdn/deadbeef/a.txt"));
    }

    #[test]
    fn control_event_is_content() {
        let env = Envelope {
            event: EventKind::JoinLeave,
            ..Envelope::default()
        };
        assert!(env.has_content());
    }

    #[test]
    fn file_data_not_serialized() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut env = Envelope::default();
        env.push_file(FileInfo {
            name: "secret.bin".into(),
            data: Some(vec![0xFF; 64]),
            ..FileInfo::default()
        });
        let json = serde_json::to_string(&env)?;
        assert!(!json.contains("data"), "raw bytes must stay out of the wire form");
        assert!(json.contains("secret.bin"));
        Ok(())
    }

    #[test]
    fn envelope_json_roundtrip() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let env = Envelope {
            text: "hi".into(),
            username: "alice".into(),
            account: "irc.main".into(),
            protocol: "irc".into(),
            channel: "#chan".into(),
            id: "IRC-42".into(),
            ..Envelope::default()
        };
        let json = serde_json::to_string(&env)?;
        let parsed: Envelope = serde_json::from_str(&json)?;
        assert_eq!(parsed.text, "hi");
        assert_eq!(parsed.id, "IRC-42");
        assert_eq!(parsed.event, EventKind::Message);
        Ok(())
    }
}

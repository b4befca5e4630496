//! Message identity across hops.
//!
//! Every delivered copy of a message is remembered under a canonical key
//! `"<origin-protocol> <origin-id>"`. When an edit, delete or reply for
//! that origin message arrives later, the key yields each destination's
//! native message ID so the operation can follow the original through
//! every transit. A reverse map traces a destination copy (e.g. a delete
//! observed on a peer) back to its canonical key.
//!
//! Entries are retained for the life of the gateway; bounding the table is
//! an operator concern.

use std::collections::HashMap;

/// One delivered copy of an origin message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SentRef {
    pub account: String,
    pub channel: String,
    pub id: String,
}

/// Bidirectional origin ↔ destination message-ID mapping for one gateway.
#[derive(Debug, Default)]
pub struct CorrelationMap {
    /// canonical key → delivered copies.
    forward: HashMap<String, Vec<SentRef>>,
    /// (destination account, destination id) → canonical key.
    reverse: HashMap<(String, String), String>,
}

impl CorrelationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The canonical key for an origin message.
    pub fn canonical_key(protocol: &str, id: &str) -> String {
        format!("{protocol} {id}")
    }

    /// Resolves an observed message to its canonical key.
    ///
    /// A message ID seen on the origin side resolves through the forward
    /// map; an ID observed on a delivered copy resolves through the
    /// reverse map. Unknown IDs yield `None`.
    pub fn resolve(&self, account: &str, protocol: &str, id: &str) -> Option<String> {
        let key = Self::canonical_key(protocol, id);
        if self.forward.contains_key(&key) {
            return Some(key);
        }
        self.reverse
            .get(&(account.to_string(), id.to_string()))
            .cloned()
    }

    /// Records a delivered copy under its canonical key.
    ///
    /// A later delivery to the same (account, channel) — an edit —
    /// replaces the previous ref.
    pub fn record(&mut self, key: &str, sent: SentRef) {
        self.reverse
            .insert((sent.account.clone(), sent.id.clone()), key.to_string());
        let refs = self.forward.entry(key.to_string()).or_default();
        refs.retain(|r| !(r.account == sent.account && r.channel == sent.channel));
        refs.push(sent);
    }

    /// The destination-native ID of the copy delivered to
    /// (account, channel), if one exists.
    pub fn dest_id(&self, key: &str, account: &str, channel: &str) -> Option<String> {
        self.forward.get(key)?.iter().find_map(|r| {
            (r.account == account && r.channel == channel).then(|| r.id.clone())
        })
    }

    /// All delivered copies of an origin message.
    pub fn refs(&self, key: &str) -> &[SentRef] {
        self.forward.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of correlated origin messages.
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

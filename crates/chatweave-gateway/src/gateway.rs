//! One logical gateway: a routing rule set over a group of channels.
//!
//! A gateway owns its merged channel list, its correlation table and a
//! reference to the configured media server. [`Gateway::process`] is the
//! inbound pipeline: filters, nick extraction, media re-hosting, then one
//! delivery job per destination channel handed to that destination's
//! worker queue.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use chatweave_bridge::Bridge;
use chatweave_media::{sanitize_filename, sha1_prefix, MediaServer};
use chatweave_types::config::GatewayConfig;
use chatweave_types::envelope::EXTRA_FILE;
use chatweave_types::{Envelope, EventKind, ExtraValue};

use crate::correlation::CorrelationMap;
use crate::outbound::Outbound;
use crate::transforms;

// ---------------------------------------------------------------------------
// Channel rules
// ---------------------------------------------------------------------------

/// Direction of a gateway channel entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    In,
    Out,
    InOut,
}

/// One merged routing entry.
#[derive(Clone, Debug)]
pub struct GatewayChannel {
    pub account: String,
    pub channel: String,
    pub direction: Direction,
}

/// Merges the configured `in`/`out`/`inout` lists.
///
/// A pair listed in `in` or `out` as well as `inout` (or in both `in` and
/// `out`) collapses to a single `inout` entry.
fn merge_channels(cfg: &GatewayConfig) -> Vec<GatewayChannel> {
    let mut merged: Vec<GatewayChannel> = Vec::new();
    let mut add = |account: &str, channel: &str, direction: Direction| {
        if let Some(existing) = merged
            .iter_mut()
            .find(|c| c.account == account && c.channel == channel)
        {
            if existing.direction != direction {
                existing.direction = Direction::InOut;
            }
        } else {
            merged.push(GatewayChannel {
                account: account.to_string(),
                channel: channel.to_string(),
                direction,
            });
        }
    };
    for entry in &cfg.inbound {
        add(&entry.account, &entry.channel, Direction::In);
    }
    for entry in &cfg.outbound {
        add(&entry.account, &entry.channel, Direction::Out);
    }
    for entry in &cfg.inout {
        add(&entry.account, &entry.channel, Direction::InOut);
    }
    merged
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

pub struct Gateway {
    pub name: String,
    channels: Vec<GatewayChannel>,
    bridges: Arc<HashMap<String, Arc<Bridge>>>,
    senders: HashMap<String, mpsc::Sender<Outbound>>,
    media: Option<Arc<dyn MediaServer>>,
    correlation: Arc<RwLock<CorrelationMap>>,
}

impl Gateway {
    pub fn new(
        cfg: &GatewayConfig,
        bridges: Arc<HashMap<String, Arc<Bridge>>>,
        senders: HashMap<String, mpsc::Sender<Outbound>>,
        media: Option<Arc<dyn MediaServer>>,
    ) -> Self {
        Self {
            name: cfg.name.clone(),
            channels: merge_channels(cfg),
            bridges,
            senders,
            media,
            correlation: Arc::new(RwLock::new(CorrelationMap::new())),
        }
    }

    /// This gateway's correlation table.
    pub fn correlation(&self) -> Arc<RwLock<CorrelationMap>> {
        self.correlation.clone()
    }

    /// True when the envelope's origin is one of this gateway's inputs.
    ///
    /// A channel-less `join-leave` (an IRC QUIT) matches on account alone.
    pub fn handles_origin(&self, env: &Envelope) -> bool {
        self.channels.iter().any(|c| {
            matches!(c.direction, Direction::In | Direction::InOut)
                && c.account == env.account
                && (c.channel == env.channel
                    || (env.channel.is_empty() && env.event == EventKind::JoinLeave))
        })
    }

    /// Resolves an observed message ID to its canonical key, treating a
    /// poisoned correlation table as "uncorrelated" rather than tearing
    /// the process down.
    fn resolve_canonical(&self, account: &str, protocol: &str, id: &str) -> Option<String> {
        match self.correlation.read() {
            Ok(map) => map.resolve(account, protocol, id),
            Err(_) => {
                tracing::error!(
                    gateway = %self.name,
                    "correlation lock poisoned, message treated as uncorrelated"
                );
                None
            }
        }
    }

    /// Output entries for an envelope, excluding the origin pair. For a
    /// channel-less broadcast the whole origin account is excluded.
    fn dest_channels<'a>(&'a self, env: &'a Envelope) -> impl Iterator<Item = &'a GatewayChannel> {
        self.channels.iter().filter(move |c| {
            matches!(c.direction, Direction::Out | Direction::InOut)
                && !(c.account == env.account && c.channel == env.channel)
                && !(env.channel.is_empty() && c.account == env.account)
        })
    }

    /// The inbound pipeline for one envelope owned by this gateway.
    pub async fn process(&self, mut env: Envelope) {
        env.gateway = self.name.clone();

        let Some(origin) = self.bridges.get(&env.account) else {
            tracing::warn!(gateway = %self.name, account = %env.account, "origin bridge missing");
            return;
        };

        if transforms::should_ignore(&env, &origin.settings) {
            tracing::debug!(gateway = %self.name, user = %env.username, "ignored by filter");
            return;
        }

        transforms::apply_extract_nicks(&mut env, &origin.settings);

        if env.channel.is_empty() && env.event != EventKind::JoinLeave {
            tracing::debug!(gateway = %self.name, "empty channel, dropped");
            return;
        }

        // Oversize-attachment notices with no caption carry nothing to
        // relay.
        let failure_key = EventKind::FileFailureSize.as_str();
        if env.text.is_empty()
            && env
                .extra
                .get(failure_key)
                .map_or(false, |notes| !notes.is_empty())
        {
            return;
        }

        self.handle_files(&mut env).await;

        let canonical = if env.id.is_empty() {
            None
        } else {
            Some(
                self.resolve_canonical(&env.account, &env.protocol, &env.id)
                    .unwrap_or_else(|| CorrelationMap::canonical_key(&env.protocol, &env.id)),
            )
        };
        let parent_canonical = if env.parent_id.is_empty() {
            None
        } else {
            self.resolve_canonical(&env.account, &env.protocol, &env.parent_id)
        };

        for dest in self.dest_channels(&env) {
            let Some(bridge) = self.bridges.get(&dest.account) else {
                tracing::warn!(gateway = %self.name, account = %dest.account, "destination bridge missing");
                continue;
            };

            if env.event == EventKind::UserTyping && !transforms::typing_supported(&bridge.protocol)
            {
                tracing::debug!(
                    gateway = %self.name,
                    protocol = %bridge.protocol,
                    "typing not supported, send skipped"
                );
                continue;
            }
            if transforms::ignore_event(env.event, &bridge.protocol, &bridge.settings) {
                continue;
            }

            let mut out = env.clone();
            out.channel = dest.channel.clone();
            out.username = transforms::format_nick(&bridge.settings.remote_nick_format, &env);
            if bridge.settings.message_format == "plain" {
                out.text = transforms::strip_markdown(&out.text);
            }

            let job = Outbound {
                envelope: out,
                canonical: canonical.clone(),
                parent_canonical: parent_canonical.clone(),
                preserve_threading: bridge.settings.preserve_threading,
                correlation: self.correlation.clone(),
            };

            let Some(sender) = self.senders.get(&dest.account) else {
                tracing::warn!(gateway = %self.name, account = %dest.account, "no delivery queue");
                continue;
            };
            // A full queue means the destination is far behind or stalled;
            // skipping keeps the router and the other destinations moving.
            if let Err(e) = sender.try_send(job) {
                tracing::warn!(
                    gateway = %self.name,
                    account = %dest.account,
                    channel = %dest.channel,
                    error = %e,
                    "delivery queue unavailable, send skipped"
                );
            }
        }
    }

    /// Re-hosts in-band file bytes on the media server, filling each file's
    /// `url` and `sha` in place. A failed upload drops that attachment;
    /// the rest of the envelope continues.
    async fn handle_files(&self, env: &mut Envelope) {
        let Some(media) = &self.media else {
            return;
        };
        let Some(values) = env.extra.get_mut(EXTRA_FILE) else {
            return;
        };

        let mut kept = Vec::with_capacity(values.len());
        for value in std::mem::take(values) {
            match value {
                ExtraValue::File(mut fi) => {
                    fi.name = sanitize_filename(&fi.name);
                    let sha = match fi.data.as_deref() {
                        Some(data) => sha1_prefix(data),
                        None => {
                            // Already URL-addressed; nothing to re-host.
                            kept.push(ExtraValue::File(fi));
                            continue;
                        }
                    };
                    match media.upload(&fi).await {
                        Ok(url) => {
                            tracing::debug!(gateway = %self.name, file = %fi.name, %url, "media rehosted");
                            fi.url = Some(url);
                            fi.sha = sha;
                            kept.push(ExtraValue::File(fi));
                        }
                        Err(e) => {
                            tracing::warn!(
                                gateway = %self.name,
                                file = %fi.name,
                                error = %e,
                                "media upload failed, attachment dropped"
                            );
                        }
                    }
                }
                other => kept.push(other),
            }
        }
        *values = kept;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

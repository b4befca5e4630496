//! Envelope transforms and capability gating.
//!
//! Everything that rewrites or filters an envelope between ingress and the
//! per-destination send lives here: relay-bot nick recovery, the ignore
//! filters, the remote nick template, and the static tables of which
//! protocols can do what.

use regex::Regex;

use chatweave_types::config::AdapterSettings;
use chatweave_types::{ChatweaveError, Envelope, EventKind, Result};

/// Protocols that render a "user is typing" indication.
const TYPING_CAPABLE: &[&str] = &["slack", "discord"];

/// Protocols that consume `avatar-download` events.
const AVATAR_CAPABLE: &[&str] = &["mattermost", "telegram", "xmpp"];

/// True when the destination protocol can show typing notifications.
pub fn typing_supported(protocol: &str) -> bool {
    TYPING_CAPABLE.contains(&protocol)
}

/// True when the destination protocol consumes avatar downloads.
pub fn avatar_supported(protocol: &str) -> bool {
    AVATAR_CAPABLE.contains(&protocol)
}

// ---------------------------------------------------------------------------
// Event gating
// ---------------------------------------------------------------------------

/// True when this event must not be delivered to the destination.
///
/// Avatar downloads only go to protocols that use them; join/leave only
/// when the destination shows them; topic changes only when the
/// destination displays or syncs topics.
pub fn ignore_event(event: EventKind, dest_protocol: &str, dest: &AdapterSettings) -> bool {
    match event {
        EventKind::AvatarDownload => !avatar_supported(dest_protocol),
        EventKind::JoinLeave => !dest.show_join_part,
        EventKind::TopicChange => !dest.show_topic_change && !dest.sync_topic,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Ignore filters
// ---------------------------------------------------------------------------

/// True when the origin adapter's filters suppress this envelope: the
/// sender is on `IgnoreNicks`, or the text matches an `IgnoreMessages`
/// regex. Invalid regexes are logged and skipped.
pub fn should_ignore(env: &Envelope, origin: &AdapterSettings) -> bool {
    if origin
        .ignore_nicks
        .iter()
        .any(|nick| nick == &env.username)
    {
        return true;
    }
    for pattern in &origin.ignore_messages {
        match Regex::new(pattern) {
            Ok(re) => {
                if re.is_match(&env.text) {
                    return true;
                }
            }
            Err(e) => {
                tracing::warn!(%pattern, error = %e, "invalid IgnoreMessages regex");
            }
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Nick extraction
// ---------------------------------------------------------------------------

/// Applies one `(match, extract)` pair.
///
/// When `search` matches the username, `extract` is applied to the text;
/// its first capture group replaces the username and the matched span is
/// removed from the text (first occurrence only).
pub fn extract_nick(
    search: &str,
    extract: &str,
    username: &str,
    text: &str,
) -> Result<(String, String)> {
    let search_re = Regex::new(search).map_err(|e| ChatweaveError::Config {
        reason: format!("ExtractNicks match regex '{search}': {e}"),
    })?;
    if !search_re.is_match(username) {
        return Ok((username.to_string(), text.to_string()));
    }

    let extract_re = Regex::new(extract).map_err(|e| ChatweaveError::Config {
        reason: format!("ExtractNicks extract regex '{extract}': {e}"),
    })?;

    if let Some(caps) = extract_re.captures(text) {
        // Only rewrite on exactly one capture group.
        if caps.len() == 2 {
            let full = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            let nick = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            return Ok((nick.to_string(), text.replacen(full, "", 1)));
        }
    }
    Ok((username.to_string(), text.to_string()))
}

/// Runs all configured pairs over the envelope in order.
///
/// A regex compile error aborts the remaining pairs for this envelope and
/// is logged; the envelope continues unmodified past that point.
pub fn apply_extract_nicks(env: &mut Envelope, origin: &AdapterSettings) {
    for (search, extract) in &origin.extract_nicks {
        match extract_nick(search, extract, &env.username, &env.text) {
            Ok((username, text)) => {
                env.username = username;
                env.text = text;
            }
            Err(e) => {
                tracing::warn!(account = %env.account, error = %e, "nick extraction aborted");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Markdown flattening
// ---------------------------------------------------------------------------

/// Flattens common markdown for destinations that render plain text only
/// (`MessageFormat = "plain"`).
///
/// Handles emphasis markers, inline code and `[label](url)` links; anything
/// else passes through unchanged.
pub fn strip_markdown(text: &str) -> String {
    // Links first so their label survives the emphasis pass.
    let link = Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").expect("static regex");
    let mut out = link.replace_all(text, "$1 ($2)").into_owned();

    const EMPHASIS: &[&str] = &[
        r"\*\*([^*]+)\*\*",
        r"__([^_]+)__",
        r"\*([^*]+)\*",
        r"_([^_]+)_",
        r"`([^`]+)`",
    ];
    for pattern in EMPHASIS {
        let re = Regex::new(pattern).expect("static regex");
        // Nested markers (`**_x_**`) resolve over repeated passes.
        loop {
            let next = re.replace_all(&out, "$1").into_owned();
            if next == out {
                break;
            }
            out = next;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Remote nick template
// ---------------------------------------------------------------------------

/// Renders the destination's `RemoteNickFormat` for an envelope.
///
/// Supported placeholders: `{NICK}`, `{BRIDGE}` (origin instance name),
/// `{PROTOCOL}` (origin protocol), `{GATEWAY}`. An empty template leaves
/// the username untouched.
pub fn format_nick(template: &str, env: &Envelope) -> String {
    if template.is_empty() {
        return env.username.clone();
    }
    let bridge_name = env
        .account
        .split_once('.')
        .map(|(_, name)| name)
        .unwrap_or_default();
    template
        .replace("{NICK}", &env.username)
        .replace("{BRIDGE}", bridge_name)
        .replace("{PROTOCOL}", &env.protocol)
        .replace("{GATEWAY}", &env.gateway)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Per-destination delivery workers.
//!
//! Each bridge gets one worker task fed by a bounded queue. The queue is
//! the serialization point: jobs for one destination are delivered in
//! enqueue order, and a destination stalled in a rate-limit retry backs up
//! only its own queue — the router and every other destination keep
//! moving.
//!
//! Destination-native message IDs are resolved here, immediately before
//! the send, so an edit queued behind its own original still finds the
//! recorded ID.

use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use chatweave_bridge::Bridge;
use chatweave_types::{Envelope, EventKind};

use crate::correlation::{CorrelationMap, SentRef};

/// Outbound queue depth per destination. A destination this far behind is
/// treated as failing; further deliveries to it are skipped and logged.
pub const OUTBOUND_QUEUE: usize = 256;

/// One send, addressed to a single destination channel.
pub struct Outbound {
    /// Destination-ready envelope: channel and username rewritten,
    /// `id`/`parent_id` still carrying origin IDs.
    pub envelope: Envelope,
    /// Canonical key of the origin message, when it has an ID.
    pub canonical: Option<String>,
    /// Canonical key of the replied-to message, when resolvable.
    pub parent_canonical: Option<String>,
    /// Destination's `PreserveThreading` setting.
    pub preserve_threading: bool,
    /// The owning gateway's correlation table.
    pub correlation: Arc<RwLock<CorrelationMap>>,
}

/// Spawns the delivery worker for one bridge and returns its queue.
pub fn spawn_worker(bridge: Arc<Bridge>) -> mpsc::Sender<Outbound> {
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            deliver(&bridge, job).await;
        }
        tracing::debug!(account = %bridge.account, "outbound worker stopped");
    });
    tx
}

/// Resolves IDs, performs the send, and records the delivered copy.
async fn deliver(bridge: &Bridge, job: Outbound) {
    let mut env = job.envelope;
    let channel = env.channel.clone();

    // A poisoned correlation table degrades to "no known copy": fresh
    // sends still go out, edits fall back to new messages, deletes skip.
    let lookup = |key: &str| match job.correlation.read() {
        Ok(map) => map.dest_id(key, &bridge.account, &channel),
        Err(_) => {
            tracing::error!(account = %bridge.account, "correlation lock poisoned");
            None
        }
    };

    // Translate the origin ID into this destination's native ID. For a
    // delete with no known copy on this side there is nothing to act on.
    match &job.canonical {
        Some(key) => {
            let dest_id = lookup(key);
            if env.event == EventKind::MsgDelete {
                match dest_id {
                    Some(id) => env.id = id,
                    None => {
                        tracing::debug!(
                            account = %bridge.account,
                            channel = %channel,
                            "no delivered copy to delete"
                        );
                        return;
                    }
                }
            } else {
                // Present for edits, empty for first delivery.
                env.id = dest_id.unwrap_or_default();
            }
        }
        None => env.id.clear(),
    }

    env.parent_id = if job.preserve_threading {
        job.parent_canonical
            .as_deref()
            .and_then(&lookup)
            .unwrap_or_default()
    } else {
        String::new()
    };

    match bridge.send_with_retry(&env).await {
        Ok(id) => {
            if !id.is_empty() {
                if let Some(key) = &job.canonical {
                    match job.correlation.write() {
                        Ok(mut map) => map.record(
                            key,
                            SentRef {
                                account: bridge.account.clone(),
                                channel,
                                id,
                            },
                        ),
                        Err(_) => {
                            tracing::error!(
                                account = %bridge.account,
                                "correlation lock poisoned, delivered copy not recorded"
                            );
                        }
                    }
                }
            }
        }
        Err(e) => {
            if env.has_files() {
                tracing::warn!(
                    account = %bridge.account,
                    channel = %channel,
                    error = %e,
                    "file-bearing send failed; destination may lack an upload path"
                );
            } else {
                tracing::warn!(
                    account = %bridge.account,
                    channel = %channel,
                    error = %e,
                    "send failed, delivery skipped"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

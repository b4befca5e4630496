//! Reconnect controller.
//!
//! On a `failure` event the router spawns [`reconnect_loop`] for the named
//! bridge. The loop disconnects whatever is left of the old session, then
//! retries `connect` with exponential backoff in [1 s, 5 min] plus jitter.
//! On success it emits a `rejoin-channels` control envelope so the router
//! clears the joined set and re-issues the configured joins.
//!
//! The first connect at startup is a single attempt and is not handled
//! here; repeated startup failure is fatal for that adapter only.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;

use chatweave_types::Envelope;

use crate::{rejoin_event, Bridge, BridgeState};

/// Lower bound of the reconnect backoff.
const BACKOFF_MIN: Duration = Duration::from_secs(1);

/// Upper bound of the reconnect backoff.
const BACKOFF_MAX: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Backoff schedule
// ---------------------------------------------------------------------------

/// Doubling backoff with +/-25% jitter, clamped to [1 s, 5 min].
///
/// The schedule resets to the minimum on the first success.
pub struct BackoffSchedule {
    current: Duration,
}

impl BackoffSchedule {
    pub fn new() -> Self {
        Self {
            current: BACKOFF_MIN,
        }
    }

    /// Returns the next sleep and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(BACKOFF_MAX);

        let base_ms = base.as_millis() as u64;
        let jitter_range = base_ms / 4;
        let jitter = if jitter_range > 0 {
            let offset = rand::thread_rng().gen_range(0..=jitter_range * 2);
            offset as i64 - jitter_range as i64
        } else {
            0
        };
        Duration::from_millis((base_ms as i64 + jitter).max(1) as u64)
    }

    /// Resets the schedule to the minimum.
    pub fn reset(&mut self) {
        self.current = BACKOFF_MIN;
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Reconnect loop
// ---------------------------------------------------------------------------

/// Drives one bridge back to a connected state.
///
/// Returns quietly if another reconnect for the same bridge is already in
/// flight, or once `connect` succeeds and the rejoin request is emitted.
pub async fn reconnect_loop(bridge: Arc<Bridge>, ingress: mpsc::Sender<Envelope>) {
    match bridge.begin_connecting() {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(account = %bridge.account, "reconnect already in flight");
            return;
        }
        Err(e) => {
            tracing::error!(account = %bridge.account, error = %e, "reconnect aborted");
            return;
        }
    }

    // Tear down whatever is left of the previous session.
    if let Err(e) = bridge.disconnect().await {
        tracing::debug!(account = %bridge.account, error = %e, "disconnect before reconnect failed");
    }
    if let Err(e) = bridge.set_state(BridgeState::Connecting) {
        tracing::error!(account = %bridge.account, error = %e, "reconnect aborted");
        return;
    }

    let mut backoff = BackoffSchedule::new();
    loop {
        match bridge.connect().await {
            Ok(()) => break,
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    account = %bridge.account,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "reconnect attempt failed"
                );
                if let Err(e) = bridge.set_state(BridgeState::Connecting) {
                    tracing::error!(account = %bridge.account, error = %e, "reconnect aborted");
                    return;
                }
                tokio::time::sleep(delay).await;
            }
        }
    }

    tracing::info!(account = %bridge.account, "reconnected, requesting channel rejoin");
    if ingress
        .send(rejoin_event(&bridge.account, &bridge.protocol))
        .await
        .is_err()
    {
        tracing::warn!(account = %bridge.account, "ingress closed, rejoin request dropped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chatweave_types::config::{AdapterSettings, ChannelInfo};
    use chatweave_types::{ChatweaveError, EventKind, Result};

    use crate::Adapter;

    #[test]
    fn backoff_stays_in_bounds_and_doubles() {
        let mut schedule = BackoffSchedule::new();
        // 1s +/- 25%
        let d0 = schedule.next_delay();
        assert!(d0 >= Duration::from_millis(750) && d0 <= Duration::from_millis(1250));
        // 2s +/- 25%
        let d1 = schedule.next_delay();
        assert!(d1 >= Duration::from_millis(1500) && d1 <= Duration::from_millis(2500));
        // Far along, the schedule clamps at five minutes (+25%).
        for _ in 0..20 {
            let d = schedule.next_delay();
            assert!(d <= Duration::from_millis(375_000));
        }
    }

    #[test]
    fn backoff_reset_returns_to_minimum() {
        let mut schedule = BackoffSchedule::new();
        for _ in 0..6 {
            schedule.next_delay();
        }
        schedule.reset();
        let d = schedule.next_delay();
        assert!(d <= Duration::from_millis(1250));
    }

    /// Refuses to connect a fixed number of times, then succeeds after an
    /// optional handshake delay.
    #[derive(Debug)]
    struct FlakyAdapter {
        refusals: usize,
        handshake: Duration,
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Adapter for FlakyAdapter {
        async fn connect(&self) -> Result<()> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.refusals {
                Err(ChatweaveError::Transport {
                    reason: "connection refused".into(),
                })
            } else {
                tokio::time::sleep(self.handshake).await;
                Ok(())
            }
        }
        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
        async fn join_channel(&self, _channel: &ChannelInfo) -> Result<()> {
            Ok(())
        }
        async fn send(&self, _msg: &chatweave_types::Envelope) -> Result<String> {
            Ok(String::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_retries_then_emits_rejoin() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let bridge = Arc::new(crate::Bridge::new(
            "slack.main",
            "slack",
            "main",
            AdapterSettings::default(),
            Box::new(FlakyAdapter {
                refusals: 2,
                handshake: Duration::ZERO,
                attempts: attempts.clone(),
            }),
        ));
        let (tx, mut rx) = mpsc::channel(8);

        let handle = tokio::spawn(reconnect_loop(bridge.clone(), tx));
        let env = tokio::time::timeout(Duration::from_secs(600), rx.recv())
            .await
            .expect("reconnect must finish")
            .expect("rejoin envelope");
        handle.await.expect("join");

        assert_eq!(env.event, EventKind::RejoinChannels);
        assert_eq!(env.account, "slack.main");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(bridge.state().expect("state"), crate::BridgeState::Connected);
    }

    #[tokio::test]
    async fn concurrent_reconnects_deduplicated() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let bridge = Arc::new(crate::Bridge::new(
            "slack.main",
            "slack",
            "main",
            AdapterSettings::default(),
            Box::new(FlakyAdapter {
                refusals: 0,
                handshake: Duration::from_millis(200),
                attempts: attempts.clone(),
            }),
        ));
        let (tx, mut rx) = mpsc::channel(8);

        let a = tokio::spawn(reconnect_loop(bridge.clone(), tx.clone()));
        let b = tokio::spawn(reconnect_loop(bridge.clone(), tx));
        a.await.expect("join");
        b.await.expect("join");

        // Only one loop ran the connect; the other bailed on the guard.
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}

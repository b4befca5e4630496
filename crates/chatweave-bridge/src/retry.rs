//! Rate-limit/retry harness.
//!
//! Every outbound send holds the bridge's serial token. When the backend
//! answers with a "slow down" signal (surfaced by the adapter as
//! [`ChatweaveError::RateLimited`] carrying the server-suggested wait), the
//! harness sleeps exactly that long and retries the same call, indefinitely.
//! The server's `retry_after` is authoritative — no exponential backoff
//! here. Any other error is returned immediately.
//!
//! Because the token is held across the sleep, a stalled retry backs up
//! subsequent sends to the same backend. That is intended: it preserves
//! per-destination ordering and keeps us from hammering a throttling server.

use chatweave_types::{ChatweaveError, Envelope, Result};

use crate::Bridge;

impl Bridge {
    /// Sends one envelope through the adapter under the serial token,
    /// honoring backend rate-limit signals.
    pub async fn send_with_retry(&self, msg: &Envelope) -> Result<String> {
        let _token = self.send_lock.lock().await;
        loop {
            match self.adapter().send(msg).await {
                Ok(id) => return Ok(id),
                Err(ChatweaveError::RateLimited { retry_after }) => {
                    tracing::info!(
                        account = %self.account,
                        wait_ms = retry_after.as_millis() as u64,
                        "backend rate limit, retrying after server-suggested wait"
                    );
                    tokio::time::sleep(retry_after).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use chatweave_types::config::{AdapterSettings, ChannelInfo};
    use chatweave_types::{ChatweaveError, Envelope, Result};

    use crate::{Adapter, Bridge};

    /// Fails with a rate-limit signal a fixed number of times, then succeeds.
    struct ThrottledAdapter {
        failures: usize,
        retry_after: Duration,
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Adapter for ThrottledAdapter {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
        async fn join_channel(&self, _channel: &ChannelInfo) -> Result<()> {
            Ok(())
        }
        async fn send(&self, _msg: &Envelope) -> Result<String> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(ChatweaveError::RateLimited {
                    retry_after: self.retry_after,
                })
            } else {
                Ok(format!("native-{n}"))
            }
        }
    }

    fn throttled_bridge(failures: usize, retry_after: Duration) -> (Arc<Bridge>, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        let bridge = Arc::new(Bridge::new(
            "matrix.main",
            "matrix",
            "main",
            AdapterSettings::default(),
            Box::new(ThrottledAdapter {
                failures,
                retry_after,
                attempts: attempts.clone(),
            }),
        ));
        (bridge, attempts)
    }

    #[tokio::test]
    async fn retries_until_success_after_suggested_waits() -> Result<()> {
        // Three "slow down 250 ms" answers, then success: exactly one
        // delivery, at least 750 ms after the first attempt.
        let (bridge, attempts) = throttled_bridge(3, Duration::from_millis(250));
        let started = Instant::now();
        let id = bridge.send_with_retry(&Envelope::default()).await?;
        assert_eq!(id, "native-3");
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(
            started.elapsed() >= Duration::from_millis(750),
            "retries must honor the server-suggested waits"
        );
        Ok(())
    }

    #[tokio::test]
    async fn serializes_sends_to_the_same_backend() -> Result<()> {
        // While the first send is stalled in its retry loop, a second send
        // to the same backend must not complete.
        let (bridge, _) = throttled_bridge(2, Duration::from_millis(200));

        let first = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                let t0 = Instant::now();
                bridge.send_with_retry(&Envelope::default()).await?;
                Ok::<_, ChatweaveError>(t0.elapsed())
            })
        };
        // Give the first send time to take the token and stall.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                let t0 = Instant::now();
                bridge.send_with_retry(&Envelope::default()).await?;
                Ok::<_, ChatweaveError>(t0.elapsed())
            })
        };

        let first_elapsed = first.await.expect("join")?;
        let second_elapsed = second.await.expect("join")?;
        assert!(first_elapsed >= Duration::from_millis(400));
        // The second send only ran after the first released the token.
        assert!(second_elapsed >= Duration::from_millis(300));
        Ok(())
    }

    #[tokio::test]
    async fn non_rate_limit_errors_surface_immediately() {
        struct BrokenAdapter;

        #[async_trait]
        impl Adapter for BrokenAdapter {
            async fn connect(&self) -> Result<()> {
                Ok(())
            }
            async fn disconnect(&self) -> Result<()> {
                Ok(())
            }
            async fn join_channel(&self, _channel: &ChannelInfo) -> Result<()> {
                Ok(())
            }
            async fn send(&self, _msg: &Envelope) -> Result<String> {
                Err(ChatweaveError::SendFailed {
                    reason: "boom".into(),
                })
            }
        }

        let bridge = Bridge::new(
            "irc.main",
            "irc",
            "main",
            AdapterSettings::default(),
            Box::new(BrokenAdapter),
        );
        let err = bridge
            .send_with_retry(&Envelope::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatweaveError::SendFailed { .. }));
    }
}

//! The dispatch loop: single consumer of the shared ingress channel.
//!
//! [`run_loop`] is spawned by [`crate::router::Router::start`]. It uses
//! `tokio::select!` to multiplex:
//!
//! 1. **Ingress** — envelopes from every adapter, handled one at a time so
//!    per-origin ordering survives up to the point of dispatch.
//! 2. **Shutdown signal** — graceful exit via `watch` channel.
//!
//! Control events are intercepted before any routing: a `failure`
//! reconnects the named adapter, `rejoin-channels` re-issues its joins,
//! `get-channel-members` stores the membership snapshot. Everything else
//! is offered to each gateway that lists the origin as an input.

use chatweave_bridge::reconnect;
use chatweave_types::{Envelope, EventKind, ExtraValue};

use crate::router::RouterRuntime;

/// Runs the dispatch loop until shutdown or until every adapter is gone.
pub(crate) async fn run_loop(mut rt: RouterRuntime) {
    tracing::info!("router dispatch loop starting");

    loop {
        tokio::select! {
            maybe_env = rt.ingress_rx.recv() => {
                match maybe_env {
                    Some(env) => handle_envelope(&rt, env).await,
                    None => {
                        tracing::info!("ingress channel closed, dispatch exiting");
                        break;
                    }
                }
            }

            _ = rt.shutdown_rx.changed() => {
                if *rt.shutdown_rx.borrow() {
                    tracing::info!("shutdown signal received, dispatch exiting");
                    break;
                }
            }
        }
    }

    shutdown_sequence(&rt).await;
    tracing::info!("router dispatch loop exited");
}

/// Routes one envelope: control events first, then gateway dispatch.
async fn handle_envelope(rt: &RouterRuntime, env: Envelope) {
    if env.event.is_control() {
        handle_control(rt, env);
        return;
    }

    for gateway in &rt.gateways {
        if gateway.handles_origin(&env) {
            gateway.process(env.clone()).await;
        }
    }
}

/// Handles the control events adapters address to the router.
fn handle_control(rt: &RouterRuntime, env: Envelope) {
    let Some(bridge) = rt.bridges.get(&env.account) else {
        tracing::warn!(account = %env.account, event = %env.event, "control event for unknown adapter");
        return;
    };

    match env.event {
        EventKind::Failure => {
            tracing::warn!(account = %env.account, reason = %env.text, "adapter failure, reconnecting");
            tokio::spawn(reconnect::reconnect_loop(
                bridge.clone(),
                rt.ingress_tx.clone(),
            ));
        }

        EventKind::RejoinChannels => {
            if let Err(e) = bridge.clear_joined() {
                tracing::error!(account = %bridge.account, error = %e, "joined set reset failed");
                return;
            }
            let bridge = bridge.clone();
            // Joins sleep JoinDelay between channels; keep that off the
            // dispatch loop.
            tokio::spawn(async move {
                if let Err(e) = bridge.join_channels().await {
                    tracing::error!(account = %bridge.account, error = %e, "channel rejoin failed");
                }
            });
        }

        EventKind::GetChannelMembers => {
            let snapshot = env
                .extra
                .get(EventKind::GetChannelMembers.as_str())
                .into_iter()
                .flatten()
                .find_map(|v| match v {
                    ExtraValue::Members(list) => Some(list.clone()),
                    _ => None,
                });
            match snapshot {
                Some(members) => {
                    tracing::debug!(account = %env.account, members = members.0.len(), "membership snapshot stored");
                    if let Err(e) = bridge.set_channel_members(members) {
                        tracing::error!(account = %env.account, error = %e, "membership snapshot dropped");
                    }
                }
                None => {
                    tracing::warn!(account = %env.account, "get-channel-members without a snapshot payload");
                }
            }
        }

        // is_control() keeps everything else out of here.
        _ => {}
    }
}

/// Disconnects every bridge on the way out.
async fn shutdown_sequence(rt: &RouterRuntime) {
    tracing::info!("disconnecting adapters");
    for bridge in rt.bridges.values() {
        if let Err(e) = bridge.disconnect().await {
            tracing::warn!(account = %bridge.account, error = %e, "disconnect failed during shutdown");
        }
    }
}

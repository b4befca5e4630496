//! Router lifecycle.
//!
//! The [`Router`] is the process-wide registry of gateways and bridges.
//! It is built from the validated configuration, connects every adapter
//! once at startup, then moves its runtime state into the single dispatch
//! task (see [`crate::dispatch`]).
//!
//! ```text
//! from_config() ──▶ connect_all() ──▶ start() ──▶ shutdown()
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use chatweave_bridge::registry::Registry;
use chatweave_bridge::{AdapterContext, Bridge};
use chatweave_media::MediaServer;
use chatweave_types::config::{ChannelInfo, RootConfig};
use chatweave_types::{split_account, ChatweaveError, Envelope, Result};

use crate::dispatch;
use crate::gateway::Gateway;
use crate::outbound::{self, Outbound};

/// Ingress channel depth. When full, the slowest adapter blocks its own
/// reader — the intended back-pressure.
const INGRESS_CAPACITY: usize = 4096;

// ---------------------------------------------------------------------------
// RouterRuntime (internal)
// ---------------------------------------------------------------------------

/// Owned state moved into the dispatch task.
pub(crate) struct RouterRuntime {
    pub gateways: Vec<Gateway>,
    pub bridges: Arc<HashMap<String, Arc<Bridge>>>,
    pub ingress_tx: mpsc::Sender<Envelope>,
    pub ingress_rx: mpsc::Receiver<Envelope>,
    pub shutdown_rx: watch::Receiver<bool>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Process-wide registry of gateways and adapters.
pub struct Router {
    bridges: Arc<HashMap<String, Arc<Bridge>>>,
    /// Moved into the dispatch task by `start()`.
    runtime: Option<RouterRuntime>,
    ingress_tx: mpsc::Sender<Envelope>,
    shutdown_tx: watch::Sender<bool>,
}

impl Router {
    /// Builds bridges, delivery workers and gateways from configuration.
    ///
    /// Only accounts referenced by an enabled gateway are constructed.
    /// The media server (if configured) is brought up here so a
    /// misconfigured store fails before any adapter connects.
    pub async fn from_config(cfg: &RootConfig, registry: &Registry) -> Result<Self> {
        cfg.validate()?;

        let media: Option<Arc<dyn MediaServer>> =
            chatweave_media::from_config(&cfg.general).await?;

        let (ingress_tx, ingress_rx) = mpsc::channel(INGRESS_CAPACITY);

        let mut bridges: HashMap<String, Arc<Bridge>> = HashMap::new();
        for account in cfg.referenced_accounts() {
            let (protocol, name) = split_account(&account)?;
            let section = cfg.adapter(&account).ok_or_else(|| ChatweaveError::Config {
                reason: format!("no section for account '{account}'"),
            })?;
            let settings = section.settings(&cfg.general);
            let adapter = registry.create(AdapterContext {
                account: account.clone(),
                protocol: protocol.to_string(),
                name: name.to_string(),
                config: section.clone(),
                general: cfg.general.clone(),
                ingress: ingress_tx.clone(),
            })?;
            let bridge = Arc::new(Bridge::new(&account, protocol, name, settings, adapter));

            // The bridge joins every channel any enabled gateway puts it in.
            for gw in cfg.gateways.iter().filter(|g| g.enable) {
                for entry in gw.entries().filter(|e| e.account == account) {
                    bridge.add_channel(ChannelInfo {
                        name: entry.channel.clone(),
                        options: entry.options.clone(),
                    })?;
                }
            }

            bridges.insert(account, bridge);
        }
        let bridges = Arc::new(bridges);

        let senders: HashMap<String, mpsc::Sender<Outbound>> = bridges
            .iter()
            .map(|(account, bridge)| (account.clone(), outbound::spawn_worker(bridge.clone())))
            .collect();

        let gateways: Vec<Gateway> = cfg
            .gateways
            .iter()
            .filter(|g| g.enable)
            .map(|g| Gateway::new(g, bridges.clone(), senders.clone(), media.clone()))
            .collect();

        tracing::info!(
            gateways = gateways.len(),
            adapters = bridges.len(),
            media = media.is_some(),
            "router assembled"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            bridges: bridges.clone(),
            runtime: Some(RouterRuntime {
                gateways,
                bridges,
                ingress_tx: ingress_tx.clone(),
                ingress_rx,
                shutdown_rx,
            }),
            ingress_tx,
            shutdown_tx,
        })
    }

    /// Connects and joins every bridge, one attempt each.
    ///
    /// A refusing adapter is logged and left disconnected (the operator
    /// sees it; nothing reconnects it until it emits a `failure`). Errors
    /// only when *every* adapter failed its first connect.
    pub async fn connect_all(&self) -> Result<()> {
        let mut connected = 0usize;
        for bridge in self.bridges.values() {
            match bridge.connect().await {
                Ok(()) => {
                    if let Err(e) = bridge.join_channels().await {
                        tracing::error!(account = %bridge.account, error = %e, "initial join failed");
                    }
                    connected += 1;
                }
                Err(e) => {
                    tracing::error!(account = %bridge.account, error = %e, "initial connect failed");
                }
            }
        }

        if connected == 0 && !self.bridges.is_empty() {
            return Err(ChatweaveError::Transport {
                reason: "every adapter failed its first connect".into(),
            });
        }
        Ok(())
    }

    /// Spawns the dispatch task. Call once, after [`connect_all`](Self::connect_all).
    pub fn start(&mut self) -> Result<JoinHandle<()>> {
        let runtime = self.runtime.take().ok_or_else(|| ChatweaveError::Config {
            reason: "router already started".into(),
        })?;
        Ok(tokio::spawn(dispatch::run_loop(runtime)))
    }

    /// Signals the dispatch task to drain and exit.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// A handle onto the shared ingress channel.
    ///
    /// Everything written here flows through dispatch — adapters use the
    /// clone they got at construction; tests and embedders use this one.
    pub fn ingress_sender(&self) -> mpsc::Sender<Envelope> {
        self.ingress_tx.clone()
    }

    /// Looks up a bridge by account.
    pub fn bridge(&self, account: &str) -> Option<Arc<Bridge>> {
        self.bridges.get(account).cloned()
    }
}

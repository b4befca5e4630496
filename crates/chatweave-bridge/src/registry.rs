//! Protocol factory table.
//!
//! Adapter construction dispatches on the protocol name, so the daemon can
//! build whatever the configuration references without linking every
//! backend unconditionally. The table is written only at startup; after
//! that it is read-only. Compile-time features exclude entries the same way
//! the per-protocol sections do.

use std::collections::HashMap;

use chatweave_types::{ChatweaveError, Result};

use crate::{Adapter, AdapterContext, Factory};

/// The protocol → factory table.
pub struct Registry {
    factories: HashMap<String, Factory>,
}

impl Registry {
    /// An empty table. External adapter crates register into this.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// The table with all in-tree adapters registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        #[cfg(feature = "api")]
        registry.register("api", crate::api::new_adapter);
        registry
    }

    /// Registers a factory for a protocol name. Later registrations win.
    pub fn register(&mut self, protocol: &str, factory: Factory) {
        self.factories.insert(protocol.to_string(), factory);
    }

    /// True when a factory is registered for the protocol.
    pub fn supports(&self, protocol: &str) -> bool {
        self.factories.contains_key(protocol)
    }

    /// Constructs an adapter for the context's protocol.
    pub fn create(&self, ctx: AdapterContext) -> Result<Box<dyn Adapter>> {
        let factory = self
            .factories
            .get(&ctx.protocol)
            .ok_or_else(|| ChatweaveError::Config {
                reason: format!(
                    "no adapter registered for protocol '{}' (account '{}')",
                    ctx.protocol, ctx.account
                ),
            })?;
        factory(ctx)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

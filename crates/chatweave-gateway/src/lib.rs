//! Gateway routing core.
//!
//! The pipeline, end to end: every adapter publishes normalized
//! [`chatweave_types::Envelope`]s onto one shared ingress channel; the
//! router's dispatch task consumes it alone and offers each envelope to
//! every [`Gateway`] that lists the origin as an input; the gateway runs
//! the transforms and media pass, then hands one delivery job per
//! destination to that destination's worker queue, where IDs are resolved
//! against the gateway's [`CorrelationMap`] and the send goes out through
//! the rate-limit harness.

pub mod correlation;
mod dispatch;
pub mod gateway;
pub mod outbound;
pub mod router;
pub mod transforms;

pub use correlation::{CorrelationMap, SentRef};
pub use gateway::{Direction, Gateway, GatewayChannel};
pub use outbound::Outbound;
pub use router::Router;

//! Interface to the embedding load balancer engine.
//!
//! The node consumes this interface and never hands out live references:
//! the engine sees state values and status snapshots only, and answers with
//! its own values. The engine is responsible for everything that follows
//! from a state change (IP takeover, gratuitous ARP, service start/stop).

use crate::types::{HAConfig, HAState, HAStatus};
use async_trait::async_trait;
use common::Result;

/// Engine operations consumed by a [`crate::Node`].
#[async_trait]
pub trait Engine: Send + Sync {
    /// Notify the engine that the node entered `state`. Invoked on every
    /// transition; failures are logged and tolerated (the status reporter
    /// will re-notify or escalate).
    async fn ha_state(&self, state: HAState) -> Result<()>;

    /// Report the current status snapshot. Returns whether the engine
    /// requests a failover; a MASTER honoring the request shuts down.
    async fn ha_update(&self, status: HAStatus) -> Result<bool>;

    /// Fetch the HA configuration the engine currently wants. A result that
    /// differs from the node's running configuration is treated as fatal so
    /// a supervisor can restart the node with the new parameters.
    async fn ha_config(&self) -> Result<HAConfig>;
}

//! Logging setup for the HA components.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter directives: the HA crates log at INFO, everything else
/// is quieted down to WARN so per-advertisement noise from dependencies
/// never drowns out state transitions.
const DEFAULT_DIRECTIVES: &str = "warn,common=info,vrrp=info";

/// Initialize tracing.
///
/// The RUST_LOG environment variable overrides the default filter; set
/// `vrrp=debug` to see timer recalculations and per-advertisement events.
pub fn init() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES)),
        )
        .init();
}

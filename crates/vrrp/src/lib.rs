//! Virtual Router Redundancy Protocol (VRRP) Version 3
//!
//! High-availability coordination between exactly two load balancer nodes,
//! per RFC 5798. One node is MASTER and periodically multicasts (or unicasts)
//! priority-bearing advertisements over raw IP protocol 112; the other is
//! BACKUP and takes over when the master falls silent, releases mastership,
//! or loses a priority comparison.
//!
//! The crate provides:
//!
//! - [`Advertisement`]: the fixed 8-octet VRRPv3 advertisement record.
//! - [`IpHAConn`]: a raw-socket transport that marshals, checksums and
//!   validates advertisements (TTL 255, RFC 1071 checksum over a
//!   pseudo-header, self-echo suppression).
//! - [`Node`]: the BACKUP/MASTER state machine plus its supervisory tasks
//!   (receiver, advertisement sender, status reporter, config checker).
//! - [`Engine`]: the interface through which an embedding engine is told
//!   about state changes and consulted for configuration and failover.
//!
//! IP address takeover (gratuitous ARP etc.) is the engine's job; this crate
//! only decides who the master is.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vrrp::{IpHAConn, Node, NodeConfig};
//!
//! # async fn example(engine: Arc<dyn vrrp::Engine>) -> common::Result<()> {
//! let mut config = NodeConfig::default();
//! config.ha.vrid = 60;
//! config.ha.priority = 150;
//! config.ha.local_addr = "10.0.0.1".parse().unwrap();
//! config.ha.remote_addr = "224.0.0.18".parse().unwrap();
//!
//! let conn = Arc::new(IpHAConn::new(config.ha.local_addr, config.ha.remote_addr)?);
//! let node = Arc::new(Node::new(config, conn, engine)?);
//!
//! // Runs until Shutdown is requested or an unrecoverable error occurs
//! // (requires CAP_NET_RAW for the raw socket).
//! node.run().await?;
//! # Ok(())
//! # }
//! ```

mod advertisement;
mod checksum;
mod conn;
mod engine;
mod state_machine;
mod types;

pub use advertisement::{Advertisement, VRRP_ADVERT_SIZE, VRRP_VERSION_TYPE};
pub use checksum::{checksum, ip_checksum};
pub use conn::{HAConn, IpHAConn, Packet};
pub use engine::Engine;
pub use state_machine::Node;
pub use types::{
    master_down_interval, HAConfig, HAState, HAStatus, NodeConfig, VRRP_MULTICAST_ADDR_V4,
    VRRP_MULTICAST_ADDR_V6, VRRP_PROTOCOL, VRRP_VERSION,
};

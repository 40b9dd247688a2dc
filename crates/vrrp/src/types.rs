//! VRRP data types and structures.
//!
//! Based on RFC 5798: Virtual Router Redundancy Protocol (VRRP) Version 3

use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, SystemTime};

/// VRRP protocol version (3 per RFC 5798)
pub const VRRP_VERSION: u8 = 3;

/// VRRP IP protocol number
pub const VRRP_PROTOCOL: u8 = 112;

/// VRRP multicast address for IPv4
pub const VRRP_MULTICAST_ADDR_V4: &str = "224.0.0.18";

/// VRRP multicast address for IPv6
pub const VRRP_MULTICAST_ADDR_V6: &str = "ff02::12";

/// HA state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HAState {
    /// Monitoring the master's advertisements, ready to take over.
    Backup,
    /// Owning the virtual router and sending advertisements.
    Master,
    /// Terminal state; the run loop has ended.
    Shutdown,
    /// An unrecoverable error ended the run loop.
    Error,
}

impl fmt::Display for HAState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HAState::Backup => write!(f, "BACKUP"),
            HAState::Master => write!(f, "MASTER"),
            HAState::Shutdown => write!(f, "SHUTDOWN"),
            HAState::Error => write!(f, "ERROR"),
        }
    }
}

/// HA parameters shared with the engine.
///
/// The config checker periodically fetches the engine's copy and treats any
/// difference as a fatal condition, so an external supervisor can restart the
/// node under the new parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HAConfig {
    /// Whether HA is enabled for this node.
    pub enabled: bool,

    /// Local address advertisements are sent from.
    pub local_addr: IpAddr,

    /// Peer unicast address or VRRP multicast group.
    pub remote_addr: IpAddr,

    /// Priority for this router (1-255, 255 = IP address owner).
    pub priority: u8,

    /// Virtual Router ID (1-255).
    pub vrid: u8,
}

impl Default for HAConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            local_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            remote_addr: IpAddr::V4(Ipv4Addr::new(224, 0, 0, 18)),
            priority: 100,
            vrid: 1,
        }
    }
}

/// Operational configuration for a [`crate::Node`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// HA parameters shared with the engine.
    pub ha: HAConfig,

    /// Interval between advertisements while MASTER.
    pub master_advert_interval: Duration,

    /// Whether to preempt a lower priority master.
    pub preempt: bool,

    /// Interval between engine config fetches.
    pub config_check_interval: Duration,
    /// Consecutive config fetch failures tolerated before giving up.
    pub config_check_max_failures: u32,
    /// Delay between config fetch retries.
    pub config_check_retry_delay: Duration,

    /// Interval between engine status reports.
    pub status_report_interval: Duration,
    /// Consecutive status report failures tolerated before giving up.
    pub status_report_max_failures: u32,
    /// Delay between status report retries.
    pub status_report_retry_delay: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ha: HAConfig::default(),
            master_advert_interval: Duration::from_secs(1),
            preempt: true,
            config_check_interval: Duration::from_secs(15),
            config_check_max_failures: 3,
            config_check_retry_delay: Duration::from_secs(2),
            status_report_interval: Duration::from_secs(3),
            status_report_max_failures: 3,
            status_report_retry_delay: Duration::from_secs(2),
        }
    }
}

impl NodeConfig {
    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.ha.vrid == 0 {
            return Err(Error::config("VRID must be between 1 and 255"));
        }

        if self.ha.priority == 0 {
            return Err(Error::config("priority must be between 1 and 255"));
        }

        // The wire AdvertInt field is u16 centiseconds.
        if self.master_advert_interval < Duration::from_millis(10) {
            return Err(Error::config(
                "master advert interval below 10ms cannot be represented",
            ));
        }
        if self.master_advert_interval.as_millis() / 10 > u16::MAX as u128 {
            return Err(Error::config(
                "master advert interval too large for a 16-bit centisecond field",
            ));
        }

        if self.config_check_interval.is_zero() || self.status_report_interval.is_zero() {
            return Err(Error::config("supervisory intervals must be non-zero"));
        }

        Ok(())
    }

    /// The advertisement interval as carried on the wire, in centiseconds.
    pub fn advert_int_centis(&self) -> u16 {
        (self.master_advert_interval.as_millis() / 10) as u16
    }
}

/// Observable status snapshot of a node, reported to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HAStatus {
    /// Current HA state.
    pub state: HAState,

    /// When the last state change happened.
    pub since: SystemTime,

    /// Number of state transitions.
    pub transitions: u64,

    /// Advertisements sent (as master).
    pub sent: u64,

    /// Advertisements received and accepted.
    pub received: u64,

    /// Advertisements currently queued for the state machine.
    pub received_queued: u64,
}

/// Calculate Master_Down_Interval per RFC 5798 Section 6.1.
///
/// Master_Down_Interval = (3 * Advertisement_Interval) + Skew_Time
/// Skew_Time = ((256 - Priority) * Advertisement_Interval) / 256
pub fn master_down_interval(priority: u8, advert_interval: Duration) -> Duration {
    let skew_time = (advert_interval * (256 - priority as u32)) / 256;
    advert_interval * 3 + skew_time
}

//! VRRP advertisement packet format and parsing.
//!
//! RFC 5798 Section 5.1 - VRRP Packet Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version| Type  | Virtual Rtr ID|   Priority    | Count IP Addrs|
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |(rsvd) |     Max Adver Int     |          Checksum             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! This node never advertises virtual addresses in the packet itself
//! (Count IP Addrs is always zero; address ownership is the engine's
//! concern), so an advertisement is always exactly 8 octets.

use crate::types::VRRP_VERSION;
use bytes::{BufMut, Bytes, BytesMut};

/// VRRP packet type (always 1 = ADVERTISEMENT)
const VRRP_ADVERT_TYPE: u8 = 1;

/// Size in octets of an encoded advertisement.
pub const VRRP_ADVERT_SIZE: usize = 8;

/// Combined version and type octet of every packet this node sends and
/// accepts: version 3 in the high nibble, advertisement in the low.
pub const VRRP_VERSION_TYPE: u8 = VRRP_VERSION << 4 | VRRP_ADVERT_TYPE;

/// A VRRPv3 advertisement. Field names and sizes are per RFC 5798.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advertisement {
    /// Version (4 bits, always 3) and Type (4 bits, always 1).
    pub version_type: u8,

    /// Virtual Router ID (1-255).
    pub vrid: u8,

    /// Priority (1-255, 0 = master releasing mastership).
    pub priority: u8,

    /// Count of IP addresses carried in the packet; always 0 here.
    pub count_ip_addrs: u8,

    /// Master advertisement interval in centiseconds.
    pub advert_int: u16,

    /// Checksum over pseudo-header + advertisement; 0 means "not yet
    /// computed" and is filled in by the transport on send.
    pub checksum: u16,
}

impl Advertisement {
    /// Create a new advertisement with a zero checksum.
    pub fn new(vrid: u8, priority: u8, advert_int: u16) -> Self {
        Self {
            version_type: VRRP_VERSION_TYPE,
            vrid,
            priority,
            count_ip_addrs: 0,
            advert_int,
            checksum: 0,
        }
    }

    /// Parse an advertisement from its exact wire representation.
    ///
    /// Only the length is checked here; version, type and VRID validation
    /// belongs to the state machine, which ignores rather than rejects.
    pub fn parse(data: &[u8]) -> Result<Self, &'static str> {
        if data.len() != VRRP_ADVERT_SIZE {
            return Err("advertisement must be exactly 8 octets");
        }

        Ok(Self {
            version_type: data[0],
            vrid: data[1],
            priority: data[2],
            count_ip_addrs: data[3],
            advert_int: u16::from_be_bytes([data[4], data[5]]),
            checksum: u16::from_be_bytes([data[6], data[7]]),
        })
    }

    /// Append the big-endian wire representation to `buf`.
    pub fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version_type);
        buf.put_u8(self.vrid);
        buf.put_u8(self.priority);
        buf.put_u8(self.count_ip_addrs);
        buf.put_u16(self.advert_int);
        buf.put_u16(self.checksum);
    }

    /// Serialize to the 8-octet wire representation.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(VRRP_ADVERT_SIZE);
        self.put(&mut buf);
        buf.freeze()
    }
}

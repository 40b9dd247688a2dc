//! VRRP checksum computation.
//!
//! RFC 5798 carries the advertisement checksum over a synthetic IP
//! pseudo-header followed by the advertisement itself, summed per RFC 1071.
//! One function serves both directions: a sender computes it with the
//! checksum field zeroed to obtain the value to transmit, and a receiver
//! computes it over the packet exactly as received and accepts iff the
//! result is zero.

use crate::advertisement::{Advertisement, VRRP_ADVERT_SIZE};
use crate::types::VRRP_PROTOCOL;
use bytes::{BufMut, BytesMut};
use common::{Error, Result};
use std::net::IpAddr;

/// Pseudo-header sizes: src(4) dst(4) zero(1) proto(1) len(2) for IPv4,
/// src(16) dst(16) len(4) zeros(3) next-header(1) for IPv6.
const IPV4_PSEUDO_HEADER_SIZE: usize = 12;
const IPV6_PSEUDO_HEADER_SIZE: usize = 40;

/// Compute the checksum of `advert` between the given endpoints.
///
/// The advertisement is serialized as-is, including its current checksum
/// field. Both addresses must belong to the same family.
pub fn checksum(advert: &Advertisement, src: IpAddr, dst: IpAddr) -> Result<u16> {
    let mut buf = BytesMut::with_capacity(IPV6_PSEUDO_HEADER_SIZE + VRRP_ADVERT_SIZE);

    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            buf.put_slice(&src.octets());
            buf.put_slice(&dst.octets());
            buf.put_u8(0);
            buf.put_u8(VRRP_PROTOCOL);
            buf.put_u16(VRRP_ADVERT_SIZE as u16);
            debug_assert_eq!(buf.len(), IPV4_PSEUDO_HEADER_SIZE);
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            buf.put_slice(&src.octets());
            buf.put_slice(&dst.octets());
            buf.put_u32(VRRP_ADVERT_SIZE as u32);
            buf.put_slice(&[0u8; 3]);
            buf.put_u8(VRRP_PROTOCOL);
            debug_assert_eq!(buf.len(), IPV6_PSEUDO_HEADER_SIZE);
        }
        _ => {
            return Err(Error::transport(format!(
                "checksum({src}, {dst}): need two IPv4 or two IPv6 addresses"
            )));
        }
    }

    advert.put(&mut buf);
    Ok(ip_checksum(&buf))
}

/// Calculate the IP checksum of a byte slice per RFC 1071.
///
/// 16-bit big-endian words are summed into a 32-bit accumulator, carries
/// are folded back in, and the one's complement of the result is returned.
/// A trailing odd byte counts as the high byte of a final word.
pub fn ip_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !sum as u16
}

//! Raw-socket transport for VRRP advertisements.
//!
//! Advertisements travel as the payload of raw IP protocol 112 packets,
//! either unicast to the peer or multicast to the VRRP group, for both IPv4
//! and IPv6. RFC 5798 requires TTL/hop-limit 255 on everything sent and
//! received; the receive path additionally validates payload size, drops
//! self-echoes, and verifies the pseudo-header checksum before an
//! advertisement is surfaced to the state machine.
//!
//! Socket layout: one raw socket bound to the local address carries sends.
//! For IPv4 multicast the kernel will not deliver group traffic to that
//! socket, so a second socket bound to the group address handles receives;
//! in every other mode the send socket doubles as the receive socket. For
//! IPv6 the source TTL and destination address are not part of the payload
//! returned by the kernel, so they are requested as ancillary data
//! (RFC 3542) and read from control messages.

use crate::advertisement::{Advertisement, VRRP_ADVERT_SIZE};
use crate::checksum::checksum;
use crate::types::VRRP_PROTOCOL;
use async_trait::async_trait;
use bytes::Bytes;
use common::{Error, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::ffi::CStr;
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::time;
use tracing::{debug, info};

/// Connection for sending and receiving advertisements between two nodes.
#[async_trait]
pub trait HAConn: Send + Sync {
    /// Encode and send `advert` to the peer, failing with an I/O error if
    /// the write has not completed within `timeout`. A zero checksum field
    /// is filled in before transmission.
    async fn send(&self, advert: &Advertisement, timeout: Duration) -> Result<()>;

    /// Block until a validated advertisement is received (`Some`), a
    /// recoverable condition was suppressed (`None`), or an unrecoverable
    /// error occurs.
    async fn receive(&self) -> Result<Option<Advertisement>>;
}

/// A received IP packet, as seen by the validation path.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Source address from the IP header (IPv4) or the socket API (IPv6).
    pub src: IpAddr,
    /// Destination address, used in the checksum pseudo-header.
    pub dst: IpAddr,
    /// TTL (IPv4) or hop limit (IPv6).
    pub ttl: u8,
    /// The VRRP payload.
    pub payload: Bytes,
}

/// Up to 60 bytes for the IPv4 header + 8 bytes for the VRRP payload,
/// rounded to the next power of 2.
const RECV_BUFFER_SIZE: usize = 96;

/// Per RFC 3542 10240 bytes should "always be large enough".
const OOB_BUFFER_SIZE: usize = 10240;

/// Raw-IP implementation of [`HAConn`].
///
/// Sockets live for the lifetime of the connection; the multicast group is
/// joined once at construction and left on drop.
pub struct IpHAConn {
    send_sock: Arc<AsyncFd<Socket>>,
    recv_sock: Arc<AsyncFd<Socket>>,
    local: IpAddr,
    remote: IpAddr,
    /// Index of the interface carrying the local address; only set for
    /// IPv6 multicast, where the group join needs it.
    mcast_ifindex: u32,
}

impl IpHAConn {
    /// Create a connection between `local` and `remote`, which must belong
    /// to the same address family. Requires CAP_NET_RAW, and must be called
    /// from within a tokio runtime (the sockets register with its reactor).
    pub fn new(local: IpAddr, remote: IpAddr) -> Result<Self> {
        if local.is_ipv4() != remote.is_ipv4() {
            return Err(Error::transport(format!(
                "local {local} and remote {remote} must share an address family"
            )));
        }

        let send = open_conn(local, remote)?;
        let mut mcast_ifindex = 0;

        let (send_sock, recv_sock) = if remote.is_multicast() {
            match (local, remote) {
                (IpAddr::V4(laddr), IpAddr::V4(gaddr)) => {
                    let recv = listen_multicast_v4(gaddr, laddr)?;
                    debug!("using IPv4 multicast");
                    (Arc::new(AsyncFd::new(send)?), Arc::new(AsyncFd::new(recv)?))
                }
                (IpAddr::V6(_), IpAddr::V6(gaddr)) => {
                    mcast_ifindex = find_interface_index(local)?;
                    join_multicast_v6(send.as_raw_fd(), gaddr, mcast_ifindex)?;
                    setsockopt(
                        send.as_raw_fd(),
                        libc::IPPROTO_IPV6,
                        libc::IPV6_MULTICAST_IF,
                        mcast_ifindex as libc::c_int,
                    )?;
                    debug!(ifindex = mcast_ifindex, "using IPv6 multicast");
                    let sock = Arc::new(AsyncFd::new(send)?);
                    (Arc::clone(&sock), sock)
                }
                _ => unreachable!("address families checked above"),
            }
        } else {
            let sock = Arc::new(AsyncFd::new(send)?);
            (Arc::clone(&sock), sock)
        };

        Ok(Self {
            send_sock,
            recv_sock,
            local,
            remote,
            mcast_ifindex,
        })
    }

    /// Read one packet from the receive socket.
    ///
    /// Returns `Ok(None)` for packets too mangled to describe (the sender
    /// is not our peer speaking VRRP; there is nothing to recover).
    async fn read_packet(&self) -> io::Result<Option<Packet>> {
        loop {
            let mut guard = self.recv_sock.readable().await?;
            let result = match self.local {
                IpAddr::V4(_) => guard.try_io(|fd| read_ipv4_packet(fd.get_ref())),
                IpAddr::V6(_) => guard.try_io(|fd| read_ipv6_packet(fd.get_ref())),
            };
            match result {
                Ok(res) => return res,
                Err(_would_block) => continue,
            }
        }
    }
}

#[async_trait]
impl HAConn for IpHAConn {
    async fn send(&self, advert: &Advertisement, timeout: Duration) -> Result<()> {
        let mut advert = *advert;
        if advert.checksum == 0 {
            advert.checksum = checksum(&advert, self.local, self.remote)?;
        }

        let buf = advert.to_bytes();
        let dst: SockAddr = SocketAddr::new(self.remote, 0).into();

        let write = async {
            loop {
                let mut guard = self.send_sock.writable().await?;
                match guard.try_io(|fd| fd.get_ref().send_to(&buf, &dst)) {
                    Ok(res) => return res,
                    Err(_would_block) => continue,
                }
            }
        };

        match time::timeout(timeout, write).await {
            Ok(res) => {
                res?;
                Ok(())
            }
            Err(_) => Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "advertisement send timed out",
            ))),
        }
    }

    async fn receive(&self) -> Result<Option<Advertisement>> {
        let packet = match self.read_packet().await {
            Ok(Some(packet)) => packet,
            Ok(None) => return Ok(None),
            // ENOPROTOOPT/EPROTO arrive as ICMP responses to advertisements
            // sent while the peer's HA process is down.
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::ENOPROTOOPT) | Some(libc::EPROTO)
                ) =>
            {
                debug!("ignoring ENOPROTOOPT/EPROTO");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        Ok(validate_packet(&packet, self.local))
    }
}

impl Drop for IpHAConn {
    fn drop(&mut self) {
        // Best effort to leave the multicast group on cleanup.
        match (self.local, self.remote) {
            (IpAddr::V4(laddr), IpAddr::V4(gaddr)) if gaddr.is_multicast() => {
                let mreq = libc::ip_mreq {
                    imr_multiaddr: in_addr(gaddr),
                    imr_interface: in_addr(laddr),
                };
                let _ = setsockopt_struct(
                    self.recv_sock.get_ref().as_raw_fd(),
                    libc::IPPROTO_IP,
                    libc::IP_DROP_MEMBERSHIP,
                    &mreq,
                );
            }
            (IpAddr::V6(_), IpAddr::V6(gaddr)) if gaddr.is_multicast() => {
                let mreq = libc::ipv6_mreq {
                    ipv6mr_multiaddr: libc::in6_addr {
                        s6_addr: gaddr.octets(),
                    },
                    ipv6mr_interface: self.mcast_ifindex,
                };
                let _ = setsockopt_struct(
                    self.recv_sock.get_ref().as_raw_fd(),
                    libc::IPPROTO_IPV6,
                    libc::IPV6_DROP_MEMBERSHIP,
                    &mreq,
                );
            }
            _ => {}
        }
    }
}

/// Apply the VRRP receive validation rules to a raw packet, returning the
/// advertisement it carries if every check passes.
fn validate_packet(packet: &Packet, local: IpAddr) -> Option<Advertisement> {
    if packet.payload.len() != VRRP_ADVERT_SIZE {
        return None;
    }
    let advert = Advertisement::parse(&packet.payload).ok()?;

    // Drop packets from ourselves.
    if packet.src == local {
        info!(src = %packet.src, "received packet from localhost");
        return None;
    }

    // Drop packets that don't have TTL/HOPLIMIT 255.
    if packet.ttl != 255 {
        info!(ttl = packet.ttl, src = %packet.src, "invalid TTL/hop limit");
        return None;
    }

    // Validate the VRRP checksum.
    match checksum(&advert, packet.src, packet.dst) {
        Ok(0) => Some(advert),
        Ok(_) => {
            info!(checksum = advert.checksum, src = %packet.src, "invalid VRRP checksum");
            None
        }
        Err(e) => {
            info!(src = %packet.src, error = %e, "failed to compute checksum");
            None
        }
    }
}

/// Create a raw protocol-112 socket bound to `local` with the TTL and
/// ancillary-data options RFC 5798 requires for the given family and mode.
fn open_conn(local: IpAddr, remote: IpAddr) -> io::Result<Socket> {
    let domain = if local.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::RAW, Some(Protocol::from(VRRP_PROTOCOL as i32)))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::new(local, 0).into())?;

    let fd = socket.as_raw_fd();
    match local {
        IpAddr::V4(laddr) => {
            if remote.is_multicast() {
                // TTL = 255 per the VRRP spec.
                setsockopt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, 255)?;
                // We don't want to receive our own messages.
                setsockopt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP, 0)?;
                // Send group traffic out the interface carrying the local
                // address rather than whatever the routing table picks.
                setsockopt_struct(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_IF, &in_addr(laddr))?;
            } else {
                setsockopt(fd, libc::IPPROTO_IP, libc::IP_TTL, 255)?;
            }
        }
        IpAddr::V6(_) => {
            if remote.is_multicast() {
                setsockopt(fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_HOPS, 255)?;
                setsockopt(fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_LOOP, 0)?;
            } else {
                setsockopt(fd, libc::IPPROTO_IPV6, libc::IPV6_UNICAST_HOPS, 255)?;
            }

            // Request hop limit and destination address as ancillary data
            // on every received packet; the IPv6 read path needs both.
            setsockopt(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVHOPLIMIT, 1)?;
            setsockopt(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, 1)?;
        }
    }

    Ok(socket)
}

/// Create a second raw socket bound to the IPv4 group address and join the
/// group on the interface carrying `laddr`. The send socket never sees
/// group traffic, so receives go through this one.
fn listen_multicast_v4(gaddr: Ipv4Addr, laddr: Ipv4Addr) -> io::Result<Socket> {
    let socket = Socket::new(
        Domain::IPV4,
        Type::RAW,
        Some(Protocol::from(VRRP_PROTOCOL as i32)),
    )?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::new(IpAddr::V4(gaddr), 0).into())?;

    let mreq = libc::ip_mreq {
        imr_multiaddr: in_addr(gaddr),
        imr_interface: in_addr(laddr),
    };
    setsockopt_struct(
        socket.as_raw_fd(),
        libc::IPPROTO_IP,
        libc::IP_ADD_MEMBERSHIP,
        &mreq,
    )?;

    Ok(socket)
}

/// Join the IPv6 multicast group `gaddr` on the given interface.
fn join_multicast_v6(fd: RawFd, gaddr: Ipv6Addr, ifindex: u32) -> io::Result<()> {
    let mreq = libc::ipv6_mreq {
        ipv6mr_multiaddr: libc::in6_addr {
            s6_addr: gaddr.octets(),
        },
        ipv6mr_interface: ifindex,
    };
    setsockopt_struct(fd, libc::IPPROTO_IPV6, libc::IPV6_ADD_MEMBERSHIP, &mreq)
}

/// Read an IPv4 packet. For IPv4 a raw-socket read returns the IP header
/// followed by the payload, so TTL, source and destination come straight
/// from header offsets.
fn read_ipv4_packet(sock: &Socket) -> io::Result<Option<Packet>> {
    let mut buf = [MaybeUninit::<u8>::uninit(); RECV_BUFFER_SIZE];
    let n = sock.recv(&mut buf)?;
    let b = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, n) };
    Ok(parse_ipv4_packet(b))
}

/// Extract src/dst/TTL/payload from a raw IPv4 datagram.
fn parse_ipv4_packet(b: &[u8]) -> Option<Packet> {
    if b.len() < 20 {
        info!(len = b.len(), "discarding truncated IPv4 packet");
        return None;
    }
    if b[0] >> 4 != 4 {
        info!(version = b[0] >> 4, "expected an IPv4 packet");
        return None;
    }
    let hdr_len = ((b[0] & 0x0f) as usize) << 2;
    if hdr_len > b.len() {
        info!(
            hdr_len,
            len = b.len(),
            "IPv4 header length exceeds packet length"
        );
        return None;
    }

    Some(Packet {
        src: IpAddr::V4(Ipv4Addr::new(b[12], b[13], b[14], b[15])),
        dst: IpAddr::V4(Ipv4Addr::new(b[16], b[17], b[18], b[19])),
        ttl: b[8],
        payload: Bytes::copy_from_slice(&b[hdr_len..]),
    })
}

/// Read an IPv6 packet. Raw-socket reads do not include the IPv6 header, so
/// the hop limit and destination address come from HOPLIMIT and PKTINFO
/// control messages (RFC 3542) and the source from the socket address.
fn read_ipv6_packet(sock: &Socket) -> io::Result<Option<Packet>> {
    let mut buf = [0u8; RECV_BUFFER_SIZE];
    let mut oob = [0u8; OOB_BUFFER_SIZE];
    let mut src_storage: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &mut src_storage as *mut _ as *mut libc::c_void;
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = oob.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = oob.len() as _;

    let n = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    if src_storage.sin6_family != libc::AF_INET6 as libc::sa_family_t {
        info!(family = src_storage.sin6_family, "unexpected source address family");
        return Ok(None);
    }
    let src = Ipv6Addr::from(src_storage.sin6_addr.s6_addr);

    let mut ttl = None;
    let mut dst = None;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        let hdr = unsafe { &*cmsg };
        if hdr.cmsg_level == libc::IPPROTO_IPV6 {
            match hdr.cmsg_type {
                libc::IPV6_HOPLIMIT => {
                    let limit = unsafe { *(libc::CMSG_DATA(cmsg) as *const libc::c_int) };
                    ttl = Some(limit as u8);
                }
                libc::IPV6_PKTINFO => {
                    let info = unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo) };
                    dst = Some(Ipv6Addr::from(info.ipi6_addr.s6_addr));
                }
                _ => {}
            }
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
    }

    let (ttl, dst) = match (ttl, dst) {
        (Some(ttl), Some(dst)) => (ttl, dst),
        _ => {
            info!(src = %src, "missing HOPLIMIT or PKTINFO ancillary data");
            return Ok(None);
        }
    };

    Ok(Some(Packet {
        src: IpAddr::V6(src),
        dst: IpAddr::V6(dst),
        ttl,
        payload: Bytes::copy_from_slice(&buf[..n as usize]),
    }))
}

fn in_addr(addr: Ipv4Addr) -> libc::in_addr {
    // s_addr is stored in network byte order.
    libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.octets()),
    }
}

fn setsockopt(fd: RawFd, level: libc::c_int, opt: libc::c_int, value: libc::c_int) -> io::Result<()> {
    setsockopt_struct(fd, level, opt, &value)
}

fn setsockopt_struct<T>(fd: RawFd, level: libc::c_int, opt: libc::c_int, value: &T) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            value as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Find the index of the interface carrying `addr`.
fn find_interface_index(addr: IpAddr) -> io::Result<u32> {
    let mut ifap: *mut libc::ifaddrs = ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut index = None;
    let mut cur = ifap;
    while !cur.is_null() {
        let ifa = unsafe { &*cur };
        if !ifa.ifa_addr.is_null() && sockaddr_ip(ifa.ifa_addr) == Some(addr) {
            let name = unsafe { CStr::from_ptr(ifa.ifa_name) };
            let idx = unsafe { libc::if_nametoindex(name.as_ptr()) };
            if idx != 0 {
                index = Some(idx);
            }
            break;
        }
        cur = ifa.ifa_next;
    }
    unsafe { libc::freeifaddrs(ifap) };

    index.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no interface with address {addr}"),
        )
    })
}

/// Read the IP address out of a raw sockaddr, if it is an INET family.
fn sockaddr_ip(sa: *const libc::sockaddr) -> Option<IpAddr> {
    match unsafe { (*sa).sa_family } as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(sa as *const libc::sockaddr_in) };
            Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(sa as *const libc::sockaddr_in6) };
            Some(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)))
        }
        _ => None,
    }
}

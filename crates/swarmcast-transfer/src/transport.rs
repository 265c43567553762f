/// Best-effort multicast datagram transport.
///
/// The protocol state machines talk to the wire only through the
/// `Transport` trait, so tests can substitute an in-memory bus with
/// scripted loss. The production implementation wraps a UDP socket joined
/// to the session's multicast group: every send goes to the group, every
/// peer (Master included) hears every frame, which is what makes overheard
/// NACK suppression work.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::protocol::{MULTICAST_GROUP, MULTICAST_PORT, MULTICAST_TTL};

/// Datagram send/receive. No delivery or ordering guarantees; `recv` uses
/// a read timeout so run loops can observe cancellation, surfacing
/// `WouldBlock`/`TimedOut` as an idle tick.
pub trait Transport: Send + Sync {
    fn send(&self, buf: &[u8]) -> io::Result<usize>;
    fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

#[derive(Debug, Clone)]
pub struct MulticastConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    pub ttl: u32,
    pub read_timeout: Duration,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        MulticastConfig {
            group: MULTICAST_GROUP.parse().expect("valid group literal"),
            port: MULTICAST_PORT,
            ttl: MULTICAST_TTL,
            read_timeout: Duration::from_millis(100),
        }
    }
}

/// UDP socket bound to the multicast port and joined to the group.
pub struct MulticastSocket {
    socket: UdpSocket,
    group_addr: SocketAddr,
}

impl MulticastSocket {
    /// Open, configure, and join. Address reuse is enabled so several
    /// processes on one host (Master plus UAVs in tests, or co-located
    /// UAVs) can share the port; loopback stays on so they hear each
    /// other.
    pub fn open(config: &MulticastConfig) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(false)?;
        socket.set_read_timeout(Some(config.read_timeout))?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(config.ttl)?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);
        socket.bind(&SocketAddr::V4(bind_addr).into())?;
        socket.join_multicast_v4(&config.group, &Ipv4Addr::UNSPECIFIED)?;

        Ok(MulticastSocket {
            socket: socket.into(),
            group_addr: SocketAddr::V4(SocketAddrV4::new(config.group, config.port)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for MulticastSocket {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send_to(buf, self.group_addr)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }
}

/// True for the error kinds a timed-out `recv` produces.
/// Windows reports TimedOut, Unix reports WouldBlock.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

//! Per-segment mDNS reflection
//!
//! One reflector owns one multicast socket on one attached segment. It
//! reads datagrams, runs them through the translator and re-announces the
//! rewritten datagram onto the same segment's multicast group. There is no
//! cross-segment forwarding: two reflectors run concurrently, one per
//! segment, and never touch each other's sockets.

use crate::config::Segment;
use crate::error::Result;
use crate::identity::Identities;
use crate::translate::translate;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;

/// IANA-assigned mDNS multicast group
pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
/// IANA-assigned mDNS port
pub const MDNS_PORT: u16 = 5353;

/// Receive buffer size; mDNS datagrams stay well under this.
const RECV_BUFFER: usize = 4096;

/// One segment's reflection loop.
pub struct Reflector {
  label: String,
  socket: UdpSocket,
}

impl Reflector {
  /// Join the mDNS group on the segment's interface. A bind or join
  /// failure here is fatal to startup.
  pub fn bind(segment: &Segment) -> Result<Self> {
    let socket = mdns_socket(segment.interface)?;
    tracing::info!(
      "[{}] joined {}:{} on interface {}",
      segment.label,
      MDNS_GROUP,
      MDNS_PORT,
      segment.interface
    );
    Ok(Self {
      label: segment.label.clone(),
      socket,
    })
  }

  /// Read, translate and re-announce until the process exits. Datagrams
  /// are handled strictly in receive order; a receive error or a datagram
  /// the translator drops never stops the loop.
  pub async fn run(self, identities: Arc<Identities>) {
    let group = SocketAddr::from((MDNS_GROUP, MDNS_PORT));
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
      let (len, origin) = match self.socket.recv_from(&mut buf).await {
        Ok(received) => received,
        Err(e) => {
          tracing::warn!("[{}] receive failed: {}", self.label, e);
          continue;
        }
      };
      tracing::debug!("[{}] {} byte datagram from {}", self.label, len, origin);

      // "No output" means send nothing for this datagram.
      let Some(rewritten) = translate(&buf[..len], &identities) else {
        continue;
      };
      if let Err(e) = self.socket.send_to(&rewritten, group).await {
        tracing::warn!("[{}] re-announce failed: {}", self.label, e);
      }
    }
  }
}

/// Multicast socket for one interface: address reuse so other mDNS
/// responders keep working, group joined on the given interface, TTL 255
/// per RFC 6762, and outbound multicast pinned to the same interface so
/// re-announcements stay on the originating segment.
fn mdns_socket(interface: Ipv4Addr) -> Result<UdpSocket> {
  let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
  socket.set_reuse_address(true)?;
  #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd"))]
  socket.set_reuse_port(true)?;

  let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MDNS_PORT);
  socket.bind(&bind_addr.into())?;
  socket.join_multicast_v4(&MDNS_GROUP, &interface)?;
  socket.set_multicast_if_v4(&interface)?;
  socket.set_multicast_ttl_v4(255)?;
  // Our own re-announcements must not come back through the loop.
  socket.set_multicast_loop_v4(false)?;
  socket.set_nonblocking(true)?;

  let std_socket: std::net::UdpSocket = socket.into();
  Ok(UdpSocket::from_std(std_socket)?)
}

//! Network identities of the masqueraded device and the proxy
//!
//! An identity is an IPv4 address plus its canonical reverse-DNS pointer
//! name (`d.c.b.a.in-addr.arpa.` for address `a.b.c.d`). Both identities
//! are derived once at startup and are read-only afterwards.

use crate::error::{Error, Result};
use hickory_proto::rr::Name;
use std::net::Ipv4Addr;

/// Canonical reverse-DNS pointer name for an IPv4 address.
///
/// `reverse_pointer(192.168.1.10)` is `10.1.168.192.in-addr.arpa.`.
pub fn reverse_pointer(address: Ipv4Addr) -> String {
  let o = address.octets();
  format!("{}.{}.{}.{}.in-addr.arpa.", o[3], o[2], o[1], o[0])
}

/// One endpoint's network identity: its address and reverse-DNS name.
#[derive(Debug, Clone)]
pub struct NetworkIdentity {
  /// IPv4 address of the endpoint
  pub address: Ipv4Addr,
  /// Fully-qualified reverse-DNS pointer name for `address`
  pub reverse_name: Name,
}

impl NetworkIdentity {
  /// Derive the identity for an IPv4 address.
  pub fn new(address: Ipv4Addr) -> Result<Self> {
    let reverse_name = Name::from_ascii(reverse_pointer(address))
      .map_err(|e| Error::config(format!("invalid reverse name for {}: {}", address, e)))?;
    Ok(Self {
      address,
      reverse_name,
    })
  }
}

/// The two process-wide identities: the real device being masqueraded and
/// this proxy. Constructed once at startup and passed by reference into the
/// translator, the certificate issuer and the relays.
#[derive(Debug, Clone)]
pub struct Identities {
  /// The real endpoint being masqueraded
  pub device: NetworkIdentity,
  /// This system's externally reachable address
  pub proxy: NetworkIdentity,
}

impl Identities {
  /// Derive both identities from the configured addresses.
  pub fn new(device: Ipv4Addr, proxy: Ipv4Addr) -> Result<Self> {
    Ok(Self {
      device: NetworkIdentity::new(device)?,
      proxy: NetworkIdentity::new(proxy)?,
    })
  }
}

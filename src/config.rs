//! Startup configuration
//!
//! Everything here is resolved once at process start; a missing or
//! unparsable value is fatal. After that the configuration is read-only.

use crate::error::{Error, Result};
use crate::identity::Identities;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// One attached network segment, identified by the IPv4 address of its
/// interface. The multicast group membership is joined on that address.
#[derive(Debug, Clone)]
pub struct Segment {
  /// Human-readable label for the diagnostic stream
  pub label: String,
  /// IPv4 address of the interface attached to this segment
  pub interface: Ipv4Addr,
}

impl Segment {
  pub fn new(label: impl Into<String>, interface: Ipv4Addr) -> Self {
    Self {
      label: label.into(),
      interface,
    }
  }
}

/// Which relay variant to run on the session port. The two are mutually
/// exclusive deployment modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
  /// Terminate inbound TLS with minted certificates, re-dial the device
  /// over TLS and log the plaintext.
  Intercept,
  /// Pipe bytes to the device without inspection.
  Plain,
}

/// Full proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
  /// Segment facing the clients being deceived
  pub client_segment: Segment,
  /// Segment facing the real device
  pub device_segment: Segment,
  /// The device and proxy identities
  pub identities: Identities,
  /// TCP port for the session relay (8009 in this deployment)
  pub relay_port: u16,
  /// Relay variant to run
  pub mode: RelayMode,
  /// Path of the persisted CA certificate (PEM)
  pub ca_cert_path: PathBuf,
  /// Path of the persisted CA private key (PEM)
  pub ca_key_path: PathBuf,
  /// Skip certificate validation when dialing the device. This is an
  /// explicit trust decision, off by default.
  pub insecure_upstream: bool,
}

impl Config {
  /// Build a configuration from already-parsed values, deriving both
  /// reverse-DNS identities.
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    client_interface: Ipv4Addr,
    device_interface: Ipv4Addr,
    device: Ipv4Addr,
    proxy: Ipv4Addr,
    relay_port: u16,
    mode: RelayMode,
    ca_cert_path: PathBuf,
    ca_key_path: PathBuf,
    insecure_upstream: bool,
  ) -> Result<Self> {
    if device == proxy {
      return Err(Error::config(format!(
        "device and proxy addresses must differ, both are {}",
        device
      )));
    }
    Ok(Self {
      client_segment: Segment::new("client", client_interface),
      device_segment: Segment::new("device", device_interface),
      identities: Identities::new(device, proxy)?,
      relay_port,
      mode,
      ca_cert_path,
      ca_key_path,
      insecure_upstream,
    })
  }
}

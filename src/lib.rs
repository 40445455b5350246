//! Transparent network identity masquerading
//!
//! This crate substitutes a proxy host's network identity for a real
//! device's identity at two protocol layers, so clients on a segment
//! believe they are talking to the device while all traffic flows through
//! the proxy:
//!
//! - an mDNS reflector that rewrites DNS resource records in flight,
//!   replacing every reference to the device's address or reverse-DNS name
//!   with the proxy's, and re-announces the result on the originating
//!   segment;
//! - a TLS-intercepting relay that terminates inbound TLS with
//!   certificates minted on demand from a locally generated CA, dials the
//!   real device over TLS, and logs the plaintext in between. A plain TCP
//!   variant is available where decryption is not wanted.
//!
//! # Example
//!
//! ```no_run
//! use castmask::{CertificateAuthority, CertificateIssuer, InterceptRelay};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ca = CertificateAuthority::load_or_create(
//!         Path::new("ca.crt"), Path::new("ca.key")).await?;
//!     let issuer = Arc::new(CertificateIssuer::new(ca));
//!     let relay = InterceptRelay::bind(
//!         "0.0.0.0:8009".parse()?, "192.168.2.172:8009".parse()?, issuer, false).await?;
//!     relay.run().await?;
//!     Ok(())
//! }
//! ```

pub mod ca;
pub mod config;
pub mod error;
pub mod identity;
pub mod intercept;
pub mod reflector;
pub mod relay;
pub mod translate;

pub use ca::{CertificateAuthority, CertificateIssuer};
pub use config::{Config, RelayMode, Segment};
pub use error::{Error, Result};
pub use identity::{reverse_pointer, Identities, NetworkIdentity};
pub use intercept::InterceptRelay;
pub use reflector::{Reflector, MDNS_GROUP, MDNS_PORT};
pub use relay::PlainRelay;
pub use translate::translate;

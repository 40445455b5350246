//! Private PKI for the intercepting relay
//!
//! A long-lived self-signed root is loaded from disk when present and
//! generated on first need; leaves are minted on demand for whatever
//! identity a client asks for and cached for the lifetime of the process.

use crate::error::{Error, Result};
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, RwLock};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::crypto::ring::sign::any_supported_type;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::sign::CertifiedKey;

/// Root validity: ten years from creation
const ROOT_VALIDITY_DAYS: i64 = 3650;
/// Leaf validity: one year
const LEAF_VALIDITY_DAYS: i64 = 365;

/// The root certificate authority signing all minted leaves.
///
/// Exactly one exists per deployment: the keypair and certificate are
/// persisted at the configured paths on first creation and reloaded on
/// every subsequent start. A present-but-unparsable pair is fatal.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  root_der: CertificateDer<'static>,
}

impl CertificateAuthority {
  /// Load the CA from `cert_path`/`key_path`, or generate and persist a
  /// new one when either file is missing.
  pub async fn load_or_create(cert_path: &Path, key_path: &Path) -> Result<Self> {
    let (issuer, root_der) = if cert_path.exists() && key_path.exists() {
      Self::load(cert_path, key_path).await?
    } else {
      Self::generate(cert_path, key_path).await?
    };
    Ok(Self { issuer, root_der })
  }

  async fn load(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate(format!("failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to parse CA certificate: {}", e)))?;

    let root_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate("no certificate found in CA PEM"))?
      .map_err(|e| Error::certificate(format!("failed to decode CA PEM: {}", e)))?;

    tracing::info!("loaded existing CA from {}", cert_path.display());
    Ok((issuer, root_der))
  }

  async fn generate(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    tracing::info!("generating new CA");

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Castmask Proxy CA");
    dn.push(DnType::OrganizationName, "Castmask");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![
      ExtendedKeyUsagePurpose::ClientAuth,
      ExtendedKeyUsagePurpose::ServerAuth,
    ];
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate CA key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate(format!("failed to self-sign CA: {}", e)))?;

    let cert_pem = cert.pem();
    fs::write(cert_path, cert_pem.as_bytes()).await?;
    fs::write(key_path, key_pair.serialize_pem().as_bytes()).await?;
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    let root_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to build issuer: {}", e)))?;

    tracing::info!(
      "CA persisted to {} and {}",
      cert_path.display(),
      key_path.display()
    );
    Ok((issuer, root_der))
  }

  /// Root certificate in DER form, for installing in client trust stores
  /// and for serving as the second element of every leaf chain.
  pub fn root_certificate(&self) -> CertificateDer<'static> {
    self.root_der.clone()
  }

  /// Mint a leaf for one requested identity, signed by this CA.
  ///
  /// An identity that parses as an IP address becomes a SAN IP entry,
  /// anything else a SAN DNS entry. The chain is `[leaf, root]` so clients
  /// that only trust the root can build the path.
  pub fn issue_leaf(
    &self,
    identity: &str,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut params = CertificateParams::default();

    // Serial from a high-resolution timestamp so parallel issuance for
    // different identities cannot collide.
    let serial = OffsetDateTime::now_utc().unix_timestamp_nanos() as u64;
    params.serial_number = Some(serial.into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, identity);
    params.distinguished_name = dn;

    params.subject_alt_names = if let Ok(ip) = identity.parse::<IpAddr>() {
      vec![SanType::IpAddress(ip)]
    } else {
      vec![SanType::DnsName(identity.try_into().map_err(|_| {
        Error::certificate(format!("invalid identity for SAN: {}", identity))
      })?)]
    };

    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate leaf key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate(format!("failed to sign leaf for {}: {}", identity, e)))?;

    let leaf_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate("failed to serialize leaf key"))?;

    Ok((vec![leaf_der, self.root_der.clone()], key_der))
  }
}

/// On-demand leaf issuance with a process-lifetime cache.
///
/// The cache is the only mutable state shared across sessions. Lookups for
/// different identities never block each other beyond the map lock; a race
/// on the same identity may generate twice, but all callers converge on
/// the first stored result. Entries are never evicted and never refreshed
/// after their own validity lapses; a stale leaf fails the consuming
/// handshake rather than being silently reissued.
pub struct CertificateIssuer {
  ca: CertificateAuthority,
  cache: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl CertificateIssuer {
  pub fn new(ca: CertificateAuthority) -> Self {
    Self {
      ca,
      cache: RwLock::new(HashMap::new()),
    }
  }

  /// Return the cached leaf for `identity`, minting and caching it first
  /// when absent. Failures surface to the caller and fail only that
  /// handshake, never the process.
  pub fn get_or_issue(&self, identity: &str) -> Result<Arc<CertifiedKey>> {
    {
      let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
      if let Some(key) = cache.get(identity) {
        return Ok(key.clone());
      }
    }

    tracing::info!("minting certificate for {}", identity);
    let (chain, key_der) = self.ca.issue_leaf(identity)?;
    let signing_key = any_supported_type(&key_der)
      .map_err(|e| Error::certificate(format!("unusable leaf key: {}", e)))?;
    let certified = Arc::new(CertifiedKey::new(chain, signing_key));

    let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
    Ok(
      cache
        .entry(identity.to_string())
        .or_insert(certified)
        .clone(),
    )
  }

  /// Root certificate of the backing CA.
  pub fn root_certificate(&self) -> CertificateDer<'static> {
    self.ca.root_certificate()
  }
}

impl std::fmt::Debug for CertificateIssuer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertificateIssuer").finish_non_exhaustive()
  }
}

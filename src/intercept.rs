//! TLS-intercepting relay
//!
//! Terminates inbound TLS with leaves minted for whatever identity the
//! client's SNI names, re-establishes TLS to the real device, and pipes
//! bytes both ways while logging the plaintext. Every accepted connection
//! runs in its own task; the accept loop never blocks on a session.

use crate::ca::CertificateIssuer;
use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::{
  ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Relay that terminates and re-originates TLS around the device.
pub struct InterceptRelay {
  listener: TcpListener,
  device: SocketAddr,
  device_name: ServerName<'static>,
  acceptor: TlsAcceptor,
  connector: TlsConnector,
}

impl InterceptRelay {
  /// Bind the listening socket and prepare both TLS configurations.
  /// Binding failure is fatal to startup.
  pub async fn bind(
    listen: SocketAddr,
    device: SocketAddr,
    issuer: Arc<CertificateIssuer>,
    insecure_upstream: bool,
  ) -> Result<Self> {
    let resolver = Arc::new(SniCertResolver {
      default_identity: device.ip().to_string(),
      issuer,
    });
    let server_config = ServerConfig::builder()
      .with_no_client_auth()
      .with_cert_resolver(resolver);
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let client_config = if insecure_upstream {
      tracing::warn!("device certificate validation is disabled");
      ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth()
    } else {
      let mut roots = RootCertStore::empty();
      for cert in rustls_native_certs::load_native_certs().certs {
        roots.add(cert).ok();
      }
      ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
    };
    let connector = TlsConnector::from(Arc::new(client_config));

    let listener = TcpListener::bind(listen)
      .await
      .map_err(|e| Error::connection(format!("failed to bind {}: {}", listen, e)))?;

    Ok(Self {
      listener,
      device,
      device_name: ServerName::from(device.ip()),
      acceptor,
      connector,
    })
  }

  /// Address the relay is listening on.
  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  /// Accept connections until the process exits. Accept errors are logged
  /// and the loop keeps accepting; session errors never cross sessions.
  pub async fn run(self) -> Result<()> {
    tracing::info!(
      "intercepting relay listening on {} for device {}",
      self.local_addr()?,
      self.device
    );
    loop {
      match self.listener.accept().await {
        Ok((stream, peer)) => {
          tracing::info!("new TLS connection from {}", peer);
          let acceptor = self.acceptor.clone();
          let connector = self.connector.clone();
          let device = self.device;
          let device_name = self.device_name.clone();
          tokio::spawn(async move {
            if let Err(e) = relay_session(stream, acceptor, connector, device, device_name).await {
              tracing::warn!("session with {} ended: {}", peer, e);
            }
          });
        }
        Err(e) => tracing::warn!("failed to accept connection: {}", e),
      }
    }
  }
}

/// Terminate the client's TLS, dial the device over TLS, then pipe both
/// directions. The first read or write error on either direction,
/// including clean end-of-stream, tears the whole session down.
async fn relay_session(
  client: TcpStream,
  acceptor: TlsAcceptor,
  connector: TlsConnector,
  device: SocketAddr,
  device_name: ServerName<'static>,
) -> Result<()> {
  let client_tls = acceptor
    .accept(client)
    .await
    .map_err(|e| Error::tls(format!("client handshake failed: {}", e)))?;

  let tcp = TcpStream::connect(device)
    .await
    .map_err(|e| Error::connection(format!("could not connect to device {}: {}", device, e)))?;
  let device_tls = connector
    .connect(device_name, tcp)
    .await
    .map_err(|e| Error::tls(format!("device handshake failed: {}", e)))?;
  tracing::info!("TLS established with device {}", device);

  let (client_read, client_write) = tokio::io::split(client_tls);
  let (device_read, device_write) = tokio::io::split(device_tls);
  tokio::select! {
    result = tap_copy(client_read, device_write, "client -> device") => log_direction("client -> device", result),
    result = tap_copy(device_read, client_write, "device -> client") => log_direction("device -> client", result),
  }
  tracing::info!("connection closed");
  Ok(())
}

fn log_direction(direction: &str, result: std::io::Result<u64>) {
  match result {
    Ok(total) => tracing::debug!("{} finished after {} bytes", direction, total),
    Err(e) => tracing::warn!("{} failed: {}", direction, e),
  }
}

/// Copy one direction, logging each chunk as text framed with delimiters.
/// The log stream is diagnostic only; the bytes forwarded are unmodified.
async fn tap_copy<R, W>(mut src: R, mut dst: W, direction: &str) -> std::io::Result<u64>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buf = vec![0u8; 16 * 1024];
  let mut total = 0u64;
  loop {
    let n = src.read(&mut buf).await?;
    if n == 0 {
      return Ok(total);
    }
    tracing::info!(
      "--- {} ({} bytes) ---\n{}\n--- end {} ---",
      direction,
      n,
      String::from_utf8_lossy(&buf[..n]),
      direction
    );
    dst.write_all(&buf[..n]).await?;
    total += n as u64;
  }
}

/// Picks (or mints) the certificate matching the handshake's SNI. Without
/// SNI the device's address stands in, so clients dialing the proxy by IP
/// still get a servable certificate.
#[derive(Debug)]
struct SniCertResolver {
  default_identity: String,
  issuer: Arc<CertificateIssuer>,
}

impl ResolvesServerCert for SniCertResolver {
  fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
    let identity = client_hello
      .server_name()
      .unwrap_or(&self.default_identity);
    tracing::debug!("TLS handshake for {}", identity);
    match self.issuer.get_or_issue(identity) {
      Ok(certified) => Some(certified),
      Err(e) => {
        tracing::error!("no certificate for {}: {}", identity, e);
        None
      }
    }
  }
}

/// Verifier that accepts any device certificate. Selected only by the
/// explicit insecure-upstream toggle.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
    ]
  }
}

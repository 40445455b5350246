//! Plain TCP relay
//!
//! Pass-through variant for deployments where decryption is unnecessary or
//! unavailable: accepts TCP connections and pipes bytes to the device with
//! no inspection. Only the initial dial is time-bounded.

use crate::error::{Error, Result};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Bound on the dial to the device; sessions themselves are unbounded.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay piping bytes between clients and the device without inspection.
pub struct PlainRelay {
  listener: TcpListener,
  device: SocketAddr,
}

impl PlainRelay {
  /// Bind the listening socket. Binding failure is fatal to startup.
  pub async fn bind(listen: SocketAddr, device: SocketAddr) -> Result<Self> {
    let listener = TcpListener::bind(listen)
      .await
      .map_err(|e| Error::connection(format!("failed to bind {}: {}", listen, e)))?;
    Ok(Self { listener, device })
  }

  /// Address the relay is listening on.
  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  /// Accept and forward until the process exits. Transient accept errors
  /// are logged and skipped; a permanent accept error is fatal to the
  /// relay.
  pub async fn run(self) -> Result<()> {
    tracing::info!(
      "plain relay listening on {} for device {}",
      self.local_addr()?,
      self.device
    );
    loop {
      match self.listener.accept().await {
        Ok((client, peer)) => {
          tracing::info!("new connection from {}", peer);
          let device = self.device;
          tokio::spawn(async move {
            forward(client, device).await;
          });
        }
        Err(e) if is_transient(&e) => {
          tracing::warn!("failed to accept connection: {}", e);
        }
        Err(e) => {
          return Err(Error::connection(format!("listener failed: {}", e)));
        }
      }
    }
  }
}

async fn forward(mut client: TcpStream, device: SocketAddr) {
  let mut device_stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(device)).await {
    Ok(Ok(stream)) => stream,
    Ok(Err(e)) => {
      tracing::warn!("could not connect to device {}: {}", device, e);
      return;
    }
    Err(_) => {
      tracing::warn!("connection to device {} timed out", device);
      return;
    }
  };

  let (mut client_read, mut client_write) = client.split();
  let (mut device_read, mut device_write) = device_stream.split();
  tokio::select! {
    _ = tokio::io::copy(&mut client_read, &mut device_write) => {},
    _ = tokio::io::copy(&mut device_read, &mut client_write) => {},
  }
  tracing::info!("connection closed");
}

fn is_transient(e: &io::Error) -> bool {
  matches!(
    e.kind(),
    io::ErrorKind::ConnectionAborted
      | io::ErrorKind::ConnectionReset
      | io::ErrorKind::Interrupted
      | io::ErrorKind::WouldBlock
  )
}

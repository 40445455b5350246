//! Process bootstrap: argument parsing, logging, component wiring

use castmask::{
  CertificateAuthority, CertificateIssuer, Config, InterceptRelay, PlainRelay, Reflector,
  RelayMode, Result,
};
use clap::{Parser, ValueEnum};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
  /// Terminate inbound TLS and log decrypted traffic
  Intercept,
  /// Pipe bytes without inspection
  Plain,
}

/// Masquerade as a device on the local network: rewrite its mDNS presence
/// and relay its sessions through this host.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
  /// IPv4 address of the client-facing interface
  #[arg(long)]
  client_if: Ipv4Addr,

  /// IPv4 address of the device-facing interface
  #[arg(long)]
  device_if: Ipv4Addr,

  /// IPv4 address of the real device being masqueraded
  #[arg(long)]
  device: Ipv4Addr,

  /// Externally reachable IPv4 address of this proxy
  #[arg(long)]
  proxy: Ipv4Addr,

  /// TCP port relayed to the device
  #[arg(long, default_value_t = 8009)]
  port: u16,

  /// Relay variant to run
  #[arg(long, value_enum, default_value_t = Mode::Intercept)]
  mode: Mode,

  /// Path of the CA certificate (created when absent)
  #[arg(long, default_value = "ca.crt")]
  ca_cert: PathBuf,

  /// Path of the CA private key (created when absent)
  #[arg(long, default_value = "ca.key")]
  ca_key: PathBuf,

  /// Skip certificate validation when dialing the device
  #[arg(long)]
  insecure: bool,
}

#[tokio::main]
async fn main() {
  let args = Args::parse();

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  if let Err(e) = run(args).await {
    tracing::error!("fatal: {}", e);
    std::process::exit(1);
  }
}

async fn run(args: Args) -> Result<()> {
  let mode = match args.mode {
    Mode::Intercept => RelayMode::Intercept,
    Mode::Plain => RelayMode::Plain,
  };
  let config = Config::new(
    args.client_if,
    args.device_if,
    args.device,
    args.proxy,
    args.port,
    mode,
    args.ca_cert,
    args.ca_key,
    args.insecure,
  )?;

  let identities = Arc::new(config.identities.clone());
  tracing::info!(
    "masquerading {} ({}) as {} ({})",
    identities.device.address,
    identities.device.reverse_name,
    identities.proxy.address,
    identities.proxy.reverse_name
  );

  let client_reflector = Reflector::bind(&config.client_segment)?;
  let device_reflector = Reflector::bind(&config.device_segment)?;
  tokio::spawn(client_reflector.run(identities.clone()));
  tokio::spawn(device_reflector.run(identities.clone()));

  let listen = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.relay_port));
  let device = SocketAddr::from((identities.device.address, config.relay_port));
  match config.mode {
    RelayMode::Intercept => {
      let ca = CertificateAuthority::load_or_create(&config.ca_cert_path, &config.ca_key_path)
        .await?;
      let issuer = Arc::new(CertificateIssuer::new(ca));
      let relay = InterceptRelay::bind(listen, device, issuer, config.insecure_upstream).await?;
      relay.run().await
    }
    RelayMode::Plain => {
      let relay = PlainRelay::bind(listen, device).await?;
      relay.run().await
    }
  }
}

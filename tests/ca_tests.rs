//! Integration tests for the CA manager and leaf issuer

use castmask::{CertificateAuthority, CertificateIssuer};
use std::path::PathBuf;
use std::sync::Arc;

fn temp_paths(tag: &str) -> (PathBuf, PathBuf) {
  let dir = std::env::temp_dir().join(format!("castmask-test-{}", tag));
  if dir.exists() {
    std::fs::remove_dir_all(&dir).ok();
  }
  std::fs::create_dir_all(&dir).unwrap();
  (dir.join("ca.crt"), dir.join("ca.key"))
}

fn cleanup(cert_path: &PathBuf) {
  if let Some(dir) = cert_path.parent() {
    std::fs::remove_dir_all(dir).ok();
  }
}

#[tokio::test]
async fn ca_generation_persists_material() {
  let (cert_path, key_path) = temp_paths("generate");

  let ca = CertificateAuthority::load_or_create(&cert_path, &key_path).await;
  assert!(ca.is_ok(), "failed to create CA");

  assert!(cert_path.exists(), "CA certificate file not created");
  assert!(key_path.exists(), "CA key file not created");

  let cert_pem = std::fs::read_to_string(&cert_path).unwrap();
  assert!(cert_pem.contains("BEGIN CERTIFICATE"), "invalid PEM format");

  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600, "CA key must not be world readable");
  }

  cleanup(&cert_path);
}

#[tokio::test]
async fn ca_reload_reuses_root() {
  let (cert_path, key_path) = temp_paths("reload");

  let first = CertificateAuthority::load_or_create(&cert_path, &key_path)
    .await
    .unwrap();
  let root_before = first.root_certificate();
  drop(first);

  let second = CertificateAuthority::load_or_create(&cert_path, &key_path)
    .await
    .unwrap();
  assert_eq!(
    second.root_certificate(),
    root_before,
    "reload must return the persisted root, not a fresh one"
  );

  cleanup(&cert_path);
}

#[tokio::test]
async fn unparsable_ca_material_is_fatal() {
  let (cert_path, key_path) = temp_paths("corrupt");
  std::fs::write(&cert_path, "not a certificate").unwrap();
  std::fs::write(&key_path, "not a key").unwrap();

  let result = CertificateAuthority::load_or_create(&cert_path, &key_path).await;
  assert!(
    result.is_err(),
    "a present but unparsable CA must refuse to load"
  );

  cleanup(&cert_path);
}

#[tokio::test]
async fn same_identity_returns_identical_certificate() {
  let (cert_path, key_path) = temp_paths("cache-hit");
  let ca = CertificateAuthority::load_or_create(&cert_path, &key_path)
    .await
    .unwrap();
  let issuer = CertificateIssuer::new(ca);

  let first = issuer.get_or_issue("printer.local").unwrap();
  let second = issuer.get_or_issue("printer.local").unwrap();
  assert!(
    Arc::ptr_eq(&first, &second),
    "second request must be served from the cache"
  );
  assert_eq!(first.cert, second.cert, "certificate bytes must be identical");

  cleanup(&cert_path);
}

#[tokio::test]
async fn distinct_identities_do_not_collide() {
  let (cert_path, key_path) = temp_paths("cache-miss");
  let ca = CertificateAuthority::load_or_create(&cert_path, &key_path)
    .await
    .unwrap();
  let issuer = CertificateIssuer::new(ca);

  let printer = issuer.get_or_issue("printer.local").unwrap();
  let camera = issuer.get_or_issue("camera.local").unwrap();
  assert_ne!(
    printer.cert[0], camera.cert[0],
    "different identities must get different leaves"
  );
  // Both chains end in the same root.
  assert_eq!(printer.cert[1], camera.cert[1]);

  cleanup(&cert_path);
}

#[tokio::test]
async fn ip_identities_are_issuable() {
  let (cert_path, key_path) = temp_paths("ip-san");
  let ca = CertificateAuthority::load_or_create(&cert_path, &key_path)
    .await
    .unwrap();
  let issuer = CertificateIssuer::new(ca);

  let leaf = issuer.get_or_issue("192.168.2.172");
  assert!(leaf.is_ok(), "IP literal identities must be issuable");

  cleanup(&cert_path);
}

#[tokio::test]
async fn concurrent_issuance_converges() {
  let (cert_path, key_path) = temp_paths("concurrent");
  let ca = CertificateAuthority::load_or_create(&cert_path, &key_path)
    .await
    .unwrap();
  let issuer = Arc::new(CertificateIssuer::new(ca));

  let mut handles = Vec::new();
  for _ in 0..8 {
    let issuer = issuer.clone();
    handles.push(std::thread::spawn(move || {
      issuer.get_or_issue("printer.local").unwrap()
    }));
  }
  let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
  for certified in &results {
    assert_eq!(
      certified.cert, results[0].cert,
      "racing callers must converge on one servable certificate"
    );
  }

  cleanup(&cert_path);
}

//! Local certificate authority for TLS interception.
//!
//! The CA key pair lives under the configured certificate directory
//! (`<cwd>/certs/` by default) and is generated on first use; clients must
//! install `ca.pem` into their trust store for MITM capture to work. Leaf
//! certificates are issued per intercepted host and memoized for the
//! process lifetime.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

use crate::error::{Error, Result};

/// Leaf certificate validity, seconds (one year).
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Backdate `not_before` to tolerate client clock skew.
const NOT_BEFORE_SKEW_SECS: i64 = 60;
/// How many per-host server configs to keep memoized.
const LEAF_CACHE_SIZE: u64 = 1000;

const CA_CERT_FILE: &str = "ca.pem";
const CA_KEY_FILE: &str = "ca.key.pem";

/// Process-lifetime certificate authority with a memoized leaf cache.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_pem: String,
  ca_cert_der: CertificateDer<'static>,
  dir: PathBuf,
  leaf_cache: Cache<String, Arc<ServerConfig>>,
}

impl CertificateAuthority {
  /// Load the CA from `dir`, generating and persisting a fresh one when
  /// no material exists yet.
  pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
    let dir = dir.as_ref().to_path_buf();
    if !dir.exists() {
      fs::create_dir_all(&dir).await?;
    }
    let cert_path = dir.join(CA_CERT_FILE);
    let key_path = dir.join(CA_KEY_FILE);

    let (issuer, ca_cert_pem, ca_cert_der) = if cert_path.exists() && key_path.exists() {
      Self::load(&cert_path, &key_path).await?
    } else {
      Self::generate(&cert_path, &key_path).await?
    };

    Ok(Self {
      issuer,
      ca_cert_pem,
      ca_cert_der,
      dir,
      leaf_cache: Cache::builder().max_capacity(LEAF_CACHE_SIZE).build(),
    })
  }

  async fn load(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, String, CertificateDer<'static>)> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate(format!("failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to load CA cert: {}", e)))?;

    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate("no certificate in CA PEM"))?
      .map_err(|e| Error::certificate(format!("failed to parse CA PEM: {}", e)))?;

    Ok((issuer, cert_pem, cert_der))
  }

  async fn generate(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, String, CertificateDer<'static>)> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Seine Capture Proxy CA");
    dn.push(DnType::OrganizationName, "seine");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate CA key: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate(format!("failed to self-sign CA: {}", e)))?;

    let cert_pem = cert.pem();
    fs::write(cert_path, cert_pem.as_bytes()).await?;
    fs::write(key_path, key_pair.serialize_pem().as_bytes()).await?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to build issuer: {}", e)))?;

    Ok((issuer, cert_pem, cert_der))
  }

  /// The CA certificate in PEM form, for client trust-store installation.
  pub fn ca_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Path of the persisted CA certificate.
  pub fn ca_path(&self) -> PathBuf {
    self.dir.join(CA_CERT_FILE)
  }

  /// A rustls server config presenting a leaf certificate for `host`,
  /// memoized per host. IP literals always get a freshly issued leaf so
  /// the iPAddress SAN is guaranteed present.
  pub async fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
    if host.parse::<IpAddr>().is_err() {
      if let Some(cached) = self.leaf_cache.get(host).await {
        return Ok(cached);
      }
    }
    let config = Arc::new(self.issue_leaf_config(host)?);
    self
      .leaf_cache
      .insert(host.to_string(), config.clone())
      .await;
    Ok(config)
  }

  fn issue_leaf_config(&self, host: &str) -> Result<ServerConfig> {
    let (chain, key) = self.issue_leaf(host)?;
    ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(chain, key)
      .map_err(|e| Error::tls(format!("failed to build server config for {}: {}", host, e)))
  }

  /// Issue a leaf certificate chain (`[leaf, ca]`) and key for one host.
  pub fn issue_leaf(
    &self,
    host: &str,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    // IP targets carry both SAN forms; strict clients check iPAddress,
    // lenient ones may match dNSName against the textual address.
    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = host.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate(format!("invalid hostname: {}", host))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_SKEW_SECS);
    params.not_after = now + Duration::seconds(LEAF_TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate leaf key: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate(format!("failed to sign leaf for {}: {}", host, e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate("failed to serialize leaf key"))?;

    Ok((vec![cert_der, self.ca_cert_der.clone()], key_der))
  }
}

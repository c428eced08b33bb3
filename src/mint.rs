//! On-demand leaf certificates, one per intercepted hostname
//!
//! Minting an RSA leaf costs a key generation, so bundles are cached for the
//! process lifetime and shared by reference. The cache is double-checked:
//! readers take the shared lock, a miss upgrades to the exclusive lock and
//! re-checks before minting, so a thundering herd on a cold hostname mints
//! exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use rcgen::{
  CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
  KeyUsagePurpose, RsaKeySize, SanType, SerialNumber,
};
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::ca::CaMaterial;
use crate::error::{Error, Result};

/// Clock skew tolerance: leaves are valid from one hour in the past.
const NOT_BEFORE_SKEW: Duration = Duration::hours(1);

/// A minted leaf: DER certificate plus its freshly generated RSA key,
/// ready to back a TLS server session. Immutable once published.
#[derive(Debug)]
pub struct LeafBundle {
  hostname: String,
  cert_der: CertificateDer<'static>,
  key_der: PrivateKeyDer<'static>,
}

impl LeafBundle {
  /// Lowercased hostname this leaf was minted for.
  pub fn hostname(&self) -> &str {
    &self.hostname
  }

  /// Leaf certificate in DER form.
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }

  pub(crate) fn key_der(&self) -> PrivateKeyDer<'static> {
    self.key_der.clone_key()
  }
}

/// Mints and caches per-hostname leaf certificates signed by the root CA.
#[derive(Debug)]
pub struct CertificateMint {
  ca: CaMaterial,
  organization: String,
  validity: Duration,
  cache: RwLock<HashMap<String, Arc<LeafBundle>>>,
}

impl CertificateMint {
  pub fn new(ca: CaMaterial, organization: impl Into<String>, validity: Duration) -> Self {
    Self {
      ca,
      organization: organization.into(),
      validity,
      cache: RwLock::new(HashMap::new()),
    }
  }

  /// The root CA this mint signs with.
  pub fn ca(&self) -> &CaMaterial {
    &self.ca
  }

  /// Return the cached bundle for `hostname`, minting it on first use.
  ///
  /// Every caller for the same hostname receives the same `Arc`; entries are
  /// never evicted. A failed mint is not cached, so the next request for the
  /// hostname retries from scratch.
  pub async fn get_or_create(&self, hostname: &str) -> Result<Arc<LeafBundle>> {
    let key = hostname.to_ascii_lowercase();

    if let Some(bundle) = self.cache.read().await.get(&key) {
      return Ok(Arc::clone(bundle));
    }

    let mut cache = self.cache.write().await;
    if let Some(bundle) = cache.get(&key) {
      return Ok(Arc::clone(bundle));
    }
    let bundle = Arc::new(self.mint(&key)?);
    cache.insert(key, Arc::clone(&bundle));
    Ok(bundle)
  }

  fn mint(&self, hostname: &str) -> Result<LeafBundle> {
    let key_pair = KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, RsaKeySize::_2048)
      .map_err(|e| {
        Error::certificate_error(format!("RSA key generation for {hostname} failed: {e}"))
      })?;

    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    dn.push(DnType::OrganizationName, self.organization.as_str());
    params.distinguished_name = dn;
    params.subject_alt_names = vec![SanType::DnsName(hostname.try_into().map_err(|_| {
      Error::certificate_error(format!("hostname {hostname} is not a valid DNS SAN"))
    })?)];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - NOT_BEFORE_SKEW;
    params.not_after = now + self.validity;
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.is_ca = IsCa::ExplicitNoCa;

    let cert = params.signed_by(&key_pair, self.ca.issuer()).map_err(|e| {
      Error::certificate_error(format!("signing leaf certificate for {hostname} failed: {e}"))
    })?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der()).map_err(|_| {
      Error::certificate_error(format!("serializing leaf key for {hostname} failed"))
    })?;

    tracing::debug!(hostname, "minted leaf certificate");
    Ok(LeafBundle {
      hostname: hostname.to_owned(),
      cert_der,
      key_der,
    })
  }
}

/// Random serial in `[0, 2^62)`.
fn random_serial() -> SerialNumber {
  SerialNumber::from(rand::thread_rng().gen_range(0..(1u64 << 62)))
}

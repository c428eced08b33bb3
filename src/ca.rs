//! Root CA material for the certificate mint
//!
//! The root certificate and its RSA key are provided by the operator as a
//! pair of PEM files and loaded exactly once at startup. After loading they
//! are immutable for the process lifetime.

use std::fs;
use std::path::Path;

use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, RsaKeySize,
};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls_pemfile::Item;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use x509_parser::parse_x509_certificate;

use crate::error::{Error, Result};

/// Root CA material held for the process lifetime.
///
/// The public half is kept both as DER (for trust-store export and tests)
/// and as the original PEM text; the private half lives inside the
/// signing [`Issuer`].
#[derive(Debug)]
pub struct CaMaterial {
  issuer: Issuer<'static, KeyPair>,
  cert_der: CertificateDer<'static>,
  cert_pem: String,
}

impl CaMaterial {
  /// Load the root certificate and RSA private key from PEM files.
  ///
  /// Each file must hold exactly one PEM block: a `CERTIFICATE` for the
  /// cert and a PKCS#1 `RSA PRIVATE KEY` for the key. The key must match
  /// the certificate's public key; any violation fails startup.
  pub fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();

    let cert_bytes = read_non_empty(cert_path)?;
    let key_bytes = read_non_empty(key_path)?;

    let cert_der = match single_pem_block(cert_path, &cert_bytes)? {
      Item::X509Certificate(der) => der,
      other => {
        return Err(Error::ca_error(format!(
          "{}: expected a CERTIFICATE block, found {}",
          cert_path.display(),
          item_label(&other)
        )))
      }
    };
    let key_pkcs1 = match single_pem_block(key_path, &key_bytes)? {
      Item::Pkcs1Key(der) => der,
      other => {
        return Err(Error::ca_error(format!(
          "{}: expected an RSA PRIVATE KEY block, found {}",
          key_path.display(),
          item_label(&other)
        )))
      }
    };

    let (_, cert) = parse_x509_certificate(cert_der.as_ref()).map_err(|e| {
      Error::ca_error(format!("{}: invalid X.509 certificate: {e}", cert_path.display()))
    })?;

    // rcgen only consumes PKCS#8, so the PKCS#1 document is re-wrapped first.
    let rsa_key = RsaPrivateKey::from_pkcs1_der(key_pkcs1.secret_pkcs1_der()).map_err(|e| {
      Error::ca_error(format!("{}: invalid PKCS#1 RSA key: {e}", key_path.display()))
    })?;
    let pkcs8 = rsa_key.to_pkcs8_der().map_err(|e| {
      Error::ca_error(format!("{}: cannot re-encode RSA key: {e}", key_path.display()))
    })?;
    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec());
    let pkcs8_der: rustls_pki_types::PrivateKeyDer<'_> = pkcs8_der.into();
    let key_pair =
      KeyPair::from_der_and_sign_algo(&pkcs8_der, &rcgen::PKCS_RSA_SHA256).map_err(|e| {
        Error::ca_error(format!("{}: unusable RSA signing key: {e}", key_path.display()))
      })?;

    let cert_public = cert.tbs_certificate.subject_pki.subject_public_key.data.as_ref();
    if cert_public != key_pair.public_key_raw() {
      return Err(Error::ca_error(format!(
        "{} and {} do not match: certificate public key differs from the private key",
        cert_path.display(),
        key_path.display()
      )));
    }

    let cert_pem = String::from_utf8(cert_bytes).map_err(|_| {
      Error::ca_error(format!("{}: certificate PEM is not valid UTF-8", cert_path.display()))
    })?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair).map_err(|e| {
      Error::ca_error(format!("{}: cannot build issuer from CA material: {e}", cert_path.display()))
    })?;

    Ok(Self {
      issuer,
      cert_der,
      cert_pem,
    })
  }

  pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
    &self.issuer
  }

  /// Root certificate in DER form.
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }

  /// Root certificate PEM as read from disk, for trust-store installation.
  pub fn cert_pem(&self) -> &str {
    &self.cert_pem
  }
}

/// Freshly generated root CA material in the on-disk format the loader
/// expects: a `CERTIFICATE` block and a PKCS#1 `RSA PRIVATE KEY` block.
pub struct GeneratedCa {
  /// Self-signed root certificate PEM.
  pub cert_pem: String,
  /// PKCS#1 RSA private key PEM.
  pub key_pem: String,
}

/// Generate a self-signed RSA root CA.
///
/// Production deployments create the CA pair with an external operator tool;
/// this covers tests and ad-hoc setups.
pub fn generate_ca(organization: &str) -> Result<GeneratedCa> {
  let key_pair = KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, RsaKeySize::_2048)
    .map_err(|e| Error::ca_error(format!("root RSA key generation failed: {e}")))?;

  let mut params = CertificateParams::default();
  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, format!("{organization} Root CA"));
  dn.push(DnType::OrganizationName, organization);
  params.distinguished_name = dn;
  params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
  params.key_usages = vec![
    KeyUsagePurpose::DigitalSignature,
    KeyUsagePurpose::KeyCertSign,
    KeyUsagePurpose::CrlSign,
  ];
  let now = OffsetDateTime::now_utc();
  params.not_before = now - Duration::hours(1);
  params.not_after = now + Duration::days(3650);

  let cert = params
    .self_signed(&key_pair)
    .map_err(|e| Error::ca_error(format!("self-signing root certificate failed: {e}")))?;

  let rsa_key = RsaPrivateKey::from_pkcs8_der(&key_pair.serialize_der())
    .map_err(|e| Error::ca_error(format!("cannot decode generated root key: {e}")))?;
  let key_pem = rsa_key
    .to_pkcs1_pem(LineEnding::LF)
    .map_err(|e| Error::ca_error(format!("cannot encode root key as PKCS#1: {e}")))?;

  Ok(GeneratedCa {
    cert_pem: cert.pem(),
    key_pem: key_pem.to_string(),
  })
}

fn read_non_empty(path: &Path) -> Result<Vec<u8>> {
  let bytes = fs::read(path)
    .map_err(|e| Error::ca_error(format!("cannot read {}: {e}", path.display())))?;
  if bytes.is_empty() {
    return Err(Error::ca_error(format!("{} is empty", path.display())));
  }
  Ok(bytes)
}

/// Decode exactly one PEM block; anything but trailing whitespace after the
/// end marker is rejected.
fn single_pem_block(path: &Path, bytes: &[u8]) -> Result<Item> {
  let (item, rest) = rustls_pemfile::read_one_from_slice(bytes)
    .map_err(|e| Error::ca_error(format!("{}: malformed PEM: {e:?}", path.display())))?
    .ok_or_else(|| Error::ca_error(format!("{}: no PEM block found", path.display())))?;
  if rest.iter().any(|b| !b.is_ascii_whitespace()) {
    return Err(Error::ca_error(format!(
      "{}: trailing data after the PEM block",
      path.display()
    )));
  }
  Ok(item)
}

fn item_label(item: &Item) -> &'static str {
  match item {
    Item::X509Certificate(_) => "CERTIFICATE",
    Item::Pkcs1Key(_) => "RSA PRIVATE KEY",
    Item::Pkcs8Key(_) => "PRIVATE KEY",
    Item::Sec1Key(_) => "EC PRIVATE KEY",
    Item::Crl(_) => "X509 CRL",
    Item::Csr(_) => "CERTIFICATE REQUEST",
    _ => "unsupported PEM block",
  }
}

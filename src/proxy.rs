//! Proxy configuration, shared context, and the top-level façade

use std::path::PathBuf;
use std::sync::Arc;

use time::Duration;
use tokio_rustls::rustls::ClientConfig;

use crate::ca::CaMaterial;
use crate::error::Result;
use crate::mint::CertificateMint;
use crate::server::ProxyServer;
use crate::tls;

/// Configuration for the MITM proxy
#[derive(Clone, Debug)]
pub struct ProxyConfig {
  /// Path to the root CA certificate PEM
  pub ca_cert_path: PathBuf,
  /// Path to the root CA private key PEM (PKCS#1)
  pub ca_key_path: PathBuf,
  /// How long minted leaves stay valid
  pub leaf_validity: Duration,
  /// Organization name placed on minted leaves
  pub organization: String,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      ca_cert_path: PathBuf::from("ca.crt"),
      ca_key_path: PathBuf::from("ca.key"),
      leaf_validity: Duration::days(30),
      organization: "MITM Security Proxy".to_owned(),
    }
  }
}

/// Everything a connection handler needs, constructed once at startup and
/// shared read-only. Threading this explicitly makes the initialization
/// order a compile-time property.
#[derive(Debug)]
pub struct ProxyContext {
  mint: CertificateMint,
  upstream_tls: Arc<ClientConfig>,
}

impl ProxyContext {
  pub fn new(ca: CaMaterial, config: &ProxyConfig) -> Self {
    Self {
      mint: CertificateMint::new(ca, config.organization.clone(), config.leaf_validity),
      upstream_tls: Arc::new(tls::insecure_client_config()),
    }
  }

  pub fn mint(&self) -> &CertificateMint {
    &self.mint
  }

  pub(crate) fn upstream_tls(&self) -> Arc<ClientConfig> {
    Arc::clone(&self.upstream_tls)
  }
}

/// MITM proxy main struct
#[derive(Debug)]
pub struct MitmProxy {
  ctx: Arc<ProxyContext>,
}

impl MitmProxy {
  /// Load the CA material and build the shared context.
  pub fn new(config: ProxyConfig) -> Result<Self> {
    let ca = CaMaterial::load(&config.ca_cert_path, &config.ca_key_path)?;
    Ok(Self {
      ctx: Arc::new(ProxyContext::new(ca, &config)),
    })
  }

  pub fn context(&self) -> Arc<ProxyContext> {
    Arc::clone(&self.ctx)
  }

  /// Root CA certificate PEM, for installing into client trust stores.
  pub fn ca_cert_pem(&self) -> &str {
    self.ctx.mint().ca().cert_pem()
  }

  /// Bind `addr` and serve until the process exits.
  pub async fn start(&self, addr: &str) -> Result<()> {
    ProxyServer::bind(addr, self.context()).await?.run().await
  }
}

//! TLS-intercepting HTTP(S) proxy
//!
//! `tapwire` is a man-in-the-middle proxy: clients point their HTTP proxy
//! setting at it, plain requests are forwarded to the origin, and CONNECT
//! tunnels are transparently decrypted by presenting a per-hostname leaf
//! certificate signed by an operator-provided root CA.
//!
//! # Features
//!
//! - Root CA material loaded once from PEM files and validated at startup
//! - Per-hostname RSA leaf certificates, minted on demand and cached for
//!   the process lifetime
//! - Full-duplex relay of the decrypted streams, protocol-agnostic
//! - Upstream certificate verification deliberately disabled
//!
//! # Example
//!
//! ```no_run
//! use tapwire::{MitmProxy, ProxyConfig};
//!
//! #[tokio::main]
//! async fn main() -> tapwire::Result<()> {
//!   let proxy = MitmProxy::new(ProxyConfig::default())?;
//!   proxy.start("0.0.0.0:8080").await
//! }
//! ```

mod ca;
mod error;
mod mint;
mod proxy;
mod request;
mod server;
mod tls;
mod tunnel;

pub use ca::{generate_ca, CaMaterial, GeneratedCa};
pub use error::{Error, Result};
pub use mint::{CertificateMint, LeafBundle};
pub use proxy::{MitmProxy, ProxyConfig, ProxyContext};
pub use request::{HeaderList, PlainTarget, RequestLine};
pub use server::ProxyServer;

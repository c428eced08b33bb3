//! CLI entry point: `tapwire [port]`
//!
//! Reads the root CA pair from `ca.crt` / `ca.key` in the working directory
//! and listens on all interfaces. Startup failures go to stderr with a
//! non-zero exit; per-connection failures only end that connection.

use tapwire::{MitmProxy, ProxyConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let port = std::env::args().nth(1).unwrap_or_else(|| "8080".to_owned());

  if let Err(err) = run(&port).await {
    eprintln!("fatal: {err}");
    std::process::exit(1);
  }
}

async fn run(port: &str) -> tapwire::Result<()> {
  let proxy = MitmProxy::new(ProxyConfig::default())?;
  tracing::info!(port, "starting MITM proxy");
  proxy.start(&format!("0.0.0.0:{port}")).await
}

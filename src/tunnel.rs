//! CONNECT interception: TLS toward the client under a minted leaf, TLS
//! toward the real origin, then a byte-level duplex relay of the decrypted
//! streams. Nothing inside the tunnel is parsed, so any protocol carried
//! over TLS passes through.

use std::sync::Arc;

use tokio::io::{self, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Error, Result};
use crate::proxy::ProxyContext;
use crate::request::split_connect_target;
use crate::server::dial_origin;
use crate::tls;

const ESTABLISHED: &[u8] = b"HTTP/1.0 200 Connection established\r\n\r\n";

/// Run a CONNECT tunnel over `client`.
///
/// The 200 goes out in plaintext, then the client side is TLS-accepted with
/// a leaf minted for the target host. Only after that handshake is the
/// origin dialed, so no client bytes ever reach the origin before the
/// interception is in place.
pub(crate) async fn bridge(mut client: TcpStream, target: &str, ctx: &ProxyContext) -> Result<()> {
  let (host, port) = split_connect_target(target)?;

  client.write_all(ESTABLISHED).await?;
  client.flush().await?;

  let bundle = ctx.mint().get_or_create(&host).await?;
  let acceptor = TlsAcceptor::from(Arc::new(tls::server_config(&bundle)?));
  let client_tls = acceptor
    .accept(client)
    .await
    .map_err(|e| Error::tls_error(format!("TLS handshake with client for {host} failed: {e}")))?;

  let origin_tcp = dial_origin(&host, port).await?;
  let server_name = ServerName::try_from(host.clone())
    .map_err(|_| Error::tls_error(format!("invalid TLS server name: {host}")))?;
  let connector = TlsConnector::from(ctx.upstream_tls());
  let origin_tls = connector
    .connect(server_name, origin_tcp)
    .await
    .map_err(|e| Error::tls_error(format!("TLS handshake with {host}:{port} failed: {e}")))?;

  tracing::debug!(host, port, "tunnel established");

  let (mut client_read, mut client_write) = io::split(client_tls);
  let (mut origin_read, mut origin_write) = io::split(origin_tls);

  let client_to_origin = io::copy(&mut client_read, &mut origin_write);
  let origin_to_client = io::copy(&mut origin_read, &mut client_write);

  // Either direction finishing, cleanly or not, tears down both.
  tokio::select! {
    _ = client_to_origin => {}
    _ = origin_to_client => {}
  }

  Ok(())
}

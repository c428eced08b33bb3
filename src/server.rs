//! Accept loop, request classification, and the plain-forward engine

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::proxy::ProxyContext;
use crate::request::{HeaderList, PlainTarget, RequestLine};
use crate::tunnel;

const MAX_REQUEST_LINE: u64 = 8 * 1024;
const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_CONNECT_HEADER_BYTES: usize = 16 * 1024;
const RELAY_BUF_SIZE: usize = 8 * 1024;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// The proxy's TCP front door: accepts connections and hands each one to a
/// fresh task. A connection serves a single request or CONNECT tunnel.
pub struct ProxyServer {
  listener: TcpListener,
  ctx: Arc<ProxyContext>,
}

impl ProxyServer {
  pub async fn bind(addr: &str, ctx: Arc<ProxyContext>) -> Result<Self> {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::connection_error(format!("failed to bind {addr}: {e}")))?;
    Ok(Self { listener, ctx })
  }

  pub fn local_addr(&self) -> Result<SocketAddr> {
    self.listener.local_addr().map_err(Error::from)
  }

  /// Run the accept loop. A failed accept is logged and skipped; a failed
  /// connection only takes itself down.
  pub async fn run(self) -> Result<()> {
    tracing::info!(addr = %self.local_addr()?, "proxy listening");
    loop {
      match self.listener.accept().await {
        Ok((stream, peer_addr)) => {
          let ctx = Arc::clone(&self.ctx);
          tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, ctx).await {
              tracing::error!(peer = %peer_addr, "error handling connection: {e}");
            }
          });
        }
        Err(e) => {
          tracing::error!("failed to accept connection: {e}");
        }
      }
    }
  }
}

async fn handle_connection(stream: TcpStream, ctx: Arc<ProxyContext>) -> Result<()> {
  let mut reader = BufReader::new(stream);
  let line = read_request_line(&mut reader).await?;
  let request = RequestLine::parse(&line)?;

  if request.is_connect() {
    drain_connect_headers(&mut reader).await?;
    tunnel::bridge(reader.into_inner(), &request.target, &ctx).await
  } else {
    forward_plain(reader, &request).await
  }
}

async fn read_request_line(reader: &mut BufReader<TcpStream>) -> Result<String> {
  let mut raw = Vec::new();
  let n = {
    let mut limited = (&mut *reader).take(MAX_REQUEST_LINE);
    limited.read_until(b'\n', &mut raw).await?
  };
  if n == 0 {
    return Err(Error::invalid_request("connection closed before a request line"));
  }
  if !raw.ends_with(b"\n") {
    return Err(Error::invalid_request("request line too long"));
  }
  let line = String::from_utf8_lossy(&raw).trim().to_owned();
  if line.is_empty() {
    return Err(Error::invalid_request("empty request line"));
  }
  Ok(line)
}

/// Consume the CONNECT proxy headers up to the blank line so the TLS
/// handshake that follows starts on a clean stream.
async fn drain_connect_headers(reader: &mut BufReader<TcpStream>) -> Result<()> {
  let mut drained = 0usize;
  loop {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
      break;
    }
    drained += n;
    if drained > MAX_CONNECT_HEADER_BYTES {
      return Err(Error::invalid_request("CONNECT headers exceed maximum size"));
    }
    if line == "\r\n" || line == "\n" {
      break;
    }
  }
  Ok(())
}

async fn forward_plain(mut reader: BufReader<TcpStream>, request: &RequestLine) -> Result<()> {
  let headers = read_headers(&mut reader).await?;
  let target = PlainTarget::parse(&request.target)?;

  let body = if matches!(request.method.as_str(), "GET" | "HEAD") {
    Bytes::new()
  } else {
    read_body(&mut reader).await?
  };

  let mut origin = dial_origin(&target.host, target.port).await?;

  let head = serialize_request(request, &target, &headers);
  origin.write_all(head.as_bytes()).await?;
  if !body.is_empty() {
    origin.write_all(&body).await?;
  }
  origin.flush().await?;

  let mut client = reader.into_inner();
  relay_response(&mut origin, &mut client).await
}

async fn read_headers(reader: &mut BufReader<TcpStream>) -> Result<HeaderList> {
  let mut headers = HeaderList::default();
  let mut total = 0usize;
  loop {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
      break;
    }
    total += n;
    if total > MAX_HEADER_BYTES {
      return Err(Error::invalid_request("headers exceed maximum size"));
    }
    let trimmed = line.trim();
    if trimmed.is_empty() {
      break;
    }
    headers.push_line(trimmed);
  }
  Ok(headers)
}

/// Read a request body until EOF. The read deadline is an idle deadline:
/// a client that sends nothing within it simply ends the body.
async fn read_body(reader: &mut BufReader<TcpStream>) -> Result<Bytes> {
  let mut body = BytesMut::new();
  loop {
    match timeout(READ_TIMEOUT, reader.read_buf(&mut body)).await {
      Err(_) => break,
      Ok(Ok(0)) => break,
      Ok(Ok(_)) => {}
      Ok(Err(e)) => return Err(e.into()),
    }
  }
  Ok(body.freeze())
}

fn serialize_request(request: &RequestLine, target: &PlainTarget, headers: &HeaderList) -> String {
  let mut out = String::new();
  let _ = write!(out, "{} {} {}\r\n", request.method, target.request_uri, request.version);
  for (name, value) in headers.iter() {
    let _ = write!(out, "{name}: {value}\r\n");
  }
  if !headers.contains("host") {
    let _ = write!(out, "Host: {}\r\n", target.host_header);
  }
  out.push_str("\r\n");
  out
}

pub(crate) async fn dial_origin(host: &str, port: u16) -> Result<TcpStream> {
  match timeout(DIAL_TIMEOUT, TcpStream::connect((host, port))).await {
    Ok(Ok(stream)) => Ok(stream),
    Ok(Err(e)) => Err(Error::connection_error(format!(
      "failed to connect to {host}:{port}: {e}"
    ))),
    Err(_) => Err(Error::connection_error(format!(
      "connection to {host}:{port} timed out"
    ))),
  }
}

/// Copy origin bytes back to the client until EOF, an error, or the per-read
/// deadline expiring.
async fn relay_response(origin: &mut TcpStream, client: &mut TcpStream) -> Result<()> {
  let mut buf = [0u8; RELAY_BUF_SIZE];
  loop {
    match timeout(READ_TIMEOUT, origin.read(&mut buf)).await {
      Err(_) => {
        tracing::debug!("origin went quiet, ending relay");
        return Ok(());
      }
      Ok(Ok(0)) => return Ok(()),
      Ok(Ok(n)) => client.write_all(&buf[..n]).await?,
      Ok(Err(e)) => return Err(e.into()),
    }
  }
}

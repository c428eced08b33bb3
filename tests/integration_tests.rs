//! End-to-end tests for tapwire

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use tapwire::{generate_ca, MitmProxy, ProxyConfig, ProxyServer};

const ESTABLISHED: &str = "HTTP/1.0 200 Connection established\r\n\r\n";

struct TestProxy {
  addr: SocketAddr,
  ca_cert_der: CertificateDer<'static>,
  _dir: tempfile::TempDir,
}

async fn spawn_proxy() -> TestProxy {
  let dir = tempfile::tempdir().expect("tempdir");
  let ca = generate_ca("MITM Security Proxy").expect("generate test CA");
  let cert_path = dir.path().join("ca.crt");
  let key_path = dir.path().join("ca.key");
  std::fs::write(&cert_path, &ca.cert_pem).expect("write ca.crt");
  std::fs::write(&key_path, &ca.key_pem).expect("write ca.key");

  let config = ProxyConfig {
    ca_cert_path: cert_path,
    ca_key_path: key_path,
    ..Default::default()
  };
  let proxy = MitmProxy::new(config).expect("proxy startup");
  let server = ProxyServer::bind("127.0.0.1:0", proxy.context())
    .await
    .expect("bind proxy");
  let addr = server.local_addr().expect("local addr");
  tokio::spawn(server.run());

  let ca_cert_der = rustls_pemfile::certs(&mut ca.cert_pem.as_bytes())
    .next()
    .expect("one cert in CA PEM")
    .expect("valid CA PEM");

  TestProxy {
    addr,
    ca_cert_der,
    _dir: dir,
  }
}

/// Plain-TCP origin that captures the request head and answers with a fixed
/// response, closing afterwards.
async fn spawn_plain_origin(response: &'static [u8]) -> (SocketAddr, JoinHandle<String>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
  let addr = listener.local_addr().expect("origin addr");
  let handle = tokio::spawn(async move {
    let (mut sock, _) = listener.accept().await.expect("origin accept");
    let head = read_until_blank_line(&mut sock).await;
    sock.write_all(response).await.expect("origin write");
    sock.shutdown().await.expect("origin shutdown");
    head
  });
  (addr, handle)
}

async fn read_until_blank_line<S: AsyncReadExt + Unpin>(sock: &mut S) -> String {
  let mut buf = Vec::new();
  let mut tmp = [0u8; 1024];
  loop {
    let n = sock.read(&mut tmp).await.expect("origin read");
    assert!(n > 0, "peer closed before end of headers");
    buf.extend_from_slice(&tmp[..n]);
    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
      break;
    }
  }
  String::from_utf8(buf).expect("request head is UTF-8")
}

/// Read to end of stream, tolerating a missing TLS close_notify.
async fn read_to_close<S: AsyncReadExt + Unpin>(stream: &mut S) -> Vec<u8> {
  let mut out = Vec::new();
  let mut tmp = [0u8; 1024];
  loop {
    match stream.read(&mut tmp).await {
      Ok(0) => break,
      Ok(n) => out.extend_from_slice(&tmp[..n]),
      Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
      Err(e) => panic!("read failed: {e}"),
    }
  }
  out
}

fn trusting_client_config(ca_cert_der: &CertificateDer<'static>) -> Arc<ClientConfig> {
  let mut roots = RootCertStore::empty();
  roots.add(ca_cert_der.clone()).expect("add test root");
  Arc::new(
    ClientConfig::builder()
      .with_root_certificates(roots)
      .with_no_client_auth(),
  )
}

/// Open a CONNECT tunnel through the proxy and complete a TLS handshake
/// against the minted leaf, returning the leaf DER the proxy presented.
async fn connect_and_capture_leaf(
  addr: SocketAddr,
  ca_cert_der: &CertificateDer<'static>,
  target: &str,
  sni: &str,
) -> Vec<u8> {
  let mut client = TcpStream::connect(addr).await.expect("connect proxy");
  let connect = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
  client.write_all(connect.as_bytes()).await.expect("send CONNECT");

  let mut established = vec![0u8; ESTABLISHED.len()];
  client.read_exact(&mut established).await.expect("read 200");
  assert_eq!(established, ESTABLISHED.as_bytes());

  let connector = TlsConnector::from(trusting_client_config(ca_cert_der));
  let server_name = ServerName::try_from(sni.to_owned()).expect("server name");
  let tls = connector
    .connect(server_name, client)
    .await
    .expect("handshake against minted leaf");
  let (_, conn) = tls.get_ref();
  conn
    .peer_certificates()
    .expect("peer certificates")
    .first()
    .expect("leaf certificate")
    .as_ref()
    .to_vec()
}

#[tokio::test]
async fn plain_get_is_rewritten_and_relayed() {
  let proxy = spawn_proxy().await;
  let (origin_addr, origin_task) =
    spawn_plain_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;

  let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
  let request = format!(
    "GET http://{origin_addr}/hello?x=1 HTTP/1.1\r\n\
     Host: {origin_addr}\r\n\
     Accept: */*\r\n\
     Proxy-Connection: keep-alive\r\n\r\n"
  );
  client.write_all(request.as_bytes()).await.expect("send request");

  let response = read_to_close(&mut client).await;
  let response = String::from_utf8(response).expect("response is UTF-8");
  assert!(response.starts_with("HTTP/1.1 200 OK"), "response: {response}");
  assert!(response.ends_with("ok"), "response: {response}");

  let head = origin_task.await.expect("origin task");
  assert!(
    head.starts_with("GET /hello?x=1 HTTP/1.1\r\n"),
    "origin saw: {head}"
  );
  assert!(head.contains(&format!("Host: {origin_addr}")), "origin saw: {head}");
  assert!(!head.to_ascii_lowercase().contains("proxy-connection"), "origin saw: {head}");
}

#[tokio::test]
async fn plain_request_without_host_gets_one_synthesized() {
  let proxy = spawn_proxy().await;
  let (origin_addr, origin_task) = spawn_plain_origin(b"HTTP/1.1 204 No Content\r\n\r\n").await;

  let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
  let request = format!("GET http://{origin_addr}/ HTTP/1.1\r\nAccept: */*\r\n\r\n");
  client.write_all(request.as_bytes()).await.expect("send request");
  let _ = read_to_close(&mut client).await;

  let head = origin_task.await.expect("origin task");
  assert!(head.contains(&format!("Host: {origin_addr}")), "origin saw: {head}");
}

#[tokio::test]
async fn plain_post_forwards_the_body() {
  let proxy = spawn_proxy().await;
  let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
  let origin_addr = listener.local_addr().expect("origin addr");
  let origin_task = tokio::spawn(async move {
    let (mut sock, _) = listener.accept().await.expect("origin accept");
    let mut seen = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
      let n = sock.read(&mut tmp).await.expect("origin read");
      if n == 0 {
        break;
      }
      seen.extend_from_slice(&tmp[..n]);
      if seen.ends_with(b"payload=1") {
        break;
      }
    }
    sock.write_all(b"HTTP/1.1 201 Created\r\n\r\n").await.expect("origin write");
    sock.shutdown().await.expect("origin shutdown");
    String::from_utf8(seen).expect("request is UTF-8")
  });

  let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
  let request = format!(
    "POST http://{origin_addr}/submit HTTP/1.1\r\n\
     Host: {origin_addr}\r\n\
     Content-Length: 9\r\n\r\npayload=1"
  );
  client.write_all(request.as_bytes()).await.expect("send request");
  // End the body: the proxy reads it until EOF on the client's write half.
  client.shutdown().await.expect("half-close");

  let response = read_to_close(&mut client).await;
  assert!(response.starts_with(b"HTTP/1.1 201"), "unexpected response");

  let seen = origin_task.await.expect("origin task");
  assert!(seen.starts_with("POST /submit HTTP/1.1\r\n"), "origin saw: {seen}");
  assert!(seen.ends_with("payload=1"), "origin saw: {seen}");
}

#[tokio::test]
async fn connect_intercepts_and_relays_tls() {
  let proxy = spawn_proxy().await;

  // TLS origin with its own self-signed certificate; the proxy dials it
  // with verification disabled.
  let origin_key = rcgen::KeyPair::generate().expect("origin key");
  let origin_cert = rcgen::CertificateParams::new(vec!["localhost".to_owned()])
    .expect("origin params")
    .self_signed(&origin_key)
    .expect("origin cert");
  let origin_config = ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(
      vec![origin_cert.der().clone()],
      PrivateKeyDer::try_from(origin_key.serialize_der()).expect("origin key der"),
    )
    .expect("origin tls config");
  let acceptor = TlsAcceptor::from(Arc::new(origin_config));
  let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
  let origin_addr = listener.local_addr().expect("origin addr");
  let origin_task = tokio::spawn(async move {
    let (sock, _) = listener.accept().await.expect("origin accept");
    let mut tls = acceptor.accept(sock).await.expect("origin handshake");
    let head = read_until_blank_line(&mut tls).await;
    tls
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecret")
      .await
      .expect("origin write");
    tls.shutdown().await.expect("origin shutdown");
    head
  });

  let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
  let connect = format!(
    "CONNECT localhost:{port} HTTP/1.1\r\nHost: localhost:{port}\r\n\r\n",
    port = origin_addr.port()
  );
  client.write_all(connect.as_bytes()).await.expect("send CONNECT");

  let mut established = vec![0u8; ESTABLISHED.len()];
  client.read_exact(&mut established).await.expect("read 200");
  assert_eq!(established, ESTABLISHED.as_bytes());

  let connector = TlsConnector::from(trusting_client_config(&proxy.ca_cert_der));
  let server_name = ServerName::try_from("localhost").expect("server name");
  let mut tls = connector
    .connect(server_name, client)
    .await
    .expect("handshake against minted leaf");

  tls
    .write_all(b"GET /secret HTTP/1.1\r\nHost: localhost\r\n\r\n")
    .await
    .expect("send tunneled request");

  let response = read_to_close(&mut tls).await;
  let response = String::from_utf8(response).expect("response is UTF-8");
  assert!(response.starts_with("HTTP/1.1 200 OK"), "response: {response}");
  assert!(response.ends_with("secret"), "response: {response}");

  let head = origin_task.await.expect("origin task");
  assert!(head.starts_with("GET /secret HTTP/1.1\r\n"), "origin saw: {head}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_and_repeated_connects_present_the_same_leaf() {
  let proxy = spawn_proxy().await;

  // The client handshake completes before the proxy dials the origin, so an
  // unresolvable target still lets us inspect the presented leaf. All
  // tunnels race on the first use of the hostname.
  let mut tasks = Vec::new();
  for _ in 0..8 {
    let addr = proxy.addr;
    let ca = proxy.ca_cert_der.clone();
    tasks.push(tokio::spawn(async move {
      connect_and_capture_leaf(addr, &ca, "leafcheck.test:443", "leafcheck.test").await
    }));
  }
  let mut leaves = Vec::new();
  for task in tasks {
    leaves.push(task.await.expect("handshake task"));
  }
  for leaf in &leaves {
    assert_eq!(leaf, &leaves[0], "all clients must see byte-identical leaf DER");
  }

  // A later tunnel hits the cache and sees the same certificate.
  let again =
    connect_and_capture_leaf(proxy.addr, &proxy.ca_cert_der, "leafcheck.test:443", "leafcheck.test")
      .await;
  assert_eq!(again, leaves[0]);
}

#[tokio::test]
async fn connect_target_without_port_dials_443() {
  let proxy = spawn_proxy().await;

  // A port-less CONNECT target must still mint for the host and attempt
  // 443; the handshake with the client succeeds before that dial happens.
  let leaf =
    connect_and_capture_leaf(proxy.addr, &proxy.ca_cert_der, "portless.test", "portless.test").await;
  let (_, cert) = x509_parser::parse_x509_certificate(&leaf).expect("parse leaf");
  let cn: Vec<_> = cert
    .subject()
    .iter_common_name()
    .map(|attr| attr.as_str().expect("CN string"))
    .collect();
  assert_eq!(cn, vec!["portless.test"]);
}

#[test]
fn startup_without_ca_key_fails_naming_the_file() {
  let dir = tempfile::tempdir().expect("tempdir");
  let ca = generate_ca("MITM Security Proxy").expect("generate test CA");
  let cert_path = dir.path().join("ca.crt");
  std::fs::write(&cert_path, &ca.cert_pem).expect("write ca.crt");

  let config = ProxyConfig {
    ca_cert_path: cert_path,
    ca_key_path: dir.path().join("ca.key"),
    ..Default::default()
  };
  let err = MitmProxy::new(config).expect_err("startup must fail");
  assert!(err.to_string().contains("ca.key"), "error was: {err}");
}

//! Request-line and header parsing for the proxy front door

use http::Uri;

use crate::error::{Error, Result};

/// The first line of a proxied request.
#[derive(Debug, Clone)]
pub struct RequestLine {
  pub method: String,
  pub target: String,
  pub version: String,
}

impl RequestLine {
  /// Split into exactly three whitespace-separated tokens.
  pub fn parse(line: &str) -> Result<Self> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
      (Some(method), Some(target), Some(version), None) => Ok(Self {
        method: method.to_owned(),
        target: target.to_owned(),
        version: version.to_owned(),
      }),
      _ => Err(Error::invalid_request(format!("malformed request line: {line:?}"))),
    }
  }

  pub fn is_connect(&self) -> bool {
    self.method.eq_ignore_ascii_case("CONNECT")
  }
}

/// Headers in client order, casing and duplicates preserved.
/// `Proxy-Connection` is dropped on the way in; lookups ignore case.
#[derive(Debug, Default)]
pub struct HeaderList {
  entries: Vec<(String, String)>,
}

impl HeaderList {
  /// Parse one `name: value` line. Lines without a colon are ignored, as is
  /// the hop-by-hop `Proxy-Connection` header.
  pub fn push_line(&mut self, line: &str) {
    let Some((name, value)) = line.split_once(':') else {
      return;
    };
    let name = name.trim();
    let value = value.trim();
    if name.eq_ignore_ascii_case("proxy-connection") {
      return;
    }
    self.entries.push((name.to_owned(), value.to_owned()));
  }

  pub fn contains(&self, name: &str) -> bool {
    self.entries.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
    self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

/// Destination of a plain (absolute-form) proxy request.
#[derive(Debug)]
pub struct PlainTarget {
  pub host: String,
  pub port: u16,
  /// Path and query to put on the forwarded request line; `/` if empty.
  pub request_uri: String,
  /// Value for a synthesized `Host` header: `host[:port]` as written.
  pub host_header: String,
}

impl PlainTarget {
  pub fn parse(target: &str) -> Result<Self> {
    let uri: Uri = target
      .parse()
      .map_err(|e| Error::invalid_request(format!("unparseable request target {target:?}: {e}")))?;
    let host = uri
      .host()
      .ok_or_else(|| Error::invalid_request(format!("request target {target:?} has no host")))?
      .to_owned();
    let port = uri
      .port_u16()
      .unwrap_or_else(|| if uri.scheme_str() == Some("https") { 443 } else { 80 });
    let request_uri = match uri.path_and_query() {
      Some(pq) if !pq.as_str().is_empty() => pq.as_str().to_owned(),
      _ => "/".to_owned(),
    };
    let host_header = match uri.port_u16() {
      Some(explicit) => format!("{host}:{explicit}"),
      None => host.clone(),
    };
    Ok(Self {
      host,
      port,
      request_uri,
      host_header,
    })
  }
}

/// Split a CONNECT target into host and port; a bare host means 443.
pub fn split_connect_target(target: &str) -> Result<(String, u16)> {
  match target.rsplit_once(':') {
    None => Ok((target.to_owned(), 443)),
    Some((host, port)) => {
      let port = port.parse().map_err(|_| {
        Error::invalid_request(format!("invalid port in CONNECT target {target:?}"))
      })?;
      let host = host.trim_start_matches('[').trim_end_matches(']');
      Ok((host.to_owned(), port))
    }
  }
}

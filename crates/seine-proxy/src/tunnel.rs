//! Opaque CONNECT tunneling.
//!
//! No bytes are observed in tunnel mode; the single record describes the
//! tunnel itself.

use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use seine::LogRecord;

use crate::error::{Error, Result};
use crate::server::ProxyContext;
use crate::upstream::open_tcp;

pub(crate) const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Parse a `CONNECT` target (`host[:port]`, port defaulting to 443).
pub fn parse_connect_target(target: &str) -> Result<(String, u16)> {
  // bracketed IPv6 authority
  if let Some(rest) = target.strip_prefix('[') {
    let Some((host, tail)) = rest.split_once(']') else {
      return Err(Error::invalid_request(format!("bad CONNECT target: {}", target)));
    };
    let port = match tail.strip_prefix(':') {
      Some(port) => port
        .parse()
        .map_err(|_| Error::invalid_request(format!("bad CONNECT port: {}", target)))?,
      None => 443,
    };
    return Ok((host.to_string(), port));
  }
  match target.rsplit_once(':') {
    Some((host, port)) if !host.is_empty() => {
      let port = port
        .parse()
        .map_err(|_| Error::invalid_request(format!("bad CONNECT port: {}", target)))?;
      Ok((host.to_string(), port))
    }
    _ if !target.is_empty() => Ok((target.to_string(), 443)),
    _ => Err(Error::invalid_request("empty CONNECT target")),
  }
}

/// Relay a raw TCP tunnel between the client and `host:port`.
///
/// `leftover` carries client bytes that were buffered past the CONNECT
/// head; they are forwarded before the bidirectional copy starts. Exactly
/// one record is emitted: status 200 when the tunnel is established, 502
/// when the upstream connect fails.
pub async fn tunnel<S>(
  mut client: S,
  leftover: Vec<u8>,
  host: &str,
  port: u16,
  ctx: &ProxyContext,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let started = Instant::now();
  let uri: http::Uri = format!("https://{}:{}", host, port)
    .parse()
    .map_err(|_| Error::invalid_request(format!("bad CONNECT target: {}:{}", host, port)))?;
  let mut record = LogRecord::begin(&http::Method::CONNECT, &uri);

  let mut upstream = match open_tcp(host, port).await {
    Ok(stream) => stream,
    Err(err) => {
      client.write_all(BAD_GATEWAY).await.ok();
      record.status = Some(502);
      record.duration_ms = Some(started.elapsed().as_millis() as u64);
      ctx.pipeline.publish(record);
      return Err(err);
    }
  };

  client.write_all(ESTABLISHED).await?;
  client.flush().await?;
  if !leftover.is_empty() {
    upstream.write_all(&leftover).await?;
  }

  record.status = Some(200);
  record.duration_ms = Some(started.elapsed().as_millis() as u64);
  ctx.pipeline.publish(record);

  // wire each side's reads to the other's writes until either closes
  match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
    Ok(_) => Ok(()),
    Err(err) => Err(Error::client_closed(format!("tunnel ended: {}", err))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn connect_target_defaults_to_443() {
    assert_eq!(
      parse_connect_target("example.com:8443").unwrap(),
      ("example.com".to_string(), 8443)
    );
    assert_eq!(
      parse_connect_target("example.com").unwrap(),
      ("example.com".to_string(), 443)
    );
    assert_eq!(
      parse_connect_target("[::1]:443").unwrap(),
      ("::1".to_string(), 443)
    );
    assert!(parse_connect_target("").is_err());
    assert!(parse_connect_target("host:notaport").is_err());
  }
}

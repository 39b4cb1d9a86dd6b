//! HTTP CONNECT handling.
//!
//! The flow for one CONNECT request is:
//!
//! 1. Client sends: `CONNECT api.example.com:443 HTTP/1.1`
//! 2. The port must be in `ssl-ports`, otherwise `403`
//! 3. The rule engine decides DIRECT, DENY, or an upstream proxy
//! 4. DIRECT dials the destination (after localhost gating); an upstream
//!    target dials the proxy and issues its own `CONNECT`
//! 5. `200` is returned, hyper hands over the raw client stream, and bytes
//!    are relayed in both directions until both sides are done

use crate::config::AppConfig;
use crate::error::ProxyError;
use crate::proxy::{check_direct, empty_body, ProxyBody};
use crate::resolver::Resolver;
use crate::rules::{ProxyTarget, RuleEngine};
use http::Uri;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Upper bound on the upstream proxy's response header block.
const MAX_HANDSHAKE_BYTES: usize = 16 * 1024;

/// Byte stream to the destination or to a chained upstream proxy.
trait RemoteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> RemoteStream for T {}

/// Handles CONNECT requests against the rule set.
pub struct TunnelManager {
    config: Arc<AppConfig>,
    resolver: Arc<Resolver>,
    rules: Arc<RuleEngine>,
}

impl TunnelManager {
    /// Creates a tunnel manager sharing the server's config and caches.
    pub fn new(config: Arc<AppConfig>, resolver: Arc<Resolver>, rules: Arc<RuleEngine>) -> Self {
        Self {
            config,
            resolver,
            rules,
        }
    }

    /// Runs the CONNECT state machine for `host:port`.
    ///
    /// On success the returned `200` response must be written to the
    /// client; the relay starts once hyper completes the upgrade.
    pub async fn handle<B>(
        &self,
        mut req: Request<B>,
        host: &str,
        port: &str,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let port = check_port(&self.config.ssl_ports, host, port)?;

        let decision = self.rules.decide(host).await;
        let remote: Box<dyn RemoteStream> = match &decision.target {
            ProxyTarget::Deny => {
                return Err(ProxyError::PolicyDenied {
                    host: host.to_string(),
                    rule: decision.rule.clone(),
                });
            }
            ProxyTarget::Direct => {
                check_direct(&self.config, &self.resolver, host).await?;
                info!(host = %host, port = port, route = "DIRECT", rule = %decision.rule, "CONNECT");
                Box::new(dial(host, port).await?)
            }
            ProxyTarget::Upstream(proxy) => {
                info!(host = %host, port = port, route = %proxy, rule = %decision.rule, "CONNECT");
                Box::new(connect_via_upstream(proxy, host, port).await?)
            }
        };

        let on_upgrade = req
            .extensions_mut()
            .remove::<OnUpgrade>()
            .ok_or_else(|| ProxyError::TransportLimitation {
                message: "connection does not support upgrades".to_string(),
            })?;

        let label = authority(host, port);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => relay(TokioIo::new(upgraded), remote, &label).await,
                Err(e) => warn!(target_addr = %label, error = %e, "HTTP upgrade failed"),
            }
        });

        Ok(Response::new(empty_body()))
    }
}

/// Validates the CONNECT port against the allow list.
fn check_port(ssl_ports: &[u16], host: &str, port: &str) -> Result<u16, ProxyError> {
    port.parse::<u16>()
        .ok()
        .filter(|p| ssl_ports.contains(p))
        .ok_or_else(|| ProxyError::PortNotAllowed {
            host: host.to_string(),
            port: port.to_string(),
        })
}

/// Formats `host:port`, bracketing IPv6 literals.
fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

async fn dial(host: &str, port: u16) -> Result<TcpStream, ProxyError> {
    TcpStream::connect((host, port))
        .await
        .map_err(|e| ProxyError::DialFailure {
            addr: authority(host, port),
            message: e.to_string(),
        })
}

/// Dials the upstream proxy and asks it to CONNECT to `host:port`.
async fn connect_via_upstream(
    proxy: &str,
    host: &str,
    port: u16,
) -> Result<BufReader<TcpStream>, ProxyError> {
    let uri = proxy.parse::<Uri>().map_err(|e| ProxyError::DialFailure {
        addr: proxy.to_string(),
        message: format!("invalid proxy URL: {}", e),
    })?;
    let proxy_host = uri.host().ok_or_else(|| ProxyError::DialFailure {
        addr: proxy.to_string(),
        message: "proxy URL has no host".to_string(),
    })?;
    let proxy_port = uri.port_u16().unwrap_or(match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });

    let stream = dial(proxy_host.trim_matches(|c| c == '[' || c == ']'), proxy_port).await?;
    debug!(proxy = %proxy, "Connected to upstream proxy");

    upstream_handshake(stream, &authority(host, port), proxy).await
}

/// Sends `CONNECT` and consumes the upstream's response header block.
///
/// The returned reader keeps any bytes that arrived after the header
/// block; they belong to the tunnel.
async fn upstream_handshake<S>(
    mut stream: S,
    target: &str,
    proxy: &str,
) -> Result<BufReader<S>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handshake_err = |message: String| ProxyError::UpstreamHandshakeFailure {
        proxy: proxy.to_string(),
        message,
    };

    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| handshake_err(e.to_string()))?;

    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    let mut consumed = read_header_line(&mut reader, &mut status_line)
        .await
        .map_err(|e| handshake_err(e.to_string()))?;

    let status = parse_status_code(&status_line)
        .ok_or_else(|| handshake_err(format!("malformed status line: {:?}", status_line.trim_end())))?;

    loop {
        let mut line = String::new();
        consumed += read_header_line(&mut reader, &mut line)
            .await
            .map_err(|e| handshake_err(e.to_string()))?;
        if line == "\r\n" || line == "\n" {
            break;
        }
        if consumed > MAX_HANDSHAKE_BYTES {
            return Err(handshake_err("response headers too large".to_string()));
        }
    }

    if !(200..300).contains(&status) {
        return Err(handshake_err(format!("status {}", status)));
    }

    Ok(reader)
}

async fn read_header_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &mut String,
) -> io::Result<usize> {
    let n = reader
        .take(MAX_HANDSHAKE_BYTES as u64)
        .read_line(line)
        .await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "upstream closed during handshake",
        ));
    }
    Ok(n)
}

/// Extracts the status code from `HTTP/1.x NNN reason`.
fn parse_status_code(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// Copies bytes in both directions until both directions are finished.
///
/// Each direction runs on its own task; when a source ends, the opposite
/// write side is shut down so the peer sees end-of-stream. Both tasks are
/// joined before the streams are dropped.
pub async fn relay<C, R>(client: C, remote: R, label: &str)
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (remote_read, remote_write) = tokio::io::split(remote);

    let outbound = tokio::spawn(pipe(client_read, remote_write));
    let inbound = tokio::spawn(pipe(remote_read, client_write));

    let (sent, received) = tokio::join!(outbound, inbound);
    let sent = log_direction(sent, label, "client->remote");
    let received = log_direction(received, label, "remote->client");

    debug!(target_addr = %label, sent = sent, received = received, "Tunnel closed");
}

async fn pipe<R, W>(mut reader: R, mut writer: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut reader, &mut writer).await;
    let _ = writer.shutdown().await;
    copied
}

fn log_direction(
    result: Result<io::Result<u64>, tokio::task::JoinError>,
    label: &str,
    direction: &str,
) -> u64 {
    match result {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) if is_disconnect(&e) => {
            debug!(target_addr = %label, direction = direction, error = %e, "Tunnel peer went away");
            0
        }
        Ok(Err(e)) => {
            warn!(target_addr = %label, direction = direction, error = %e, "Error transferring data");
            0
        }
        Err(e) => {
            warn!(target_addr = %label, direction = direction, error = %e, "Relay task failed");
            0
        }
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionAborted
    )
}

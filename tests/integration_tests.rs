//! Integration tests for policy-proxy.
//!
//! These tests run the proxy on a loopback listener and drive it with raw
//! sockets, against local echo servers, fake origins and fake upstream
//! proxies.

use policy_proxy::config::{AppConfig, Rule, EXAMPLE_CONFIG};
use policy_proxy::proxy::ProxyServer;
use policy_proxy::resolver::Resolver;
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Helper to create a temporary config file.
fn create_temp_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// A proxy running on an ephemeral port.
struct RunningProxy {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<policy_proxy::Result<()>>,
}

async fn start_proxy(config: AppConfig) -> RunningProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(ProxyServer::with_resolver(
        Arc::new(config),
        Arc::new(Resolver::new(None)),
    ));
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(server.serve(listener, shutdown_rx));

    RunningProxy {
        addr,
        shutdown,
        task,
    }
}

/// Reads an HTTP head up to and including the blank line, one byte at a
/// time so nothing after it is consumed.
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "stream closed before end of head: {:?}", String::from_utf8_lossy(&head));
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// Echo server; returns its address.
async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Single-connection HTTP server that reports the request head it saw and
/// answers with `response`.
async fn start_fake_http(response: &'static str) -> (SocketAddr, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        let _ = seen_tx.send(head);
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
    });
    (addr, seen_rx)
}

/// Single-connection HTTP server that also reads the request body, either
/// by `Content-Length` or up to the last chunk, and reports head and body.
async fn start_fake_origin(
    response: &'static str,
) -> (SocketAddr, oneshot::Receiver<(String, String)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        let lower = head.to_ascii_lowercase();

        let mut body = Vec::new();
        if lower.contains("transfer-encoding: chunked") {
            let mut byte = [0u8; 1];
            while !body.ends_with(b"0\r\n\r\n") {
                if stream.read(&mut byte).await.unwrap() == 0 {
                    break;
                }
                body.push(byte[0]);
            }
        } else if let Some(len) = lower
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            body.resize(len, 0);
            stream.read_exact(&mut body).await.unwrap();
        }

        let _ = seen_tx.send((head, String::from_utf8_lossy(&body).to_string()));
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
    });
    (addr, seen_rx)
}

/// Fake upstream proxy that accepts one CONNECT, answers with
/// `status_line`, and echoes afterwards on success.
async fn start_fake_upstream(status_line: &'static str) -> (SocketAddr, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        let _ = seen_tx.send(head);
        stream
            .write_all(format!("{}\r\n\r\n", status_line).as_bytes())
            .await
            .unwrap();
        if status_line.contains(" 200 ") {
            let (mut reader, mut writer) = stream.into_split();
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        }
    });
    (addr, seen_rx)
}

async fn send_connect(proxy: SocketAddr, target: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    (stream, head)
}

async fn send_get(proxy: SocketAddr, url: &str, host: &str) -> String {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(
            format!("GET {url} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n").as_bytes(),
        )
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).to_string()
}

fn proxies(entries: &[(&str, &str)]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

mod config_tests {
    use super::*;

    #[test]
    fn test_full_config_load() {
        let yaml = r#"
host: 0.0.0.0
port: 3128
geo: /var/lib/geoip/GeoLite2-Country.mmdb
allow-localhost: true
ssl-ports: [443, 8443]
proxies:
  corp: http://10.0.0.2:3128
  default: DENY
rules:
  - name: internal
    type: DOMAIN-SUFFIX
    match: ".corp.example"
    proxy: DIRECT
  - name: outside
    type: GEOIP
    match: "!US;!CA"
    proxy: corp
logging:
  level: debug
  output: stderr
  format: json
"#;
        let file = create_temp_config(yaml);
        let config = AppConfig::load(file.path()).unwrap();

        assert_eq!(config.listen_addr(), "0.0.0.0:3128");
        assert!(config.allow_localhost);
        assert_eq!(config.ssl_ports, vec![443, 8443]);
        assert_eq!(config.proxies.get("corp").unwrap(), "http://10.0.0.2:3128");
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[1].pattern, "!US;!CA");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = AppConfig::from_yaml(EXAMPLE_CONFIG).unwrap();
        let names: Vec<&str> = config.rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["cn", "google", "google", "external"]);
        assert_eq!(config.ssl_ports, vec![443]);
    }

    #[test]
    fn test_config_validation_errors() {
        assert!(AppConfig::from_yaml("port: 0").is_err());
        assert!(AppConfig::from_yaml("host: ''").is_err());
        assert!(AppConfig::from_yaml("ssl-ports: [not-a-port]").is_err());
    }
}

mod connect_tests {
    use super::*;

    #[tokio::test]
    async fn test_direct_tunnel_relays_bytes() {
        let echo = start_echo().await;
        let proxy = start_proxy(AppConfig {
            allow_localhost: true,
            ssl_ports: vec![echo.port()],
            ..Default::default()
        })
        .await;

        let (mut stream, head) = send_connect(proxy.addr, &echo.to_string()).await;
        assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {head}");

        stream.write_all(b"ping through tunnel").await.unwrap();
        let mut buf = [0u8; 19];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping through tunnel");
    }

    #[tokio::test]
    async fn test_tunnel_through_upstream_proxy() {
        let (upstream, seen) = start_fake_upstream("HTTP/1.1 200 Connection established").await;
        let upstream_url = format!("http://{}", upstream);
        let proxy = start_proxy(AppConfig {
            proxies: proxies(&[("up", upstream_url.as_str()), ("default", "DIRECT")]),
            rules: vec![Rule::new("chained", "DOMAIN-SUFFIX", ".example.test", "up")],
            ..Default::default()
        })
        .await;

        let (mut stream, head) = send_connect(proxy.addr, "www.example.test:443").await;
        assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {head}");

        let request = seen.await.unwrap();
        assert!(request.starts_with("CONNECT www.example.test:443 HTTP/1.1\r\n"));

        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_upstream_refusal_is_unavailable() {
        let (upstream, _seen) = start_fake_upstream("HTTP/1.1 407 Proxy Authentication Required").await;
        let upstream_url = format!("http://{}", upstream);
        let proxy = start_proxy(AppConfig {
            proxies: proxies(&[("default", upstream_url.as_str())]),
            ..Default::default()
        })
        .await;

        let (_stream, head) = send_connect(proxy.addr, "www.example.test:443").await;
        assert!(head.starts_with("HTTP/1.1 503"), "unexpected head: {head}");
    }

    #[tokio::test]
    async fn test_non_ssl_port_denied() {
        let proxy = start_proxy(AppConfig::default()).await;
        let (_stream, head) = send_connect(proxy.addr, "www.example.test:22").await;
        assert!(head.starts_with("HTTP/1.1 403"), "unexpected head: {head}");
    }

    #[tokio::test]
    async fn test_localhost_denied() {
        let proxy = start_proxy(AppConfig::default()).await;
        let (_stream, head) = send_connect(proxy.addr, "localhost:443").await;
        assert!(head.starts_with("HTTP/1.1 403"), "unexpected head: {head}");
    }

    #[tokio::test]
    async fn test_rule_deny() {
        let proxy = start_proxy(AppConfig {
            proxies: proxies(&[("default", "DIRECT")]),
            rules: vec![Rule::new("block", "WILDCARD", "*.blocked.test", "DENY")],
            ..Default::default()
        })
        .await;

        let (_stream, head) = send_connect(proxy.addr, "ads.blocked.test:443").await;
        assert!(head.starts_with("HTTP/1.1 403"), "unexpected head: {head}");
    }
}

mod forward_tests {
    use super::*;

    #[tokio::test]
    async fn test_forward_direct_to_origin() {
        let (origin, seen) = start_fake_http(
            "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Origin: yes\r\nConnection: close\r\n\r\nhello",
        )
        .await;
        let proxy = start_proxy(AppConfig {
            allow_localhost: true,
            ..Default::default()
        })
        .await;

        let url = format!("http://{}/path?q=1", origin);
        let response = send_get(proxy.addr, &url, &origin.to_string()).await;

        assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {response}");
        assert!(response.contains("X-Origin: yes"));
        assert!(response.ends_with("hello"));

        let request = seen.await.unwrap();
        assert!(request.starts_with("GET /path?q=1 HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn test_forward_post_body_and_repeated_headers() {
        let (origin, seen) = start_fake_origin(
            "HTTP/1.1 201 Created\r\n\
             Set-Cookie: a=1\r\n\
             Set-Cookie: b=2\r\n\
             Transfer-Encoding: chunked\r\n\
             Connection: close\r\n\r\n\
             5\r\nchunk\r\n0\r\n\r\n",
        )
        .await;
        let proxy = start_proxy(AppConfig {
            allow_localhost: true,
            ..Default::default()
        })
        .await;

        let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
        stream
            .write_all(
                format!(
                    "POST http://{origin}/submit HTTP/1.1\r\n\
                     Host: {origin}\r\n\
                     X-Multi: one\r\n\
                     X-Multi: two\r\n\
                     Accept: text/plain\r\n\
                     Content-Length: 11\r\n\
                     Connection: close\r\n\r\n\
                     hello-world"
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let response = String::from_utf8_lossy(&raw).to_string();

        let (request, body) = seen.await.unwrap();
        let request = request.to_ascii_lowercase();
        assert!(request.starts_with("post /submit http/1.1\r\n"), "unexpected request: {request}");
        assert!(request.contains("x-multi: one\r\n"));
        assert!(request.contains("x-multi: two\r\n"));
        assert!(request.contains("accept: text/plain\r\n"));
        assert!(!request.contains("accept: */*"));
        assert!(body.contains("hello-world"), "unexpected body: {body:?}");

        assert!(response.starts_with("HTTP/1.1 201"), "unexpected response: {response}");
        let (head, payload) = response.split_once("\r\n\r\n").unwrap();
        let head = head.to_ascii_lowercase();
        assert!(head.contains("set-cookie: a=1\r\n"));
        assert!(head.contains("set-cookie: b=2"));
        assert!(payload.contains("chunk"), "unexpected payload: {payload:?}");
    }

    #[tokio::test]
    async fn test_redirects_are_not_followed() {
        let (origin, _seen) = start_fake_http(
            "HTTP/1.1 302 Found\r\nLocation: /elsewhere\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let proxy = start_proxy(AppConfig {
            allow_localhost: true,
            ..Default::default()
        })
        .await;

        let url = format!("http://{}/old", origin);
        let response = send_get(proxy.addr, &url, &origin.to_string()).await;

        assert!(response.starts_with("HTTP/1.1 302"), "unexpected response: {response}");
        assert!(response.contains("Location: /elsewhere"));
    }

    #[tokio::test]
    async fn test_forward_through_upstream_proxy() {
        let (upstream, seen) = start_fake_http(
            "HTTP/1.1 200 OK\r\nContent-Length: 12\r\nConnection: close\r\n\r\nvia-upstream",
        )
        .await;
        let upstream_url = format!("http://{}", upstream);
        let proxy = start_proxy(AppConfig {
            proxies: proxies(&[("default", upstream_url.as_str())]),
            ..Default::default()
        })
        .await;

        let response = send_get(proxy.addr, "http://origin.test/x", "origin.test").await;
        assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {response}");
        assert!(response.ends_with("via-upstream"));

        let request = seen.await.unwrap();
        assert!(request.starts_with("GET http://origin.test/x HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = listener.local_addr().unwrap();
        drop(listener);

        let proxy = start_proxy(AppConfig {
            allow_localhost: true,
            ..Default::default()
        })
        .await;

        let url = format!("http://{}/", closed);
        let response = send_get(proxy.addr, &url, &closed.to_string()).await;
        assert!(response.starts_with("HTTP/1.1 502"), "unexpected response: {response}");
    }

    #[tokio::test]
    async fn test_forward_localhost_denied() {
        let proxy = start_proxy(AppConfig::default()).await;
        let response = send_get(proxy.addr, "http://localhost/", "localhost").await;
        assert!(response.starts_with("HTTP/1.1 403"), "unexpected response: {response}");
        assert!(response.contains("Proxy-Agent: policy-proxy"));
    }
}

#[tokio::test]
async fn test_shutdown_stops_accept_loop() {
    let proxy = start_proxy(AppConfig::default()).await;
    proxy.shutdown.send(true).unwrap();
    let result = tokio::time::timeout(std::time::Duration::from_secs(5), proxy.task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

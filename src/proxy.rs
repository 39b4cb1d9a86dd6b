//! Proxy server implementation.
//!
//! This module owns the listener and wires the pieces together:
//! - HTTP CONNECT tunneling for HTTPS via [`TunnelManager`]
//! - Plain HTTP forwarding via [`ForwardHandler`]
//! - Localhost gating for DIRECT destinations
//! - Periodic cleanup of the resolver cache
//!
//! The server uses hyper's HTTP/1.1 connection handling with upgrade
//! support, one Tokio task per client connection.

use crate::config::AppConfig;
use crate::error::{ProxyError, Result};
use crate::forward::ForwardHandler;
use crate::resolver::Resolver;
use crate::rules::RuleEngine;
use crate::tunnel::TunnelManager;
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE, HOST};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, Uri};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How often idle resolver entries are swept.
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Value of the `Proxy-Agent` header on locally generated responses.
const PROXY_AGENT: &str = "policy-proxy";

/// Error type carried by response bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body produced by the proxy.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// The main proxy server.
pub struct ProxyServer {
    config: Arc<AppConfig>,
    resolver: Arc<Resolver>,
    rules: Arc<RuleEngine>,
    tunnels: TunnelManager,
    forwarder: ForwardHandler,
}

impl ProxyServer {
    /// Creates a server, opening the GeoIP database named in the config.
    pub fn new(config: AppConfig) -> Self {
        let resolver = Arc::new(Resolver::open(&config.geo));
        Self::with_resolver(Arc::new(config), resolver)
    }

    /// Creates a server around an existing resolver.
    pub fn with_resolver(config: Arc<AppConfig>, resolver: Arc<Resolver>) -> Self {
        let rules = Arc::new(RuleEngine::new(&config, resolver.clone()));
        let tunnels = TunnelManager::new(config.clone(), resolver.clone(), rules.clone());
        let forwarder = ForwardHandler::new(config.clone(), resolver.clone(), rules.clone());

        Self {
            config,
            resolver,
            rules,
            tunnels,
            forwarder,
        }
    }

    /// Configuration the server was built with.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Shared resolver and its host cache.
    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// Compiled rule engine.
    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    /// Handles one proxied request.
    ///
    /// Never fails: every error is turned into a plain-text response with
    /// the status the error maps to.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let method = req.method().clone();
        let uri = req.uri().clone();

        let result = if method == Method::CONNECT {
            match connect_target(&uri) {
                Some((host, port)) => self.tunnels.handle(req, &host, &port).await,
                None => Err(ProxyError::bad_request("CONNECT request has no authority")),
            }
        } else {
            match request_host(&req) {
                Ok(host) => self.forwarder.handle(req, &host).await,
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                if e.status().is_client_error() {
                    info!(method = %method, uri = %uri, reason = e.reason(), "{}", e);
                } else {
                    warn!(method = %method, uri = %uri, reason = e.reason(), "{}", e);
                }
                error_response(&e)
            }
        }
    }

    /// Binds the configured listen address and serves until `shutdown`
    /// flips to `true`.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        self.serve(listener, shutdown).await
    }

    /// Serves connections from an already bound listener.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(addr = %listener.local_addr()?, "Proxy listening");

        let sweeper = self.spawn_cache_sweeper();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.spawn_connection(stream, peer),
                        Err(e) => warn!(error = %e, "Failed to accept connection"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Proxy shutting down");
                        break;
                    }
                }
            }
        }

        sweeper.abort();
        Ok(())
    }

    fn spawn_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        debug!(peer = %peer, "Accepted connection");
        let server = Arc::clone(self);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let server = Arc::clone(&server);
                async move { Ok::<_, Infallible>(server.handle(req).await) }
            });

            if let Err(e) = http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(true)
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await
            {
                debug!(peer = %peer, error = %e, "Connection error");
            }
        });
    }

    fn spawn_cache_sweeper(&self) -> JoinHandle<()> {
        let resolver = self.resolver.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CACHE_SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                match resolver.clean_cache() {
                    Some(0) => {}
                    Some(evicted) => {
                        debug!(evicted = evicted, remaining = resolver.len(), "Swept resolver cache")
                    }
                    None => debug!("Resolver cache busy, sweep skipped"),
                }
            }
        })
    }
}

/// Rejects DIRECT traffic to loopback destinations unless allowed.
///
/// A destination that cannot be resolved is rejected as well, since it
/// cannot be shown not to be local.
pub(crate) async fn check_direct(
    config: &AppConfig,
    resolver: &Resolver,
    host: &str,
) -> std::result::Result<(), ProxyError> {
    if config.allow_localhost {
        return Ok(());
    }

    match resolver.resolve_host(host).await {
        Ok(resolved) if resolved.is_loopback => Err(ProxyError::LocalhostBlocked {
            host: host.to_string(),
        }),
        Ok(_) => Ok(()),
        Err(source) => Err(ProxyError::UnresolvableHost {
            host: host.to_string(),
            source,
        }),
    }
}

/// Host and port string of a CONNECT request's authority.
fn connect_target(uri: &Uri) -> Option<(String, String)> {
    let authority = uri.authority()?;
    Some(split_host_port(authority.as_str()))
}

/// Destination host of a non-CONNECT request.
fn request_host<B>(req: &Request<B>) -> std::result::Result<String, ProxyError> {
    let authority = match req.uri().authority() {
        Some(authority) => authority.as_str(),
        None => req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(""),
    };

    let (host, _) = split_host_port(authority);
    if host.is_empty() {
        return Err(ProxyError::bad_request("request has no destination host"));
    }
    Ok(host)
}

/// Splits `host[:port]`, removing IPv6 brackets. A missing port is
/// returned as an empty string.
fn split_host_port(authority: &str) -> (String, String) {
    if let Some(rest) = authority.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((host, tail)) => (
                host.to_string(),
                tail.strip_prefix(':').unwrap_or("").to_string(),
            ),
            None => (authority.to_string(), String::new()),
        };
    }

    match authority.rsplit_once(':') {
        // bare IPv6 literal
        Some((host, _)) if host.contains(':') => (authority.to_string(), String::new()),
        Some((host, port)) => (host.to_string(), port.to_string()),
        None => (authority.to_string(), String::new()),
    }
}

/// Response with no body.
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Response body with fixed content.
pub fn full_body(content: impl Into<Bytes>) -> ProxyBody {
    Full::new(content.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Plain-text response describing `error`.
fn error_response(error: &ProxyError) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(format!("{}\n", error)));
    *response.status_mut() = error.status();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert("proxy-agent", HeaderValue::from_static(PROXY_AGENT));
    response
}

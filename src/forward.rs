//! Plain HTTP forwarding.
//!
//! Non-CONNECT requests are re-issued to the origin through a pooled
//! client for the chosen target, and the origin's response is streamed
//! back unchanged. Redirects are never followed.

use crate::config::AppConfig;
use crate::error::ProxyError;
use crate::proxy::{check_direct, BoxError, ProxyBody};
use crate::resolver::Resolver;
use crate::rules::{ProxyTarget, RuleEngine};
use bytes::Bytes;
use futures::TryStreamExt;
use http::header::HOST;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body, Frame};
use hyper::{Request, Response};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// One outbound HTTP client per proxy target.
///
/// Clients are built on first use and kept for the life of the process so
/// their connection pools are shared by every request to that target.
#[derive(Default)]
pub struct ClientPool {
    clients: Mutex<HashMap<ProxyTarget, reqwest::Client>>,
}

impl ClientPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the client for `target`, building it on first use.
    pub fn get(&self, target: &ProxyTarget) -> Result<reqwest::Client, ProxyError> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(target) {
            return Ok(client.clone());
        }

        let client = build_client(target)?;
        debug!(route = %target, "Created outbound client");
        clients.insert(target.clone(), client.clone());
        Ok(client)
    }

    /// Number of clients built so far.
    pub fn len(&self) -> usize {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if no client has been built yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn build_client(target: &ProxyTarget) -> Result<reqwest::Client, ProxyError> {
    let builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none());

    let builder = match target {
        ProxyTarget::Upstream(url) => {
            let proxy = reqwest::Proxy::all(url.as_str()).map_err(|e| ProxyError::DialFailure {
                addr: url.clone(),
                message: format!("invalid proxy URL: {}", e),
            })?;
            builder.proxy(proxy)
        }
        ProxyTarget::Direct | ProxyTarget::Deny => builder.no_proxy(),
    };

    builder.build().map_err(|e| ProxyError::DialFailure {
        addr: target.to_string(),
        message: e.to_string(),
    })
}

/// Forwards non-CONNECT requests according to the rule set.
pub struct ForwardHandler {
    config: Arc<AppConfig>,
    resolver: Arc<Resolver>,
    rules: Arc<RuleEngine>,
    clients: ClientPool,
}

impl ForwardHandler {
    /// Creates a handler with an empty client pool.
    pub fn new(config: Arc<AppConfig>, resolver: Arc<Resolver>, rules: Arc<RuleEngine>) -> Self {
        Self {
            config,
            resolver,
            rules,
            clients: ClientPool::new(),
        }
    }

    /// Sends `req` to its origin and streams the response back.
    pub async fn handle<B>(&self, req: Request<B>, host: &str) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let decision = self.rules.decide(host).await;
        if decision.target == ProxyTarget::Deny {
            return Err(ProxyError::PolicyDenied {
                host: host.to_string(),
                rule: decision.rule.clone(),
            });
        }
        if decision.target == ProxyTarget::Direct {
            check_direct(&self.config, &self.resolver, host).await?;
        }

        let client = self.clients.get(&decision.target)?;
        let url = absolute_url(&req)?;
        info!(
            method = %req.method(),
            url = %url,
            route = %decision.target,
            rule = %decision.rule,
            "Forwarding request"
        );

        let (parts, body) = req.into_parts();
        let mut outbound = client
            .request(parts.method, url.as_str())
            .headers(parts.headers);
        if !body.is_end_stream() {
            outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream = outbound
            .send()
            .await
            .map_err(|e| ProxyError::OriginRequestFailure {
                url: url.clone(),
                message: e.to_string(),
            })?;

        debug!(url = %url, status = %upstream.status(), "Origin responded");

        let mut response = Response::builder().status(upstream.status());
        if let Some(headers) = response.headers_mut() {
            headers.extend(upstream.headers().clone());
        }

        let stream = upstream
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(BoxError::from);

        response
            .body(StreamBody::new(stream).boxed_unsync())
            .map_err(|e| ProxyError::OriginRequestFailure {
                url,
                message: e.to_string(),
            })
    }
}

/// Builds the absolute origin URL for a proxied request.
///
/// Proxy clients send absolute-form targets; origin-form targets fall back
/// to the `Host` header.
pub fn absolute_url<B>(req: &Request<B>) -> Result<String, ProxyError> {
    let uri = req.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.to_string());
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProxyError::bad_request("request has no absolute URL or Host header"))?;
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    Ok(format!("http://{}{}", host, path))
}

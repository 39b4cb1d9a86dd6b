//! # Policy Proxy Library
//!
//! This crate provides a rule-driven HTTP/HTTPS forward proxy. Every
//! destination host is matched against an ordered rule list and sent
//! DIRECT, denied, or chained through a named upstream proxy.
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and validation
//! - [`error`]: Error types and handling
//! - [`logging`]: Logging setup and configuration
//! - [`resolver`]: DNS + GeoIP country resolution with an idle-expiring cache
//! - [`rules`]: Rule compilation, matching, and the decision cache
//! - [`tunnel`]: HTTP CONNECT handling and the byte relay
//! - [`forward`]: Plain HTTP forwarding through pooled clients
//! - [`proxy`]: The listener and request dispatch
//!
//! ## Example
//!
//! ```ignore
//! use policy_proxy::config::AppConfig;
//! use policy_proxy::proxy::ProxyServer;
//! use std::sync::Arc;
//!
//! let config = AppConfig::load("config.yaml")?;
//! let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!
//! Arc::new(ProxyServer::new(config)).run(shutdown_rx).await?;
//! ```
//!
//! ## Rule Evaluation
//!
//! 1. **Decision cache**: a host decided once keeps its decision
//! 2. **Rules**: first rule with a matching alternative wins
//! 3. **Default**: the `default` proxy label, or DIRECT when none is set

pub mod config;
pub mod error;
pub mod forward;
pub mod logging;
pub mod proxy;
pub mod resolver;
pub mod rules;
pub mod tunnel;

pub use config::AppConfig;
pub use error::{ProxyError, Result};
pub use proxy::ProxyServer;
pub use rules::{ProxyDecision, ProxyTarget, RuleEngine};

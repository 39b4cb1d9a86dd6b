//! Error types for the policy-proxy application.
//!
//! This module defines all error types used throughout the application,
//! providing structured error handling with context. Request-level
//! errors know which HTTP status they surface as.

use http::StatusCode;
use std::net::IpAddr;
use thiserror::Error;

/// Main error type for the policy-proxy application.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration file could not be found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}")]
    ConfigValidation { message: String },

    /// I/O error wrapper.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The request carried no usable destination.
    #[error("Bad request: {message}")]
    BadRequest { message: String },

    /// A rule (or the default) routed the host to DENY.
    #[error("The given host is denied, DENY: {host} (rule {rule})")]
    PolicyDenied { host: String, rule: String },

    /// CONNECT to a port outside the ssl-ports allow list.
    #[error("The given port is not secure, DENY: {host}:{port}")]
    PortNotAllowed { host: String, port: String },

    /// DIRECT to a loopback destination while localhost is not allowed.
    #[error("The given host is a localhost, DENY: {host}")]
    LocalhostBlocked { host: String },

    /// DIRECT destination could not be resolved for gating.
    #[error("The given host is unresolvable, DENY: {host}: {source}")]
    UnresolvableHost {
        host: String,
        #[source]
        source: ResolveError,
    },

    /// Could not reach the destination or upstream proxy.
    #[error("Failed to connect to '{addr}': {message}")]
    DialFailure { addr: String, message: String },

    /// Upstream proxy refused or garbled the CONNECT handshake.
    #[error("Upstream proxy '{proxy}' rejected CONNECT: {message}")]
    UpstreamHandshakeFailure { proxy: String, message: String },

    /// The connection cannot be taken over for raw tunneling.
    #[error("Raw connection takeover is not supported: {message}")]
    TransportLimitation { message: String },

    /// Forwarding the request to the origin failed.
    #[error("Error forwarding request to {url}: {message}")]
    OriginRequestFailure { url: String, message: String },
}

impl ProxyError {
    /// Creates a new configuration parse error.
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
        }
    }

    /// Creates a new configuration validation error.
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Creates a new bad request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// HTTP status this error is reported to the client with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::PolicyDenied { .. }
            | Self::PortNotAllowed { .. }
            | Self::LocalhostBlocked { .. }
            | Self::UnresolvableHost { .. } => StatusCode::FORBIDDEN,
            Self::DialFailure { .. } | Self::UpstreamHandshakeFailure { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::OriginRequestFailure { .. } => StatusCode::BAD_GATEWAY,
            Self::TransportLimitation { .. }
            | Self::ConfigNotFound { .. }
            | Self::ConfigParse { .. }
            | Self::ConfigValidation { .. }
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short tag used in request log lines.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "bad-request",
            Self::PolicyDenied { .. } => "policy",
            Self::PortNotAllowed { .. } => "non-ssl-port",
            Self::LocalhostBlocked { .. } => "localhost",
            Self::UnresolvableHost { .. } => "unresolvable",
            Self::DialFailure { .. } => "dial",
            Self::UpstreamHandshakeFailure { .. } => "upstream-handshake",
            Self::TransportLimitation { .. } => "no-takeover",
            Self::OriginRequestFailure { .. } => "origin",
            _ => "internal",
        }
    }
}

/// Failures while turning a hostname into addresses and a country.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// Forward DNS lookup failed.
    #[error("DNS lookup for {host} failed: {source}")]
    Dns {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// DNS answered without any address.
    #[error("DNS lookup for {host} returned no addresses")]
    NoAddresses { host: String },

    /// No GeoIP database was loaded.
    #[error("no geoip database available")]
    GeoUnavailable,

    /// The GeoIP database failed for an address.
    #[error("GeoIP lookup for {ip} failed: {message}")]
    GeoLookup { ip: IpAddr, message: String },

    /// Addresses of one host map to different countries.
    #[error("{host} resolves to multiple countries ({first}, {second})")]
    AmbiguousCountry {
        host: String,
        first: String,
        second: String,
    },
}

/// A single rule alternative could not be evaluated.
#[derive(Error, Debug)]
pub enum MatchError {
    /// The pattern failed to compile when the rules were loaded.
    #[error("invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    /// The host could not be resolved for a GEOIP rule.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Result type alias using ProxyError.
pub type Result<T> = std::result::Result<T, ProxyError>;

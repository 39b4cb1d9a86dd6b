//! Rule evaluation: turns a destination host into a routing decision.
//!
//! Rules are evaluated in configuration order. Each rule's `match` is
//! split on `;` into alternatives; an alternative prefixed with `!` is
//! accepted when its matcher does *not* match. The first accepted
//! alternative of the first matching rule decides the route. When no
//! rule accepts, the `default` proxy label decides.
//!
//! Decisions are memoized per host for the life of the engine.
//!
//! # Example
//!
//! ```ignore
//! use policy_proxy::rules::{RuleEngine, ProxyTarget};
//!
//! let engine = RuleEngine::new(&config, resolver);
//! let decision = engine.decide("music.youtube.com").await;
//! assert_eq!(decision.target, ProxyTarget::Upstream("http://127.0.0.1:8888".into()));
//! ```

use crate::config::{AppConfig, Rule};
use crate::error::MatchError;
use crate::resolver::Resolver;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Target token for connecting without an upstream proxy.
pub const DIRECT: &str = "DIRECT";

/// Target token for refusing the request.
pub const DENY: &str = "DENY";

/// Proxy label and provenance used when no rule matches.
pub const DEFAULT_LABEL: &str = "default";

const ALTERNATIVE_SEPARATOR: char = ';';

/// Where traffic for a host goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProxyTarget {
    /// Connect to the destination directly.
    Direct,
    /// Refuse the request.
    Deny,
    /// Chain through the upstream proxy at this URL.
    Upstream(String),
}

impl ProxyTarget {
    /// Interprets a configured endpoint value.
    pub fn from_endpoint(endpoint: &str) -> Self {
        match endpoint {
            DIRECT => Self::Direct,
            DENY => Self::Deny,
            url => Self::Upstream(url.to_string()),
        }
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str(DIRECT),
            Self::Deny => f.write_str(DENY),
            Self::Upstream(url) => f.write_str(url),
        }
    }
}

/// A resolved route and the rule that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDecision {
    /// Final target after proxy label resolution.
    pub target: ProxyTarget,
    /// Name of the deciding rule, or `default`.
    pub rule: String,
}

/// Supported rule types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    DomainSuffix,
    Wildcard,
    Regexp,
    GeoIp,
}

impl FromStr for RuleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DOMAIN-SUFFIX" => Ok(Self::DomainSuffix),
            "WILDCARD" => Ok(Self::Wildcard),
            "REGEXP" => Ok(Self::Regexp),
            "GEOIP" => Ok(Self::GeoIp),
            other => Err(format!("unknown rule type: {}", other)),
        }
    }
}

/// One precompiled match alternative.
#[derive(Debug)]
enum Matcher {
    DomainSuffix(String),
    Wildcard(String),
    Regexp {
        pattern: String,
        compiled: Result<Regex, String>,
    },
    GeoIp(String),
}

impl Matcher {
    fn compile(kind: RuleKind, pattern: &str) -> Self {
        match kind {
            RuleKind::DomainSuffix => Self::DomainSuffix(pattern.to_string()),
            RuleKind::Wildcard => Self::Wildcard(pattern.to_string()),
            RuleKind::Regexp => Self::Regexp {
                pattern: pattern.to_string(),
                compiled: Regex::new(pattern).map_err(|e| e.to_string()),
            },
            RuleKind::GeoIp => Self::GeoIp(pattern.to_string()),
        }
    }

    async fn matches(&self, resolver: &Resolver, host: &str) -> Result<bool, MatchError> {
        match self {
            Self::DomainSuffix(suffix) => Ok(host.ends_with(suffix.as_str())),
            Self::Wildcard(pattern) => Ok(wildcard_match(pattern, host)),
            Self::Regexp { compiled: Ok(re), .. } => Ok(re.is_match(host)),
            Self::Regexp {
                pattern,
                compiled: Err(message),
            } => Err(MatchError::InvalidPattern {
                pattern: pattern.clone(),
                message: message.clone(),
            }),
            Self::GeoIp(country) => {
                let resolved = resolver.resolve_host(host).await?;
                Ok(resolved.country == *country)
            }
        }
    }
}

#[derive(Debug)]
struct Alternative {
    inverted: bool,
    matcher: Matcher,
}

#[derive(Debug)]
struct CompiledRule {
    name: String,
    kind: RuleKind,
    proxy: String,
    alternatives: Vec<Alternative>,
}

impl CompiledRule {
    /// Returns `None` (after logging) for rule types this build does not know.
    fn compile(rule: &Rule) -> Option<Self> {
        let kind = match rule.kind.parse::<RuleKind>() {
            Ok(kind) => kind,
            Err(e) => {
                warn!(rule = %rule.name, error = %e, "Skipping rule");
                return None;
            }
        };

        let alternatives = rule
            .pattern
            .split(ALTERNATIVE_SEPARATOR)
            .map(|alt| {
                let (inverted, pattern) = match alt.strip_prefix('!') {
                    Some(rest) => (true, rest),
                    None => (false, alt),
                };
                let matcher = Matcher::compile(kind, pattern);
                if let Matcher::Regexp { compiled: Err(e), .. } = &matcher {
                    warn!(rule = %rule.name, error = %e, "Rule alternative will never match");
                }
                Alternative { inverted, matcher }
            })
            .collect();

        Some(Self {
            name: rule.name.clone(),
            kind,
            proxy: rule.proxy.clone(),
            alternatives,
        })
    }
}

/// Process-wide memo of host to decision.
///
/// Never evicted; the first decision stored for a host is the one every
/// later caller receives.
#[derive(Debug, Default)]
pub struct DecisionCache {
    entries: Mutex<HashMap<String, Arc<ProxyDecision>>>,
}

impl DecisionCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the decision for `host`.
    pub fn get(&self, host: &str) -> Option<Arc<ProxyDecision>> {
        self.lock().get(host).cloned()
    }

    /// Stores `decision` unless one is already present, returning the
    /// decision that is now authoritative for `host`.
    pub fn insert(&self, host: &str, decision: ProxyDecision) -> Arc<ProxyDecision> {
        self.lock()
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(decision))
            .clone()
    }

    /// Number of cached hosts.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing has been cached yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ProxyDecision>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Evaluates the ordered rule list for a host.
pub struct RuleEngine {
    rules: Vec<CompiledRule>,
    proxies: HashMap<String, String>,
    cache: DecisionCache,
    resolver: Arc<Resolver>,
}

impl RuleEngine {
    /// Compiles the configured rules once.
    pub fn new(config: &AppConfig, resolver: Arc<Resolver>) -> Self {
        let rules: Vec<CompiledRule> = config.rules.iter().filter_map(CompiledRule::compile).collect();

        debug!(
            rules = rules.len(),
            skipped = config.rules.len() - rules.len(),
            "Rule set compiled"
        );

        Self {
            rules,
            proxies: config.proxies.clone(),
            cache: DecisionCache::new(),
            resolver,
        }
    }

    /// Returns the routing decision for `host`. Never fails; anything that
    /// goes wrong while matching falls through to the `default` label.
    pub async fn decide(&self, host: &str) -> Arc<ProxyDecision> {
        if let Some(decision) = self.cache.get(host) {
            return decision;
        }

        let decision = match self.evaluate(host).await {
            Some(decision) => decision,
            None => ProxyDecision {
                target: self.resolve_target(DEFAULT_LABEL),
                rule: DEFAULT_LABEL.to_string(),
            },
        };

        debug!(host = %host, route = %decision.target, rule = %decision.rule, "Decision cached");
        self.cache.insert(host, decision)
    }

    async fn evaluate(&self, host: &str) -> Option<ProxyDecision> {
        for rule in &self.rules {
            for alternative in &rule.alternatives {
                let matched = match alternative.matcher.matches(&self.resolver, host).await {
                    Ok(matched) => matched,
                    Err(e) => {
                        warn!(
                            rule = %rule.name,
                            kind = ?rule.kind,
                            host = %host,
                            error = %e,
                            "Processing rule failed"
                        );
                        continue;
                    }
                };

                if matched != alternative.inverted {
                    return Some(ProxyDecision {
                        target: self.resolve_target(&rule.proxy),
                        rule: rule.name.clone(),
                    });
                }
            }
        }
        None
    }

    /// Maps a proxy label to its final target.
    pub fn resolve_target(&self, label: &str) -> ProxyTarget {
        if self.proxies.is_empty() {
            return ProxyTarget::Direct;
        }
        if label == DIRECT || label == DENY {
            return ProxyTarget::from_endpoint(label);
        }
        self.proxies
            .get(label)
            .or_else(|| self.proxies.get(DEFAULT_LABEL))
            .map(|endpoint| ProxyTarget::from_endpoint(endpoint))
            .unwrap_or(ProxyTarget::Direct)
    }

    /// The decision cache backing [`decide`](Self::decide).
    pub fn cache(&self) -> &DecisionCache {
        &self.cache
    }
}

/// Anchored glob match where `*` matches any run of bytes, including none.
/// All other bytes must match literally and case-sensitively.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();

    let (mut pi, mut ti) = (0, 0);
    // Position of the last `*` seen and the text index it was tried at.
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == b'*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((star, from)) = backtrack {
            pi = star + 1;
            ti = from + 1;
            backtrack = Some((star, from + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|&b| b == b'*')
}

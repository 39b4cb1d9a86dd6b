//! Host resolution and GeoIP lookup for the proxy.
//!
//! A host is resolved to `{is_loopback, country}`:
//! 1. `localhost` / `127.0.0.1` short-circuit to a loopback result
//! 2. Cached entries are returned (and their idle clock is reset)
//! 3. Otherwise DNS is queried and every address is looked up in the
//!    country database; all addresses must agree on one country
//!
//! Entries idle for more than [`IDLE_TTL`] are dropped by
//! [`Resolver::clean_cache`], which never waits for the cache lock.

use crate::error::ResolveError;
use maxminddb::{geoip2, MaxMindDBError};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock, TryLockError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Idle time after which a cache entry may be swept.
pub const IDLE_TTL: Duration = Duration::from_secs(30 * 60);

/// Country code reported for the literal localhost names.
pub const LOCALHOST_COUNTRY: &str = "LOCALHOST";

/// What the policy layer needs to know about a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHost {
    /// At least one address is a loopback address.
    pub is_loopback: bool,
    /// ISO country code shared by all addresses (empty if unknown).
    pub country: String,
}

/// Country lookup capability, backed by a MaxMind database in production.
pub trait GeoDatabase: Send + Sync {
    /// Returns the ISO code for `ip`, or `None` if the database has no
    /// country for it.
    fn country(&self, ip: IpAddr) -> Result<Option<String>, ResolveError>;
}

/// A MaxMind-format country database held in memory.
pub struct MaxMindDb {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl MaxMindDb {
    /// Reads the whole database file.
    pub fn open(path: &Path) -> Result<Self, MaxMindDBError> {
        Ok(Self {
            reader: maxminddb::Reader::open_readfile(path)?,
        })
    }
}

impl GeoDatabase for MaxMindDb {
    fn country(&self, ip: IpAddr) -> Result<Option<String>, ResolveError> {
        match self.reader.lookup::<geoip2::Country>(ip) {
            Ok(record) => Ok(record
                .country
                .and_then(|c| c.iso_code)
                .map(str::to_string)),
            Err(MaxMindDBError::AddressNotFoundError(_)) => Ok(None),
            Err(e) => Err(ResolveError::GeoLookup {
                ip,
                message: e.to_string(),
            }),
        }
    }
}

struct ResolverEntry {
    ips: Vec<IpAddr>,
    is_loopback: bool,
    country: String,
    created_at: Instant,
    last_read: Mutex<Instant>,
}

impl ResolverEntry {
    fn touch(&self) {
        *self.last_read.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_read
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn resolved(&self) -> ResolvedHost {
        ResolvedHost {
            is_loopback: self.is_loopback,
            country: self.country.clone(),
        }
    }
}

/// Hostname resolver with a sliding-TTL cache.
pub struct Resolver {
    cache: RwLock<HashMap<String, ResolverEntry>>,
    geoip: Option<Arc<dyn GeoDatabase>>,
}

impl Resolver {
    /// Creates a resolver over an optional country database.
    pub fn new(geoip: Option<Arc<dyn GeoDatabase>>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            geoip,
        }
    }

    /// Creates a resolver backed by the MaxMind database at `path`.
    ///
    /// A missing or unreadable database is logged and the resolver runs
    /// without one; country lookups then fail.
    pub fn open(path: &Path) -> Self {
        let geoip: Option<Arc<dyn GeoDatabase>> = match MaxMindDb::open(path) {
            Ok(db) => {
                info!(path = %path.display(), "GeoIP database loaded");
                Some(Arc::new(db))
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "GeoIP database unavailable");
                None
            }
        };
        Self::new(geoip)
    }

    /// Resolves `host` to its loopback flag and country code.
    pub async fn resolve_host(&self, host: &str) -> Result<ResolvedHost, ResolveError> {
        if host == "localhost" || host == "127.0.0.1" {
            return Ok(ResolvedHost {
                is_loopback: true,
                country: LOCALHOST_COUNTRY.to_string(),
            });
        }

        if let Some(hit) = self.cached(host) {
            return Ok(hit);
        }

        let ips = lookup_ips(host).await?;
        self.record(host, ips)
    }

    /// Summarizes the addresses of `host` and caches the result.
    ///
    /// Nothing is cached when the summary fails.
    fn record(&self, host: &str, ips: Vec<IpAddr>) -> Result<ResolvedHost, ResolveError> {
        let (is_loopback, country) = self.summarize(host, &ips)?;

        debug!(host = %host, ips = ?ips, country = %country, "Resolved host");

        let now = Instant::now();
        let entry = ResolverEntry {
            ips,
            is_loopback,
            country,
            created_at: now,
            last_read: Mutex::new(now),
        };
        let resolved = entry.resolved();

        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host.to_string(), entry);

        Ok(resolved)
    }

    fn cached(&self, host: &str) -> Option<ResolvedHost> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        let entry = cache.get(host)?;
        entry.touch();
        Some(entry.resolved())
    }

    /// Folds per-address results into one loopback flag and one country.
    fn summarize(&self, host: &str, ips: &[IpAddr]) -> Result<(bool, String), ResolveError> {
        let geoip = self.geoip.as_ref().ok_or(ResolveError::GeoUnavailable)?;

        let is_loopback = ips.iter().any(IpAddr::is_loopback);
        let mut country: Option<String> = None;

        for ip in ips {
            let code = geoip.country(*ip)?.unwrap_or_default();
            match &country {
                None => country = Some(code),
                Some(first) if *first != code => {
                    return Err(ResolveError::AmbiguousCountry {
                        host: host.to_string(),
                        first: first.clone(),
                        second: code,
                    });
                }
                Some(_) => {}
            }
        }

        Ok((is_loopback, country.unwrap_or_default()))
    }

    /// Drops entries idle for longer than [`IDLE_TTL`].
    ///
    /// Best effort: returns `None` without sweeping when the cache lock is
    /// held elsewhere, otherwise the number of entries removed.
    pub fn clean_cache(&self) -> Option<usize> {
        self.clean_idle(IDLE_TTL)
    }

    fn clean_idle(&self, ttl: Duration) -> Option<usize> {
        let mut cache = match self.cache.try_write() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return None,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
        };

        let before = cache.len();
        cache.retain(|host, entry| {
            let keep = entry.idle_for() <= ttl;
            if !keep {
                debug!(
                    host = %host,
                    ips = ?entry.ips,
                    age_secs = entry.created_at.elapsed().as_secs(),
                    "Evicting idle resolver entry"
                );
            }
            keep
        });
        Some(before - cache.len())
    }

    /// Number of cached hosts.
    pub fn len(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn lookup_ips(host: &str) -> Result<Vec<IpAddr>, ResolveError> {
    let addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|source| ResolveError::Dns {
            host: host.to_string(),
            source,
        })?;

    let mut ips: Vec<IpAddr> = Vec::new();
    for addr in addrs {
        if !ips.contains(&addr.ip()) {
            ips.push(addr.ip());
        }
    }

    if ips.is_empty() {
        return Err(ResolveError::NoAddresses {
            host: host.to_string(),
        });
    }
    Ok(ips)
}

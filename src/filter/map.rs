//! Host filter map with list-file loading
//!
//! The map associates a hostname with an allow/deny flag. It is built from
//! up to three newline-delimited list files, applied in order:
//!
//! 1. base list (hosts-file format accepted): every entry denied
//! 2. whitelist: every entry allowed, overriding the base list
//! 3. blacklist: every entry denied, applied last
//!
//! The active map sits behind an `ArcSwap`, so lists can be reloaded while
//! the tunnel pump is consulting it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, info};

use super::{HostFilter, Verdict};
use crate::error::FilterError;

/// Redirect targets stripped from the front of base-list lines
const REDIRECT_PREFIXES: [&str; 2] = ["127.0.0.1", "0.0.0.0"];

/// Statistics for filter lookups
#[derive(Debug, Default)]
pub struct FilterStats {
    lookups: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    unknown: AtomicU64,
    reloads: AtomicU64,
}

impl FilterStats {
    fn record(&self, verdict: Verdict) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let counter = match verdict {
            Verdict::Allow => &self.allowed,
            Verdict::Deny => &self.denied,
            Verdict::Unknown => &self.unknown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all stats
    #[must_use]
    pub fn snapshot(&self) -> FilterStatsSnapshot {
        FilterStatsSnapshot {
            lookups: self.lookups.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of filter statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct FilterStatsSnapshot {
    /// Total lookups
    pub lookups: u64,
    /// Lookups answered with allow
    pub allowed: u64,
    /// Lookups answered with deny
    pub denied: u64,
    /// Lookups for hosts absent from the map
    pub unknown: u64,
    /// Number of list reloads
    pub reloads: u64,
}

/// Hot-swappable hostname → allowed map
#[derive(Debug)]
pub struct FilterMap {
    entries: ArcSwap<HashMap<String, bool>>,
    stats: FilterStats,
}

impl Default for FilterMap {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterMap {
    /// Create an empty map; every lookup is `Unknown`
    #[must_use]
    pub fn new() -> Self {
        Self::from_entries(HashMap::new())
    }

    /// Create a map from explicit entries (`true` = allowed)
    #[must_use]
    pub fn from_entries(entries: HashMap<String, bool>) -> Self {
        Self {
            entries: ArcSwap::from_pointee(entries),
            stats: FilterStats::default(),
        }
    }

    /// Build a map from list files
    ///
    /// # Errors
    ///
    /// Returns `FilterError::ListRead` if a given file cannot be read.
    pub fn load_lists(
        base: Option<&Path>,
        whitelist: Option<&Path>,
        blacklist: Option<&Path>,
    ) -> Result<Self, FilterError> {
        Ok(Self::from_entries(build_entries(base, whitelist, blacklist)?))
    }

    /// Re-read the list files and swap the new map in.
    ///
    /// On error the current map stays active.
    ///
    /// # Errors
    ///
    /// Returns `FilterError::ListRead` if a given file cannot be read.
    pub fn reload(
        &self,
        base: Option<&Path>,
        whitelist: Option<&Path>,
        blacklist: Option<&Path>,
    ) -> Result<usize, FilterError> {
        let entries = build_entries(base, whitelist, blacklist)?;
        let count = entries.len();
        self.replace(entries);
        Ok(count)
    }

    /// Swap in a new set of entries
    pub fn replace(&self, entries: HashMap<String, bool>) {
        let count = entries.len();
        self.entries.store(Arc::new(entries));
        self.stats.reloads.fetch_add(1, Ordering::Relaxed);
        info!("Filter map replaced: {} entries", count);
    }

    /// Look up a host without recording statistics
    #[must_use]
    pub fn lookup(&self, host: &str) -> Verdict {
        let entries = self.entries.load();
        match entries.get(normalize(host).as_str()) {
            Some(true) => Verdict::Allow,
            Some(false) => Verdict::Deny,
            None => Verdict::Unknown,
        }
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    /// Whether the map is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    /// Entries that are names rather than IPv4 address literals
    #[must_use]
    pub fn hostname_entries(&self) -> usize {
        self.entries
            .load()
            .keys()
            .filter(|host| host.parse::<std::net::Ipv4Addr>().is_err())
            .count()
    }

    /// Get filter statistics
    #[must_use]
    pub fn stats(&self) -> &FilterStats {
        &self.stats
    }
}

impl HostFilter for FilterMap {
    fn verdict(&self, host: &str) -> Verdict {
        let verdict = self.lookup(host);
        self.stats.record(verdict);
        verdict
    }
}

fn build_entries(
    base: Option<&Path>,
    whitelist: Option<&Path>,
    blacklist: Option<&Path>,
) -> Result<HashMap<String, bool>, FilterError> {
    let mut entries = HashMap::new();

    if let Some(path) = base {
        let hosts = read_list(path)?;
        debug!("Base list {:?}: {} hosts", path, hosts.len());
        entries.extend(hosts.into_iter().map(|h| (h, false)));
    }
    if let Some(path) = whitelist {
        let hosts = read_list(path)?;
        debug!("Whitelist {:?}: {} hosts", path, hosts.len());
        entries.extend(hosts.into_iter().map(|h| (h, true)));
    }
    if let Some(path) = blacklist {
        let hosts = read_list(path)?;
        debug!("Blacklist {:?}: {} hosts", path, hosts.len());
        entries.extend(hosts.into_iter().map(|h| (h, false)));
    }

    Ok(entries)
}

fn read_list(path: &Path) -> Result<Vec<String>, FilterError> {
    let contents = std::fs::read_to_string(path).map_err(|source| FilterError::ListRead {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_list(&contents))
}

/// Parse newline-delimited hostnames.
///
/// Blank lines and `#` comments are skipped, a leading loopback redirect
/// target (`127.0.0.1 host`) is stripped, and trailing comments are ignored.
#[must_use]
pub fn parse_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .filter_map(|line| {
            let line = line.split('#').next().unwrap_or_default();
            let mut fields = line.split_whitespace();
            let first = fields.next()?;
            let host = if REDIRECT_PREFIXES.contains(&first) {
                fields.next()?
            } else {
                first
            };
            let host = normalize(host);
            (!host.is_empty()).then_some(host)
        })
        .collect()
}

fn normalize(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

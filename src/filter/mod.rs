//! Destination filter
//!
//! A synchronous `host -> {allow, deny, unknown}` lookup consulted once per
//! packet before it is handed to a translator. `Allow` and `Unknown` forward
//! the packet; `Deny` drops it.

mod map;
mod resolver;

use std::sync::Arc;

pub use map::{parse_list, FilterMap, FilterStats, FilterStatsSnapshot};
pub use resolver::{CachedResolver, HostResolver, LiteralResolver, ReverseDnsResolver};

use tracing::warn;

use crate::config::FilterConfig;
use crate::error::FilterError;

/// Outcome of a filter lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// Explicitly allowed
    Allow,
    /// Explicitly denied
    Deny,
    /// Host not present in the filter
    Unknown,
}

impl Verdict {
    /// Whether a packet with this verdict is relayed
    #[must_use]
    pub const fn forwards(self) -> bool {
        !matches!(self, Self::Deny)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Deny => write!(f, "deny"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Synchronous host → verdict lookup
pub trait HostFilter: Send + Sync {
    /// Verdict for `host`
    fn verdict(&self, host: &str) -> Verdict;
}

impl<F> HostFilter for F
where
    F: Fn(&str) -> Verdict + Send + Sync,
{
    fn verdict(&self, host: &str) -> Verdict {
        self(host)
    }
}

/// Filter plus the resolver producing its lookup keys
#[derive(Clone)]
pub struct PacketFilter {
    /// Host lookup
    pub filter: Arc<dyn HostFilter>,
    /// Address → lookup key
    pub resolver: Arc<dyn HostResolver>,
}

impl PacketFilter {
    /// Verdict for a destination address
    #[must_use]
    pub fn check(&self, destination: std::net::Ipv4Addr) -> Verdict {
        let host = self.resolver.resolve(destination);
        self.filter.verdict(&host)
    }

    /// Build the filter described by `config`, or `None` when disabled.
    ///
    /// Returns the concrete map as well so callers can reload it.
    ///
    /// # Errors
    ///
    /// Returns `FilterError::ListRead` if a configured list cannot be read.
    pub fn from_config(
        config: &FilterConfig,
    ) -> Result<Option<(Self, Arc<FilterMap>)>, FilterError> {
        if !config.enabled {
            return Ok(None);
        }

        let map = Arc::new(FilterMap::load_lists(
            config.hosts_file.as_deref(),
            config.whitelist_file.as_deref(),
            config.blacklist_file.as_deref(),
        )?);

        let hostnames = map.hostname_entries();
        if !config.resolve_hostnames && hostnames > 0 {
            warn!(
                "{} filter entries are hostnames but filter.resolve_hostnames is off; \
                 destinations are matched by address literal, so they never match",
                hostnames
            );
        }

        let resolver: Arc<dyn HostResolver> = if config.resolve_hostnames {
            Arc::new(CachedResolver::new(
                ReverseDnsResolver,
                config.resolve_cache_ttl(),
            ))
        } else {
            Arc::new(LiteralResolver)
        };

        let filter = Self {
            filter: Arc::clone(&map) as Arc<dyn HostFilter>,
            resolver,
        };
        Ok(Some((filter, map)))
    }
}

impl std::fmt::Debug for PacketFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketFilter")
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

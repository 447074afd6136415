//! Destination and reverse DNS resolution.

use crate::parser::DestinationSet;
use crate::{Hop, TraceError, TraceResult};
use futures::future::join_all;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Resolves a destination name or literal to every IPv4 address that identifies it.
///
/// Probes racing against round-robin DNS may reach any of the destination's
/// addresses, so all of them count as "the destination". Lookup failures are
/// logged and yield an empty set; final-hop detection then falls back to the
/// address the probe tool announces in its header.
pub async fn resolve_destination(destination: &str, timeout: Duration) -> DestinationSet {
    if let Ok(ip) = destination.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => DestinationSet::new([v4]),
            IpAddr::V6(_) => {
                debug!(destination, "IPv6 destination, no IPv4 addresses to match");
                DestinationSet::default()
            }
        };
    }

    match lookup_ipv4(destination, timeout).await {
        Ok(addresses) => {
            debug!(destination, count = addresses.len(), "Resolved destination");
            DestinationSet::new(addresses)
        }
        Err(e) => {
            warn!(destination, error = %e, "Destination lookup failed, relying on tool output");
            DestinationSet::default()
        }
    }
}

async fn lookup_ipv4(hostname: &str, timeout: Duration) -> TraceResult<Vec<Ipv4Addr>> {
    let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(|e| {
        TraceError::DnsResolutionFailed {
            hostname: hostname.to_string(),
            source: Box::new(e),
        }
    })?;

    let lookup = tokio::time::timeout(timeout, resolver.lookup_ip(hostname))
        .await
        .map_err(|_| TraceError::ReadTimeout)?
        .map_err(|e| TraceError::DnsResolutionFailed {
            hostname: hostname.to_string(),
            source: Box::new(e),
        })?;

    Ok(lookup
        .iter()
        .filter_map(|ip| match ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .collect())
}

/// Best-effort PTR lookups for hop addresses.
#[derive(Clone)]
pub struct ReverseResolver {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl ReverseResolver {
    /// Creates a resolver from the system configuration, falling back to defaults.
    pub fn from_system_conf(timeout: Duration) -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            debug!(error = %e, "No system resolver configuration, using defaults");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { resolver, timeout }
    }

    /// Looks up the name for `address`. Any failure, including the timeout, yields `None`.
    pub async fn hostname_for(&self, address: &str) -> Option<String> {
        let ip = address.parse::<IpAddr>().ok()?;
        let lookup = match tokio::time::timeout(self.timeout, self.resolver.reverse_lookup(ip)).await
        {
            Ok(Ok(lookup)) => lookup,
            Ok(Err(e)) => {
                trace!(%ip, error = %e, "Reverse lookup failed");
                return None;
            }
            Err(_) => {
                trace!(%ip, "Reverse lookup timed out");
                return None;
            }
        };

        lookup
            .iter()
            .next()
            .map(|name| name.to_string().trim_end_matches('.').to_string())
            .filter(|name| !name.is_empty())
    }

    /// Fills in the hostname of a successful hop that does not have one yet.
    pub async fn enrich(&self, hop: &mut Hop) {
        if !hop.succeeded || !hop.hostname.is_empty() || hop.address.is_empty() {
            return;
        }
        if let Some(name) = self.hostname_for(&hop.address).await {
            hop.hostname = name;
        }
    }

    /// Enriches every hop concurrently, bounded by the slowest lookup's timeout.
    pub async fn enrich_all(&self, hops: &mut [Hop]) {
        join_all(hops.iter_mut().map(|hop| self.enrich(hop))).await;
    }
}

impl std::fmt::Debug for ReverseResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseResolver")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

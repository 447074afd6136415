//! Core types for probing runs.

use crate::tool::ProbeTool;
use crate::TraceError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest per-hop wait the probe tools accept.
pub const MIN_HOP_WAIT: Duration = Duration::from_secs(1);

/// Outcome of probing a single TTL.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hop {
    /// The TTL that was probed.
    pub ttl: u8,
    /// Responding address, empty if nothing answered.
    #[serde(default)]
    pub address: String,
    /// Reverse DNS name, empty if unresolved.
    #[serde(default)]
    pub hostname: String,
    /// Latency of the first probe in milliseconds. Only meaningful when `succeeded`.
    #[serde(rename = "roundTripMs")]
    pub rtt_ms: f64,
    /// Whether any response arrived for this TTL.
    pub succeeded: bool,
    /// Whether this hop is believed to be the destination.
    pub is_final: bool,
    /// Whether the probe went unanswered within the per-hop wait.
    pub timed_out: bool,
}

impl Hop {
    /// A hop that saw no response.
    pub fn timeout(ttl: u8) -> Self {
        Self {
            ttl,
            timed_out: true,
            ..Default::default()
        }
    }

    /// A hop that received a response from `address`.
    pub fn response(ttl: u8, address: impl Into<String>, rtt_ms: f64) -> Self {
        Self {
            ttl,
            address: address.into(),
            rtt_ms,
            succeeded: true,
            ..Default::default()
        }
    }

    /// Sets the reverse DNS name.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }
}

/// Per-run configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Highest TTL to probe.
    pub max_hops: u8,
    /// How long to wait for each hop to answer.
    pub timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_hops: 30,
            timeout: Duration::from_millis(3000),
        }
    }
}

impl RunOptions {
    /// Validates the options.
    pub fn validate(&self) -> Result<(), TraceError> {
        if self.max_hops == 0 {
            return Err(TraceError::InvalidOptions(
                "max_hops must be positive".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(TraceError::InvalidOptions(
                "timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns a copy with the per-hop wait raised to [`MIN_HOP_WAIT`].
    pub fn normalized(&self) -> Self {
        Self {
            max_hops: self.max_hops,
            timeout: self.timeout.max(MIN_HOP_WAIT),
        }
    }

    /// Per-hop wait in whole seconds, rounded up.
    pub fn wait_secs(&self) -> u64 {
        let millis = self.timeout.as_millis() as u64;
        millis.div_ceil(1000).max(1)
    }

    /// Per-hop wait in milliseconds.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    /// Upper bound for a single invocation that probes exactly one TTL.
    pub fn single_probe_deadline(&self, grace: Duration) -> Duration {
        Duration::from_secs(self.wait_secs()) + grace
    }

    /// Upper bound for one invocation that walks every TTL in turn.
    pub fn full_walk_deadline(&self, grace: Duration) -> Duration {
        Duration::from_secs(self.wait_secs() * self.max_hops as u64) + grace
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The hop at `ttl` was the destination.
    Reached { ttl: u8 },
    /// Every TTL up to the hop budget was probed without reaching the destination.
    MaxHopsExhausted,
    /// The caller aborted the run.
    Cancelled,
    /// Probing could not start.
    Failed { reason: String },
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Reached { ttl } => write!(f, "reached destination at hop {}", ttl),
            RunOutcome::MaxHopsExhausted => write!(f, "max hops reached"),
            RunOutcome::Cancelled => write!(f, "cancelled"),
            RunOutcome::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// Which probing strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyPreference {
    /// Parallel when the tool can target a single TTL, sequential otherwise.
    #[default]
    Auto,
    /// One invocation per TTL, all running at once.
    Parallel,
    /// One invocation walking every TTL.
    Sequential,
}

impl std::fmt::Display for StrategyPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyPreference::Auto => write!(f, "auto"),
            StrategyPreference::Parallel => write!(f, "parallel"),
            StrategyPreference::Sequential => write!(f, "sequential"),
        }
    }
}

impl std::str::FromStr for StrategyPreference {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(StrategyPreference::Auto),
            "parallel" => Ok(StrategyPreference::Parallel),
            "sequential" | "serial" => Ok(StrategyPreference::Sequential),
            _ => Err(TraceError::InvalidOptions(format!(
                "unknown strategy: {}",
                s
            ))),
        }
    }
}

/// Engine-wide configuration shared by every run of a [`crate::Tracer`].
#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// Probe tool to invoke. Detected from the platform when unset.
    pub tool: Option<ProbeTool>,
    /// Strategy selection.
    pub strategy: StrategyPreference,
    /// Whether to fill in hostnames with reverse DNS lookups.
    pub reverse_dns: bool,
    /// Bound on each reverse lookup.
    pub reverse_dns_timeout: Duration,
    /// Slack added to every process deadline on top of the per-hop wait.
    pub process_grace: Duration,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            tool: None,
            strategy: StrategyPreference::Auto,
            reverse_dns: true,
            reverse_dns_timeout: Duration::from_secs(1),
            process_grace: Duration::from_millis(500),
        }
    }
}

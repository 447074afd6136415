//! Core traits for probing strategies.

use crate::execution::RunContext;
use crate::{RunOutcome, TraceError};
use async_trait::async_trait;

/// Metadata about a [`ProbeStrategy`] implementation.
#[derive(Debug, Clone, Copy)]
pub struct ProbeStrategyInfo {
    /// Human readable name used in logs.
    pub name: &'static str,
    /// Whether TTLs are probed concurrently.
    pub parallel: bool,
}

/// A way of driving the probe tool through one run.
///
/// Implementations stream hops to `ctx.hops` in ascending TTL order, honour
/// `ctx.cancel` at every await point, and leave no child process behind on any
/// exit path.
#[async_trait]
pub trait ProbeStrategy: Send + Sync {
    /// Returns metadata about this strategy.
    fn info(&self) -> ProbeStrategyInfo;

    /// Probes the destination and reports how the run ended.
    ///
    /// Returns `Err` only for failures that prevented probing altogether.
    async fn run(&self, ctx: &RunContext<'_>) -> Result<RunOutcome, TraceError>;
}

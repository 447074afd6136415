//! Parallel execution.
//!
//! Starts one probe process per TTL, all at once, each restricted to a single
//! probe at exactly that distance. Results are gathered into per-TTL slots,
//! reconciled, and only then emitted in TTL order.

use super::{captured_lines, emit, RunContext};
use crate::collector::Collector;
use crate::parser::{DestinationSet, LineParser};
use crate::resolver::ReverseResolver;
use crate::tool::ProbeTool;
use crate::traits::{ProbeStrategy, ProbeStrategyInfo};
use crate::{Hop, RunOutcome, TraceError, TraceResult};
use async_trait::async_trait;
use futures::future::join_all;
use std::borrow::Cow;
use std::time::Duration;
use tracing::{debug, trace};

/// One process per TTL, reconciled after all of them finish.
#[derive(Debug, Clone)]
pub struct ParallelStrategy {
    tool: ProbeTool,
    parser: LineParser,
    reverse: Option<ReverseResolver>,
    grace: Duration,
}

impl ParallelStrategy {
    /// Creates the strategy. Fails if the tool cannot target a single TTL.
    pub fn new(
        tool: ProbeTool,
        reverse: Option<ReverseResolver>,
        grace: Duration,
    ) -> TraceResult<Self> {
        if !tool.supports_single_ttl() {
            return Err(TraceError::InvalidOptions(format!(
                "{} cannot probe a single TTL; use the sequential strategy",
                tool.display_name()
            )));
        }
        let parser = LineParser::new(tool.flavor())?;
        Ok(Self {
            tool,
            parser,
            reverse,
            grace,
        })
    }

    /// Probes one TTL.
    ///
    /// An unanswered probe, including one that hit its deadline, is a timed-out
    /// hop. `Err` means the tool itself failed for this TTL.
    async fn probe_ttl(&self, ctx: &RunContext<'_>, ttl: u8) -> TraceResult<Hop> {
        let hop = match self.invoke(ctx, ttl).await {
            Ok(hop) => hop,
            Err(TraceError::ProcessTimeout { ttl }) => {
                debug!(ttl, "Probe process hit its deadline, recording timeout");
                Hop::timeout(ttl)
            }
            Err(e) => return Err(e),
        };

        trace!(
            ttl,
            ip = %hop.address,
            rtt_ms = hop.rtt_ms,
            is_final = hop.is_final,
            timed_out = hop.timed_out,
            "Probe finished"
        );
        Ok(hop)
    }

    async fn invoke(&self, ctx: &RunContext<'_>, ttl: u8) -> TraceResult<Hop> {
        let args = self
            .tool
            .single_ttl_args(ctx.destination, ttl, ctx.options)
            .ok_or_else(|| TraceError::Internal("tool lost single-TTL support".into()))?;

        let child = self
            .tool
            .command(&args)
            .spawn()
            .map_err(|source| TraceError::Spawn {
                program: self.tool.display_name(),
                source,
            })?;

        // The child is killed on drop, so hitting the deadline also reaps it.
        let deadline = ctx.options.single_probe_deadline(self.grace);
        let output = tokio::time::timeout(deadline, child.wait_with_output())
            .await
            .map_err(|_| TraceError::ProcessTimeout { ttl })??;

        // macOS prints the header on stderr, Linux on stdout.
        let stderr = captured_lines(&output.stderr);
        let mut lines = stderr.clone();
        lines.extend(captured_lines(&output.stdout));

        let targets = if ctx.targets.is_empty() {
            let announced = lines.iter().find_map(|line| self.parser.parse_header(line));
            match announced {
                Some(addr) => Cow::Owned(DestinationSet::default().with_display(addr)),
                None => Cow::Borrowed(ctx.targets),
            }
        } else {
            Cow::Borrowed(ctx.targets)
        };

        let found = lines
            .iter()
            .filter_map(|line| self.parser.parse(line, &targets))
            .find(|hop| hop.ttl == ttl);

        match found {
            Some(hop) => Ok(hop),
            None if output.status.success() => {
                debug!(ttl, "No hop line in probe output, recording timeout");
                Ok(Hop::timeout(ttl))
            }
            None => Err(TraceError::ToolExited {
                status: output.status.to_string(),
                message: stderr
                    .iter()
                    .map(|line| line.trim())
                    .filter(|line| !line.is_empty() && !self.parser.is_header(line))
                    .collect::<Vec<_>>()
                    .join("; "),
            }),
        }
    }
}

#[async_trait]
impl ProbeStrategy for ParallelStrategy {
    fn info(&self) -> ProbeStrategyInfo {
        ProbeStrategyInfo {
            name: "parallel",
            parallel: true,
        }
    }

    async fn run(&self, ctx: &RunContext<'_>) -> Result<RunOutcome, TraceError> {
        let max_hops = ctx.options.max_hops;
        debug!(
            phase = "probing",
            destination = ctx.destination,
            max_hops,
            "Starting one probe per TTL"
        );

        let probes = (1..=max_hops).map(|ttl| self.probe_ttl(ctx, ttl));

        // Dropping the pending probes on cancellation kills every child.
        let results = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                debug!("Cancelled while probing");
                return Ok(RunOutcome::Cancelled);
            }
            results = join_all(probes) => results,
        };

        let mut collector = Collector::new(max_hops);
        let mut failures = 0usize;
        let mut first_failure = None;
        for (ttl, result) in (1..=max_hops).zip(results) {
            let hop = match result {
                Ok(hop) => hop,
                Err(e) => {
                    debug!(ttl, error = %e, "Probe failed, recording timeout");
                    failures += 1;
                    first_failure.get_or_insert(e);
                    Hop::timeout(ttl)
                }
            };
            collector.record(hop);
        }

        // The tool rejected the run itself, e.g. an unknown host.
        if failures == max_hops as usize {
            if let Some(e) = first_failure {
                return Err(e);
            }
        }

        debug!(phase = "reconciling", probes = collector.filled(), failures, "All probes finished");
        let reconciliation = collector.reconcile(ctx.targets);
        let outcome = reconciliation.outcome();
        let mut hops = reconciliation.hops;

        if let Some(reverse) = &self.reverse {
            debug!(phase = "enriching", hops = hops.len(), "Resolving hop names");
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    debug!("Cancelled while resolving hop names");
                    return Ok(RunOutcome::Cancelled);
                }
                _ = reverse.enrich_all(&mut hops) => {}
            }
        }

        debug!(phase = "emitting", hops = hops.len(), "Emitting hops");
        for hop in hops {
            if !emit(hop, ctx.hops, ctx.cancel).await {
                debug!("Cancelled while emitting");
                return Ok(RunOutcome::Cancelled);
            }
        }

        Ok(outcome)
    }
}

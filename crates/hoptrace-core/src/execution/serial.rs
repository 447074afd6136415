//! Sequential execution.
//!
//! Runs a single tool invocation that walks every TTL in turn and forwards each
//! hop as soon as its line is printed. Used where the tool cannot be limited to
//! one TTL, or when asked for explicitly.

use super::{emit, OutputLines, RunContext};
use crate::parser::{DestinationSet, LineParser};
use crate::resolver::ReverseResolver;
use crate::tool::ProbeTool;
use crate::traits::{ProbeStrategy, ProbeStrategyInfo};
use crate::{RunOutcome, TraceError, TraceResult};
use async_trait::async_trait;
use std::borrow::Cow;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, trace, warn};

/// One long-running process covering every TTL.
#[derive(Debug, Clone)]
pub struct SequentialStrategy {
    tool: ProbeTool,
    parser: LineParser,
    reverse: Option<ReverseResolver>,
    grace: Duration,
}

impl SequentialStrategy {
    /// Creates the strategy.
    pub fn new(
        tool: ProbeTool,
        reverse: Option<ReverseResolver>,
        grace: Duration,
    ) -> TraceResult<Self> {
        let parser = LineParser::new(tool.flavor())?;
        Ok(Self {
            tool,
            parser,
            reverse,
            grace,
        })
    }

    async fn walk(&self, ctx: &RunContext<'_>, child: &mut Child) -> TraceResult<RunOutcome> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TraceError::Internal("probe stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TraceError::Internal("probe stderr not captured".into()))?;
        let mut out = OutputLines::new(stdout);
        let mut err = OutputLines::new(stderr);

        let deadline = tokio::time::sleep(ctx.options.full_walk_deadline(self.grace));
        tokio::pin!(deadline);

        let mut targets = Cow::Borrowed(ctx.targets);
        let mut last_ttl = 0u8;
        let mut emitted = 0usize;
        let mut diagnostics = Vec::new();

        loop {
            let (line, from_stderr) = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    debug!("Cancelled while probing");
                    return Ok(RunOutcome::Cancelled);
                }
                _ = &mut deadline => {
                    warn!(last_ttl, "Probe tool exceeded its deadline, stopping");
                    break;
                }
                line = err.next_line(), if !err.is_done() => match line {
                    Ok(Some(line)) => (line, true),
                    Ok(None) => continue,
                    Err(e) => {
                        trace!(error = %e, "Stopped reading probe stderr");
                        continue;
                    }
                },
                line = out.next_line() => match line {
                    Ok(Some(line)) => (line, false),
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "Failed reading probe output");
                        break;
                    }
                },
            };

            if let Some(addr) = self.parser.parse_header(&line) {
                if targets.is_empty() {
                    debug!(%addr, "Using destination address announced by the tool");
                    targets = Cow::Owned(DestinationSet::default().with_display(addr));
                }
                continue;
            }

            let Some(mut hop) = self.parser.parse(&line, &targets) else {
                if from_stderr {
                    diagnostics.extend(self.diagnostic(&line));
                }
                trace!(line = %line, "Skipping non-hop line");
                continue;
            };

            if hop.ttl <= last_ttl {
                trace!(ttl = hop.ttl, "Ignoring repeated TTL");
                continue;
            }
            last_ttl = hop.ttl;

            if let Some(reverse) = &self.reverse {
                reverse.enrich(&mut hop).await;
            }

            let ttl = hop.ttl;
            let is_final = hop.is_final;
            debug!(ttl, ip = %hop.address, rtt_ms = hop.rtt_ms, is_final, "Hop discovered");
            if !emit(hop, ctx.hops, ctx.cancel).await {
                debug!("Cancelled while emitting");
                return Ok(RunOutcome::Cancelled);
            }
            emitted += 1;

            if is_final {
                return Ok(RunOutcome::Reached { ttl });
            }
            if ttl >= ctx.options.max_hops {
                break;
            }
        }

        if emitted == 0 {
            // stdout can close before the last stderr line has been read.
            let drain = async {
                while let Ok(Some(line)) = err.next_line().await {
                    diagnostics.extend(self.diagnostic(&line));
                }
            };
            if tokio::time::timeout(self.grace, drain).await.is_err() {
                trace!("Probe stderr still open");
            }

            let status = match tokio::time::timeout(self.grace, child.wait()).await {
                Ok(Ok(status)) => status.to_string(),
                Ok(Err(e)) => format!("unknown status: {}", e),
                Err(_) => "still running".to_string(),
            };
            return Err(TraceError::ToolExited {
                status,
                message: diagnostics.join("; "),
            });
        }

        Ok(RunOutcome::MaxHopsExhausted)
    }

    /// A stderr line worth reporting if the tool fails, i.e. not blank and not the banner.
    fn diagnostic(&self, line: &str) -> Option<String> {
        let line = line.trim();
        (!line.is_empty() && !self.parser.is_header(line)).then(|| line.to_string())
    }
}

#[async_trait]
impl ProbeStrategy for SequentialStrategy {
    fn info(&self) -> ProbeStrategyInfo {
        ProbeStrategyInfo {
            name: "sequential",
            parallel: false,
        }
    }

    async fn run(&self, ctx: &RunContext<'_>) -> Result<RunOutcome, TraceError> {
        let args = self.tool.full_walk_args(ctx.destination, ctx.options);
        debug!(
            phase = "probing",
            destination = ctx.destination,
            max_hops = ctx.options.max_hops,
            "Starting sequential probe"
        );

        let mut child = self
            .tool
            .command(&args)
            .spawn()
            .map_err(|source| TraceError::Spawn {
                program: self.tool.display_name(),
                source,
            })?;

        let outcome = self.walk(ctx, &mut child).await;

        // Reap the child on every exit path; it may still be probing past the final hop.
        if let Err(e) = child.start_kill() {
            trace!(error = %e, "Probe process already exited");
        }
        if tokio::time::timeout(self.grace, child.wait()).await.is_err() {
            warn!("Probe process did not exit after kill");
        }

        outcome
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::parser::OutputFlavor;
    use crate::{Hop, RunOptions};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// Fake traceroute. Receives `-n -m MAX -q 1 -w SECS DEST`.
    fn fake_tool(script: &str) -> ProbeTool {
        ProbeTool::new("/bin/sh", OutputFlavor::Unix, true).with_leading_args([
            "-c",
            script,
            "traceroute",
        ])
    }

    fn strategy(script: &str) -> SequentialStrategy {
        SequentialStrategy::new(fake_tool(script), None, Duration::from_millis(500)).unwrap()
    }

    fn options(max_hops: u8) -> RunOptions {
        RunOptions {
            max_hops,
            timeout: Duration::from_secs(1),
        }
    }

    async fn run_strategy(
        strategy: &SequentialStrategy,
        targets: &DestinationSet,
        options: &RunOptions,
    ) -> (Vec<Hop>, TraceResult<RunOutcome>) {
        let (tx, mut rx) = mpsc::channel(options.max_hops as usize);
        let cancel = CancellationToken::new();
        let ctx = RunContext {
            destination: "example.com",
            options,
            targets,
            hops: &tx,
            cancel: &cancel,
        };
        let outcome = strategy.run(&ctx).await;
        drop(tx);

        let mut hops = Vec::new();
        while let Some(hop) = rx.recv().await {
            hops.push(hop);
        }
        (hops, outcome)
    }

    #[tokio::test]
    async fn test_stops_at_final_hop() {
        let script = r#"
echo "traceroute to example.com (93.184.216.34), $3 hops max, 60 byte packets" >&2
echo " 1  192.168.1.1  0.512 ms"
echo " 2  *"
echo " 3  10.0.0.3  4.000 ms"
echo " 4  93.184.216.34  11.250 ms"
exec sleep 30
"#;
        let targets = DestinationSet::new(["93.184.216.34".parse().unwrap()]);

        let started = std::time::Instant::now();
        let (hops, outcome) = run_strategy(&strategy(script), &targets, &options(30)).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome.unwrap(), RunOutcome::Reached { ttl: 4 });
        let ttls: Vec<u8> = hops.iter().map(|h| h.ttl).collect();
        assert_eq!(ttls, vec![1, 2, 3, 4]);
        assert!(hops[1].timed_out);
        assert!(hops[3].is_final);
        assert_eq!(hops.iter().filter(|h| h.is_final).count(), 1);
    }

    #[tokio::test]
    async fn test_header_address_marks_final() {
        let script = r#"
echo "traceroute to example.com (93.184.216.34), $3 hops max, 60 byte packets"
echo " 1  192.168.1.1  0.512 ms"
echo " 2  93.184.216.34  9.000 ms"
"#;
        let (hops, outcome) =
            run_strategy(&strategy(script), &DestinationSet::default(), &options(30)).await;

        assert_eq!(outcome.unwrap(), RunOutcome::Reached { ttl: 2 });
        assert_eq!(hops.len(), 2);
        assert!(hops[1].is_final);
    }

    #[tokio::test]
    async fn test_max_hops_exhausted() {
        let script = r#"
i=1
while [ "$i" -le "$3" ]; do
  echo " $i  *"
  i=$((i + 1))
done
"#;
        let targets = DestinationSet::new(["93.184.216.34".parse().unwrap()]);
        let (hops, outcome) = run_strategy(&strategy(script), &targets, &options(3)).await;

        assert_eq!(outcome.unwrap(), RunOutcome::MaxHopsExhausted);
        let ttls: Vec<u8> = hops.iter().map(|h| h.ttl).collect();
        assert_eq!(ttls, vec![1, 2, 3]);
        assert!(hops.iter().all(|h| h.timed_out));
    }

    #[tokio::test]
    async fn test_skips_noise_and_repeats() {
        let script = r#"
echo "traceroute: Warning: example.com has multiple addresses; using 93.184.216.34" >&2
echo ""
echo " 1  192.168.1.1  0.512 ms"
echo "    MPLS Label=24007 CoS=0 TTL=1 S=1"
echo " 1  192.168.1.1  0.600 ms"
echo " 2  93.184.216.34  9.000 ms"
"#;
        let targets = DestinationSet::new(["93.184.216.34".parse().unwrap()]);
        let (hops, outcome) = run_strategy(&strategy(script), &targets, &options(30)).await;

        assert_eq!(outcome.unwrap(), RunOutcome::Reached { ttl: 2 });
        assert_eq!(hops.len(), 2);
        assert_eq!(hops[0].rtt_ms, 0.512);
    }

    #[tokio::test]
    async fn test_tool_error_without_hops() {
        let script = r#"
echo "traceroute: unknown host nowhere.invalid" >&2
exit 2
"#;
        let (hops, outcome) =
            run_strategy(&strategy(script), &DestinationSet::default(), &options(30)).await;

        assert!(hops.is_empty());
        match outcome.unwrap_err() {
            TraceError::ToolExited { status, message } => {
                assert!(message.contains("unknown host"), "{message}");
                assert!(status.contains('2'), "{status}");
                assert!(!status.contains("still running"), "{status}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_tool_error_after_stdout_closes() {
        // stdout is closed first; the diagnostic arrives on stderr afterwards.
        let script = r#"
exec 1>&-
sleep 0.2
echo "traceroute: unknown host nowhere.invalid" >&2
exit 2
"#;
        let (hops, outcome) =
            run_strategy(&strategy(script), &DestinationSet::default(), &options(30)).await;

        assert!(hops.is_empty());
        match outcome.unwrap_err() {
            TraceError::ToolExited { status, message } => {
                assert!(message.contains("unknown host"), "{message}");
                assert!(!status.contains("still running"), "{status}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_walk() {
        let script = r#"
echo " 1  192.168.1.1  0.512 ms"
exec sleep 30
"#;
        let strategy = strategy(script);
        let targets = DestinationSet::default();
        let opts = options(30);
        let (tx, mut rx) = mpsc::channel(30);
        let cancel = CancellationToken::new();
        let ctx = RunContext {
            destination: "example.com",
            options: &opts,
            targets: &targets,
            hops: &tx,
            cancel: &cancel,
        };

        let run = strategy.run(&ctx);
        tokio::pin!(run);

        // The first hop streams out before the run finishes.
        let first = tokio::select! {
            hop = rx.recv() => hop.unwrap(),
            _ = &mut run => panic!("run finished before streaming"),
        };
        assert_eq!(first.ttl, 1);

        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .expect("cancellation must end the run promptly")
            .unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled);

        // Nothing past the first hop was sent after cancellation.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_program() {
        let tool = ProbeTool::new("/nonexistent/traceroute", OutputFlavor::Unix, true);
        let strategy = SequentialStrategy::new(tool, None, Duration::from_millis(100)).unwrap();
        let (hops, outcome) =
            run_strategy(&strategy, &DestinationSet::default(), &options(3)).await;

        assert!(hops.is_empty());
        assert!(matches!(outcome, Err(TraceError::Spawn { .. })));
    }
}

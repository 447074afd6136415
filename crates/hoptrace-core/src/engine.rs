//! Engine facade.
//!
//! A run moves through resolving, probing, reconciling (parallel only) and
//! emitting before ending in a [`RunOutcome`]. Errors never escape a run: they
//! are classified into the outcome so callers can tell "not reached" from
//! "could not start" without error handling.

use crate::execution::{ParallelStrategy, RunContext, SequentialStrategy};
use crate::resolver::{resolve_destination, ReverseResolver};
use crate::tool::ProbeTool;
use crate::traits::ProbeStrategy;
use crate::{Hop, RunOptions, RunOutcome, StrategyPreference, TraceError, TraceResult, TracerConfig};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// Creates the bounded channel hops are streamed through, sized to the hop budget.
pub fn hop_channel(options: &RunOptions) -> (mpsc::Sender<Hop>, mpsc::Receiver<Hop>) {
    mpsc::channel(options.max_hops.max(1) as usize)
}

/// Runs traces with a fixed engine configuration.
///
/// At most one run started through [`Tracer::start`] is active at a time;
/// starting another cancels the previous one.
#[derive(Debug, Default)]
pub struct Tracer {
    config: TracerConfig,
    current: Mutex<Option<CancellationToken>>,
}

impl Tracer {
    pub fn new(config: TracerConfig) -> Self {
        Self {
            config,
            current: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    /// Traces `destination`, sending hops to `hops` in ascending TTL order.
    ///
    /// The sender is only borrowed and is never closed here. Cancelling
    /// `cancel` ends the run with [`RunOutcome::Cancelled`].
    pub async fn run(
        &self,
        destination: &str,
        options: &RunOptions,
        hops: &mpsc::Sender<Hop>,
        cancel: CancellationToken,
    ) -> RunOutcome {
        execute(&self.config, destination, options, hops, &cancel).await
    }

    /// Starts a supervised run in the background and returns its handle.
    ///
    /// Any run previously started from this tracer is cancelled. Must be called
    /// from within a Tokio runtime.
    pub fn start(&self, destination: impl Into<String>, options: RunOptions) -> RunHandle {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.current.lock().replace(cancel.clone()) {
            if !previous.is_cancelled() {
                debug!("Cancelling previous run");
            }
            previous.cancel();
        }

        let (tx, rx) = hop_channel(&options);
        let config = self.config.clone();
        let destination = destination.into();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            // The sender lives in the task, so the receiver sees the stream end with the run.
            execute(&config, &destination, &options, &tx, &token).await
        });

        RunHandle {
            hops: rx,
            cancel: cancel.clone(),
            task,
            _guard: cancel.drop_guard(),
        }
    }

    /// Cancels the run most recently started with [`Tracer::start`], if any.
    pub fn stop(&self) {
        if let Some(cancel) = self.current.lock().take() {
            debug!("Stopping current run");
            cancel.cancel();
        }
    }
}

/// A run started with [`Tracer::start`].
///
/// Dropping the handle cancels the run.
#[derive(Debug)]
pub struct RunHandle {
    hops: mpsc::Receiver<Hop>,
    cancel: CancellationToken,
    task: JoinHandle<RunOutcome>,
    _guard: DropGuard,
}

impl RunHandle {
    /// Requests cancellation. The outcome becomes [`RunOutcome::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token that cancels this run, e.g. from a signal handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Receives the next hop, or `None` once the run has ended.
    pub async fn recv(&mut self) -> Option<Hop> {
        self.hops.recv().await
    }

    /// Waits for the run to end. Hops not yet received are discarded.
    pub async fn finish(self) -> RunOutcome {
        join(self.task).await
    }

    /// Receives every remaining hop, then waits for the run to end.
    pub async fn collect(mut self) -> (Vec<Hop>, RunOutcome) {
        let mut hops = Vec::new();
        while let Some(hop) = self.hops.recv().await {
            hops.push(hop);
        }
        let outcome = join(self.task).await;
        (hops, outcome)
    }
}

async fn join(task: JoinHandle<RunOutcome>) -> RunOutcome {
    match task.await {
        Ok(outcome) => outcome,
        Err(e) => RunOutcome::Failed {
            reason: format!("run task failed: {}", e),
        },
    }
}

async fn execute(
    config: &TracerConfig,
    destination: &str,
    options: &RunOptions,
    hops: &mpsc::Sender<Hop>,
    cancel: &CancellationToken,
) -> RunOutcome {
    match try_execute(config, destination, options, hops, cancel).await {
        Ok(outcome) => {
            debug!(phase = "terminal", destination, %outcome, "Run finished");
            outcome
        }
        Err(_) if cancel.is_cancelled() => RunOutcome::Cancelled,
        Err(e) => {
            warn!(destination, error = %e, "Run failed");
            RunOutcome::Failed {
                reason: e.to_string(),
            }
        }
    }
}

async fn try_execute(
    config: &TracerConfig,
    destination: &str,
    options: &RunOptions,
    hops: &mpsc::Sender<Hop>,
    cancel: &CancellationToken,
) -> TraceResult<RunOutcome> {
    if cancel.is_cancelled() {
        return Ok(RunOutcome::Cancelled);
    }

    let destination = destination.trim();
    if destination.is_empty() {
        return Err(TraceError::InvalidOptions(
            "destination must not be empty".to_string(),
        ));
    }
    options.validate()?;
    let options = options.normalized();

    let strategy = select_strategy(config)?;
    let strategy_info = strategy.info();
    info!(
        destination,
        strategy = strategy_info.name,
        max_hops = options.max_hops,
        timeout_ms = options.timeout_ms(),
        "Starting trace"
    );

    debug!(phase = "resolving", destination, "Resolving destination");
    let targets = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(RunOutcome::Cancelled),
        targets = resolve_destination(destination, options.timeout) => targets,
    };

    let ctx = RunContext {
        destination,
        options: &options,
        targets: &targets,
        hops,
        cancel,
    };
    strategy.run(&ctx).await
}

/// Picks the strategy for a run. Fails before any probe is issued if the tool is unusable.
fn select_strategy(config: &TracerConfig) -> TraceResult<Box<dyn ProbeStrategy>> {
    let tool = match &config.tool {
        Some(tool) => tool.clone(),
        None => ProbeTool::detect()?,
    };
    tool.ensure_available()?;

    let reverse = config
        .reverse_dns
        .then(|| ReverseResolver::from_system_conf(config.reverse_dns_timeout));
    let grace = config.process_grace;

    match (config.strategy, tool.supports_single_ttl()) {
        (StrategyPreference::Sequential, _) | (StrategyPreference::Auto, false) => {
            Ok(Box::new(SequentialStrategy::new(tool, reverse, grace)?))
        }
        (StrategyPreference::Parallel, false) => Err(TraceError::InvalidOptions(format!(
            "{} cannot probe a single TTL; the parallel strategy is unavailable",
            tool.display_name()
        ))),
        (StrategyPreference::Parallel, true) | (StrategyPreference::Auto, true) => {
            Ok(Box::new(ParallelStrategy::new(tool, reverse, grace)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::OutputFlavor;
    use std::time::Duration;

    fn options(max_hops: u8) -> RunOptions {
        RunOptions {
            max_hops,
            timeout: Duration::from_secs(1),
        }
    }

    fn tracer_with(tool: ProbeTool, strategy: StrategyPreference) -> Tracer {
        Tracer::new(TracerConfig {
            tool: Some(tool),
            strategy,
            reverse_dns: false,
            ..Default::default()
        })
    }

    #[test]
    fn test_hop_channel_capacity() {
        let (tx, _rx) = hop_channel(&options(7));
        assert_eq!(tx.max_capacity(), 7);

        let (tx, _rx) = hop_channel(&options(0));
        assert_eq!(tx.max_capacity(), 1);
    }

    #[test]
    fn test_select_strategy() {
        let single = ProbeTool::new("/bin/sh", OutputFlavor::Unix, true);
        let walk_only = ProbeTool::new("/bin/sh", OutputFlavor::Windows, false);

        let pick = |tool: &ProbeTool, strategy| {
            select_strategy(&TracerConfig {
                tool: Some(tool.clone()),
                strategy,
                reverse_dns: false,
                ..Default::default()
            })
        };

        assert!(pick(&single, StrategyPreference::Auto).unwrap().info().parallel);
        assert!(!pick(&single, StrategyPreference::Sequential).unwrap().info().parallel);
        assert!(!pick(&walk_only, StrategyPreference::Auto).unwrap().info().parallel);

        let err = pick(&walk_only, StrategyPreference::Parallel).err().unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_select_strategy_missing_binary() {
        let tool = ProbeTool::new("/nonexistent/traceroute", OutputFlavor::Unix, true);
        let err = select_strategy(&TracerConfig {
            tool: Some(tool),
            ..Default::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, TraceError::BinaryNotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_binary_fails_without_hops() {
        let tracer = tracer_with(
            ProbeTool::new("/nonexistent/traceroute", OutputFlavor::Unix, true),
            StrategyPreference::Auto,
        );
        let (tx, mut rx) = hop_channel(&options(5));

        let outcome = tracer
            .run("93.184.216.34", &options(5), &tx, CancellationToken::new())
            .await;

        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_options_fail() {
        let tracer = tracer_with(
            ProbeTool::new("/nonexistent/traceroute", OutputFlavor::Unix, true),
            StrategyPreference::Auto,
        );
        let (tx, _rx) = hop_channel(&options(1));

        let outcome = tracer
            .run("93.184.216.34", &options(0), &tx, CancellationToken::new())
            .await;
        match outcome {
            RunOutcome::Failed { reason } => assert!(reason.contains("max_hops"), "{reason}"),
            other => panic!("unexpected outcome: {other}"),
        }

        let outcome = tracer
            .run("  ", &options(3), &tx, CancellationToken::new())
            .await;
        assert!(matches!(outcome, RunOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let tracer = Tracer::default();
        let (tx, _rx) = hop_channel(&options(3));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = tracer.run("93.184.216.34", &options(3), &tx, cancel).await;
        assert_eq!(outcome, RunOutcome::Cancelled);
    }

    #[cfg(unix)]
    mod process {
        use super::*;

        /// Fake traceroute run through `sh -c`.
        fn fake_tool(script: &str) -> ProbeTool {
            ProbeTool::new("/bin/sh", OutputFlavor::Unix, true).with_leading_args([
                "-c",
                script,
                "traceroute",
            ])
        }

        /// Per-TTL script: the destination answers from TTL 6 on, TTL 7, 8 and 10 are silent.
        const PER_TTL: &str = r#"
case "$3" in
  6|9) echo " $3  93.184.216.34  12.500 ms" ;;
  7|8|10) echo " $3  *" ;;
  *) echo " $3  10.0.0.$3  1.$3 ms" ;;
esac
"#;

        #[tokio::test]
        async fn test_parallel_run_reaches_destination() {
            let tracer = tracer_with(fake_tool(PER_TTL), StrategyPreference::Parallel);
            let (tx, mut rx) = hop_channel(&options(10));

            let outcome = tracer
                .run("93.184.216.34", &options(10), &tx, CancellationToken::new())
                .await;
            drop(tx);

            assert_eq!(outcome, RunOutcome::Reached { ttl: 6 });
            let mut hops = Vec::new();
            while let Some(hop) = rx.recv().await {
                hops.push(hop);
            }
            let ttls: Vec<u8> = hops.iter().map(|h| h.ttl).collect();
            assert_eq!(ttls, vec![1, 2, 3, 4, 5, 6]);
            assert!(hops[5].is_final);
            assert_eq!(hops.iter().filter(|h| h.is_final).count(), 1);
        }

        #[tokio::test]
        async fn test_all_timeouts_exhaust_hops() {
            let tracer = tracer_with(fake_tool(r#"echo " $3  *""#), StrategyPreference::Auto);

            let (hops, outcome) = tracer.start("93.184.216.34", options(3)).collect().await;

            assert_eq!(outcome, RunOutcome::MaxHopsExhausted);
            let ttls: Vec<u8> = hops.iter().map(|h| h.ttl).collect();
            assert_eq!(ttls, vec![1, 2, 3]);
            assert!(hops.iter().all(|h| h.timed_out));
        }

        #[tokio::test]
        async fn test_sequential_run_streams_hops() {
            // Sequential invocations receive `-n -m MAX ...`, so $3 is the hop budget.
            let script = r#"
echo " 1  10.0.0.1  1.0 ms"
echo " 2  93.184.216.34  8.0 ms"
echo " 3  93.184.216.34  8.5 ms"
"#;
            let tracer = tracer_with(fake_tool(script), StrategyPreference::Sequential);

            let mut handle = tracer.start("93.184.216.34", options(30));
            let first = handle.recv().await.unwrap();
            assert_eq!(first.ttl, 1);
            let second = handle.recv().await.unwrap();
            assert!(second.is_final);
            assert!(handle.recv().await.is_none());
            assert_eq!(handle.finish().await, RunOutcome::Reached { ttl: 2 });
        }

        #[tokio::test]
        async fn test_rejected_destination_fails_in_both_strategies() {
            let script = r#"
echo "traceroute: unknown host nowhere.invalid" >&2
exit 2
"#;
            for strategy in [StrategyPreference::Auto, StrategyPreference::Sequential] {
                let tracer = tracer_with(fake_tool(script), strategy);
                let (hops, outcome) = tracer.start("93.184.216.34", options(4)).collect().await;

                assert!(hops.is_empty(), "{strategy}");
                match outcome {
                    RunOutcome::Failed { reason } => {
                        assert!(reason.contains("unknown host"), "{strategy}: {reason}");
                    }
                    other => panic!("{strategy}: unexpected outcome: {other}"),
                }
            }
        }

        #[tokio::test]
        async fn test_cancel_running_trace() {
            let tracer = tracer_with(fake_tool("exec sleep 30"), StrategyPreference::Parallel);
            let handle = tracer.start("93.184.216.34", options(5));

            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.cancel();

            let outcome = tokio::time::timeout(Duration::from_secs(1), handle.finish())
                .await
                .expect("cancelled run must finish promptly");
            assert_eq!(outcome, RunOutcome::Cancelled);
        }

        #[tokio::test]
        async fn test_start_replaces_previous_run() {
            let tracer = tracer_with(fake_tool("exec sleep 30"), StrategyPreference::Parallel);
            let first = tracer.start("93.184.216.34", options(3));
            let second = tracer.start("93.184.216.34", options(3));

            let outcome = tokio::time::timeout(Duration::from_secs(1), first.finish())
                .await
                .expect("replaced run must finish promptly");
            assert_eq!(outcome, RunOutcome::Cancelled);

            tracer.stop();
            let outcome = tokio::time::timeout(Duration::from_secs(1), second.finish())
                .await
                .expect("stopped run must finish promptly");
            assert_eq!(outcome, RunOutcome::Cancelled);
        }
    }
}

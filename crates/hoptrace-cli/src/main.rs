//! CLI for hoptrace.

mod output;

use clap::Parser;
use hoptrace_core::{Platform, ProbeTool, RunOptions, StrategyPreference, Tracer, TracerConfig};
use output::OutputFormat;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// hoptrace - trace the network path to a host.
#[derive(Parser, Debug)]
#[command(name = "hoptrace")]
#[command(version)]
#[command(about = "Trace the network path to a host using the system traceroute tool")]
pub struct Args {
    /// Target hostname or IP address.
    #[arg(required = true)]
    pub target: String,

    /// Maximum number of hops to probe.
    #[arg(short = 'm', long = "max-hops", default_value = "30", value_parser = clap::value_parser!(u8).range(1..))]
    pub max_hops: u8,

    /// Wait per hop in milliseconds.
    #[arg(short = 'w', long, default_value = "3000")]
    pub timeout: u64,

    /// Probing strategy (auto, parallel, sequential).
    #[arg(long, default_value = "auto")]
    pub strategy: String,

    /// Path to the traceroute tool, overriding platform detection.
    #[arg(long)]
    pub tool: Option<PathBuf>,

    /// Skip reverse DNS lookups of hop addresses.
    #[arg(long = "no-reverse-dns")]
    pub no_reverse_dns: bool,

    /// Print hops and the outcome as JSON lines.
    #[arg(long)]
    pub json: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Convert CLI args to engine configuration and run options.
    fn to_config(&self) -> Result<(TracerConfig, RunOptions), String> {
        let strategy: StrategyPreference = self
            .strategy
            .parse()
            .map_err(|e| format!("Invalid strategy: {}", e))?;

        let tool = match &self.tool {
            Some(path) => Some(
                ProbeTool::at_path(path, &Platform::current())
                    .map_err(|e| format!("Invalid tool: {}", e))?,
            ),
            None => None,
        };

        let config = TracerConfig {
            tool,
            strategy,
            reverse_dns: !self.no_reverse_dns,
            ..Default::default()
        };
        let options = RunOptions {
            max_hops: self.max_hops,
            timeout: Duration::from_millis(self.timeout),
        };
        Ok((config, options))
    }

    fn format(&self) -> OutputFormat {
        if self.json {
            OutputFormat::Json
        } else {
            OutputFormat::Table
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logs go to stderr so stdout stays parseable.
    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let (config, options) = match args.to_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let format = args.format();

    let tracer = Tracer::new(config);
    tracing::debug!(
        destination = %args.target,
        strategy = %tracer.config().strategy,
        reverse_dns = tracer.config().reverse_dns,
        "Configured trace"
    );

    let mut handle = tracer.start(args.target.clone(), options);

    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        cancel.cancel();
    });

    if format == OutputFormat::Table {
        println!("{}", output::format_banner(&args.target, options.max_hops));
    }

    while let Some(hop) = handle.recv().await {
        match output::render_hop(&hop, format) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("Failed to serialize hop: {}", e),
        }
    }

    let outcome = handle.finish().await;
    match output::render_outcome(&outcome, format) {
        Ok(line) => println!("{}", line),
        Err(e) => eprintln!("Failed to serialize outcome: {}", e),
    }

    ExitCode::from(output::exit_code(&outcome))
}

//! Probing engine for hoptrace.
//!
//! Drives the platform's traceroute tool and turns its output into a stream of
//! hops:
//!
//! - [`Tracer`] and [`RunHandle`] run traces and report a [`RunOutcome`]
//! - [`LineParser`] understands the tool's output
//! - [`ProbeStrategy`] implementations supervise the tool's processes
//! - [`Collector`] reconciles concurrently probed TTLs
//! - [`TraceError`] for error handling

pub mod collector;
pub mod engine;
pub mod error;
pub mod execution;
pub mod parser;
pub mod resolver;
pub mod tool;
pub mod traits;
pub mod types;

pub use collector::{Collector, Reconciliation};
pub use engine::{hop_channel, RunHandle, Tracer};
pub use error::{TraceError, TraceResult};
pub use parser::{DestinationSet, LineParser, OutputFlavor};
pub use resolver::{resolve_destination, ReverseResolver};
pub use tool::{Platform, ProbeTool};
pub use traits::{ProbeStrategy, ProbeStrategyInfo};
pub use types::{Hop, RunOptions, RunOutcome, StrategyPreference, TracerConfig, MIN_HOP_WAIT};

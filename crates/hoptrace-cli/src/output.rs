//! Rendering of hops and outcomes for the terminal.

use hoptrace_core::{Hop, RunOutcome};

/// How results are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// traceroute-style rows.
    Table,
    /// One JSON object per line.
    Json,
}

/// Banner printed before the first hop in table mode.
pub fn format_banner(target: &str, max_hops: u8) -> String {
    format!("hoptrace to {}, {} hops max", target, max_hops)
}

/// Formats a hop as a traceroute-style row.
pub fn format_hop(hop: &Hop) -> String {
    if !hop.succeeded {
        return format!("{:>2}  *", hop.ttl);
    }

    let who = if hop.hostname.is_empty() {
        hop.address.clone()
    } else {
        format!("{} ({})", hop.hostname, hop.address)
    };
    let mut row = format!("{:>2}  {}  {:.3} ms", hop.ttl, who, hop.rtt_ms);
    if hop.is_final {
        row.push_str("  [destination]");
    }
    row
}

/// Formats the final line of a run.
pub fn format_outcome(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Reached { ttl } => format!("Destination reached in {} hops", ttl),
        RunOutcome::MaxHopsExhausted => "Destination not reached within the hop limit".to_string(),
        RunOutcome::Cancelled => "Trace cancelled".to_string(),
        RunOutcome::Failed { reason } => format!("Trace failed: {}", reason),
    }
}

/// Renders a hop in `format`.
pub fn render_hop(hop: &Hop, format: OutputFormat) -> Result<String, serde_json::Error> {
    match format {
        OutputFormat::Table => Ok(format_hop(hop)),
        OutputFormat::Json => serde_json::to_string(hop),
    }
}

/// Renders the outcome in `format`.
pub fn render_outcome(outcome: &RunOutcome, format: OutputFormat) -> Result<String, serde_json::Error> {
    match format {
        OutputFormat::Table => Ok(format_outcome(outcome)),
        OutputFormat::Json => serde_json::to_string(outcome),
    }
}

/// Process exit code for an outcome.
pub fn exit_code(outcome: &RunOutcome) -> u8 {
    match outcome {
        RunOutcome::Reached { .. } => 0,
        RunOutcome::Failed { .. } => 1,
        RunOutcome::MaxHopsExhausted => 2,
        RunOutcome::Cancelled => 130,
    }
}

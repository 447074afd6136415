//! Execution strategies for a run.
//!
//! Provides both parallel (one process per TTL) and sequential (one process
//! walking every TTL) strategies.

pub mod parallel;
pub mod serial;

pub use parallel::ParallelStrategy;
pub use serial::SequentialStrategy;

use crate::parser::DestinationSet;
use crate::{Hop, RunOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Everything a strategy needs for one run.
#[derive(Debug)]
pub struct RunContext<'a> {
    /// Destination exactly as the caller gave it.
    pub destination: &'a str,
    /// Normalized run options.
    pub options: &'a RunOptions,
    /// Addresses that identify the destination.
    pub targets: &'a DestinationSet,
    /// Where discovered hops go.
    pub hops: &'a mpsc::Sender<Hop>,
    /// Aborts the run.
    pub cancel: &'a CancellationToken,
}

/// Hands a hop to the caller. Returns false if the run was cancelled while
/// waiting or the receiving side is gone.
pub(crate) async fn emit(hop: Hop, hops: &mpsc::Sender<Hop>, cancel: &CancellationToken) -> bool {
    let ttl = hop.ttl;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = hops.send(hop) => {
            if sent.is_err() {
                trace!(ttl, "Hop receiver dropped");
            }
            sent.is_ok()
        }
    }
}

/// Reads a child's output line by line, tolerating invalid UTF-8.
///
/// `next_line` is cancel safe: a partially read line stays buffered and is
/// completed by the next call.
pub(crate) struct OutputLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    done: bool,
}

impl<R: AsyncRead + Unpin> OutputLines<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
            done: false,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    /// Returns the next line without its terminator, or `None` at end of stream.
    pub(crate) async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        if self.done {
            return Ok(None);
        }

        let read = self.reader.read_until(b'\n', &mut self.buf).await;
        let n = match read {
            Ok(n) => n,
            Err(e) => {
                self.done = true;
                return Err(e);
            }
        };
        if n == 0 && self.buf.is_empty() {
            self.done = true;
            return Ok(None);
        }

        let line = String::from_utf8_lossy(&self.buf)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        self.buf.clear();
        Ok(Some(line))
    }
}

/// Splits captured output into lines, tolerating invalid UTF-8.
pub(crate) fn captured_lines(output: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(output)
        .lines()
        .map(|line| line.trim_end_matches('\r').to_string())
        .collect()
}

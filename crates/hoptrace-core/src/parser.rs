//! Parsing of probe tool output.
//!
//! The system traceroute tools print one line per hop in loosely specified,
//! platform dependent formats. Parsing is best effort: any line that does not
//! look like a hop is reported as "not a data line" and skipped by the caller.
//!
//! Unix (`traceroute -n -q 1`):
//!
//! ```text
//!  1  192.168.1.1  3.224 ms
//!  1  router.local (192.168.1.1)  3.224 ms
//!  2  *
//! ```
//!
//! Windows (`tracert -d`):
//!
//! ```text
//!   1    <1 ms    <1 ms    <1 ms  192.168.1.1
//!   2     *        *        *     Request timed out.
//! ```

use crate::{Hop, TraceResult};
use regex::Regex;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

const IPV4: &str = r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}";

/// Output dialect of the probe tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFlavor {
    /// BSD/Linux `traceroute`.
    Unix,
    /// Windows `tracert`.
    Windows,
}

/// Addresses that identify the destination of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationSet {
    display: Option<Ipv4Addr>,
    addresses: BTreeSet<Ipv4Addr>,
}

impl DestinationSet {
    /// Creates a set from resolved addresses. The first one becomes the display address.
    pub fn new(addresses: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        let mut display = None;
        let addresses = addresses
            .into_iter()
            .inspect(|addr| {
                display.get_or_insert(*addr);
            })
            .collect();
        Self { display, addresses }
    }

    /// Sets the address reported by the tool itself, e.g. from its header line.
    pub fn with_display(mut self, addr: Ipv4Addr) -> Self {
        self.display = Some(addr);
        self
    }

    /// The single address shown for the destination, if known.
    pub fn display(&self) -> Option<Ipv4Addr> {
        self.display
    }

    /// Iterates over the resolved addresses.
    pub fn addresses(&self) -> impl Iterator<Item = &Ipv4Addr> {
        self.addresses.iter()
    }

    /// Returns true if nothing identifies the destination yet.
    pub fn is_empty(&self) -> bool {
        self.display.is_none() && self.addresses.is_empty()
    }

    /// Returns true if `address` belongs to the destination.
    pub fn contains(&self, address: &str) -> bool {
        match address.trim().parse::<Ipv4Addr>() {
            Ok(addr) => self.addresses.contains(&addr) || self.display == Some(addr),
            Err(_) => false,
        }
    }
}

/// Translates tool output lines into [`Hop`] values.
#[derive(Debug, Clone)]
pub struct LineParser {
    flavor: OutputFlavor,
    hop: Regex,
    timeout: Regex,
    rtt: Regex,
    header: Regex,
}

impl LineParser {
    /// Creates a parser for the given output flavor.
    pub fn new(flavor: OutputFlavor) -> TraceResult<Self> {
        let hop = match flavor {
            // TTL, optional leading lost probes, then `name (ip)` or a bare ip, then the RTT.
            OutputFlavor::Unix => format!(
                r"^\s*(\d+)\s+(?:\*\s+)*(?:(\S+)\s+\(({ip})\)|({ip}))\s+(\d+(?:\.\d+)?)\s+ms",
                ip = IPV4
            ),
            // TTL, one to three probe columns, then `name [ip]` or a bare address.
            OutputFlavor::Windows => format!(
                r"^\s*(\d+)\s+((?:(?:<?\d+\s*ms|\*)\s+){{1,3}})(?:(\S+)\s+\[({ip})\]|({ip}))\s*$",
                ip = IPV4
            ),
        };

        Ok(Self {
            flavor,
            hop: Regex::new(&hop)?,
            timeout: Regex::new(r"^\s*(\d+)\s+\*")?,
            rtt: Regex::new(r"<?(\d+(?:\.\d+)?)\s*ms")?,
            header: Regex::new(&format!(
                r"^\s*(?:traceroute to|Tracing route to)\s+(\S+?),?(?:\s+[\(\[]({ip})[\)\]])?(?:[,\s]|$)",
                ip = IPV4
            ))?,
        })
    }

    /// The output flavor this parser understands.
    pub fn flavor(&self) -> OutputFlavor {
        self.flavor
    }

    /// Parses one line. Returns `None` for anything that is not a hop line.
    ///
    /// A line that carries an address and an RTT is a hop even if some of its
    /// probes were lost; the timeout shape only applies when nothing answered.
    pub fn parse(&self, line: &str, destination: &DestinationSet) -> Option<Hop> {
        let line = line.trim_end();
        if line.trim().is_empty() {
            return None;
        }

        let hop = match self.flavor {
            OutputFlavor::Unix => self.parse_unix(line),
            OutputFlavor::Windows => self.parse_windows(line),
        };

        let mut hop = match hop {
            Some(hop) => hop,
            None => {
                let caps = self.timeout.captures(line)?;
                let ttl = parse_ttl(&caps[1])?;
                return Some(Hop::timeout(ttl));
            }
        };

        hop.is_final = destination.contains(&hop.address);
        Some(hop)
    }

    /// Extracts the destination address announced in a header line.
    pub fn parse_header(&self, line: &str) -> Option<Ipv4Addr> {
        let caps = self.header.captures(line)?;
        caps.get(2)
            .or_else(|| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    /// Returns true if the line is a header rather than a hop or noise.
    pub fn is_header(&self, line: &str) -> bool {
        self.header.is_match(line)
    }

    fn parse_unix(&self, line: &str) -> Option<Hop> {
        let caps = self.hop.captures(line)?;
        let ttl = parse_ttl(&caps[1])?;
        let (hostname, address) = match (caps.get(2), caps.get(3)) {
            (Some(name), Some(ip)) => (name.as_str(), ip.as_str()),
            _ => ("", caps.get(4)?.as_str()),
        };
        let rtt_ms = caps[5].parse::<f64>().ok()?;

        let hostname = hostname_or_empty(hostname, address);
        Some(Hop::response(ttl, address, rtt_ms).with_hostname(hostname))
    }

    fn parse_windows(&self, line: &str) -> Option<Hop> {
        let caps = self.hop.captures(line)?;
        let ttl = parse_ttl(&caps[1])?;
        let (hostname, address) = match (caps.get(3), caps.get(4)) {
            (Some(name), Some(ip)) => (name.as_str(), ip.as_str()),
            _ => ("", caps.get(5)?.as_str()),
        };
        let rtt_ms = self
            .rtt
            .captures(&caps[2])
            .and_then(|rtt| rtt[1].parse::<f64>().ok())
            .unwrap_or(0.0);

        let hostname = hostname_or_empty(hostname, address);
        Some(Hop::response(ttl, address, rtt_ms).with_hostname(hostname))
    }
}

fn parse_ttl(raw: &str) -> Option<u8> {
    raw.parse::<u8>().ok().filter(|ttl| *ttl > 0)
}

/// Tools without a PTR record print the address in place of the name.
fn hostname_or_empty<'a>(hostname: &'a str, address: &str) -> &'a str {
    if hostname == address {
        ""
    } else {
        hostname
    }
}

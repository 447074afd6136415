//! The external probing utility.
//!
//! Packet emission and socket privileges are delegated to the platform's
//! traceroute tool, which is installed setuid (Unix) or runs unprivileged
//! (Windows `tracert`). This module locates it and builds its command lines.

use crate::parser::OutputFlavor;
use crate::{RunOptions, TraceError, TraceResult};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

const MACOS_TRACEROUTE: &str = "/usr/sbin/traceroute";
const LINUX_TRACEROUTE: &str = "/usr/bin/traceroute";
const WINDOWS_TRACERT: &str = r"C:\Windows\System32\tracert.exe";

/// Operating system the engine runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
    Other(String),
}

impl Platform {
    /// The platform this binary was built for.
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => Platform::Linux,
            "macos" => Platform::MacOs,
            "windows" => Platform::Windows,
            other => Platform::Other(other.to_string()),
        }
    }

    /// Output dialect of the platform's probe tool.
    pub fn flavor(&self) -> TraceResult<OutputFlavor> {
        match self {
            Platform::Linux | Platform::MacOs => Ok(OutputFlavor::Unix),
            Platform::Windows => Ok(OutputFlavor::Windows),
            Platform::Other(name) => Err(TraceError::UnsupportedPlatform(name.clone())),
        }
    }
}

/// An invocable probe tool and what it can do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTool {
    program: PathBuf,
    leading_args: Vec<String>,
    flavor: OutputFlavor,
    supports_single_ttl: bool,
}

impl ProbeTool {
    /// Creates a tool description.
    pub fn new(program: impl Into<PathBuf>, flavor: OutputFlavor, supports_single_ttl: bool) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            flavor,
            supports_single_ttl,
        }
    }

    /// Arguments placed before the generated ones, for wrappers around the real tool.
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Locates the probe tool for the current platform.
    pub fn detect() -> TraceResult<Self> {
        Self::for_platform(&Platform::current())
    }

    /// Locates the probe tool for `platform`.
    pub fn for_platform(platform: &Platform) -> TraceResult<Self> {
        match platform {
            Platform::MacOs => {
                let program = existing(MACOS_TRACEROUTE)
                    .or_else(|| find_in_path("traceroute"))
                    .ok_or_else(|| TraceError::BinaryNotFound(MACOS_TRACEROUTE.to_string()))?;
                Ok(Self::new(program, OutputFlavor::Unix, true))
            }
            Platform::Linux => {
                let program = existing(LINUX_TRACEROUTE)
                    .or_else(|| find_in_path("traceroute"))
                    .ok_or_else(|| {
                        TraceError::BinaryNotFound(
                            "traceroute; install the traceroute or inetutils-traceroute package"
                                .to_string(),
                        )
                    })?;
                Ok(Self::new(program, OutputFlavor::Unix, true))
            }
            Platform::Windows => {
                let program = existing(WINDOWS_TRACERT)
                    .or_else(|| find_in_path("tracert.exe"))
                    .ok_or_else(|| TraceError::BinaryNotFound("tracert.exe".to_string()))?;
                Ok(Self::new(program, OutputFlavor::Windows, false))
            }
            Platform::Other(name) => Err(TraceError::UnsupportedPlatform(name.clone())),
        }
    }

    /// A user supplied tool that speaks the platform's dialect.
    pub fn at_path(program: impl Into<PathBuf>, platform: &Platform) -> TraceResult<Self> {
        let flavor = platform.flavor()?;
        Ok(Self::new(program, flavor, flavor == OutputFlavor::Unix))
    }

    pub fn flavor(&self) -> OutputFlavor {
        self.flavor
    }

    /// Whether one invocation can be restricted to exactly one TTL.
    pub fn supports_single_ttl(&self) -> bool {
        self.supports_single_ttl
    }

    /// Checks that the program can be launched.
    pub fn ensure_available(&self) -> TraceResult<()> {
        let found = if self.program.components().count() > 1 {
            self.program.is_file()
        } else {
            self.program
                .to_str()
                .and_then(find_in_path)
                .is_some()
        };

        if found {
            Ok(())
        } else {
            Err(TraceError::BinaryNotFound(
                self.program.display().to_string(),
            ))
        }
    }

    /// Arguments for one invocation that sends a single probe at exactly `ttl`.
    ///
    /// Returns `None` if the tool cannot target a single TTL.
    pub fn single_ttl_args(&self, destination: &str, ttl: u8, options: &RunOptions) -> Option<Vec<String>> {
        if !self.supports_single_ttl || self.flavor != OutputFlavor::Unix {
            return None;
        }
        Some(vec![
            "-n".to_string(),
            "-f".to_string(),
            ttl.to_string(),
            "-m".to_string(),
            ttl.to_string(),
            "-q".to_string(),
            "1".to_string(),
            "-w".to_string(),
            options.wait_secs().to_string(),
            destination.to_string(),
        ])
    }

    /// Arguments for one invocation that walks TTL 1 through `max_hops`.
    pub fn full_walk_args(&self, destination: &str, options: &RunOptions) -> Vec<String> {
        match self.flavor {
            OutputFlavor::Unix => vec![
                "-n".to_string(),
                "-m".to_string(),
                options.max_hops.to_string(),
                "-q".to_string(),
                "1".to_string(),
                "-w".to_string(),
                options.wait_secs().to_string(),
                destination.to_string(),
            ],
            OutputFlavor::Windows => vec![
                "-d".to_string(),
                "-h".to_string(),
                options.max_hops.to_string(),
                "-w".to_string(),
                options.timeout_ms().to_string(),
                destination.to_string(),
            ],
        }
    }

    /// Builds the command for `args`. Output is piped and the child is killed when dropped.
    pub fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Human readable program name for logs and errors.
    pub fn display_name(&self) -> String {
        self.program.display().to_string()
    }
}

fn existing(path: &str) -> Option<PathBuf> {
    let path = PathBuf::from(path);
    path.is_file().then_some(path)
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

//! System statistics for plugins, read from the first source that can provide them.
//!
//! The chain asks the external `crossbar` command line tool first, then reads the system directly, and finally
//! falls back to [`SENTINEL`]. Reading a stat never fails.

use std::{
    io::Read,
    process::{Command, Stdio},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use wait_timeout::ChildExt;

use crate::config::HostConfig;

pub mod system_stats;

pub use system_stats::SystemStats;

/// Value reported for a stat that no source could provide.
pub const SENTINEL: &str = "N/A";

/// How long the `crossbar` command line tool may take to answer.
pub const CLI_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumString, strum::Display, strum::AsRefStr, clap::ValueEnum)]
#[strum(serialize_all = "lowercase")]
pub enum Stat {
    /// Battery charge in percent.
    Battery,
    /// Overall CPU usage in percent.
    Cpu,
    /// Used memory in percent.
    Memory,
    /// Local time of day.
    Time,
}

/// Something that can read system statistics.
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    fn read(&self, stat: Stat) -> Result<String>;
}

/// The `crossbar` command line tool, called as `crossbar --<stat>`.
#[derive(Debug, Clone)]
pub struct CrossbarCli {
    binary: String,
    timeout: Duration,
}

impl CrossbarCli {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        CrossbarCli { binary: binary.into(), timeout }
    }
}

impl DataSource for CrossbarCli {
    fn name(&self) -> &str {
        &self.binary
    }

    fn read(&self, stat: Stat) -> Result<String> {
        let mut child = Command::new(&self.binary)
            .arg(format!("--{}", stat))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to run {}", self.binary))?;

        let Some(status) = child.wait_timeout(self.timeout)? else {
            let _ = child.kill();
            let _ = child.wait();
            bail!("{} did not answer within {:?}", self.binary, self.timeout);
        };
        if !status.success() {
            bail!("{} --{} exited with {}", self.binary, stat, status);
        }

        let mut output = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            stdout.read_to_string(&mut output).context("Failed to read output")?;
        }
        let value = output.trim().trim_end_matches('%').to_string();
        if value.is_empty() {
            bail!("{} --{} printed nothing", self.binary, stat);
        }
        Ok(value)
    }
}

/// Sources asked in order. The first one that answers wins.
pub struct FallbackChain {
    sources: Vec<Box<dyn DataSource>>,
}

impl FallbackChain {
    pub fn new(sources: Vec<Box<dyn DataSource>>) -> Self {
        FallbackChain { sources }
    }

    /// The `crossbar` command line tool (unless disabled in the configuration), then the system itself.
    pub fn from_config(config: &HostConfig) -> Self {
        let mut sources: Vec<Box<dyn DataSource>> = Vec::new();
        if let Some(binary) = &config.crossbar_binary {
            sources.push(Box::new(CrossbarCli::new(binary.clone(), CLI_TIMEOUT)));
        }
        sources.push(Box::new(SystemStats::default()));
        FallbackChain::new(sources)
    }

    pub fn read(&self, stat: Stat) -> String {
        for source in &self.sources {
            match source.read(stat) {
                Ok(value) => return value,
                Err(err) => log::debug!("{} could not provide {}: {:#}", source.name(), stat, err),
            }
        }
        log::info!("No source could provide {}", stat);
        SENTINEL.to_string()
    }
}

//! Command-line surface (§6, §10.3): what to capture, how to render it, and
//! where to send the result.

use std::path::PathBuf;

use clap::Clap;
use thiserror::Error;

use crate::shell;

/// Raised by a `FromStr` impl used as a `clap` value parser (currently only
/// [`shell::ColorMode`]) when the given string doesn't match any variant.
#[derive(Debug, Error)]
#[error("invalid value {value:?} for {kind}")]
pub struct ParseFailure {
    kind: String,
    value: String,
}

impl ParseFailure {
    #[must_use]
    pub fn new(kind: String, value: String) -> Self {
        Self { kind, value }
    }
}

/// What to render a capture as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintMode {
    Capture,
    Summary,
    Digest,
}

impl std::str::FromStr for PrintMode {
    type Err = ParseFailure;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "capture" => Ok(Self::Capture),
            "summary" => Ok(Self::Summary),
            "digest" => Ok(Self::Digest),
            _ => Err(ParseFailure::new("print mode".to_string(), s.to_owned())),
        }
    }
}

/// Output encoding for a rendered summary/digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Csv,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = ParseFailure;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            _ => Err(ParseFailure::new("output format".to_string(), s.to_owned())),
        }
    }
}

/// Full set of CLI options, including the shell's global flags.
#[derive(Clap, Clone)]
#[clap(name = "mem", version, about = "Per-host memory telemetry engine")]
pub struct Opts {
    #[clap(flatten)]
    pub shell: shell::Options,

    /// What to capture and render: `capture`, `summary`, or `digest`.
    #[clap(long = "print", default_value = "summary")]
    pub print: PrintMode,

    /// Output encoding: `text`, `csv`, or `json`.
    #[clap(long = "output", default_value = "text")]
    pub output: OutputFormat,

    /// Repeat the capture/render this many times, once per high-water poll
    /// interval, instead of running once and exiting. Omit to run once.
    #[clap(long = "repeat")]
    pub repeat: Option<u64>,

    /// Narrow a `summary`/`digest` render to a single process koid.
    #[clap(long = "pid")]
    pub pid: Option<u64>,

    /// Path to a JSON bucket-rule file (§6). Falls back to the built-in
    /// default rule list when omitted.
    #[clap(long = "rules")]
    pub rules: Option<PathBuf>,

    /// Run the persistent sampler (high-water tracker + pressure logger)
    /// instead of performing a single one-shot capture and exiting.
    #[clap(long = "daemon")]
    pub daemon: bool,

    /// Directory the high-water tracker reads/writes `latest.txt` and
    /// `previous.txt` in. Only used in `--daemon` mode.
    #[clap(long = "high-water-dir", default_value = "/tmp/mem-high-water")]
    pub high_water_dir: PathBuf,

    /// How often the high-water tracker polls kernel memory stats.
    #[clap(long = "high-water-poll-interval", default_value = "10s")]
    pub high_water_poll_interval: humantime::Duration,

    /// Minimum drop in free memory, in bytes, required to trigger a new
    /// high-water recording.
    #[clap(long = "high-water-threshold-bytes", default_value = "1048576")]
    pub high_water_threshold_bytes: u64,

    /// How often the watcher fan-out samples kernel memory stats and the
    /// pressure level. Only used in `--daemon` mode.
    #[clap(long = "watcher-poll-interval", default_value = "1s")]
    pub watcher_poll_interval: humantime::Duration,
}

/// Parses `std::env::args`, exiting the process on `--help`/`--version` or a
/// parse failure, per `clap`'s default behavior.
#[must_use]
pub fn load() -> Opts {
    Opts::parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn print_mode_parses_known_values() {
        assert_eq!(PrintMode::from_str("capture").unwrap(), PrintMode::Capture);
        assert_eq!(PrintMode::from_str("Summary").unwrap(), PrintMode::Summary);
        assert!(PrintMode::from_str("bogus").is_err());
    }

    #[test]
    fn output_format_parses_known_values() {
        assert_eq!(OutputFormat::from_str("csv").unwrap(), OutputFormat::Csv);
        assert!(OutputFormat::from_str("xml").is_err());
    }
}

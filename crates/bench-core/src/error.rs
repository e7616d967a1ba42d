//! Error types shared by the benchmark crates.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for benchmark operations
pub type Result<T> = std::result::Result<T, BenchError>;

/// Errors raised while configuring, running or collecting a benchmark sweep.
///
/// None of these are retried. Config and format errors abort before the
/// first sweep point; remote-call errors abort the whole sweep; parse errors
/// abort the collection phase of the current sweep point.
#[derive(Debug, Error)]
pub enum BenchError {
    /// Missing, malformed or insecurely permissioned config or secrets file
    #[error("config error ({path}): {reason}")]
    Config { path: PathBuf, reason: String },

    /// Malformed compressed node-list specification
    #[error("node list format error in '{spec}': {reason}")]
    Format { spec: String, reason: String },

    /// Transport failure or non-success answer from a remote service
    #[error("remote call to {endpoint} failed: {reason}")]
    RemoteCall { endpoint: String, reason: String },

    /// Unexpected shape of scheduler accounting output or a persisted table
    #[error("parse error in {what}: {reason}")]
    Parse { what: String, reason: String },

    /// A bounded wait expired
    #[error("timed out after {secs:.1}s waiting for {what}")]
    Timeout { what: String, secs: f64 },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

impl BenchError {
    pub fn config(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Config {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn format(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Format {
            spec: spec.into(),
            reason: reason.into(),
        }
    }

    pub fn remote(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        Self::RemoteCall {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    pub fn parse(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            what: what.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Short machine-readable code used by the CLI's JSON error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config_error",
            Self::Format { .. } => "format_error",
            Self::RemoteCall { .. } => "remote_call_error",
            Self::Parse { .. } => "parse_error",
            Self::Timeout { .. } => "timeout",
            Self::Io { .. } => "io_error",
            Self::Yaml { .. } => "yaml_error",
        }
    }
}

//! Error taxonomy for the bridge.
//!
//! Request validation never reaches the subprocess layer; everything that can go wrong
//! once a job exists is a [`JobError`]. Parse failures are not errors here: they are
//! recovered by the resolver and recorded on the result.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Bad or missing request fields (HTTP 400).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error("Ticker must not be empty")]
    EmptyTicker,
    #[error("Invalid horizon '{0}'. Must be one of: short, medium, long")]
    InvalidHorizon(String),
    #[error("Invalid risk_profile '{0}'. Must be one of: conservative, moderate, aggressive")]
    InvalidRiskProfile(String),
    #[error("Invalid request body: {0}")]
    MalformedBody(String),
}

/// The analysis program could not be started.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Analysis script not found at {}", .0.display())]
    ScriptNotFound(PathBuf),
    #[error("No usable interpreter found (tried '{0}')")]
    ExecutableNotFound(String),
    #[error("Failed to spawn analysis process: {0}")]
    Spawn(#[source] std::io::Error),
}

/// A job that did not produce a result.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("Analysis failed: {message}")]
    ProcessExit { code: Option<i32>, message: String },
    #[error("Analysis timed out after {} minutes", .limit.as_secs() / 60)]
    Timeout { limit: Duration },
    #[error("I/O error while reading analysis output: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Launch(_) => "launch",
            JobError::ProcessExit { .. } => "exit",
            JobError::Timeout { .. } => "timeout",
            JobError::Io(_) => "io",
        }
    }

    /// Debug rendering with the source chain, only exposed in dev mode.
    pub fn detail(&self) -> String {
        let mut out = format!("{self:?}");
        let mut src = std::error::Error::source(self);
        while let Some(e) = src {
            out.push_str("\ncaused by: ");
            out.push_str(&e.to_string());
            src = e.source();
        }
        out
    }
}

/// The streaming transport can no longer be written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("stream transport closed")]
    Closed,
}

//! Top-level error taxonomy.
//!
//! Every failure is fatal to the current invocation. Each variant belongs to
//! exactly one pipeline stage so the user sees a single diagnostic naming
//! where things went wrong.

use crate::config::ConfigError;
use crate::request::RequestError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShellmandoError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The backend is down and nothing can bring it up.
    #[error("LLM backend not reachable at {host}: {reason}")]
    BackendUnavailable { host: String, reason: String },

    /// The starter executable could not be spawned at all.
    #[error("failed to launch starter {}: {source}", starter.display())]
    StarterLaunchFailed {
        starter: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The starter ran but the backend never became healthy in time.
    #[error(
        "LLM backend at {host} did not become healthy within {seconds}s after launching starter {}",
        starter.display()
    )]
    BackendStartupTimeout {
        host: String,
        starter: PathBuf,
        seconds: u64,
    },

    #[error("interrupted while waiting for the LLM backend at {host}")]
    StartupCancelled { host: String },

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("{context}: {source}")]
    Output {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ShellmandoError {
    /// The pipeline stage that produced this error.
    pub fn stage(&self) -> &'static str {
        match self {
            ShellmandoError::Config(_) => "config",
            ShellmandoError::BackendUnavailable { .. }
            | ShellmandoError::StarterLaunchFailed { .. }
            | ShellmandoError::BackendStartupTimeout { .. }
            | ShellmandoError::StartupCancelled { .. } => "backend",
            ShellmandoError::Request(_) => "request",
            ShellmandoError::Output { .. } => "output",
        }
    }

    pub(crate) fn output(context: impl Into<String>, source: std::io::Error) -> Self {
        ShellmandoError::Output {
            context: context.into(),
            source,
        }
    }
}

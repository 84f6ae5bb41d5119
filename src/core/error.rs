//! Error taxonomy for live-event handling and job assembly.
//!
//! Every variant of [`LiveError`] is fatal to a single event only. Callers log
//! and drop; session state is never left half-updated because all preconditions
//! are validated before anything is mutated.

use std::time::Duration;

use thiserror::Error;

use crate::results::ResultKey;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LiveError {
    /// Envelope or inner JSON payload could not be decoded.
    #[error("malformed live message: {0}")]
    Decode(String),

    /// The results store has nothing under the composite key.
    #[error("no result stored under {0}")]
    Lookup(ResultKey),

    /// Result metadata violates the upstream job contract.
    #[error("result {key} violates the job contract: {reason}")]
    Schema { key: String, reason: String },

    /// The fetch did not complete within the configured bound.
    #[error("fetch of {key} timed out after {after:?}")]
    Timeout { key: ResultKey, after: Duration },

    /// The store was reachable but the payload or I/O failed.
    #[error("results store failure: {0}")]
    Store(String),
}

impl LiveError {
    pub fn schema(key: impl ToString, reason: impl Into<String>) -> Self {
        LiveError::Schema {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Short machine-friendly label used in logs and session counters.
    pub fn kind(&self) -> &'static str {
        match self {
            LiveError::Decode(_) => "decode",
            LiveError::Lookup(_) => "lookup",
            LiveError::Schema { .. } => "schema",
            LiveError::Timeout { .. } => "timeout",
            LiveError::Store(_) => "store",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobError {
    /// The parameter tree reported an input error; submission must be blocked.
    #[error("model parameters contain input errors")]
    InvalidParameters,

    #[error("invalid results url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("flow '{flow}' requires '{field}'")]
    MissingField { flow: &'static str, field: &'static str },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("environment variable {var} is not valid: {reason}")]
    Env { var: &'static str, reason: String },
}

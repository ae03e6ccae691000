use std::time::Duration;

use thiserror::Error;

/// Errors raised by a VM provider (the vSphere client or the in-memory fake).
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("couldn't find VM folder at {0}")]
    FolderNotFound(String),

    #[error("VM folder at {path} is not a folder but a {kind}")]
    NotAFolder { path: String, kind: String },

    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("couldn't decode response: {0}")]
    Decode(String),

    #[error("task {task} failed: {message}")]
    TaskFailed { task: String, message: String },

    #[error("session error: {0}")]
    Session(String),

    /// Failure injected by a test double.
    #[error("injected failure: {0}")]
    Injected(String),
}

impl ProviderError {
    pub fn injected(message: impl Into<String>) -> Self {
        ProviderError::Injected(message.into())
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Transport(format!("request timed out: {err}"))
        } else if err.is_connect() {
            ProviderError::Transport(format!("connection failed: {err}"))
        } else if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ProviderError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::Decode(err.to_string())
    }
}

/// Core error type for the janitor.
///
/// Only [`JanitorError::ListVms`] and [`JanitorError::InvalidOptions`] ever
/// escape [`crate::Janitor::cleanup`]; the per-VM variants are collected into
/// [`crate::RunStats::failures`].
#[derive(Error, Debug)]
pub enum JanitorError {
    #[error("invalid janitor options: {0}")]
    InvalidOptions(String),

    #[error("couldn't list VMs in {path}: {source}")]
    ListVms {
        path: String,
        #[source]
        source: ProviderError,
    },

    #[error("couldn't power off {vm}: {source}")]
    PowerOff {
        vm: String,
        #[source]
        source: ProviderError,
    },

    #[error("couldn't destroy {vm}: {source}")]
    Destroy {
        vm: String,
        #[source]
        source: ProviderError,
    },

    #[error("{action} of {vm} timed out after {after:?}")]
    Timeout {
        vm: String,
        action: &'static str,
        after: Duration,
    },

    #[error("handling of {vm} was cancelled")]
    Cancelled { vm: String },

    #[error("panic while handling {vm}: {message}")]
    Panicked { vm: String, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for janitor operations
pub type JanitorResult<T> = Result<T, JanitorError>;

impl JanitorError {
    /// Short label used as the `kind` metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            JanitorError::InvalidOptions(_) | JanitorError::Configuration(_) => "config",
            JanitorError::ListVms { .. } => "list",
            JanitorError::PowerOff { .. } => "poweroff",
            JanitorError::Destroy { .. } => "destroy",
            JanitorError::Timeout { .. } => "timeout",
            JanitorError::Cancelled { .. } => "cancelled",
            JanitorError::Panicked { .. } => "panic",
            JanitorError::Other(_) => "other",
        }
    }

    /// Build a [`JanitorError::Panicked`] from a caught panic payload.
    pub fn from_panic(vm: impl Into<String>, payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };

        JanitorError::Panicked {
            vm: vm.into(),
            message,
        }
    }
}

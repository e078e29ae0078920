//! Error types for the PMEM-CSI driver
//!
//! Errors fall into three classes: configuration errors detected while
//! building the driver, startup errors raised by a mode's startup path, and
//! runtime errors reported by sub-services after startup. Only the first two
//! are ever returned from [`Orchestrator::run`](crate::Orchestrator::run);
//! runtime failures cancel the shared token instead.

use crate::domain::ports::ResourceKind;
use thiserror::Error;

/// Unified error type for the driver
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unsupported device mode '{0}'")]
    UnsupportedMode(String),

    // =========================================================================
    // Startup Errors
    // =========================================================================
    /// A startup step failed; `operation` names the step.
    #[error("{operation}: {source}")]
    Startup {
        operation: String,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to sync informer for type {kind}")]
    CacheSync { kind: ResourceKind },

    #[error("listen on TCP address {addr:?}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Service already started")]
    AlreadyStarted,

    #[error("Operation cancelled")]
    Cancelled,

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("HTTP server error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by the process supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Invalid or missing configuration; restarting will not help
    Configuration,
    /// A mode's startup path failed; a restart may succeed
    Startup,
    /// A sub-service failed after startup
    Runtime,
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Configuration(_) | Error::UnsupportedMode(_) => ErrorClass::Configuration,
            Error::Startup { source, .. } => match source.class() {
                ErrorClass::Configuration => ErrorClass::Configuration,
                _ => ErrorClass::Startup,
            },
            Error::CacheSync { .. }
            | Error::Listen { .. }
            | Error::AlreadyStarted
            | Error::Kube(_)
            | Error::Io(_) => ErrorClass::Startup,
            _ => ErrorClass::Runtime,
        }
    }

    /// Check if restarting the process could resolve this error
    pub fn is_retryable(&self) -> bool {
        self.class() != ErrorClass::Configuration
    }

    /// Check if this is an optimistic-concurrency conflict from the API server
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(response)) => response.code == 409,
            Error::Startup { source, .. } => source.is_conflict(),
            _ => false,
        }
    }
}

/// Result type alias for the driver
pub type Result<T> = std::result::Result<T, Error>;

/// Wraps errors with the name of the operation that failed
pub trait ResultExt<T> {
    fn context(self, operation: impl Into<String>) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn context(self, operation: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Startup {
            operation: operation.into(),
            source: Box::new(e.into()),
        })
    }
}

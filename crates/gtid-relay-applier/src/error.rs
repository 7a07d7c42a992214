//! Error types for the applier pipeline
//!
//! One error enum with constructor helpers and classification methods; the
//! supervisor decides shutdown from [`ApplierError::is_fatal`], workers
//! decide connection replacement from [`ApplierError::is_transient`].

use gtid_relay_core::{CodecError, GtidError};
use thiserror::Error;

/// Applier errors.
#[derive(Error, Debug)]
pub enum ApplierError {
    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// A startup preflight check failed (gtid_mode off, bad DSN, ...)
    #[error("preflight check failed: {0}")]
    Preflight(String),

    /// Message bus failure
    #[error("bus error: {0}")]
    Bus(String),

    /// Malformed transaction frame
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Malformed GTID text
    #[error(transparent)]
    Gtid(#[from] GtidError),

    /// SQL execution failure on the downstream server
    #[error("SQL error: {0}")]
    Sql(String),

    /// The downstream connection is gone
    #[error("connection closed")]
    ConnectionClosed,

    /// A bounded wait expired
    #[error("timeout: {0}")]
    Timeout(String),

    /// Shutdown sentinel; never treated as a failure
    #[error("shutdown initiated")]
    Shutdown,
}

impl ApplierError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn preflight(msg: impl Into<String>) -> Self {
        Self::Preflight(msg.into())
    }

    pub fn bus(msg: impl Into<String>) -> Self {
        Self::Bus(msg.into())
    }

    pub fn sql(msg: impl Into<String>) -> Self {
        Self::Sql(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Transient errors taint the worker's connection; the worker replaces
    /// it and keeps draining.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionClosed | Self::Timeout(_) => true,
            Self::Sql(msg) => {
                msg.contains("Lost connection")
                    || msg.contains("Deadlock")
                    || msg.contains("Lock wait timeout")
                    || msg.contains("connection reset")
                    || msg.contains("broken pipe")
            }
            _ => false,
        }
    }

    /// Fatal errors trigger pipeline shutdown on first occurrence.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Config(_) | Self::Preflight(_) | Self::Bus(_) => true,
            Self::Codec(_) | Self::Gtid(_) | Self::Shutdown => false,
            Self::Sql(_) | Self::ConnectionClosed | Self::Timeout(_) => !self.is_transient(),
        }
    }
}

impl From<mysql_async::Error> for ApplierError {
    fn from(e: mysql_async::Error) -> Self {
        match e {
            mysql_async::Error::Io(io) => Self::Sql(format!("connection reset: {io}")),
            other => Self::Sql(other.to_string()),
        }
    }
}

/// Where in the pipeline an error originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOrigin {
    Intake,
    Worker,
    Supervisor,
}

impl std::fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Intake => write!(f, "intake"),
            Self::Worker => write!(f, "worker"),
            Self::Supervisor => write!(f, "supervisor"),
        }
    }
}

/// The unit carried on the error fan-in channel.
#[derive(Error, Debug)]
#[error("{origin}: {error}")]
pub struct PipelineError {
    pub origin: ErrorOrigin,
    pub error: ApplierError,
}

impl PipelineError {
    pub fn intake(error: ApplierError) -> Self {
        Self {
            origin: ErrorOrigin::Intake,
            error,
        }
    }

    pub fn worker(error: ApplierError) -> Self {
        Self {
            origin: ErrorOrigin::Worker,
            error,
        }
    }

    pub fn supervisor(error: ApplierError) -> Self {
        Self {
            origin: ErrorOrigin::Supervisor,
            error,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.error.is_fatal()
    }
}

/// Result type for applier operations.
pub type Result<T> = std::result::Result<T, ApplierError>;

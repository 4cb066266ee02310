//! Error types for profiling sessions.

use sea_orm::DbErr;
use thiserror::Error;

/// Errors surfaced by a profiling session or its collaborators.
#[derive(Error, Debug)]
pub enum ProfilerError {
    /// The profiling-sample fetch failed. The event log stays valid; a later
    /// successful fetch can still fill in the missing durations.
    #[error("profiling source unavailable: {message}")]
    SourceUnavailable { message: String },

    /// A sample lacked a required field or carried an invalid value.
    #[error("malformed profiling sample: {reason}")]
    MalformedSample { reason: String },

    #[error("invalid profiler configuration: {message}")]
    InvalidConfig { message: String },

    #[error("profiling session is closed")]
    SessionClosed,

    /// An explicit fetch was requested while a transaction owns the
    /// connection the samples are read over.
    #[error("a transaction is open on the profiled connection")]
    TransactionOpen,

    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

impl ProfilerError {
    pub fn source_unavailable(message: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            message: message.into(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedSample {
            reason: reason.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProfilerError>;

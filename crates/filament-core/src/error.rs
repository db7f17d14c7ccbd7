// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for filament-core.
//!
//! Provides a unified error type for engine operations, with an explicit
//! split between fatal configuration errors (which must not be retried) and
//! transient ones (which reschedule the strand with backoff).

use std::fmt;

use uuid::Uuid;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors that can occur while scheduling and dispatching strands.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum EngineError {
    /// Strand was not found in the database.
    StrandNotFound {
        /// The strand ID that was not found.
        strand_id: Uuid,
    },

    /// Strand has already reached a terminal state.
    StrandTerminal {
        /// The strand ID.
        strand_id: Uuid,
    },

    /// No step function is registered for a `(prog, label)` pair.
    ///
    /// This is a configuration error: the registry is fixed at process
    /// start, so retrying cannot succeed.
    UnknownStep {
        /// The workflow implementation name.
        prog: String,
        /// The step label within that workflow.
        label: String,
    },

    /// A strand's persisted stack is not a non-empty array of objects.
    MalformedStack {
        /// The strand ID.
        strand_id: Uuid,
        /// What was wrong with the stored document.
        details: String,
    },

    /// A step function exceeded the run window and its task was aborted.
    StepTimeout {
        /// The strand ID.
        strand_id: Uuid,
    },

    /// Database operation failed.
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// JSON (de)serialization failed.
    Serialization {
        /// Error details.
        details: String,
    },
}

impl EngineError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::StrandNotFound { .. } => "STRAND_NOT_FOUND",
            Self::StrandTerminal { .. } => "STRAND_TERMINAL",
            Self::UnknownStep { .. } => "UNKNOWN_STEP",
            Self::MalformedStack { .. } => "MALFORMED_STACK",
            Self::StepTimeout { .. } => "STEP_TIMEOUT",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
        }
    }

    /// Whether this error is a fatal configuration error.
    ///
    /// Fatal errors terminate the strand with a diagnostic `exitval` instead
    /// of rescheduling it with backoff.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnknownStep { .. } | Self::MalformedStack { .. }
        )
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StrandNotFound { strand_id } => {
                write!(f, "Strand '{}' not found", strand_id)
            }
            Self::StrandTerminal { strand_id } => {
                write!(f, "Strand '{}' is terminal", strand_id)
            }
            Self::UnknownStep { prog, label } => {
                write!(f, "No step registered for prog '{}', label '{}'", prog, label)
            }
            Self::MalformedStack { strand_id, details } => {
                write!(f, "Malformed stack for strand '{}': {}", strand_id, details)
            }
            Self::StepTimeout { strand_id } => {
                write!(f, "Step for strand '{}' exceeded its run window", strand_id)
            }
            Self::Database { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
            Self::Serialization { details } => {
                write!(f, "Serialization error: {}", details)
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization {
            details: err.to_string(),
        }
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Filament engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Number of concurrent worker tasks polling for due strands
    pub workers: usize,
    /// How long an idle worker sleeps between scans
    pub poll_interval: Duration,
    /// Exclusive-execution window granted per lease acquisition
    pub lease_duration: Duration,
    /// Maximum strands fetched per scan
    pub scan_batch: i64,
    /// First retry delay after a step failure
    pub backoff_base: Duration,
    /// Upper bound on the retry delay
    pub backoff_cap: Duration,
}

impl EngineConfig {
    /// Margin subtracted from the lease duration to derive the step run
    /// window, so a hung step's task is aborted before its lease can be
    /// taken over by another worker.
    const STEP_TIMEOUT_MARGIN: Duration = Duration::from_secs(30);

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `FILAMENT_DATABASE_URL`: PostgreSQL connection string
    ///
    /// Optional (with defaults):
    /// - `FILAMENT_WORKERS`: worker task count (default: 4)
    /// - `FILAMENT_POLL_INTERVAL_MS`: idle scan interval (default: 1000)
    /// - `FILAMENT_LEASE_DURATION_SECS`: lease window (default: 120)
    /// - `FILAMENT_SCAN_BATCH`: strands per scan (default: 16)
    /// - `FILAMENT_BACKOFF_BASE_SECS`: first retry delay (default: 2)
    /// - `FILAMENT_BACKOFF_CAP_SECS`: retry delay cap (default: 600)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("FILAMENT_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("FILAMENT_DATABASE_URL"))?;

        let workers: usize = std::env::var("FILAMENT_WORKERS")
            .unwrap_or_else(|_| "4".to_string())
            .parse()
            .ok()
            .filter(|w| *w > 0)
            .ok_or(ConfigError::Invalid(
                "FILAMENT_WORKERS",
                "must be a positive integer",
            ))?;

        let poll_interval_ms: u64 = std::env::var("FILAMENT_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .ok()
            .filter(|ms| *ms > 0)
            .ok_or(ConfigError::Invalid(
                "FILAMENT_POLL_INTERVAL_MS",
                "must be a positive integer",
            ))?;

        let lease_duration_secs: u64 = std::env::var("FILAMENT_LEASE_DURATION_SECS")
            .unwrap_or_else(|_| "120".to_string())
            .parse()
            .ok()
            .filter(|s| *s > 0)
            .ok_or(ConfigError::Invalid(
                "FILAMENT_LEASE_DURATION_SECS",
                "must be a positive integer",
            ))?;

        let scan_batch: i64 = std::env::var("FILAMENT_SCAN_BATCH")
            .unwrap_or_else(|_| "16".to_string())
            .parse()
            .ok()
            .filter(|b| *b > 0)
            .ok_or(ConfigError::Invalid(
                "FILAMENT_SCAN_BATCH",
                "must be a positive integer",
            ))?;

        let backoff_base_secs: u64 = std::env::var("FILAMENT_BACKOFF_BASE_SECS")
            .unwrap_or_else(|_| "2".to_string())
            .parse()
            .ok()
            .filter(|s| *s > 0)
            .ok_or(ConfigError::Invalid(
                "FILAMENT_BACKOFF_BASE_SECS",
                "must be a positive integer",
            ))?;

        let backoff_cap_secs: u64 = std::env::var("FILAMENT_BACKOFF_CAP_SECS")
            .unwrap_or_else(|_| "600".to_string())
            .parse()
            .ok()
            .filter(|s| *s >= backoff_base_secs)
            .ok_or(ConfigError::Invalid(
                "FILAMENT_BACKOFF_CAP_SECS",
                "must be an integer >= the backoff base",
            ))?;

        Ok(Self {
            database_url,
            workers,
            poll_interval: Duration::from_millis(poll_interval_ms),
            lease_duration: Duration::from_secs(lease_duration_secs),
            scan_batch,
            backoff_base: Duration::from_secs(backoff_base_secs),
            backoff_cap: Duration::from_secs(backoff_cap_secs),
        })
    }

    /// The run window granted to a single step invocation.
    ///
    /// Derived from the lease duration so the watchdog fires while the
    /// lease is still held.
    pub fn step_timeout(&self) -> Duration {
        self.lease_duration
            .checked_sub(Self::STEP_TIMEOUT_MARGIN)
            .unwrap_or(self.lease_duration / 2)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

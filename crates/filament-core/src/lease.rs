// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lease management for strands.
//!
//! A lease is a time-bounded exclusivity marker stored on the strand row
//! itself. Acquisition is a single compare-and-set UPDATE against the store,
//! so at most one worker holds a live lease regardless of how many processes
//! poll concurrently. There is no explicit crash recovery: a worker that
//! dies while holding a lease simply stops renewing it, and the strand
//! becomes eligible again once the lease expires. Step functions must
//! therefore tolerate re-execution from the start of their label.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::EngineError;
use crate::persistence::Persistence;

/// The all-time-past sentinel meaning "immediately available".
pub fn far_past() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Proof of a successfully acquired lease.
///
/// The recorded expiry doubles as the compare-and-set token for renewal: if
/// the stored lease no longer matches, the lease expired and was taken over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    /// The leased strand.
    pub strand_id: Uuid,
    /// When exclusivity ends unless renewed.
    pub expires_at: DateTime<Utc>,
}

/// Acquires, renews, and releases strand leases with a configured duration.
#[derive(Clone)]
pub struct LeaseManager {
    persistence: Arc<dyn Persistence>,
    duration: Duration,
}

impl LeaseManager {
    /// Create a lease manager granting leases of the given duration.
    pub fn new(persistence: Arc<dyn Persistence>, duration: Duration) -> Self {
        Self {
            persistence,
            duration,
        }
    }

    /// The exclusivity window granted per acquisition.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Try to acquire an exclusive lease on a strand.
    ///
    /// Returns None on contention; losing is not an error, the strand is
    /// simply skipped this cycle.
    pub async fn acquire(&self, strand_id: Uuid) -> Result<Option<Lease>, EngineError> {
        self.persistence.acquire_lease(strand_id, self.duration).await
    }

    /// Extend a held lease for another full duration.
    ///
    /// Returns None if the stored lease no longer matches the token.
    pub async fn renew(&self, lease: &Lease) -> Result<Option<Lease>, EngineError> {
        self.persistence.renew_lease(lease, self.duration).await
    }

    /// Release a lease, making the strand immediately eligible again.
    pub async fn release(&self, strand_id: Uuid) -> Result<(), EngineError> {
        self.persistence.release_lease(strand_id).await
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("duration", &self.duration)
            .finish()
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The scheduler loop: workers that find due strands and run them.
//!
//! A scheduler spawns N independent worker tasks. Workers share nothing but
//! the store: each one scans for due, unleased, non-terminal strands,
//! tries to acquire a lease on each candidate, dispatches one step per win,
//! and releases the lease. Lease contention is not an error; the loser
//! skips the strand and the scan finds it again later. Any number of
//! scheduler processes can point at the same database.
//!
//! Schedulers can be partitioned by UUID range. A partitioned scheduler
//! additionally scans for strands overdue past a grace period regardless of
//! partition, so work stranded by a crashed partition is absorbed by the
//! survivors.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use filament_core::scheduler::Scheduler;
//! use filament_core::persistence::PostgresPersistence;
//!
//! let pool = sqlx::PgPool::connect(&database_url).await?;
//! let persistence = Arc::new(PostgresPersistence::new(pool));
//!
//! let scheduler = Scheduler::builder()
//!     .persistence(persistence)
//!     .registry(registry)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! // ... run your application ...
//!
//! scheduler.shutdown().await?;
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::dispatcher::{BackoffPolicy, Dispatcher};
use crate::error::EngineError;
use crate::lease::LeaseManager;
use crate::persistence::{PartitionRange, Persistence, StrandRecord};
use crate::registry::WorkflowRegistry;

/// How far past its schedule a strand must be before the degradation scan
/// picks it up across partition boundaries.
const OVERDUE_GRACE: Duration = Duration::from_secs(5);

/// Builder for creating a [`Scheduler`].
pub struct SchedulerBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    registry: Option<WorkflowRegistry>,
    workers: usize,
    poll_interval: Duration,
    lease_duration: Duration,
    scan_batch: i64,
    backoff: BackoffPolicy,
    partition: Option<PartitionRange>,
}

impl std::fmt::Debug for SchedulerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("registry", &self.registry)
            .field("workers", &self.workers)
            .field("poll_interval", &self.poll_interval)
            .field("lease_duration", &self.lease_duration)
            .field("scan_batch", &self.scan_batch)
            .field("partition", &self.partition)
            .finish()
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            registry: None,
            workers: 4,
            poll_interval: Duration::from_secs(1),
            lease_duration: Duration::from_secs(120),
            scan_batch: 16,
            backoff: BackoffPolicy {
                base: Duration::from_secs(2),
                cap: Duration::from_secs(600),
            },
            partition: None,
        }
    }
}

impl SchedulerBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the workflow registry (required).
    pub fn registry(mut self, registry: WorkflowRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Apply the tuning knobs from an [`EngineConfig`].
    pub fn config(mut self, config: &EngineConfig) -> Self {
        self.workers = config.workers;
        self.poll_interval = config.poll_interval;
        self.lease_duration = config.lease_duration;
        self.scan_batch = config.scan_batch;
        self.backoff = BackoffPolicy {
            base: config.backoff_base,
            cap: config.backoff_cap,
        };
        self
    }

    /// Set the worker task count.
    ///
    /// Default: 4
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set how long an idle worker sleeps between scans.
    ///
    /// Default: 1s
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the lease window granted per strand run.
    ///
    /// Default: 120s
    pub fn lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Set the maximum strands fetched per scan.
    ///
    /// Default: 16
    pub fn scan_batch(mut self, scan_batch: i64) -> Self {
        self.scan_batch = scan_batch;
        self
    }

    /// Set the retry backoff policy.
    ///
    /// Default: 2s base, 600s cap
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Confine this scheduler's scans to a UUID range.
    pub fn partition(mut self, partition: PartitionRange) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Build the scheduler configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<SchedulerConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry is required"))?;

        // Abort a runaway step while its lease is still held.
        let step_timeout = self
            .lease_duration
            .checked_sub(Duration::from_secs(30))
            .unwrap_or(self.lease_duration / 2);

        Ok(SchedulerConfig {
            persistence,
            registry: Arc::new(registry),
            workers: self.workers,
            poll_interval: self.poll_interval,
            lease_duration: self.lease_duration,
            scan_batch: self.scan_batch,
            backoff: self.backoff,
            partition: self.partition,
            step_timeout,
        })
    }
}

/// Configuration for a [`Scheduler`].
pub struct SchedulerConfig {
    persistence: Arc<dyn Persistence>,
    registry: Arc<WorkflowRegistry>,
    workers: usize,
    poll_interval: Duration,
    lease_duration: Duration,
    scan_batch: i64,
    backoff: BackoffPolicy,
    partition: Option<PartitionRange>,
    step_timeout: Duration,
}

impl std::fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("persistence", &"...")
            .field("registry", &self.registry)
            .field("workers", &self.workers)
            .field("partition", &self.partition)
            .finish()
    }
}

impl SchedulerConfig {
    /// Start the scheduler, spawning its worker tasks.
    pub async fn start(self) -> Result<Scheduler> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = Arc::new(Dispatcher::new(
            self.persistence.clone(),
            self.registry.clone(),
            self.backoff,
            self.step_timeout,
        ));
        let leases = LeaseManager::new(self.persistence.clone(), self.lease_duration);

        let worker_handles = (0..self.workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    persistence: self.persistence.clone(),
                    dispatcher: dispatcher.clone(),
                    leases: leases.clone(),
                    scan_batch: self.scan_batch,
                    poll_interval: self.poll_interval,
                    partition: self.partition,
                };
                tokio::spawn(worker.run(shutdown_rx.clone()))
            })
            .collect();

        info!(
            workers = self.workers,
            steps = self.registry.len(),
            partitioned = self.partition.is_some(),
            "scheduler started"
        );

        Ok(Scheduler {
            worker_handles,
            shutdown_tx,
        })
    }
}

/// A running scheduler that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination; in-flight
/// steps complete before their worker exits.
pub struct Scheduler {
    worker_handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    /// Create a new builder for configuring a scheduler.
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    /// Check if any worker is still running.
    pub fn is_running(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }

    /// Gracefully shut down: workers finish their current strand and exit.
    pub async fn shutdown(self) -> Result<()> {
        info!("scheduler shutting down...");

        let _ = self.shutdown_tx.send(true);

        for handle in self.worker_handles {
            if let Err(e) = handle.await {
                error!("scheduler worker panicked: {}", e);
                return Err(anyhow::anyhow!("worker task panicked: {}", e));
            }
        }

        info!("scheduler shutdown complete");
        Ok(())
    }
}

/// One worker task's state.
struct Worker {
    id: usize,
    persistence: Arc<dyn Persistence>,
    dispatcher: Arc<Dispatcher>,
    leases: LeaseManager,
    scan_batch: i64,
    poll_interval: Duration,
    partition: Option<PartitionRange>,
}

impl Worker {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        debug!(worker = self.id, "scheduler worker started");

        while !*shutdown_rx.borrow() {
            let ran = match self.cohort().await {
                Ok(cohort) => self.run_cohort(cohort, &shutdown_rx).await,
                Err(e) => {
                    warn!(worker = self.id, error = %e, "scan failed");
                    0
                }
            };

            // Busy cohorts loop straight into the next scan; an idle worker
            // yields until the poll interval elapses or shutdown arrives.
            if ran == 0 {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        debug!(worker = self.id, "scheduler worker stopped");
    }

    /// The strands this worker should attempt this cycle.
    async fn cohort(&self) -> Result<Vec<StrandRecord>, EngineError> {
        let mut cohort = self
            .persistence
            .scan_due(self.scan_batch, self.partition.as_ref())
            .await?;

        // Partitioned schedulers also absorb anyone's badly overdue work.
        if self.partition.is_some() {
            let seen: HashSet<Uuid> = cohort.iter().map(|s| s.id).collect();
            let overdue = self
                .persistence
                .scan_overdue(self.scan_batch, OVERDUE_GRACE)
                .await?;
            cohort.extend(overdue.into_iter().filter(|s| !seen.contains(&s.id)));
        }

        Ok(cohort)
    }

    /// Lease and dispatch each candidate, returning how many ran.
    async fn run_cohort(
        &self,
        cohort: Vec<StrandRecord>,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> usize {
        let mut ran = 0;

        for candidate in cohort {
            if *shutdown_rx.borrow() {
                break;
            }

            let strand_id = candidate.id;
            match self.leases.acquire(strand_id).await {
                Ok(Some(_lease)) => {
                    self.run_leased(strand_id).await;
                    ran += 1;

                    if let Err(e) = self.leases.release(strand_id).await {
                        warn!(%strand_id, error = %e, "lease release failed");
                    }
                }
                // Contention: someone else got there first. Not an error.
                Ok(None) => {}
                Err(e) => {
                    warn!(%strand_id, error = %e, "lease acquisition failed");
                }
            }
        }

        ran
    }

    /// Dispatch one step for a strand this worker holds the lease on.
    async fn run_leased(&self, strand_id: Uuid) {
        // Re-read under the lease: the scan snapshot may be stale if another
        // worker ran the strand between our scan and our acquisition.
        let fresh = match self.persistence.get_strand(strand_id).await {
            Ok(Some(strand)) => strand,
            Ok(None) => return,
            Err(e) => {
                warn!(%strand_id, error = %e, "re-read under lease failed");
                return;
            }
        };

        if fresh.is_terminal() || fresh.schedule > Utc::now() {
            return;
        }

        if let Err(e) = self.dispatcher.dispatch(fresh).await {
            error!(%strand_id, error = %e, "dispatch failed");
        }
    }
}

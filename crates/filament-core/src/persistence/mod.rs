// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for filament-core.
//!
//! This module defines the persistence abstraction the engine runs against
//! and the PostgreSQL backend implementation. All coordination between
//! workers happens through these operations; nothing in memory is
//! authoritative across dispatch cycles.

pub mod postgres;

pub use self::postgres::PostgresPersistence;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;
use crate::lease::Lease;
use crate::stack::FrameStack;

/// Strand record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StrandRecord {
    /// Unique identifier, immutable, assigned at creation.
    pub id: Uuid,
    /// The strand that spawned this one via bud; None for top-level strands.
    pub parent_id: Option<Uuid>,
    /// Earliest moment this strand is eligible to run again.
    pub schedule: DateTime<Utc>,
    /// Expiry of the exclusive-execution window; epoch means available.
    pub lease: DateTime<Utc>,
    /// Which workflow implementation owns this strand.
    pub prog: String,
    /// Current step within that workflow.
    pub label: String,
    /// Frame array; the first element is the current frame.
    pub stack: Value,
    /// Terminal failure/final-report document.
    pub exitval: Option<Value>,
    /// Terminal success document.
    pub retval: Option<Value>,
    /// Consecutive step-failure counter driving backoff.
    #[sqlx(rename = "try")]
    pub tries: i32,
}

impl StrandRecord {
    /// Whether this strand has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.exitval.is_some() || self.retval.is_some()
    }

    /// Decode the stored stack column.
    pub fn frames(&self) -> Result<FrameStack, EngineError> {
        FrameStack::from_value(self.id, &self.stack)
    }
}

/// Semaphore record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SemaphoreRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// The strand this signal is directed at.
    pub strand_id: Uuid,
    /// The signal's symbolic name.
    pub name: String,
    /// Optional caller-supplied correlation id for de-duplication.
    pub origin_id: Option<Uuid>,
}

/// Everything needed to create a new strand row.
#[derive(Debug, Clone)]
pub struct StrandSpec {
    /// Workflow implementation name.
    pub prog: String,
    /// Initial label; `"start"` by convention.
    pub label: String,
    /// Initial (root) frame contents.
    pub frame: Value,
    /// Spawning strand, for children created via bud.
    pub parent_id: Option<Uuid>,
    /// First eligible run time; None means immediately.
    pub schedule: Option<DateTime<Utc>>,
}

impl StrandSpec {
    /// A spec for a top-level strand starting at the conventional label
    /// with an empty frame.
    pub fn new(prog: impl Into<String>) -> Self {
        Self {
            prog: prog.into(),
            label: crate::step::START_LABEL.to_string(),
            frame: Value::Object(serde_json::Map::new()),
            parent_id: None,
            schedule: None,
        }
    }

    /// Set the initial frame.
    pub fn with_frame(mut self, frame: Value) -> Self {
        self.frame = frame;
        self
    }

    /// Set the initial label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the parent strand.
    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Defer the first run until the given time.
    pub fn with_schedule(mut self, schedule: DateTime<Utc>) -> Self {
        self.schedule = Some(schedule);
        self
    }
}

/// Half-open UUID range confining a scheduler's scans to a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRange {
    /// Inclusive lower bound.
    pub lo: Uuid,
    /// Exclusive upper bound.
    pub hi: Uuid,
}

/// Persistence interface used by the engine.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Create a strand row and return it.
    async fn create_strand(&self, spec: &StrandSpec) -> Result<StrandRecord, EngineError>;

    /// Get a strand by id.
    async fn get_strand(&self, strand_id: Uuid) -> Result<Option<StrandRecord>, EngineError>;

    /// Delete a strand row. Returns whether a row was deleted.
    ///
    /// Used by the strand's creator once it has read a terminal
    /// retval/exitval; pending semaphores cascade.
    async fn delete_strand(&self, strand_id: Uuid) -> Result<bool, EngineError>;

    /// Select due, unleased, non-terminal strands ordered by schedule
    /// (oldest due first), optionally confined to a partition.
    async fn scan_due(
        &self,
        limit: i64,
        partition: Option<&PartitionRange>,
    ) -> Result<Vec<StrandRecord>, EngineError>;

    /// Select strands overdue by more than `grace`, ignoring any partition.
    ///
    /// Lets surviving schedulers absorb a crashed partition's work.
    async fn scan_overdue(
        &self,
        limit: i64,
        grace: Duration,
    ) -> Result<Vec<StrandRecord>, EngineError>;

    /// Atomically acquire an exclusive lease on a strand.
    ///
    /// Succeeds only if the stored lease is in the past and the strand is
    /// not terminal; at most one concurrent caller wins.
    async fn acquire_lease(
        &self,
        strand_id: Uuid,
        duration: Duration,
    ) -> Result<Option<Lease>, EngineError>;

    /// Extend a held lease. Fails (returns None) if the stored lease no
    /// longer matches the token, i.e. it expired and was taken over.
    async fn renew_lease(
        &self,
        lease: &Lease,
        duration: Duration,
    ) -> Result<Option<Lease>, EngineError>;

    /// Release a lease, making the strand immediately eligible again.
    async fn release_lease(&self, strand_id: Uuid) -> Result<(), EngineError>;

    /// Persist a strand's stack.
    async fn save_stack(&self, strand_id: Uuid, stack: &Value) -> Result<(), EngineError>;

    /// Apply a hop: new label (and prog, if given), new schedule, try reset.
    async fn apply_hop(
        &self,
        strand_id: Uuid,
        prog: Option<&str>,
        label: &str,
        schedule: DateTime<Utc>,
    ) -> Result<(), EngineError>;

    /// Apply a nap: same label, deferred schedule, try untouched.
    async fn apply_nap(&self, strand_id: Uuid, until: DateTime<Utc>) -> Result<(), EngineError>;

    /// Apply a frame return: replacement stack plus the caller's prog and
    /// label, immediately eligible, try reset.
    async fn apply_return(
        &self,
        strand_id: Uuid,
        stack: &Value,
        prog: &str,
        label: &str,
    ) -> Result<(), EngineError>;

    /// Terminate a strand normally: set retval and the resting label, and
    /// delete its pending semaphores.
    async fn finish_strand(
        &self,
        strand_id: Uuid,
        retval: &Value,
        label: &str,
    ) -> Result<(), EngineError>;

    /// Terminate a strand with a failure report: set exitval (label is left
    /// at the failing step) and delete its pending semaphores.
    async fn fail_strand(&self, strand_id: Uuid, exitval: &Value) -> Result<(), EngineError>;

    /// Record a transient step failure: increment try and defer the
    /// schedule. Returns the new try count.
    async fn record_failure(
        &self,
        strand_id: Uuid,
        schedule: DateTime<Utc>,
    ) -> Result<i32, EngineError>;

    /// Count a strand's non-terminal children.
    async fn live_children(&self, parent_id: Uuid) -> Result<i64, EngineError>;

    /// Delete and return a strand's terminal children, retval/exitval intact.
    async fn reap_children(&self, parent_id: Uuid) -> Result<Vec<StrandRecord>, EngineError>;

    /// Insert a semaphore row directed at a strand.
    ///
    /// Idempotent when `origin_id` is given: a duplicate
    /// `(strand, name, origin)` signal before consumption is a no-op.
    async fn signal(
        &self,
        strand_id: Uuid,
        name: &str,
        origin_id: Option<Uuid>,
    ) -> Result<(), EngineError>;

    /// Delete all semaphores matching `(strand, name)`, returning whether
    /// any were pending.
    async fn consume_semaphore(&self, strand_id: Uuid, name: &str) -> Result<bool, EngineError>;

    /// List a strand's pending semaphores.
    async fn pending_semaphores(
        &self,
        strand_id: Uuid,
    ) -> Result<Vec<SemaphoreRecord>, EngineError>;

    /// Check database health.
    async fn health_check_db(&self) -> Result<bool, EngineError>;
}

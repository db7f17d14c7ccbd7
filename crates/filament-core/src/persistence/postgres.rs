// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence operations for filament-core.
//!
//! Provides all durable storage access for strands and semaphores. Every
//! mutation that two workers could race on is a single guarded UPDATE, so
//! the store itself arbitrates winners.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::EngineError;
use crate::lease::Lease;

use super::{PartitionRange, Persistence, SemaphoreRecord, StrandRecord, StrandSpec};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const STRAND_COLUMNS: &str =
    "id, parent_id, schedule, lease, prog, label, stack, exitval, retval, try";

/// Distinguish why a guarded transition matched no row.
async fn transition_miss(pool: &PgPool, strand_id: Uuid) -> EngineError {
    match get_strand(pool, strand_id).await {
        Ok(Some(_)) => EngineError::StrandTerminal { strand_id },
        _ => EngineError::StrandNotFound { strand_id },
    }
}

// ============================================================================
// Strand Operations
// ============================================================================

/// Create a strand row on an existing connection.
///
/// This is the assemble hook: collaborators open a transaction, create their
/// domain rows, and create the initial strand row through this function so
/// all of it commits atomically.
pub async fn create_strand_in(
    conn: &mut sqlx::PgConnection,
    spec: &StrandSpec,
) -> Result<StrandRecord, EngineError> {
    let frame = match &spec.frame {
        Value::Object(_) => spec.frame.clone(),
        _ => Value::Object(serde_json::Map::new()),
    };
    let stack = Value::Array(vec![frame]);

    let record = sqlx::query_as::<_, StrandRecord>(
        r#"
        INSERT INTO strand (id, parent_id, schedule, lease, prog, label, stack, try)
        VALUES ($1, $2, COALESCE($3, now()), 'epoch', $4, $5, $6, 0)
        RETURNING id, parent_id, schedule, lease, prog, label, stack, exitval, retval, try
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(spec.parent_id)
    .bind(spec.schedule)
    .bind(&spec.prog)
    .bind(&spec.label)
    .bind(&stack)
    .fetch_one(conn)
    .await?;

    Ok(record)
}

/// Create a strand row.
pub async fn create_strand(pool: &PgPool, spec: &StrandSpec) -> Result<StrandRecord, EngineError> {
    let mut conn = pool.acquire().await?;
    create_strand_in(&mut conn, spec).await
}

/// Get a strand by id.
pub async fn get_strand(
    pool: &PgPool,
    strand_id: Uuid,
) -> Result<Option<StrandRecord>, EngineError> {
    let record = sqlx::query_as::<_, StrandRecord>(&format!(
        "SELECT {STRAND_COLUMNS} FROM strand WHERE id = $1"
    ))
    .bind(strand_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Delete a strand row. Pending semaphores cascade.
pub async fn delete_strand(pool: &PgPool, strand_id: Uuid) -> Result<bool, EngineError> {
    let result = sqlx::query("DELETE FROM strand WHERE id = $1")
        .bind(strand_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Select due, unleased, non-terminal strands, oldest schedule first.
pub async fn scan_due(
    pool: &PgPool,
    limit: i64,
    partition: Option<&PartitionRange>,
) -> Result<Vec<StrandRecord>, EngineError> {
    let records = sqlx::query_as::<_, StrandRecord>(&format!(
        r#"
        SELECT {STRAND_COLUMNS}
        FROM strand
        WHERE schedule <= now()
          AND lease <= now()
          AND exitval IS NULL AND retval IS NULL
          AND ($2::uuid IS NULL OR (id >= $2 AND id < $3))
        ORDER BY schedule
        LIMIT $1
        "#
    ))
    .bind(limit)
    .bind(partition.map(|p| p.lo))
    .bind(partition.map(|p| p.hi))
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Select strands overdue by more than `grace`, ignoring any partition.
pub async fn scan_overdue(
    pool: &PgPool,
    limit: i64,
    grace: Duration,
) -> Result<Vec<StrandRecord>, EngineError> {
    let records = sqlx::query_as::<_, StrandRecord>(&format!(
        r#"
        SELECT {STRAND_COLUMNS}
        FROM strand
        WHERE schedule <= now() - make_interval(secs => $2)
          AND lease <= now()
          AND exitval IS NULL AND retval IS NULL
        ORDER BY schedule
        LIMIT $1
        "#
    ))
    .bind(limit)
    .bind(grace.as_secs_f64())
    .fetch_all(pool)
    .await?;

    Ok(records)
}

// ============================================================================
// Lease Operations
// ============================================================================

/// Atomically acquire a lease on a strand.
///
/// The guarded UPDATE is the entire mutual-exclusion mechanism: of any
/// number of concurrent callers, the store lets exactly one through.
pub async fn acquire_lease(
    pool: &PgPool,
    strand_id: Uuid,
    duration: Duration,
) -> Result<Option<Lease>, EngineError> {
    let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
        r#"
        UPDATE strand
        SET lease = now() + make_interval(secs => $2)
        WHERE id = $1 AND lease < now()
          AND exitval IS NULL AND retval IS NULL
        RETURNING lease
        "#,
    )
    .bind(strand_id)
    .bind(duration.as_secs_f64())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(expires_at,)| Lease {
        strand_id,
        expires_at,
    }))
}

/// Extend a held lease, compare-and-set against the token's expiry.
pub async fn renew_lease(
    pool: &PgPool,
    lease: &Lease,
    duration: Duration,
) -> Result<Option<Lease>, EngineError> {
    let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
        r#"
        UPDATE strand
        SET lease = now() + make_interval(secs => $3)
        WHERE id = $1 AND lease = $2
        RETURNING lease
        "#,
    )
    .bind(lease.strand_id)
    .bind(lease.expires_at)
    .bind(duration.as_secs_f64())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(expires_at,)| Lease {
        strand_id: lease.strand_id,
        expires_at,
    }))
}

/// Release a lease by resetting it to the far-past sentinel.
///
/// Releasing a strand that was deleted in the meantime is a no-op.
pub async fn release_lease(pool: &PgPool, strand_id: Uuid) -> Result<(), EngineError> {
    sqlx::query("UPDATE strand SET lease = 'epoch' WHERE id = $1")
        .bind(strand_id)
        .execute(pool)
        .await?;

    Ok(())
}

// ============================================================================
// Step Transitions
// ============================================================================

/// Persist a strand's stack.
pub async fn save_stack(pool: &PgPool, strand_id: Uuid, stack: &Value) -> Result<(), EngineError> {
    let result = sqlx::query("UPDATE strand SET stack = $2 WHERE id = $1")
        .bind(strand_id)
        .bind(stack)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::StrandNotFound { strand_id });
    }

    Ok(())
}

/// Apply a hop: new label (and prog, if given), new schedule, try reset.
pub async fn apply_hop(
    pool: &PgPool,
    strand_id: Uuid,
    prog: Option<&str>,
    label: &str,
    schedule: DateTime<Utc>,
) -> Result<(), EngineError> {
    let result = sqlx::query(
        r#"
        UPDATE strand
        SET prog = COALESCE($2, prog), label = $3, schedule = $4, try = 0
        WHERE id = $1 AND exitval IS NULL AND retval IS NULL
        "#,
    )
    .bind(strand_id)
    .bind(prog)
    .bind(label)
    .bind(schedule)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(transition_miss(pool, strand_id).await);
    }

    Ok(())
}

/// Apply a nap: same label, deferred schedule, try untouched.
pub async fn apply_nap(
    pool: &PgPool,
    strand_id: Uuid,
    until: DateTime<Utc>,
) -> Result<(), EngineError> {
    let result = sqlx::query(
        r#"
        UPDATE strand
        SET schedule = $2
        WHERE id = $1 AND exitval IS NULL AND retval IS NULL
        "#,
    )
    .bind(strand_id)
    .bind(until)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(transition_miss(pool, strand_id).await);
    }

    Ok(())
}

/// Apply a frame return: replacement stack plus the caller's prog/label.
pub async fn apply_return(
    pool: &PgPool,
    strand_id: Uuid,
    stack: &Value,
    prog: &str,
    label: &str,
) -> Result<(), EngineError> {
    let result = sqlx::query(
        r#"
        UPDATE strand
        SET stack = $2, prog = $3, label = $4, schedule = now(), try = 0
        WHERE id = $1 AND exitval IS NULL AND retval IS NULL
        "#,
    )
    .bind(strand_id)
    .bind(stack)
    .bind(prog)
    .bind(label)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(transition_miss(pool, strand_id).await);
    }

    Ok(())
}

/// Terminate a strand normally: retval, resting label, semaphores cleared.
pub async fn finish_strand(
    pool: &PgPool,
    strand_id: Uuid,
    retval: &Value,
    label: &str,
) -> Result<(), EngineError> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        r#"
        UPDATE strand
        SET retval = $2, label = $3, lease = 'epoch'
        WHERE id = $1 AND exitval IS NULL AND retval IS NULL
        "#,
    )
    .bind(strand_id)
    .bind(retval)
    .bind(label)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await.ok();
        return Err(transition_miss(pool, strand_id).await);
    }

    sqlx::query("DELETE FROM semaphore WHERE strand_id = $1")
        .bind(strand_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(())
}

/// Terminate a strand with a failure report: exitval set, label left at the
/// failing step, semaphores cleared.
pub async fn fail_strand(
    pool: &PgPool,
    strand_id: Uuid,
    exitval: &Value,
) -> Result<(), EngineError> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        r#"
        UPDATE strand
        SET exitval = $2, lease = 'epoch'
        WHERE id = $1 AND exitval IS NULL AND retval IS NULL
        "#,
    )
    .bind(strand_id)
    .bind(exitval)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await.ok();
        return Err(transition_miss(pool, strand_id).await);
    }

    sqlx::query("DELETE FROM semaphore WHERE strand_id = $1")
        .bind(strand_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(())
}

/// Record a transient step failure. Returns the new try count.
pub async fn record_failure(
    pool: &PgPool,
    strand_id: Uuid,
    schedule: DateTime<Utc>,
) -> Result<i32, EngineError> {
    let row: Option<(i32,)> = sqlx::query_as(
        r#"
        UPDATE strand
        SET try = try + 1, schedule = $2
        WHERE id = $1 AND exitval IS NULL AND retval IS NULL
        RETURNING try
        "#,
    )
    .bind(strand_id)
    .bind(schedule)
    .fetch_optional(pool)
    .await?;

    match row {
        Some((tries,)) => Ok(tries),
        None => Err(transition_miss(pool, strand_id).await),
    }
}

// ============================================================================
// Children
// ============================================================================

/// Count a strand's non-terminal children.
pub async fn live_children(pool: &PgPool, parent_id: Uuid) -> Result<i64, EngineError> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)
        FROM strand
        WHERE parent_id = $1 AND exitval IS NULL AND retval IS NULL
        "#,
    )
    .bind(parent_id)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Delete and return a strand's terminal children.
pub async fn reap_children(
    pool: &PgPool,
    parent_id: Uuid,
) -> Result<Vec<StrandRecord>, EngineError> {
    let records = sqlx::query_as::<_, StrandRecord>(&format!(
        r#"
        DELETE FROM strand
        WHERE parent_id = $1
          AND (exitval IS NOT NULL OR retval IS NOT NULL)
        RETURNING {STRAND_COLUMNS}
        "#
    ))
    .bind(parent_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

// ============================================================================
// Semaphore Operations
// ============================================================================

/// Insert a semaphore row directed at a strand.
///
/// A correlation id makes the insert idempotent via the partial unique
/// index; without one, duplicates are benign and cleared together.
pub async fn signal(
    pool: &PgPool,
    strand_id: Uuid,
    name: &str,
    origin_id: Option<Uuid>,
) -> Result<(), EngineError> {
    sqlx::query(
        r#"
        INSERT INTO semaphore (id, strand_id, name, origin_id)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (strand_id, name, origin_id) WHERE origin_id IS NOT NULL
        DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(strand_id)
    .bind(name)
    .bind(origin_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Delete all semaphores matching `(strand, name)`.
pub async fn consume_semaphore(
    pool: &PgPool,
    strand_id: Uuid,
    name: &str,
) -> Result<bool, EngineError> {
    let result = sqlx::query("DELETE FROM semaphore WHERE strand_id = $1 AND name = $2")
        .bind(strand_id)
        .bind(name)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// List a strand's pending semaphores.
pub async fn pending_semaphores(
    pool: &PgPool,
    strand_id: Uuid,
) -> Result<Vec<SemaphoreRecord>, EngineError> {
    let records = sqlx::query_as::<_, SemaphoreRecord>(
        r#"
        SELECT id, strand_id, name, origin_id
        FROM semaphore
        WHERE strand_id = $1
        ORDER BY name
        "#,
    )
    .bind(strand_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Check database health.
pub async fn health_check_db(pool: &PgPool) -> Result<bool, EngineError> {
    let result: Result<(i32,), _> = sqlx::query_as("SELECT 1").fetch_one(pool).await;
    Ok(result.is_ok())
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn create_strand(&self, spec: &StrandSpec) -> Result<StrandRecord, EngineError> {
        create_strand(&self.pool, spec).await
    }

    async fn get_strand(&self, strand_id: Uuid) -> Result<Option<StrandRecord>, EngineError> {
        get_strand(&self.pool, strand_id).await
    }

    async fn delete_strand(&self, strand_id: Uuid) -> Result<bool, EngineError> {
        delete_strand(&self.pool, strand_id).await
    }

    async fn scan_due(
        &self,
        limit: i64,
        partition: Option<&PartitionRange>,
    ) -> Result<Vec<StrandRecord>, EngineError> {
        scan_due(&self.pool, limit, partition).await
    }

    async fn scan_overdue(
        &self,
        limit: i64,
        grace: Duration,
    ) -> Result<Vec<StrandRecord>, EngineError> {
        scan_overdue(&self.pool, limit, grace).await
    }

    async fn acquire_lease(
        &self,
        strand_id: Uuid,
        duration: Duration,
    ) -> Result<Option<Lease>, EngineError> {
        acquire_lease(&self.pool, strand_id, duration).await
    }

    async fn renew_lease(
        &self,
        lease: &Lease,
        duration: Duration,
    ) -> Result<Option<Lease>, EngineError> {
        renew_lease(&self.pool, lease, duration).await
    }

    async fn release_lease(&self, strand_id: Uuid) -> Result<(), EngineError> {
        release_lease(&self.pool, strand_id).await
    }

    async fn save_stack(&self, strand_id: Uuid, stack: &Value) -> Result<(), EngineError> {
        save_stack(&self.pool, strand_id, stack).await
    }

    async fn apply_hop(
        &self,
        strand_id: Uuid,
        prog: Option<&str>,
        label: &str,
        schedule: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        apply_hop(&self.pool, strand_id, prog, label, schedule).await
    }

    async fn apply_nap(&self, strand_id: Uuid, until: DateTime<Utc>) -> Result<(), EngineError> {
        apply_nap(&self.pool, strand_id, until).await
    }

    async fn apply_return(
        &self,
        strand_id: Uuid,
        stack: &Value,
        prog: &str,
        label: &str,
    ) -> Result<(), EngineError> {
        apply_return(&self.pool, strand_id, stack, prog, label).await
    }

    async fn finish_strand(
        &self,
        strand_id: Uuid,
        retval: &Value,
        label: &str,
    ) -> Result<(), EngineError> {
        finish_strand(&self.pool, strand_id, retval, label).await
    }

    async fn fail_strand(&self, strand_id: Uuid, exitval: &Value) -> Result<(), EngineError> {
        fail_strand(&self.pool, strand_id, exitval).await
    }

    async fn record_failure(
        &self,
        strand_id: Uuid,
        schedule: DateTime<Utc>,
    ) -> Result<i32, EngineError> {
        record_failure(&self.pool, strand_id, schedule).await
    }

    async fn live_children(&self, parent_id: Uuid) -> Result<i64, EngineError> {
        live_children(&self.pool, parent_id).await
    }

    async fn reap_children(&self, parent_id: Uuid) -> Result<Vec<StrandRecord>, EngineError> {
        reap_children(&self.pool, parent_id).await
    }

    async fn signal(
        &self,
        strand_id: Uuid,
        name: &str,
        origin_id: Option<Uuid>,
    ) -> Result<(), EngineError> {
        signal(&self.pool, strand_id, name, origin_id).await
    }

    async fn consume_semaphore(&self, strand_id: Uuid, name: &str) -> Result<bool, EngineError> {
        consume_semaphore(&self.pool, strand_id, name).await
    }

    async fn pending_semaphores(
        &self,
        strand_id: Uuid,
    ) -> Result<Vec<SemaphoreRecord>, EngineError> {
        pending_semaphores(&self.pool, strand_id).await
    }

    async fn health_check_db(&self) -> Result<bool, EngineError> {
        health_check_db(&self.pool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

    // Helper to get a test database pool
    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        MIGRATOR.run(&pool).await.ok()?;
        Some(pool)
    }

    async fn cleanup(pool: &PgPool, strand_id: Uuid) {
        sqlx::query("DELETE FROM strand WHERE id = $1 OR parent_id = $1")
            .bind(strand_id)
            .execute(pool)
            .await
            .ok();
    }

    #[tokio::test]
    async fn test_create_and_get_strand() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };

        let spec = StrandSpec::new("Vm::Nexus").with_frame(json!({"subject_id": "abc"}));
        let created = create_strand(&pool, &spec).await.unwrap();
        assert_eq!(created.prog, "Vm::Nexus");
        assert_eq!(created.label, "start");
        assert_eq!(created.stack, json!([{"subject_id": "abc"}]));
        assert_eq!(created.tries, 0);
        assert!(!created.is_terminal());

        let fetched = get_strand(&pool, created.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, created.id);
        assert!(fetched.lease < Utc::now());

        cleanup(&pool, created.id).await;
    }

    #[tokio::test]
    async fn test_lease_acquire_release_cycle() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };

        let strand = create_strand(&pool, &StrandSpec::new("Vm::Nexus"))
            .await
            .unwrap();

        let lease = acquire_lease(&pool, strand.id, Duration::from_secs(60))
            .await
            .unwrap()
            .expect("first acquire should win");
        assert!(lease.expires_at > Utc::now());

        // Held lease blocks a second acquire
        let second = acquire_lease(&pool, strand.id, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(second.is_none());

        // Renew against the matching token succeeds
        let renewed = renew_lease(&pool, &lease, Duration::from_secs(60))
            .await
            .unwrap()
            .expect("renew of held lease should succeed");
        assert!(renewed.expires_at >= lease.expires_at);

        // Renewal changed the stored expiry, so the old token no longer matches
        let stale = renew_lease(&pool, &lease, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(stale.is_none());

        release_lease(&pool, strand.id).await.unwrap();
        let reacquired = acquire_lease(&pool, strand.id, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(reacquired.is_some());

        cleanup(&pool, strand.id).await;
    }

    #[tokio::test]
    async fn test_hop_nap_and_failure_transitions() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };

        let strand = create_strand(&pool, &StrandSpec::new("Vm::Nexus"))
            .await
            .unwrap();

        // Failure defers and increments try
        let later = Utc::now() + chrono::Duration::seconds(30);
        let tries = record_failure(&pool, strand.id, later).await.unwrap();
        assert_eq!(tries, 1);
        let tries = record_failure(&pool, strand.id, later).await.unwrap();
        assert_eq!(tries, 2);

        // Hop resets try and moves the label
        apply_hop(&pool, strand.id, None, "wait", Utc::now())
            .await
            .unwrap();
        let row = get_strand(&pool, strand.id).await.unwrap().unwrap();
        assert_eq!(row.label, "wait");
        assert_eq!(row.tries, 0);
        assert_eq!(row.prog, "Vm::Nexus");

        // Hop with a prog hands the strand off
        apply_hop(&pool, strand.id, Some("Vm::Teardown"), "start", Utc::now())
            .await
            .unwrap();
        let row = get_strand(&pool, strand.id).await.unwrap().unwrap();
        assert_eq!(row.prog, "Vm::Teardown");

        // Nap defers the schedule without touching the label
        let until = Utc::now() + chrono::Duration::seconds(10);
        apply_nap(&pool, strand.id, until).await.unwrap();
        let row = get_strand(&pool, strand.id).await.unwrap().unwrap();
        assert_eq!(row.label, "start");
        assert!(row.schedule > Utc::now());

        cleanup(&pool, strand.id).await;
    }

    #[tokio::test]
    async fn test_terminal_strand_rejects_transitions() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };

        let strand = create_strand(&pool, &StrandSpec::new("Vm::Nexus"))
            .await
            .unwrap();

        signal(&pool, strand.id, "destroy", None).await.unwrap();
        finish_strand(&pool, strand.id, &json!({"msg": "done"}), "exit")
            .await
            .unwrap();

        let row = get_strand(&pool, strand.id).await.unwrap().unwrap();
        assert_eq!(row.retval, Some(json!({"msg": "done"})));
        assert_eq!(row.label, "exit");
        assert!(row.is_terminal());

        // Semaphores were cleared with the terminal transition
        let pending = pending_semaphores(&pool, strand.id).await.unwrap();
        assert!(pending.is_empty());

        // Terminal strands are never leased again
        let lease = acquire_lease(&pool, strand.id, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(lease.is_none());

        // And further transitions are rejected
        let err = apply_hop(&pool, strand.id, None, "wait", Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "STRAND_TERMINAL");

        cleanup(&pool, strand.id).await;
    }

    #[tokio::test]
    async fn test_signal_dedup_and_consume() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };

        let strand = create_strand(&pool, &StrandSpec::new("Vm::Nexus"))
            .await
            .unwrap();

        let origin = Uuid::new_v4();
        signal(&pool, strand.id, "destroy", Some(origin)).await.unwrap();
        signal(&pool, strand.id, "destroy", Some(origin)).await.unwrap();

        let pending = pending_semaphores(&pool, strand.id).await.unwrap();
        assert_eq!(pending.len(), 1, "correlated duplicate should be absorbed");

        // Uncorrelated duplicates pile up but are cleared together
        signal(&pool, strand.id, "checkup", None).await.unwrap();
        signal(&pool, strand.id, "checkup", None).await.unwrap();

        assert!(consume_semaphore(&pool, strand.id, "checkup").await.unwrap());
        assert!(!consume_semaphore(&pool, strand.id, "checkup").await.unwrap());

        // The destroy semaphore is untouched by the checkup consumption
        assert!(consume_semaphore(&pool, strand.id, "destroy").await.unwrap());

        cleanup(&pool, strand.id).await;
    }

    #[tokio::test]
    async fn test_children_reap() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };

        let parent = create_strand(&pool, &StrandSpec::new("Test::Main"))
            .await
            .unwrap();
        let child1 = create_strand(
            &pool,
            &StrandSpec::new("Vm::Nexus")
                .with_parent(parent.id)
                .with_frame(json!({"x": 1})),
        )
        .await
        .unwrap();
        let child2 = create_strand(&pool, &StrandSpec::new("Vm::Nexus").with_parent(parent.id))
            .await
            .unwrap();

        assert_eq!(live_children(&pool, parent.id).await.unwrap(), 2);
        assert!(reap_children(&pool, parent.id).await.unwrap().is_empty());

        finish_strand(&pool, child1.id, &json!("ok"), "exit")
            .await
            .unwrap();

        assert_eq!(live_children(&pool, parent.id).await.unwrap(), 1);
        let reaped = reap_children(&pool, parent.id).await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id, child1.id);
        assert_eq!(reaped[0].retval, Some(json!("ok")));

        // Reaped child is gone; the live one remains
        assert!(get_strand(&pool, child1.id).await.unwrap().is_none());
        assert!(get_strand(&pool, child2.id).await.unwrap().is_some());

        cleanup(&pool, parent.id).await;
    }

    #[tokio::test]
    async fn test_scan_due_ordering_and_partition() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };

        let old = create_strand(
            &pool,
            &StrandSpec::new("Vm::Nexus")
                .with_schedule(Utc::now() - chrono::Duration::seconds(60)),
        )
        .await
        .unwrap();
        let future = create_strand(
            &pool,
            &StrandSpec::new("Vm::Nexus")
                .with_schedule(Utc::now() + chrono::Duration::seconds(60)),
        )
        .await
        .unwrap();

        let due = scan_due(&pool, 100, None).await.unwrap();
        assert!(due.iter().any(|s| s.id == old.id));
        assert!(!due.iter().any(|s| s.id == future.id));

        // A partition that cannot contain the strand excludes it
        let excluded = if old.id.as_u128() == 0 {
            PartitionRange {
                lo: Uuid::from_u128(1),
                hi: Uuid::from_u128(u128::MAX),
            }
        } else {
            PartitionRange {
                lo: Uuid::from_u128(0),
                hi: old.id,
            }
        };
        let due = scan_due(&pool, 100, Some(&excluded)).await.unwrap();
        assert!(!due.iter().any(|s| s.id == old.id));

        // The overdue degradation scan still sees it
        let overdue = scan_overdue(&pool, 100, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(overdue.iter().any(|s| s.id == old.id));

        cleanup(&pool, old.id).await;
        cleanup(&pool, future.id).await;
    }
}

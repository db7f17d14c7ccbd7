// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for filament-core integration tests.
//!
//! Provides TestContext for setting up the database and strand fixtures.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use filament_core::dispatcher::{BackoffPolicy, DispatchResult, Dispatcher};
use filament_core::persistence::{Persistence, PostgresPersistence, StrandRecord, StrandSpec};
use filament_core::registry::WorkflowRegistry;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// Test context that manages the database connection and strand fixtures.
pub struct TestContext {
    pub pool: PgPool,
    pub persistence: Arc<PostgresPersistence>,
}

impl TestContext {
    /// Create a new test context.
    ///
    /// This sets up:
    /// 1. Tracing per RUST_LOG (once per process)
    /// 2. Database connection from TEST_DATABASE_URL
    /// 3. Schema via the embedded migrator
    pub async fn new() -> Option<Self> {
        init_tracing();

        let database_url = std::env::var("TEST_DATABASE_URL").ok()?;

        let pool = PgPool::connect(&database_url).await.ok()?;
        MIGRATOR.run(&pool).await.ok()?;

        let persistence = Arc::new(PostgresPersistence::new(pool.clone()));

        Some(Self { pool, persistence })
    }

    /// The persistence layer as the trait object the engine consumes.
    pub fn store(&self) -> Arc<dyn Persistence> {
        self.persistence.clone()
    }

    /// Create a strand scheduled far in the future.
    ///
    /// Dispatching directly ignores the schedule, so tests that drive the
    /// dispatcher by hand use this to keep their fixtures out of any
    /// concurrently scanning scheduler's reach.
    pub async fn create_parked_strand(&self, prog: &str, frame: Value) -> StrandRecord {
        let spec = StrandSpec::new(prog)
            .with_frame(frame)
            .with_schedule(Utc::now() + chrono::Duration::hours(1));
        self.persistence
            .create_strand(&spec)
            .await
            .expect("Failed to create test strand")
    }

    /// Create a strand that is due now.
    pub async fn create_due_strand(&self, prog: &str, frame: Value) -> StrandRecord {
        let spec = StrandSpec::new(prog)
            .with_frame(frame)
            .with_schedule(Utc::now() - chrono::Duration::seconds(1));
        self.persistence
            .create_strand(&spec)
            .await
            .expect("Failed to create test strand")
    }

    /// Insert a strand row with a chosen id (simulating an assemble-style
    /// creator), due now.
    pub async fn insert_strand_with_id(&self, id: Uuid, prog: &str, frame: Value) {
        sqlx::query(
            r#"
            INSERT INTO strand (id, parent_id, schedule, lease, prog, label, stack, try)
            VALUES ($1, NULL, now() - interval '1 second', 'epoch', $2, 'start', $3, 0)
            "#,
        )
        .bind(id)
        .bind(prog)
        .bind(Value::Array(vec![frame]))
        .execute(&self.pool)
        .await
        .expect("Failed to insert test strand");
    }

    /// Fetch a strand row.
    pub async fn get(&self, strand_id: Uuid) -> Option<StrandRecord> {
        self.persistence
            .get_strand(strand_id)
            .await
            .expect("Failed to fetch strand")
    }

    /// Force a strand's schedule, e.g. to make a backed-off strand due.
    pub async fn set_schedule(&self, strand_id: Uuid, schedule: DateTime<Utc>) {
        sqlx::query("UPDATE strand SET schedule = $2 WHERE id = $1")
            .bind(strand_id)
            .bind(schedule)
            .execute(&self.pool)
            .await
            .expect("Failed to set schedule");
    }

    /// Count pending semaphores for a strand by name.
    pub async fn semaphore_count(&self, strand_id: Uuid, name: &str) -> i64 {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM semaphore WHERE strand_id = $1 AND name = $2")
                .bind(strand_id)
                .bind(name)
                .fetch_one(&self.pool)
                .await
                .expect("Failed to count semaphores");
        row.0
    }

    /// Clean up a strand and its children.
    pub async fn cleanup_strand(&self, strand_id: Uuid) {
        sqlx::query("DELETE FROM strand WHERE parent_id = $1")
            .bind(strand_id)
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query("DELETE FROM strand WHERE id = $1")
            .bind(strand_id)
            .execute(&self.pool)
            .await
            .ok();
    }
}

/// Initialize tracing from RUST_LOG. Safe to call from every test; only the
/// first call installs a subscriber.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// A dispatcher with test-friendly backoff (100ms base, 1s cap).
pub fn test_dispatcher(ctx: &TestContext, registry: WorkflowRegistry) -> Dispatcher {
    Dispatcher::new(
        ctx.store(),
        Arc::new(registry),
        BackoffPolicy {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(1),
        },
        Duration::from_secs(5),
    )
}

/// Re-fetch a strand and dispatch one step for it.
pub async fn dispatch_current(
    ctx: &TestContext,
    dispatcher: &Dispatcher,
    strand_id: Uuid,
) -> DispatchResult {
    let strand = ctx.get(strand_id).await.expect("strand should exist");
    dispatcher
        .dispatch(strand)
        .await
        .expect("dispatch should not error")
}

/// Helper macro to skip tests if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

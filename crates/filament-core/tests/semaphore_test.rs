// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the semaphore signal bus.

mod common;

use std::time::Duration;

use common::*;
use filament_core::dispatcher::DispatchResult;
use filament_core::persistence::Persistence;
use filament_core::registry::WorkflowRegistry;
use filament_core::step::{START_LABEL, StepOutcome};
use serde_json::json;
use uuid::Uuid;

/// A wait-loop workflow that honors a destroy semaphore, as the control
/// plane's resource nexus progs do.
fn destroyable_registry() -> WorkflowRegistry {
    let mut registry = WorkflowRegistry::new();
    registry.register("Vm::Nexus", "wait", |ctx| async move {
        if ctx.consume("destroy").await? {
            return Ok(StepOutcome::hop("destroy"));
        }
        Ok(StepOutcome::nap(Duration::from_secs(30)))
    });
    registry.register("Vm::Nexus", "destroy", |_ctx| async {
        Ok(StepOutcome::exit(json!({"msg": "destroyed"})))
    });
    registry
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_signal_observed_and_cleared_by_target_step() {
    skip_if_no_db!();

    let Some(ctx) = TestContext::new().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };

    let dispatcher = test_dispatcher(&ctx, destroyable_registry());
    let strand = ctx.create_parked_strand("Vm::Nexus", json!({})).await;
    sqlx::query("UPDATE strand SET label = 'wait' WHERE id = $1")
        .bind(strand.id)
        .execute(&ctx.pool)
        .await
        .unwrap();

    // No signal pending: the wait step just polls again.
    let result = dispatch_current(&ctx, &dispatcher, strand.id).await;
    assert_eq!(result, DispatchResult::Napped);

    // An external actor asks for teardown out-of-band.
    ctx.persistence
        .signal(strand.id, "destroy", None)
        .await
        .unwrap();
    assert_eq!(ctx.semaphore_count(strand.id, "destroy").await, 1);

    // The next run of the wait step observes it and acts.
    let result = dispatch_current(&ctx, &dispatcher, strand.id).await;
    assert_eq!(result, DispatchResult::Advanced);
    let row = ctx.get(strand.id).await.unwrap();
    assert_eq!(row.label, "destroy");

    // Consumption removed the row.
    assert_eq!(ctx.semaphore_count(strand.id, "destroy").await, 0);

    ctx.cleanup_strand(strand.id).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_duplicate_signals_act_once() {
    skip_if_no_db!();

    let Some(ctx) = TestContext::new().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };

    let dispatcher = test_dispatcher(&ctx, destroyable_registry());
    let strand = ctx.create_parked_strand("Vm::Nexus", json!({})).await;
    sqlx::query("UPDATE strand SET label = 'wait' WHERE id = $1")
        .bind(strand.id)
        .execute(&ctx.pool)
        .await
        .unwrap();

    // The same request retried with its correlation id is absorbed...
    let origin = Uuid::new_v4();
    for _ in 0..3 {
        ctx.persistence
            .signal(strand.id, "destroy", Some(origin))
            .await
            .unwrap();
    }
    assert_eq!(ctx.semaphore_count(strand.id, "destroy").await, 1);

    // ...and an uncorrelated duplicate piles up harmlessly.
    ctx.persistence
        .signal(strand.id, "destroy", None)
        .await
        .unwrap();
    assert_eq!(ctx.semaphore_count(strand.id, "destroy").await, 2);

    // One consumption clears them all: the destroy action runs once.
    let result = dispatch_current(&ctx, &dispatcher, strand.id).await;
    assert_eq!(result, DispatchResult::Advanced);
    assert_eq!(ctx.semaphore_count(strand.id, "destroy").await, 0);

    let row = ctx.get(strand.id).await.unwrap();
    assert_eq!(row.label, "destroy");

    ctx.cleanup_strand(strand.id).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_distinct_names_are_independent() {
    skip_if_no_db!();

    let Some(ctx) = TestContext::new().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };

    let strand = ctx.create_parked_strand("Vm::Nexus", json!({})).await;

    ctx.persistence
        .signal(strand.id, "destroy", None)
        .await
        .unwrap();
    ctx.persistence
        .signal(strand.id, "checkup", None)
        .await
        .unwrap();

    // Consuming one name leaves the other pending.
    assert!(
        ctx.persistence
            .consume_semaphore(strand.id, "checkup")
            .await
            .unwrap()
    );
    assert_eq!(ctx.semaphore_count(strand.id, "checkup").await, 0);
    assert_eq!(ctx.semaphore_count(strand.id, "destroy").await, 1);

    ctx.cleanup_strand(strand.id).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_sibling_strand_can_signal() {
    skip_if_no_db!();

    let Some(ctx) = TestContext::new().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };

    let target = ctx.create_parked_strand("Vm::Nexus", json!({})).await;
    let target_id = target.id;

    let mut registry = WorkflowRegistry::new();
    registry.register("Subnet::Nexus", START_LABEL, move |ctx| async move {
        // One workflow asking another to recompute derived state.
        ctx.signal(target_id, "refresh_firewall").await?;
        Ok(StepOutcome::hop("wait"))
    });
    let dispatcher = test_dispatcher(&ctx, registry);

    let sender = ctx.create_parked_strand("Subnet::Nexus", json!({})).await;
    let result = dispatch_current(&ctx, &dispatcher, sender.id).await;
    assert_eq!(result, DispatchResult::Advanced);

    assert_eq!(ctx.semaphore_count(target_id, "refresh_firewall").await, 1);

    ctx.cleanup_strand(sender.id).await;
    ctx.cleanup_strand(target_id).await;
}

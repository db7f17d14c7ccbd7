// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The workflow registry: an explicit map from `(prog, label)` to a step
//! function.
//!
//! Dispatch is text-addressed but deliberately not reflective: every valid
//! `(prog, label)` pair is registered up front, so the full step set is
//! statically enumerable and testable. Collaborators build a registry at
//! process start and hand it to the scheduler; it never changes afterwards.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::step::{StepContext, StepOutcome};

/// The future a step function returns.
pub type StepFuture = Pin<Box<dyn Future<Output = anyhow::Result<StepOutcome>> + Send>>;

/// A registered step function.
///
/// Takes ownership of the context and must resolve to exactly one outcome;
/// an `Err` (or a panic) is treated as a transient failure and retried with
/// backoff.
pub type StepFn = Arc<dyn Fn(StepContext) -> StepFuture + Send + Sync>;

/// Maps `(prog, label)` pairs to step functions.
#[derive(Default, Clone)]
pub struct WorkflowRegistry {
    steps: HashMap<(String, String), StepFn>,
}

impl WorkflowRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the step function for `(prog, label)`.
    ///
    /// Re-registering a pair replaces the previous function; the last
    /// registration wins.
    pub fn register<F, Fut>(&mut self, prog: &str, label: &str, step: F)
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<StepOutcome>> + Send + 'static,
    {
        self.steps.insert(
            (prog.to_string(), label.to_string()),
            Arc::new(move |ctx| Box::pin(step(ctx))),
        );
    }

    /// Resolve the step function for `(prog, label)`.
    pub fn resolve(&self, prog: &str, label: &str) -> Option<StepFn> {
        self.steps
            .get(&(prog.to_string(), label.to_string()))
            .cloned()
    }

    /// Whether `(prog, label)` is registered.
    pub fn contains(&self, prog: &str, label: &str) -> bool {
        self.steps
            .contains_key(&(prog.to_string(), label.to_string()))
    }

    /// Number of registered steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// All registered `(prog, label)` pairs, for enumeration in tests and
    /// startup validation.
    pub fn registered_steps(&self) -> impl Iterator<Item = (&str, &str)> {
        self.steps
            .keys()
            .map(|(prog, label)| (prog.as_str(), label.as_str()))
    }

    /// All labels registered for a prog.
    pub fn labels_for(&self, prog: &str) -> Vec<&str> {
        let mut labels: Vec<&str> = self
            .steps
            .keys()
            .filter(|(p, _)| p == prog)
            .map(|(_, label)| label.as_str())
            .collect();
        labels.sort_unstable();
        labels
    }
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("steps", &self.steps.len())
            .finish()
    }
}

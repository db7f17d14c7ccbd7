// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Label dispatch: resolve a strand's `(prog, label)` to a step function,
//! run it, and persist the result.
//!
//! Exactly one step runs per dispatch. The step executes in its own task so
//! a panic is contained, and under a watchdog derived from the lease
//! duration so a runaway step is aborted while the lease is still held
//! (rather than letting another worker take over mid-run). Step errors,
//! panics, and watchdog aborts are all transient failures: the strand keeps
//! its label and is rescheduled after an exponential backoff.
//!
//! An unknown `(prog, label)` pair is different: it is a configuration
//! error retrying cannot fix, so the strand is terminated immediately with
//! a diagnostic exitval.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::persistence::{Persistence, StrandRecord};
use crate::registry::WorkflowRegistry;
use crate::step::{EXIT_LABEL, StepContext, StepOutcome};

/// Exponential backoff with a configurable base and cap.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound on the delay.
    pub cap: Duration,
}

impl BackoffPolicy {
    /// The delay before re-attempting a label that has failed `tries`
    /// consecutive times. Non-decreasing in `tries` and bounded by the cap.
    pub fn delay(&self, tries: i32) -> Duration {
        let exponent = tries.saturating_sub(1).clamp(0, 31) as u32;
        self.base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.cap)
    }
}

/// What a dispatch did to the strand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// The strand advanced: a hop, or a frame return to its caller.
    Advanced,
    /// The strand napped; same label later.
    Napped,
    /// The strand reached a terminal state by its own choice.
    Finished,
    /// Transient failure; rescheduled with backoff at the same label.
    Failed {
        /// Consecutive failures of this label so far.
        tries: i32,
    },
    /// Configuration error; strand terminated with a diagnostic exitval.
    Fatal,
}

/// Resolves and runs one step per due strand, applying the outcome.
pub struct Dispatcher {
    persistence: Arc<dyn Persistence>,
    registry: Arc<WorkflowRegistry>,
    backoff: BackoffPolicy,
    step_timeout: Duration,
}

impl Dispatcher {
    /// Create a dispatcher over the given registry and store.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        registry: Arc<WorkflowRegistry>,
        backoff: BackoffPolicy,
        step_timeout: Duration,
    ) -> Self {
        Self {
            persistence,
            registry,
            backoff,
            step_timeout,
        }
    }

    /// Run one step for a leased strand and persist the result.
    ///
    /// The caller holds the lease for the duration of this call and
    /// releases it afterwards.
    #[instrument(skip(self, strand), fields(strand_id = %strand.id, prog = %strand.prog, label = %strand.label))]
    pub async fn dispatch(&self, strand: StrandRecord) -> Result<DispatchResult, EngineError> {
        let Some(step) = self.registry.resolve(&strand.prog, &strand.label) else {
            return self
                .terminate_misconfigured(
                    &strand,
                    EngineError::UnknownStep {
                        prog: strand.prog.clone(),
                        label: strand.label.clone(),
                    },
                )
                .await;
        };

        let ctx = match StepContext::new(strand.clone(), self.persistence.clone()) {
            Ok(ctx) => ctx,
            Err(err) if err.is_fatal() => {
                return self.terminate_misconfigured(&strand, err).await;
            }
            Err(err) => return Err(err),
        };

        // Run the step in its own task: a panic is contained as a JoinError,
        // and the watchdog can abort it at the next await point.
        let mut handle = tokio::spawn(step(ctx));
        let run = match tokio::time::timeout(self.step_timeout, &mut handle).await {
            Ok(res) => res,
            Err(_elapsed) => {
                handle.abort();
                let timeout = EngineError::StepTimeout {
                    strand_id: strand.id,
                };
                return self.record_failure(&strand, timeout.to_string()).await;
            }
        };

        match run {
            Ok(Ok(outcome)) => self.apply(&strand, outcome).await,
            Ok(Err(step_err)) => {
                self.record_failure(&strand, format!("{step_err:#}")).await
            }
            Err(join_err) => {
                self.record_failure(&strand, format!("step panicked: {join_err}"))
                    .await
            }
        }
    }

    /// Persist the outcome a step returned.
    async fn apply(
        &self,
        strand: &StrandRecord,
        outcome: StepOutcome,
    ) -> Result<DispatchResult, EngineError> {
        match outcome {
            StepOutcome::Hop { prog, label, delay } => {
                let schedule = Utc::now() + to_chrono(delay.unwrap_or(Duration::ZERO));
                self.persistence
                    .apply_hop(strand.id, prog.as_deref(), &label, schedule)
                    .await?;
                debug!(to = %label, prog = ?prog, "strand hopped");
                Ok(DispatchResult::Advanced)
            }
            StepOutcome::Nap { duration } => {
                let until = Utc::now() + to_chrono(duration);
                self.persistence.apply_nap(strand.id, until).await?;
                debug!(secs = duration.as_secs(), "strand napping");
                Ok(DispatchResult::Napped)
            }
            StepOutcome::Pop { value } => self.apply_pop(strand.id, value).await,
            StepOutcome::Exit { value } => {
                self.persistence
                    .finish_strand(strand.id, &value, EXIT_LABEL)
                    .await?;
                debug!("strand exited");
                Ok(DispatchResult::Finished)
            }
            StepOutcome::Fail { value } => {
                self.persistence.fail_strand(strand.id, &value).await?;
                // Terminal exitvals are the user-visible failure reason;
                // always observable.
                error!(exitval = %value, "strand failed");
                Ok(DispatchResult::Finished)
            }
        }
    }

    /// Apply a pop: return to the linked caller frame, or terminate at the
    /// bottom of the stack.
    ///
    /// The stack is re-read here because the step owns the context during
    /// its run; any frames it pushed or merged are already persisted.
    async fn apply_pop(&self, strand_id: Uuid, value: Value) -> Result<DispatchResult, EngineError> {
        let strand = self
            .persistence
            .get_strand(strand_id)
            .await?
            .ok_or(EngineError::StrandNotFound { strand_id })?;

        let mut stack = strand.frames()?;
        match stack.link() {
            Some(link) if stack.depth() > 1 => {
                stack.pop();
                stack.merge(json!({ "retval": value }));
                self.persistence
                    .apply_return(strand_id, &stack.to_value(), &link.prog, &link.label)
                    .await?;
                debug!(to_prog = %link.prog, to_label = %link.label, "strand frame popped");
                Ok(DispatchResult::Advanced)
            }
            _ => {
                self.persistence
                    .finish_strand(strand_id, &value, EXIT_LABEL)
                    .await?;
                debug!("strand popped its root frame and exited");
                Ok(DispatchResult::Finished)
            }
        }
    }

    /// Record a transient failure: bump `try`, defer by the backoff delay.
    async fn record_failure(
        &self,
        strand: &StrandRecord,
        details: String,
    ) -> Result<DispatchResult, EngineError> {
        let delay = self.backoff.delay(strand.tries + 1);
        let schedule = Utc::now() + to_chrono(delay);
        let tries = self.persistence.record_failure(strand.id, schedule).await?;
        warn!(
            tries,
            backoff_secs = delay.as_secs(),
            error = %details,
            "strand step failed; rescheduled"
        );
        Ok(DispatchResult::Failed { tries })
    }

    /// Terminate a strand whose configuration cannot dispatch.
    async fn terminate_misconfigured(
        &self,
        strand: &StrandRecord,
        err: EngineError,
    ) -> Result<DispatchResult, EngineError> {
        let exitval = json!({
            "error": err.error_code(),
            "message": err.to_string(),
            "prog": strand.prog,
            "label": strand.label,
        });
        self.persistence.fail_strand(strand.id, &exitval).await?;
        error!(code = err.error_code(), message = %err, "strand terminated: not dispatchable");
        Ok(DispatchResult::Fatal)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("backoff", &self.backoff)
            .field("step_timeout", &self.step_timeout)
            .finish()
    }
}

/// Convert a std duration to a chrono one for schedule arithmetic.
fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(3650))
}

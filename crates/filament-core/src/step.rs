// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The step result protocol and the context a step executes with.
//!
//! A step function receives a [`StepContext`] (the strand's identity, its
//! current frame, and handles for the in-step operations: stack mutation,
//! bud, semaphores, child polling) and communicates its outcome through the
//! [`StepOutcome`] it returns. There is no ambient engine state: everything
//! a step can do travels through the context, and exactly one outcome is
//! returned per invocation.
//!
//! Labels are workflow-specific names. The engine only imposes conventions:
//! [`START_LABEL`] is where new strands begin, [`EXIT_LABEL`] is the
//! sentinel a strand rests at after `exit`, and [`FAILED_LABEL`] is the
//! customary target for workflow-defined failure hops.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::EngineError;
use crate::persistence::{Persistence, StrandRecord, StrandSpec};
use crate::stack::{FrameStack, Link};

/// Conventional initial label for new strands.
pub const START_LABEL: &str = "start";

/// Sentinel terminal label a strand rests at after `exit`.
pub const EXIT_LABEL: &str = "exit";

/// Conventional label workflows hop to on unrecoverable errors.
///
/// Not special-cased by the engine; it is a naming convention only.
pub const FAILED_LABEL: &str = "failed";

/// The outcome a step function returns, applied to the strand row by the
/// dispatcher. Variants are mutually exclusive per invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Advance to another label (and optionally another prog), eligible
    /// again after `delay` (immediately when None). Resets `try`.
    Hop {
        /// New prog for a handoff, None to stay in the current one.
        prog: Option<String>,
        /// New label.
        label: String,
        /// Optional deferral before the next step runs.
        delay: Option<Duration>,
    },

    /// Re-run the same label after a delay. Not a failure; `try` is
    /// untouched and the lease is released.
    Nap {
        /// How long until the strand is eligible again.
        duration: Duration,
    },

    /// Return from the current frame. With a linked caller frame beneath,
    /// control pops back to the caller and `value` is delivered into the
    /// caller's frame under the `retval` key. At the bottom of the stack
    /// this is terminal, identical to `Exit`.
    Pop {
        /// The value handed back.
        value: Value,
    },

    /// Terminate the strand normally: `value` becomes its `retval` and it
    /// is never scheduled again.
    Exit {
        /// The terminal success document.
        value: Value,
    },

    /// Terminate the strand with a failure report: `value` becomes its
    /// `exitval` and it is never scheduled again.
    Fail {
        /// The terminal failure document.
        value: Value,
    },
}

impl StepOutcome {
    /// Advance to `label`, immediately eligible.
    pub fn hop(label: impl Into<String>) -> Self {
        Self::Hop {
            prog: None,
            label: label.into(),
            delay: None,
        }
    }

    /// Advance to `label`, eligible after `delay`.
    pub fn hop_in(label: impl Into<String>, delay: Duration) -> Self {
        Self::Hop {
            prog: None,
            label: label.into(),
            delay: Some(delay),
        }
    }

    /// Hand the strand off to another prog at `label`.
    ///
    /// Callers delegating a nested unit of work push a frame first so the
    /// new prog gets its own working memory and a way back; see
    /// [`StepContext::push_frame`].
    pub fn handoff(prog: impl Into<String>, label: impl Into<String>) -> Self {
        Self::Hop {
            prog: Some(prog.into()),
            label: label.into(),
            delay: None,
        }
    }

    /// Re-run the same label after `duration`.
    pub fn nap(duration: Duration) -> Self {
        Self::Nap { duration }
    }

    /// Return `value` from the current frame (terminal at the stack bottom).
    pub fn pop(value: Value) -> Self {
        Self::Pop { value }
    }

    /// Terminate normally with `value` as the strand's retval.
    pub fn exit(value: Value) -> Self {
        Self::Exit { value }
    }

    /// Terminate with `value` as the strand's exitval.
    pub fn fail(value: Value) -> Self {
        Self::Fail { value }
    }
}

/// Execution context handed to a step function.
///
/// Holds a snapshot of the strand row as it was leased, the decoded frame
/// stack, and the persistence handle for in-step operations. Stack
/// mutations persist immediately; a step interrupted afterwards re-runs its
/// label against the updated stack, which is why steps must be idempotent
/// from the start of a label.
pub struct StepContext {
    strand: StrandRecord,
    stack: FrameStack,
    persistence: Arc<dyn Persistence>,
}

impl StepContext {
    pub(crate) fn new(
        strand: StrandRecord,
        persistence: Arc<dyn Persistence>,
    ) -> Result<Self, EngineError> {
        let stack = strand.frames()?;
        Ok(Self {
            strand,
            stack,
            persistence,
        })
    }

    /// The strand's id.
    pub fn strand_id(&self) -> Uuid {
        self.strand.id
    }

    /// The strand that budded this one, if any.
    pub fn parent_id(&self) -> Option<Uuid> {
        self.strand.parent_id
    }

    /// The prog this step belongs to.
    pub fn prog(&self) -> &str {
        &self.strand.prog
    }

    /// The label being executed.
    pub fn label(&self) -> &str {
        &self.strand.label
    }

    /// Consecutive failures of this label so far.
    pub fn tries(&self) -> i32 {
        self.strand.tries
    }

    /// The current frame.
    pub fn frame(&self) -> &Map<String, Value> {
        self.stack.current_frame()
    }

    /// Look up a key in the current frame.
    pub fn frame_get(&self, key: &str) -> Option<&Value> {
        self.stack.get(key)
    }

    /// Decode the current frame into the workflow's own frame type.
    ///
    /// Workflows define a frame struct and marshal at this boundary instead
    /// of passing untyped maps through their logic.
    pub fn decode_frame<T: DeserializeOwned>(&self) -> Result<T, EngineError> {
        let value = Value::Object(self.stack.current_frame().clone());
        Ok(serde_json::from_value(value)?)
    }

    /// Merge `patch` into the current frame and persist the stack.
    pub async fn update_stack(&mut self, patch: Value) -> Result<(), EngineError> {
        self.stack.merge(patch);
        self.persistence
            .save_stack(self.strand.id, &self.stack.to_value())
            .await
    }

    /// Prepend a fresh frame and persist the stack.
    ///
    /// The new frame records a link back to the current prog at
    /// `resume_label`; when the delegated work pops, control returns there.
    /// Typically followed by returning [`StepOutcome::handoff`].
    pub async fn push_frame(
        &mut self,
        values: Value,
        resume_label: &str,
    ) -> Result<(), EngineError> {
        self.stack.push(
            values,
            Link {
                prog: self.strand.prog.clone(),
                label: resume_label.to_string(),
            },
        );
        self.persistence
            .save_stack(self.strand.id, &self.stack.to_value())
            .await
    }

    /// Spawn a child strand and return its id.
    ///
    /// The child starts at [`START_LABEL`] with `frame` as its root frame
    /// and this strand as its parent. The caller records the id (usually in
    /// its own frame) and separately chooses its own outcome; budding does
    /// not touch this strand's label or schedule.
    pub async fn bud(&self, prog: &str, frame: Value) -> Result<Uuid, EngineError> {
        let spec = StrandSpec::new(prog)
            .with_frame(frame)
            .with_parent(self.strand.id);
        let child = self.persistence.create_strand(&spec).await?;
        Ok(child.id)
    }

    /// Send a named semaphore to another strand.
    pub async fn signal(&self, target: Uuid, name: &str) -> Result<(), EngineError> {
        self.persistence.signal(target, name, None).await
    }

    /// Check for a pending semaphore directed at this strand and clear all
    /// matching rows. Returns whether any were pending.
    ///
    /// Delivery is at-least-once, so the action taken on `true` must be
    /// idempotent.
    pub async fn consume(&self, name: &str) -> Result<bool, EngineError> {
        self.persistence
            .consume_semaphore(self.strand.id, name)
            .await
    }

    /// Delete and return terminal children, their retval/exitval intact.
    pub async fn reap(&self) -> Result<Vec<StrandRecord>, EngineError> {
        self.persistence.reap_children(self.strand.id).await
    }

    /// Count children that have not yet reached a terminal state.
    pub async fn live_children(&self) -> Result<i64, EngineError> {
        self.persistence.live_children(self.strand.id).await
    }

    /// Observe one of this strand's children.
    ///
    /// Returns None for unknown ids and for strands that are not children
    /// of this one; a parent only ever observes, never mutates.
    pub async fn child(&self, child_id: Uuid) -> Result<Option<StrandRecord>, EngineError> {
        let record = self.persistence.get_strand(child_id).await?;
        Ok(record.filter(|r| r.parent_id == Some(self.strand.id)))
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("strand_id", &self.strand.id)
            .field("prog", &self.strand.prog)
            .field("label", &self.strand.label)
            .field("depth", &self.stack.depth())
            .finish()
    }
}

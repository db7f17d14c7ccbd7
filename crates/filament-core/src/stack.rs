// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The per-strand frame stack.
//!
//! A strand's working memory is an ordered sequence of frames, persisted as
//! a JSONB array. The first element is the *current* frame: the one the
//! executing step reads and mutates. Delegating to another prog pushes a
//! fresh frame (hiding the caller's) that records where control returns;
//! popping restores the caller's frame.
//!
//! Frames are opaque documents here. Workflows define their own frame
//! structs and (de)serialize at the boundary; the engine never interprets
//! frame contents beyond the reserved `link` entry.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::EngineError;

/// Reserved frame entry naming the caller a popped frame returns to.
pub const LINK_KEY: &str = "link";

/// Where control resumes when the frame carrying this link is popped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// The caller's workflow implementation name.
    pub prog: String,
    /// The label the caller resumes at.
    pub label: String,
}

/// A strand's frame stack, decoded from the `strand.stack` column.
///
/// Always holds at least one frame; an empty stored array is normalized to
/// a single empty frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameStack {
    frames: Vec<Map<String, Value>>,
}

impl FrameStack {
    /// A fresh stack holding one copy of the given frame.
    ///
    /// Non-object values are replaced with an empty frame.
    pub fn root(frame: Value) -> Self {
        let frame = match frame {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            frames: vec![frame],
        }
    }

    /// Decode a stack from its stored JSONB representation.
    pub fn from_value(strand_id: Uuid, value: &Value) -> Result<Self, EngineError> {
        let items = value.as_array().ok_or_else(|| EngineError::MalformedStack {
            strand_id,
            details: "stack is not an array".to_string(),
        })?;

        let mut frames = Vec::with_capacity(items.len().max(1));
        for item in items {
            match item {
                Value::Object(map) => frames.push(map.clone()),
                other => {
                    return Err(EngineError::MalformedStack {
                        strand_id,
                        details: format!("frame is not an object: {}", other),
                    });
                }
            }
        }
        if frames.is_empty() {
            frames.push(Map::new());
        }

        Ok(Self { frames })
    }

    /// Encode the stack for persistence.
    pub fn to_value(&self) -> Value {
        Value::Array(self.frames.iter().cloned().map(Value::Object).collect())
    }

    /// Number of frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// The current frame.
    pub fn current_frame(&self) -> &Map<String, Value> {
        &self.frames[0]
    }

    /// Look up a key in the current frame.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.frames[0].get(key)
    }

    /// Merge the top-level entries of `patch` into the current frame.
    ///
    /// Existing keys are overwritten; non-object patches are ignored.
    pub fn merge(&mut self, patch: Value) {
        if let Value::Object(map) = patch {
            for (key, value) in map {
                self.frames[0].insert(key, value);
            }
        }
    }

    /// Prepend a new frame carrying `values` and a return link.
    ///
    /// Non-object values are replaced with an empty frame.
    pub fn push(&mut self, values: Value, link: Link) {
        let mut frame = match values {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        frame.insert(
            LINK_KEY.to_string(),
            serde_json::to_value(link).unwrap_or(Value::Null),
        );
        self.frames.insert(0, frame);
    }

    /// Remove and return the current frame.
    ///
    /// Returns None at the bottom of the stack: the root frame is never
    /// popped, so a runnable strand always has working memory.
    pub fn pop(&mut self) -> Option<Map<String, Value>> {
        if self.frames.len() > 1 {
            Some(self.frames.remove(0))
        } else {
            None
        }
    }

    /// The return link recorded in the current frame, if any.
    pub fn link(&self) -> Option<Link> {
        self.frames[0]
            .get(LINK_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

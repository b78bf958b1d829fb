// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Goblin state machine with typed state transitions.
//!
//! Implements the goblin lifecycle: Running → Frozen → Thawed → Running, with
//! Failed reachable from every state. Invalid transitions result in
//! StateTransitionError.

use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;
use crate::types::GoblinId;

/// Goblin lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GoblinState {
    /// A live process is associated with the goblin.
    Running,

    /// The latest freeze succeeded; no process is associated.
    Frozen,

    /// A restore succeeded and the new pid is not known yet.
    Thawed,

    /// The latest freeze or thaw failed. Accepts a fresh freeze or a thaw.
    Failed,
}

impl GoblinState {
    /// Get the state name for error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Frozen => "Frozen",
            Self::Thawed => "Thawed",
            Self::Failed => "Failed",
        }
    }

    /// Check if transition to the target state is valid.
    pub fn can_transition_to(&self, target: GoblinState) -> bool {
        matches!(
            (self, target),
            // From Running
            (Self::Running, Self::Frozen) |
            (Self::Running, Self::Failed) |
            // From Frozen
            (Self::Frozen, Self::Thawed) |
            (Self::Frozen, Self::Failed) |
            // From Thawed
            (Self::Thawed, Self::Running) |
            (Self::Thawed, Self::Failed) |
            // From Failed
            (Self::Failed, Self::Frozen) |
            (Self::Failed, Self::Thawed) |
            (Self::Failed, Self::Failed)
        )
    }

    /// Validate a transition for `goblin_id`.
    pub fn check_transition(
        &self,
        goblin_id: &GoblinId,
        target: GoblinState,
    ) -> Result<(), StateTransitionError> {
        if self.can_transition_to(target) {
            Ok(())
        } else {
            Err(StateTransitionError::InvalidTransition {
                goblin_id: goblin_id.clone(),
                from: self.name(),
                to: target.name(),
            })
        }
    }

    /// Whether a pid is expected to be tracked in this state.
    pub fn has_process(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for GoblinState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Custom error types for the goblin lifecycle manager.
//!
//! Explicit enum error types only. No `Box<dyn Error>`, no `anyhow::Result`;
//! every failure a caller can react to is its own variant.

use std::path::PathBuf;

use thiserror::Error;

use crate::image::AttemptFailure;
use crate::types::{GoblinId, ProcessId, SequenceNumber};

/// Top-level error type for the lifecycle manager.
#[derive(Debug, Error)]
pub enum GoblinError {
    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Local contract violations - surfaced immediately, never retried
    // =========================================================================
    #[error("Goblin not found: {0}")]
    NotFound(GoblinId),

    #[error("Goblin already exists: {0}")]
    AlreadyExists(GoblinId),

    #[error("No such process: {0}")]
    NoSuchProcess(ProcessId),

    #[error("Conflict: {0}")]
    Conflict(#[from] StateTransitionError),

    // =========================================================================
    // Engine attempt failures - goblin is moved to Failed
    // =========================================================================
    #[error("Engine timed out: {0}")]
    Timeout(Box<AttemptFailure>),

    #[error("Engine failure: {0}")]
    EngineFailure(Box<AttemptFailure>),

    #[error("Engine invocation error: {0}")]
    Engine(#[from] EngineError),

    // =========================================================================
    // System Errors - attempt aborted before the engine runs
    // =========================================================================
    #[error("IO error: {context} ({path}) - {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Registry persistence error at {path}: {message}")]
    Persistence { path: PathBuf, message: String },

    #[error("Failed to launch goblin: {reason}")]
    LaunchFailed { reason: String },
}

impl GoblinError {
    /// The failed attempt carried by `Timeout` and `EngineFailure`.
    pub fn attempt(&self) -> Option<&AttemptFailure> {
        match self {
            Self::Timeout(failure) | Self::EngineFailure(failure) => Some(failure),
            _ => None,
        }
    }

    /// True for `NotFound` and `Conflict`, which callers must not retry.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Conflict(_))
    }
}

/// Hard validation errors for configuration and identifiers.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Schema validation failed: {message}")]
    SchemaValidation { message: String },
}

/// Conflicts raised by the goblin state machine and transition lock.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Cannot transition from {from} to {to} for goblin {goblin_id}")]
    InvalidTransition {
        goblin_id: GoblinId,
        from: &'static str,
        to: &'static str,
    },

    #[error("Cannot {operation} goblin {goblin_id} while it is {state}")]
    OperationNotAllowed {
        goblin_id: GoblinId,
        operation: &'static str,
        state: &'static str,
    },

    #[error("Goblin {goblin_id} already has a transition in flight")]
    TransitionInFlight { goblin_id: GoblinId },

    #[error("Goblin {goblin_id} has no usable target for {operation}: {reason}")]
    MissingTarget {
        goblin_id: GoblinId,
        operation: &'static str,
        reason: String,
    },

    #[error("Goblin {goblin_id} is tracked as pid {tracked}, not {requested}")]
    TargetMismatch {
        goblin_id: GoblinId,
        tracked: ProcessId,
        requested: ProcessId,
    },

    #[error("Goblin {goblin_id} already has an image with sequence {sequence}")]
    DuplicateImage {
        goblin_id: GoblinId,
        sequence: SequenceNumber,
    },
}

/// Errors starting or supervising the engine subprocess.
///
/// These mean the engine never produced an outcome; they are distinct from
/// an engine run that exited with failure.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Executable '{name}' not found (override via {env_var})")]
    BinaryNotFound { name: String, env_var: String },

    #[error("{direction} requires a {expected} target")]
    TargetMismatch {
        direction: &'static str,
        expected: &'static str,
    },

    #[error("Image directory {path} unusable: {reason}")]
    ImageDirectory { path: PathBuf, reason: String },

    #[error("Failed to spawn engine: {reason}")]
    SpawnFailed { reason: String },

    #[error("Failed to supervise engine: {reason}")]
    Supervise { reason: String },
}

/// Result type alias using GoblinError.
pub type GoblinResult<T> = Result<T, GoblinError>;

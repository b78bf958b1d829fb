//! Goblin Core Library
//!
//! Lifecycle manager for checkpointed processes ("goblins"). Tracks which
//! on-disk image belongs to which process identity, drives CRIU through a
//! supervised privileged subprocess, classifies engine failures from their
//! logs, and diagnoses mount-namespace ancestry drift across repeated
//! freeze → thaw → freeze cycles.

pub mod ancestry;
pub mod config;
pub mod engine;
pub mod error;
pub mod image;
pub mod log_interpreter;
pub mod manager;
pub mod process;
pub mod registry;
pub mod state;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use ancestry::{AncestryDiagnosis, AncestryTable, AncestryTracker, MountAncestryEntry};
pub use config::{Config, ConfigLoader, EngineConfig, LifecycleConfig};
pub use engine::{CriuEngine, Direction, Engine, EngineTarget, InvocationOptions, InvocationResult};
pub use error::{
    EngineError, GoblinError, GoblinResult, HardValidationError, StateTransitionError,
};
pub use image::{AttemptFailure, FailureReason, Image, ImageLayout, ImageOutcome, Operation};
pub use log_interpreter::{LogClassification, LogInterpreter, LogReport};
pub use manager::{BeamOutcome, BeamRequest, FreezeRequest, GoblinManager, ThawRequest};
pub use registry::{Goblin, GoblinRegistry};
pub use state::GoblinState;
pub use types::{Generation, GoblinId, ProcessId, SequenceNumber};

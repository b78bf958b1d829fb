// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Checkpoint/restore engine invocation.
//!
//! The engine is reached only through the [`Engine`] trait so lifecycle code
//! can run against a fake in tests. [`CriuEngine`] drives the real CRIU
//! binaries through `sudo -n`.

mod command;
mod invoker;

pub use command::{env_override_var, resolve_command, EnginePrograms};
pub use invoker::{
    wait_for_pidfile, CriuEngine, Direction, Engine, EngineTarget, InheritFd, InvocationOptions,
    InvocationResult,
};

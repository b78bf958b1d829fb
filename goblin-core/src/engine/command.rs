// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Executable resolution and engine command lines.

use std::ffi::OsString;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use crate::error::EngineError;

/// Environment variable prefix for executable overrides.
const ENV_PREFIX: &str = "GOBLIN_";

/// Well-known install locations checked before `$PATH`.
const SYSTEM_DIRS: [&str; 6] = [
    "/usr/sbin",
    "/usr/bin",
    "/sbin",
    "/bin",
    "/usr/local/sbin",
    "/usr/local/bin",
];

/// Name of the override variable for `executable`, e.g. `criu-ns` → `GOBLIN_CRIU_NS`.
pub fn env_override_var(executable: &str) -> String {
    let sanitized: String = executable
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}{}", ENV_PREFIX, sanitized)
}

/// Resolve an executable to a concrete path.
///
/// Order: `GOBLIN_<NAME>` override, then the system directories, then `$PATH`.
/// An override may be a bare name, in which case it is searched for as well.
pub fn resolve_command(executable: &str) -> Result<PathBuf, EngineError> {
    let env_var = env_override_var(executable);
    let override_value = std::env::var(&env_var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let candidate = override_value.unwrap_or_else(|| executable.trim().to_string());

    find_executable(&candidate).ok_or(EngineError::BinaryNotFound {
        name: candidate,
        env_var,
    })
}

fn find_executable(candidate: &str) -> Option<PathBuf> {
    if candidate.is_empty() {
        return None;
    }

    if candidate.contains('/') {
        let path = PathBuf::from(candidate);
        return is_executable(&path).then_some(path);
    }

    let path_dirs = std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect::<Vec<_>>())
        .unwrap_or_default();

    SYSTEM_DIRS
        .iter()
        .map(PathBuf::from)
        .chain(path_dirs)
        .map(|dir| dir.join(candidate))
        .find(|path| is_executable(path))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Resolved executables for one engine.
#[derive(Debug, Clone)]
pub struct EnginePrograms {
    /// Privilege wrapper; `None` runs the engine directly.
    pub sudo: Option<PathBuf>,
    pub criu: PathBuf,
    /// Namespace-aware restore helper.
    pub criu_ns: Option<PathBuf>,
}

impl EnginePrograms {
    /// argv prefix that runs `program` with privileges.
    pub fn privileged(&self, program: &Path) -> Vec<OsString> {
        self.privileged_keeping(program, None)
    }

    /// Like [`privileged`](Self::privileged), but descriptors up to
    /// `highest_fd` stay open across the wrapper (`sudo -C`).
    pub fn privileged_keeping(&self, program: &Path, highest_fd: Option<RawFd>) -> Vec<OsString> {
        let mut argv = Vec::new();
        if let Some(sudo) = &self.sudo {
            argv.push(sudo.clone().into_os_string());
            argv.push("-n".into());
            if let Some(fd) = highest_fd {
                argv.push("-C".into());
                argv.push((fd + 1).max(3).to_string().into());
            }
        }
        argv.push(program.as_os_str().to_os_string());
        argv
    }

    /// The binary used for restores.
    pub fn restore_program(&self) -> &Path {
        self.criu_ns.as_deref().unwrap_or(&self.criu)
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Goblin process spawning, liveness checks and restored stdio.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

use nix::errno::Errno;
use nix::sys::signal;

use crate::error::{GoblinError, GoblinResult};
use crate::image::PIPE_PREFIX;
use crate::types::ProcessId;

/// Spawn `command` as the leader of its own process group.
///
/// stdin is `/dev/null`; stdout and stderr are appended to `output`. The
/// child is reaped by a background thread so it never lingers as a zombie
/// in this process.
pub fn spawn_detached(command: &[String], output: &Path) -> GoblinResult<ProcessId> {
    let (program, args) = command.split_first().ok_or_else(|| GoblinError::LaunchFailed {
        reason: "empty command".to_string(),
    })?;

    let log = open_output(output)?;
    let log_err = log.try_clone().map_err(|e| GoblinError::Io {
        context: "duplicating goblin output",
        path: output.to_path_buf(),
        source: e,
    })?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .process_group(0)
        .spawn()
        .map_err(|e| GoblinError::LaunchFailed {
            reason: format!("Failed to spawn '{}': {}", program, e),
        })?;

    let pid = ProcessId::new(child.id()).map_err(|e| GoblinError::LaunchFailed {
        reason: e.to_string(),
    })?;

    tracing::debug!(pid = %pid, program = %program, output = %output.display(), "Spawned goblin process");

    std::thread::spawn(move || {
        let status = child.wait();
        tracing::debug!(pid = %pid, status = ?status, "Goblin process exited");
    });

    Ok(pid)
}

/// Whether `pid` names a live process.
///
/// A process owned by another user still counts as alive.
pub fn process_exists(pid: ProcessId) -> bool {
    match signal::kill(pid.as_nix(), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// An open file handed to a restore in place of a dumped stdio pipe.
#[derive(Debug)]
pub struct StdioReplacement {
    /// `stdin`, `stdout` or `stderr`.
    pub stream: String,
    /// The dumped pipe, e.g. `pipe:[12345]`.
    pub resource: String,
    pub file: File,
}

/// Open replacements for the pipes in a captured stdio map.
///
/// stdin reads from `/dev/null`; stdout and stderr append to `output`.
/// Streams that were not pipes are left to the engine.
pub fn open_stdio_replacements(
    stdio: &BTreeMap<String, String>,
    output: &Path,
) -> GoblinResult<Vec<StdioReplacement>> {
    let mut replacements = Vec::new();
    for (stream, resource) in stdio {
        if !resource.starts_with(PIPE_PREFIX) {
            continue;
        }
        let file = match stream.as_str() {
            "stdin" => File::open("/dev/null").map_err(|e| GoblinError::Io {
                context: "opening /dev/null",
                path: "/dev/null".into(),
                source: e,
            })?,
            "stdout" | "stderr" => open_output(output)?,
            _ => continue,
        };
        replacements.push(StdioReplacement {
            stream: stream.clone(),
            resource: resource.clone(),
            file,
        });
    }
    Ok(replacements)
}

fn open_output(output: &Path) -> GoblinResult<File> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).map_err(|e| GoblinError::Io {
            context: "creating goblin directory",
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(output)
        .map_err(|e| GoblinError::Io {
            context: "opening goblin output",
            path: output.to_path_buf(),
            source: e,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_exists() {
        let pid = ProcessId::new(std::process::id()).unwrap();
        assert!(process_exists(pid));
    }

    #[test]
    fn test_empty_command_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = spawn_detached(&[], &dir.path().join("goblin.out"));
        assert!(matches!(result, Err(GoblinError::LaunchFailed { .. })));
    }

    #[test]
    fn test_spawn_writes_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let output = dir.path().join("gob").join("goblin.out");
        let command = vec!["sh".to_string(), "-c".to_string(), "echo hello-goblin".to_string()];

        let pid = spawn_detached(&command, &output).unwrap();
        assert!(pid.value() > 0);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let text = std::fs::read_to_string(&output).unwrap_or_default();
            if text.contains("hello-goblin") {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "output never written");
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
    }

    #[test]
    fn test_stdio_replacements_cover_pipes_only() {
        use std::io::Write;

        let dir = tempfile::TempDir::new().unwrap();
        let output = dir.path().join("gob").join("goblin.out");
        let stdio: BTreeMap<String, String> = [
            ("stdin", "pipe:[4101]"),
            ("stdout", "pipe:[4102]"),
            ("stderr", "/dev/pts/3"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut replacements = open_stdio_replacements(&stdio, &output).unwrap();
        let streams: Vec<&str> = replacements.iter().map(|r| r.stream.as_str()).collect();
        assert_eq!(streams, vec!["stdin", "stdout"]);
        assert_eq!(replacements[1].resource, "pipe:[4102]");

        replacements[1].file.write_all(b"restored\n").unwrap();
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "restored\n");
    }
}

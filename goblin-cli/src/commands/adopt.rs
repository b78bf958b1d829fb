// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `goblin adopt` command - Track an existing process.

use std::process::Command;

use goblin_core::engine::resolve_command;
use goblin_core::ProcessId;

use super::{fail, open_manager, run_blocking};

pub async fn execute(
    config_path: &str,
    pid: Option<u32>,
    pgrep: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let pid = match (pid, pgrep) {
        (Some(pid), _) => ProcessId::new(pid)?,
        (None, Some(pattern)) => pgrep_single(&pattern)?,
        (None, None) => return Err("either --pid or --pgrep is required".into()),
    };

    let manager = open_manager(config_path)?;
    match run_blocking(move || manager.adopt(pid)).await? {
        Ok(goblin) => {
            println!("✓ Adopted pid {} as goblin {}", pid, goblin.id);
            Ok(())
        }
        Err(e) => fail("Adopt", &e),
    }
}

/// Resolve a pattern to exactly one pid with `pgrep -f`.
fn pgrep_single(pattern: &str) -> Result<ProcessId, Box<dyn std::error::Error>> {
    let pgrep = resolve_command("pgrep")?;
    let output = Command::new(pgrep).arg("-f").arg(pattern).output()?;
    let own = std::process::id();

    let pids: Vec<u32> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .filter(|p| *p != own)
        .collect();

    match pids.as_slice() {
        [pid] => Ok(ProcessId::new(*pid)?),
        [] => Err(format!("pgrep found no process matching '{}'", pattern).into()),
        many => Err(format!(
            "pgrep matched {} processes for '{}': {:?}",
            many.len(),
            pattern,
            many
        )
        .into()),
    }
}

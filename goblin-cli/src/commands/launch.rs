// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `goblin launch` command - Spawn a command as a new goblin.

use super::{fail, open_manager, run_blocking};

pub async fn execute(config_path: &str, command: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let manager = open_manager(config_path)?;
    tracing::info!(command = ?command, "Launching goblin");

    let launcher = manager.clone();
    match run_blocking(move || launcher.launch(command)).await? {
        Ok(goblin) => {
            println!("✓ Goblin launched");
            println!("  ID:     {}", goblin.id);
            if let Some(pid) = goblin.pid {
                println!("  PID:    {}", pid);
            }
            println!("  Output: {}", manager.layout().output_path(&goblin.id).display());
            Ok(())
        }
        Err(e) => fail("Launch", &e),
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `goblin thaw` command - Restore a goblin.

use std::path::PathBuf;
use std::time::Duration;

use goblin_core::ThawRequest;

use super::{fail, open_manager, parse_id, run_blocking};

pub async fn execute(
    config_path: &str,
    id: &str,
    dir: Option<String>,
    timeout_ms: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = parse_id(id)?;
    let request = ThawRequest {
        source: dir.map(PathBuf::from),
        timeout: timeout_ms.map(Duration::from_millis),
    };

    let manager = open_manager(config_path)?;
    let goblin_id = id.clone();
    match run_blocking(move || manager.thaw(&goblin_id, request)).await? {
        Ok(goblin) => {
            println!("✓ Goblin {} thawed", id);
            if let Some(pid) = goblin.pid {
                println!("  PID:        {}", pid);
            }
            println!("  Generation: {}", goblin.generation);
            if let Some(dir) = &goblin.image_dir {
                println!("  Image:      {}", dir.display());
            }
            Ok(())
        }
        Err(e) => fail("Thaw", &e),
    }
}

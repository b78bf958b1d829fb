// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `goblin freeze` command - Checkpoint a goblin.

use std::time::Duration;

use goblin_core::{FreezeRequest, ProcessId};

use super::{fail, open_manager, parse_id, run_blocking};

pub async fn execute(
    config_path: &str,
    id: &str,
    pid: Option<u32>,
    timeout_ms: Option<u64>,
    leave_running: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = parse_id(id)?;
    let request = FreezeRequest {
        pid: pid.map(ProcessId::new).transpose()?,
        timeout: timeout_ms.map(Duration::from_millis),
        leave_running: leave_running.then_some(true),
    };

    let manager = open_manager(config_path)?;
    let goblin_id = id.clone();
    match run_blocking(move || manager.freeze(&goblin_id, request)).await? {
        Ok(image) => {
            println!("✓ Goblin {} frozen", id);
            println!("  Image:    {}", image.dir.display());
            println!("  Sequence: {}", image.sequence);
            println!("  Log:      {}", image.log_path.display());
            if let Some(advisory) = &image.advisory {
                println!("  Advisory: {}", advisory);
            }
            Ok(())
        }
        Err(e) => fail("Freeze", &e),
    }
}

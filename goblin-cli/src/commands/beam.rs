// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `goblin beam` command - Freeze a goblin and thaw it straight back.

use std::time::Duration;

use goblin_core::{BeamRequest, FreezeRequest, ProcessId};

use super::{fail, open_manager, parse_id, run_blocking};

pub async fn execute(
    config_path: &str,
    id: &str,
    pid: Option<u32>,
    timeout_ms: Option<u64>,
    keep_image: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = parse_id(id)?;
    let timeout = timeout_ms.map(Duration::from_millis);
    let request = BeamRequest {
        freeze: FreezeRequest {
            pid: pid.map(ProcessId::new).transpose()?,
            timeout,
            leave_running: None,
        },
        thaw_timeout: timeout,
        cleanup: !keep_image,
    };

    let manager = open_manager(config_path)?;
    let goblin_id = id.clone();
    match run_blocking(move || manager.beam(&goblin_id, request)).await? {
        Ok(outcome) => {
            println!("✓ Goblin {} beamed", id);
            if let Some(pid) = outcome.goblin.pid {
                println!("  PID:        {}", pid);
            }
            println!("  Generation: {}", outcome.goblin.generation);
            println!("  Sequence:   {}", outcome.image.sequence);
            if outcome.cleaned_up {
                println!("  Image:      removed");
            } else {
                println!("  Image:      {}", outcome.image.dir.display());
            }
            if let Some(advisory) = &outcome.image.advisory {
                println!("  Advisory:   {}", advisory);
            }
            Ok(())
        }
        Err(e) => fail("Beam", &e),
    }
}

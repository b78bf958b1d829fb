// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `goblin forget` command - Drop a goblin from the registry.

use super::{fail, open_manager, parse_id, run_blocking};

pub async fn execute(config_path: &str, id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let id = parse_id(id)?;
    let manager = open_manager(config_path)?;

    let goblin_id = id.clone();
    match run_blocking(move || manager.forget(&goblin_id)).await? {
        Ok(goblin) => {
            println!("✓ Goblin {} forgotten", id);
            if !goblin.images.is_empty() {
                println!("  {} image(s) left on disk", goblin.images.len());
            }
            Ok(())
        }
        Err(e) => fail("Forget", &e),
    }
}

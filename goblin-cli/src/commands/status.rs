// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `goblin status` command - Show tracked goblins.
//!
//! Reads the registry file directly, so it works without CRIU installed.

use goblin_core::image::ImageLayout;
use goblin_core::storage::RegistryStore;
use goblin_core::{Goblin, GoblinError, GoblinState};

use super::{fail, load_config, parse_id};

pub async fn execute(
    config_path: &str,
    id: Option<String>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let store = RegistryStore::new(ImageLayout::new(&config.goblins.root_dir).registry_path());
    let goblins = store.load()?;

    let goblins = match id {
        Some(id) => {
            let id = parse_id(&id)?;
            match goblins.into_iter().find(|g| g.id == id) {
                Some(goblin) => vec![goblin],
                None => fail("Status", &GoblinError::NotFound(id)),
            }
        }
        None => goblins,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&goblins)?);
        return Ok(());
    }

    if goblins.is_empty() {
        println!("No goblins tracked under {}.", config.goblins.root_dir.display());
        return Ok(());
    }

    println!("╔══════════════════════╦═════════╦═════════╦═════╦════════╦══════════════════════════╗");
    println!("║ ID                   ║ State   ║ PID     ║ Gen ║ Images ║ Last outcome             ║");
    println!("╠══════════════════════╬═════════╬═════════╬═════╬════════╬══════════════════════════╣");

    for goblin in &goblins {
        println!(
            "║ {:<20} ║ {:<7} ║ {:<7} ║ {:<3} ║ {:<6} ║ {:<24} ║",
            goblin.id.as_str(),
            goblin.state.name(),
            goblin
                .pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            goblin.generation.value(),
            goblin.images.len(),
            last_outcome(goblin)
        );
    }

    println!("╚══════════════════════╩═════════╩═════════╩═════╩════════╩══════════════════════════╝");

    if let [goblin] = goblins.as_slice() {
        print_detail(goblin);
    } else {
        println!();
        println!("Total: {} goblin(s)", goblins.len());
    }

    Ok(())
}

fn last_outcome(goblin: &Goblin) -> String {
    match &goblin.last_failure {
        Some(failure) if goblin.state == GoblinState::Failed => {
            format!("{} {}", failure.operation, failure.reason)
        }
        _ => match goblin.latest_image() {
            Some(image) if image.is_success() => format!("{} ok", image.name()),
            Some(image) => image.name(),
            None => "-".to_string(),
        },
    }
}

fn print_detail(goblin: &Goblin) {
    println!();
    if let Some(command) = &goblin.command {
        println!("Command: {}", command.join(" "));
    }
    if let Some(dir) = &goblin.image_dir {
        println!("Latest image: {}", dir.display());
    }
    for image in &goblin.images {
        let outcome = match image.failure_reason() {
            Some(reason) => format!("failed: {}", reason),
            None => "ok".to_string(),
        };
        println!(
            "  {:<16} gen {} pid {} {} ({}ms)",
            image.name(),
            image.generation,
            image.pid,
            outcome,
            image.duration_ms
        );
        if let Some(advisory) = &image.advisory {
            println!("    advisory: {}", advisory);
        }
    }
    if let Some(failure) = &goblin.last_failure {
        println!();
        println!("Last failure:");
        println!("{}", failure);
    }
}

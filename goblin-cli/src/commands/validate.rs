// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `goblin validate` command - Validate configuration file.

use goblin_core::ConfigLoader;

pub async fn execute(file: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(file = %file, "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            let engine = &config.engine;
            println!("✓ Configuration is valid");
            println!();
            println!("Engine Settings:");
            println!(
                "  CRIU:              {}",
                engine
                    .criu_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(resolved at runtime)".to_string())
            );
            println!("  Use sudo -n:       {}", engine.use_sudo);
            println!("  Restore via criu-ns: {}", engine.use_criu_ns);
            println!("  Timeout:           {}ms", engine.timeout.as_millis());
            println!("  Kill Grace:        {}ms", engine.kill_grace.as_millis());
            println!("  Verbosity:         -v{}", engine.verbosity);
            println!("  Leave Running:     {}", engine.leave_running);
            println!();
            println!("Goblin Settings:");
            println!("  Root Directory:    {}", config.goblins.root_dir.display());
            println!("  Log Tail Lines:    {}", config.goblins.log_tail_lines);
            println!(
                "  Pidfile Timeout:   {}ms",
                config.goblins.pidfile_timeout.as_millis()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}

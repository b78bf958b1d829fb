// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `goblin doctor` command - Check host prerequisites.
//!
//! Exits with code 1 if any required check fails.

use std::path::Path;
use std::process::{Command, Stdio};

use goblin_core::engine::{env_override_var, resolve_command};

use super::load_config;

struct Check {
    label: &'static str,
    ok: bool,
    detail: String,
    required: bool,
}

pub async fn execute(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !cfg!(target_os = "linux") {
        eprintln!(
            "✗ goblin doctor only supports Linux hosts (detected: {})",
            std::env::consts::OS
        );
        eprintln!("  CRIU depends on Linux kernel checkpoint/restore features.");
        std::process::exit(1);
    }

    let config = load_config(config_path)?;
    println!("Running environment diagnostics...");
    println!();

    let is_root = nix::unistd::geteuid().is_root();
    let mut checks = vec![Check {
        label: "Effective user",
        ok: true,
        detail: if is_root {
            "root".to_string()
        } else {
            format!("uid {}", nix::unistd::geteuid())
        },
        required: false,
    }];

    if config.engine.use_sudo {
        checks.push(check_sudo(config.engine.sudo_path.as_deref()));
    }
    checks.push(check_tool("CRIU", "criu", config.engine.criu_path.as_deref(), true));
    checks.push(check_tool(
        "criu-ns",
        "criu-ns",
        config.engine.criu_ns_path.as_deref(),
        config.engine.use_criu_ns,
    ));
    checks.push(check_tool("pgrep", "pgrep", None, false));

    let mut all_ok = true;
    for check in &checks {
        let mark = if check.ok { "✓" } else if check.required { "✗" } else { "!" };
        println!("{} {:<20} {}", mark, check.label, check.detail);
        if check.required && !check.ok {
            all_ok = false;
        }
    }

    println!();
    if all_ok {
        println!("✓ All doctor checks passed!");
        Ok(())
    } else {
        eprintln!("✗ Resolve the failed checks above before continuing.");
        std::process::exit(1);
    }
}

fn check_sudo(configured: Option<&Path>) -> Check {
    let sudo = match configured {
        Some(path) => Ok(path.to_path_buf()),
        None => resolve_command("sudo"),
    };
    let sudo = match sudo {
        Ok(path) => path,
        Err(e) => {
            return Check {
                label: "Password-less sudo",
                ok: false,
                detail: e.to_string(),
                required: true,
            }
        }
    };

    let status = Command::new(&sudo)
        .args(["-n", "true"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(s) if s.success() => Check {
            label: "Password-less sudo",
            ok: true,
            detail: format!("{} -n true", sudo.display()),
            required: true,
        },
        Ok(_) => Check {
            label: "Password-less sudo",
            ok: false,
            detail: "sudo -n true was refused; configure NOPASSWD for criu".to_string(),
            required: true,
        },
        Err(e) => Check {
            label: "Password-less sudo",
            ok: false,
            detail: format!("failed to run {}: {}", sudo.display(), e),
            required: true,
        },
    }
}

fn check_tool(
    label: &'static str,
    executable: &str,
    configured: Option<&Path>,
    required: bool,
) -> Check {
    let resolved = match configured {
        Some(path) if path.exists() => Ok(path.to_path_buf()),
        Some(path) => Err(format!("configured path {} does not exist", path.display())),
        None => resolve_command(executable).map_err(|e| e.to_string()),
    };

    match resolved {
        Ok(path) => Check {
            label,
            ok: true,
            detail: path.display().to_string(),
            required,
        },
        Err(reason) => Check {
            label,
            ok: false,
            detail: format!("{} (set {} to override)", reason, env_override_var(executable)),
            required,
        },
    }
}

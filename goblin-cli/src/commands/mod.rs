// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CLI command modules.

use std::sync::Arc;

use goblin_core::ancestry::ProcMountTable;
use goblin_core::{Config, ConfigLoader, CriuEngine, GoblinError, GoblinId, GoblinManager, GoblinResult};

pub mod adopt;
pub mod beam;
pub mod doctor;
pub mod forget;
pub mod freeze;
pub mod launch;
pub mod status;
pub mod thaw;
pub mod validate;

pub type Manager = GoblinManager<CriuEngine, ProcMountTable>;

/// Load the configuration, falling back to defaults if the file is absent.
pub fn load_config(config_path: &str) -> Result<Config, Box<dyn std::error::Error>> {
    Ok(ConfigLoader::load_or_default(config_path)?)
}

/// Open the CRIU-backed manager described by `config_path`.
pub fn open_manager(config_path: &str) -> Result<Arc<Manager>, Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    Ok(Arc::new(Manager::open(&config)?))
}

pub fn parse_id(id: &str) -> Result<GoblinId, Box<dyn std::error::Error>> {
    Ok(GoblinId::new(id)?)
}

/// Run a blocking lifecycle call off the async runtime.
pub async fn run_blocking<T, F>(f: F) -> Result<GoblinResult<T>, Box<dyn std::error::Error>>
where
    T: Send + 'static,
    F: FnOnce() -> GoblinResult<T> + Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await?)
}

/// Print a lifecycle error and exit non-zero.
pub fn fail(action: &str, err: &GoblinError) -> ! {
    eprintln!("✗ {} failed:", action);
    match err.attempt() {
        Some(attempt) => eprintln!("{}", attempt),
        None => eprintln!("  {}", err),
    }
    std::process::exit(1);
}

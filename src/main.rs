//! Inspect a language memory file.
//!
//! Usage:
//!   cargo run                      # reads LANG_MEMORY_STORAGE_PATH (default lang-memory.json)
//!   cargo run -- path/to/file.json
//!
//! Prints the remembered assignments (least recently used first), the
//! domain table used for guesses and the counters collected while loading.

use anyhow::{Context, Result};
use recipient_lang_memory::{Config, JsonFileStorage, SharedMemory};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("recipient_lang_memory=info".parse()?),
        )
        .init();

    let config = Config::from_env().context("Invalid configuration")?;
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config.storage_path.clone());

    if !std::path::Path::new(&path).exists() {
        anyhow::bail!("Storage file not found: {}", path);
    }

    info!("Inspecting {}", path);
    let storage = Arc::new(JsonFileStorage::new(&path));
    let memory = SharedMemory::for_storage(storage, Arc::new(config));

    let assignments = memory.assignment_pairs().await;
    println!("Assignments ({}):", assignments.len());
    for (key, language) in &assignments {
        println!("  {} -> {}", key, language);
    }

    let table = memory.heuristic_pairs().await;
    println!("\nDomain table ({}):", table.len());
    for (suffix, language, count) in &table {
        println!("  {} -> {} ({})", suffix, language, count);
    }

    println!("\n{}", memory.metrics().report().format());
    Ok(())
}

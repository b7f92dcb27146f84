use crate::labels::NotificationLevel;
use anyhow::{Context, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    // Storage
    pub storage_path: String,

    // Assignment defaults (overridden by stored preferences)
    pub max_size: usize,
    pub max_recipients: usize,
    pub allow_heuristic: bool,

    // Notifications
    pub notification_level: NotificationLevel,
    pub locale: String,

    // Spellchecker readiness
    pub retry_delay: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            // Storage
            storage_path: std::env::var("LANG_MEMORY_STORAGE_PATH")
                .unwrap_or(defaults.storage_path),

            // Assignment defaults
            max_size: std::env::var("LANG_MEMORY_MAX_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_size),
            max_recipients: std::env::var("LANG_MEMORY_MAX_RECIPIENTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_recipients),
            allow_heuristic: std::env::var("LANG_MEMORY_ALLOW_HEURISTIC")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.allow_heuristic),

            // Notifications
            notification_level: match std::env::var("LANG_MEMORY_NOTIFICATION_LEVEL") {
                Ok(level) => level
                    .parse()
                    .context("LANG_MEMORY_NOTIFICATION_LEVEL must be info, warn or error")?,
                Err(_) => defaults.notification_level,
            },
            locale: std::env::var("LANG_MEMORY_LOCALE").unwrap_or(defaults.locale),

            // Spellchecker readiness
            retry_delay: std::env::var("LANG_MEMORY_RETRY_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: "lang-memory.json".to_string(),
            max_size: 200,
            max_recipients: 10,
            allow_heuristic: true,
            notification_level: NotificationLevel::Info,
            locale: "en".to_string(),
            retry_delay: Duration::from_secs(1),
        }
    }
}

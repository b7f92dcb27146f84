//! Preferences kept in the storage backend, with [`Config`] fallbacks.

use crate::config::Config;
use crate::error::Result;
use crate::labels::NotificationLevel;
use crate::storage::KeyValueStore;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

pub const MAX_SIZE_KEY: &str = "addressesInfo.maxSize";
pub const MAX_RECIPIENTS_KEY: &str = "maxRecipients";
pub const NOTIFICATION_LEVEL_KEY: &str = "notificationLevel";
pub const ALLOW_HEURISTIC_KEY: &str = "allowHeuristic";

#[derive(Clone)]
pub struct Preferences {
    storage: Arc<dyn KeyValueStore>,
    defaults: Arc<Config>,
}

impl Preferences {
    pub fn new(storage: Arc<dyn KeyValueStore>, defaults: Arc<Config>) -> Self {
        Self { storage, defaults }
    }

    /// Capacity of the assignment store.
    pub async fn max_size(&self) -> usize {
        self.number(MAX_SIZE_KEY)
            .await
            .unwrap_or(self.defaults.max_size)
    }

    /// Largest recipient count whose language changes are remembered.
    pub async fn max_recipients(&self) -> usize {
        self.number(MAX_RECIPIENTS_KEY)
            .await
            .unwrap_or(self.defaults.max_recipients)
    }

    pub async fn notification_level(&self) -> NotificationLevel {
        match self.raw(NOTIFICATION_LEVEL_KEY).await {
            Some(Value::String(level)) => level.parse().unwrap_or_else(|e| {
                warn!("Ignoring stored notification level: {}", e);
                self.defaults.notification_level
            }),
            _ => self.defaults.notification_level,
        }
    }

    pub async fn allow_heuristic(&self) -> bool {
        match self.raw(ALLOW_HEURISTIC_KEY).await {
            Some(Value::Bool(allowed)) => allowed,
            Some(Value::String(s)) => s.parse().unwrap_or(self.defaults.allow_heuristic),
            _ => self.defaults.allow_heuristic,
        }
    }

    pub async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.storage.set(key, value).await
    }

    async fn number(&self, key: &str) -> Option<usize> {
        match self.raw(key).await? {
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    async fn raw(&self, key: &str) -> Option<Value> {
        match self.storage.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to read preference '{}': {}", key, e);
                None
            }
        }
    }
}

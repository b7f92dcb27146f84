//! Lazily loaded, write-serialized objects backed by a [`KeyValueStore`].
//!
//! A [`PersistentObject`] loads its value from storage the first time anyone
//! touches it. Callers racing on that first access all wait on the same
//! in-flight load. Every [`PersistentObject::mutate`] call runs under a lock
//! and writes the whole serialized object back before it returns, so writes
//! on one object never interleave.

use crate::error::Result;
use crate::storage::KeyValueStore;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

/// A value that can live in a [`PersistentObject`].
pub trait Persisted: Sized + Send + 'static {
    /// Settings resolved once, right before the value is loaded.
    type Settings: Send + Sync + 'static;

    /// Human readable name used in logs.
    const WHAT: &'static str;

    /// Value used when nothing (or nothing usable) is stored yet.
    fn empty(settings: &Self::Settings) -> Self;

    /// Rebuild the value from its stored JSON text.
    fn restore(raw: &str, settings: &Self::Settings) -> Result<Self>;

    /// Serialize the whole value to JSON text.
    fn snapshot(&self) -> Result<String>;
}

/// Produces the settings of a [`Persisted`] value from the storage it lives in.
pub type SettingsLoader<S> =
    Box<dyn Fn(Arc<dyn KeyValueStore>) -> BoxFuture<'static, S> + Send + Sync>;

type AfterLoad<T> = Box<dyn Fn(&mut T) + Send + Sync>;

/// Last loaded or persisted state of a [`PersistentObject`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint(Option<String>);

struct Loaded<T: Persisted> {
    value: T,
    settings: T::Settings,
    /// Snapshot of the last loaded or persisted value.
    committed: Option<String>,
}

pub struct PersistentObject<T: Persisted> {
    key: String,
    storage: Arc<dyn KeyValueStore>,
    settings: SettingsLoader<T::Settings>,
    after_load: Option<AfterLoad<T>>,
    state: OnceCell<Mutex<Loaded<T>>>,
}

impl<T: Persisted> PersistentObject<T> {
    pub fn new(
        key: impl Into<String>,
        storage: Arc<dyn KeyValueStore>,
        settings: SettingsLoader<T::Settings>,
    ) -> Self {
        Self {
            key: key.into(),
            storage,
            settings,
            after_load: None,
            state: OnceCell::new(),
        }
    }

    /// Hook run on every freshly built value, before anyone else sees it.
    pub fn after_load(mut self, hook: impl Fn(&mut T) + Send + Sync + 'static) -> Self {
        self.after_load = Some(Box::new(hook));
        self
    }

    /// Run `f` against the value without persisting it afterwards.
    ///
    /// The closure gets `&mut T` because some reads update bookkeeping
    /// (LRU recency) that is only written out with the next mutation.
    pub async fn read<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.loaded().await.lock().await;
        f(&mut guard.value)
    }

    /// Run `f` against the value and persist the result before returning.
    ///
    /// When the new state cannot be serialized or stored, the value is
    /// rebuilt from the last committed snapshot and the error is returned,
    /// so memory never runs ahead of storage.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut guard = self.loaded().await.lock().await;
        let out = f(&mut guard.value);
        match self.persist(&mut guard).await {
            Ok(()) => Ok(out),
            Err(e) => {
                warn!("Rolling back {} under '{}': {}", T::WHAT, self.key, e);
                let committed = guard.committed.clone();
                self.rebuild(&mut guard, committed.as_deref());
                Err(e)
            }
        }
    }

    /// The state the value was last loaded or persisted in.
    pub async fn checkpoint(&self) -> Checkpoint {
        let guard = self.loaded().await.lock().await;
        Checkpoint(guard.committed.clone())
    }

    /// Put the value and storage back to `checkpoint`.
    ///
    /// The value is reverted even when writing it back fails.
    pub async fn revert(&self, checkpoint: Checkpoint) -> Result<()> {
        let mut guard = self.loaded().await.lock().await;
        self.rebuild(&mut guard, checkpoint.0.as_deref());
        self.persist(&mut guard).await
    }

    async fn persist(&self, loaded: &mut Loaded<T>) -> Result<()> {
        let raw = loaded.value.snapshot()?;
        self.storage
            .set(&self.key, Value::String(raw.clone()))
            .await?;
        loaded.committed = Some(raw);
        debug!("Persisted {} under '{}'", T::WHAT, self.key);
        Ok(())
    }

    fn rebuild(&self, loaded: &mut Loaded<T>, raw: Option<&str>) {
        let restored = raw.and_then(|raw| match T::restore(raw, &loaded.settings) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Cannot restore {} snapshot: {}", T::WHAT, e);
                None
            }
        });
        let mut value = restored.unwrap_or_else(|| T::empty(&loaded.settings));
        if let Some(hook) = &self.after_load {
            hook(&mut value);
        }
        loaded.value = value;
    }

    async fn loaded(&self) -> &Mutex<Loaded<T>> {
        self.state.get_or_init(|| self.load()).await
    }

    async fn load(&self) -> Mutex<Loaded<T>> {
        let settings = (self.settings)(Arc::clone(&self.storage)).await;

        let mut value = match self.storage.get(&self.key).await {
            Ok(Some(Value::String(raw))) => match T::restore(&raw, &settings) {
                Ok(value) => {
                    debug!("Loaded {} from '{}'", T::WHAT, self.key);
                    value
                }
                Err(e) => {
                    warn!("Discarding unreadable {} under '{}': {}", T::WHAT, self.key, e);
                    T::empty(&settings)
                }
            },
            Ok(Some(other)) => {
                warn!(
                    "Discarding {} under '{}': expected JSON text, found {}",
                    T::WHAT,
                    self.key,
                    other
                );
                T::empty(&settings)
            }
            Ok(None) => {
                debug!("No stored {} under '{}', starting empty", T::WHAT, self.key);
                T::empty(&settings)
            }
            Err(e) => {
                warn!("Failed to read {} under '{}': {}", T::WHAT, self.key, e);
                T::empty(&settings)
            }
        };

        if let Some(hook) = &self.after_load {
            hook(&mut value);
        }
        let committed = value.snapshot().ok();
        Mutex::new(Loaded {
            value,
            settings,
            committed,
        })
    }
}

/// Settings loader for values that need none.
pub fn no_settings() -> SettingsLoader<()> {
    Box::new(|_: Arc<dyn KeyValueStore>| async {}.boxed())
}

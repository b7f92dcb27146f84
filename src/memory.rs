//! Shared per-storage state: the assignment store, the domain heuristic and
//! the metrics every compose window writes into.
//!
//! Handles are cached in a process-wide registry keyed by storage identity,
//! so two windows opened on the same storage share one store and one write
//! queue. Loading is lazy and happens once per identity (see
//! [`PersistentObject`]).
//!
//! When the configured capacity shrank since the store was last written, the
//! oldest entries are dropped at load. The first access on a handle takes
//! their votes out of the heuristic, writes both tables back and publishes
//! an `assignment-removed` event for each of them.

use crate::config::Config;
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::heuristic::{DomainHeuristic, HeuristicSettings};
use crate::lru_store::{stored_pairs, AssignmentStore, SetOutcome, StoreSettings};
use crate::metrics::MemoryMetrics;
use crate::persistent::PersistentObject;
use crate::preferences::Preferences;
use crate::recipients::RecipientKey;
use crate::storage::KeyValueStore;
use futures::future::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Storage key of the assignment store.
pub const ADDRESS_INFO_KEY: &str = "addressesInfo";

/// Storage key of the domain heuristic table.
pub const FREQ_TABLE_KEY: &str = "freqTableData";

static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<SharedMemory>>>> = OnceLock::new();

fn registry() -> std::sync::MutexGuard<'static, HashMap<String, Arc<SharedMemory>>> {
    let lock = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// How a write should treat an existing assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace a different existing language.
    Force,
    /// Only write when the key has no language yet.
    IfAbsent,
}

pub struct SharedMemory {
    identity: String,
    preferences: Preferences,
    store: PersistentObject<AssignmentStore>,
    heuristic: PersistentObject<DomainHeuristic>,
    write_gate: tokio::sync::Mutex<()>,
    /// Entries dropped at load whose removal is not yet persisted.
    pending_trim: tokio::sync::Mutex<Vec<(String, String)>>,
    reconciled: tokio::sync::OnceCell<()>,
    events: EventBus,
    metrics: Arc<MemoryMetrics>,
}

impl SharedMemory {
    /// Shared handle for `storage`, created on first request.
    ///
    /// `config` only matters for the call that creates the handle.
    pub fn for_storage(
        storage: Arc<dyn KeyValueStore>,
        config: Arc<Config>,
    ) -> Arc<SharedMemory> {
        let identity = storage.identity().to_string();
        let mut registry = registry();
        if let Some(existing) = registry.get(&identity) {
            return Arc::clone(existing);
        }

        debug!("Creating shared memory for {}", identity);
        let memory = Arc::new(SharedMemory::new(identity.clone(), storage, config));
        registry.insert(identity, Arc::clone(&memory));
        memory
    }

    /// Forget the cached handle for a storage identity.
    ///
    /// Existing handles keep working; the next [`SharedMemory::for_storage`]
    /// call builds a fresh one, re-reading capacity and stored data.
    pub fn flush(identity: &str) -> bool {
        let removed = registry().remove(identity).is_some();
        if removed {
            info!("Flushed shared memory for {}", identity);
        }
        removed
    }

    fn new(identity: String, storage: Arc<dyn KeyValueStore>, config: Arc<Config>) -> Self {
        let preferences = Preferences::new(Arc::clone(&storage), Arc::clone(&config));
        let metrics = Arc::new(MemoryMetrics::new());

        let store_defaults = Arc::clone(&config);
        let eviction_metrics = Arc::clone(&metrics);
        let store = PersistentObject::<AssignmentStore>::new(
            ADDRESS_INFO_KEY,
            Arc::clone(&storage),
            Box::new(move |storage: Arc<dyn KeyValueStore>| {
                let prefs = Preferences::new(storage, Arc::clone(&store_defaults));
                async move {
                    StoreSettings {
                        capacity: prefs.max_size().await,
                    }
                }
                .boxed()
            }),
        )
        .after_load(move |store: &mut AssignmentStore| {
            let metrics = Arc::clone(&eviction_metrics);
            store.set_eviction_callback(Box::new(move |key: &str, language: &str| {
                debug!("Assignment {} ({}) evicted", key, language);
                metrics.record_eviction();
            }));
        });

        let heuristic = PersistentObject::<DomainHeuristic>::new(
            FREQ_TABLE_KEY,
            Arc::clone(&storage),
            Box::new(|storage: Arc<dyn KeyValueStore>| {
                async move { HeuristicSettings { seed: seed_from_store(storage.as_ref()).await } }
                    .boxed()
            }),
        );

        Self {
            identity,
            preferences,
            store,
            heuristic,
            write_gate: tokio::sync::Mutex::new(()),
            pending_trim: tokio::sync::Mutex::new(Vec::new()),
            reconciled: tokio::sync::OnceCell::new(),
            events: EventBus::new(),
            metrics,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn preferences(&self) -> &Preferences {
        &self.preferences
    }

    pub fn metrics(&self) -> &MemoryMetrics {
        &self.metrics
    }

    /// Removals this handle found at load time.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Language stored for `key`, if any. Marks the entry as recently used.
    pub async fn lookup(&self, key: &RecipientKey) -> Option<String> {
        self.settle().await;
        self.store.read(|store| store.get(key.as_str())).await
    }

    /// Write `language` for `key` according to `mode`.
    ///
    /// Returns what changed, or `None` when the write was skipped. The
    /// heuristic is updated with the same write (and any eviction) before
    /// this returns; writes from every handle on this identity are
    /// serialized. If either table cannot be persisted, both are left as
    /// they were and the error is returned.
    pub async fn write(
        &self,
        key: &RecipientKey,
        language: &str,
        mode: WriteMode,
    ) -> Result<Option<SetOutcome>> {
        self.reconcile_once().await?;
        let _gate = self.write_gate.lock().await;

        let previous = self.store.read(|store| store.get(key.as_str())).await;
        let should_write = match (&previous, mode) {
            (None, _) => true,
            (Some(current), WriteMode::Force) => current != language,
            (Some(_), WriteMode::IfAbsent) => false,
        };
        if !should_write || language.is_empty() {
            return Ok(None);
        }

        let store_checkpoint = self.store.checkpoint().await;
        let outcome = self
            .store
            .mutate(|store| store.set(key.as_str(), language))
            .await?;

        let evicted = outcome
            .evicted
            .as_ref()
            .map(|(k, v)| (k.as_str(), v.as_str()));
        let applied = self
            .heuristic
            .mutate(|table| {
                table.apply_write(key.as_str(), outcome.previous.as_deref(), language, evicted)
            })
            .await;
        if let Err(e) = applied {
            if let Err(revert_error) = self.store.revert(store_checkpoint).await {
                warn!("Cannot revert assignment store for {}: {}", self.identity, revert_error);
            }
            return Err(e);
        }

        self.metrics.record_saved_assignment();
        Ok(Some(outcome))
    }

    /// Reads go on with whatever is loaded when reconciling fails; the next
    /// access tries again.
    async fn settle(&self) {
        if let Err(e) = self.reconcile_once().await {
            warn!("Cannot reconcile stored assignments for {}: {}", self.identity, e);
        }
    }

    async fn reconcile_once(&self) -> Result<()> {
        self.reconciled.get_or_try_init(|| self.reconcile()).await?;
        Ok(())
    }

    /// Retract and persist the entries the store dropped at load.
    async fn reconcile(&self) -> Result<()> {
        let _gate = self.write_gate.lock().await;

        // The heuristic may seed itself from the stored assignments, so it has
        // to be loaded before the trimmed store is written back.
        self.heuristic.read(|_| ()).await;

        let trimmed = self.store.read(|store| store.take_trimmed()).await;
        let mut pending = self.pending_trim.lock().await;
        pending.extend(trimmed);
        if pending.is_empty() {
            return Ok(());
        }

        let table_checkpoint = self.heuristic.checkpoint().await;
        self.heuristic
            .mutate(|table| {
                for (key, language) in pending.iter() {
                    table.forget_entry(key, language);
                }
            })
            .await?;
        if let Err(e) = self.store.mutate(|_| ()).await {
            if let Err(revert_error) = self.heuristic.revert(table_checkpoint).await {
                warn!("Cannot revert domain heuristic for {}: {}", self.identity, revert_error);
            }
            return Err(e);
        }

        info!(
            "Dropped {} assignments over capacity for {}",
            pending.len(),
            self.identity
        );
        for (key, language) in pending.drain(..) {
            self.metrics.record_eviction();
            self.events.publish(Event::AssignmentRemoved {
                recipients_key: key,
                language,
            });
        }
        Ok(())
    }

    /// Domain vote over `addresses`.
    pub async fn vote(&self, addresses: &[&str]) -> Option<String> {
        self.settle().await;
        self.heuristic
            .read(|table| table.vote(addresses.iter().copied()))
            .await
    }

    /// Snapshot of the assignment store, least recently used first.
    pub async fn assignment_pairs(&self) -> Vec<(String, String)> {
        self.settle().await;
        self.store.read(|store| store.pairs()).await
    }

    pub async fn assignment_count(&self) -> usize {
        self.settle().await;
        self.store.read(|store| store.size()).await
    }

    /// Snapshot of the heuristic table.
    pub async fn heuristic_pairs(&self) -> Vec<(String, String, u64)> {
        self.settle().await;
        self.heuristic.read(|table| table.pairs()).await
    }
}

async fn seed_from_store(storage: &dyn KeyValueStore) -> Vec<(String, String)> {
    match storage.get(ADDRESS_INFO_KEY).await {
        Ok(Some(Value::String(raw))) => match stored_pairs(&raw) {
            Ok(pairs) => {
                debug!("Seeding heuristic from {} stored assignments", pairs.len());
                pairs
            }
            Err(e) => {
                warn!("Cannot seed heuristic from stored assignments: {}", e);
                Vec::new()
            }
        },
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MemoryError;
    use crate::events::drain;
    use crate::preferences::MAX_SIZE_KEY;
    use crate::recipients::RecipientGroup;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use serde_json::json;

    /// Storage whose writes fail for one chosen key.
    struct FlakyStorage {
        inner: MemoryStorage,
        failing_key: Mutex<Option<&'static str>>,
    }

    impl FlakyStorage {
        fn new(values: Vec<(&str, Value)>) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStorage::with_values(values),
                failing_key: Mutex::new(None),
            })
        }

        fn fail_on(&self, key: Option<&'static str>) {
            *self.failing_key.lock().unwrap() = key;
        }
    }

    #[async_trait]
    impl KeyValueStore for FlakyStorage {
        fn identity(&self) -> &str {
            self.inner.identity()
        }

        async fn get(&self, key: &str) -> Result<Option<Value>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Value) -> Result<()> {
            let failing = *self.failing_key.lock().unwrap();
            if matches!(failing, Some(k) if k == key) {
                return Err(MemoryError::Io {
                    path: key.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                });
            }
            self.inner.set(key, value).await
        }
    }

    fn memory_with(values: Vec<(&str, Value)>) -> (Arc<MemoryStorage>, Arc<SharedMemory>) {
        let storage = Arc::new(MemoryStorage::with_values(values));
        let memory = SharedMemory::for_storage(storage.clone(), Arc::new(Config::default()));
        (storage, memory)
    }

    fn key(address: &str) -> RecipientKey {
        RecipientGroup::single(address).key()
    }

    #[tokio::test]
    async fn test_same_identity_shares_handle() {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStorage::new());
        let a = SharedMemory::for_storage(Arc::clone(&storage), Arc::new(Config::default()));
        let b = SharedMemory::for_storage(Arc::clone(&storage), Arc::new(Config::default()));
        assert!(Arc::ptr_eq(&a, &b));

        assert!(SharedMemory::flush(storage.identity()));
        let c = SharedMemory::for_storage(storage, Arc::new(Config::default()));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_write_modes() {
        let (_, memory) = memory_with(vec![]);
        let k = key("a@x.com");

        assert!(memory.write(&k, "en", WriteMode::IfAbsent).await.unwrap().is_some());
        assert!(memory.write(&k, "es", WriteMode::IfAbsent).await.unwrap().is_none());
        assert!(memory.write(&k, "en", WriteMode::Force).await.unwrap().is_none());

        let outcome = memory.write(&k, "es", WriteMode::Force).await.unwrap().unwrap();
        assert_eq!(outcome.previous.as_deref(), Some("en"));
        assert_eq!(memory.lookup(&k).await.as_deref(), Some("es"));
        assert_eq!(memory.heuristic_pairs().await, vec![("x.com".into(), "es".into(), 1)]);
    }

    #[tokio::test]
    async fn test_write_persists_both_tables() {
        let (storage, memory) = memory_with(vec![]);
        memory.write(&key("a@bar.dom"), "foobar", WriteMode::Force).await.unwrap();

        let store_raw = storage.peek(ADDRESS_INFO_KEY).unwrap();
        assert!(store_raw.as_str().unwrap().contains("a@bar.dom"));
        let table_raw = storage.peek(FREQ_TABLE_KEY).unwrap();
        assert_eq!(table_raw, json!(r#"[["bar.dom","foobar",1]]"#));
    }

    #[tokio::test]
    async fn test_capacity_read_from_storage() {
        let (_, memory) = memory_with(vec![(crate::preferences::MAX_SIZE_KEY, json!(2))]);
        for address in ["a@x.com", "b@x.com", "c@y.com"] {
            memory.write(&key(address), "en", WriteMode::Force).await.unwrap();
        }
        assert_eq!(memory.assignment_count().await, 2);
        assert_eq!(memory.metrics().evictions(), 1);
        assert_eq!(
            memory.heuristic_pairs().await,
            vec![("x.com".into(), "en".into(), 1), ("y.com".into(), "en".into(), 1)]
        );
    }

    #[tokio::test]
    async fn test_heuristic_seeded_from_legacy_store() {
        let legacy = r#"{"hash":{"oldfoo@mydom":"foobar","foo[cc]foo2":"foobar2"},"options":{"sorted_keys":["oldfoo@mydom","foo[cc]foo2"],"size":5}}"#;
        let (_, memory) = memory_with(vec![
            (ADDRESS_INFO_KEY, json!(legacy)),
            (crate::preferences::MAX_SIZE_KEY, json!(5)),
        ]);

        assert_eq!(
            memory.heuristic_pairs().await,
            vec![("mydom".into(), "foobar".into(), 1)]
        );
        assert_eq!(memory.assignment_count().await, 2);
    }

    #[tokio::test]
    async fn test_legacy_heuristic_table_is_migrated() {
        let (_, memory) = memory_with(vec![(
            FREQ_TABLE_KEY,
            json!(r#"[["a.dom","x",2],["b.dom","y",-1],["c[cc]d","z",1]]"#),
        )]);
        assert_eq!(memory.heuristic_pairs().await, vec![("a.dom".into(), "x".into(), 2)]);
    }

    // ==================== Failed Write Tests ====================

    #[tokio::test]
    async fn test_failed_table_write_reverts_store() {
        let storage = FlakyStorage::new(vec![]);
        let memory = SharedMemory::for_storage(storage.clone(), Arc::new(Config::default()));
        let k = key("a@x.com");
        memory.write(&k, "en", WriteMode::Force).await.unwrap();

        storage.fail_on(Some(FREQ_TABLE_KEY));
        assert!(memory.write(&k, "es", WriteMode::Force).await.is_err());

        assert_eq!(memory.lookup(&k).await.as_deref(), Some("en"));
        assert_eq!(memory.heuristic_pairs().await, vec![("x.com".into(), "en".into(), 1)]);
        let store_raw = storage.inner.peek(ADDRESS_INFO_KEY).unwrap();
        assert!(store_raw.as_str().unwrap().contains(r#""a@x.com":"en""#));
        assert_eq!(storage.inner.peek(FREQ_TABLE_KEY).unwrap(), json!(r#"[["x.com","en",1]]"#));
        assert_eq!(memory.metrics().saved_assignments(), 1);

        storage.fail_on(None);
        memory.write(&k, "es", WriteMode::Force).await.unwrap();
        assert_eq!(memory.heuristic_pairs().await, vec![("x.com".into(), "es".into(), 1)]);
    }

    #[tokio::test]
    async fn test_failed_store_write_leaves_table_alone() {
        let storage = FlakyStorage::new(vec![]);
        let memory = SharedMemory::for_storage(storage.clone(), Arc::new(Config::default()));
        memory.write(&key("a@x.com"), "en", WriteMode::Force).await.unwrap();

        storage.fail_on(Some(ADDRESS_INFO_KEY));
        assert!(memory.write(&key("b@y.com"), "es", WriteMode::Force).await.is_err());

        assert_eq!(memory.lookup(&key("b@y.com")).await, None);
        assert_eq!(memory.heuristic_pairs().await, vec![("x.com".into(), "en".into(), 1)]);
    }

    // ==================== Load Capacity Tests ====================

    #[tokio::test]
    async fn test_smaller_capacity_at_load_retracts_trimmed_entries() {
        let (storage, memory) = memory_with(vec![]);
        for address in ["a@one.dom", "b@two.dom", "c@three.dom"] {
            memory.write(&key(address), "xx", WriteMode::Force).await.unwrap();
        }
        storage.set(MAX_SIZE_KEY, json!(1)).await.unwrap();
        assert!(SharedMemory::flush(storage.identity()));

        let reopened = SharedMemory::for_storage(storage.clone(), Arc::new(Config::default()));
        let mut rx = reopened.subscribe();

        assert_eq!(
            reopened.assignment_pairs().await,
            vec![("c@three.dom".to_string(), "xx".to_string())]
        );
        assert_eq!(reopened.heuristic_pairs().await, vec![("three.dom".into(), "xx".into(), 1)]);
        assert_eq!(storage.peek(FREQ_TABLE_KEY).unwrap(), json!(r#"[["three.dom","xx",1]]"#));
        let store_raw = storage.peek(ADDRESS_INFO_KEY).unwrap();
        assert!(!store_raw.as_str().unwrap().contains("a@one.dom"));
        assert_eq!(reopened.metrics().evictions(), 2);

        let removed: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                Event::AssignmentRemoved { recipients_key, .. } => Some(recipients_key),
                _ => None,
            })
            .collect();
        assert_eq!(removed, vec!["a@one.dom", "b@two.dom"]);
    }

    #[tokio::test]
    async fn test_seeded_table_skips_entries_over_capacity() {
        let legacy = r#"{"hash":{"a@one.dom":"xx","b@two.dom":"yy"},"options":{"sorted_keys":["a@one.dom","b@two.dom"]}}"#;
        let (_, memory) = memory_with(vec![
            (ADDRESS_INFO_KEY, json!(legacy)),
            (MAX_SIZE_KEY, json!(1)),
        ]);

        assert_eq!(memory.heuristic_pairs().await, vec![("two.dom".into(), "yy".into(), 1)]);
        assert_eq!(memory.vote(&["z@one.dom"]).await, None);
    }

    #[tokio::test]
    async fn test_trimmed_entries_retried_after_failed_write_back() {
        let storage = FlakyStorage::new(vec![]);
        let memory = SharedMemory::for_storage(storage.clone(), Arc::new(Config::default()));
        for address in ["a@one.dom", "b@two.dom"] {
            memory.write(&key(address), "xx", WriteMode::Force).await.unwrap();
        }
        storage.inner.set(MAX_SIZE_KEY, json!(1)).await.unwrap();
        assert!(SharedMemory::flush(storage.identity()));

        storage.fail_on(Some(ADDRESS_INFO_KEY));
        let reopened = SharedMemory::for_storage(storage.clone(), Arc::new(Config::default()));
        assert!(reopened.write(&key("c@three.dom"), "zz", WriteMode::Force).await.is_err());
        assert_eq!(
            storage.inner.peek(FREQ_TABLE_KEY).unwrap(),
            json!(r#"[["one.dom","xx",1],["two.dom","xx",1]]"#)
        );

        storage.fail_on(None);
        assert_eq!(reopened.heuristic_pairs().await, vec![("two.dom".into(), "xx".into(), 1)]);
        assert_eq!(
            storage.inner.peek(FREQ_TABLE_KEY).unwrap(),
            json!(r#"[["two.dom","xx",1]]"#)
        );
    }

    #[tokio::test]
    async fn test_concurrent_writers_keep_counts_consistent() {
        let (_, memory) = memory_with(vec![]);
        let mut handles = Vec::new();
        for (i, lang) in ["a", "b", "c", "d", "e", "f"].into_iter().enumerate() {
            let memory = Arc::clone(&memory);
            handles.push(tokio::spawn(async move {
                let k = key("same@dom.com");
                memory.write(&k, lang, WriteMode::Force).await.unwrap();
                i
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let final_lang = memory.lookup(&key("same@dom.com")).await.unwrap();
        assert_eq!(
            memory.heuristic_pairs().await,
            vec![("dom.com".to_string(), final_lang, 1)]
        );
    }
}

//! Cache facade
//!
//! [`Cache`] ties a backend, the persisted metadata and the chains together:
//!
//! ```text
//! set(k, v)  ─▶ active chain.forward(v) ─▶ backend.set(data, k, (chain id, bytes))
//! get(k)     ─▶ backend.get(data, k) ─▶ chain for stored id ─▶ backward(bytes)
//! optimize_compression() ─▶ recompress::{train, recompress} ─▶ new active dictionary
//! ```
//!
//! Rows written under older chains stay readable as long as their providers
//! are available; a row whose chain cannot be resolved fails explicitly.

pub mod metadata;
pub mod recompress;

pub use recompress::RecompressionReport;

use crate::backend::{Backend, BackendKind, DataSize, EngineOption, Key, Row, TableName};
use crate::config::{CacheOptions, ChainSpec, DEFAULT_COMMIT_INTERVAL};
use crate::error::{CacheError, CacheResult};
use crate::transform::{Chain, ChainId, Dictionary, ProviderRegistry, StageList, ValueHint};
use metadata::{Settings, StoredChain, FORMAT_VERSION};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// A stored chain as seen by this process
enum ChainSlot {
    Ready(Chain),
    Unavailable { provider: String },
    Invalid(String),
}

impl ChainSlot {
    fn resolve(
        stored: &StoredChain,
        registry: &ProviderRegistry,
        level: Option<i32>,
    ) -> CacheResult<Self> {
        match Chain::from_stages(&stored.stages, registry, level) {
            Ok(chain) => Ok(ChainSlot::Ready(
                chain.with_dictionary(stored.dictionary.clone()),
            )),
            Err(CacheError::UnavailableProvider { provider, .. }) => {
                Ok(ChainSlot::Unavailable { provider })
            }
            Err(CacheError::Configuration(msg)) => Ok(ChainSlot::Invalid(msg)),
            Err(e) => Err(e),
        }
    }

    fn ready(&self, id: ChainId) -> CacheResult<&Chain> {
        match self {
            ChainSlot::Ready(chain) => Ok(chain),
            ChainSlot::Unavailable { provider } => Err(CacheError::UnavailableProvider {
                chain_id: id,
                provider: provider.clone(),
            }),
            ChainSlot::Invalid(msg) => Err(CacheError::Configuration(msg.clone())),
        }
    }
}

/// Disk-persistent, compressed key-value cache for values of type `V`
pub struct Cache<V> {
    backend: Box<dyn Backend>,
    registry: ProviderRegistry,
    active: Chain,
    /// Every other chain recorded in metadata
    chains: HashMap<ChainId, ChainSlot>,
    /// Chains registered by other handles after this one was opened
    late_chains: RefCell<HashMap<ChainId, ChainSlot>>,
    commit_interval: u64,
    ops_pending: u64,
    level: Option<i32>,
    _value: PhantomData<fn() -> V>,
}

impl<V> Cache<V>
where
    V: Serialize + DeserializeOwned,
{
    /// Open the store described by `options` with every compiled-in provider
    pub fn open(options: &CacheOptions) -> CacheResult<Self> {
        Self::open_with_registry(options, ProviderRegistry::installed())
    }

    pub fn open_with_registry(
        options: &CacheOptions,
        registry: ProviderRegistry,
    ) -> CacheResult<Self> {
        let kind = options.backend_kind()?;
        if !options.create && !options.path.exists() {
            return Err(CacheError::Configuration(format!(
                "no store at {:?} and auto-create is disabled",
                options.path
            )));
        }
        let backend = kind.open(&options.path)?;
        tracing::debug!("Opened {} store at {:?}", kind, options.path);
        Self::with_backend(backend, options, registry)
    }

    /// Build a cache on an already opened backend
    ///
    /// `options.path` and `options.backend` are ignored.
    pub fn with_backend(
        mut backend: Box<dyn Backend>,
        options: &CacheOptions,
        registry: ProviderRegistry,
    ) -> CacheResult<Self> {
        if !metadata::is_initialized(backend.as_ref())? {
            if !options.create {
                return Err(CacheError::Configuration(format!(
                    "{} store {:?} is not initialized and auto-create is disabled",
                    backend.kind(),
                    backend.path()
                )));
            }
            for table in TableName::ALL {
                backend.create_table(table)?;
            }
        }

        let level = options.compression_level;
        let settings = metadata::load_settings(backend.as_ref())?;
        let mut chains = HashMap::new();
        for stored in metadata::load_chains(backend.as_ref())? {
            chains.insert(stored.id, ChainSlot::resolve(&stored, &registry, level)?);
        }

        let stages = choose_stages(options, &registry, settings.as_ref(), &chains)?;
        let id = stages.chain_id();
        let active = match chains.remove(&id) {
            Some(ChainSlot::Ready(chain)) => chain,
            _ => Chain::from_stages(&stages, &registry, level)?,
        };
        let commit_interval = options
            .commit_interval
            .or(settings.as_ref().map(|s| s.commit_interval))
            .unwrap_or(DEFAULT_COMMIT_INTERVAL);
        metadata::register_chain(backend.as_mut(), &stages)?;
        metadata::store_settings(
            backend.as_mut(),
            &Settings {
                version: FORMAT_VERSION,
                active_chain: id,
                commit_interval,
            },
        )?;
        backend.commit()?;

        tracing::debug!(
            "Cache ready: chain {} [{}], dictionary {}, {} other chain(s)",
            id,
            stages,
            active
                .dictionary()
                .map(|d| format!("{} bytes", d.len()))
                .unwrap_or_else(|| "none".to_string()),
            chains.len()
        );

        Ok(Self {
            backend,
            registry,
            active,
            chains,
            late_chains: RefCell::new(HashMap::new()),
            commit_interval,
            ops_pending: 0,
            level,
            _value: PhantomData,
        })
    }

    /// Value stored under `key`, or [`CacheError::KeyNotFound`]
    pub fn get(&self, key: impl Into<Key>) -> CacheResult<V> {
        let key = key.into();
        match self.backend.get(TableName::Data, &key)? {
            Some(row) => self.decode(&key, &row),
            None => Err(CacheError::KeyNotFound(key)),
        }
    }

    pub fn try_get(&self, key: impl Into<Key>) -> CacheResult<Option<V>> {
        let key = key.into();
        self.backend
            .get(TableName::Data, &key)?
            .map(|row| self.decode(&key, &row))
            .transpose()
    }

    /// Store `value` under `key`; `None` deletes the key instead
    pub fn set(&mut self, key: impl Into<Key>, value: Option<&V>) -> CacheResult<()> {
        let key = key.into();
        let Some(value) = value else {
            self.delete(key)?;
            return Ok(());
        };
        let row = Row::new(Some(self.active.id()), self.active.forward(value)?);
        self.backend.set(TableName::Data, &key, &row)?;
        self.after_write()
    }

    pub fn insert(&mut self, key: impl Into<Key>, value: &V) -> CacheResult<()> {
        self.set(key, Some(value))
    }

    /// Remove `key`; returns whether it was present. Absent keys are not
    /// an error.
    pub fn delete(&mut self, key: impl Into<Key>) -> CacheResult<bool> {
        let existed = self.backend.delete(TableName::Data, &key.into())?;
        if existed {
            self.after_write()?;
        }
        Ok(existed)
    }

    /// Never fails; engine errors are logged and reported as absent
    pub fn contains(&self, key: impl Into<Key>) -> bool {
        let key = key.into();
        match self.backend.contains(TableName::Data, &key) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("contains({}) failed, reporting absent: {}", key, e);
                false
            }
        }
    }

    pub fn len(&self) -> CacheResult<u64> {
        self.backend.len(TableName::Data)
    }

    pub fn is_empty(&self) -> CacheResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Keys in backend order
    pub fn keys(&self) -> impl Iterator<Item = CacheResult<Key>> + '_ {
        self.backend
            .iter_all(TableName::Data)
            .map(|entry| entry.map(|(key, _)| key))
    }

    /// Keys written through [`Key::from_serialized`], decoded as `K`
    pub fn keys_as<K: DeserializeOwned>(&self) -> impl Iterator<Item = CacheResult<K>> + '_ {
        self.keys()
            .map(|entry| entry.and_then(|key| key.decode_serialized()))
    }

    /// Decoded entries in key order
    pub fn iter(&self) -> impl Iterator<Item = CacheResult<(Key, V)>> + '_ {
        self.backend.iter_all(TableName::Data).map(move |entry| {
            let (key, row) = entry?;
            let value = self.decode(&key, &row)?;
            Ok((key, value))
        })
    }

    /// Bulk insert; returns the number of entries written
    pub fn populate<I, K>(&mut self, entries: I) -> CacheResult<u64>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Key>,
    {
        let mut written = 0;
        for (key, value) in entries {
            self.set(key, Some(&value))?;
            written += 1;
        }
        Ok(written)
    }

    /// Drop every record. Chains, dictionaries and settings are kept.
    pub fn empty(&mut self) -> CacheResult<()> {
        self.backend.clear(TableName::Data)?;
        self.commit()?;
        tracing::info!("Emptied {} store", self.backend.kind());
        Ok(())
    }

    pub fn commit(&mut self) -> CacheResult<()> {
        self.backend.commit()?;
        self.ops_pending = 0;
        Ok(())
    }

    /// Writes between automatic commits, as persisted in the store
    pub fn commit_interval(&self) -> u64 {
        self.commit_interval
    }

    /// Whether the next write will trigger a commit
    pub fn will_commit(&self) -> bool {
        self.backend.forces_per_op_commit()
            || (self.commit_interval > 0 && self.ops_pending + 1 >= self.commit_interval)
    }

    fn after_write(&mut self) -> CacheResult<()> {
        let commit = self.will_commit();
        self.ops_pending += 1;
        if commit {
            self.commit()?;
        }
        Ok(())
    }

    pub fn vacuum(&mut self) -> CacheResult<()> {
        self.commit()?;
        self.backend.vacuum()
    }

    pub fn optimize(&mut self) -> CacheResult<()> {
        self.commit()?;
        self.backend.optimize()
    }

    /// Row count and stored value bytes of the data table
    pub fn data_size(&self) -> CacheResult<DataSize> {
        self.backend.data_size(TableName::Data)
    }

    pub fn engine_options(&self) -> CacheResult<BTreeMap<String, EngineOption>> {
        self.backend.engine_options()
    }

    pub fn is_initialized(&self) -> CacheResult<bool> {
        metadata::is_initialized(self.backend.as_ref())
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn path(&self) -> Option<&Path> {
        self.backend.path()
    }

    /// The chain new writes go through
    pub fn active_chain(&self) -> &Chain {
        &self.active
    }

    /// Every chain recorded in metadata, and whether it resolves here
    pub fn chains(&self) -> Vec<(ChainId, bool)> {
        let mut chains: Vec<(ChainId, bool)> = self
            .chains
            .iter()
            .map(|(id, slot)| (*id, matches!(slot, ChainSlot::Ready(_))))
            .chain(std::iter::once((self.active.id(), true)))
            .collect();
        chains.sort();
        chains
    }

    pub fn compression_dictionary(&self) -> Option<&Dictionary> {
        self.active.dictionary()
    }

    /// Install `dictionary` on the active chain and recompress its rows
    ///
    /// A no-op if the chain already uses this exact dictionary.
    pub fn apply_compression_dictionary(
        &mut self,
        dictionary: Dictionary,
    ) -> CacheResult<RecompressionReport> {
        if !self.active.supports_dictionary() {
            return Err(CacheError::DictionaryUnsupported(
                self.active.compressor().name().to_string(),
            ));
        }
        let target = self.active.with_dictionary(Some(dictionary));
        let server_side = self.backend.supports_server_side_row_transform();
        let report =
            recompress::recompress(self.backend.as_mut(), &self.active, &target, server_side)?;
        self.ops_pending = 0;
        self.active = target;
        Ok(report)
    }

    /// Train a dictionary from the active chain's rows and recompress them
    ///
    /// `dict_size` defaults to a tenth of the sampled bytes. Every run
    /// retrains from scratch.
    pub fn optimize_compression(
        &mut self,
        dict_size: Option<usize>,
    ) -> CacheResult<RecompressionReport> {
        if !self.active.supports_dictionary() {
            return Err(CacheError::DictionaryUnsupported(
                self.active.compressor().name().to_string(),
            ));
        }
        metadata::register_chain(self.backend.as_mut(), self.active.stages())?;
        self.commit()?;

        let dictionary = recompress::train(self.backend.as_ref(), &self.active, dict_size)?;
        self.apply_compression_dictionary(dictionary)
    }

    /// Copy every entry into the store described by `target`
    ///
    /// The copy resolves its own chain from `target.chain`, so this is how a
    /// store moves to another serializer or compressor. The copy is
    /// committed once at the end and vacuumed. Returns the number of entries
    /// copied.
    pub fn recompress_into(&mut self, target: &CacheOptions) -> CacheResult<u64> {
        if self.path().is_some() && self.path() == Some(target.path.as_path()) {
            return Err(CacheError::Configuration(format!(
                "cannot recompress {:?} into itself",
                target.path
            )));
        }
        self.commit()?;

        let mut copy: Cache<V> = Cache::open_with_registry(target, self.registry.clone())?;
        copy.commit_interval = 0;
        tracing::info!(
            "Copying {} store into {:?} with chain [{}]",
            self.backend.kind(),
            target.path,
            copy.active.stages()
        );

        let mut copied = 0u64;
        for entry in self.iter() {
            let (key, value) = entry?;
            copy.insert(key, &value)?;
            copied += 1;
        }
        copy.commit()?;
        copy.vacuum()?;

        tracing::info!("Copied {} entries into {:?}", copied, target.path);
        Ok(copied)
    }

    /// Rewrite this store under `chain` and put the copy in its place
    ///
    /// The copy is built next to the store (`<path>.tmp`), the old store is
    /// closed and removed, and the copy is renamed over it and reopened.
    pub fn recompress_in_place(mut self, chain: ChainSpec) -> CacheResult<Self> {
        let Some(path) = self.path().map(Path::to_path_buf) else {
            return Err(CacheError::Configuration(
                "a store without a path cannot be replaced".to_string(),
            ));
        };
        let kind = self.backend_kind();
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        // leftover of an interrupted run
        kind.remove(&tmp)?;

        let mut options = CacheOptions::new(&tmp).backend(kind).chain(chain);
        options.commit_interval = Some(self.commit_interval);
        options.compression_level = self.level;
        let copied = self.recompress_into(&options)?;

        let registry = self.registry.clone();
        drop(self);
        kind.remove(&path)?;
        std::fs::rename(&tmp, &path)?;
        tracing::info!("Replaced {:?} with a copy of {} entries", path, copied);

        options.path = path;
        Cache::open_with_registry(&options, registry)
    }

    fn decode(&self, key: &Key, row: &Row) -> CacheResult<V> {
        let id = row
            .chain_id
            .ok_or_else(|| CacheError::Corruption(format!("record {} carries no chain", key)))?;
        self.chain_for(id)?.backward(&row.value)
    }

    /// Chain that decodes rows stored under `id`
    ///
    /// Chains registered by other handles after this one was opened are
    /// looked up once and memoised; their dictionary is the one stored at
    /// that moment.
    fn chain_for(&self, id: ChainId) -> CacheResult<Cow<'_, Chain>> {
        if id == self.active.id() {
            return Ok(Cow::Borrowed(&self.active));
        }
        if let Some(slot) = self.chains.get(&id) {
            return slot.ready(id).map(Cow::Borrowed);
        }
        if let Some(slot) = self.late_chains.borrow().get(&id) {
            return slot.ready(id).map(|chain| Cow::Owned(chain.clone()));
        }

        let stored = metadata::load_chain(self.backend.as_ref(), id)?
            .ok_or(CacheError::UnknownChain(id))?;
        let slot = ChainSlot::resolve(&stored, &self.registry, self.level)?;
        let chain = slot.ready(id).map(|chain| Cow::Owned(chain.clone()));
        tracing::debug!("Resolved chain {} registered after open", id);
        self.late_chains.borrow_mut().insert(id, slot);
        chain
    }
}

/// Pick the stage list new writes use
///
/// An automatic `ChainSpec` keeps the stored active chain when it still resolves here
/// (and suits the hint); otherwise selection runs again.
fn choose_stages(
    options: &CacheOptions,
    registry: &ProviderRegistry,
    settings: Option<&Settings>,
    chains: &HashMap<ChainId, ChainSlot>,
) -> CacheResult<StageList> {
    if let (true, Some(settings)) = (options.chain.is_auto(), settings) {
        let id = settings.active_chain;
        match chains.get(&id) {
            Some(ChainSlot::Ready(chain))
                if options.chain.hint == ValueHint::Typed
                    || chain.serializer().is_self_describing() =>
            {
                return Ok(chain.stages().clone());
            }
            Some(ChainSlot::Ready(chain)) => tracing::debug!(
                "Stored chain {} uses {}, which does not suit {:?} values",
                id,
                chain.serializer(),
                options.chain.hint
            ),
            Some(ChainSlot::Unavailable { provider }) => tracing::warn!(
                "Stored chain {} needs unavailable provider `{}`; new writes use a fresh chain",
                id,
                provider
            ),
            Some(ChainSlot::Invalid(msg)) => {
                tracing::warn!("Stored chain {} is unusable: {}", id, msg)
            }
            None => tracing::warn!("Active chain {} has no descriptor", id),
        }
    }
    options.chain.resolve(registry)
}

impl<V> Drop for Cache<V> {
    fn drop(&mut self) {
        if self.ops_pending > 0 {
            if let Err(e) = self.backend.commit() {
                tracing::warn!("Failed to commit pending writes on close: {}", e);
            }
        }
    }
}

impl<V> fmt::Debug for Cache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("backend", &self.backend.kind())
            .field("path", &self.backend.path())
            .field("active", &self.active)
            .field("chains", &self.chains.len())
            .field("commit_interval", &self.commit_interval)
            .field("ops_pending", &self.ops_pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SledBackend, SqliteBackend};
    use std::collections::BTreeMap as Map;
    use tempfile::tempdir;

    fn memory_cache<V: Serialize + DeserializeOwned>(options: &CacheOptions) -> Cache<V> {
        let backend = Box::new(SqliteBackend::open_in_memory().unwrap());
        Cache::with_backend(backend, options, ProviderRegistry::installed()).unwrap()
    }

    #[test]
    fn test_set_get_str() {
        let mut cache: Cache<String> = memory_cache(&CacheOptions::default());
        cache.insert("str", &"str".to_string()).unwrap();
        assert_eq!(cache.get("str").unwrap(), "str");
    }

    #[test]
    fn test_missing_key() {
        let cache: Cache<String> = memory_cache(&CacheOptions::default());
        assert!(matches!(cache.get("nope"), Err(CacheError::KeyNotFound(_))));
        assert_eq!(cache.try_get("nope").unwrap(), None);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let mut cache: Cache<Map<String, i32>> = memory_cache(&CacheOptions::default());
        cache
            .insert("object", &Map::from([("a".to_string(), 1)]))
            .unwrap();
        assert!(cache.delete("object").unwrap());
        assert!(!cache.delete("object").unwrap());
        assert!(!cache.contains("object"));
    }

    #[test]
    fn test_none_routes_to_delete() {
        let mut cache: Cache<u64> = memory_cache(&CacheOptions::default());
        cache.insert(7i64, &49).unwrap();
        assert!(cache.contains(7i64));
        cache.set(7i64, None).unwrap();
        assert!(!cache.contains(7i64));
        // absent key + None is fine too
        cache.set(8i64, None).unwrap();
    }

    #[test]
    fn test_keys_and_iter_in_order() {
        let mut cache: Cache<String> = memory_cache(&CacheOptions::default());
        let written = cache
            .populate([(3i64, "c".to_string()), (1, "a".to_string()), (2, "b".to_string())])
            .unwrap();
        assert_eq!(written, 3);
        assert_eq!(cache.len().unwrap(), 3);

        let keys: Vec<Key> = cache.keys().collect::<CacheResult<_>>().unwrap();
        assert_eq!(keys, vec![Key::Int(1), Key::Int(2), Key::Int(3)]);
        let values: Vec<String> = cache
            .iter()
            .map(|entry| entry.map(|(_, v)| v))
            .collect::<CacheResult<_>>()
            .unwrap();
        assert_eq!(values, ["a", "b", "c"]);
    }

    #[test]
    fn test_commit_counter() {
        let mut cache: Cache<u32> = memory_cache(&CacheOptions::default().commit_interval(3));
        assert!(!cache.will_commit());
        cache.insert(1i64, &1).unwrap();
        assert!(!cache.will_commit());
        cache.insert(2i64, &2).unwrap();
        assert_eq!(cache.ops_pending, 2);
        assert!(cache.will_commit());
        cache.insert(3i64, &3).unwrap();
        assert_eq!(cache.ops_pending, 0);
    }

    #[test]
    fn test_per_op_backend_ignores_commit_interval() {
        let backend = Box::new(SledBackend::open_temporary().unwrap());
        let options = CacheOptions::default().commit_interval(1_000);
        let mut cache: Cache<u32> =
            Cache::with_backend(backend, &options, ProviderRegistry::installed()).unwrap();

        for i in 0..3i64 {
            assert!(cache.will_commit());
            cache.insert(i, &(i as u32)).unwrap();
            assert_eq!(cache.ops_pending, 0);
        }
        assert!(cache.delete(0i64).unwrap());
        assert_eq!(cache.ops_pending, 0);
    }

    #[test]
    fn test_stored_commit_interval_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("interval.sqlite");
        {
            let cache: Cache<u32> = Cache::open(&CacheOptions::new(&path).commit_interval(50)).unwrap();
            assert_eq!(cache.commit_interval(), 50);
        }

        let mut cache: Cache<u32> = Cache::open(&CacheOptions::new(&path)).unwrap();
        assert_eq!(cache.commit_interval(), 50);
        cache.insert(1i64, &1).unwrap();
        assert_eq!(cache.ops_pending, 1);
        drop(cache);

        // an explicit interval wins and is stored
        let cache: Cache<u32> = Cache::open(&CacheOptions::new(&path).commit_interval(0)).unwrap();
        assert_eq!(cache.commit_interval(), 0);
        drop(cache);
        let cache: Cache<u32> = Cache::open(&CacheOptions::new(&path)).unwrap();
        assert_eq!(cache.commit_interval(), 0);
    }

    #[test]
    fn test_new_store_uses_default_commit_interval() {
        let cache: Cache<u32> = memory_cache(&CacheOptions::default());
        assert_eq!(cache.commit_interval(), DEFAULT_COMMIT_INTERVAL);
    }

    #[cfg(feature = "deflate")]
    #[test]
    fn test_chain_registered_by_another_handle_is_resolved_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.sqlite");
        let reader: Cache<String> =
            Cache::open(&CacheOptions::new(&path).chain(ChainSpec::explicit("json", "none")))
                .unwrap();
        {
            let mut writer: Cache<String> = Cache::open(
                &CacheOptions::new(&path).chain(ChainSpec::explicit("json", "deflate")),
            )
            .unwrap();
            writer.insert("late", &"written elsewhere".to_string()).unwrap();
        }

        assert_eq!(reader.get("late").unwrap(), "written elsewhere");
        assert_eq!(reader.late_chains.borrow().len(), 1);
        assert_eq!(reader.get("late").unwrap(), "written elsewhere");
        assert_eq!(reader.late_chains.borrow().len(), 1);
    }

    #[test]
    fn test_empty_keeps_metadata() {
        let mut cache: Cache<String> = memory_cache(&CacheOptions::default());
        for i in 0..5i64 {
            cache.insert(i, &format!("value {}", i)).unwrap();
        }
        cache.empty().unwrap();
        assert!(cache.is_empty().unwrap());
        assert!(cache.is_initialized().unwrap());
        assert_eq!(cache.chains(), vec![(cache.active_chain().id(), true)]);
    }

    #[test]
    fn test_row_without_chain_is_corrupt() {
        let mut cache: Cache<String> = memory_cache(&CacheOptions::default());
        cache
            .backend
            .set(TableName::Data, &Key::from("raw"), &Row::plain(b"x".to_vec()))
            .unwrap();
        assert!(matches!(cache.get("raw"), Err(CacheError::Corruption(_))));
    }

    #[test]
    fn test_row_under_unknown_chain() {
        let mut cache: Cache<String> = memory_cache(&CacheOptions::default());
        cache
            .backend
            .set(
                TableName::Data,
                &Key::from("stray"),
                &Row::new(Some(ChainId(0x1234)), b"x".to_vec()),
            )
            .unwrap();
        assert!(matches!(
            cache.get("stray"),
            Err(CacheError::UnknownChain(ChainId(0x1234)))
        ));
    }

    #[test]
    fn test_explicit_unavailable_provider_fails_at_open() {
        let backend = Box::new(SqliteBackend::open_in_memory().unwrap());
        let options = CacheOptions::default().serializer("json").compressor("brotli");
        let err = Cache::<String>::with_backend(backend, &options, ProviderRegistry::installed())
            .unwrap_err();
        assert!(matches!(err, CacheError::UnavailableProvider { .. }));
    }

    #[test]
    fn test_uninitialized_store_without_create() {
        let backend = Box::new(SqliteBackend::open_in_memory().unwrap());
        let options = CacheOptions::default().create(false);
        let err = Cache::<String>::with_backend(backend, &options, ProviderRegistry::installed())
            .unwrap_err();
        assert!(matches!(err, CacheError::Configuration(_)));
    }

    #[test]
    fn test_no_compression_has_no_dictionary() {
        let options = CacheOptions::default().serializer("json").compressor("none");
        let mut cache: Cache<String> = memory_cache(&options);
        assert!(matches!(
            cache.optimize_compression(None),
            Err(CacheError::DictionaryUnsupported(_))
        ));
    }

    #[test]
    fn test_self_describing_values() {
        let options = CacheOptions::default().hint(ValueHint::SelfDescribing);
        let mut cache: Cache<serde_json::Value> = memory_cache(&options);
        let value = serde_json::json!({"nested": {"list": [1, "two", null]}});
        cache.insert("doc", &value).unwrap();
        assert_eq!(cache.get("doc").unwrap(), value);
        assert_eq!(cache.active_chain().serializer().to_string(), "json");
    }
}

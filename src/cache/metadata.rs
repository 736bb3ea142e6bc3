//! Persisted metadata layout
//!
//! The metadata table holds JSON documents under text keys:
//!
//! ```text
//! "settings"          -> Settings { version, active_chain, commit_interval }
//! "chain:<id>"        -> ChainDescriptor { version, stages }
//! "dictionary:<id>"   -> raw dictionary bytes (row chain = <id>)
//! ```
//!
//! A chain id, once written, always maps to the same stage list. Readers
//! refuse documents carrying a newer format version.

use crate::backend::{Backend, BatchOp, Key, Row, TableName};
use crate::error::{CacheError, CacheResult};
use crate::transform::{ChainId, Dictionary, StageList};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Layout version written by this build
pub const FORMAT_VERSION: u32 = 1;

const SETTINGS_KEY: &str = "settings";
const CHAIN_PREFIX: &str = "chain:";
const DICTIONARY_PREFIX: &str = "dictionary:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainDescriptor {
    pub version: u32,
    pub stages: StageList,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    pub active_chain: ChainId,
    pub commit_interval: u64,
}

/// A chain as found in metadata, not yet resolved against providers
#[derive(Debug, Clone)]
pub struct StoredChain {
    pub id: ChainId,
    pub stages: StageList,
    pub dictionary: Option<Dictionary>,
}

fn settings_key() -> Key {
    Key::from(SETTINGS_KEY)
}

fn chain_key(id: ChainId) -> Key {
    Key::Text(format!("{}{}", CHAIN_PREFIX, id))
}

fn dictionary_key(id: ChainId) -> Key {
    Key::Text(format!("{}{}", DICTIONARY_PREFIX, id))
}

fn parse_id(hex: &str) -> CacheResult<ChainId> {
    u32::from_str_radix(hex, 16)
        .map(ChainId)
        .map_err(|e| CacheError::Corruption(format!("bad chain id `{}`: {}", hex, e)))
}

fn decode<T: DeserializeOwned>(what: &str, bytes: &[u8]) -> CacheResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| CacheError::Corruption(format!("cannot decode {}: {}", what, e)))
}

fn check_version(what: &str, version: u32) -> CacheResult<()> {
    if version > FORMAT_VERSION {
        return Err(CacheError::Corruption(format!(
            "{} has format version {}, this build reads up to {}",
            what, version, FORMAT_VERSION
        )));
    }
    Ok(())
}

/// Both tables exist and settings were written
pub fn is_initialized(backend: &dyn Backend) -> CacheResult<bool> {
    if !backend.table_exists(TableName::Metadata)? || !backend.table_exists(TableName::Data)? {
        return Ok(false);
    }
    backend.contains(TableName::Metadata, &settings_key())
}

pub fn load_settings(backend: &dyn Backend) -> CacheResult<Option<Settings>> {
    let Some(row) = backend.get(TableName::Metadata, &settings_key())? else {
        return Ok(None);
    };
    let settings: Settings = decode("settings", &row.value)?;
    check_version("settings", settings.version)?;
    Ok(Some(settings))
}

pub fn store_settings(backend: &mut dyn Backend, settings: &Settings) -> CacheResult<()> {
    let value = serde_json::to_vec(settings)?;
    backend.set(TableName::Metadata, &settings_key(), &Row::plain(value))
}

/// Record a chain's stage list, unless already present
///
/// An existing descriptor under the same id must name the same stages.
pub fn register_chain(backend: &mut dyn Backend, stages: &StageList) -> CacheResult<ChainId> {
    let id = stages.chain_id();
    if let Some(existing) = load_chain(backend, id)? {
        if &existing.stages != stages {
            return Err(CacheError::Corruption(format!(
                "chain {} is recorded as [{}], refusing to rebind it to [{}]",
                id, existing.stages, stages
            )));
        }
        return Ok(id);
    }
    let descriptor = ChainDescriptor {
        version: FORMAT_VERSION,
        stages: stages.clone(),
    };
    let value = serde_json::to_vec(&descriptor)?;
    backend.set(TableName::Metadata, &chain_key(id), &Row::new(Some(id), value))?;
    tracing::debug!("Registered chain {} as [{}]", id, stages);
    Ok(id)
}

/// One chain's descriptor and dictionary
pub fn load_chain(backend: &dyn Backend, id: ChainId) -> CacheResult<Option<StoredChain>> {
    let Some(row) = backend.get(TableName::Metadata, &chain_key(id))? else {
        return Ok(None);
    };
    let descriptor: ChainDescriptor = decode("chain descriptor", &row.value)?;
    check_version("chain descriptor", descriptor.version)?;
    if descriptor.stages.chain_id() != id {
        return Err(CacheError::Corruption(format!(
            "descriptor stored under chain {} hashes to {}",
            id,
            descriptor.stages.chain_id()
        )));
    }
    let dictionary = backend
        .get(TableName::Metadata, &dictionary_key(id))?
        .map(|row| Dictionary::new(row.value));
    Ok(Some(StoredChain {
        id,
        stages: descriptor.stages,
        dictionary,
    }))
}

/// Every chain recorded in metadata
///
/// Keys this build does not recognise are skipped.
pub fn load_chains(backend: &dyn Backend) -> CacheResult<Vec<StoredChain>> {
    let mut ids = Vec::new();
    for entry in backend.iter_all(TableName::Metadata) {
        let (key, _) = entry?;
        match &key {
            Key::Text(name) => {
                if let Some(hex) = name.strip_prefix(CHAIN_PREFIX) {
                    ids.push(parse_id(hex)?);
                }
            }
            other => tracing::debug!("Ignoring unrecognised metadata key {}", other),
        }
    }

    let mut chains = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(chain) = load_chain(backend, id)? {
            chains.push(chain);
        }
    }
    Ok(chains)
}

/// Batch op that installs (or removes) a chain's dictionary
pub fn dictionary_op(id: ChainId, dictionary: Option<&Dictionary>) -> BatchOp {
    match dictionary {
        Some(dict) => BatchOp::Put {
            table: TableName::Metadata,
            key: dictionary_key(id),
            row: Row::new(Some(id), dict.as_bytes().to_vec()),
        },
        None => BatchOp::Delete {
            table: TableName::Metadata,
            key: dictionary_key(id),
        },
    }
}

pub fn store_dictionary(
    backend: &mut dyn Backend,
    id: ChainId,
    dictionary: &Dictionary,
) -> CacheResult<()> {
    let row = Row::new(Some(id), dictionary.as_bytes().to_vec());
    backend.set(TableName::Metadata, &dictionary_key(id), &row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;

    fn backend() -> Box<dyn Backend> {
        let mut backend: Box<dyn Backend> = Box::new(SqliteBackend::open_in_memory().unwrap());
        for table in TableName::ALL {
            backend.create_table(table).unwrap();
        }
        backend
    }

    #[test]
    fn test_uninitialized_until_settings_written() {
        let mut backend = backend();
        assert!(!is_initialized(backend.as_ref()).unwrap());

        let settings = Settings {
            version: FORMAT_VERSION,
            active_chain: ChainId(7),
            commit_interval: 10,
        };
        store_settings(backend.as_mut(), &settings).unwrap();
        assert!(is_initialized(backend.as_ref()).unwrap());
        assert_eq!(load_settings(backend.as_ref()).unwrap(), Some(settings));
    }

    #[test]
    fn test_chain_descriptor_and_dictionary() {
        let mut backend = backend();
        let stages = StageList::new(["json", "zstd"]);
        let id = register_chain(backend.as_mut(), &stages).unwrap();
        assert_eq!(id, stages.chain_id());

        // registering twice is a no-op
        register_chain(backend.as_mut(), &stages).unwrap();

        let dict = Dictionary::new(vec![9u8; 300]);
        store_dictionary(backend.as_mut(), id, &dict).unwrap();

        let chains = load_chains(backend.as_ref()).unwrap();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].id, id);
        assert_eq!(chains[0].stages, stages);
        assert_eq!(chains[0].dictionary.as_ref(), Some(&dict));
    }

    #[test]
    fn test_newer_format_is_refused() {
        let mut backend = backend();
        let stages = StageList::new(["json", "none"]);
        let id = stages.chain_id();
        let future = serde_json::json!({"version": FORMAT_VERSION + 1, "stages": ["json", "none"]});
        backend
            .set(
                TableName::Metadata,
                &chain_key(id),
                &Row::plain(serde_json::to_vec(&future).unwrap()),
            )
            .unwrap();

        let err = load_chain(backend.as_ref(), id).unwrap_err();
        assert!(matches!(err, CacheError::Corruption(_)));
    }

    #[test]
    fn test_descriptor_under_wrong_id_is_refused() {
        let mut backend = backend();
        let descriptor = ChainDescriptor {
            version: FORMAT_VERSION,
            stages: StageList::new(["json", "none"]),
        };
        let wrong = ChainId(1);
        backend
            .set(
                TableName::Metadata,
                &chain_key(wrong),
                &Row::plain(serde_json::to_vec(&descriptor).unwrap()),
            )
            .unwrap();
        assert!(matches!(
            load_chain(backend.as_ref(), wrong),
            Err(CacheError::Corruption(_))
        ));
    }

    #[test]
    fn test_dictionary_op_removes() {
        let mut backend = backend();
        let id = ChainId(3);
        store_dictionary(backend.as_mut(), id, &Dictionary::new(vec![1, 2, 3])).unwrap();
        backend.write_batch(vec![dictionary_op(id, None)]).unwrap();
        assert!(backend
            .get(TableName::Metadata, &dictionary_key(id))
            .unwrap()
            .is_none());
    }
}

//! Chains and chain identifiers

use crate::error::{CacheError, CacheResult};
use crate::transform::compressor::{Compressor, CompressorKind, Dictionary};
use crate::transform::registry::ProviderRegistry;
use crate::transform::serializer::{self, SerializerKind};
use crate::transform::Transformer;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Stable identifier of a stage list
///
/// Derived from the stage names only, so the same pipeline maps to the
/// same id in every process that can resolve it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u32);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Ordered stage names, as persisted in chain descriptors
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageList(Vec<String>);

impl StageList {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn single(name: impl Into<String>) -> Self {
        Self(vec![name.into()])
    }

    /// Append one stage
    pub fn then(mut self, name: impl Into<String>) -> Self {
        self.0.push(name.into());
        self
    }

    /// Sequential composition
    pub fn concat(mut self, other: StageList) -> Self {
        self.0.extend(other.0);
        self
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn chain_id(&self) -> ChainId {
        ChainId(crc32fast::hash(self.0.join(">").as_bytes()))
    }
}

impl<S: Into<String>> FromIterator<S> for StageList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl fmt::Display for StageList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" > "))
    }
}

/// A resolved chain: serializer, terminal compressor, optional dictionary
#[derive(Clone)]
pub struct Chain {
    id: ChainId,
    stages: StageList,
    serializer: SerializerKind,
    compressor: Arc<dyn Compressor>,
    dictionary: Option<Dictionary>,
}

impl Chain {
    /// Resolve a stage list against the providers usable here
    ///
    /// The list must be `[serializer, compressor]`. Unknown or unavailable
    /// names fail with [`CacheError::UnavailableProvider`]; nothing is
    /// substituted.
    pub fn from_stages(
        stages: &StageList,
        registry: &ProviderRegistry,
        level: Option<i32>,
    ) -> CacheResult<Self> {
        let id = stages.chain_id();
        let unavailable = |provider: &str| CacheError::UnavailableProvider {
            chain_id: id,
            provider: provider.to_string(),
        };

        let [serializer_name, compressor_name] = stages.names() else {
            return Err(CacheError::Configuration(format!(
                "chain {} must be `serializer > compressor`, got [{}]",
                id, stages
            )));
        };

        let serializer_name = serializer_name.as_str();
        let compressor_name = compressor_name.as_str();

        let serializer = match SerializerKind::from_name(serializer_name) {
            Some(s) if registry.is_available(s.name()) => s,
            Some(_) => return Err(unavailable(serializer_name)),
            None if CompressorKind::from_name(serializer_name).is_some() => {
                return Err(CacheError::Configuration(format!(
                    "chain {} starts with compressor `{}`",
                    id, serializer_name
                )))
            }
            None => return Err(unavailable(serializer_name)),
        };

        let compressor = match CompressorKind::from_name(compressor_name) {
            Some(c) if registry.is_available(c.name()) => c.instantiate(level)?,
            Some(_) => return Err(unavailable(compressor_name)),
            None if SerializerKind::from_name(compressor_name).is_some() => {
                return Err(CacheError::Configuration(format!(
                    "chain {} must end with a compressor, got `{}`",
                    id, compressor_name
                )))
            }
            None => return Err(unavailable(compressor_name)),
        };

        Ok(Self {
            id,
            stages: stages.clone(),
            serializer,
            compressor,
            dictionary: None,
        })
    }

    pub fn id(&self) -> ChainId {
        self.id
    }

    pub fn stages(&self) -> &StageList {
        &self.stages
    }

    pub fn serializer(&self) -> SerializerKind {
        self.serializer
    }

    pub fn compressor(&self) -> &dyn Compressor {
        self.compressor.as_ref()
    }

    pub fn dictionary(&self) -> Option<&Dictionary> {
        self.dictionary.as_ref()
    }

    pub fn supports_dictionary(&self) -> bool {
        self.compressor.supports_dictionary()
    }

    /// Same topology, different dictionary state
    pub fn with_dictionary(&self, dictionary: Option<Dictionary>) -> Self {
        Self {
            dictionary,
            ..self.clone()
        }
    }

    /// Value -> stored bytes
    pub fn forward<V: Serialize + ?Sized>(&self, value: &V) -> CacheResult<Vec<u8>> {
        let bytes = self.serializer.forward(value)?;
        self.compress(&bytes)
    }

    /// Stored bytes -> value
    pub fn backward<V: DeserializeOwned>(&self, stored: &[u8]) -> CacheResult<V> {
        let bytes = self.decompress(stored)?;
        self.serializer
            .backward(&bytes)
            .map_err(|e| serializer::decode_error(self.serializer, e))
    }

    /// Compressor stage only, with this chain's dictionary
    pub fn compress(&self, raw: &[u8]) -> CacheResult<Vec<u8>> {
        self.compressor.compress(raw, self.dictionary.as_ref())
    }

    pub fn decompress(&self, stored: &[u8]) -> CacheResult<Vec<u8>> {
        self.compressor.decompress(stored, self.dictionary.as_ref())
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("id", &self.id)
            .field("stages", &self.stages)
            .field("dictionary", &self.dictionary)
            .finish()
    }
}

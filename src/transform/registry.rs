//! Provider registry and chain selection
//!
//! The set of providers compiled into this build is fixed by cargo
//! features. A [`ProviderRegistry`] value can narrow it further, which is
//! how callers pin an installation profile (and how tests simulate a
//! machine missing a codec).

use crate::error::{CacheError, CacheResult};
use crate::transform::chain::StageList;
use crate::transform::compressor::CompressorKind;
use crate::transform::serializer::SerializerKind;
use crate::transform::StageKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What the caller knows about the values it will store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueHint {
    /// Values always decode into the same concrete type
    #[default]
    Typed,
    /// Values must decode without a concrete type (e.g. `serde_json::Value`)
    SelfDescribing,
}

/// Static facts about one provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderDescriptor {
    pub name: &'static str,
    pub kind: StageKind,
    /// Higher wins
    pub score: u8,
    pub self_describing: bool,
    pub dictionary: bool,
    pub training: bool,
    pub compiled: bool,
}

impl ProviderDescriptor {
    fn serializer(kind: SerializerKind, score: u8) -> Self {
        use crate::transform::Transformer;
        Self {
            name: kind.name(),
            kind: StageKind::Serializer,
            score,
            self_describing: kind.is_self_describing(),
            dictionary: false,
            training: false,
            compiled: kind.is_available(),
        }
    }

    fn compressor(kind: CompressorKind, score: u8) -> Self {
        Self {
            name: kind.name(),
            kind: StageKind::Compressor,
            score,
            self_describing: false,
            dictionary: kind.supports_dictionary(),
            training: kind.supports_training(),
            compiled: kind.is_compiled(),
        }
    }

    fn feature_count(&self) -> u8 {
        self.self_describing as u8 + self.dictionary as u8 + self.training as u8
    }
}

/// Every provider this crate knows, compiled in or not
pub fn known_providers() -> Vec<ProviderDescriptor> {
    vec![
        ProviderDescriptor::serializer(SerializerKind::Bincode, 20),
        ProviderDescriptor::serializer(SerializerKind::Json, 10),
        ProviderDescriptor::compressor(CompressorKind::Zstd, 40),
        ProviderDescriptor::compressor(CompressorKind::Lz4, 30),
        ProviderDescriptor::compressor(CompressorKind::Deflate, 20),
        ProviderDescriptor::compressor(CompressorKind::None, 0),
    ]
}

/// Providers usable by this process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderRegistry {
    masked: BTreeSet<String>,
}

impl ProviderRegistry {
    /// Everything compiled in
    pub fn installed() -> Self {
        Self::default()
    }

    /// Hide one provider
    pub fn without(mut self, name: impl Into<String>) -> Self {
        self.masked.insert(name.into());
        self
    }

    /// Hide everything except the named providers
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keep: BTreeSet<String> = names.into_iter().map(|n| n.as_ref().to_string()).collect();
        let masked = known_providers()
            .into_iter()
            .map(|p| p.name.to_string())
            .filter(|name| !keep.contains(name))
            .collect();
        Self { masked }
    }

    pub fn is_available(&self, name: &str) -> bool {
        !self.masked.contains(name)
            && known_providers()
                .iter()
                .any(|p| p.name == name && p.compiled)
    }

    pub fn available(&self) -> Vec<ProviderDescriptor> {
        known_providers()
            .into_iter()
            .filter(|p| p.compiled && !self.masked.contains(p.name))
            .collect()
    }

    /// Best `[serializer, compressor]` among the available providers
    pub fn select(&self, hint: ValueHint) -> CacheResult<StageList> {
        select_stages(&self.available(), hint)
    }
}

/// Deterministic chain selection
///
/// Rank by score, then by number of features, then by name. The
/// serializer must be self-describing when the hint asks for it.
pub fn select_stages(available: &[ProviderDescriptor], hint: ValueHint) -> CacheResult<StageList> {
    let best = |kind: StageKind, require_self_describing: bool| {
        available
            .iter()
            .filter(|p| p.kind == kind)
            .filter(|p| !require_self_describing || p.self_describing)
            .max_by(|a, b| {
                a.score
                    .cmp(&b.score)
                    .then(a.feature_count().cmp(&b.feature_count()))
                    .then(b.name.cmp(a.name))
            })
    };

    let serializer = best(StageKind::Serializer, hint == ValueHint::SelfDescribing).ok_or_else(
        || {
            CacheError::Serialization(format!(
                "no available serializer can represent {:?} values",
                hint
            ))
        },
    )?;
    let compressor = best(StageKind::Compressor, false).ok_or_else(|| {
        CacheError::Configuration("no compressor available (not even `none`)".to_string())
    })?;

    Ok(StageList::new([serializer.name, compressor.name]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(stages: &StageList) -> Vec<&str> {
        stages.names().iter().map(String::as_str).collect()
    }

    #[cfg(all(feature = "bincode", feature = "zstd"))]
    #[test]
    fn test_default_selection_prefers_best() {
        let stages = ProviderRegistry::installed().select(ValueHint::Typed).unwrap();
        assert_eq!(names(&stages), ["bincode", "zstd"]);
    }

    #[test]
    fn test_self_describing_hint_skips_bincode() {
        let stages = ProviderRegistry::installed()
            .select(ValueHint::SelfDescribing)
            .unwrap();
        assert_eq!(names(&stages)[0], "json");
    }

    #[cfg(feature = "lz4")]
    #[test]
    fn test_masking_falls_through_precedence() {
        let stages = ProviderRegistry::installed()
            .without("zstd")
            .without("bincode")
            .select(ValueHint::Typed)
            .unwrap();
        assert_eq!(names(&stages), ["json", "lz4"]);
    }

    #[test]
    fn test_only_keeps_named() {
        let registry = ProviderRegistry::only(["json", "none"]);
        assert!(registry.is_available("json"));
        assert!(!registry.is_available("zstd"));
        assert!(!registry.is_available("brotli"));
        let stages = registry.select(ValueHint::Typed).unwrap();
        assert_eq!(names(&stages), ["json", "none"]);
    }

    #[test]
    fn test_no_serializer_is_an_error() {
        let err = ProviderRegistry::only(["none"])
            .select(ValueHint::Typed)
            .unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
    }

    #[test]
    fn test_selection_is_deterministic_on_ties() {
        let mut providers = vec![
            ProviderDescriptor::serializer(SerializerKind::Json, 10),
            ProviderDescriptor::compressor(CompressorKind::None, 5),
            ProviderDescriptor::compressor(CompressorKind::Deflate, 5),
        ];
        let first = select_stages(&providers, ValueHint::Typed).unwrap();
        providers.reverse();
        let second = select_stages(&providers, ValueHint::Typed).unwrap();
        assert_eq!(first, second);
        assert_eq!(names(&first), ["json", "deflate"]);
    }
}

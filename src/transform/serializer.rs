//! Serializer providers
//!
//! The first stage of every chain. Each provider is a serde data format;
//! `bincode` is compact and fast but needs the concrete type to decode,
//! `json` is self-describing and decodes dynamic values too.

use crate::error::{CacheError, CacheResult};
use crate::transform::{StageKind, Transformer};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    Bincode,
    Json,
}

impl SerializerKind {
    /// Every serializer this crate knows about, compiled in or not
    pub const ALL: &'static [SerializerKind] = &[SerializerKind::Bincode, SerializerKind::Json];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.name() == name)
    }

    /// Can decode without knowing the target type up front
    pub fn is_self_describing(&self) -> bool {
        match self {
            SerializerKind::Bincode => false,
            SerializerKind::Json => true,
        }
    }

    /// Value -> bytes
    pub fn forward<V: Serialize + ?Sized>(&self, value: &V) -> CacheResult<Vec<u8>> {
        match self {
            #[cfg(feature = "bincode")]
            SerializerKind::Bincode => Ok(bincode::serialize(value)?),
            #[cfg(not(feature = "bincode"))]
            SerializerKind::Bincode => Err(not_compiled(*self)),
            SerializerKind::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Bytes -> value
    pub fn backward<V: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<V> {
        match self {
            #[cfg(feature = "bincode")]
            SerializerKind::Bincode => Ok(bincode::deserialize(bytes)?),
            #[cfg(not(feature = "bincode"))]
            SerializerKind::Bincode => Err(not_compiled(*self)),
            SerializerKind::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

#[cfg(not(feature = "bincode"))]
fn not_compiled(kind: SerializerKind) -> CacheError {
    CacheError::Configuration(format!("serializer `{}` is not compiled in", kind.name()))
}

impl Transformer for SerializerKind {
    fn name(&self) -> &'static str {
        match self {
            SerializerKind::Bincode => "bincode",
            SerializerKind::Json => "json",
        }
    }

    fn stage_kind(&self) -> StageKind {
        StageKind::Serializer
    }

    fn is_available(&self) -> bool {
        match self {
            SerializerKind::Bincode => cfg!(feature = "bincode"),
            SerializerKind::Json => true,
        }
    }
}

impl std::fmt::Display for SerializerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Map a serde error that happened while decoding into the cache taxonomy
pub(crate) fn decode_error(kind: SerializerKind, err: CacheError) -> CacheError {
    match err {
        CacheError::Serialization(msg) => {
            CacheError::Serialization(format!("{} decode failed: {}", kind.name(), msg))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Reading {
        sensor: String,
        value: f64,
        tags: BTreeMap<String, String>,
        previous: Option<Box<Reading>>,
    }

    fn reading() -> Reading {
        Reading {
            sensor: "kitchen".to_string(),
            value: 21.5,
            tags: BTreeMap::from([("unit".to_string(), "celsius".to_string())]),
            previous: Some(Box::new(Reading {
                sensor: "kitchen".to_string(),
                value: 21.0,
                tags: BTreeMap::new(),
                previous: None,
            })),
        }
    }

    #[test]
    fn test_json_handles_dynamic_values() {
        let value = serde_json::json!({"a": [1, 2, 3.5], "b": null, "c": {}});
        let bytes = SerializerKind::Json.forward(&value).unwrap();
        let back: serde_json::Value = SerializerKind::Json.backward(&bytes).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_typed_value_through_every_available_serializer() {
        for kind in SerializerKind::ALL.iter().filter(|k| k.is_available()) {
            let bytes = kind.forward(&reading()).unwrap();
            let back: Reading = kind.backward(&bytes).unwrap();
            assert_eq!(back, reading(), "serializer {}", kind);
        }
    }

    #[cfg(feature = "bincode")]
    #[test]
    fn test_bincode_is_compact_but_not_self_describing() {
        let typed = SerializerKind::Bincode.forward(&reading()).unwrap();
        let json = SerializerKind::Json.forward(&reading()).unwrap();
        assert!(typed.len() < json.len());

        let value = serde_json::json!({"a": 1});
        let bytes = SerializerKind::Bincode.forward(&value).unwrap();
        let err = SerializerKind::Bincode
            .backward::<serde_json::Value>(&bytes)
            .unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
    }

    #[test]
    fn test_names_round_trip() {
        for kind in SerializerKind::ALL {
            assert_eq!(SerializerKind::from_name(kind.name()), Some(*kind));
            assert_eq!(kind.stage_kind(), StageKind::Serializer);
        }
        assert_eq!(SerializerKind::from_name("msgpack"), None);
    }
}

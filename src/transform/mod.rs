//! Transformer chains
//!
//! A chain turns a domain value into storage bytes and back:
//!
//! ```text
//! forward:   value ── serializer ──▶ bytes ── compressor(dict?) ──▶ stored bytes
//! backward:  stored bytes ── decompressor(dict?) ──▶ bytes ── deserializer ──▶ value
//! ```
//!
//! - **serializer**: serde-based serializer providers
//! - **compressor**: compressor providers, shared dictionaries and training
//! - **chain**: stage lists, chain ids and resolved chains
//! - **registry**: which providers are usable here and how they rank

pub mod chain;
pub mod compressor;
pub mod registry;
pub mod serializer;

use std::fmt;

pub use chain::{Chain, ChainId, StageList};
pub use compressor::{
    default_dictionary_size, Compressor, CompressorKind, Dictionary, MAX_DICTIONARY_SIZE,
    MIN_DICTIONARY_SIZE, MIN_TRAINING_BYTES, MIN_TRAINING_SAMPLES,
};
pub use registry::{select_stages, ProviderDescriptor, ProviderRegistry, ValueHint};
pub use serializer::SerializerKind;

/// The two stage variants a chain is made of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Serializer,
    Compressor,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Serializer => f.write_str("serializer"),
            StageKind::Compressor => f.write_str("compressor"),
        }
    }
}

/// Surface shared by every chain stage
pub trait Transformer {
    /// Stable name, recorded in chain descriptors
    fn name(&self) -> &'static str;

    fn stage_kind(&self) -> StageKind;

    /// Whether the underlying provider is compiled into this build
    fn is_available(&self) -> bool;
}

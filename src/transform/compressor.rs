//! Compressor providers
//!
//! The terminal stage of every chain. Compressors take an optional shared
//! [`Dictionary`]; the ones that support it can also train one from a
//! sample of raw (uncompressed) rows.

use crate::error::{CacheError, CacheResult};
use crate::transform::{StageKind, Transformer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
#[cfg(feature = "zstd")]
use std::sync::Mutex;

/// Fewer samples than this is not representative enough to train on
pub const MIN_TRAINING_SAMPLES: usize = 8;

/// Total sample bytes needed before training is attempted
pub const MIN_TRAINING_BYTES: usize = 1024;

pub const MIN_DICTIONARY_SIZE: usize = 256;

/// zstd's own default (110 KiB)
pub const MAX_DICTIONARY_SIZE: usize = 112_640;

/// lz4 only ever looks back 64 KiB
const LZ4_WINDOW: usize = 64 * 1024;

/// Dictionary size used when the caller does not pick one: a tenth of the
/// sampled data, clamped to sane bounds
pub fn default_dictionary_size(sample_bytes: usize) -> usize {
    (sample_bytes / 10).clamp(MIN_DICTIONARY_SIZE, MAX_DICTIONARY_SIZE)
}

/// An opaque trained blob shared by every row of one chain
#[derive(Clone, PartialEq, Eq)]
pub struct Dictionary {
    bytes: Arc<[u8]>,
    checksum: u32,
}

impl Dictionary {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        Self {
            checksum: crc32fast::hash(&bytes),
            bytes: Arc::from(bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// crc32 of the dictionary bytes
    pub fn checksum(&self) -> u32 {
        self.checksum
    }
}

impl fmt::Debug for Dictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dictionary")
            .field("len", &self.len())
            .field("crc32", &format_args!("{:08x}", self.checksum()))
            .finish()
    }
}

/// A compression stage
pub trait Compressor: Transformer + fmt::Debug + Send + Sync {
    fn compress(&self, data: &[u8], dictionary: Option<&Dictionary>) -> CacheResult<Vec<u8>>;

    fn decompress(&self, data: &[u8], dictionary: Option<&Dictionary>) -> CacheResult<Vec<u8>>;

    fn supports_dictionary(&self) -> bool {
        false
    }

    /// Build a dictionary of at most `max_size` bytes from raw samples
    fn train_dictionary(&self, _samples: &[Vec<u8>], _max_size: usize) -> CacheResult<Dictionary> {
        Err(CacheError::DictionaryUnsupported(self.name().to_string()))
    }
}

/// Compressor providers known to this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressorKind {
    Zstd,
    Lz4,
    Deflate,
    None,
}

impl CompressorKind {
    pub const ALL: &'static [CompressorKind] = &[
        CompressorKind::Zstd,
        CompressorKind::Lz4,
        CompressorKind::Deflate,
        CompressorKind::None,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CompressorKind::Zstd => "zstd",
            CompressorKind::Lz4 => "lz4",
            CompressorKind::Deflate => "deflate",
            CompressorKind::None => "none",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }

    pub fn is_compiled(&self) -> bool {
        match self {
            CompressorKind::Zstd => cfg!(feature = "zstd"),
            CompressorKind::Lz4 => cfg!(feature = "lz4"),
            CompressorKind::Deflate => cfg!(feature = "deflate"),
            CompressorKind::None => true,
        }
    }

    pub fn supports_dictionary(&self) -> bool {
        matches!(self, CompressorKind::Zstd | CompressorKind::Lz4)
    }

    pub fn supports_training(&self) -> bool {
        self.supports_dictionary()
    }

    /// Build the provider, failing if it is not compiled in
    pub fn instantiate(&self, level: Option<i32>) -> CacheResult<Arc<dyn Compressor>> {
        match self {
            #[cfg(feature = "zstd")]
            CompressorKind::Zstd => Ok(Arc::new(ZstdCompressor::new(level))),
            #[cfg(feature = "lz4")]
            CompressorKind::Lz4 => Ok(Arc::new(Lz4Compressor)),
            #[cfg(feature = "deflate")]
            CompressorKind::Deflate => Ok(Arc::new(DeflateCompressor::new(level))),
            CompressorKind::None => Ok(Arc::new(NoCompression)),
            #[allow(unreachable_patterns)]
            other => Err(CacheError::Configuration(format!(
                "compressor `{}` is not compiled in (level {:?})",
                other.name(),
                level
            ))),
        }
    }
}

impl fmt::Display for CompressorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn compression_error(provider: &str, err: impl fmt::Display) -> CacheError {
    CacheError::Compression(format!("{}: {}", provider, err))
}

/// Enough samples, enough bytes
fn check_sample(samples: &[Vec<u8>]) -> CacheResult<usize> {
    let total: usize = samples.iter().map(Vec::len).sum();
    if samples.len() < MIN_TRAINING_SAMPLES {
        return Err(CacheError::DictionaryTraining(format!(
            "need at least {} samples, got {}",
            MIN_TRAINING_SAMPLES,
            samples.len()
        )));
    }
    if total < MIN_TRAINING_BYTES {
        return Err(CacheError::DictionaryTraining(format!(
            "need at least {} sample bytes, got {}",
            MIN_TRAINING_BYTES, total
        )));
    }
    Ok(total)
}

/// Prepared dictionaries kept per compressor; recompression needs two
#[cfg(feature = "zstd")]
const PREPARED_SLOTS: usize = 2;

/// zstd frames; dictionaries are prepared once and reused while unchanged
#[cfg(feature = "zstd")]
pub struct ZstdCompressor {
    level: i32,
    prepared: Mutex<Vec<PreparedZstd>>,
}

#[cfg(feature = "zstd")]
struct PreparedZstd {
    checksum: u32,
    len: usize,
    encoder: zstd::dict::EncoderDictionary<'static>,
    decoder: zstd::dict::DecoderDictionary<'static>,
}

#[cfg(feature = "zstd")]
impl PreparedZstd {
    fn new(dict: &Dictionary, level: i32) -> Self {
        Self {
            checksum: dict.checksum(),
            len: dict.len(),
            encoder: zstd::dict::EncoderDictionary::copy(dict.as_bytes(), level),
            decoder: zstd::dict::DecoderDictionary::copy(dict.as_bytes()),
        }
    }

    fn matches(&self, dict: &Dictionary) -> bool {
        self.len == dict.len() && self.checksum == dict.checksum()
    }
}

#[cfg(feature = "zstd")]
impl ZstdCompressor {
    pub const DEFAULT_LEVEL: i32 = 3;

    pub fn new(level: Option<i32>) -> Self {
        let level = level.unwrap_or(Self::DEFAULT_LEVEL);
        Self {
            level: level.clamp(1, 22),
            prepared: Mutex::new(Vec::with_capacity(PREPARED_SLOTS)),
        }
    }

    fn with_prepared<T>(
        &self,
        dict: &Dictionary,
        f: impl FnOnce(&PreparedZstd) -> std::io::Result<T>,
    ) -> CacheResult<T> {
        let mut cache = self
            .prepared
            .lock()
            .map_err(|_| CacheError::Compression("zstd: dictionary cache poisoned".to_string()))?;
        let index = match cache.iter().position(|p| p.matches(dict)) {
            Some(index) => index,
            None => {
                if cache.len() >= PREPARED_SLOTS {
                    cache.remove(0);
                }
                cache.push(PreparedZstd::new(dict, self.level));
                cache.len() - 1
            }
        };
        f(&cache[index]).map_err(|e| compression_error("zstd", e))
    }
}

#[cfg(feature = "zstd")]
impl fmt::Debug for ZstdCompressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZstdCompressor")
            .field("level", &self.level)
            .finish()
    }
}

#[cfg(feature = "zstd")]
impl Transformer for ZstdCompressor {
    fn name(&self) -> &'static str {
        CompressorKind::Zstd.name()
    }

    fn stage_kind(&self) -> StageKind {
        StageKind::Compressor
    }

    fn is_available(&self) -> bool {
        true
    }
}

#[cfg(feature = "zstd")]
impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8], dictionary: Option<&Dictionary>) -> CacheResult<Vec<u8>> {
        match dictionary {
            Some(dict) => self.with_prepared(dict, |prepared| {
                zstd::bulk::Compressor::with_prepared_dictionary(&prepared.encoder)?.compress(data)
            }),
            None => zstd::bulk::compress(data, self.level).map_err(|e| compression_error("zstd", e)),
        }
    }

    fn decompress(&self, data: &[u8], dictionary: Option<&Dictionary>) -> CacheResult<Vec<u8>> {
        use std::io::Read;

        match dictionary {
            Some(dict) => self.with_prepared(dict, |prepared| {
                let mut decoder =
                    zstd::stream::read::Decoder::with_prepared_dictionary(data, &prepared.decoder)?;
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }),
            None => zstd::stream::decode_all(data).map_err(|e| compression_error("zstd", e)),
        }
    }

    fn supports_dictionary(&self) -> bool {
        true
    }

    fn train_dictionary(&self, samples: &[Vec<u8>], max_size: usize) -> CacheResult<Dictionary> {
        let total = check_sample(samples)?;
        let max_size = max_size.clamp(MIN_DICTIONARY_SIZE, MAX_DICTIONARY_SIZE);
        let bytes = zstd::dict::from_samples(samples, max_size).map_err(|e| {
            CacheError::DictionaryTraining(format!(
                "zstd could not train on {} samples ({} bytes): {}",
                samples.len(),
                total,
                e
            ))
        })?;
        if bytes.is_empty() {
            return Err(CacheError::DictionaryTraining(
                "zstd produced an empty dictionary".to_string(),
            ));
        }
        Ok(Dictionary::new(bytes))
    }
}

/// lz4 block compression with the size prepended
///
/// Dictionaries are raw content: the compressor may reference any of the
/// last 64 KiB of the dictionary, so "training" keeps the most recent sample
/// bytes.
#[cfg(feature = "lz4")]
#[derive(Debug, Clone, Copy)]
pub struct Lz4Compressor;

#[cfg(feature = "lz4")]
impl Transformer for Lz4Compressor {
    fn name(&self) -> &'static str {
        CompressorKind::Lz4.name()
    }

    fn stage_kind(&self) -> StageKind {
        StageKind::Compressor
    }

    fn is_available(&self) -> bool {
        true
    }
}

#[cfg(feature = "lz4")]
impl Compressor for Lz4Compressor {
    fn compress(&self, data: &[u8], dictionary: Option<&Dictionary>) -> CacheResult<Vec<u8>> {
        Ok(match dictionary {
            Some(dict) => lz4_flex::block::compress_prepend_size_with_dict(data, dict.as_bytes()),
            None => lz4_flex::compress_prepend_size(data),
        })
    }

    fn decompress(&self, data: &[u8], dictionary: Option<&Dictionary>) -> CacheResult<Vec<u8>> {
        match dictionary {
            Some(dict) => {
                lz4_flex::block::decompress_size_prepended_with_dict(data, dict.as_bytes())
            }
            None => lz4_flex::decompress_size_prepended(data),
        }
        .map_err(|e| compression_error("lz4", e))
    }

    fn supports_dictionary(&self) -> bool {
        true
    }

    fn train_dictionary(&self, samples: &[Vec<u8>], max_size: usize) -> CacheResult<Dictionary> {
        check_sample(samples)?;
        let max_size = max_size.clamp(MIN_DICTIONARY_SIZE, LZ4_WINDOW);

        let mut bytes: Vec<u8> = Vec::with_capacity(max_size);
        for sample in samples.iter().rev() {
            if bytes.len() >= max_size {
                break;
            }
            let room = max_size - bytes.len();
            let take = sample.len().min(room);
            // samples are walked newest first; keep their tail, prepend
            let mut chunk = sample[sample.len() - take..].to_vec();
            chunk.extend_from_slice(&bytes);
            bytes = chunk;
        }
        Ok(Dictionary::new(bytes))
    }
}

/// Raw deflate stream, no dictionary support
#[cfg(feature = "deflate")]
#[derive(Debug, Clone, Copy)]
pub struct DeflateCompressor {
    level: u32,
}

#[cfg(feature = "deflate")]
impl DeflateCompressor {
    pub const DEFAULT_LEVEL: u32 = 6;

    pub fn new(level: Option<i32>) -> Self {
        let level = level
            .map(|l| l.clamp(0, 9) as u32)
            .unwrap_or(Self::DEFAULT_LEVEL);
        Self { level }
    }
}

#[cfg(feature = "deflate")]
impl Transformer for DeflateCompressor {
    fn name(&self) -> &'static str {
        CompressorKind::Deflate.name()
    }

    fn stage_kind(&self) -> StageKind {
        StageKind::Compressor
    }

    fn is_available(&self) -> bool {
        true
    }
}

#[cfg(feature = "deflate")]
impl Compressor for DeflateCompressor {
    fn compress(&self, data: &[u8], dictionary: Option<&Dictionary>) -> CacheResult<Vec<u8>> {
        use flate2::write::DeflateEncoder;
        use flate2::Compression;
        use std::io::Write;

        if dictionary.is_some() {
            return Err(CacheError::DictionaryUnsupported(self.name().to_string()));
        }
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(self.level));
        encoder
            .write_all(data)
            .map_err(|e| compression_error("deflate", e))?;
        encoder.finish().map_err(|e| compression_error("deflate", e))
    }

    fn decompress(&self, data: &[u8], dictionary: Option<&Dictionary>) -> CacheResult<Vec<u8>> {
        use flate2::read::DeflateDecoder;
        use std::io::Read;

        if dictionary.is_some() {
            return Err(CacheError::DictionaryUnsupported(self.name().to_string()));
        }
        let mut out = Vec::new();
        DeflateDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| compression_error("deflate", e))?;
        Ok(out)
    }
}

/// Identity stage
#[derive(Debug, Clone, Copy)]
pub struct NoCompression;

impl Transformer for NoCompression {
    fn name(&self) -> &'static str {
        CompressorKind::None.name()
    }

    fn stage_kind(&self) -> StageKind {
        StageKind::Compressor
    }

    fn is_available(&self) -> bool {
        true
    }
}

impl Compressor for NoCompression {
    fn compress(&self, data: &[u8], dictionary: Option<&Dictionary>) -> CacheResult<Vec<u8>> {
        if dictionary.is_some() {
            return Err(CacheError::DictionaryUnsupported(self.name().to_string()));
        }
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], dictionary: Option<&Dictionary>) -> CacheResult<Vec<u8>> {
        if dictionary.is_some() {
            return Err(CacheError::DictionaryUnsupported(self.name().to_string()));
        }
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(n: usize) -> Vec<Vec<u8>> {
        (0..n)
            .map(|i| {
                format!(
                    r#"{{"id":{},"name":"user-{}","email":"user{}@example.com","active":{},"roles":["reader","writer"],"country":"NZ"}}"#,
                    i,
                    i,
                    i,
                    i % 2 == 0
                )
                .into_bytes()
            })
            .collect()
    }

    fn compiled() -> Vec<Arc<dyn Compressor>> {
        CompressorKind::ALL
            .iter()
            .filter(|k| k.is_compiled())
            .map(|k| k.instantiate(None).unwrap())
            .collect()
    }

    #[test]
    fn test_every_compiled_compressor_round_trips() {
        let data = b"hello hello hello hello hello hello hello world".repeat(20);
        for compressor in compiled() {
            let packed = compressor.compress(&data, None).unwrap();
            let unpacked = compressor.decompress(&packed, None).unwrap();
            assert_eq!(unpacked, data, "compressor {}", compressor.name());
        }
    }

    #[test]
    fn test_empty_input() {
        for compressor in compiled() {
            let packed = compressor.compress(&[], None).unwrap();
            assert!(compressor.decompress(&packed, None).unwrap().is_empty());
        }
    }

    #[test]
    fn test_default_dictionary_size_is_clamped() {
        assert_eq!(default_dictionary_size(0), MIN_DICTIONARY_SIZE);
        assert_eq!(default_dictionary_size(100_000), 10_000);
        assert_eq!(default_dictionary_size(usize::MAX), MAX_DICTIONARY_SIZE);
    }

    #[test]
    fn test_training_rejects_tiny_samples() {
        for compressor in compiled().into_iter().filter(|c| c.supports_dictionary()) {
            let err = compressor.train_dictionary(&records(3), 4096).unwrap_err();
            assert!(matches!(err, CacheError::DictionaryTraining(_)));
        }
    }

    #[test]
    fn test_no_compression_has_no_dictionary() {
        let err = NoCompression
            .train_dictionary(&records(100), 1024)
            .unwrap_err();
        assert!(matches!(err, CacheError::DictionaryUnsupported(_)));

        let dict = Dictionary::new(vec![1, 2, 3]);
        assert!(NoCompression.compress(b"abc", Some(&dict)).is_err());
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn test_zstd_dictionary_shrinks_small_records() {
        let zstd = ZstdCompressor::new(None);
        let samples = records(2_000);
        let dict = zstd.train_dictionary(&samples, 8 * 1024).unwrap();
        assert!(!dict.is_empty());
        assert!(dict.len() <= 8 * 1024);

        let record = &samples[1234];
        let plain = zstd.compress(record, None).unwrap();
        let with_dict = zstd.compress(record, Some(&dict)).unwrap();
        assert!(with_dict.len() < plain.len());
        assert_eq!(zstd.decompress(&with_dict, Some(&dict)).unwrap(), *record);
    }

    #[cfg(feature = "lz4")]
    #[test]
    fn test_lz4_dictionary_keeps_latest_bytes() {
        let samples = records(50);
        let dict = Lz4Compressor.train_dictionary(&samples, 512).unwrap();
        assert_eq!(dict.len(), 512);
        assert!(dict.as_bytes().ends_with(samples.last().unwrap()));

        let record = &samples[7];
        let packed = Lz4Compressor.compress(record, Some(&dict)).unwrap();
        assert!(packed.len() < Lz4Compressor.compress(record, None).unwrap().len());
        assert_eq!(
            Lz4Compressor.decompress(&packed, Some(&dict)).unwrap(),
            *record
        );
    }

    #[cfg(feature = "deflate")]
    #[test]
    fn test_deflate_refuses_dictionary() {
        let deflate = DeflateCompressor::new(Some(9));
        assert!(!deflate.supports_dictionary());
        let err = deflate
            .compress(b"data", Some(&Dictionary::new(vec![0u8; 16])))
            .unwrap_err();
        assert!(matches!(err, CacheError::DictionaryUnsupported(_)));
    }

    #[test]
    fn test_unknown_names() {
        assert_eq!(CompressorKind::from_name("zstd"), Some(CompressorKind::Zstd));
        assert_eq!(CompressorKind::from_name("lzma"), None);
    }
}

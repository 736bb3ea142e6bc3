//! Dictionary training and recompression
//!
//! ```text
//! sample rows of chain X ──▶ train D ──▶ rewrite rows of X with D ──▶ store D
//!                                         │
//!                     server-side:  one engine-driven UPDATE + dictionary
//!                                   write, one transaction
//!                     fallback:     iterate, then one atomic batch carrying
//!                                   every row and the dictionary
//! ```
//!
//! Either way a run is all-or-nothing: every row of the chain ends up under
//! the old dictionary or every row under the new one.

use crate::backend::{Backend, BatchOp, Key, Row, RowTransform, TableName};
use crate::cache::metadata;
use crate::error::{CacheError, CacheResult};
use crate::transform::{default_dictionary_size, Chain, ChainId, Dictionary};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Upper bound on rows fed to the trainer
pub const MAX_TRAINING_SAMPLES: usize = 20_000;

/// Outcome of one recompression run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecompressionReport {
    pub chain_id: ChainId,
    pub rows_rewritten: u64,
    /// Stored bytes of the rewritten rows, before and after
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub dictionary_size: usize,
    /// Rewritten inside the engine rather than iterate-then-write
    pub server_side: bool,
}

impl RecompressionReport {
    fn unchanged(chain_id: ChainId, dictionary_size: usize) -> Self {
        Self {
            chain_id,
            rows_rewritten: 0,
            bytes_before: 0,
            bytes_after: 0,
            dictionary_size,
            server_side: false,
        }
    }

    /// `bytes_after / bytes_before`, 1.0 when nothing was rewritten
    pub fn ratio(&self) -> f64 {
        if self.bytes_before == 0 {
            1.0
        } else {
            self.bytes_after as f64 / self.bytes_before as f64
        }
    }
}

impl fmt::Display for RecompressionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chain {}: {} rows, {} -> {} bytes ({:.1}%), dictionary {} bytes{}",
            self.chain_id,
            self.rows_rewritten,
            self.bytes_before,
            self.bytes_after,
            self.ratio() * 100.0,
            self.dictionary_size,
            if self.server_side { ", server-side" } else { "" }
        )
    }
}

/// Decompressed sample of the rows stored under `chain`
///
/// Rows are taken at an even stride so the sample spans the whole table.
pub fn sample_rows(backend: &dyn Backend, chain: &Chain) -> CacheResult<Vec<Vec<u8>>> {
    let mut total = 0usize;
    for entry in backend.iter_all(TableName::Data) {
        let (_, row) = entry?;
        if row.chain_id == Some(chain.id()) {
            total += 1;
        }
    }
    let stride = total.div_ceil(MAX_TRAINING_SAMPLES).max(1);

    let mut samples = Vec::with_capacity(total.min(MAX_TRAINING_SAMPLES));
    let mut seen = 0usize;
    for entry in backend.iter_all(TableName::Data) {
        let (_, row) = entry?;
        if row.chain_id != Some(chain.id()) {
            continue;
        }
        if seen % stride == 0 {
            samples.push(chain.decompress(&row.value)?);
        }
        seen += 1;
    }
    Ok(samples)
}

/// Train a dictionary for `chain` from its stored rows
pub fn train(
    backend: &dyn Backend,
    chain: &Chain,
    dict_size: Option<usize>,
) -> CacheResult<Dictionary> {
    if !chain.supports_dictionary() {
        return Err(CacheError::DictionaryUnsupported(
            chain.compressor().name().to_string(),
        ));
    }
    let samples = sample_rows(backend, chain)?;
    let sample_bytes: usize = samples.iter().map(Vec::len).sum();
    let size = dict_size.unwrap_or_else(|| default_dictionary_size(sample_bytes));
    tracing::debug!(
        "Training {} dictionary for chain {} from {} samples ({} bytes), target {} bytes",
        chain.compressor().name(),
        chain.id(),
        samples.len(),
        sample_bytes,
        size
    );
    chain.compressor().train_dictionary(&samples, size)
}

/// Rewrite every row of `current`'s chain under `target`'s dictionary
///
/// `current` and `target` must share a chain id. Pending writes are
/// committed before the run starts.
pub fn recompress(
    backend: &mut dyn Backend,
    current: &Chain,
    target: &Chain,
    server_side: bool,
) -> CacheResult<RecompressionReport> {
    if current.id() != target.id() {
        return Err(CacheError::Configuration(format!(
            "cannot recompress chain {} into chain {}",
            current.id(),
            target.id()
        )));
    }
    let Some(dictionary) = target.dictionary() else {
        return Err(CacheError::Configuration(format!(
            "recompression of chain {} needs a dictionary",
            target.id()
        )));
    };
    if current.dictionary() == Some(dictionary) {
        tracing::info!("Chain {} already uses this dictionary", target.id());
        return Ok(RecompressionReport::unchanged(target.id(), dictionary.len()));
    }

    backend.commit()?;
    let start = Instant::now();
    tracing::info!(
        "Recompressing chain {} with a {} byte dictionary ({})",
        target.id(),
        dictionary.len(),
        if server_side { "server-side" } else { "iterate and write" }
    );

    let report = if server_side {
        recompress_server_side(backend, current, target, dictionary)?
    } else {
        recompress_batch(backend, current, target, dictionary)?
    };

    tracing::info!("Recompressed {} in {:?}", report, start.elapsed());
    Ok(report)
}

fn recompress_server_side(
    backend: &mut dyn Backend,
    current: &Chain,
    target: &Chain,
    dictionary: &Dictionary,
) -> CacheResult<RecompressionReport> {
    let before = Arc::new(AtomicU64::new(0));
    let after = Arc::new(AtomicU64::new(0));

    let transform: RowTransform = {
        let current = current.clone();
        let target = target.clone();
        let before = Arc::clone(&before);
        let after = Arc::clone(&after);
        Box::new(move |_key: &Key, value: &[u8]| -> CacheResult<Vec<u8>> {
            let raw = current.decompress(value)?;
            let packed = target.compress(&raw)?;
            before.fetch_add(value.len() as u64, Ordering::Relaxed);
            after.fetch_add(packed.len() as u64, Ordering::Relaxed);
            Ok(packed)
        })
    };

    backend.begin_transaction()?;
    let rows = match transform_and_store(backend, target.id(), transform, dictionary)
        .and_then(|rows| backend.commit().map(|_| rows))
    {
        Ok(rows) => rows,
        Err(e) => {
            if let Err(rollback) = backend.rollback() {
                tracing::warn!("Rollback after failed recompression failed: {}", rollback);
            }
            return Err(e);
        }
    };

    Ok(RecompressionReport {
        chain_id: target.id(),
        rows_rewritten: rows,
        bytes_before: before.load(Ordering::Relaxed),
        bytes_after: after.load(Ordering::Relaxed),
        dictionary_size: dictionary.len(),
        server_side: true,
    })
}

fn transform_and_store(
    backend: &mut dyn Backend,
    chain_id: ChainId,
    transform: RowTransform,
    dictionary: &Dictionary,
) -> CacheResult<u64> {
    let rows = backend.apply_row_transform(TableName::Data, chain_id, transform)?;
    metadata::store_dictionary(backend, chain_id, dictionary)?;
    Ok(rows)
}

fn recompress_batch(
    backend: &mut dyn Backend,
    current: &Chain,
    target: &Chain,
    dictionary: &Dictionary,
) -> CacheResult<RecompressionReport> {
    let mut ops = Vec::new();
    let mut bytes_before = 0u64;
    let mut bytes_after = 0u64;

    for entry in backend.iter_all(TableName::Data) {
        let (key, row) = entry?;
        if row.chain_id != Some(target.id()) {
            continue;
        }
        let packed = target.compress(&current.decompress(&row.value)?)?;
        bytes_before += row.value.len() as u64;
        bytes_after += packed.len() as u64;
        ops.push(BatchOp::Put {
            table: TableName::Data,
            key,
            row: Row::new(Some(target.id()), packed),
        });
    }

    let rows = ops.len() as u64;
    ops.push(metadata::dictionary_op(target.id(), Some(dictionary)));
    backend.write_batch(ops)?;
    backend.commit()?;

    Ok(RecompressionReport {
        chain_id: target.id(),
        rows_rewritten: rows,
        bytes_before,
        bytes_after,
        dictionary_size: dictionary.len(),
        server_side: false,
    })
}

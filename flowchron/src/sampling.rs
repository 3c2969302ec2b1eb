//! Sampling stage
//!
//! Materializes sampled pattern occurrences into synthetic flows. The
//! occurrence list is chunked with the planner and each chunk is sampled on
//! its own worker; occurrence `i` of chunk `k` has global position
//! `k * chunk_size + i`, which selects its identifier from the parallel id
//! array and seeds its flow sampler.

use crate::dataset::format_timestamp;
use crate::dispatcher::Dispatcher;
use crate::error::{PipelineError, Result};
use crate::planner::{split, Chunk, WorkerBudget};
use crate::types::{DatasetMetadata, FlowRecord, FlowSampler, Pattern, PatternId, SampledPatterns};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Column holding the generating pattern of each synthetic flow
pub const PATTERN_ID_COLUMN: &str = "pattern_idx";

/// Occurrences to materialize, with optional identifiers (same length)
#[derive(Debug, Clone, Default)]
pub struct PatternOccurrences {
    pub patterns: Vec<Pattern>,
    pub ids: Option<Vec<PatternId>>,
}

impl From<SampledPatterns> for PatternOccurrences {
    fn from(sampled: SampledPatterns) -> Self {
        Self {
            patterns: sampled.patterns,
            ids: Some(sampled.ids),
        }
    }
}

/// Synthetic flows sorted by first-seen time
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticFlowTable {
    time_column: String,
    columns: Vec<String>,
    records: Vec<FlowRecord>,
}

impl SyntheticFlowTable {
    /// Concatenate per-chunk tables in chunk order and sort stably by time
    pub fn from_chunks(metadata: &DatasetMetadata, chunks: Vec<Vec<FlowRecord>>) -> Self {
        let mut records = Vec::with_capacity(chunks.iter().map(Vec::len).sum());
        for chunk in chunks {
            records.extend(chunk);
        }
        records.sort_by_key(|r| r.first_seen);

        Self {
            time_column: metadata.time_column.clone(),
            columns: metadata.columns.clone(),
            records,
        }
    }

    pub fn records(&self) -> &[FlowRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn has_pattern_ids(&self) -> bool {
        self.records.iter().any(|r| r.pattern_id.is_some())
    }

    /// Time column first, then the dataset columns, then `pattern_idx`
    pub fn header(&self) -> Vec<&str> {
        let mut header = Vec::with_capacity(self.columns.len() + 2);
        header.push(self.time_column.as_str());
        header.extend(self.columns.iter().map(String::as_str));
        if self.has_pattern_ids() {
            header.push(PATTERN_ID_COLUMN);
        }
        header
    }

    pub fn write_to<W: Write>(&self, writer: W) -> Result<()> {
        let with_ids = self.has_pattern_ids();
        let mut out = csv::Writer::from_writer(writer);
        out.write_record(self.header())?;

        for record in &self.records {
            let mut row = Vec::with_capacity(record.values.len() + 2);
            row.push(format_timestamp(&record.first_seen));
            row.extend(record.values.iter().cloned());
            if with_ids {
                row.push(
                    record
                        .pattern_id
                        .as_ref()
                        .map(|id| id.to_string())
                        .unwrap_or_default(),
                );
            }
            out.write_record(&row)?;
        }

        out.flush()?;
        Ok(())
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.write_to(std::fs::File::create(path)?)?;
        info!(path = %path.display(), flows = self.records.len(), "Wrote synthetic flows");
        Ok(())
    }
}

/// Sample flows for every occurrence in parallel
pub async fn generate<S: FlowSampler>(
    occurrences: PatternOccurrences,
    metadata: Arc<DatasetMetadata>,
    sampler: Arc<S>,
    dispatcher: &Dispatcher,
) -> Result<SyntheticFlowTable> {
    let PatternOccurrences { patterns, ids } = occurrences;
    if let Some(ids) = &ids {
        if ids.len() != patterns.len() {
            return Err(PipelineError::Sampler(format!(
                "{} identifiers for {} occurrences",
                ids.len(),
                patterns.len()
            )));
        }
    }

    let budget = WorkerBudget::new(dispatcher.max_workers())?;
    let (plan, chunks) = split(patterns, budget);
    let chunk_size = plan.chunk_size();
    info!(
        occurrences = plan.total_items(),
        chunks = plan.len(),
        chunk_size,
        "Sampling flows"
    );

    let ids = ids.map(Arc::new);
    let worker_metadata = Arc::clone(&metadata);
    let outcome = dispatcher
        .dispatch(chunks, move |chunk: Chunk<Pattern>| {
            sample_chunk(
                chunk,
                chunk_size,
                &worker_metadata,
                sampler.as_ref(),
                ids.as_deref().map(Vec::as_slice),
            )
        })
        .await?;

    let tables = outcome.into_ordered()?;
    Ok(SyntheticFlowTable::from_chunks(&metadata, tables))
}

fn sample_chunk<S: FlowSampler>(
    chunk: Chunk<Pattern>,
    chunk_size: usize,
    metadata: &DatasetMetadata,
    sampler: &S,
    ids: Option<&[PatternId]>,
) -> Result<Vec<FlowRecord>> {
    let mut flows = Vec::new();
    for (i, pattern) in chunk.items.iter().enumerate() {
        let position = chunk.index * chunk_size + i;
        let id = match ids {
            Some(ids) => Some(ids.get(position).cloned().ok_or_else(|| {
                PipelineError::OrderingViolation(format!(
                    "occurrence position {} outside {} identifiers",
                    position,
                    ids.len()
                ))
            })?),
            None => None,
        };

        for mut record in sampler.sample_flows(pattern, metadata, position)? {
            if record.values.len() != metadata.columns.len() {
                return Err(PipelineError::Sampler(format!(
                    "pattern {} produced {} values, expected {}",
                    pattern.id,
                    record.values.len(),
                    metadata.columns.len()
                )));
            }
            record.pattern_id = id.clone();
            flows.push(record);
        }
    }
    debug!(chunk_index = chunk.index, occurrences = chunk.len(), flows = flows.len(), "Sampled chunk");
    Ok(flows)
}

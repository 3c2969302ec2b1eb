//! Flow dataset loading
//!
//! Reads a flow CSV (CIDDS layout), parses the temporal key and infers the
//! schema the sampling stage needs: categorical value domains, a binned
//! representation of numeric columns and the timestamp domain.

use crate::error::{PipelineError, Result};
use crate::types::{ContinuousRepr, DatasetMetadata, FlowRecord, TimeDomain};
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Temporal key column of CIDDS exports
pub const DEFAULT_TIME_COLUMN: &str = "Date first seen";

const TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// Millisecond precision, the precision of CIDDS timestamps
pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// Flows plus the schema of the whole dataset
#[derive(Debug, Clone)]
pub struct FlowDataset {
    metadata: Arc<DatasetMetadata>,
    records: Vec<FlowRecord>,
}

impl FlowDataset {
    pub fn load_csv(path: &Path, time_column: &str, continuous_bins: usize) -> Result<Self> {
        info!(path = %path.display(), "Loading flow dataset");
        let file = std::fs::File::open(path).map_err(|e| {
            PipelineError::Dataset(format!("cannot open {}: {}", path.display(), e))
        })?;
        Self::from_reader(file, time_column, continuous_bins)
    }

    pub fn from_reader<R: Read>(reader: R, time_column: &str, continuous_bins: usize) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = csv_reader.headers()?.clone();
        let time_index = headers.iter().position(|h| h == time_column).ok_or_else(|| {
            PipelineError::Dataset(format!("missing time column '{}'", time_column))
        })?;
        let columns: Vec<String> = headers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != time_index)
            .map(|(_, h)| h.to_string())
            .collect();

        let mut records = Vec::new();
        for (row, line) in csv_reader.records().enumerate() {
            let line = line?;
            let raw_ts = line.get(time_index).unwrap_or_default();
            let first_seen = parse_timestamp(raw_ts).ok_or_else(|| {
                PipelineError::Dataset(format!("row {}: unparseable timestamp '{}'", row + 1, raw_ts))
            })?;
            let values = line
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != time_index)
                .map(|(_, v)| v.to_string())
                .collect();
            records.push(FlowRecord {
                first_seen,
                values,
                pattern_id: None,
            });
        }

        Self::from_records(time_column, columns, records, continuous_bins)
    }

    /// Build a dataset from parsed records, inferring the schema
    pub fn from_records(
        time_column: &str,
        columns: Vec<String>,
        records: Vec<FlowRecord>,
        continuous_bins: usize,
    ) -> Result<Self> {
        let metadata = infer_metadata(time_column, columns, &records, continuous_bins)?;
        info!(
            flows = records.len(),
            columns = metadata.columns.len(),
            categorical = metadata.value_domains.len(),
            continuous = metadata.continuous.len(),
            "Dataset ready"
        );
        Ok(Self {
            metadata: Arc::new(metadata),
            records,
        })
    }

    pub fn metadata(&self) -> &Arc<DatasetMetadata> {
        &self.metadata
    }

    pub fn records(&self) -> &[FlowRecord] {
        &self.records
    }

    /// Hand the records over without copying them
    pub fn into_parts(self) -> (Arc<DatasetMetadata>, Vec<FlowRecord>) {
        (self.metadata, self.records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn infer_metadata(
    time_column: &str,
    columns: Vec<String>,
    records: &[FlowRecord],
    continuous_bins: usize,
) -> Result<DatasetMetadata> {
    let (Some(start), Some(end)) = (
        records.iter().map(|r| r.first_seen).min(),
        records.iter().map(|r| r.first_seen).max(),
    ) else {
        return Err(PipelineError::Dataset("dataset has no flows".to_string()));
    };

    if let Some((row, record)) = records
        .iter()
        .enumerate()
        .find(|(_, r)| r.values.len() != columns.len())
    {
        return Err(PipelineError::Dataset(format!(
            "row {} has {} values, expected {}",
            row + 1,
            record.values.len(),
            columns.len()
        )));
    }

    let bins = continuous_bins.max(1);
    let mut value_domains = BTreeMap::new();
    let mut continuous = BTreeMap::new();

    for (index, column) in columns.iter().enumerate() {
        let distinct: BTreeSet<&str> = records.iter().map(|r| r.values[index].as_str()).collect();
        let numeric: Option<Vec<f64>> = distinct.iter().map(|v| v.parse::<f64>().ok()).collect();

        match numeric {
            Some(values) if distinct.len() > bins => {
                let repr = bin_edges(&values, bins);
                debug!(column = %column, bins, "Continuous column");
                continuous.insert(column.clone(), repr);
            }
            _ => {
                debug!(column = %column, values = distinct.len(), "Categorical column");
                value_domains.insert(
                    column.clone(),
                    distinct.into_iter().map(str::to_string).collect(),
                );
            }
        }
    }

    Ok(DatasetMetadata {
        time_column: time_column.to_string(),
        columns,
        value_domains,
        continuous,
        time_domain: TimeDomain { start, end },
    })
}

fn bin_edges(values: &[f64], bins: usize) -> ContinuousRepr {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let width = (max - min) / bins as f64;
    let edges = (0..=bins)
        .map(|i| if i == bins { max } else { min + width * i as f64 })
        .collect();
    ContinuousRepr {
        edges,
        integral: values.iter().all(|v| v.fract() == 0.0),
    }
}

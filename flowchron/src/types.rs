//! Domain types and collaborator traits
//!
//! The pipeline only schedules work; pattern search, pattern sampling and
//! flow sampling are supplied through the traits below.

use crate::error::Result;
use crate::model::PatternCatalog;
use chrono::NaiveDateTime;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable identifier of a pattern
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatternId(String);

impl PatternId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PatternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PatternId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Pattern identifier → number of occurrences
pub type PatternUsage = BTreeMap<PatternId, u64>;

/// One flow of a pattern: columns it fixes to a value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowTemplate {
    pub fixed: BTreeMap<String, String>,
}

/// Empirical distribution of gaps (seconds) between consecutive flows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemporalSampler {
    gaps_secs: Vec<f64>,
}

impl TemporalSampler {
    pub fn from_gaps(mut gaps_secs: Vec<f64>) -> Self {
        gaps_secs.retain(|g| g.is_finite() && *g >= 0.0);
        gaps_secs.sort_by(|a, b| a.total_cmp(b));
        Self { gaps_secs }
    }

    pub fn observations(&self) -> usize {
        self.gaps_secs.len()
    }

    /// Draw one gap; 0.0 when nothing was observed
    pub fn sample_gap<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        if self.gaps_secs.is_empty() {
            return 0.0;
        }
        self.gaps_secs[rng.gen_range(0..self.gaps_secs.len())]
    }
}

/// Structural definition of a mined pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: PatternId,
    pub flows: Vec<FlowTemplate>,
    /// Fitted by `CompositeModel::fit_temporal_samplers`
    #[serde(default)]
    pub timing: Option<TemporalSampler>,
}

/// Observed time span of the dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeDomain {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

/// Bin edges of a numeric column, ascending, `bins + 1` entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousRepr {
    pub edges: Vec<f64>,
    /// Every observed value was a whole number
    pub integral: bool,
}

/// Schema of the full (unchunked) dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub time_column: String,
    /// Non-temporal columns in input order; `FlowRecord::values` follows it
    pub columns: Vec<String>,
    /// Categorical columns → distinct values
    pub value_domains: BTreeMap<String, Vec<String>>,
    /// Numeric columns → bin representation
    pub continuous: BTreeMap<String, ContinuousRepr>,
    pub time_domain: TimeDomain,
}

impl DatasetMetadata {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// One network flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub first_seen: NaiveDateTime,
    pub values: Vec<String>,
    /// Pattern that generated the flow (synthetic flows only)
    #[serde(default)]
    pub pattern_id: Option<PatternId>,
}

/// A model trained on one chunk
pub trait SubModel: Send + Sync + 'static {
    fn pattern_usage(&self) -> PatternUsage;

    fn pattern(&self, id: &PatternId) -> Option<&Pattern>;

    /// Gaps (seconds) between consecutive flows attributed to `id`
    fn inter_flow_gaps(&self, id: &PatternId) -> Vec<f64>;
}

/// Trains one sub-model from one chunk of flows
pub trait PatternSearch: Send + Sync + 'static {
    type Model: SubModel;

    fn search(
        &self,
        records: &[FlowRecord],
        metadata: &DatasetMetadata,
        model_name: &str,
    ) -> Result<Self::Model>;
}

/// Output of a pattern sampler: two parallel arrays of equal length
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampledPatterns {
    pub ids: Vec<PatternId>,
    pub patterns: Vec<Pattern>,
}

/// Draws pattern occurrences in proportion to usage
pub trait PatternSampler {
    fn sample(&self, catalog: &PatternCatalog, total: usize) -> Result<SampledPatterns>;
}

/// Materializes one pattern occurrence into flow records
///
/// `position` is the occurrence's global index in the occurrence list.
pub trait FlowSampler: Send + Sync + 'static {
    fn sample_flows(
        &self,
        pattern: &Pattern,
        metadata: &DatasetMetadata,
        position: usize,
    ) -> Result<Vec<FlowRecord>>;
}

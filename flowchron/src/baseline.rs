//! Baseline collaborators
//!
//! Minimal implementations of the search and sampler traits so the command
//! line tool runs end to end. They make no claim to model quality:
//! - [`TemplateSearch`] treats every distinct tuple of key-column values as a
//!   one-flow pattern
//! - [`WeightedPatternSampler`] draws patterns in proportion to usage
//! - [`DomainFlowSampler`] fills non-fixed columns from the dataset's value
//!   domains and places flows inside the timestamp domain
//!
//! Both samplers are seeded, the flow sampler per occurrence position, so the
//! output does not depend on how work was split across workers.

use crate::error::{PipelineError, Result};
use crate::model::PatternCatalog;
use crate::types::{
    DatasetMetadata, FlowRecord, FlowSampler, FlowTemplate, Pattern, PatternId, PatternSampler,
    PatternSearch, PatternUsage, SampledPatterns, SubModel,
};
use chrono::{Duration, NaiveDateTime};
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Sub-model produced by [`TemplateSearch`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateModel {
    pub model_name: String,
    pub flows_seen: usize,
    patterns: BTreeMap<PatternId, Pattern>,
    usage: PatternUsage,
    gaps: BTreeMap<PatternId, Vec<f64>>,
}

impl SubModel for TemplateModel {
    fn pattern_usage(&self) -> PatternUsage {
        self.usage.clone()
    }

    fn pattern(&self, id: &PatternId) -> Option<&Pattern> {
        self.patterns.get(id)
    }

    fn inter_flow_gaps(&self, id: &PatternId) -> Vec<f64> {
        self.gaps.get(id).cloned().unwrap_or_default()
    }
}

/// Groups flows by the values of `key_columns`
#[derive(Debug, Clone)]
pub struct TemplateSearch {
    key_columns: Vec<String>,
    min_support: u64,
}

impl TemplateSearch {
    pub fn new(key_columns: Vec<String>, min_support: u64) -> Self {
        Self {
            key_columns,
            min_support: min_support.max(1),
        }
    }
}

impl PatternSearch for TemplateSearch {
    type Model = TemplateModel;

    fn search(
        &self,
        records: &[FlowRecord],
        metadata: &DatasetMetadata,
        model_name: &str,
    ) -> Result<TemplateModel> {
        let key_indices = self
            .key_columns
            .iter()
            .map(|column| {
                metadata.column_index(column).ok_or_else(|| {
                    PipelineError::Dataset(format!("unknown key column '{}'", column))
                })
            })
            .collect::<Result<Vec<usize>>>()?;

        let mut groups: BTreeMap<Vec<&str>, Vec<NaiveDateTime>> = BTreeMap::new();
        for record in records {
            let key = key_indices.iter().map(|&i| record.values[i].as_str()).collect();
            groups.entry(key).or_default().push(record.first_seen);
        }

        let mut patterns = BTreeMap::new();
        let mut usage = PatternUsage::new();
        let mut gaps = BTreeMap::new();

        for (key, mut times) in groups {
            if (times.len() as u64) < self.min_support {
                continue;
            }

            let fixed: BTreeMap<String, String> = self
                .key_columns
                .iter()
                .zip(&key)
                .map(|(column, value)| (column.clone(), value.to_string()))
                .collect();
            let id = PatternId::new(
                fixed
                    .iter()
                    .map(|(c, v)| format!("{}={}", c, v))
                    .collect::<Vec<_>>()
                    .join("|"),
            );

            times.sort();
            let observed: Vec<f64> = times
                .windows(2)
                .map(|w| (w[1] - w[0]).num_milliseconds() as f64 / 1000.0)
                .collect();

            usage.insert(id.clone(), times.len() as u64);
            gaps.insert(id.clone(), observed);
            patterns.insert(
                id.clone(),
                Pattern {
                    id,
                    flows: vec![FlowTemplate { fixed }],
                    timing: None,
                },
            );
        }

        debug!(model_name, flows = records.len(), patterns = patterns.len(), "Template search finished");

        Ok(TemplateModel {
            model_name: model_name.to_string(),
            flows_seen: records.len(),
            patterns,
            usage,
            gaps,
        })
    }
}

/// Draws occurrences with probability proportional to usage
#[derive(Debug, Clone)]
pub struct WeightedPatternSampler {
    seed: u64,
}

impl WeightedPatternSampler {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl PatternSampler for WeightedPatternSampler {
    fn sample(&self, catalog: &PatternCatalog, total: usize) -> Result<SampledPatterns> {
        if total == 0 {
            return Ok(SampledPatterns::default());
        }

        let entries: Vec<(&PatternId, &Pattern, u64)> =
            catalog.entries().filter(|(_, _, count)| *count > 0).collect();
        let weights = WeightedIndex::new(entries.iter().map(|(_, _, count)| *count))
            .map_err(|e| PipelineError::Sampler(format!("cannot weight patterns: {}", e)))?;

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut sampled = SampledPatterns {
            ids: Vec::with_capacity(total),
            patterns: Vec::with_capacity(total),
        };
        for _ in 0..total {
            let (id, pattern, _) = entries[weights.sample(&mut rng)];
            sampled.ids.push(id.clone());
            sampled.patterns.push(pattern.clone());
        }
        Ok(sampled)
    }
}

/// Fills flows from the dataset's value domains
#[derive(Debug, Clone)]
pub struct DomainFlowSampler {
    seed: u64,
}

impl DomainFlowSampler {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn rng_for(&self, position: usize) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ (position as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }
}

impl FlowSampler for DomainFlowSampler {
    fn sample_flows(
        &self,
        pattern: &Pattern,
        metadata: &DatasetMetadata,
        position: usize,
    ) -> Result<Vec<FlowRecord>> {
        let mut rng = self.rng_for(position);

        let domain = metadata.time_domain;
        let span_ms = (domain.end - domain.start).num_milliseconds().max(0);
        let mut first_seen = domain.start + Duration::milliseconds(rng.gen_range(0..=span_ms));

        let mut flows = Vec::with_capacity(pattern.flows.len());
        for (i, template) in pattern.flows.iter().enumerate() {
            if i > 0 {
                let gap = pattern
                    .timing
                    .as_ref()
                    .map(|t| t.sample_gap(&mut rng))
                    .unwrap_or(0.0);
                first_seen += Duration::milliseconds((gap * 1000.0).round() as i64);
            }

            let values = metadata
                .columns
                .iter()
                .map(|column| sample_value(column, template, metadata, &mut rng))
                .collect();

            flows.push(FlowRecord {
                first_seen,
                values,
                pattern_id: None,
            });
        }
        Ok(flows)
    }
}

fn sample_value(
    column: &str,
    template: &FlowTemplate,
    metadata: &DatasetMetadata,
    rng: &mut StdRng,
) -> String {
    if let Some(fixed) = template.fixed.get(column) {
        return fixed.clone();
    }
    if let Some(values) = metadata.value_domains.get(column) {
        return values.choose(rng).cloned().unwrap_or_default();
    }
    if let Some(repr) = metadata.continuous.get(column) {
        if repr.edges.len() >= 2 {
            let bin = rng.gen_range(0..repr.edges.len() - 1);
            let (low, high) = (repr.edges[bin], repr.edges[bin + 1]);
            let value = if high > low { rng.gen_range(low..high) } else { low };
            return if repr.integral {
                format!("{}", value.floor() as i64)
            } else {
                format!("{:.3}", value)
            };
        }
    }
    String::new()
}

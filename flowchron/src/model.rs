//! Composite model
//!
//! Wraps the ordered list of chunk sub-models and answers queries as if one
//! model had been trained on the whole dataset. Composition is a pure
//! aggregation: sub-models are never touched after they are handed over.
//! The only state that changes afterwards is additive and derived (usage
//! cache, fitted temporal samplers).

use crate::persistence::{load_json, save_json};
use crate::types::{DatasetMetadata, Pattern, PatternId, PatternUsage, SubModel, TemporalSampler};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Aggregated coverage statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverStats {
    pattern_usage: PatternUsage,
    sub_model_count: usize,
}

impl CoverStats {
    pub fn pattern_usage(&self) -> &PatternUsage {
        &self.pattern_usage
    }

    pub fn sub_model_count(&self) -> usize {
        self.sub_model_count
    }

    pub fn distinct_patterns(&self) -> usize {
        self.pattern_usage.len()
    }

    pub fn total_occurrences(&self) -> u64 {
        self.pattern_usage.values().sum()
    }
}

/// Patterns available for sampling, with their usage
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatternCatalog {
    usage: PatternUsage,
    patterns: BTreeMap<PatternId, Pattern>,
}

impl PatternCatalog {
    pub fn new(usage: PatternUsage, patterns: BTreeMap<PatternId, Pattern>) -> Self {
        Self { usage, patterns }
    }

    pub fn usage(&self) -> &PatternUsage {
        &self.usage
    }

    pub fn pattern(&self, id: &PatternId) -> Option<&Pattern> {
        self.patterns.get(id)
    }

    /// `(id, pattern, usage)` in identifier order
    pub fn entries(&self) -> impl Iterator<Item = (&PatternId, &Pattern, u64)> {
        self.patterns
            .iter()
            .map(|(id, pattern)| (id, pattern, self.usage.get(id).copied().unwrap_or(0)))
    }

    /// Sum of all usage counts: the number of occurrences to sample
    pub fn total_occurrences(&self) -> u64 {
        self.usage.values().sum()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Ordered sub-models plus the metadata of the full dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeModel<M> {
    metadata: Arc<DatasetMetadata>,
    sub_models: Vec<M>,
    #[serde(skip)]
    usage_cache: OnceLock<PatternUsage>,
    #[serde(default)]
    temporal_samplers: BTreeMap<PatternId, TemporalSampler>,
}

impl<M: SubModel> CompositeModel<M> {
    /// Compose sub-models already in chunk order
    pub fn compose(metadata: Arc<DatasetMetadata>, sub_models: Vec<M>) -> Self {
        info!(sub_models = sub_models.len(), "Composing model");
        Self {
            metadata,
            sub_models,
            usage_cache: OnceLock::new(),
            temporal_samplers: BTreeMap::new(),
        }
    }

    pub fn metadata(&self) -> &Arc<DatasetMetadata> {
        &self.metadata
    }

    pub fn sub_models(&self) -> &[M] {
        &self.sub_models
    }

    /// Usage summed across all sub-models (computed once)
    pub fn pattern_usage(&self) -> &PatternUsage {
        self.usage_cache.get_or_init(|| {
            let mut usage = PatternUsage::new();
            for sub_model in &self.sub_models {
                for (id, count) in sub_model.pattern_usage() {
                    *usage.entry(id).or_insert(0) += count;
                }
            }
            debug!(patterns = usage.len(), "Aggregated pattern usage");
            usage
        })
    }

    pub fn cover_stats(&self) -> CoverStats {
        CoverStats {
            pattern_usage: self.pattern_usage().clone(),
            sub_model_count: self.sub_models.len(),
        }
    }

    /// First definition of `id` in chunk order
    pub fn pattern(&self, id: &PatternId) -> Option<&Pattern> {
        self.sub_models.iter().find_map(|m| m.pattern(id))
    }

    /// Fit one temporal sampler per pattern from the gaps every sub-model
    /// observed; returns how many samplers were fitted
    pub fn fit_temporal_samplers<'a, I>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = &'a PatternId>,
    {
        let mut fitted = 0;
        for id in ids {
            if self.pattern(id).is_none() {
                warn!(pattern_id = %id, "No sub-model defines pattern, skipping temporal fit");
                continue;
            }
            let gaps: Vec<f64> = self
                .sub_models
                .iter()
                .flat_map(|m| m.inter_flow_gaps(id))
                .collect();
            self.temporal_samplers
                .insert(id.clone(), TemporalSampler::from_gaps(gaps));
            fitted += 1;
        }
        info!(fitted, "Fitted temporal samplers");
        fitted
    }

    pub fn temporal_sampler(&self, id: &PatternId) -> Option<&TemporalSampler> {
        self.temporal_samplers.get(id)
    }

    /// Pattern definitions with fitted samplers attached, keyed by usage
    pub fn catalog(&self) -> PatternCatalog {
        let mut usage = PatternUsage::new();
        let mut patterns = BTreeMap::new();

        for (id, count) in self.pattern_usage() {
            let Some(definition) = self.pattern(id) else {
                warn!(pattern_id = %id, "Usage without definition, excluded from catalog");
                continue;
            };
            let mut pattern = definition.clone();
            if let Some(sampler) = self.temporal_samplers.get(id) {
                pattern.timing = Some(sampler.clone());
            }
            usage.insert(id.clone(), *count);
            patterns.insert(id.clone(), pattern);
        }

        PatternCatalog::new(usage, patterns)
    }
}

impl<M: Serialize> CompositeModel<M> {
    pub fn save_model(&self, path: &Path) -> flowchron_common::Result<()> {
        save_json(self, path)?;
        info!(path = %path.display(), "Saved composite model");
        Ok(())
    }
}

impl<M: DeserializeOwned> CompositeModel<M> {
    pub fn load_model(path: &Path) -> flowchron_common::Result<Self> {
        let model: Self = load_json(path)?;
        info!(path = %path.display(), sub_models = model.sub_models.len(), "Loaded composite model");
        Ok(model)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{FlowTemplate, TimeDomain};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct FixedModel {
        pub patterns: BTreeMap<PatternId, Pattern>,
        pub usage: PatternUsage,
        pub gaps: BTreeMap<PatternId, Vec<f64>>,
    }

    impl SubModel for FixedModel {
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

    pub(crate) fn metadata() -> Arc<DatasetMetadata> {
        let day = NaiveDate::from_ymd_opt(2017, 3, 15).unwrap();
        Arc::new(DatasetMetadata {
            time_column: "Date first seen".to_string(),
            columns: vec!["Proto".to_string()],
            value_domains: BTreeMap::from([(
                "Proto".to_string(),
                vec!["TCP".to_string(), "UDP".to_string()],
            )]),
            continuous: BTreeMap::new(),
            time_domain: TimeDomain {
                start: day.and_hms_opt(0, 0, 0).unwrap(),
                end: day.and_hms_opt(1, 0, 0).unwrap(),
            },
        })
    }

    pub(crate) fn fixed_model(entries: &[(&str, u64)], gaps: &[(&str, Vec<f64>)]) -> FixedModel {
        let mut patterns = BTreeMap::new();
        let mut usage = PatternUsage::new();
        for (id, count) in entries {
            let id = PatternId::new(*id);
            patterns.insert(
                id.clone(),
                Pattern {
                    id: id.clone(),
                    flows: vec![FlowTemplate::default()],
                    timing: None,
                },
            );
            usage.insert(id, *count);
        }
        FixedModel {
            patterns,
            usage,
            gaps: gaps
                .iter()
                .map(|(id, g)| (PatternId::new(*id), g.clone()))
                .collect(),
        }
    }

    #[test]
    fn test_usage_sums_across_sub_models() {
        let model = CompositeModel::compose(
            metadata(),
            vec![
                fixed_model(&[("A", 2), ("B", 1)], &[]),
                fixed_model(&[("A", 3), ("C", 4)], &[]),
            ],
        );

        let stats = model.cover_stats();
        assert_eq!(stats.sub_model_count(), 2);
        assert_eq!(stats.distinct_patterns(), 3);
        assert_eq!(stats.total_occurrences(), 10);
        assert_eq!(stats.pattern_usage()[&PatternId::new("A")], 5);
    }

    #[test]
    fn test_composing_twice_is_idempotent() {
        let subs = vec![
            fixed_model(&[("A", 2)], &[]),
            fixed_model(&[("B", 1), ("A", 1)], &[]),
        ];
        let first = CompositeModel::compose(metadata(), subs.clone());
        let second = CompositeModel::compose(metadata(), subs.clone());

        assert_eq!(first.cover_stats(), second.cover_stats());
        assert_eq!(first.sub_models(), subs.as_slice());
    }

    #[test]
    fn test_fit_pools_gaps_from_every_sub_model() {
        let mut model = CompositeModel::compose(
            metadata(),
            vec![
                fixed_model(&[("A", 2)], &[("A", vec![1.0, 2.0])]),
                fixed_model(&[("A", 1)], &[("A", vec![3.0])]),
            ],
        );

        let ids = vec![PatternId::new("A"), PatternId::new("missing")];
        assert_eq!(model.fit_temporal_samplers(&ids), 1);
        assert_eq!(model.temporal_sampler(&PatternId::new("A")).unwrap().observations(), 3);

        let catalog = model.catalog();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.pattern(&PatternId::new("A")).unwrap().timing.is_some());
        assert!(model.sub_models()[0].patterns[&PatternId::new("A")].timing.is_none());
    }

    #[test]
    fn test_catalog_excludes_undefined_patterns() {
        let mut sub = fixed_model(&[("A", 2)], &[]);
        sub.usage.insert(PatternId::new("ghost"), 9);
        let model = CompositeModel::compose(metadata(), vec![sub]);

        let catalog = model.catalog();
        assert_eq!(catalog.total_occurrences(), 2);
        assert!(catalog.pattern(&PatternId::new("ghost")).is_none());
    }

    #[test]
    fn test_save_and_load_keeps_samplers() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("models").join("composite.json");

        let mut model = CompositeModel::compose(
            metadata(),
            vec![fixed_model(&[("A", 2)], &[("A", vec![0.5])])],
        );
        model.fit_temporal_samplers(&[PatternId::new("A")]);
        model.save_model(&path).unwrap();

        let loaded = CompositeModel::<FixedModel>::load_model(&path).unwrap();
        assert_eq!(loaded.cover_stats(), model.cover_stats());
        assert_eq!(loaded.metadata().as_ref(), model.metadata().as_ref());
        assert_eq!(loaded.catalog(), model.catalog());
    }
}

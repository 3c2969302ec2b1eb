//! Two-stage pipeline
//!
//! **Stage 1 (training):** the dataset is split into `n_split` chunks, one
//! sub-model is searched per chunk in parallel and the sub-models are
//! composed in chunk order. Temporal samplers are fitted for every pattern
//! the composite uses.
//!
//! **Stage 2 (sampling):** `sum(usage)` occurrences are drawn from the
//! composite's catalog and materialized into flows in parallel.
//!
//! Stage 2 only accepts a [`TrainedModel`], which only stage 1 (or loading a
//! saved composite) produces.

use crate::config::PipelineConfig;
use crate::dataset::FlowDataset;
use crate::dispatcher::Dispatcher;
use crate::error::{ChunkFailure, PipelineError, Result};
use crate::model::{CompositeModel, CoverStats};
use crate::persistence::{JsonChunkSink, ResultSink};
use crate::planner::{split_even, Chunk, WorkerBudget};
use crate::sampling::{self, PatternOccurrences, SyntheticFlowTable};
use crate::types::{FlowRecord, FlowSampler, PatternId, PatternSampler, PatternSearch, SubModel};
use flowchron_common::events::{EventBus, PipelineStage};
use flowchron_common::human_time::format_elapsed;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// What happened while training
#[derive(Debug, Clone, Default)]
pub struct TrainingReport {
    pub chunk_count: usize,
    /// Chunks dropped from a partial model
    pub failed_chunks: Vec<ChunkFailure>,
    pub elapsed: Duration,
}

/// Stage 1 output and stage 2 input
#[derive(Debug, Clone)]
pub struct TrainedModel<M> {
    model: CompositeModel<M>,
    report: TrainingReport,
}

impl<M: SubModel> TrainedModel<M> {
    /// Wrap a previously saved composite
    pub fn from_saved(model: CompositeModel<M>) -> Self {
        let report = TrainingReport {
            chunk_count: model.sub_models().len(),
            ..Default::default()
        };
        Self { model, report }
    }

    pub fn model(&self) -> &CompositeModel<M> {
        &self.model
    }

    pub fn report(&self) -> &TrainingReport {
        &self.report
    }

    pub fn cover_stats(&self) -> CoverStats {
        self.model.cover_stats()
    }

    pub fn into_model(self) -> CompositeModel<M> {
        self.model
    }

    /// Draw `sum(usage)` occurrences from the composite's catalog
    pub fn sample_occurrences<P: PatternSampler>(&self, sampler: &P) -> Result<PatternOccurrences> {
        let catalog = self.model.catalog();
        let total = catalog.total_occurrences() as usize;
        let sampled = sampler.sample(&catalog, total)?;

        if sampled.ids.len() != total || sampled.patterns.len() != total {
            return Err(PipelineError::Sampler(format!(
                "requested {} occurrences, got {} identifiers and {} patterns",
                total,
                sampled.ids.len(),
                sampled.patterns.len()
            )));
        }

        info!(occurrences = total, patterns = catalog.len(), "Sampled pattern occurrences");
        Ok(sampled.into())
    }
}

/// Runs both stages with one configuration
pub struct Pipeline {
    config: PipelineConfig,
    event_bus: Option<EventBus>,
    cancel_token: CancellationToken,
    chunk_dir: Option<PathBuf>,
    run_id: Uuid,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            event_bus: None,
            cancel_token: CancellationToken::new(),
            chunk_dir: None,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    /// Directory for per-chunk sub-models (used when `persist_chunks` is set)
    pub fn with_chunk_dir(mut self, dir: PathBuf) -> Self {
        self.chunk_dir = Some(dir);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn dispatcher(&self, stage: PipelineStage, budget: WorkerBudget) -> Dispatcher {
        let dispatcher = Dispatcher::new(stage, budget)
            .with_failure_policy(self.config.failure_policy)
            .with_task_timeout(self.config.task_timeout())
            .with_run_id(self.run_id)
            .with_cancel_token(self.cancel_token.clone());
        match &self.event_bus {
            Some(bus) => dispatcher.with_event_bus(bus.clone()),
            None => dispatcher,
        }
    }

    fn check_cancelled(&self, stage: PipelineStage) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            return Err(PipelineError::Cancelled(format!("{} stage not started", stage)));
        }
        Ok(())
    }

    /// Stage 1: search one sub-model per chunk and compose them
    pub async fn train<P>(&self, dataset: FlowDataset, search: Arc<P>) -> Result<TrainedModel<P::Model>>
    where
        P: PatternSearch,
        P::Model: Serialize,
    {
        self.check_cancelled(PipelineStage::Training)?;
        let started = Instant::now();
        let (metadata, records) = dataset.into_parts();

        // n_split == 0 keeps the whole dataset in one chunk
        let parts = WorkerBudget::new(self.config.n_split.max(1))?;
        let (plan, chunks) = split_even(records, parts);
        info!(
            flows = plan.total_items(),
            n_split = self.config.n_split,
            chunks = plan.len(),
            chunk_size = plan.chunk_size(),
            "Training"
        );

        let dispatcher = self.dispatcher(PipelineStage::Training, self.config.train_budget()?);
        let model_name = self.config.model_name.clone();
        let worker_metadata = Arc::clone(&metadata);
        let work = move |chunk: Chunk<FlowRecord>| {
            let name = format!("{}_chunk{}", model_name, chunk.index);
            search.search(&chunk.items, &worker_metadata, &name)
        };

        let outcome = match (self.config.persist_chunks, &self.chunk_dir) {
            (true, Some(dir)) => {
                let sink: Arc<dyn ResultSink<P::Model>> =
                    Arc::new(JsonChunkSink::new(dir.join(self.config.chunk_artifact_prefix())));
                dispatcher.dispatch_persisted(chunks, work, sink).await?
            }
            (true, None) => {
                warn!("Chunk persistence requested without a chunk directory; skipping");
                dispatcher.dispatch(chunks, work).await?
            }
            (false, _) => dispatcher.dispatch(chunks, work).await?,
        };

        let chunk_count = outcome.chunk_count();
        let failed_chunks = outcome.failures().to_vec();
        let cancelled = !outcome.skipped().is_empty();

        let sub_models = if failed_chunks.is_empty() || cancelled || !self.config.allow_partial_model {
            outcome.into_ordered()?
        } else {
            warn!(
                failed = failed_chunks.len(),
                chunk_count,
                "Composing partial model from surviving chunks"
            );
            outcome.into_partial()?
        };

        let mut model = CompositeModel::compose(metadata, sub_models);
        let used: Vec<PatternId> = model.pattern_usage().keys().cloned().collect();
        model.fit_temporal_samplers(&used);

        let elapsed = started.elapsed();
        let stats = model.cover_stats();
        info!(
            sub_models = stats.sub_model_count(),
            patterns = stats.distinct_patterns(),
            occurrences = stats.total_occurrences(),
            "Training took {}",
            format_elapsed(elapsed)
        );

        Ok(TrainedModel {
            model,
            report: TrainingReport {
                chunk_count,
                failed_chunks,
                elapsed,
            },
        })
    }

    /// Stage 2: sample occurrences and materialize them into flows
    pub async fn generate<M, P, S>(
        &self,
        trained: &TrainedModel<M>,
        pattern_sampler: &P,
        flow_sampler: Arc<S>,
    ) -> Result<SyntheticFlowTable>
    where
        M: SubModel,
        P: PatternSampler,
        S: FlowSampler,
    {
        self.check_cancelled(PipelineStage::Sampling)?;
        let started = Instant::now();

        let occurrences = trained.sample_occurrences(pattern_sampler)?;
        let dispatcher = self.dispatcher(PipelineStage::Sampling, self.config.sample_budget()?);
        let table = sampling::generate(
            occurrences,
            Arc::clone(trained.model().metadata()),
            flow_sampler,
            &dispatcher,
        )
        .await?;

        info!(flows = table.len(), "Sampling took {}", format_elapsed(started.elapsed()));
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::{DomainFlowSampler, TemplateSearch, WeightedPatternSampler};
    use crate::config::FailurePolicy;
    use crate::dataset::DEFAULT_TIME_COLUMN;
    use crate::types::DatasetMetadata;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dataset(flows: usize) -> FlowDataset {
        let day = NaiveDate::from_ymd_opt(2017, 3, 15).unwrap();
        let records = (0..flows)
            .map(|i| FlowRecord {
                first_seen: day.and_hms_opt(0, 0, i as u32 % 60).unwrap(),
                values: vec![
                    if i % 3 == 0 { "UDP" } else { "TCP" }.to_string(),
                    if i % 3 == 0 { "53" } else { "80" }.to_string(),
                ],
                pattern_id: None,
            })
            .collect();
        FlowDataset::from_records(
            DEFAULT_TIME_COLUMN,
            vec!["Proto".to_string(), "Dst Pt".to_string()],
            records,
            10,
        )
        .unwrap()
    }

    fn config(n_split: usize) -> PipelineConfig {
        PipelineConfig {
            n_split,
            train_workers: Some(2),
            sample_workers: Some(2),
            ..Default::default()
        }
    }

    fn search() -> Arc<TemplateSearch> {
        Arc::new(TemplateSearch::new(vec!["Proto".to_string()], 1))
    }

    #[tokio::test]
    async fn test_train_then_generate_reproduces_usage() {
        let pipeline = Pipeline::new(config(4));
        let trained = pipeline.train(dataset(20), search()).await.unwrap();

        assert_eq!(trained.report().chunk_count, 4);
        let stats = trained.cover_stats();
        assert_eq!(stats.total_occurrences(), 20);
        assert_eq!(stats.pattern_usage()[&PatternId::new("Proto=UDP")], 7);

        let table = pipeline
            .generate(&trained, &WeightedPatternSampler::new(1), Arc::new(DomainFlowSampler::new(1)))
            .await
            .unwrap();

        assert_eq!(table.len(), 20);
        assert!(table
            .records()
            .windows(2)
            .all(|w| w[0].first_seen <= w[1].first_seen));
    }

    #[tokio::test]
    async fn test_zero_split_trains_one_model() {
        let trained = Pipeline::new(config(0)).train(dataset(9), search()).await.unwrap();
        assert_eq!(trained.model().sub_models().len(), 1);
        assert_eq!(trained.cover_stats().total_occurrences(), 9);
    }

    #[tokio::test]
    async fn test_n_split_is_exact_chunk_count() {
        let trained = Pipeline::new(config(4)).train(dataset(10), search()).await.unwrap();

        assert_eq!(trained.report().chunk_count, 4);
        let seen: Vec<usize> = trained.model().sub_models().iter().map(|m| m.flows_seen).collect();
        assert_eq!(seen, vec![3, 3, 2, 2]);
        assert_eq!(trained.cover_stats().total_occurrences(), 10);
    }

    #[tokio::test]
    async fn test_persisted_chunks_named_by_prefix() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let pipeline = Pipeline::new(PipelineConfig {
            persist_chunks: true,
            model_name: "unit".to_string(),
            ..config(3)
        })
        .with_chunk_dir(temp_dir.path().to_path_buf());

        pipeline.train(dataset(9), search()).await.unwrap();

        for index in 0..3 {
            assert!(temp_dir.path().join(format!("unit_split3_chunk{}.json", index)).exists());
        }
    }

    /// Fails on one chunk, delegates to the baseline otherwise
    struct FailingSearch {
        fail_on: String,
        calls: AtomicUsize,
    }

    impl PatternSearch for FailingSearch {
        type Model = crate::baseline::TemplateModel;

        fn search(
            &self,
            records: &[FlowRecord],
            metadata: &DatasetMetadata,
            model_name: &str,
        ) -> Result<Self::Model> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if model_name.ends_with(&self.fail_on) {
                return Err(PipelineError::Dataset("unreadable chunk".to_string()));
            }
            TemplateSearch::new(vec!["Proto".to_string()], 1).search(records, metadata, model_name)
        }
    }

    fn failing(chunk: usize) -> Arc<FailingSearch> {
        Arc::new(FailingSearch {
            fail_on: format!("_chunk{}", chunk),
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_failed_chunk_blocks_model_by_default() {
        let result = Pipeline::new(config(3)).train(dataset(9), failing(1)).await;
        match result {
            Err(PipelineError::ChunkFailed(failure)) => {
                assert_eq!(failure.index, 1);
                assert_eq!(failure.len, 3);
            }
            other => panic!("expected chunk failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_partial_model_when_allowed() {
        let pipeline = Pipeline::new(PipelineConfig {
            allow_partial_model: true,
            failure_policy: FailurePolicy::CollectAll,
            ..config(3)
        });
        let search = failing(2);

        let trained = pipeline.train(dataset(9), Arc::clone(&search)).await.unwrap();

        assert_eq!(search.calls.load(Ordering::SeqCst), 3);
        assert_eq!(trained.model().sub_models().len(), 2);
        assert_eq!(trained.report().failed_chunks[0].index, 2);
        assert_eq!(trained.cover_stats().total_occurrences(), 6);
    }

    #[tokio::test]
    async fn test_cancelled_before_training() {
        let token = CancellationToken::new();
        token.cancel();
        let pipeline = Pipeline::new(config(2)).with_cancel_token(token);

        assert!(matches!(
            pipeline.train(dataset(4), search()).await,
            Err(PipelineError::Cancelled(_))
        ));
    }
}

//! Parallel dispatcher
//!
//! Runs one unit of work per chunk on the blocking thread pool with at most
//! `max_workers` chunks in flight. Every task is tagged with its chunk
//! position when it is submitted; completions are consumed in arrival order
//! and written into a pre-sized slot array at that position, so the
//! collected results always follow chunk order.
//!
//! Tasks own their input chunk and return an owned result. Nothing is shared
//! between tasks except immutable data behind `Arc`.
//!
//! # Failures
//! A failing chunk never cancels its siblings. Under
//! [`FailurePolicy::CollectAll`] every chunk runs; under
//! [`FailurePolicy::FailFast`] no further chunks are submitted after the first
//! failure, while chunks already running are allowed to finish. Either way the
//! caller receives a [`DispatchOutcome`] listing completed results and failed
//! chunks by position and size.

use crate::config::FailurePolicy;
use crate::error::{ChunkFailure, ChunkFailureKind, PipelineError, Result};
use crate::persistence::ResultSink;
use crate::planner::{Chunk, WorkerBudget};
use flowchron_common::events::{EventBus, PipelineEvent, PipelineStage};
use futures::stream::{FuturesUnordered, StreamExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Output of one finished blocking task: the result plus what happened when
/// persisting it
type TaskOutput<R> = Result<(R, Option<Result<PathBuf>>)>;

/// How a submitted task came back
enum Completion<R> {
    Joined(std::result::Result<TaskOutput<R>, JoinError>),
    TimedOut,
}

const TASK_RUNNING: u8 = 0;
const TASK_FINISHED: u8 = 1;
const TASK_DETACHED: u8 = 2;

/// Timed-out blocking threads that have not returned yet
///
/// They still occupy a worker slot, so refills wait for them.
#[derive(Default)]
struct DetachedWorkers {
    count: AtomicUsize,
    freed: Notify,
}

impl DetachedWorkers {
    fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Called when a task times out; no-op if its thread already returned
    fn detach(&self, state: &AtomicU8) {
        self.count.fetch_add(1, Ordering::SeqCst);
        if state
            .compare_exchange(TASK_RUNNING, TASK_DETACHED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.count.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Dropped when a blocking thread returns (or unwinds)
struct ThreadExit {
    state: Arc<AtomicU8>,
    detached: Arc<DetachedWorkers>,
}

impl Drop for ThreadExit {
    fn drop(&mut self) {
        if self.state.swap(TASK_FINISHED, Ordering::SeqCst) == TASK_DETACHED {
            self.detached.count.fetch_sub(1, Ordering::SeqCst);
            self.detached.freed.notify_one();
        }
    }
}

/// Everything collected from one dispatch
#[derive(Debug)]
pub struct DispatchOutcome<R> {
    stage: PipelineStage,
    slots: Vec<Option<R>>,
    failures: Vec<ChunkFailure>,
    persistence_failures: Vec<PipelineError>,
    /// Chunks never submitted (fail-fast or cancellation)
    skipped: Vec<usize>,
}

impl<R> DispatchOutcome<R> {
    pub fn chunk_count(&self) -> usize {
        self.slots.len()
    }

    pub fn succeeded(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Failed chunks, ordered by position
    pub fn failures(&self) -> &[ChunkFailure] {
        &self.failures
    }

    pub fn persistence_failures(&self) -> &[PipelineError] {
        &self.persistence_failures
    }

    pub fn skipped(&self) -> &[usize] {
        &self.skipped
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.skipped.is_empty() && self.persistence_failures.is_empty()
    }

    /// Result of chunk `index`, if it completed
    pub fn get(&self, index: usize) -> Option<&R> {
        self.slots.get(index).and_then(|s| s.as_ref())
    }

    /// All results in chunk order, or the first problem encountered
    ///
    /// Chunk failures take precedence over persistence failures, which take
    /// precedence over cancellation.
    pub fn into_ordered(self) -> Result<Vec<R>> {
        if let Some(failure) = self.failures.into_iter().next() {
            return Err(PipelineError::ChunkFailed(failure));
        }
        if let Some(err) = self.persistence_failures.into_iter().next() {
            return Err(err);
        }
        if !self.skipped.is_empty() {
            return Err(PipelineError::Cancelled(format!(
                "{} of {} {} chunks were not submitted",
                self.skipped.len(),
                self.slots.len(),
                self.stage
            )));
        }

        self.slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| {
                    PipelineError::OrderingViolation(format!("slot {} was never filled", index))
                })
            })
            .collect()
    }

    /// Completed results in chunk order, dropping failed or skipped chunks
    ///
    /// Persistence failures still fail the call: a result that was computed
    /// but not written is not usable as a partial result.
    pub fn into_partial(self) -> Result<Vec<R>> {
        if let Some(err) = self.persistence_failures.into_iter().next() {
            return Err(err);
        }
        Ok(self.slots.into_iter().flatten().collect())
    }
}

/// Bounded, order-preserving chunk dispatcher
#[derive(Clone)]
pub struct Dispatcher {
    stage: PipelineStage,
    max_workers: usize,
    failure_policy: FailurePolicy,
    task_timeout: Option<Duration>,
    event_bus: Option<EventBus>,
    run_id: Uuid,
    cancel_token: CancellationToken,
}

impl Dispatcher {
    pub fn new(stage: PipelineStage, budget: WorkerBudget) -> Self {
        Self {
            stage,
            max_workers: budget.get(),
            failure_policy: FailurePolicy::default(),
            task_timeout: None,
            event_bus: None,
            run_id: Uuid::new_v4(),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Give up on a chunk after `timeout`
    ///
    /// A blocking worker cannot be interrupted: the timed-out thread is
    /// detached and its eventual result discarded. It keeps its worker slot
    /// until it actually returns.
    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// Stop submitting new chunks once `token` is cancelled
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// Run `work` once per chunk and collect results in chunk order
    pub async fn dispatch<T, R, F>(&self, chunks: Vec<Chunk<T>>, work: F) -> Result<DispatchOutcome<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(Chunk<T>) -> Result<R> + Send + Sync + 'static,
    {
        self.run(chunks, Arc::new(work), None).await
    }

    /// Like [`dispatch`](Self::dispatch), persisting every result through
    /// `sink` from inside the task that produced it
    pub async fn dispatch_persisted<T, R, F>(
        &self,
        chunks: Vec<Chunk<T>>,
        work: F,
        sink: Arc<dyn ResultSink<R>>,
    ) -> Result<DispatchOutcome<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(Chunk<T>) -> Result<R> + Send + Sync + 'static,
    {
        self.run(chunks, Arc::new(work), Some(sink)).await
    }

    async fn run<T, R, F>(
        &self,
        chunks: Vec<Chunk<T>>,
        work: Arc<F>,
        sink: Option<Arc<dyn ResultSink<R>>>,
    ) -> Result<DispatchOutcome<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(Chunk<T>) -> Result<R> + Send + Sync + 'static,
    {
        let total = chunks.len();
        let started = Instant::now();
        let stage = self.stage;

        info!(
            run_id = %self.run_id,
            %stage,
            chunk_count = total,
            max_workers = self.max_workers,
            "Dispatching chunks"
        );
        self.emit(PipelineEvent::StageStarted {
            run_id: self.run_id,
            stage,
            chunk_count: total,
            max_workers: self.max_workers,
            timestamp: chrono::Utc::now(),
        });

        let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
        let mut finished_flags = vec![false; total];
        let mut failures = Vec::new();
        let mut persistence_failures = Vec::new();

        let task_timeout = self.task_timeout;
        let detached = Arc::new(DetachedWorkers::default());
        let spawn_chunk_task = |chunk: Chunk<T>| {
            let index = chunk.index;
            let len = chunk.len();
            let work = Arc::clone(&work);
            let sink = sink.clone();
            let state = Arc::new(AtomicU8::new(TASK_RUNNING));
            let exit = ThreadExit {
                state: Arc::clone(&state),
                detached: Arc::clone(&detached),
            };
            let detached = Arc::clone(&detached);

            let handle = tokio::task::spawn_blocking(move || -> TaskOutput<R> {
                let _exit = exit;
                let result = work(chunk)?;
                let persisted = sink.as_ref().map(|sink| sink.persist(index, &result));
                Ok((result, persisted))
            });

            async move {
                let completion = match task_timeout {
                    Some(limit) => match tokio::time::timeout(limit, handle).await {
                        Ok(joined) => Completion::Joined(joined),
                        Err(_) => {
                            detached.detach(&state);
                            Completion::TimedOut
                        }
                    },
                    None => Completion::Joined(handle.await),
                };
                (index, len, completion)
            }
        };

        let mut pending = chunks.into_iter().peekable();
        let mut in_flight = FuturesUnordered::new();
        let mut finished = 0;
        let mut stop_submitting = false;

        loop {
            if self.cancel_token.is_cancelled() && !stop_submitting {
                warn!(%stage, "Cancellation requested: no further chunks will be submitted");
                stop_submitting = true;
            }

            // Spawn chunk tasks to maintain parallelism level
            while !stop_submitting && in_flight.len() + detached.count() < self.max_workers {
                match pending.next() {
                    Some(chunk) => in_flight.push(spawn_chunk_task(chunk)),
                    None => break,
                }
            }

            let more_to_submit = !stop_submitting && pending.peek().is_some();
            let next = if in_flight.is_empty() {
                if !more_to_submit {
                    break;
                }
                // Every slot is held by a timed-out thread
                detached.freed.notified().await;
                continue;
            } else if more_to_submit && detached.count() > 0 {
                tokio::select! {
                    biased;
                    next = in_flight.next() => next,
                    _ = detached.freed.notified() => continue,
                }
            } else {
                in_flight.next().await
            };

            let Some((index, len, completion)) = next else {
                break;
            };
            if index >= total || finished_flags[index] {
                error!(%stage, chunk_index = index, chunk_count = total, "Completion for unexpected chunk position");
                return Err(PipelineError::OrderingViolation(format!(
                    "{} completion tagged {} but only positions 0..{} exist or it was already collected",
                    stage, index, total
                )));
            }
            finished_flags[index] = true;
            finished += 1;

            let failure = match completion {
                Completion::Joined(Ok(Ok((result, persisted)))) => {
                    match persisted {
                        Some(Ok(path)) => {
                            debug!(%stage, chunk_index = index, path = %path.display(), "Chunk persisted");
                            self.emit(PipelineEvent::ChunkPersisted {
                                run_id: self.run_id,
                                stage,
                                chunk_index: index,
                                path: path.display().to_string(),
                            });
                        }
                        Some(Err(e)) => {
                            warn!(%stage, chunk_index = index, error = %e, "Chunk persistence failed (collection continues)");
                            persistence_failures.push(e);
                        }
                        None => {}
                    }

                    slots[index] = Some(result);
                    debug!(%stage, chunk_index = index, chunk_len = len, finished, total, "Chunk completed");
                    self.emit(PipelineEvent::ChunkCompleted {
                        run_id: self.run_id,
                        stage,
                        chunk_index: index,
                        chunk_len: len,
                        finished,
                        total,
                        timestamp: chrono::Utc::now(),
                    });
                    None
                }
                Completion::Joined(Ok(Err(e))) => Some((ChunkFailureKind::Failed, e.to_string())),
                Completion::Joined(Err(join_err)) if join_err.is_panic() => {
                    Some((ChunkFailureKind::Panicked, panic_message(join_err)))
                }
                Completion::Joined(Err(join_err)) => {
                    Some((ChunkFailureKind::Failed, join_err.to_string()))
                }
                Completion::TimedOut => Some((
                    ChunkFailureKind::TimedOut,
                    format!("no result after {:?}", task_timeout.unwrap_or_default()),
                )),
            };

            if let Some((kind, message)) = failure {
                error!(%stage, chunk_index = index, chunk_len = len, %kind, error = %message, "Chunk failed");
                self.emit(PipelineEvent::ChunkFailed {
                    run_id: self.run_id,
                    stage,
                    chunk_index: index,
                    chunk_len: len,
                    message: message.clone(),
                    timestamp: chrono::Utc::now(),
                });
                failures.push(ChunkFailure {
                    stage,
                    index,
                    len,
                    kind,
                    message,
                });
                if self.failure_policy == FailurePolicy::FailFast && !stop_submitting {
                    warn!(%stage, "Fail-fast: no further chunks will be submitted");
                    stop_submitting = true;
                }
            }

        }

        let skipped: Vec<usize> = pending.map(|chunk| chunk.index).collect();
        failures.sort_by_key(|f| f.index);

        let succeeded = slots.iter().filter(|s| s.is_some()).count();
        let elapsed = started.elapsed();
        info!(
            run_id = %self.run_id,
            %stage,
            succeeded,
            failed = failures.len(),
            skipped = skipped.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Dispatch finished"
        );
        self.emit(PipelineEvent::StageCompleted {
            run_id: self.run_id,
            stage,
            succeeded,
            failed: failures.len(),
            elapsed_ms: elapsed.as_millis() as u64,
            timestamp: chrono::Utc::now(),
        });

        Ok(DispatchOutcome {
            stage,
            slots,
            failures,
            persistence_failures,
            skipped,
        })
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit_lossy(event);
        }
    }
}

fn panic_message(join_err: JoinError) -> String {
    let payload = join_err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("worker panicked: {}", msg)
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{split, WorkerBudget};
    use std::sync::Mutex;

    fn budget(n: usize) -> WorkerBudget {
        WorkerBudget::new(n).unwrap()
    }

    fn chunks_of(total: usize, workers: usize) -> Vec<Chunk<usize>> {
        split((0..total).collect(), budget(workers)).1
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_results_follow_chunk_order_when_last_finishes_first() {
        let chunks = chunks_of(10, 3);
        let chunk_count = chunks.len();
        let completion_order = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&completion_order);

        let dispatcher = Dispatcher::new(PipelineStage::Training, budget(3));
        let outcome = dispatcher
            .dispatch(chunks, move |chunk: Chunk<usize>| {
                // Later chunks sleep less so they complete first
                let delay = (chunk_count - chunk.index) as u64 * 40;
                std::thread::sleep(Duration::from_millis(delay));
                recorder.lock().unwrap().push(chunk.index);
                Ok(chunk.items)
            })
            .await
            .unwrap();

        let results = outcome.into_ordered().unwrap();
        assert_eq!(results, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7, 8, 9]]);
        assert_eq!(completion_order.lock().unwrap()[0], 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ordering_under_jitter() {
        for total in [0usize, 1, 7, 33] {
            let chunks = chunks_of(total, 5);
            let expected: Vec<usize> = chunks.iter().map(|c| c.index).collect();

            let dispatcher = Dispatcher::new(PipelineStage::Sampling, budget(4));
            let outcome = dispatcher
                .dispatch(chunks, |chunk: Chunk<usize>| {
                    let jitter = (chunk.index * 7919) % 13;
                    std::thread::sleep(Duration::from_millis(jitter as u64));
                    Ok(chunk.index)
                })
                .await
                .unwrap();

            assert_eq!(outcome.chunk_count(), expected.len());
            assert_eq!(outcome.into_ordered().unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_never_exceeds_max_workers() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));

        let dispatcher = Dispatcher::new(PipelineStage::Training, budget(2));
        let outcome = dispatcher
            .dispatch(chunks_of(12, 12), move |chunk: Chunk<usize>| {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(10));
                r.fetch_sub(1, Ordering::SeqCst);
                Ok(chunk.len())
            })
            .await
            .unwrap();

        assert_eq!(outcome.into_ordered().unwrap().len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_chunk_reported_while_siblings_complete() {
        let dispatcher = Dispatcher::new(PipelineStage::Training, budget(3));
        let outcome = dispatcher
            .dispatch(chunks_of(10, 3), |chunk: Chunk<usize>| {
                if chunk.index == 1 {
                    return Err(PipelineError::Dataset("corrupt chunk".to_string()));
                }
                Ok(chunk.items.iter().sum::<usize>())
            })
            .await
            .unwrap();

        assert_eq!(outcome.get(0), Some(&3));
        assert_eq!(outcome.get(1), None);
        assert_eq!(outcome.get(2), Some(&30));
        assert_eq!(outcome.succeeded(), 2);

        let failure = &outcome.failures()[0];
        assert_eq!(failure.index, 1);
        assert_eq!(failure.len, 3);
        assert_eq!(failure.kind, ChunkFailureKind::Failed);
        assert!(failure.message.contains("corrupt chunk"));

        match outcome.into_ordered() {
            Err(PipelineError::ChunkFailed(f)) => assert_eq!(f.index, 1),
            other => panic!("expected chunk failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_partial_results_skip_failed_chunks() {
        let dispatcher = Dispatcher::new(PipelineStage::Training, budget(4));
        let outcome = dispatcher
            .dispatch(chunks_of(4, 4), |chunk: Chunk<usize>| {
                if chunk.index == 2 {
                    panic!("boom");
                }
                Ok(chunk.index)
            })
            .await
            .unwrap();

        assert_eq!(outcome.failures()[0].kind, ChunkFailureKind::Panicked);
        assert!(outcome.failures()[0].message.contains("boom"));
        assert_eq!(outcome.into_partial().unwrap(), vec![0, 1, 3]);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_submitting() {
        let dispatcher = Dispatcher::new(PipelineStage::Training, budget(1))
            .with_failure_policy(FailurePolicy::FailFast);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let outcome = dispatcher
            .dispatch(chunks_of(5, 5), move |chunk: Chunk<usize>| {
                counter.fetch_add(1, Ordering::SeqCst);
                if chunk.index == 1 {
                    return Err(PipelineError::Dataset("bad".to_string()));
                }
                Ok(chunk.index)
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.skipped(), &[2, 3, 4]);
        assert!(matches!(outcome.into_ordered(), Err(PipelineError::ChunkFailed(_))));
    }

    #[tokio::test]
    async fn test_cancellation_stops_submitting() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let dispatcher = Dispatcher::new(PipelineStage::Sampling, budget(1)).with_cancel_token(token);

        let outcome = dispatcher
            .dispatch(chunks_of(4, 4), move |chunk: Chunk<usize>| {
                trigger.cancel();
                Ok(chunk.index)
            })
            .await
            .unwrap();

        assert_eq!(outcome.get(0), Some(&0));
        assert_eq!(outcome.skipped(), &[1, 2, 3]);
        assert!(matches!(outcome.into_ordered(), Err(PipelineError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_timeout_reported_as_chunk_failure() {
        let dispatcher = Dispatcher::new(PipelineStage::Sampling, budget(2))
            .with_task_timeout(Some(Duration::from_millis(20)));

        let outcome = dispatcher
            .dispatch(chunks_of(2, 2), |chunk: Chunk<usize>| {
                if chunk.index == 0 {
                    std::thread::sleep(Duration::from_millis(300));
                }
                Ok(chunk.index)
            })
            .await
            .unwrap();

        assert_eq!(outcome.get(1), Some(&1));
        assert_eq!(outcome.failures().len(), 1);
        assert_eq!(outcome.failures()[0].kind, ChunkFailureKind::TimedOut);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_workers_keep_their_slot() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));

        let dispatcher = Dispatcher::new(PipelineStage::Training, budget(1))
            .with_task_timeout(Some(Duration::from_millis(20)));
        let outcome = dispatcher
            .dispatch(chunks_of(3, 3), move |chunk: Chunk<usize>| {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(200));
                r.fetch_sub(1, Ordering::SeqCst);
                Ok(chunk.index)
            })
            .await
            .unwrap();

        assert_eq!(outcome.failures().len(), 3);
        assert!(outcome
            .failures()
            .iter()
            .all(|failure| failure.kind == ChunkFailureKind::TimedOut));
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    struct FlakySink;

    impl ResultSink<usize> for FlakySink {
        fn persist(&self, index: usize, _result: &usize) -> Result<PathBuf> {
            if index == 0 {
                return Err(PipelineError::Persistence {
                    index,
                    path: PathBuf::from("/readonly/chunk0.json"),
                    message: "read-only file system".to_string(),
                });
            }
            Ok(PathBuf::from(format!("chunk{}.json", index)))
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_surfaces_after_collection() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let dispatcher = Dispatcher::new(PipelineStage::Training, budget(2)).with_event_bus(bus);

        let outcome = dispatcher
            .dispatch_persisted(chunks_of(3, 3), |chunk: Chunk<usize>| Ok(chunk.index), Arc::new(FlakySink))
            .await
            .unwrap();

        assert_eq!(outcome.succeeded(), 3);
        assert!(outcome.failures().is_empty());
        assert_eq!(outcome.persistence_failures().len(), 1);
        assert!(matches!(
            outcome.into_ordered(),
            Err(PipelineError::Persistence { index: 0, .. })
        ));

        let mut persisted = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PipelineEvent::ChunkPersisted { chunk_index, .. } = event {
                persisted.push(chunk_index);
            }
        }
        persisted.sort();
        assert_eq!(persisted, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_empty_input_spawns_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let dispatcher = Dispatcher::new(PipelineStage::Training, budget(4));

        let outcome = dispatcher
            .dispatch(Vec::<Chunk<u8>>::new(), move |_chunk: Chunk<u8>| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(outcome.is_complete());
        assert!(outcome.into_ordered().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_position_is_ordering_violation() {
        let mut chunks = chunks_of(2, 2);
        chunks[1].index = 0;

        let dispatcher = Dispatcher::new(PipelineStage::Training, budget(2));
        let result = dispatcher
            .dispatch(chunks, |chunk: Chunk<usize>| Ok(chunk.index))
            .await;

        assert!(matches!(result, Err(PipelineError::OrderingViolation(_))));
    }
}

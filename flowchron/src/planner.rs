//! Chunk planning
//!
//! Partitions `total_items` into contiguous chunks of a fixed stride
//! `chunk_size = max(1, total_items / worker_budget)`. The final chunk
//! absorbs the remainder, so there are `total_items / chunk_size` chunks
//! (never fewer than the budget unless there are fewer items) and chunk `i`
//! always starts at `i * chunk_size`.
//!
//! ```text
//! 10 items, budget 3  → [0..3) [3..6) [6..10)
//! 10 items, budget 4  → [0..2) [2..4) [4..6) [6..8) [8..10)
//!  2 items, budget 8  → [0..1) [1..2)
//! ```
//!
//! Training uses [`plan_even`] instead: exactly `min(parts, total_items)`
//! chunks whose sizes differ by at most one, larger chunks first.
//!
//! ```text
//! 10 items, 4 parts   → [0..3) [3..6) [6..8) [8..10)
//! ```

use crate::error::{PipelineError, Result};
use std::ops::Range;

/// Maximum number of concurrently running workers (always ≥ 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerBudget(usize);

impl WorkerBudget {
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(PipelineError::Partition(
                "worker budget must be at least 1".to_string(),
            ));
        }
        Ok(Self(workers))
    }

    /// Budget from a fractional value, truncated toward zero, minimum 1
    pub fn from_fraction(value: f64) -> Result<Self> {
        if !value.is_finite() || value < 0.0 {
            return Err(PipelineError::Partition(format!(
                "worker budget must be a non-negative number, got {}",
                value
            )));
        }
        Ok(Self((value.trunc() as usize).max(1)))
    }

    /// `fraction` of the available CPUs (`0.25` → a quarter of the cores)
    pub fn from_cpu_fraction(fraction: f64) -> Result<Self> {
        Self::from_fraction(num_cpus::get() as f64 * fraction)
    }

    pub fn get(self) -> usize {
        self.0
    }
}

/// A contiguous run of items tagged with its position among sibling chunks
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk<T> {
    /// Position among all chunks (0-based)
    pub index: usize,
    /// Global offset of the first item
    pub start: usize,
    pub items: Vec<T>,
}

impl<T> Chunk<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Index ranges produced by [`plan`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    total_items: usize,
    chunk_size: usize,
    spans: Vec<Range<usize>>,
}

impl ChunkPlan {
    pub fn total_items(&self) -> usize {
        self.total_items
    }

    /// Nominal stride; for stride plans chunk `i` starts at `i * chunk_size`
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn spans(&self) -> &[Range<usize>] {
        &self.spans
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.spans.iter().map(|s| s.len()).collect()
    }
}

/// Plan chunks for `total_items` under an integer worker budget
pub fn plan(total_items: usize, worker_budget: usize) -> Result<ChunkPlan> {
    Ok(plan_with(total_items, WorkerBudget::new(worker_budget)?))
}

/// Plan chunks for `total_items` under a validated budget
pub fn plan_with(total_items: usize, budget: WorkerBudget) -> ChunkPlan {
    let chunk_size = (total_items / budget.get()).max(1);
    let chunk_count = total_items / chunk_size;

    let spans = (0..chunk_count)
        .map(|index| {
            let start = index * chunk_size;
            let end = if index + 1 == chunk_count {
                total_items
            } else {
                start + chunk_size
            };
            start..end
        })
        .collect();

    ChunkPlan {
        total_items,
        chunk_size,
        spans,
    }
}

/// Plan exactly `min(parts, total_items)` near-equal chunks
pub fn plan_even(total_items: usize, parts: WorkerBudget) -> ChunkPlan {
    let chunk_count = parts.get().min(total_items);
    if chunk_count == 0 {
        return ChunkPlan {
            total_items,
            chunk_size: 1,
            spans: Vec::new(),
        };
    }

    let base = total_items / chunk_count;
    let larger = total_items % chunk_count;
    let mut spans = Vec::with_capacity(chunk_count);
    let mut start = 0;
    for index in 0..chunk_count {
        let len = if index < larger { base + 1 } else { base };
        spans.push(start..start + len);
        start += len;
    }

    ChunkPlan {
        total_items,
        chunk_size: base,
        spans,
    }
}

/// Move `items` into stride-planned chunks, preserving order
pub fn split<T>(items: Vec<T>, budget: WorkerBudget) -> (ChunkPlan, Vec<Chunk<T>>) {
    let plan = plan_with(items.len(), budget);
    let chunks = split_by_plan(items, &plan);
    (plan, chunks)
}

/// Move `items` into `parts` near-equal chunks, preserving order
pub fn split_even<T>(items: Vec<T>, parts: WorkerBudget) -> (ChunkPlan, Vec<Chunk<T>>) {
    let plan = plan_even(items.len(), parts);
    let chunks = split_by_plan(items, &plan);
    (plan, chunks)
}

fn split_by_plan<T>(items: Vec<T>, plan: &ChunkPlan) -> Vec<Chunk<T>> {
    let mut rest = items;
    let mut chunks = Vec::with_capacity(plan.len());
    for (index, span) in plan.spans().iter().enumerate().rev() {
        let items = rest.split_off(span.start);
        chunks.push(Chunk {
            index,
            start: span.start,
            items,
        });
    }
    chunks.reverse();
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ten_items_three_workers() {
        let plan = plan(10, 3).unwrap();
        assert_eq!(plan.chunk_size(), 3);
        assert_eq!(plan.sizes(), vec![3, 3, 4]);
    }

    #[test]
    fn test_even_split_yields_exactly_parts_chunks() {
        let (plan, chunks) = split_even((0..10).collect::<Vec<u32>>(), WorkerBudget::new(4).unwrap());
        assert_eq!(plan.sizes(), vec![3, 3, 2, 2]);
        assert_eq!(chunks.iter().map(|c| c.start).collect::<Vec<_>>(), vec![0, 3, 6, 8]);
        assert_eq!(chunks[3].items, vec![8, 9]);

        assert_eq!(plan_even(3, WorkerBudget::new(5).unwrap()).sizes(), vec![1, 1, 1]);
        assert!(plan_even(0, WorkerBudget::new(5).unwrap()).is_empty());
    }

    #[test]
    fn test_even_split_coverage_for_all_small_inputs() {
        for total in 0..=60usize {
            for parts in 1..=12usize {
                let items: Vec<usize> = (0..total).collect();
                let (plan, chunks) = split_even(items.clone(), WorkerBudget::new(parts).unwrap());

                assert_eq!(plan.len(), parts.min(total), "total={} parts={}", total, parts);
                let sizes = plan.sizes();
                if let (Some(max), Some(min)) = (sizes.iter().max(), sizes.iter().min()) {
                    assert!(max - min <= 1);
                }

                let mut rebuilt = Vec::with_capacity(total);
                for (position, chunk) in chunks.iter().enumerate() {
                    assert_eq!(chunk.index, position);
                    assert_eq!(chunk.start, rebuilt.len());
                    rebuilt.extend_from_slice(&chunk.items);
                }
                assert_eq!(rebuilt, items, "total={} parts={}", total, parts);
            }
        }
    }

    #[test]
    fn test_zero_items_yields_no_chunks() {
        let plan = plan(0, 4).unwrap();
        assert!(plan.is_empty());

        let (_, chunks) = split(Vec::<u32>::new(), WorkerBudget::new(4).unwrap());
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_fewer_items_than_workers_is_one_per_chunk() {
        let plan = plan(5, 8).unwrap();
        assert_eq!(plan.chunk_size(), 1);
        assert_eq!(plan.sizes(), vec![1; 5]);
    }

    #[test]
    fn test_zero_budget_is_partition_error() {
        assert!(matches!(plan(10, 0), Err(PipelineError::Partition(_))));
    }

    #[test]
    fn test_fractional_budget_truncates_with_minimum_one() {
        assert_eq!(WorkerBudget::from_fraction(2.75).unwrap().get(), 2);
        assert_eq!(WorkerBudget::from_fraction(0.25).unwrap().get(), 1);
        assert_eq!(WorkerBudget::from_fraction(0.0).unwrap().get(), 1);
        assert!(WorkerBudget::from_fraction(-1.0).is_err());
        assert!(WorkerBudget::from_fraction(f64::NAN).is_err());
        assert!(WorkerBudget::from_fraction(f64::INFINITY).is_err());
    }

    #[test]
    fn test_coverage_for_all_small_inputs() {
        for total in 1..=60usize {
            for budget in 1..=12usize {
                let items: Vec<usize> = (0..total).collect();
                let (plan, chunks) = split(items.clone(), WorkerBudget::new(budget).unwrap());

                assert!(plan.len() >= budget.min(total), "total={} budget={}", total, budget);

                let mut rebuilt = Vec::with_capacity(total);
                for (position, chunk) in chunks.iter().enumerate() {
                    assert_eq!(chunk.index, position);
                    assert_eq!(chunk.start, position * plan.chunk_size());
                    assert!(!chunk.is_empty());
                    assert!(chunk.len() < 2 * plan.chunk_size());
                    rebuilt.extend_from_slice(&chunk.items);
                }
                assert_eq!(rebuilt, items, "total={} budget={}", total, budget);
            }
        }
    }
}

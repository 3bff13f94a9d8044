use std::cmp::Ordering;
use std::collections::BinaryHeap;
use serde::{Deserialize, Serialize};
use crate::core::types::VectorId;
use crate::engine::MetricType;

/// One candidate: an id and its distance (similarity for inner product).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub id: VectorId,
    pub distance: f32,
}

impl Hit {
    pub fn new(id: VectorId, distance: f32) -> Self {
        Hit { id, distance }
    }
}

/// Result of a query: one ranked list per query vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub ids: Vec<Vec<VectorId>>,
    pub distances: Vec<Vec<f32>>,
}

impl QueryResult {
    pub fn from_hits(per_query: Vec<Vec<Hit>>) -> Self {
        let mut result = QueryResult::default();
        for hits in per_query {
            result.ids.push(hits.iter().map(|h| h.id).collect());
            result.distances.push(hits.iter().map(|h| h.distance).collect());
        }
        result
    }

    pub fn nq(&self) -> usize {
        self.ids.len()
    }
}

/// Hit with a "lower is better" key, ordered by (key, id).
#[derive(Debug, Clone, Copy)]
struct Ranked {
    key: f32,
    hit: Hit,
}

impl Ranked {
    fn new(metric: MetricType, hit: Hit) -> Self {
        let key = match metric {
            MetricType::L2 => hit.distance,
            MetricType::InnerProduct => -hit.distance,
        };
        Ranked { key, hit }
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .total_cmp(&other.key)
            .then_with(|| self.hit.id.cmp(&other.hit.id))
    }
}

/// Bounded collector keeping the best `k` hits; the heap top is the worst kept.
pub struct TopKCollector {
    heap: BinaryHeap<Ranked>,
    k: usize,
    metric: MetricType,
    pub total_collected: usize,
}

impl TopKCollector {
    pub fn new(k: usize, metric: MetricType) -> Self {
        TopKCollector {
            heap: BinaryHeap::with_capacity(k + 1),
            k,
            metric,
            total_collected: 0,
        }
    }

    pub fn collect(&mut self, hit: Hit) {
        self.total_collected += 1;
        if self.k == 0 {
            return;
        }

        let ranked = Ranked::new(self.metric, hit);
        if self.heap.len() < self.k {
            self.heap.push(ranked);
        } else if let Some(worst) = self.heap.peek() {
            if ranked < *worst {
                self.heap.pop();
                self.heap.push(ranked);
            }
        }
    }

    pub fn get_results(self) -> Vec<Hit> {
        self.heap.into_sorted_vec().into_iter().map(|r| r.hit).collect()
    }
}

/// k-way merge of per-segment lists that are each already best-first.
pub fn merge_sorted(metric: MetricType, k: usize, lists: &[Vec<Hit>]) -> Vec<Hit> {
    // Min-heap over the head of every list.
    let mut heads: BinaryHeap<std::cmp::Reverse<(Ranked, usize, usize)>> = lists
        .iter()
        .enumerate()
        .filter_map(|(list, hits)| {
            hits.first()
                .map(|h| std::cmp::Reverse((Ranked::new(metric, *h), list, 0)))
        })
        .collect();

    let mut merged = Vec::with_capacity(k);
    while merged.len() < k {
        let Some(std::cmp::Reverse((ranked, list, pos))) = heads.pop() else {
            break;
        };
        merged.push(ranked.hit);
        if let Some(next) = lists[list].get(pos + 1) {
            heads.push(std::cmp::Reverse((Ranked::new(metric, *next), list, pos + 1)));
        }
    }
    merged
}

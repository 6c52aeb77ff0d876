//! Cosine ranking of scoped candidates.
//!
//! Candidates are scored independently and ordered by a total order
//! (score, header flag, page, insertion order), so per-shard top-K heaps
//! merge to the same shortlist whatever the shard size.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{DoclinkError, Result};
use crate::model::{Candidate, ChunkMeta};

pub const DEFAULT_SHARD_SIZE: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub struct RankedChunk {
    pub meta: ChunkMeta,
    pub score: f32,
}

impl RankedChunk {
    /// `Less` means `self` ranks ahead of `other`.
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        // Adding 0.0 folds -0.0 into 0.0 so the two tie.
        (other.score + 0.0)
            .total_cmp(&(self.score + 0.0))
            .then_with(|| other.meta.is_header.cmp(&self.meta.is_header))
            .then_with(|| self.meta.page_number.cmp(&other.meta.page_number))
            .then_with(|| self.meta.chunk_id.cmp(&other.meta.chunk_id))
    }
}

// Heap order is rank order, so the heap's maximum is the weakest entry.
impl PartialEq for RankedChunk {
    fn eq(&self, other: &Self) -> bool {
        self.rank_cmp(other) == Ordering::Equal
    }
}

impl Eq for RankedChunk {}

impl PartialOrd for RankedChunk {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RankedChunk {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank_cmp(other)
    }
}

#[derive(Debug, Clone)]
pub struct SimilarityEngine {
    dimensions: usize,
    shard_size: usize,
}

impl SimilarityEngine {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            shard_size: DEFAULT_SHARD_SIZE,
        }
    }

    pub fn with_shard_size(mut self, shard_size: usize) -> Self {
        self.shard_size = shard_size.max(1);
        self
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Top `k` candidates by cosine similarity to `query`, best first.
    pub fn rank(
        &self,
        query: &[f32],
        candidates: &[Candidate],
        k: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<RankedChunk>> {
        self.check_dimensions(query.len())?;
        if let Some(bad) = query.iter().position(|v| !v.is_finite()) {
            return Err(DoclinkError::invalid(format!(
                "query embedding component {bad} is not finite"
            )));
        }
        if k == 0 || candidates.is_empty() {
            return Ok(Vec::new());
        }
        let k = k.min(candidates.len());
        let query_norm = norm(query);
        let shards = candidates
            .par_chunks(self.shard_size)
            .map(|shard| self.scan_shard(query, query_norm, shard, k, cancel))
            .collect::<Result<Vec<_>>>()?;
        let mut merged: BinaryHeap<RankedChunk> = BinaryHeap::with_capacity(k + 1);
        for shard in shards {
            for ranked in shard {
                push_bounded(&mut merged, ranked, k);
            }
        }
        let ranked = merged.into_sorted_vec();
        debug!(
            candidates = candidates.len(),
            kept = ranked.len(),
            k,
            "ranked candidates"
        );
        Ok(ranked)
    }

    fn scan_shard(
        &self,
        query: &[f32],
        query_norm: f32,
        shard: &[Candidate],
        k: usize,
        cancel: &CancelToken,
    ) -> Result<BinaryHeap<RankedChunk>> {
        cancel.check()?;
        let mut heap = BinaryHeap::with_capacity(k.min(shard.len()) + 1);
        for candidate in shard {
            self.check_dimensions(candidate.embedding.len())?;
            let score = cosine_with_norm(query, query_norm, &candidate.embedding);
            if !score.is_finite() {
                warn!(
                    target: "doclink::integrity",
                    chunk_id = candidate.meta.chunk_id,
                    file_id = %candidate.meta.file_id,
                    "stored embedding produced a non-finite score; chunk skipped"
                );
                continue;
            }
            push_bounded(
                &mut heap,
                RankedChunk {
                    meta: candidate.meta.clone(),
                    score,
                },
                k,
            );
        }
        Ok(heap)
    }

    fn check_dimensions(&self, actual: usize) -> Result<()> {
        if actual != self.dimensions {
            return Err(DoclinkError::DimensionMismatch {
                expected: self.dimensions,
                actual,
            });
        }
        Ok(())
    }
}

fn push_bounded(heap: &mut BinaryHeap<RankedChunk>, ranked: RankedChunk, k: usize) {
    if heap.len() < k {
        heap.push(ranked);
        return;
    }
    let replace = heap
        .peek()
        .is_some_and(|weakest| ranked.rank_cmp(weakest) == Ordering::Less);
    if replace {
        heap.pop();
        heap.push(ranked);
    }
}

fn norm(vector: &[f32]) -> f32 {
    vector.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Plain cosine similarity; zero-norm vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    cosine_with_norm(a, norm(a), b)
}

fn cosine_with_norm(a: &[f32], a_norm: f32, b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut b_norm = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        b_norm += y * y;
    }
    if a_norm == 0.0 || b_norm == 0.0 {
        return 0.0;
    }
    dot / (a_norm * b_norm.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileId;

    fn candidate(chunk_id: i64, page: u32, is_header: bool, embedding: Vec<f32>) -> Candidate {
        Candidate {
            meta: ChunkMeta {
                chunk_id,
                file_id: FileId::new("f"),
                file_name: "f.pdf".to_string(),
                ordinal: chunk_id as u32,
                page_number: page,
                is_header,
                is_table: false,
            },
            embedding,
        }
    }

    fn ids(ranked: &[RankedChunk]) -> Vec<i64> {
        ranked.iter().map(|r| r.meta.chunk_id).collect()
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn returns_top_k_best_first() {
        let engine = SimilarityEngine::new(2);
        let candidates = vec![
            candidate(1, 1, false, vec![0.0, 1.0]),
            candidate(2, 1, false, vec![1.0, 0.1]),
            candidate(3, 1, false, vec![1.0, 0.5]),
            candidate(4, 1, false, vec![-1.0, 0.0]),
        ];
        let ranked = engine
            .rank(&[1.0, 0.0], &candidates, 2, &CancelToken::new())
            .unwrap();
        assert_eq!(ids(&ranked), vec![2, 3]);
        assert!(ranked[0].score >= ranked[1].score);
    }

    #[test]
    fn header_wins_ties_then_page_then_insertion() {
        let engine = SimilarityEngine::new(2);
        let same = vec![1.0, 1.0];
        let candidates = vec![
            candidate(1, 3, false, same.clone()),
            candidate(2, 2, false, same.clone()),
            candidate(3, 5, true, same.clone()),
            candidate(4, 2, false, same.clone()),
        ];
        let ranked = engine
            .rank(&[1.0, 1.0], &candidates, 4, &CancelToken::new())
            .unwrap();
        assert_eq!(ids(&ranked), vec![3, 2, 4, 1]);
    }

    #[test]
    fn negative_zero_score_still_ties() {
        let body = RankedChunk {
            meta: candidate(1, 1, false, vec![0.0, 1.0]).meta,
            score: 0.0,
        };
        let header = RankedChunk {
            meta: candidate(2, 4, true, vec![0.0, 1.0]).meta,
            score: -0.0,
        };
        assert_eq!(header.rank_cmp(&body), Ordering::Less);
        assert_eq!(body.rank_cmp(&header), Ordering::Greater);
    }

    #[test]
    fn oversized_k_is_clamped_to_the_candidate_count() {
        let engine = SimilarityEngine::new(2);
        let candidates = vec![
            candidate(1, 1, false, vec![1.0, 0.0]),
            candidate(2, 2, false, vec![0.0, 1.0]),
        ];
        for k in [usize::MAX, usize::MAX / 2, 100_000_000] {
            let ranked = engine
                .rank(&[1.0, 0.0], &candidates, k, &CancelToken::new())
                .unwrap();
            assert_eq!(ids(&ranked), vec![1, 2]);
        }
    }

    #[test]
    fn shard_size_does_not_change_result() {
        let candidates: Vec<Candidate> = (0..200)
            .map(|i| {
                let x = ((i * 37) % 17) as f32 - 8.0;
                let y = ((i * 11) % 13) as f32 - 6.0;
                candidate(i, (i % 7) as u32 + 1, i % 5 == 0, vec![x, y, 1.0])
            })
            .collect();
        let query = [0.3, -0.7, 0.2];
        let baseline = SimilarityEngine::new(3)
            .with_shard_size(usize::MAX)
            .rank(&query, &candidates, 25, &CancelToken::new())
            .unwrap();
        for shard_size in [1, 3, 16, 64, 199] {
            let ranked = SimilarityEngine::new(3)
                .with_shard_size(shard_size)
                .rank(&query, &candidates, 25, &CancelToken::new())
                .unwrap();
            assert_eq!(ids(&ranked), ids(&baseline), "shard size {shard_size}");
        }
    }

    #[test]
    fn dimension_mismatch_fails_fast() {
        let engine = SimilarityEngine::new(3);
        let err = engine
            .rank(&[1.0, 0.0], &[], 5, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(
            err,
            DoclinkError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));

        let candidates = vec![candidate(1, 1, false, vec![1.0, 0.0])];
        let err = engine
            .rank(&[1.0, 0.0, 0.0], &candidates, 5, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, DoclinkError::DimensionMismatch { .. }));
    }

    #[test]
    fn non_finite_query_is_rejected() {
        let engine = SimilarityEngine::new(2);
        let err = engine
            .rank(&[f32::NAN, 0.0], &[], 1, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, DoclinkError::InvalidRequest(_)));
    }

    #[test]
    fn cancelled_scan_stops() {
        let engine = SimilarityEngine::new(2);
        let token = CancelToken::new();
        token.cancel();
        let candidates = vec![candidate(1, 1, false, vec![1.0, 0.0])];
        let err = engine.rank(&[1.0, 0.0], &candidates, 1, &token).unwrap_err();
        assert!(matches!(err, DoclinkError::Cancelled));
    }
}

use crate::error::IndexError;
use crate::models::{RecordFilter, RecordSelector, SearchHit, VectorRecord};
use async_trait::async_trait;

/// Storage primitives a vector backend provides. Batching, id derivation and rebuilds
/// live in `VectorStore`.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Inserts records, replacing any stored record with the same id.
    async fn insert(&self, records: &[VectorRecord]) -> Result<usize, IndexError>;

    async fn delete(&self, selector: &RecordSelector) -> Result<usize, IndexError>;

    /// Up to `fetch` hits ordered by descending cosine similarity.
    async fn search(
        &self,
        query: &[f32],
        fetch: usize,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<SearchHit>, IndexError>;

    async fn count(&self) -> Result<usize, IndexError>;

    /// Drops every record and recreates empty storage.
    async fn reset(&self) -> Result<(), IndexError>;
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    let mut dot = 0f32;
    let mut left_norm = 0f32;
    let mut right_norm = 0f32;
    for (a, b) in left.iter().zip(right) {
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }

    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm.sqrt() * right_norm.sqrt())
}

/// Sorts hits best-first and keeps at most `fetch`; ties break on id for stable pages.
pub(crate) fn rank_hits(mut hits: Vec<SearchHit>, fetch: usize) -> Vec<SearchHit> {
    hits.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| left.id.cmp(&right.id))
    });
    hits.truncate(fetch);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_parallel_vectors_is_one() {
        let score = cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]);
        assert!((score - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }
}

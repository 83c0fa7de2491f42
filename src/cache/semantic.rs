//! Similarity-match tier, bucketed by context depth.
//!
//! An entry written at depth `d` is only ever compared against queries at
//! depth `d`; buckets never see each other.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::conversation::Message;

/// Float slack when comparing a score against the threshold, so that a
/// vector pair built to sit exactly on the threshold is not lost to
/// rounding.
const SCORE_EPSILON: f32 = 1e-6;

/// Cosine similarity clamped to `[0, 1]`. Mismatched or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticEntry {
    /// Opaque document id; entries are never addressed by content.
    pub id: String,
    pub embedding: Vec<f32>,
    pub depth: usize,
    #[serde(default)]
    pub topics: Vec<String>,
    /// Prior messages plus the new user message, as they were at write time.
    #[serde(default)]
    pub context: Vec<Message>,
    pub new_message: String,
    pub response: String,
    pub token_count: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SemanticEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Best match returned by [`SemanticIndex::search`].
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticMatch {
    pub document_id: String,
    pub score: f32,
    pub response: String,
    pub token_count: u32,
}

/// Depth → entries. Linear scan per bucket; buckets are capped in size.
#[derive(Debug)]
pub struct SemanticIndex {
    buckets: BTreeMap<usize, Vec<SemanticEntry>>,
    max_per_bucket: usize,
}

impl SemanticIndex {
    pub fn new(max_per_bucket: usize) -> Self {
        Self {
            buckets: BTreeMap::new(),
            max_per_bucket: max_per_bucket.max(1),
        }
    }

    /// Best unexpired entry in the `depth` bucket scoring at least
    /// `threshold`. Ties go to the higher score, then the more recent entry.
    pub fn search(
        &self,
        query: &[f32],
        depth: usize,
        threshold: f32,
        now: DateTime<Utc>,
    ) -> Option<SemanticMatch> {
        let bucket = self.buckets.get(&depth)?;
        bucket
            .iter()
            .filter(|e| !e.is_expired(now))
            .map(|e| (cosine_similarity(query, &e.embedding), e))
            .filter(|(score, _)| *score + SCORE_EPSILON >= threshold)
            .max_by(|(sa, ea), (sb, eb)| {
                sa.partial_cmp(sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(ea.created_at.cmp(&eb.created_at))
            })
            .map(|(score, e)| SemanticMatch {
                document_id: e.id.clone(),
                score,
                response: e.response.clone(),
                token_count: e.token_count,
            })
    }

    /// Add an entry to its depth bucket, evicting the oldest entry when the
    /// bucket is full.
    pub fn insert(&mut self, entry: SemanticEntry) {
        let bucket = self.buckets.entry(entry.depth).or_default();
        if bucket.len() >= self.max_per_bucket {
            if let Some(oldest) = bucket
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(i, _)| i)
            {
                debug!(depth = entry.depth, "Semantic bucket full, evicting oldest");
                bucket.swap_remove(oldest);
            }
        }
        bucket.push(entry);
    }

    pub fn get(&self, id: &str) -> Option<&SemanticEntry> {
        self.buckets.values().flatten().find(|e| e.id == id)
    }

    /// Drop expired entries and entries that cannot match anything (empty
    /// vectors, or a dimension that disagrees with the rest of the bucket).
    /// Returns how many were removed.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for (depth, bucket) in self.buckets.iter_mut() {
            let before = bucket.len();
            let dim = dominant_dimension(bucket);
            bucket.retain(|e| {
                !e.is_expired(now)
                    && !e.embedding.is_empty()
                    && e.depth == *depth
                    && Some(e.embedding.len()) == dim
            });
            removed += before - bucket.len();
        }
        self.buckets.retain(|_, b| !b.is_empty());
        removed
    }

    pub fn entries(&self) -> impl Iterator<Item = &SemanticEntry> {
        self.buckets.values().flatten()
    }

    /// Entry count per depth.
    pub fn bucket_sizes(&self) -> BTreeMap<usize, usize> {
        self.buckets.iter().map(|(d, b)| (*d, b.len())).collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn dominant_dimension(bucket: &[SemanticEntry]) -> Option<usize> {
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for e in bucket.iter().filter(|e| !e.embedding.is_empty()) {
        *counts.entry(e.embedding.len()).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(dim, _)| dim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(id: &str, embedding: Vec<f32>, depth: usize, at: DateTime<Utc>) -> SemanticEntry {
        SemanticEntry {
            id: id.to_string(),
            embedding,
            depth,
            topics: vec![],
            context: vec![],
            new_message: "q".into(),
            response: format!("answer {id}"),
            token_count: 2,
            created_at: at,
            expires_at: at + Duration::days(1),
        }
    }

    /// Unit vector whose cosine with `[1, 0]` is `cos`.
    fn at_cosine(cos: f32) -> Vec<f32> {
        vec![cos, (1.0 - cos * cos).sqrt()]
    }

    #[test]
    fn test_cosine_similarity_edges() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_threshold_boundary() {
        let now = Utc::now();
        let mut hit = SemanticIndex::new(10);
        hit.insert(entry("a", at_cosine(0.85), 4, now));
        assert!(hit.search(&[1.0, 0.0], 4, 0.85, now).is_some());

        let mut miss = SemanticIndex::new(10);
        miss.insert(entry("b", at_cosine(0.84), 4, now));
        assert!(miss.search(&[1.0, 0.0], 4, 0.85, now).is_none());
    }

    #[test]
    fn test_buckets_are_isolated() {
        let now = Utc::now();
        let mut index = SemanticIndex::new(10);
        index.insert(entry("a", vec![1.0, 0.0], 3, now));
        assert!(index.search(&[1.0, 0.0], 3, 0.85, now).is_some());
        assert!(index.search(&[1.0, 0.0], 4, 0.85, now).is_none());
    }

    #[test]
    fn test_best_score_then_most_recent() {
        let now = Utc::now();
        let mut index = SemanticIndex::new(10);
        index.insert(entry("close", at_cosine(0.9), 5, now));
        index.insert(entry("closer", at_cosine(0.95), 5, now));
        let best = index.search(&[1.0, 0.0], 5, 0.85, now).unwrap();
        assert_eq!(best.document_id, "closer");

        let mut tied = SemanticIndex::new(10);
        tied.insert(entry("old", vec![1.0, 0.0], 5, now - Duration::hours(1)));
        tied.insert(entry("new", vec![1.0, 0.0], 5, now));
        assert_eq!(
            tied.search(&[1.0, 0.0], 5, 0.85, now).unwrap().document_id,
            "new"
        );
    }

    #[test]
    fn test_expired_entries_never_match() {
        let now = Utc::now();
        let mut index = SemanticIndex::new(10);
        index.insert(entry("a", vec![1.0, 0.0], 3, now));
        let later = now + Duration::days(2);
        assert!(index.search(&[1.0, 0.0], 3, 0.85, later).is_none());
        assert_eq!(index.prune(later), 1);
        assert!(index.is_empty());
    }

    #[test]
    fn test_bucket_cap_evicts_oldest() {
        let now = Utc::now();
        let mut index = SemanticIndex::new(2);
        index.insert(entry("first", vec![1.0, 0.0], 3, now - Duration::hours(2)));
        index.insert(entry("second", vec![0.0, 1.0], 3, now - Duration::hours(1)));
        index.insert(entry("third", vec![1.0, 1.0], 3, now));
        assert_eq!(index.len(), 2);
        assert!(index.get("first").is_none());
        assert!(index.get("third").is_some());
    }

    #[test]
    fn test_prune_drops_odd_dimensions() {
        let now = Utc::now();
        let mut index = SemanticIndex::new(10);
        index.insert(entry("a", vec![1.0, 0.0], 3, now));
        index.insert(entry("b", vec![0.0, 1.0], 3, now));
        index.insert(entry("c", vec![1.0, 0.0, 0.0], 3, now));
        index.insert(entry("d", vec![], 4, now));
        assert_eq!(index.prune(now), 2);
        assert_eq!(index.bucket_sizes().get(&3), Some(&2));
        assert!(index.bucket_sizes().get(&4).is_none());
    }
}

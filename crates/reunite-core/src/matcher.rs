//! Gallery search: greedy nearest-neighbour with a rejection threshold.

use crate::types::{Decision, FaceEmbedding, GalleryEntry, MatchResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Euclidean threshold for L2-normalized ArcFace embeddings.
///
/// On unit vectors `d² = 2 − 2·cos`, so 1.10 corresponds to a cosine
/// similarity of about 0.395.
pub const DEFAULT_EUCLIDEAN_THRESHOLD: f32 = 1.10;
/// Cosine-distance threshold (`1 − cos`), equivalent to similarity ≥ 0.40.
pub const DEFAULT_COSINE_THRESHOLD: f32 = 0.60;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("gallery is empty")]
    EmptyGallery,
    #[error("embedding dimension mismatch: query has {expected}, gallery entry {identity} has {actual}")]
    DimensionMismatch {
        identity: String,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    /// `1 − cosine similarity`, in [0, 2].
    Cosine,
}

impl DistanceMetric {
    pub fn distance(self, a: &FaceEmbedding, b: &FaceEmbedding) -> f32 {
        match self {
            DistanceMetric::Euclidean => a.euclidean_distance(b),
            DistanceMetric::Cosine => 1.0 - a.similarity(b),
        }
    }

    /// Documented default acceptance threshold for this metric.
    pub fn default_threshold(self) -> f32 {
        match self {
            DistanceMetric::Euclidean => DEFAULT_EUCLIDEAN_THRESHOLD,
            DistanceMetric::Cosine => DEFAULT_COSINE_THRESHOLD,
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceMetric::Euclidean => f.write_str("euclidean"),
            DistanceMetric::Cosine => f.write_str("cosine"),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(DistanceMetric::Euclidean),
            "cosine" => Ok(DistanceMetric::Cosine),
            other => Err(format!("unknown distance metric: {other} (expected euclidean or cosine)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatcherConfig {
    pub metric: DistanceMetric,
    /// Maximum distance accepted as a match (inclusive).
    pub threshold: f32,
}

impl MatcherConfig {
    pub fn new(metric: DistanceMetric, threshold: f32) -> Self {
        Self { metric, threshold }
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        let metric = DistanceMetric::default();
        Self { metric, threshold: metric.default_threshold() }
    }
}

/// Linear-scan nearest-neighbour matcher.
///
/// Every gallery entry is visited. The first entry at the minimum distance
/// wins; it is accepted when that distance is at most the threshold.
#[derive(Debug, Clone, Default)]
pub struct GalleryMatcher {
    config: MatcherConfig,
}

impl GalleryMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> MatcherConfig {
        self.config
    }

    pub fn find_match(
        &self,
        gallery: &[GalleryEntry],
        query: &FaceEmbedding,
    ) -> Result<MatchResult, MatchError> {
        if gallery.is_empty() {
            return Err(MatchError::EmptyGallery);
        }
        check_dimensions(gallery, query.dimension())?;

        let mut best_idx = 0;
        let mut best_dist = f32::NAN;

        for (i, entry) in gallery.iter().enumerate() {
            let dist = self.config.metric.distance(query, &entry.embedding);
            // A NaN distance never displaces a real one. Strict `<` keeps the
            // earliest entry on ties.
            if i == 0 || (!dist.is_nan() && (best_dist.is_nan() || dist < best_dist)) {
                best_idx = i;
                best_dist = dist;
            }
        }

        let best = &gallery[best_idx];
        let decision = if best_dist <= self.config.threshold {
            Decision::Match
        } else {
            Decision::NoMatch
        };

        tracing::debug!(
            gallery = gallery.len(),
            identity = %best.identity,
            distance = best_dist,
            threshold = self.config.threshold,
            metric = %self.config.metric,
            ?decision,
            "gallery search complete"
        );

        Ok(MatchResult {
            identity: best.identity.clone(),
            label: best.label.clone(),
            distance: best_dist,
            decision,
        })
    }
}

/// Fail on the first gallery entry whose length differs from `expected`.
pub fn check_dimensions(gallery: &[GalleryEntry], expected: usize) -> Result<(), MatchError> {
    match gallery.iter().find(|e| e.embedding.dimension() != expected) {
        Some(entry) => Err(MatchError::DimensionMismatch {
            identity: entry.identity.clone(),
            expected,
            actual: entry.embedding.dimension(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, values: &[f32]) -> GalleryEntry {
        GalleryEntry::new(id, FaceEmbedding::new(values.to_vec()))
    }

    fn euclid(threshold: f32) -> GalleryMatcher {
        GalleryMatcher::new(MatcherConfig::new(DistanceMetric::Euclidean, threshold))
    }

    fn two_point_gallery() -> Vec<GalleryEntry> {
        vec![entry("1", &[0.0, 0.0]), entry("2", &[10.0, 10.0])]
    }

    #[test]
    fn test_near_query_matches_first() {
        let query = FaceEmbedding::new(vec![0.1, 0.1]);
        let result = euclid(1.0).find_match(&two_point_gallery(), &query).unwrap();
        assert_eq!(result.decision, Decision::Match);
        assert_eq!(result.identity, "1");
        assert!((result.distance - 0.141_421_36).abs() < 1e-5, "distance = {}", result.distance);
    }

    #[test]
    fn test_midpoint_query_is_no_match() {
        let query = FaceEmbedding::new(vec![5.0, 5.0]);
        let result = euclid(1.0).find_match(&two_point_gallery(), &query).unwrap();
        assert_eq!(result.decision, Decision::NoMatch);
        assert!((result.distance - 50f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn test_tie_goes_to_first_entry() {
        let gallery = two_point_gallery();
        let query = FaceEmbedding::new(vec![5.0, 5.0]);
        let matcher = euclid(100.0);
        for _ in 0..10 {
            let result = matcher.find_match(&gallery, &query).unwrap();
            assert_eq!(result.identity, "1");
            assert!(result.is_match());
        }

        let reversed: Vec<_> = gallery.iter().rev().cloned().collect();
        assert_eq!(matcher.find_match(&reversed, &query).unwrap().identity, "2");
    }

    #[test]
    fn test_duplicate_embeddings_first_wins() {
        let gallery = vec![
            entry("far", &[9.0, 9.0]),
            entry("a", &[1.0, 1.0]),
            entry("b", &[1.0, 1.0]),
        ];
        let query = FaceEmbedding::new(vec![1.0, 1.0]);
        let result = euclid(0.5).find_match(&gallery, &query).unwrap();
        assert_eq!(result.identity, "a");
        assert_eq!(result.distance, 0.0);
    }

    #[test]
    fn test_best_match_found_anywhere_in_gallery() {
        let gallery = vec![
            entry("1", &[0.0, 1.0, 0.0]),
            entry("2", &[0.0, 0.0, 1.0]),
            entry("3", &[1.0, 0.0, 0.0]).with_label("match"),
        ];
        let query = FaceEmbedding::new(vec![1.0, 0.0, 0.0]);
        let result = euclid(0.5).find_match(&gallery, &query).unwrap();
        assert_eq!(result.identity, "3");
        assert_eq!(result.label.as_deref(), Some("match"));
    }

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        let gallery = vec![entry("1", &[0.0, 0.0])];
        let query = FaceEmbedding::new(vec![3.0, 4.0]);
        assert!(euclid(5.0).find_match(&gallery, &query).unwrap().is_match());
        assert!(!euclid(4.999).find_match(&gallery, &query).unwrap().is_match());
    }

    #[test]
    fn test_threshold_monotonic() {
        let gallery = vec![entry("1", &[0.0, 0.0]), entry("2", &[4.0, 1.0])];
        let queries = [[0.5, 0.5], [2.0, 2.0], [3.0, 3.0], [10.0, -4.0]];
        let thresholds = [0.0, 0.5, 1.0, 2.0, 3.0, 8.0, 20.0];

        for q in queries {
            let query = FaceEmbedding::new(q.to_vec());
            let mut seen_match = false;
            for t in thresholds {
                let result = euclid(t).find_match(&gallery, &query).unwrap();
                if seen_match {
                    assert!(result.is_match(), "query {q:?} lost its match at T={t}");
                }
                seen_match |= result.is_match();
            }
        }
    }

    #[test]
    fn test_empty_gallery() {
        let query = FaceEmbedding::new(vec![1.0, 0.0]);
        assert_eq!(euclid(1.0).find_match(&[], &query), Err(MatchError::EmptyGallery));
    }

    #[test]
    fn test_dimension_mismatch_anywhere() {
        let query = FaceEmbedding::new(vec![0.0, 0.0]);
        // The exact match comes first; the bad entry must still be caught.
        let gallery = vec![entry("ok", &[0.0, 0.0]), entry("bad", &[0.0, 0.0, 0.0])];
        let err = euclid(1.0).find_match(&gallery, &query).unwrap_err();
        assert_eq!(
            err,
            MatchError::DimensionMismatch { identity: "bad".into(), expected: 2, actual: 3 }
        );
    }

    #[test]
    fn test_dimension_mismatch_shorter_entry() {
        let query = FaceEmbedding::new(vec![0.0, 0.0, 0.0]);
        let gallery = vec![entry("short", &[0.0])];
        assert!(matches!(
            euclid(10.0).find_match(&gallery, &query),
            Err(MatchError::DimensionMismatch { actual: 1, .. })
        ));
    }

    #[test]
    fn test_nan_entry_never_wins() {
        let gallery = vec![entry("nan", &[f32::NAN, 0.0]), entry("real", &[3.0, 0.0])];
        let query = FaceEmbedding::new(vec![0.0, 0.0]);
        let result = euclid(5.0).find_match(&gallery, &query).unwrap();
        assert_eq!(result.identity, "real");
        assert!(result.is_match());

        let only_nan = vec![entry("nan", &[f32::NAN, 0.0])];
        let result = euclid(f32::MAX).find_match(&only_nan, &query).unwrap();
        assert_eq!(result.decision, Decision::NoMatch);
    }

    #[test]
    fn test_cosine_metric() {
        let gallery = vec![entry("orth", &[0.0, 1.0]), entry("same-dir", &[5.0, 0.0])];
        let query = FaceEmbedding::new(vec![1.0, 0.0]);
        let matcher = GalleryMatcher::new(MatcherConfig::new(DistanceMetric::Cosine, 0.1));
        let result = matcher.find_match(&gallery, &query).unwrap();
        assert_eq!(result.identity, "same-dir");
        assert!(result.distance.abs() < 1e-6);
        assert!(result.is_match());
    }

    #[test]
    fn test_default_config() {
        let config = MatcherConfig::default();
        assert_eq!(config.metric, DistanceMetric::Euclidean);
        assert_eq!(config.threshold, DEFAULT_EUCLIDEAN_THRESHOLD);
    }

    #[test]
    fn test_metric_parse() {
        assert_eq!("Euclidean".parse::<DistanceMetric>().unwrap(), DistanceMetric::Euclidean);
        assert_eq!(" cosine ".parse::<DistanceMetric>().unwrap(), DistanceMetric::Cosine);
        assert!("manhattan".parse::<DistanceMetric>().is_err());
        assert_eq!(DistanceMetric::Cosine.to_string(), "cosine");
    }
}

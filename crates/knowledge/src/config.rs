//! Ranking, search and migration parameters.

use chrono::{DateTime, Utc};
use keepsake::KeepsakeError;
use std::time::Duration;

use crate::Result;

/// Longest accepted result cache lifetime (30 days).
pub const MAX_CACHE_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Knobs for hybrid ranking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankingConfig {
    /// Share of the combined score given to temporal relevance.
    pub temporal_weight: f32,
    /// Temporal share used when the query itself mentions a time.
    pub temporal_query_weight: f32,
    /// Minimum cosine similarity on the first pass.
    pub similarity_threshold: f32,
    /// Minimum cosine similarity on the relaxed retry.
    pub relaxed_threshold: f32,
    /// Vector candidates pulled on the first pass.
    pub candidate_count: usize,
    /// Vector candidates pulled on the relaxed retry.
    pub relaxed_candidate_count: usize,
    /// Fewer results than this triggers relaxation, then the keyword channel.
    pub min_results: usize,
    pub max_results: usize,
    /// Result cache lifetime; 0 disables caching.
    pub cache_ttl_secs: u64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            temporal_weight: 0.3,
            temporal_query_weight: 0.5,
            similarity_threshold: 0.35,
            relaxed_threshold: 0.15,
            candidate_count: 40,
            relaxed_candidate_count: 100,
            min_results: 3,
            max_results: 20,
            cache_ttl_secs: 300,
        }
    }
}

impl RankingConfig {
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f32| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(KeepsakeError::InvalidInput(format!(
                    "ranking: `{name}` must be within [0, 1], got {v}"
                )))
            }
        };
        unit("temporal_weight", self.temporal_weight)?;
        unit("temporal_query_weight", self.temporal_query_weight)?;

        if !(-1.0..=1.0).contains(&self.similarity_threshold)
            || !(-1.0..=1.0).contains(&self.relaxed_threshold)
        {
            return Err(KeepsakeError::InvalidInput(
                "ranking: similarity thresholds must be within [-1, 1]".to_string(),
            ));
        }
        if self.relaxed_threshold > self.similarity_threshold {
            return Err(KeepsakeError::InvalidInput(
                "ranking: `relaxed_threshold` must not exceed `similarity_threshold`".to_string(),
            ));
        }
        if self.candidate_count == 0 || self.max_results == 0 {
            return Err(KeepsakeError::InvalidInput(
                "ranking: `candidate_count` and `max_results` must be >= 1".to_string(),
            ));
        }
        if self.relaxed_candidate_count < self.candidate_count {
            return Err(KeepsakeError::InvalidInput(
                "ranking: `relaxed_candidate_count` must be >= `candidate_count`".to_string(),
            ));
        }
        if self.cache_ttl_secs > MAX_CACHE_TTL_SECS {
            return Err(KeepsakeError::InvalidInput(format!(
                "ranking: `cache_ttl_secs` must be <= {MAX_CACHE_TTL_SECS}, got {}",
                self.cache_ttl_secs
            )));
        }
        Ok(())
    }
}

/// Per-call overrides for [`KnowledgeBase::search`](crate::KnowledgeBase::search).
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    pub max_results: Option<usize>,
    pub similarity_threshold: Option<f32>,
    pub relaxed_threshold: Option<f32>,
    /// Evaluate temporal relevance at this instant instead of the clock.
    pub at: Option<DateTime<Utc>>,
    pub use_cache: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_results: None,
            similarity_threshold: None,
            relaxed_threshold: None,
            at: None,
            use_cache: true,
        }
    }
}

impl SearchOptions {
    pub fn limit(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }

    pub fn uncached(mut self) -> Self {
        self.use_cache = false;
        self
    }

    /// Stable string covering every field that changes the result.
    pub(crate) fn fingerprint(&self) -> String {
        format!(
            "{:?}|{:?}|{:?}|{}",
            self.max_results,
            self.similarity_threshold,
            self.relaxed_threshold,
            self.at.map(|t| t.to_rfc3339()).unwrap_or_default()
        )
    }

    /// The effective parameters after applying overrides to `base`.
    pub(crate) fn resolve(&self, base: &RankingConfig) -> RankingConfig {
        let mut cfg = *base;
        if let Some(n) = self.max_results {
            cfg.max_results = n.max(1);
        }
        if let Some(t) = self.similarity_threshold {
            cfg.similarity_threshold = t;
        }
        if let Some(t) = self.relaxed_threshold {
            cfg.relaxed_threshold = t;
        }
        cfg.relaxed_threshold = cfg.relaxed_threshold.min(cfg.similarity_threshold);
        cfg
    }
}

/// Batch re-indexing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationConfig {
    pub batch_size: usize,
    /// Pause between batches, for embedding rate limits.
    pub batch_delay: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_delay: Duration::from_millis(250),
        }
    }
}

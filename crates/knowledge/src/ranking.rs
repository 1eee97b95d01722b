//! Hybrid ranking: synonym-expanded vector search weighted by temporal
//! relevance, with a keyword channel behind it.
//!
//! Pipeline per query:
//!
//! 1. tokenize and expand the query through the synonym table;
//! 2. embed the expanded text and pull vector candidates above the
//!    similarity threshold;
//! 3. hard-filter on query tags (non-empty intersection);
//! 4. `combined = similarity * (1 - w) + temporal * w`, with `w` raised when
//!    the query itself mentions a time;
//! 5. drop candidates whose dates contradict the query's temporal intent;
//! 6. stable sort by `combined`, truncate;
//! 7. too few results: retry once with the relaxed threshold and a wider
//!    candidate pool, then top up from the keyword channel.

use chrono::{DateTime, Utc};
use keepsake::{
    normalize_tags, score_references, EntryId, ExpandedQuery, KeepsakeError, KnowledgeEntry,
    QueryCache,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use crate::{Intent, KnowledgeBase, Result, SearchOptions};

/// Days either side of "now" that count as current.
const CURRENT_WINDOW_DAYS: i64 = 7;

static FUTURE_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(will|next|tomorrow|upcoming|soon|later|coming|future|planned)\b")
        .expect("Invalid regex")
});

static PAST_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(was|were|ago|yesterday|last|previous|previously|earlier|past)\b")
        .expect("Invalid regex")
});

static CURRENT_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(today|tonight|now|current|currently|this\s+week)\b").expect("Invalid regex")
});

/// What period a query is asking about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    Future,
    Past,
    Current,
    General,
}

impl QueryIntent {
    /// Keyword heuristic. A query naming today or now is Current whatever
    /// else it says; otherwise future words win over past words.
    pub fn classify(query: &str) -> Self {
        if CURRENT_WORDS.is_match(query) {
            QueryIntent::Current
        } else if FUTURE_WORDS.is_match(query) {
            QueryIntent::Future
        } else if PAST_WORDS.is_match(query) {
            QueryIntent::Past
        } else {
            QueryIntent::General
        }
    }

    /// Entries without temporal references always pass.
    pub fn admits(self, entry: &KnowledgeEntry, now: DateTime<Utc>) -> bool {
        let refs = &entry.temporal_info;
        if refs.is_empty() {
            return true;
        }
        match self {
            QueryIntent::General => true,
            QueryIntent::Future => refs.iter().any(|r| r.is_recurring() || r.is_future_at(now)),
            QueryIntent::Past => refs.iter().any(|r| r.is_past_at(now)),
            QueryIntent::Current => refs.iter().any(|r| {
                r.is_recurring()
                    || r.resolved_date.is_some_and(|d| {
                        (d.date_naive() - now.date_naive()).num_days().abs() <= CURRENT_WINDOW_DAYS
                    })
            }),
        }
    }
}

/// Which retrieval channel produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchChannel {
    Vector,
    Keyword,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// The entry, with temporal references re-evaluated at query time.
    pub entry: KnowledgeEntry,
    pub similarity: f32,
    pub temporal_relevance: f32,
    pub combined_score: f32,
    /// Human-readable explanation of the entry's dates.
    pub temporal_context: String,
    pub is_temporally_relevant: bool,
    /// Next occurrence for recurring matches.
    pub next_occurrence: Option<DateTime<Utc>>,
    pub channel: MatchChannel,
}

/// Fixed inputs of one ranking run.
struct RankContext<'a> {
    now: DateTime<Utc>,
    intent: QueryIntent,
    weight: f32,
    tags: Option<&'a BTreeSet<String>>,
}

impl RankContext<'_> {
    fn admits(&self, entry: &KnowledgeEntry) -> bool {
        if entry.intent == Intent::Delete {
            return false;
        }
        if let Some(tags) = self.tags {
            if entry.tags.is_disjoint(tags) {
                return false;
            }
        }
        self.intent.admits(entry, self.now)
    }

    fn score(&self, mut entry: KnowledgeEntry, similarity: f32, channel: MatchChannel) -> SearchResult {
        let now = self.now;
        for r in entry.temporal_info.iter_mut() {
            r.reevaluate(now, entry.created_at);
        }
        // A failed parse stored the neutral score with no references; keep it.
        let temporal = if entry.temporal_info.is_empty() {
            entry.temporal_relevance_score
        } else {
            score_references(&entry.temporal_info, now, entry.created_at)
        };

        let refs = &entry.temporal_info;
        let temporal_context = refs
            .iter()
            .map(|r| r.describe(now))
            .collect::<Vec<_>>()
            .join("; ");
        let is_temporally_relevant = refs.iter().any(|r| {
            r.is_recurring()
                || r.is_future_at(now)
                || r.resolved_date.is_some_and(|d| {
                    (d.date_naive() - now.date_naive()).num_days().abs() <= CURRENT_WINDOW_DAYS
                })
        });
        let next_occurrence = refs.iter().filter_map(|r| r.next_occurrence(now)).min();

        SearchResult {
            combined_score: combine(similarity, temporal, self.weight),
            similarity,
            temporal_relevance: temporal,
            temporal_context,
            is_temporally_relevant,
            next_occurrence,
            channel,
            entry,
        }
    }
}

pub(crate) fn combine(similarity: f32, temporal: f32, weight: f32) -> f32 {
    similarity * (1.0 - weight) + temporal * weight
}

/// Descending by combined score; equal scores keep their input order.
pub(crate) fn sort_by_combined(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(Ordering::Equal)
    });
}

impl KnowledgeBase {
    /// Search current entries of `account_id`.
    ///
    /// `tags`, when given and non-empty, is a hard filter: only entries
    /// sharing at least one tag are returned.
    pub fn search(
        &self,
        account_id: &str,
        query: &str,
        tags: Option<&[String]>,
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        if account_id.trim().is_empty() {
            return Err(KeepsakeError::InvalidInput("account id must not be blank".into()));
        }
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let tag_filter: Option<BTreeSet<String>> =
            tags.map(normalize_tags).filter(|t| !t.is_empty());
        let cache_key = {
            let tag_list: Vec<String> = tag_filter.iter().flatten().cloned().collect();
            QueryCache::<Vec<SearchResult>>::key(account_id, query, &tag_list, &options.fingerprint())
        };
        if options.use_cache {
            if let Some(hit) = self.cache.get(&cache_key) {
                debug!(account = account_id, query, "search cache hit");
                return Ok(hit);
            }
        }

        let cfg = options.resolve(&self.config);
        let expanded = self.expander.expand_query(query);
        let ctx = RankContext {
            now: options.at.unwrap_or_else(|| self.clock.now()),
            intent: QueryIntent::classify(query),
            weight: if self.parser.mentions_time(query) {
                cfg.temporal_query_weight
            } else {
                cfg.temporal_weight
            },
            tags: tag_filter.as_ref(),
        };
        debug!(
            account = account_id,
            query,
            expanded = expanded.expanded.as_str(),
            intent = ?ctx.intent,
            weight = ctx.weight,
            "searching"
        );

        let mut results = match self.embedder.embed(&expanded.expanded) {
            Ok(query_vector) => {
                let primary = self.vector_pass(
                    account_id,
                    &query_vector,
                    cfg.similarity_threshold,
                    cfg.candidate_count,
                    &ctx,
                )?;
                if primary.len() >= cfg.min_results {
                    primary
                } else {
                    info!(
                        account = account_id,
                        found = primary.len(),
                        threshold = cfg.relaxed_threshold,
                        "too few results; relaxing similarity threshold"
                    );
                    self.vector_pass(
                        account_id,
                        &query_vector,
                        cfg.relaxed_threshold,
                        cfg.relaxed_candidate_count,
                        &ctx,
                    )?
                }
            }
            Err(e) => {
                warn!(error = %e, "query embedding failed; falling back to keyword search");
                Vec::new()
            }
        };

        if results.len() < cfg.min_results {
            self.merge_keyword_hits(
                account_id,
                &expanded,
                cfg.relaxed_candidate_count,
                &ctx,
                &mut results,
            )?;
        }
        results.truncate(cfg.max_results);

        if options.use_cache {
            self.cache.insert(cache_key, results.clone());
        }
        Ok(results)
    }

    fn vector_pass(
        &self,
        account_id: &str,
        query_vector: &[f32],
        threshold: f32,
        count: usize,
        ctx: &RankContext<'_>,
    ) -> Result<Vec<SearchResult>> {
        let hits = match self
            .store
            .similarity_search(account_id, query_vector, threshold, count)
        {
            Ok(hits) => hits,
            Err(KeepsakeError::InvalidEmbedding(reason)) => {
                warn!(%reason, "vector index unusable for this query");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        self.rank_hits(account_id, hits, MatchChannel::Vector, ctx)
    }

    /// Append keyword-channel hits not already present, ranked among
    /// themselves after the vector hits.
    fn merge_keyword_hits(
        &self,
        account_id: &str,
        expanded: &ExpandedQuery,
        limit: usize,
        ctx: &RankContext<'_>,
        results: &mut Vec<SearchResult>,
    ) -> Result<()> {
        let hits = match self.store.keyword_search(account_id, &expanded.expanded, limit) {
            Ok(hits) => hits,
            Err(KeepsakeError::Search(reason)) => {
                debug!(%reason, "keyword channel unavailable");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let seen: HashSet<EntryId> = results.iter().map(|r| r.entry.id.clone()).collect();
        let fresh: Vec<(EntryId, f32)> = hits
            .into_iter()
            .filter(|(id, _)| !seen.contains(id))
            .collect();
        let n = fresh.len();
        // BM25 scores are not comparable to cosine similarity; use rank.
        let by_rank = fresh
            .into_iter()
            .enumerate()
            .map(|(i, (id, _))| (id, (n - i) as f32 / n as f32))
            .collect();

        let keyword = self.rank_hits(account_id, by_rank, MatchChannel::Keyword, ctx)?;
        if !keyword.is_empty() {
            info!(account = account_id, added = keyword.len(), "keyword channel topped up results");
        }
        results.extend(keyword);
        Ok(())
    }

    fn rank_hits(
        &self,
        account_id: &str,
        hits: Vec<(EntryId, f32)>,
        channel: MatchChannel,
        ctx: &RankContext<'_>,
    ) -> Result<Vec<SearchResult>> {
        let ids: Vec<EntryId> = hits.iter().map(|(id, _)| id.clone()).collect();
        let mut by_id = keepsake::index_by_id(self.store.entries_by_ids(account_id, &ids)?);

        let mut ranked: Vec<SearchResult> = hits
            .into_iter()
            .filter_map(|(id, similarity)| {
                let entry = by_id.remove(&id)?;
                (entry.is_current() && ctx.admits(&entry))
                    .then(|| ctx.score(entry, similarity, channel))
            })
            .collect();
        sort_by_combined(&mut ranked);
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use crate::{NewEntry, RankingConfig};

    fn opts() -> SearchOptions {
        SearchOptions::default().uncached()
    }

    #[test]
    fn classifies_query_intent() {
        assert_eq!(QueryIntent::classify("what will I do next week"), QueryIntent::Future);
        assert_eq!(QueryIntent::classify("bday tomorrow"), QueryIntent::Future);
        assert_eq!(QueryIntent::classify("what was it 2 days ago"), QueryIntent::Past);
        assert_eq!(QueryIntent::classify("what's on today"), QueryIntent::Current);
        assert_eq!(QueryIntent::classify("milk"), QueryIntent::General);
    }

    #[test]
    fn naming_today_wins_over_other_intent_words() {
        assert_eq!(
            QueryIntent::classify("what did I book at the dentist today"),
            QueryIntent::Current
        );
        assert_eq!(QueryIntent::classify("what was on today"), QueryIntent::Current);
        assert_eq!(QueryIntent::classify("what will I do today"), QueryIntent::Current);
        assert_eq!(QueryIntent::classify("what did I book"), QueryIntent::General);
    }

    #[test]
    fn today_query_keeps_entries_dated_today() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        let id = kb
            .process_and_store(&sam(), NewEntry::new("Dentist appointment today"))
            .unwrap();

        let results = kb
            .search("personal", "what did I book at the dentist today", None, &opts())
            .unwrap();
        assert!(results.iter().any(|r| r.entry.id == id));
    }

    #[test]
    fn past_intent_keeps_earlier_dates_and_undated_entries() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        let earlier = kb
            .process_and_store(&sam(), NewEntry::new("Team lunch yesterday"))
            .unwrap();
        let upcoming = kb
            .process_and_store(&sam(), NewEntry::new("Team lunch tomorrow"))
            .unwrap();
        let undated = kb
            .process_and_store(&sam(), NewEntry::new("Team lunch menu ideas"))
            .unwrap();

        let results = kb
            .search("personal", "what was at the team lunch", None, &opts())
            .unwrap();
        let ids: Vec<&EntryId> = results.iter().map(|r| &r.entry.id).collect();
        assert!(ids.contains(&&earlier));
        assert!(ids.contains(&&undated));
        assert!(!ids.contains(&&upcoming));
    }

    #[test]
    fn current_intent_keeps_the_week_window_and_recurring() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        let today = kb
            .process_and_store(&sam(), NewEntry::new("Gym session today"))
            .unwrap();
        let weekly = kb
            .process_and_store(&sam(), NewEntry::new("Gym session every monday"))
            .unwrap();
        let later = kb
            .process_and_store(&sam(), NewEntry::new("Gym session in 3 weeks"))
            .unwrap();
        let long_ago = kb
            .process_and_store(&sam(), NewEntry::new("Gym session 2 months ago"))
            .unwrap();

        let results = kb
            .search("personal", "gym session now", None, &opts())
            .unwrap();
        let ids: Vec<&EntryId> = results.iter().map(|r| &r.entry.id).collect();
        assert!(ids.contains(&&today));
        assert!(ids.contains(&&weekly));
        assert!(!ids.contains(&&later));
        assert!(!ids.contains(&&long_ago));
    }

    #[test]
    fn temporal_queries_use_the_raised_weight() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        kb.process_and_store(&sam(), NewEntry::new("Team lunch tomorrow"))
            .unwrap();
        let cfg = *kb.config();

        let timed = kb
            .search("personal", "team lunch tomorrow", None, &opts())
            .unwrap();
        let r = &timed[0];
        let expected = combine(r.similarity, r.temporal_relevance, cfg.temporal_query_weight);
        assert!((r.combined_score - expected).abs() < 1e-6);

        let plain = kb.search("personal", "team lunch", None, &opts()).unwrap();
        let r = &plain[0];
        let expected = combine(r.similarity, r.temporal_relevance, cfg.temporal_weight);
        assert!((r.combined_score - expected).abs() < 1e-6);
        assert_ne!(cfg.temporal_weight, cfg.temporal_query_weight);
    }

    #[test]
    fn stored_neutral_score_survives_ranking() {
        let ctx = RankContext {
            now: dt("2025-05-30T12:00:00Z"),
            intent: QueryIntent::General,
            weight: 0.3,
            tags: None,
        };
        let mut degraded = KnowledgeEntry::new("personal", "garbled", "u1", "Sam", ctx.now);
        degraded.temporal_relevance_score = keepsake::NEUTRAL_SCORE;
        let plain = KnowledgeEntry::new("personal", "plain", "u1", "Sam", ctx.now);

        let degraded = ctx.score(degraded, 0.8, MatchChannel::Vector);
        let plain = ctx.score(plain, 0.8, MatchChannel::Vector);
        assert_eq!(degraded.temporal_relevance, keepsake::NEUTRAL_SCORE);
        assert_eq!(plain.temporal_relevance, 0.0);
        assert!(degraded.combined_score > plain.combined_score);
    }

    #[test]
    fn combined_score_formula() {
        assert!((combine(0.8, 0.2, 0.3) - (0.8 * 0.7 + 0.2 * 0.3)).abs() < 1e-6);
        assert_eq!(combine(0.5, 1.0, 0.0), 0.5);
    }

    #[test]
    fn equal_scores_keep_index_order() {
        let ctx = RankContext {
            now: dt("2025-05-30T12:00:00Z"),
            intent: QueryIntent::General,
            weight: 0.3,
            tags: None,
        };
        let a = KnowledgeEntry::new("personal", "a", "u1", "Sam", ctx.now);
        let b = KnowledgeEntry::new("personal", "b", "u1", "Sam", ctx.now);
        let c = KnowledgeEntry::new("personal", "c", "u1", "Sam", ctx.now);
        let mut results = vec![
            ctx.score(a, 0.5, MatchChannel::Vector),
            ctx.score(b, 0.9, MatchChannel::Vector),
            ctx.score(c, 0.5, MatchChannel::Vector),
        ];
        sort_by_combined(&mut results);
        let order: Vec<&str> = results.iter().map(|r| r.entry.content.as_str()).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn nuts_finds_testicles_note_first() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        let note = kb
            .process_and_store(&sam(), NewEntry::new("Doctor says my testicles are fine"))
            .unwrap();
        let unrelated = kb
            .process_and_store(&sam(), NewEntry::new("Oil change for the car"))
            .unwrap();

        let results = kb.search("personal", "nuts", None, &opts()).unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].entry.id, note);
        if let Some(pos) = results.iter().position(|r| r.entry.id == unrelated) {
            assert!(pos > 0);
        }
    }

    #[test]
    fn tag_filter_is_hard() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        kb.process_and_store(&sam(), NewEntry::new("Dentist appointment").with_tags(["health"]))
            .unwrap();
        let work = kb
            .process_and_store(&sam(), NewEntry::new("Dentist client meeting").with_tags(["work"]))
            .unwrap();

        let tags = vec!["Work".to_string()];
        let results = kb.search("personal", "dentist", Some(&tags), &opts()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entry.id, work);
    }

    #[test]
    fn future_intent_drops_past_entries() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        let upcoming = kb
            .process_and_store(&sam(), NewEntry::new("Team lunch tomorrow"))
            .unwrap();
        kb.process_and_store(&sam(), NewEntry::new("Team lunch yesterday"))
            .unwrap();

        let results = kb
            .search("personal", "what will happen at team lunch", None, &opts())
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entry.id, upcoming);
        assert!(results[0].is_temporally_relevant);
    }

    #[test]
    fn recurring_match_reports_next_occurrence() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        kb.process_and_store(&sam(), NewEntry::new("Mum's birthday is March 3"))
            .unwrap();

        let results = kb.search("personal", "mum birthday", None, &opts()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].next_occurrence, Some(dt("2026-03-03T00:00:00Z")));
        assert!(results[0].is_temporally_relevant);
        assert!(results[0].temporal_context.contains("recurs"));
    }

    #[test]
    fn relaxes_threshold_before_giving_up() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        let id = kb
            .process_and_store(&sam(), NewEntry::new("Dentist appointment"))
            .unwrap();

        let strict = SearchOptions {
            similarity_threshold: Some(0.99),
            relaxed_threshold: Some(0.05),
            ..opts()
        };
        let results = kb.search("personal", "dentist", None, &strict).unwrap();
        assert_eq!(results[0].entry.id, id);
        assert_eq!(results[0].channel, MatchChannel::Vector);
    }

    #[test]
    fn superseded_entries_are_never_returned() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        let old = kb
            .process_and_store(&sam(), NewEntry::new("Reunion in June").with_tags(["reunion"]))
            .unwrap();
        let new = kb
            .process_and_store(
                &sam(),
                NewEntry::new("Reunion moved to July").with_tags(["reunion"]).replacing("reunion"),
            )
            .unwrap();

        let results = kb.search("personal", "reunion", None, &opts()).unwrap();
        assert!(results.iter().any(|r| r.entry.id == new));
        assert!(results.iter().all(|r| r.entry.id != old));
    }

    #[test]
    fn writes_invalidate_cached_results() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        kb.process_and_store(&sam(), NewEntry::new("Dentist appointment"))
            .unwrap();
        let cached = SearchOptions::default();
        assert_eq!(kb.search("personal", "dentist", None, &cached).unwrap().len(), 1);

        kb.process_and_store(&sam(), NewEntry::new("Dentist bill paid"))
            .unwrap();
        assert_eq!(kb.search("personal", "dentist", None, &cached).unwrap().len(), 2);
    }

    #[test]
    fn respects_max_results() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        for i in 0..5 {
            kb.process_and_store(&sam(), NewEntry::new(format!("Garden task {i}")))
                .unwrap();
        }
        let kb = kb
            .with_config(RankingConfig {
                max_results: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(kb.search("personal", "garden", None, &opts()).unwrap().len(), 2);
    }

    #[cfg(feature = "fulltext")]
    #[test]
    fn embedding_outage_uses_keyword_channel() {
        let kb = offline_kb_at("2025-05-30T12:00:00Z");
        let id = kb
            .process_and_store(&sam(), NewEntry::new("Renew car insurance"))
            .unwrap();
        let results = kb.search("personal", "insurance", None, &opts()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entry.id, id);
        assert_eq!(results[0].channel, MatchChannel::Keyword);
    }

    #[test]
    fn blank_account_is_rejected() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        assert!(kb.search("", "x", None, &opts()).is_err());
        assert!(kb.search("personal", "   ", None, &opts()).unwrap().is_empty());
    }
}

//! High-level knowledge capture and retrieval built on Keepsake.
//!
//! [`KnowledgeBase`] is what an application talks to. It takes raw user
//! text, resolves its temporal references, supersedes whatever it replaces,
//! embeds an enriched rendition for semantic search, and answers queries
//! with temporally weighted, synonym-aware hybrid ranking.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keepsake_knowledge::{Actor, HashingEmbedder, KnowledgeBase, NewEntry, SearchOptions};
//!
//! let kb = KnowledgeBase::open("./notes.keepsake", Arc::new(HashingEmbedder::default())).unwrap();
//! let me = Actor::new("personal", "u1", "Sam");
//!
//! kb.process_and_store(&me, NewEntry::new("Mum's birthday is March 3").with_tags(["family"]))
//!     .unwrap();
//!
//! let hits = kb.search("personal", "mum bday", None, &SearchOptions::default()).unwrap();
//! for hit in hits {
//!     println!("{:.2} {}", hit.combined_score, hit.entry.content);
//! }
//! ```
//!
//! Storage always succeeds from the caller's point of view once the input is
//! well-formed: temporal parsing degrades to no references, and a failed
//! embedding leaves the entry stored but pending re-indexing
//! (see [`KnowledgeBase::reindex_pending`]).

pub mod config;
pub mod embedding;
pub mod migration;
pub mod ranking;
pub mod shopping;

pub use config::{MigrationConfig, RankingConfig, SearchOptions, MAX_CACHE_TTL_SECS};
#[cfg(feature = "fastembed")]
pub use embedding::FastEmbedder;
pub use embedding::{EmbedError, Embedder, HashingEmbedder};
pub use migration::MigrationReport;
pub use ranking::{MatchChannel, QueryIntent, SearchResult};
pub use shopping::{ClearOutcome, PurchaseOutcome};

pub use keepsake::{
    EntryId, Intent, KnowledgeEntry, RevisionChain, TemporalKind, TemporalReference,
};

use chrono::{DateTime, Duration, Utc};
use keepsake::{
    successor_concept, Clock, EntryStore, KeepsakeError, KnowledgeStore, QueryCache,
    RevisionChainTracker, SynonymExpander, SystemClock, TemporalParser,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

pub use keepsake::KeepsakeError as Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Who is writing: the account (space) and the user within it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub account_id: String,
    pub user_id: String,
    pub display_name: String,
}

impl Actor {
    pub fn new(
        account_id: impl Into<String>,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.account_id.trim().is_empty() {
            return Err(KeepsakeError::InvalidInput("account id must not be blank".into()));
        }
        if self.user_id.trim().is_empty() {
            return Err(KeepsakeError::InvalidInput("user id must not be blank".into()));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        if self.display_name.trim().is_empty() {
            &self.user_id
        } else {
            &self.display_name
        }
    }
}

/// Input to [`KnowledgeBase::process_and_store`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub intent: Intent,
    /// Entry id, concept id or tag-like reference to what this replaces.
    #[serde(default)]
    pub replaces: Option<String>,
    /// Logical event time (RFC 3339); defaults to now.
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub items: Option<Vec<String>>,
    #[serde(default)]
    pub list_type: Option<String>,
}

impl NewEntry {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_intent(mut self, intent: Intent) -> Self {
        self.intent = intent;
        self
    }

    /// Mark this as an update of `replaces`.
    pub fn replacing(mut self, replaces: impl Into<String>) -> Self {
        self.replaces = Some(replaces.into());
        if self.intent == Intent::Create {
            self.intent = Intent::Update;
        }
        self
    }

    pub fn at(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    pub fn with_items<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.items = Some(items.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_list_type(mut self, list_type: impl Into<String>) -> Self {
        self.list_type = Some(list_type.into());
        self
    }
}

/// Content and/or tag changes for [`KnowledgeBase::edit_entry`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryEdit {
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// Knowledge store plus the parsing, embedding and ranking around it.
pub struct KnowledgeBase {
    store: KnowledgeStore,
    embedder: Arc<dyn Embedder>,
    clock: Arc<dyn Clock>,
    cache: QueryCache<Vec<SearchResult>>,
    parser: TemporalParser,
    expander: SynonymExpander,
    config: RankingConfig,
}

impl KnowledgeBase {
    /// Open or create a knowledge base at the given path.
    pub fn open(path: &str, embedder: Arc<dyn Embedder>) -> Result<Self> {
        Ok(Self::new(KnowledgeStore::open(path)?, embedder))
    }

    pub fn open_in_memory(embedder: Arc<dyn Embedder>) -> Result<Self> {
        Ok(Self::new(KnowledgeStore::open_in_memory()?, embedder))
    }

    pub fn new(store: KnowledgeStore, embedder: Arc<dyn Embedder>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let config = RankingConfig::default();
        Self {
            cache: Self::build_cache(&config, clock.clone()),
            store,
            embedder,
            clock,
            parser: TemporalParser::new(),
            expander: SynonymExpander::new(),
            config,
        }
    }

    /// Replace the clock (tests pin "now" with a [`keepsake::FixedClock`]).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.cache = Self::build_cache(&self.config, clock.clone());
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: RankingConfig) -> Result<Self> {
        config.validate()?;
        self.cache = Self::build_cache(&config, self.clock.clone());
        self.config = config;
        Ok(self)
    }

    fn build_cache(config: &RankingConfig, clock: Arc<dyn Clock>) -> QueryCache<Vec<SearchResult>> {
        // Out-of-range lifetimes disable the cache rather than overflow.
        let ttl = i64::try_from(config.cache_ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or_else(Duration::zero);
        QueryCache::new(ttl, clock)
    }

    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }

    pub fn config(&self) -> &RankingConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Validate, enrich, supersede predecessors, then store and index a new
    /// entry. Returns its id.
    ///
    /// For `Update`, `Purchase`, `ClearList` and `Delete` intents with a
    /// `replaces` reference, the predecessors are marked superseded *before*
    /// the new entry is written.
    pub fn process_and_store(&self, actor: &Actor, input: NewEntry) -> Result<EntryId> {
        actor.validate()?;
        let content = input.content.trim();
        if content.is_empty() {
            return Err(KeepsakeError::InvalidInput("content must not be blank".into()));
        }

        let now = self.clock.now();
        let event_time = match input.timestamp.as_deref().map(str::trim) {
            Some(ts) if !ts.is_empty() => parse_timestamp(ts)?,
            _ => now,
        };
        let timestamp = event_time.to_rfc3339();

        let replaces = input
            .replaces
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty());
        let predecessors = match replaces {
            Some(r) if input.intent.replaces_predecessor() => {
                RevisionChainTracker::new(&self.store).handle_replacement(
                    &actor.account_id,
                    r,
                    &timestamp,
                )?
            }
            _ => Vec::new(),
        };

        let mut entry = KnowledgeEntry::new(
            actor.account_id.as_str(),
            content,
            actor.user_id.as_str(),
            actor.name(),
            now,
        );
        entry.timestamp = timestamp;
        entry.set_tags(&input.tags);
        entry.intent = input.intent;
        entry.replaces = replaces.map(str::to_string);
        entry.concept = successor_concept(&predecessors);
        entry.items = input.items.filter(|items| !items.is_empty());
        entry.list_type = input
            .list_type
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty());

        let id = self.store_new(entry)?;
        debug!(
            account = actor.account_id.as_str(),
            entry = %id,
            superseded = predecessors.len(),
            "stored entry"
        );
        Ok(id)
    }

    /// Change content and/or tags; temporal metadata, enhanced text and the
    /// embedding are regenerated.
    pub fn edit_entry(&self, actor: &Actor, id: &EntryId, edit: EntryEdit) -> Result<KnowledgeEntry> {
        actor.validate()?;
        let mut entry = self
            .store
            .find_by_id(&actor.account_id, id.as_str())?
            .ok_or_else(|| KeepsakeError::NotFound(format!("entry id {id}")))?;

        if let Some(content) = edit.content {
            let content = content.trim();
            if content.is_empty() {
                return Err(KeepsakeError::InvalidInput("content must not be blank".into()));
            }
            entry.content = content.to_string();
        }
        if let Some(tags) = edit.tags {
            entry.set_tags(&tags);
        }
        entry.updated_at = self.clock.now();

        self.enrich(&mut entry);
        self.index(&mut entry)?;
        self.cache.invalidate_prefix(&entry.account_id);
        Ok(entry)
    }

    /// Physically delete an entry. Immediate and final.
    pub fn delete_entry(&self, account_id: &str, id: &EntryId) -> Result<()> {
        if !self.store.delete(account_id, id)? {
            return Err(KeepsakeError::NotFound(format!("entry id {id}")));
        }
        self.cache.invalidate_prefix(account_id);
        Ok(())
    }

    pub fn get_entry(&self, account_id: &str, id: &EntryId) -> Result<KnowledgeEntry> {
        self.store
            .find_by_id(account_id, id.as_str())?
            .ok_or_else(|| KeepsakeError::NotFound(format!("entry id {id}")))
    }

    /// Every version of the concept `id` belongs to, oldest first.
    pub fn revision_history(&self, account_id: &str, id: &EntryId) -> Result<RevisionChain> {
        RevisionChain::load(&self.store, account_id, id.as_str())
    }

    /// Enrich, store and index an entry that does not exist yet.
    pub(crate) fn store_new(&self, mut entry: KnowledgeEntry) -> Result<EntryId> {
        self.enrich(&mut entry);
        self.index(&mut entry)?;
        self.cache.invalidate_prefix(&entry.account_id);
        Ok(entry.id)
    }

    /// Recompute temporal fields and the enhanced (embedded) text.
    pub(crate) fn enrich(&self, entry: &mut KnowledgeEntry) {
        let processed = self
            .parser
            .parse(&entry.content, entry.event_time(), entry.created_at);

        let mut text = processed.processed_content.clone();
        let added_by = if entry.added_by_name.is_empty() {
            entry.added_by.as_str()
        } else {
            entry.added_by_name.as_str()
        };
        text.push_str(&format!(
            "\nAdded by {} on {}.",
            added_by,
            entry.event_time().format("%A, %B %-d, %Y")
        ));
        if !processed.temporal_info.is_empty() {
            let context: Vec<String> = processed
                .temporal_info
                .iter()
                .map(|r| r.describe(entry.event_time()))
                .collect();
            text.push_str(&format!("\nWhen: {}.", context.join("; ")));
        }
        if !entry.tags.is_empty() {
            let tags: Vec<&str> = entry.tags.iter().map(String::as_str).collect();
            text.push_str(&format!("\nTags: {}.", tags.join(", ")));
        }

        entry.enhanced_content = self.expander.annotate(&text);
        entry.temporal_info = processed.temporal_info;
        entry.resolved_dates = processed.resolved_dates;
        entry.temporal_relevance_score = processed.temporal_relevance_score;
        entry.contains_temporal_refs = processed.contains_temporal_refs;
    }

    /// Persist the entry, with an embedding when one can be had.
    ///
    /// Returns whether the entry ended up indexed. Embedding problems never
    /// fail the write.
    pub(crate) fn index(&self, entry: &mut KnowledgeEntry) -> Result<bool> {
        match self.embedder.embed(&entry.enhanced_content) {
            Ok(vector) => {
                entry.indexed_at = Some(self.clock.now());
                match self.store.upsert_with_embedding(entry, vector) {
                    Ok(()) => return Ok(true),
                    Err(KeepsakeError::InvalidEmbedding(reason)) => {
                        warn!(entry = %entry.id, %reason, "embedding rejected; stored without search index");
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => {
                warn!(entry = %entry.id, error = %e, "embedding failed; stored without search index");
            }
        }
        entry.indexed_at = None;
        self.store.upsert(entry)?;
        Ok(false)
    }
}

fn parse_timestamp(ts: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(ts) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(ts, "%Y-%m-%d") {
        if let Some(t) = d.and_hms_opt(0, 0, 0) {
            return Ok(t.and_utc());
        }
    }
    Err(KeepsakeError::InvalidInput(format!(
        "timestamp '{ts}' is not RFC 3339 or YYYY-MM-DD"
    )))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use keepsake::FixedClock;

    /// Embedder that is always down.
    pub struct OfflineEmbedder;

    impl Embedder for OfflineEmbedder {
        fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, EmbedError> {
            Err(EmbedError::Unavailable("offline".into()))
        }

        fn dimension(&self) -> usize {
            0
        }

        fn name(&self) -> &str {
            "offline"
        }
    }

    pub fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    /// In-memory knowledge base with a hashing embedder and a pinned clock.
    pub fn kb_at(now: &str) -> (KnowledgeBase, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(dt(now)));
        let kb = KnowledgeBase::open_in_memory(Arc::new(HashingEmbedder::default()))
            .unwrap()
            .with_clock(clock.clone());
        (kb, clock)
    }

    pub fn offline_kb_at(now: &str) -> KnowledgeBase {
        let clock = Arc::new(FixedClock::new(dt(now)));
        KnowledgeBase::open_in_memory(Arc::new(OfflineEmbedder))
            .unwrap()
            .with_clock(clock)
    }

    pub fn sam() -> Actor {
        Actor::new("personal", "u1", "Sam")
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use keepsake::Frequency;
    use tempfile::NamedTempFile;

    #[test]
    fn stores_enriched_entry() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        let id = kb
            .process_and_store(&sam(), NewEntry::new("Dentist next friday").with_tags(["Health"]))
            .unwrap();

        let e = kb.get_entry("personal", &id).unwrap();
        assert_eq!(e.content, "Dentist next friday");
        assert!(e.tags.contains("health"));
        assert!(e.contains_temporal_refs);
        assert_eq!(e.resolved_dates.len(), 1);
        assert!(e.enhanced_content.contains("Added by Sam"));
        assert!(e.enhanced_content.contains("(Friday, June 6, 2025)"));
        assert!(e.indexed_at.is_some());
        assert!(kb.store().has_embedding(&e.id).unwrap());
    }

    #[test]
    fn synonym_annotation_lands_in_enhanced_content() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        let id = kb
            .process_and_store(&sam(), NewEntry::new("Doctor checked my testicles"))
            .unwrap();
        let e = kb.get_entry("personal", &id).unwrap();
        assert!(e.enhanced_content.contains("[related terms:"));
        assert!(e.enhanced_content.contains("nuts"));
    }

    #[test]
    fn birthday_is_yearly_recurring() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        let id = kb
            .process_and_store(&sam(), NewEntry::new("Grandad's birthday is 12 March 1941"))
            .unwrap();
        let e = kb.get_entry("personal", &id).unwrap();
        let rule = e.temporal_info[0].recurrence.unwrap();
        assert_eq!(rule.frequency, Frequency::Yearly);
    }

    #[test]
    fn rejects_malformed_input() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        let blank_account = Actor::new(" ", "u1", "Sam");
        assert!(matches!(
            kb.process_and_store(&blank_account, NewEntry::new("x")),
            Err(KeepsakeError::InvalidInput(_))
        ));
        assert!(matches!(
            kb.process_and_store(&sam(), NewEntry::new("   ")),
            Err(KeepsakeError::InvalidInput(_))
        ));
        assert!(matches!(
            kb.process_and_store(&sam(), NewEntry::new("x").at("last tuesday-ish")),
            Err(KeepsakeError::InvalidInput(_))
        ));
    }

    #[test]
    fn huge_cache_ttl_is_rejected_not_fatal() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        let cfg = RankingConfig {
            cache_ttl_secs: u64::MAX / 2,
            ..Default::default()
        };
        assert!(matches!(kb.with_config(cfg), Err(KeepsakeError::InvalidInput(_))));

        assert!(!KnowledgeBase::build_cache(&cfg, Arc::new(SystemClock)).is_enabled());
    }

    #[test]
    fn explicit_timestamp_drives_relative_resolution() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        let id = kb
            .process_and_store(&sam(), NewEntry::new("Party tomorrow").at("2025-01-10"))
            .unwrap();
        let e = kb.get_entry("personal", &id).unwrap();
        assert_eq!(e.resolved_dates[0], dt("2025-01-11T00:00:00Z"));
        assert_eq!(e.created_at, dt("2025-05-30T12:00:00Z"));
    }

    #[test]
    fn update_supersedes_predecessor_first() {
        let (kb, clock) = kb_at("2025-05-01T09:00:00Z");
        let old = kb
            .process_and_store(
                &sam(),
                NewEntry::new("Family reunion is June 14").with_tags(["family", "reunion"]),
            )
            .unwrap();

        clock.set(dt("2025-05-30T12:00:00Z"));
        let new = kb
            .process_and_store(
                &sam(),
                NewEntry::new("We moved the family reunion to July 9")
                    .with_tags(["family", "reunion"])
                    .replacing("family-reunion"),
            )
            .unwrap();

        let old_entry = kb.get_entry("personal", &old).unwrap();
        let new_entry = kb.get_entry("personal", &new).unwrap();
        assert_eq!(old_entry.replaced_by.as_deref(), Some(new_entry.timestamp.as_str()));
        assert!(new_entry.is_current());
        assert_eq!(new_entry.intent, Intent::Update);
        assert_eq!(new_entry.concept.as_deref(), Some(old.as_str()));

        let history = kb.revision_history("personal", &new).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.current().unwrap().id, new);
        assert!(history.is_consistent());
    }

    #[test]
    fn update_without_predecessor_is_a_create() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        let id = kb
            .process_and_store(&sam(), NewEntry::new("Gym moved to 7am").replacing("gym-time"))
            .unwrap();
        let e = kb.get_entry("personal", &id).unwrap();
        assert!(e.is_current());
        assert!(e.concept.is_none());
    }

    #[test]
    fn embedding_outage_still_stores_entry() {
        let kb = offline_kb_at("2025-05-30T12:00:00Z");
        let id = kb
            .process_and_store(&sam(), NewEntry::new("Call the plumber tomorrow"))
            .unwrap();
        let e = kb.get_entry("personal", &id).unwrap();
        assert!(e.indexed_at.is_none());
        assert!(e.contains_temporal_refs);
        assert_eq!(kb.store().pending_entries("personal").unwrap().len(), 1);
    }

    #[test]
    fn edit_regenerates_metadata() {
        let (kb, clock) = kb_at("2025-05-30T12:00:00Z");
        let id = kb
            .process_and_store(&sam(), NewEntry::new("Pick up parcel"))
            .unwrap();
        assert!(!kb.get_entry("personal", &id).unwrap().contains_temporal_refs);

        clock.advance(Duration::hours(1));
        let edited = kb
            .edit_entry(
                &sam(),
                &id,
                EntryEdit {
                    content: Some("Pick up parcel tomorrow".into()),
                    tags: Some(vec!["Errands".into()]),
                },
            )
            .unwrap();
        assert!(edited.contains_temporal_refs);
        assert!(edited.tags.contains("errands"));
        assert_eq!(edited.updated_at, dt("2025-05-30T13:00:00Z"));
        assert!(edited.enhanced_content.contains("tomorrow (Saturday, May 31, 2025)"));

        assert!(matches!(
            kb.edit_entry(&sam(), &EntryId::new(), EntryEdit::default()),
            Err(KeepsakeError::NotFound(_))
        ));
    }

    #[test]
    fn delete_is_final() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        let id = kb.process_and_store(&sam(), NewEntry::new("temp note")).unwrap();
        kb.delete_entry("personal", &id).unwrap();
        assert!(matches!(
            kb.get_entry("personal", &id),
            Err(KeepsakeError::NotFound(_))
        ));
        assert!(matches!(
            kb.delete_entry("personal", &id),
            Err(KeepsakeError::NotFound(_))
        ));
    }

    #[test]
    fn persists_across_reopen() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let id = {
            let kb = KnowledgeBase::open(&path, Arc::new(HashingEmbedder::default())).unwrap();
            kb.process_and_store(&sam(), NewEntry::new("Passport renewal in 3 months"))
                .unwrap()
        };
        let kb = KnowledgeBase::open(&path, Arc::new(HashingEmbedder::default())).unwrap();
        let e = kb.get_entry("personal", &id).unwrap();
        assert!(kb.store().has_embedding(&e.id).unwrap());
    }
}

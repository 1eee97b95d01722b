//! Keepsake: temporal-aware knowledge revision store.
//!
//! The core record is a [`KnowledgeEntry`]: a piece of free text captured by a
//! user, enriched with resolved temporal references and a synonym-annotated
//! "enhanced" rendition that is what actually gets embedded for search.
//!
//! Entries are never overwritten to change what they *mean*. A newer entry
//! **supersedes** an older one by setting the older entry's `replaced_by`;
//! superseded entries drop out of every current-state query but stay on disk
//! as history. Entries that supersede one another share a **concept** id,
//! which is what [`RevisionChain`] walks.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use keepsake::{EntryStore, KnowledgeEntry, KnowledgeStore};
//! use chrono::Utc;
//!
//! let store = KnowledgeStore::open("notes.keepsake").unwrap();
//!
//! let mut entry = KnowledgeEntry::new("personal", "Dentist next friday", "u1", "Sam", Utc::now());
//! entry.set_tags(["health", "dentist"]);
//! store.upsert(&entry).unwrap();
//!
//! let current = store.find_current_by_tag("personal", "dentist").unwrap();
//! assert_eq!(current.len(), 1);
//! ```

pub mod cache;
pub mod clock;
pub mod revision;
pub mod synonyms;
pub mod temporal;
mod vector;

pub use cache::QueryCache;
pub use clock::{Clock, FixedClock, SystemClock};
pub use revision::{successor_concept, Resolution, RevisionChain, RevisionChainTracker};
pub use synonyms::{tokenize, ExpandedQuery, SynonymExpander, SynonymGroup, SYNONYM_GROUPS};
pub use temporal::{
    score_references, Frequency, ProcessedTemporalContent, RecurrenceRule, TemporalKind,
    TemporalParser, TemporalReference, NEUTRAL_SCORE,
};

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
#[cfg(feature = "fulltext")]
use tantivy::collector::TopDocs;
#[cfg(feature = "fulltext")]
use tantivy::query::{BooleanQuery, FuzzyTermQuery, Occur, QueryParser};
#[cfg(feature = "fulltext")]
use tantivy::schema::{Field, Schema, Value as TantivyValueTrait, STORED, STRING, TEXT};
#[cfg(feature = "fulltext")]
use tantivy::{doc, Index, Term};
use ulid::Ulid;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum KeepsakeError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("search error: {0}")]
    Search(String),
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redb::DatabaseError> for KeepsakeError {
    fn from(e: redb::DatabaseError) -> Self {
        KeepsakeError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for KeepsakeError {
    fn from(e: redb::TransactionError) -> Self {
        KeepsakeError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for KeepsakeError {
    fn from(e: redb::TableError) -> Self {
        KeepsakeError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for KeepsakeError {
    fn from(e: redb::StorageError) -> Self {
        KeepsakeError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for KeepsakeError {
    fn from(e: redb::CommitError) -> Self {
        KeepsakeError::Storage(e.to_string())
    }
}
#[cfg(feature = "fulltext")]
impl From<tantivy::TantivyError> for KeepsakeError {
    fn from(e: tantivy::TantivyError) -> Self {
        KeepsakeError::Search(e.to_string())
    }
}
#[cfg(feature = "fulltext")]
impl From<tantivy::query::QueryParserError> for KeepsakeError {
    fn from(e: tantivy::query::QueryParserError) -> Self {
        KeepsakeError::Search(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KeepsakeError>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Unique identifier for an entry (ULID, lexicographically time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub String);

impl EntryId {
    pub fn new() -> Self {
        EntryId(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntryId {
    fn from(s: &str) -> Self {
        EntryId(s.to_string())
    }
}

/// Why an entry was written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    #[default]
    Create,
    Update,
    Delete,
    Purchase,
    ClearList,
}

impl Intent {
    /// Intents whose entries are ordinary content (as opposed to purchase or
    /// clear records).
    pub fn is_content(self) -> bool {
        matches!(self, Intent::Create | Intent::Update)
    }

    /// Intents that supersede a predecessor before being stored.
    pub fn replaces_predecessor(self) -> bool {
        !matches!(self, Intent::Create)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Create => "create",
            Intent::Update => "update",
            Intent::Delete => "delete",
            Intent::Purchase => "purchase",
            Intent::ClearList => "clear_list",
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Intent {
    type Err = KeepsakeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "" | "create" => Ok(Intent::Create),
            "update" => Ok(Intent::Update),
            "delete" => Ok(Intent::Delete),
            "purchase" => Ok(Intent::Purchase),
            "clear_list" | "clearlist" | "clear" => Ok(Intent::ClearList),
            other => Err(KeepsakeError::InvalidInput(format!("unknown intent '{other}'"))),
        }
    }
}

/// A captured piece of knowledge.
///
/// Optional string fields arrive from older rows and external callers as
/// `null`, as `""`, or not at all; all three deserialize to `None`, so
/// [`is_superseded`](Self::is_superseded) has exactly one "current" shape to
/// test for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: EntryId,
    pub account_id: String,
    /// Original free text as written.
    pub content: String,
    /// Content plus user/date/temporal context and related terms; this is
    /// the text that gets embedded.
    #[serde(default)]
    pub enhanced_content: String,
    #[serde(default, deserialize_with = "tag_set")]
    pub tags: BTreeSet<String>,
    pub added_by: String,
    #[serde(default)]
    pub added_by_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Logical event time (RFC 3339). May differ from `created_at`.
    pub timestamp: String,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub replaces: Option<String>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub replaced_by: Option<String>,
    #[serde(default)]
    pub intent: Intent,
    /// Stable id shared by every entry of one revision chain.
    #[serde(default, deserialize_with = "blank_as_none")]
    pub concept: Option<String>,

    #[serde(default)]
    pub items: Option<Vec<String>>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub list_type: Option<String>,

    #[serde(default)]
    pub temporal_info: Vec<TemporalReference>,
    #[serde(default)]
    pub resolved_dates: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub temporal_relevance_score: f32,
    #[serde(default)]
    pub contains_temporal_refs: bool,

    /// When an embedding was last stored for the current content. `None`
    /// means the entry still needs (re)indexing.
    #[serde(default)]
    pub indexed_at: Option<DateTime<Utc>>,
}

impl KnowledgeEntry {
    /// A fresh `Create` entry whose event time is `at`.
    pub fn new(
        account_id: impl Into<String>,
        content: impl Into<String>,
        added_by: impl Into<String>,
        added_by_name: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        let content = content.into();
        Self {
            id: EntryId::new(),
            account_id: account_id.into(),
            enhanced_content: content.clone(),
            content,
            tags: BTreeSet::new(),
            added_by: added_by.into(),
            added_by_name: added_by_name.into(),
            created_at: at,
            updated_at: at,
            timestamp: at.to_rfc3339(),
            replaces: None,
            replaced_by: None,
            intent: Intent::Create,
            concept: None,
            items: None,
            list_type: None,
            temporal_info: Vec::new(),
            resolved_dates: Vec::new(),
            temporal_relevance_score: 0.0,
            contains_temporal_refs: false,
            indexed_at: None,
        }
    }

    /// Replace the tag set, normalising each tag.
    pub fn set_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tags = normalize_tags(tags);
    }

    pub fn is_superseded(&self) -> bool {
        self.replaced_by.as_deref().is_some_and(|r| !r.trim().is_empty())
    }

    pub fn is_current(&self) -> bool {
        !self.is_superseded()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn has_any_tag<S: AsRef<str>>(&self, tags: &[S]) -> bool {
        tags.iter().any(|t| self.tags.contains(t.as_ref()))
    }

    /// The chain this entry belongs to: its concept, or its own id.
    pub fn concept_key(&self) -> &str {
        self.concept.as_deref().unwrap_or(self.id.as_str())
    }

    /// `timestamp` parsed as an instant, falling back to `created_at`.
    pub fn event_time(&self) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(self.created_at)
    }
}

/// Trim, lowercase and de-duplicate tags; blanks are dropped.
pub fn normalize_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .filter_map(|t| {
            let t = t.as_ref().trim().to_lowercase();
            (!t.is_empty()).then_some(t)
        })
        .collect()
}

fn blank_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| {
        let trimmed = s.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }))
}

fn tag_set<'de, D>(deserializer: D) -> std::result::Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<String>> = Option::deserialize(deserializer)?;
    Ok(normalize_tags(raw.unwrap_or_default()))
}

// ---------------------------------------------------------------------------
// Store interface
// ---------------------------------------------------------------------------

/// The query surface revision tracking and list reconciliation need.
///
/// "Current" always means [`KnowledgeEntry::is_current`].
pub trait EntryStore {
    /// Any entry with this id in the account, superseded or not.
    fn find_by_id(&self, account_id: &str, id: &str) -> Result<Option<KnowledgeEntry>>;

    /// Current entries carrying `tag` (normalised before lookup).
    fn find_current_by_tag(&self, account_id: &str, tag: &str) -> Result<Vec<KnowledgeEntry>>;

    /// Current entries carrying at least one of `tags`, without duplicates.
    fn find_current_by_any_tag(
        &self,
        account_id: &str,
        tags: &[&str],
    ) -> Result<Vec<KnowledgeEntry>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for tag in tags {
            for entry in self.find_current_by_tag(account_id, tag)? {
                if seen.insert(entry.id.clone()) {
                    out.push(entry);
                }
            }
        }
        Ok(out)
    }

    /// Every entry (superseded included) of a revision chain.
    fn find_by_concept(&self, account_id: &str, concept: &str) -> Result<Vec<KnowledgeEntry>>;

    fn current_entries(&self, account_id: &str) -> Result<Vec<KnowledgeEntry>>;

    fn upsert(&self, entry: &KnowledgeEntry) -> Result<()>;

    /// Compare-and-set `replaced_by` on a current entry.
    ///
    /// Returns `false`, leaving the row untouched, if the entry was already
    /// superseded. An entry without a concept adopts its own id as concept.
    fn mark_superseded(&self, account_id: &str, id: &EntryId, replaced_by: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// redb-backed store
// ---------------------------------------------------------------------------

/// Composite string key: `"{account}:{entry_id}"` → entry JSON.
const ENTRIES: TableDefinition<&str, &str> = TableDefinition::new("entries");

/// Secondary tag index: `"{account}:{tag}:{entry_id}"` → entry id.
const ENTRY_TAGS: TableDefinition<&str, &str> = TableDefinition::new("entry_tags");

/// Chain index: `"{account}:{concept}:{entry_id}"` → entry id.
const ENTRY_CONCEPTS: TableDefinition<&str, &str> = TableDefinition::new("entry_concepts");

/// Raw little-endian f32 bytes keyed by entry id.
/// Written in the same transaction as the entry row.
const EMBEDDINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("embeddings");

/// Key `"dim"` stores the established embedding dimension (`u64`).
const EMBEDDING_META: TableDefinition<&str, u64> = TableDefinition::new("embedding_meta");

/// Embedded knowledge store.
///
/// All writes are ACID (backed by `redb`).
///
/// # Example
///
/// ```rust,no_run
/// use keepsake::{EntryStore, KnowledgeEntry, KnowledgeStore};
/// use chrono::Utc;
///
/// let store = KnowledgeStore::open_in_memory().unwrap();
/// let entry = KnowledgeEntry::new("personal", "Buy milk", "u1", "Sam", Utc::now());
/// store.upsert_with_embedding(&entry, vec![0.1, 0.9]).unwrap();
/// let hits = store.similarity_search("personal", &[0.1, 0.9], 0.5, 10).unwrap();
/// assert_eq!(hits[0].0, entry.id);
/// ```
pub struct KnowledgeStore {
    db: Database,
    /// Rebuilt from the `embeddings` table on open, then kept in sync after
    /// every committed write.
    vector_index: std::sync::Mutex<vector::VectorIndex>,
}

impl KnowledgeStore {
    /// Open or create a store at the given path.
    pub fn open(path: &str) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Create an in-memory store (no file I/O). Data is lost on drop.
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(ENTRIES)?;
            write_txn.open_table(ENTRY_TAGS)?;
            write_txn.open_table(ENTRY_CONCEPTS)?;
            write_txn.open_table(EMBEDDINGS)?;
            write_txn.open_table(EMBEDDING_META)?;
            write_txn.commit()?;
        }
        let vector_index = Self::rebuild_vector_index_from_db(&db)?;
        Ok(Self {
            db,
            vector_index: std::sync::Mutex::new(vector_index),
        })
    }

    fn rebuild_vector_index_from_db(db: &Database) -> Result<vector::VectorIndex> {
        let mut idx = vector::VectorIndex::new();
        let read_txn = db.begin_read()?;
        let emb_table = read_txn.open_table(EMBEDDINGS)?;

        for row in emb_table.iter()? {
            let (key, value) = row?;
            let entry_id = EntryId(key.value().to_string());
            let bytes = value.value();

            if bytes.len() % 4 != 0 {
                return Err(KeepsakeError::Storage(format!(
                    "corrupt embedding for entry {entry_id}: \
                     byte length {} is not a multiple of 4",
                    bytes.len()
                )));
            }

            let embedding: Vec<f32> = bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();

            idx.insert(entry_id, embedding)?;
        }

        Ok(idx)
    }

    fn lock_index(&self) -> Result<std::sync::MutexGuard<'_, vector::VectorIndex>> {
        self.vector_index
            .lock()
            .map_err(|_| KeepsakeError::Internal("vector index lock poisoned".into()))
    }

    /// Store an entry and its embedding in one transaction.
    ///
    /// # Errors
    ///
    /// [`KeepsakeError::InvalidEmbedding`] if `embedding` is empty or its
    /// dimension differs from the one established by the first embedding
    /// ever stored. Nothing is written in that case.
    pub fn upsert_with_embedding(&self, entry: &KnowledgeEntry, embedding: Vec<f32>) -> Result<()> {
        check_account(&entry.account_id)?;
        if embedding.is_empty() {
            return Err(KeepsakeError::InvalidEmbedding(
                "embedding must not be empty".into(),
            ));
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut meta = write_txn.open_table(EMBEDDING_META)?;
            let stored_dim: Option<u64> = meta.get("dim")?.map(|g| g.value());
            match stored_dim {
                None => {
                    meta.insert("dim", embedding.len() as u64)?;
                }
                Some(d) if d as usize != embedding.len() => {
                    return Err(KeepsakeError::InvalidEmbedding(format!(
                        "embedding dimension mismatch: expected {d}, got {}",
                        embedding.len()
                    )));
                }
                Some(_) => {}
            }
        }

        Self::write_entry_in_txn(&write_txn, entry)?;
        {
            let bytes: Vec<u8> = embedding.iter().flat_map(|x| x.to_le_bytes()).collect();
            let mut emb_table = write_txn.open_table(EMBEDDINGS)?;
            emb_table.insert(entry.id.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;

        self.lock_index()?.insert(entry.id.clone(), embedding)?;
        Ok(())
    }

    /// Write the entry row and rewrite its tag and concept index rows.
    fn write_entry_in_txn(write_txn: &redb::WriteTransaction, entry: &KnowledgeEntry) -> Result<()> {
        let key = entry_key(&entry.account_id, &entry.id);
        let previous: Option<KnowledgeEntry> = {
            let table = write_txn.open_table(ENTRIES)?;
            let raw = table.get(key.as_str())?.map(|g| g.value().to_string());
            raw.map(|r| serde_json::from_str(&r)).transpose()?
        };

        {
            let mut tags = write_txn.open_table(ENTRY_TAGS)?;
            if let Some(prev) = &previous {
                for tag in &prev.tags {
                    tags.remove(index_key(&prev.account_id, tag, &prev.id).as_str())?;
                }
            }
            for tag in &entry.tags {
                tags.insert(
                    index_key(&entry.account_id, tag, &entry.id).as_str(),
                    entry.id.as_str(),
                )?;
            }
        }
        {
            let mut concepts = write_txn.open_table(ENTRY_CONCEPTS)?;
            if let Some(concept) = previous.as_ref().and_then(|p| p.concept.as_deref()) {
                concepts.remove(index_key(&entry.account_id, concept, &entry.id).as_str())?;
            }
            if let Some(concept) = entry.concept.as_deref() {
                concepts.insert(
                    index_key(&entry.account_id, concept, &entry.id).as_str(),
                    entry.id.as_str(),
                )?;
            }
        }

        let value = serde_json::to_string(entry)?;
        let mut table = write_txn.open_table(ENTRIES)?;
        table.insert(key.as_str(), value.as_str())?;
        Ok(())
    }

    /// Current entries most similar to `embedding`, at or above `threshold`,
    /// best first. Entries stored without an embedding are invisible here.
    pub fn similarity_search(
        &self,
        account_id: &str,
        embedding: &[f32],
        threshold: f32,
        count: usize,
    ) -> Result<Vec<(EntryId, f32)>> {
        check_account(account_id)?;
        {
            let idx = self.lock_index()?;
            if let Some(d) = idx.dim() {
                if embedding.len() != d {
                    return Err(KeepsakeError::InvalidEmbedding(format!(
                        "query dimension mismatch: index has dim {d}, query has {}",
                        embedding.len()
                    )));
                }
            }
        }

        let allowed: HashSet<EntryId> = self
            .current_entries(account_id)?
            .into_iter()
            .map(|e| e.id)
            .collect();

        Ok(self.lock_index()?.search(embedding, count, threshold, &allowed))
    }

    /// Entries (current or not) whose embedding is missing or stale.
    pub fn pending_entries(&self, account_id: &str) -> Result<Vec<KnowledgeEntry>> {
        check_account(account_id)?;
        self.scan_entries(account_id, |e| e.indexed_at.is_none())
    }

    /// Entries by id, in the order given; unknown ids are skipped.
    pub fn entries_by_ids(&self, account_id: &str, ids: &[EntryId]) -> Result<Vec<KnowledgeEntry>> {
        check_account(account_id)?;
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTRIES)?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(raw) = table.get(entry_key(account_id, id).as_str())? {
                out.push(serde_json::from_str(raw.value())?);
            }
        }
        Ok(out)
    }

    pub fn has_embedding(&self, id: &EntryId) -> Result<bool> {
        Ok(self.lock_index()?.contains(id))
    }

    /// Physically remove an entry, its index rows and its embedding.
    ///
    /// Returns `false` if there was nothing to delete.
    pub fn delete(&self, account_id: &str, id: &EntryId) -> Result<bool> {
        check_account(account_id)?;
        let key = entry_key(account_id, id);
        let write_txn = self.db.begin_write()?;
        let existing: Option<KnowledgeEntry> = {
            let mut table = write_txn.open_table(ENTRIES)?;
            let removed = table.remove(key.as_str())?.map(|g| g.value().to_string());
            removed.map(|r| serde_json::from_str(&r)).transpose()?
        };
        let Some(entry) = existing else {
            return Ok(false);
        };
        {
            let mut tags = write_txn.open_table(ENTRY_TAGS)?;
            for tag in &entry.tags {
                tags.remove(index_key(account_id, tag, id).as_str())?;
            }
        }
        if let Some(concept) = entry.concept.as_deref() {
            let mut concepts = write_txn.open_table(ENTRY_CONCEPTS)?;
            concepts.remove(index_key(account_id, concept, id).as_str())?;
        }
        {
            let mut emb_table = write_txn.open_table(EMBEDDINGS)?;
            emb_table.remove(id.as_str())?;
        }
        write_txn.commit()?;

        self.lock_index()?.remove(id);
        Ok(true)
    }

    /// Full-text search over current entries' enhanced content and tags.
    ///
    /// Builds an in-memory index at query time; falls back to fuzzy term
    /// matching when the exact query finds nothing. Scores are raw BM25.
    pub fn keyword_search(
        &self,
        account_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(EntryId, f32)>> {
        #[cfg(not(feature = "fulltext"))]
        {
            let _ = (account_id, query, limit);
            return Err(KeepsakeError::Search(
                "fulltext feature is disabled for this build".to_string(),
            ));
        }

        #[cfg(feature = "fulltext")]
        {
            check_account(account_id)?;
            let query = sanitize_query(query);
            if query.is_empty() || limit == 0 {
                return Ok(Vec::new());
            }

            let entries = self.current_entries(account_id)?;
            if entries.is_empty() {
                return Ok(Vec::new());
            }

            let (index, id_field, content_field) = Self::build_search_index(&entries)?;
            let reader = index.reader()?;
            let searcher = reader.searcher();

            let parser = QueryParser::for_index(&index, vec![content_field]);
            let parsed = parser.parse_query(&query)?;
            let mut top_docs = searcher.search(&parsed, &TopDocs::with_limit(limit))?;

            // Fuzzy fallback for typos ("brithday").
            if top_docs.is_empty() {
                let fuzzy = Self::build_fuzzy_query(&query, content_field);
                top_docs = searcher.search(&fuzzy, &TopDocs::with_limit(limit))?;
            }

            let mut results = Vec::with_capacity(top_docs.len());
            for (score, addr) in top_docs {
                let retrieved = searcher.doc::<tantivy::schema::TantivyDocument>(addr)?;
                if let Some(id_val) = retrieved.get_first(id_field).and_then(|v| v.as_str()) {
                    results.push((EntryId(id_val.to_string()), score));
                }
            }
            Ok(results)
        }
    }

    #[cfg(feature = "fulltext")]
    fn build_search_index(entries: &[KnowledgeEntry]) -> Result<(Index, Field, Field)> {
        let mut schema_builder = Schema::builder();
        let id_field = schema_builder.add_text_field("id", STRING | STORED);
        let content_field = schema_builder.add_text_field("content", TEXT);
        let schema = schema_builder.build();
        let index = Index::create_in_ram(schema);
        let mut writer = index.writer(50_000_000)?;

        for entry in entries {
            let body = if entry.enhanced_content.is_empty() {
                entry.content.as_str()
            } else {
                entry.enhanced_content.as_str()
            };
            let tags: Vec<&str> = entry.tags.iter().map(String::as_str).collect();
            let content = format!("{} {}", body, tags.join(" "));

            writer.add_document(doc!(
                id_field => entry.id.0.clone(),
                content_field => content,
            ))?;
        }

        writer.commit()?;
        Ok((index, id_field, content_field))
    }

    #[cfg(feature = "fulltext")]
    fn build_fuzzy_query(query: &str, content_field: Field) -> BooleanQuery {
        let terms: Vec<(Occur, Box<dyn tantivy::query::Query>)> = query
            .split_whitespace()
            .map(|token| {
                let term = Term::from_field_text(content_field, token);
                (
                    Occur::Should,
                    Box::new(FuzzyTermQuery::new(term, 1, true)) as Box<dyn tantivy::query::Query>,
                )
            })
            .collect();
        BooleanQuery::new(terms)
    }

    fn scan_entries(
        &self,
        account_id: &str,
        predicate: impl Fn(&KnowledgeEntry) -> bool,
    ) -> Result<Vec<KnowledgeEntry>> {
        let prefix = format!("{account_id}:");
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTRIES)?;
        let mut results = Vec::new();

        for row in table.range(prefix.as_str()..)? {
            let (k, v) = row?;
            if !k.value().starts_with(&prefix) {
                break;
            }
            let entry: KnowledgeEntry = serde_json::from_str(v.value())?;
            if predicate(&entry) {
                results.push(entry);
            }
        }

        Ok(results)
    }

    /// Hydrate every entry referenced under `"{account}:{value}:"` in an
    /// index table.
    fn scan_index(
        &self,
        table_def: TableDefinition<&str, &str>,
        account_id: &str,
        value: &str,
    ) -> Result<Vec<KnowledgeEntry>> {
        let prefix = format!("{account_id}:{value}:");
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(table_def)?;
        let entries = read_txn.open_table(ENTRIES)?;
        let mut results = Vec::new();

        for row in index.range(prefix.as_str()..)? {
            let (k, v) = row?;
            let Some(rest) = k.value().strip_prefix(&prefix) else {
                break;
            };
            // "a" must not pick up rows of "a:b".
            if rest.contains(':') {
                continue;
            }
            let key = format!("{account_id}:{}", v.value());
            if let Some(raw) = entries.get(key.as_str())? {
                results.push(serde_json::from_str(raw.value())?);
            }
        }

        Ok(results)
    }
}

impl EntryStore for KnowledgeStore {
    fn find_by_id(&self, account_id: &str, id: &str) -> Result<Option<KnowledgeEntry>> {
        check_account(account_id)?;
        let id = id.trim();
        if id.is_empty() || id.contains(':') {
            return Ok(None);
        }
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTRIES)?;
        let key = format!("{account_id}:{id}");
        match table.get(key.as_str())? {
            Some(raw) => Ok(Some(serde_json::from_str(raw.value())?)),
            None => Ok(None),
        }
    }

    fn find_current_by_tag(&self, account_id: &str, tag: &str) -> Result<Vec<KnowledgeEntry>> {
        check_account(account_id)?;
        let tag = tag.trim().to_lowercase();
        if tag.is_empty() {
            return Ok(Vec::new());
        }
        let mut found = self.scan_index(ENTRY_TAGS, account_id, &tag)?;
        found.retain(KnowledgeEntry::is_current);
        Ok(found)
    }

    fn find_by_concept(&self, account_id: &str, concept: &str) -> Result<Vec<KnowledgeEntry>> {
        check_account(account_id)?;
        let concept = concept.trim();
        if concept.is_empty() {
            return Ok(Vec::new());
        }
        self.scan_index(ENTRY_CONCEPTS, account_id, concept)
    }

    fn current_entries(&self, account_id: &str) -> Result<Vec<KnowledgeEntry>> {
        check_account(account_id)?;
        self.scan_entries(account_id, KnowledgeEntry::is_current)
    }

    /// Stores the entry row. An entry with `indexed_at == None` has any
    /// previously stored embedding dropped, so it is not found by stale text.
    fn upsert(&self, entry: &KnowledgeEntry) -> Result<()> {
        check_account(&entry.account_id)?;
        let write_txn = self.db.begin_write()?;
        Self::write_entry_in_txn(&write_txn, entry)?;
        let drop_embedding = entry.indexed_at.is_none();
        if drop_embedding {
            let mut emb_table = write_txn.open_table(EMBEDDINGS)?;
            emb_table.remove(entry.id.as_str())?;
        }
        write_txn.commit()?;

        if drop_embedding {
            self.lock_index()?.remove(&entry.id);
        }
        Ok(())
    }

    fn mark_superseded(&self, account_id: &str, id: &EntryId, replaced_by: &str) -> Result<bool> {
        check_account(account_id)?;
        let replaced_by = replaced_by.trim();
        if replaced_by.is_empty() {
            return Err(KeepsakeError::InvalidInput(
                "replaced_by must not be blank".into(),
            ));
        }

        let key = entry_key(account_id, id);
        let write_txn = self.db.begin_write()?;
        let mut entry: KnowledgeEntry = {
            let table = write_txn.open_table(ENTRIES)?;
            let raw = table.get(key.as_str())?.map(|g| g.value().to_string());
            match raw {
                Some(r) => serde_json::from_str(&r)?,
                None => return Err(KeepsakeError::NotFound(format!("entry id {id}"))),
            }
        };
        if entry.is_superseded() {
            return Ok(false);
        }

        entry.replaced_by = Some(replaced_by.to_string());
        if entry.concept.is_none() {
            entry.concept = Some(entry.id.0.clone());
        }
        Self::write_entry_in_txn(&write_txn, &entry)?;
        write_txn.commit()?;
        Ok(true)
    }
}

fn entry_key(account_id: &str, id: &EntryId) -> String {
    format!("{account_id}:{id}")
}

fn index_key(account_id: &str, value: &str, id: &EntryId) -> String {
    format!("{account_id}:{value}:{id}")
}

/// Account ids are key prefixes, so they must be non-blank and colon-free.
fn check_account(account_id: &str) -> Result<()> {
    if account_id.trim().is_empty() {
        return Err(KeepsakeError::InvalidInput("account id must not be blank".into()));
    }
    if account_id.contains(':') {
        return Err(KeepsakeError::InvalidInput(format!(
            "account id '{account_id}' must not contain ':'"
        )));
    }
    Ok(())
}

/// Strip query-syntax characters so free text always parses.
#[cfg(feature = "fulltext")]
fn sanitize_query(query: &str) -> String {
    query
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Group entries by id for hydrating ranked id lists.
pub fn index_by_id(entries: Vec<KnowledgeEntry>) -> HashMap<EntryId, KnowledgeEntry> {
    entries.into_iter().map(|e| (e.id.clone(), e)).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

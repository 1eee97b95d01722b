//! Supersession chains.
//!
//! An update names what it replaces with a free-form `replaces` string: an
//! entry id, a concept id, or something tag-like such as `"family-reunion"`.
//! [`RevisionChainTracker`] resolves that string to current entries and
//! retires them; [`RevisionChain`] reads a whole chain back through its
//! concept id.

use crate::{EntryId, EntryStore, KeepsakeError, KnowledgeEntry, Result};
use tracing::{debug, info};

/// Store-native ids (ULIDs) are longer than any tag-like reference.
const ID_LIKE_MIN_LEN: usize = 11;

/// Which lookup resolved a `replaces` reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Id,
    Concept,
    Tag,
    SpacedTag,
    TagToken,
}

/// Resolves `replaces` references and marks predecessors superseded.
pub struct RevisionChainTracker<'a, S: EntryStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: EntryStore + ?Sized> RevisionChainTracker<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Find the current entries `replaces` refers to.
    ///
    /// Strategies run in order and the first one yielding at least one
    /// current entry wins:
    ///
    /// 1. id lookup, when `replaces` looks like a store id;
    /// 2. exact concept id;
    /// 3. `replaces` as a literal tag;
    /// 4. hyphens read as spaces (`family-reunion` → `family reunion`);
    /// 5. each hyphen-delimited token as a tag, in order.
    pub fn resolve(
        &self,
        account_id: &str,
        replaces: &str,
    ) -> Result<Option<(Resolution, Vec<KnowledgeEntry>)>> {
        let replaces = replaces.trim();
        if replaces.is_empty() {
            return Ok(None);
        }

        if replaces.len() >= ID_LIKE_MIN_LEN {
            if let Some(entry) = self.store.find_by_id(account_id, replaces)? {
                if entry.is_current() {
                    return Ok(Some((Resolution::Id, vec![entry])));
                }
            }
        }

        let mut by_concept = self.store.find_by_concept(account_id, replaces)?;
        by_concept.retain(KnowledgeEntry::is_current);
        if !by_concept.is_empty() {
            return Ok(Some((Resolution::Concept, by_concept)));
        }

        let literal = self.store.find_current_by_tag(account_id, replaces)?;
        if !literal.is_empty() {
            return Ok(Some((Resolution::Tag, literal)));
        }

        if replaces.contains('-') {
            let spaced = self
                .store
                .find_current_by_tag(account_id, &replaces.replace('-', " "))?;
            if !spaced.is_empty() {
                return Ok(Some((Resolution::SpacedTag, spaced)));
            }

            for token in replaces.split('-').filter(|t| !t.trim().is_empty()) {
                let found = self.store.find_current_by_tag(account_id, token)?;
                if !found.is_empty() {
                    return Ok(Some((Resolution::TagToken, found)));
                }
            }
        }

        Ok(None)
    }

    /// Supersede every current entry `replaces` resolves to, stamping
    /// `replaced_by = new_event_time`.
    ///
    /// Returns the entries this call actually retired, as now stored. An
    /// empty result is not an error: the caller stores its entry as a plain
    /// create. Entries another writer retired first are skipped.
    pub fn handle_replacement(
        &self,
        account_id: &str,
        replaces: &str,
        new_event_time: &str,
    ) -> Result<Vec<KnowledgeEntry>> {
        if new_event_time.trim().is_empty() {
            return Err(KeepsakeError::InvalidInput(
                "replacement event time must not be blank".into(),
            ));
        }

        let Some((resolution, found)) = self.resolve(account_id, replaces)? else {
            info!(
                account = account_id,
                replaces, "no current predecessor found; storing as a new entry"
            );
            return Ok(Vec::new());
        };

        let mut superseded = Vec::with_capacity(found.len());
        for mut entry in found {
            if self
                .store
                .mark_superseded(account_id, &entry.id, new_event_time)?
            {
                entry.replaced_by = Some(new_event_time.to_string());
                if entry.concept.is_none() {
                    entry.concept = Some(entry.id.0.clone());
                }
                superseded.push(entry);
            } else {
                debug!(entry = %entry.id, "predecessor already superseded by another writer");
            }
        }

        debug!(
            account = account_id,
            replaces,
            ?resolution,
            count = superseded.len(),
            "superseded predecessors"
        );
        Ok(superseded)
    }

    /// Retire a specific set of entries (used where the caller already
    /// selected them, e.g. list reconciliation).
    pub fn supersede_entries(
        &self,
        account_id: &str,
        ids: &[EntryId],
        new_event_time: &str,
    ) -> Result<Vec<EntryId>> {
        let mut retired = Vec::with_capacity(ids.len());
        for id in ids {
            if self.store.mark_superseded(account_id, id, new_event_time)? {
                retired.push(id.clone());
            }
        }
        Ok(retired)
    }
}

/// The concept id a successor of `superseded` should carry.
pub fn successor_concept(superseded: &[KnowledgeEntry]) -> Option<String> {
    superseded.first().map(|e| e.concept_key().to_string())
}

/// Every version of one concept, oldest first.
#[derive(Debug, Clone)]
pub struct RevisionChain {
    concept: String,
    entries: Vec<KnowledgeEntry>,
}

impl RevisionChain {
    /// Load the chain `entry_id` belongs to.
    ///
    /// An entry that has never been part of a supersession forms a chain of
    /// one.
    pub fn load<S: EntryStore + ?Sized>(store: &S, account_id: &str, entry_id: &str) -> Result<Self> {
        let entry = store
            .find_by_id(account_id, entry_id)?
            .ok_or_else(|| KeepsakeError::NotFound(format!("entry id {entry_id}")))?;
        let concept = entry.concept_key().to_string();

        let mut entries = match entry.concept.as_deref() {
            Some(c) => store.find_by_concept(account_id, c)?,
            None => Vec::new(),
        };
        if !entries.iter().any(|e| e.id == entry.id) {
            entries.push(entry);
        }
        entries.sort_by(|a, b| {
            a.event_time()
                .cmp(&b.event_time())
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(Self { concept, entries })
    }

    pub fn concept(&self) -> &str {
        &self.concept
    }

    /// The head of the chain: the newest entry that is not superseded.
    pub fn current(&self) -> Option<&KnowledgeEntry> {
        self.entries.iter().rev().find(|e| e.is_current())
    }

    /// All versions, oldest first.
    pub fn history(&self) -> &[KnowledgeEntry] {
        &self.entries
    }

    /// At most one version is current.
    pub fn is_consistent(&self) -> bool {
        self.entries.iter().filter(|e| e.is_current()).count() <= 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//! Shopping-list reconciliation.
//!
//! List entries are ordinary knowledge entries tagged `shopping` or
//! `groceries`. A purchase supersedes every list entry it touches and
//! re-creates whatever was left unbought; a clear supersedes the whole list.
//! Both leave a record entry behind so the history stays searchable.

use keepsake::{normalize_tags, EntryStore, KeepsakeError, KnowledgeEntry, RevisionChainTracker};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::{debug, info};

use crate::{Actor, EntryId, Intent, KnowledgeBase, Result};

/// Tags that put an entry on a shopping list.
pub const LIST_TAGS: [&str; 2] = ["shopping", "groceries"];
pub const PURCHASED_TAG: &str = "purchased";
pub const CLEARED_TAG: &str = "cleared";

/// Tags marking purchase/clear records, never carried over to list entries.
const RECORD_TAGS: [&str; 2] = [PURCHASED_TAG, CLEARED_TAG];

/// Interchangeable item names.
const SUBSTITUTIONS: &[&[&str]] = &[
    &[
        "milk",
        "whole milk",
        "skim milk",
        "skimmed milk",
        "semi-skimmed milk",
        "2% milk",
        "1% milk",
        "oat milk",
        "almond milk",
    ],
    &["bread", "loaf", "sourdough", "baguette", "whole wheat bread", "white bread"],
    &["eggs", "egg", "dozen eggs", "free range eggs"],
    &["soda", "pop", "soft drink", "cola", "coke"],
    &["toilet paper", "toilet roll", "loo roll", "tp"],
    &["ground beef", "mince", "minced beef", "hamburger meat"],
    &["chips", "crisps"],
    &["cilantro", "coriander"],
    &["zucchini", "courgette"],
    &["eggplant", "aubergine"],
];

static LEADING_VERB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:(?:i|we)\s+)?(?:need(?:\s+to\s+(?:buy|get|pick\s+up))?|add|buy|get|grab|pick\s+up)\b\s*(?:some\s+|more\s+)?",
    )
    .expect("Invalid regex")
});

static TRAILING_PLACE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\s+(?:(?:from|at)\s+the\s+(?:store|shop|shops|supermarket|market)|to\s+the\s+(?:shopping\s+|grocery\s+)?list)\s*$",
    )
    .expect("Invalid regex")
});

static SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*(?:,|;|&|\band\b|\n)\s*").expect("Invalid regex"));

/// What [`KnowledgeBase::handle_purchase`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOutcome {
    /// The "Purchased …" record.
    pub record: EntryId,
    /// List entries retired by this purchase.
    pub superseded: Vec<EntryId>,
    /// Entries re-created with the items that were not bought.
    pub remaining: Vec<EntryId>,
    /// List items the purchase accounted for.
    pub matched_items: Vec<String>,
    /// Purchased items that matched nothing on the list.
    pub unmatched_items: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearOutcome {
    pub record: EntryId,
    pub superseded: Vec<EntryId>,
}

/// Lowercase, trim, and drop articles and trailing punctuation.
fn normalize_item(item: &str) -> String {
    let item = item
        .trim()
        .trim_end_matches(['.', '!', '?'])
        .trim()
        .to_lowercase();
    for article in ["some ", "a ", "an ", "the "] {
        if let Some(rest) = item.strip_prefix(article) {
            return rest.trim().to_string();
        }
    }
    item
}

/// Items named in free text such as "Need milk, eggs and bread from the store".
pub fn parse_items(content: &str) -> Vec<String> {
    let content = content.trim().trim_end_matches(['.', '!']);
    let body = LEADING_VERB.replace(content, "");
    let body = TRAILING_PLACE.replace(&body, "");
    let mut items: Vec<String> = Vec::new();
    for part in SEPARATORS.split(&body) {
        let item = normalize_item(part);
        if !item.is_empty() && !items.contains(&item) {
            items.push(item);
        }
    }
    items
}

/// The entry's explicit items, or those parsed from its content.
pub fn extract_items(entry: &KnowledgeEntry) -> Vec<String> {
    match &entry.items {
        Some(items) if !items.is_empty() => {
            let mut out: Vec<String> = Vec::with_capacity(items.len());
            for item in items.iter().map(|i| normalize_item(i)) {
                if !item.is_empty() && !out.contains(&item) {
                    out.push(item);
                }
            }
            out
        }
        _ => parse_items(&entry.content),
    }
}

/// Exact, substring either way, or same substitution group.
pub fn items_match(a: &str, b: &str) -> bool {
    let a = normalize_item(a);
    let b = normalize_item(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b || a.contains(&b) || b.contains(&a) {
        return true;
    }
    SUBSTITUTIONS
        .iter()
        .any(|group| group.contains(&a.as_str()) && group.contains(&b.as_str()))
}

fn is_on_list(entry: &KnowledgeEntry, list_type: &str) -> bool {
    list_type == "all"
        || entry.list_type.as_deref() == Some(list_type)
        || (entry.list_type.is_none() && entry.has_tag(list_type))
}

impl KnowledgeBase {
    /// Current shopping-list entries, oldest first. Purchase and clear
    /// records are not list entries.
    pub fn get_active_items(&self, account_id: &str) -> Result<Vec<KnowledgeEntry>> {
        let mut active: Vec<KnowledgeEntry> = self
            .store
            .find_current_by_any_tag(account_id, &LIST_TAGS)?
            .into_iter()
            .filter(|e| e.intent.is_content() && !e.has_any_tag(&RECORD_TAGS))
            .collect();
        active.sort_by(|a, b| {
            a.event_time()
                .cmp(&b.event_time())
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(active)
    }

    /// Reconcile a purchase against the active list.
    ///
    /// Every list entry with at least one matching item is superseded; its
    /// unbought items move to a fresh entry in the same chain. One
    /// `Purchase` record is written regardless.
    pub fn handle_purchase(
        &self,
        actor: &Actor,
        purchased: &[String],
        tags: &[String],
    ) -> Result<PurchaseOutcome> {
        actor.validate()?;
        let mut bought: Vec<String> = Vec::new();
        for item in purchased.iter().map(|i| normalize_item(i)) {
            if !item.is_empty() && !bought.contains(&item) {
                bought.push(item);
            }
        }
        if bought.is_empty() {
            return Err(KeepsakeError::InvalidInput(
                "purchase must name at least one item".into(),
            ));
        }

        let account = actor.account_id.as_str();
        let now = self.clock.now();
        let timestamp = now.to_rfc3339();
        let tracker = RevisionChainTracker::new(&self.store);

        let mut superseded = Vec::new();
        let mut remaining_ids = Vec::new();
        let mut matched_items = Vec::new();
        let mut used = vec![false; bought.len()];

        for entry in self.get_active_items(account)? {
            let items = extract_items(&entry);
            let (matched, remaining): (Vec<String>, Vec<String>) = items
                .into_iter()
                .partition(|item| bought.iter().any(|b| items_match(b, item)));
            if matched.is_empty() {
                continue;
            }

            // Predecessor first; a racing purchase that already retired it wins.
            if tracker
                .supersede_entries(account, std::slice::from_ref(&entry.id), &timestamp)?
                .is_empty()
            {
                debug!(entry = %entry.id, "list entry already superseded; skipping");
                continue;
            }
            for (flag, b) in used.iter_mut().zip(&bought) {
                if matched.iter().any(|m| items_match(b, m)) {
                    *flag = true;
                }
            }
            superseded.push(entry.id.clone());
            matched_items.extend(matched);

            if !remaining.is_empty() {
                let mut rest = KnowledgeEntry::new(
                    account,
                    format!("Need {}", remaining.join(", ")),
                    actor.user_id.as_str(),
                    actor.name(),
                    now,
                );
                rest.timestamp = timestamp.clone();
                rest.tags = entry
                    .tags
                    .iter()
                    .filter(|t| !RECORD_TAGS.contains(&t.as_str()))
                    .cloned()
                    .collect();
                rest.replaces = Some(entry.id.to_string());
                rest.concept = Some(entry.concept_key().to_string());
                rest.list_type = entry.list_type.clone();
                rest.items = Some(remaining);
                remaining_ids.push(self.store_new(rest)?);
            }
        }

        let unmatched_items: Vec<String> = bought
            .iter()
            .zip(&used)
            .filter(|(_, used)| !**used)
            .map(|(b, _)| b.clone())
            .collect();

        let mut record = KnowledgeEntry::new(
            account,
            format!("Purchased {}", bought.join(", ")),
            actor.user_id.as_str(),
            actor.name(),
            now,
        );
        record.timestamp = timestamp;
        record.intent = Intent::Purchase;
        record.tags = normalize_tags(
            ["shopping", PURCHASED_TAG]
                .into_iter()
                .chain(tags.iter().map(String::as_str)),
        );
        record.items = Some(bought);
        let record = self.store_new(record)?;

        info!(
            account,
            superseded = superseded.len(),
            remaining = remaining_ids.len(),
            unmatched = unmatched_items.len(),
            "purchase reconciled"
        );
        Ok(PurchaseOutcome {
            record,
            superseded,
            remaining: remaining_ids,
            matched_items,
            unmatched_items,
        })
    }

    /// Supersede every active entry of `list_type` and write a `ClearList`
    /// record. `"all"` clears every list.
    pub fn clear_list(&self, actor: &Actor, list_type: &str) -> Result<ClearOutcome> {
        actor.validate()?;
        let list_type = list_type.trim().to_lowercase();
        if list_type.is_empty() {
            return Err(KeepsakeError::InvalidInput("list type must not be blank".into()));
        }

        let account = actor.account_id.as_str();
        let now = self.clock.now();
        let timestamp = now.to_rfc3339();

        let targets: Vec<EntryId> = self
            .get_active_items(account)?
            .into_iter()
            .filter(|e| is_on_list(e, &list_type))
            .map(|e| e.id)
            .collect();
        let superseded =
            RevisionChainTracker::new(&self.store).supersede_entries(account, &targets, &timestamp)?;

        let mut record = KnowledgeEntry::new(
            account,
            format!("Cleared the {list_type} list"),
            actor.user_id.as_str(),
            actor.name(),
            now,
        );
        record.timestamp = timestamp;
        record.intent = Intent::ClearList;
        record.set_tags(["shopping", CLEARED_TAG, list_type.as_str()]);
        record.list_type = Some(list_type.clone());
        let record = self.store_new(record)?;

        info!(account, list = list_type.as_str(), superseded = superseded.len(), "list cleared");
        Ok(ClearOutcome { record, superseded })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use crate::NewEntry;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_items_from_free_text() {
        assert_eq!(
            parse_items("Need milk, eggs and bread from the store"),
            vec!["milk", "eggs", "bread"]
        );
        assert_eq!(parse_items("Add bananas to the shopping list"), vec!["bananas"]);
        assert_eq!(parse_items("We need to buy some apples & pears."), vec!["apples", "pears"]);
        assert_eq!(parse_items("olive oil"), vec!["olive oil"]);
    }

    #[test]
    fn fuzzy_item_matching() {
        assert!(items_match("Milk", "milk"));
        assert!(items_match("milk", "whole milk"));
        assert!(items_match("2% milk", "skim milk"));
        assert!(items_match("coriander", "cilantro"));
        assert!(!items_match("bread", "cheese"));
        assert!(!items_match("", "cheese"));
    }

    #[test]
    fn purchase_conserves_items() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        let list = kb
            .process_and_store(
                &sam(),
                NewEntry::new("Need apples, bread and cheese").with_tags(["shopping"]),
            )
            .unwrap();

        let outcome = kb
            .handle_purchase(&sam(), &strings(&["bread"]), &[])
            .unwrap();
        assert_eq!(outcome.superseded, vec![list.clone()]);
        assert_eq!(outcome.remaining.len(), 1);
        assert_eq!(outcome.matched_items, vec!["bread"]);
        assert!(outcome.unmatched_items.is_empty());

        let old = kb.get_entry("personal", &list).unwrap();
        assert!(old.is_superseded());

        let rest = kb.get_entry("personal", &outcome.remaining[0]).unwrap();
        assert_eq!(rest.items, Some(strings(&["apples", "cheese"])));
        assert_eq!(rest.intent, Intent::Create);
        assert!(rest.has_tag("shopping"));
        assert_eq!(rest.concept.as_deref(), Some(list.as_str()));
        assert_eq!(old.replaced_by.as_deref(), Some(rest.timestamp.as_str()));

        let record = kb.get_entry("personal", &outcome.record).unwrap();
        assert_eq!(record.intent, Intent::Purchase);
        assert_eq!(record.items, Some(strings(&["bread"])));
        assert_eq!(record.content, "Purchased bread");
        assert!(record.has_tag("shopping") && record.has_tag("purchased"));

        let active = kb.get_active_items("personal").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, rest.id);
    }

    #[test]
    fn fully_bought_entry_leaves_no_remainder() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        kb.process_and_store(
            &sam(),
            NewEntry::new("milk run")
                .with_tags(["groceries"])
                .with_items(["Whole milk"]),
        )
        .unwrap();

        let outcome = kb
            .handle_purchase(&sam(), &strings(&["milk", "batteries"]), &strings(&["costco"]))
            .unwrap();
        assert_eq!(outcome.superseded.len(), 1);
        assert!(outcome.remaining.is_empty());
        assert_eq!(outcome.unmatched_items, vec!["batteries"]);
        assert!(kb.get_active_items("personal").unwrap().is_empty());

        let record = kb.get_entry("personal", &outcome.record).unwrap();
        assert!(record.has_tag("costco"));
    }

    #[test]
    fn untouched_entries_stay_active() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        let keep = kb
            .process_and_store(&sam(), NewEntry::new("Buy lightbulbs").with_tags(["shopping"]))
            .unwrap();
        let outcome = kb.handle_purchase(&sam(), &strings(&["eggs"]), &[]).unwrap();
        assert!(outcome.superseded.is_empty());
        assert_eq!(kb.get_active_items("personal").unwrap()[0].id, keep);
    }

    #[test]
    fn empty_purchase_is_rejected() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        assert!(matches!(
            kb.handle_purchase(&sam(), &strings(&["  "]), &[]),
            Err(KeepsakeError::InvalidInput(_))
        ));
    }

    #[test]
    fn clear_list_supersedes_only_that_list() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        let a = kb
            .process_and_store(&sam(), NewEntry::new("Need milk").with_tags(["groceries"]))
            .unwrap();
        let b = kb
            .process_and_store(
                &sam(),
                NewEntry::new("Need eggs")
                    .with_tags(["shopping"])
                    .with_list_type("Groceries"),
            )
            .unwrap();
        let other = kb
            .process_and_store(
                &sam(),
                NewEntry::new("Need a drill")
                    .with_tags(["shopping"])
                    .with_list_type("hardware"),
            )
            .unwrap();

        let outcome = kb.clear_list(&sam(), "groceries").unwrap();
        assert_eq!(outcome.superseded.len(), 2);
        assert!(outcome.superseded.contains(&a));
        assert!(outcome.superseded.contains(&b));

        let active = kb.get_active_items("personal").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, other);

        let record = kb.get_entry("personal", &outcome.record).unwrap();
        assert_eq!(record.intent, Intent::ClearList);
        assert!(record.has_tag("cleared"));
    }

    #[test]
    fn clear_all_empties_every_list() {
        let (kb, _clock) = kb_at("2025-05-30T12:00:00Z");
        kb.process_and_store(&sam(), NewEntry::new("Need milk").with_tags(["groceries"]))
            .unwrap();
        kb.process_and_store(&sam(), NewEntry::new("Need a drill").with_tags(["shopping"]))
            .unwrap();
        assert_eq!(kb.clear_list(&sam(), "all").unwrap().superseded.len(), 2);
        assert!(kb.get_active_items("personal").unwrap().is_empty());
        assert!(kb.clear_list(&sam(), " ").is_err());
    }
}

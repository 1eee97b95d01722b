//! In-memory vector index for semantic similarity search.
//!
//! Flat (brute-force) cosine similarity over pre-computed embeddings. The
//! candidate lists this engine deals with are tens to low thousands of
//! entries per account, where a flat scan is fast enough.
//!
//! Callers supply embeddings; the store never generates them.
//!
//! # Complexity
//! - `insert`: O(n) replace-or-append
//! - `remove`: O(n) swap-remove
//! - `search`: O(n·d) where d is embedding dimension

use crate::{EntryId, KeepsakeError, Result};
use std::collections::HashSet;

#[derive(Debug, Clone)]
struct Slot {
    id: EntryId,
    embedding: Vec<f32>,
}

/// Flat vector index keyed by [`EntryId`].
///
/// The redb `embeddings` table is the source of truth; this index is
/// rebuilt from it whenever a store is opened.
#[derive(Debug, Default, Clone)]
pub struct VectorIndex {
    slots: Vec<Slot>,
    /// Set on first insert; later inserts and queries must match it.
    dim: Option<usize>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the embedding for `id`.
    ///
    /// # Errors
    /// [`KeepsakeError::InvalidEmbedding`] if `embedding` is empty or its
    /// dimension differs from the first embedding ever inserted.
    pub fn insert(&mut self, id: EntryId, embedding: Vec<f32>) -> Result<()> {
        if embedding.is_empty() {
            return Err(KeepsakeError::InvalidEmbedding(
                "embedding must not be empty".into(),
            ));
        }
        match self.dim {
            None => self.dim = Some(embedding.len()),
            Some(d) if d != embedding.len() => {
                return Err(KeepsakeError::InvalidEmbedding(format!(
                    "embedding dimension mismatch: expected {d}, got {}",
                    embedding.len()
                )));
            }
            Some(_) => {}
        }

        // Edits re-embed the same entry.
        if let Some(slot) = self.slots.iter_mut().find(|s| s.id == id) {
            slot.embedding = embedding;
        } else {
            self.slots.push(Slot { id, embedding });
        }
        Ok(())
    }

    /// Remove the entry for `id`. No-op if absent.
    ///
    /// Superseded entries are *not* removed (they are filtered through the
    /// allow-list in [`search`](Self::search)); only physical deletion evicts.
    pub fn remove(&mut self, id: &EntryId) {
        if let Some(pos) = self.slots.iter().position(|s| &s.id == id) {
            self.slots.swap_remove(pos);
        }
    }

    /// Top-`k` entries from the `allowed` set with cosine similarity of at
    /// least `threshold`, most similar first.
    ///
    /// Equal scores keep insertion order.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        threshold: f32,
        allowed: &HashSet<EntryId>,
    ) -> Vec<(EntryId, f32)> {
        if k == 0 || allowed.is_empty() || self.slots.is_empty() {
            return Vec::new();
        }

        let query_norm = l2_norm(query);
        if query_norm == 0.0 {
            return Vec::new();
        }

        let mut scored: Vec<(EntryId, f32)> = self
            .slots
            .iter()
            .filter(|s| allowed.contains(&s.id))
            .map(|s| (s.id.clone(), cosine_similarity(query, &s.embedding, query_norm)))
            .filter(|(_, score)| *score >= threshold)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    pub fn contains(&self, id: &EntryId) -> bool {
        self.slots.iter().any(|s| &s.id == id)
    }

    pub(crate) fn dim(&self) -> Option<usize> {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Math helpers
// ---------------------------------------------------------------------------

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for a zero `b` or mismatched
/// lengths.
fn cosine_similarity(a: &[f32], b: &[f32], a_norm: f32) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let b_norm = l2_norm(b);
    if b_norm == 0.0 {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot / (a_norm * b_norm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_ids(n: usize) -> Vec<EntryId> {
        (0..n).map(|_| EntryId::new()).collect()
    }

    fn all_ids(ids: &[EntryId]) -> HashSet<EntryId> {
        ids.iter().cloned().collect()
    }

    #[test]
    fn cosine_basics() {
        let a = vec![1.0f32, 0.0];
        let norm = l2_norm(&a);
        assert!((cosine_similarity(&a, &a, norm) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &[0.0, 1.0], norm).abs() < 1e-6);
        assert!((cosine_similarity(&a, &[-1.0, 0.0], norm) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0], norm), 0.0);
    }

    #[test]
    fn insert_replaces_existing_id() {
        let mut idx = VectorIndex::new();
        let id = EntryId::new();
        idx.insert(id.clone(), vec![1.0, 0.0, 0.0]).unwrap();
        idx.insert(id.clone(), vec![0.0, 1.0, 0.0]).unwrap();
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn insert_rejects_empty_and_mismatched() {
        let mut idx = VectorIndex::new();
        assert!(matches!(
            idx.insert(EntryId::new(), vec![]),
            Err(KeepsakeError::InvalidEmbedding(_))
        ));
        idx.insert(EntryId::new(), vec![1.0, 0.0]).unwrap();
        assert!(matches!(
            idx.insert(EntryId::new(), vec![1.0, 0.0, 0.0]),
            Err(KeepsakeError::InvalidEmbedding(_))
        ));
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn remove_evicts_and_ignores_unknown() {
        let mut idx = VectorIndex::new();
        let id = EntryId::new();
        idx.insert(id.clone(), vec![1.0, 0.0]).unwrap();
        idx.remove(&EntryId::new());
        assert_eq!(idx.len(), 1);
        idx.remove(&id);
        assert!(idx.is_empty());
        assert!(!idx.contains(&id));
    }

    #[test]
    fn search_ranks_and_applies_threshold() {
        let mut idx = VectorIndex::new();
        let ids = make_ids(3);
        idx.insert(ids[0].clone(), vec![1.0, 0.0, 0.0]).unwrap();
        idx.insert(ids[1].clone(), vec![0.8, 0.6, 0.0]).unwrap();
        idx.insert(ids[2].clone(), vec![-1.0, 0.0, 0.0]).unwrap();

        let valid = all_ids(&ids);
        let results = idx.search(&[1.0, 0.0, 0.0], 3, -1.0, &valid);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, ids[0]);
        assert_eq!(results[1].0, ids[1]);
        assert_eq!(results[2].0, ids[2]);

        let above = idx.search(&[1.0, 0.0, 0.0], 3, 0.5, &valid);
        assert_eq!(above.len(), 2, "the opposite vector must fall below threshold");
    }

    #[test]
    fn search_respects_allow_list_and_k() {
        let mut idx = VectorIndex::new();
        let ids = make_ids(5);
        for id in &ids {
            idx.insert(id.clone(), vec![1.0, 0.0]).unwrap();
        }
        let allowed: HashSet<EntryId> = [ids[0].clone(), ids[2].clone(), ids[4].clone()]
            .into_iter()
            .collect();
        let results = idx.search(&[1.0, 0.0], 2, 0.0, &allowed);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(id, _)| allowed.contains(id)));
        // Ties keep insertion order.
        assert_eq!(results[0].0, ids[0]);
        assert_eq!(results[1].0, ids[2]);
    }

    #[test]
    fn search_degenerate_inputs_return_empty() {
        let mut idx = VectorIndex::new();
        let id = EntryId::new();
        idx.insert(id.clone(), vec![1.0, 0.0]).unwrap();
        let valid = all_ids(&[id]);
        assert!(idx.search(&[1.0, 0.0], 0, 0.0, &valid).is_empty());
        assert!(idx.search(&[0.0, 0.0], 5, 0.0, &valid).is_empty());
        assert!(idx.search(&[1.0, 0.0], 5, 0.0, &HashSet::new()).is_empty());
    }
}

//! Re-indexing of entries stored while the embedder was unavailable.

use keepsake::{EntryStore, KnowledgeEntry};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{KnowledgeBase, MigrationConfig, Result};

/// Counters for one [`KnowledgeBase::reindex_pending`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Pending entries examined.
    pub processed: usize,
    pub indexed: usize,
    /// Still pending after this run.
    pub failed: usize,
    /// Indexed by someone else since the scan, or deleted.
    pub skipped: usize,
    pub batches: usize,
}

impl KnowledgeBase {
    /// Embed and index every entry of `account_id` that lacks an embedding.
    ///
    /// Runs in batches of `config.batch_size`, pausing `config.batch_delay`
    /// between batches. Entries that fail stay pending for the next run;
    /// running again over indexed entries does nothing.
    pub fn reindex_pending(&self, account_id: &str, config: &MigrationConfig) -> Result<MigrationReport> {
        let pending = self.store.pending_entries(account_id)?;
        let mut report = MigrationReport::default();
        if pending.is_empty() {
            debug!(account = account_id, "nothing to reindex");
            return Ok(report);
        }
        info!(account = account_id, pending = pending.len(), "reindexing entries");

        let batch_size = config.batch_size.max(1);
        for (n, batch) in pending.chunks(batch_size).enumerate() {
            if n > 0 && !config.batch_delay.is_zero() {
                std::thread::sleep(config.batch_delay);
            }
            report.batches += 1;

            // Re-read: another writer may have indexed, edited or deleted it.
            let mut fresh: Vec<KnowledgeEntry> = Vec::with_capacity(batch.len());
            for entry in batch {
                report.processed += 1;
                match self.store.find_by_id(account_id, entry.id.as_str())? {
                    Some(e) if e.indexed_at.is_none() => fresh.push(e),
                    _ => report.skipped += 1,
                }
            }
            if fresh.is_empty() {
                continue;
            }
            for entry in fresh.iter_mut().filter(|e| e.enhanced_content.trim().is_empty()) {
                self.enrich(entry);
            }

            let texts: Vec<String> = fresh.iter().map(|e| e.enhanced_content.clone()).collect();
            match self.embedder.embed_batch(&texts) {
                Ok(vectors) if vectors.len() == fresh.len() => {
                    for (entry, vector) in fresh.iter_mut().zip(vectors) {
                        self.finish(entry, vector, &mut report)?;
                    }
                }
                other => {
                    if let Err(e) = other {
                        warn!(error = %e, "batch embedding failed; retrying entries one by one");
                    }
                    for entry in fresh.iter_mut() {
                        match self.embedder.embed(&entry.enhanced_content) {
                            Ok(vector) => self.finish(entry, vector, &mut report)?,
                            Err(e) => {
                                warn!(entry = %entry.id, error = %e, "entry left pending");
                                report.failed += 1;
                            }
                        }
                    }
                }
            }
            info!(
                account = account_id,
                batch = n + 1,
                indexed = report.indexed,
                failed = report.failed,
                "reindex batch done"
            );
        }

        if report.indexed > 0 {
            self.cache.invalidate_prefix(account_id);
        }
        Ok(report)
    }

    fn finish(&self, entry: &mut KnowledgeEntry, vector: Vec<f32>, report: &mut MigrationReport) -> Result<()> {
        entry.indexed_at = Some(self.clock.now());
        match self.store.upsert_with_embedding(entry, vector) {
            Ok(()) => report.indexed += 1,
            Err(keepsake::KeepsakeError::InvalidEmbedding(reason)) => {
                warn!(entry = %entry.id, %reason, "embedding rejected; entry left pending");
                entry.indexed_at = None;
                report.failed += 1;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

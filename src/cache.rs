use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use crate::job::{AnalysisKind, AnalysisResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub image_index: usize,
    pub kind: AnalysisKind,
}

impl CacheKey {
    pub fn new(image_index: usize, kind: AnalysisKind) -> Self {
        Self { image_index, kind }
    }
}

#[derive(Debug, Clone)]
pub struct CachedAnalysis {
    pub result: Arc<AnalysisResult>,
    pub job_id: String,
    /// Reference of the image the job ran against, used to detect stale
    /// entries after the image set is reloaded.
    pub image_ref: String,
    pub stored_at: SystemTime,
}

/// Latest successful result per `(image index, analysis kind)`.
#[derive(Debug, Default)]
pub struct AnalysisCache {
    entries: BTreeMap<CacheKey, CachedAnalysis>,
    revision: u64,
}

impl AnalysisCache {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bumped on every mutation so observers can tell when to re-evaluate.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, image_index: usize, kind: AnalysisKind) -> Option<&CachedAnalysis> {
        self.entries.get(&CacheKey::new(image_index, kind))
    }

    pub fn contains(&self, image_index: usize, kind: AnalysisKind) -> bool {
        self.entries.contains_key(&CacheKey::new(image_index, kind))
    }

    pub fn has_any_for(&self, image_index: usize) -> bool {
        self.entries_for(image_index).next().is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CachedAnalysis> + '_ {
        self.entries.values()
    }

    pub fn entries_for(
        &self,
        image_index: usize,
    ) -> impl Iterator<Item = (AnalysisKind, &CachedAnalysis)> + '_ {
        self.entries
            .iter()
            .filter(move |(key, _)| key.image_index == image_index)
            .map(|(key, entry)| (key.kind, entry))
    }

    pub fn insert(&mut self, entry: CachedAnalysis) -> Option<CachedAnalysis> {
        let key = CacheKey::new(entry.result.image_index, entry.result.kind);
        self.revision += 1;
        self.entries.insert(key, entry)
    }

    /// Drops entries for `deleted` and moves every higher index down by one.
    /// Returns how many entries were purged.
    pub fn shift_after_delete(&mut self, deleted: usize) -> usize {
        let previous = std::mem::take(&mut self.entries);
        let mut purged = 0usize;
        for (key, entry) in previous {
            if key.image_index == deleted {
                purged += 1;
                continue;
            }
            if key.image_index < deleted {
                self.entries.insert(key, entry);
                continue;
            }
            let shifted_index = key.image_index - 1;
            let shifted = CachedAnalysis {
                result: Arc::new(entry.result.with_image_index(shifted_index)),
                ..entry
            };
            self.entries
                .insert(CacheKey::new(shifted_index, key.kind), shifted);
        }
        self.revision += 1;
        purged
    }

    /// Keeps only entries for which `keep(image_index, image_ref)` holds.
    pub fn retain(&mut self, mut keep: impl FnMut(usize, &str) -> bool) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|key, entry| keep(key.image_index, &entry.image_ref));
        let dropped = before - self.entries.len();
        if dropped > 0 {
            self.revision += 1;
        }
        dropped
    }
}

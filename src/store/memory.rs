//! In-memory [`CaseStore`].
//!
//! One `tokio::sync::Mutex` guards all state, so every trait method is a
//! single atomic unit of work.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CaseStore, Reassignment};
use crate::activity::ActivityEntry;
use crate::error::{CaseError, Result};
use crate::filter::{newest_first, CaseFilter, Page};
use crate::identifier::{CaseReference, SequenceKey};
use crate::record::CaseRecord;
use crate::types::CaseType;

#[derive(Debug, Default)]
struct Inner {
    cases: HashMap<CaseReference, CaseRecord>,
    activities: HashMap<CaseReference, Vec<ActivityEntry>>,
    sequences: HashMap<SequenceKey, u32>,
    last_activity_seq: u64,
}

impl Inner {
    fn push_activity(&mut self, mut entry: ActivityEntry) -> ActivityEntry {
        self.last_activity_seq += 1;
        entry.seq = self.last_activity_seq;
        self.activities
            .entry(entry.case.clone())
            .or_default()
            .push(entry.clone());
        entry
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a record that was issued elsewhere (e.g. migrated from the old
    /// system) without touching the sequence counters.
    pub async fn import(&self, record: CaseRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.cases.contains_key(&record.reference) {
            return Err(CaseError::DuplicateIdentifier {
                reference: record.reference.to_string(),
                attempts: 1,
            });
        }
        inner.cases.insert(record.reference.clone(), record);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.cases.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CaseStore for MemoryStore {
    async fn next_sequence(&self, key: &SequenceKey) -> Result<u32> {
        let mut inner = self.inner.lock().await;
        let counter = inner.sequences.entry(key.clone()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn insert(&self, record: &CaseRecord, opened: ActivityEntry) -> Result<ActivityEntry> {
        let mut inner = self.inner.lock().await;
        if inner.cases.contains_key(&record.reference) {
            return Err(CaseError::DuplicateIdentifier {
                reference: record.reference.to_string(),
                attempts: 1,
            });
        }
        inner
            .cases
            .insert(record.reference.clone(), record.clone());
        Ok(inner.push_activity(opened))
    }

    async fn load(&self, reference: &CaseReference) -> Result<Option<CaseRecord>> {
        Ok(self.inner.lock().await.cases.get(reference).cloned())
    }

    async fn commit(
        &self,
        record: &CaseRecord,
        expected_version: u64,
        activity: Option<ActivityEntry>,
    ) -> Result<Option<ActivityEntry>> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .cases
            .get_mut(&record.reference)
            .ok_or_else(|| CaseError::not_found(&record.reference))?;
        if stored.version != expected_version {
            return Err(CaseError::ConcurrentModification {
                reference: record.reference.to_string(),
            });
        }
        *stored = record.clone();
        Ok(activity.map(|entry| inner.push_activity(entry)))
    }

    async fn delete(&self, reference: &CaseReference) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.cases.remove(reference).is_none() {
            return Ok(false);
        }
        inner.activities.remove(reference);
        // Children outlive their parent, detached.
        for child in inner.cases.values_mut() {
            if child.parent.as_ref() == Some(reference) {
                child.parent = None;
                child.version += 1;
            }
        }
        Ok(true)
    }

    async fn append_activity(&self, entry: ActivityEntry) -> Result<ActivityEntry> {
        let mut inner = self.inner.lock().await;
        if !inner.cases.contains_key(&entry.case) {
            return Err(CaseError::not_found(&entry.case));
        }
        Ok(inner.push_activity(entry))
    }

    async fn activities(&self, reference: &CaseReference) -> Result<Vec<ActivityEntry>> {
        let inner = self.inner.lock().await;
        let mut entries = inner.activities.get(reference).cloned().unwrap_or_default();
        entries.sort_by(ActivityEntry::chronological);
        Ok(entries)
    }

    async fn query(&self, filter: &CaseFilter, page: Page) -> Result<Vec<CaseRecord>> {
        let inner = self.inner.lock().await;
        let mut matched: Vec<CaseRecord> = inner
            .cases
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        matched.sort_by(newest_first);
        Ok(matched
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }

    async fn open_cases(&self, case_type: CaseType) -> Result<Vec<CaseRecord>> {
        let inner = self.inner.lock().await;
        let mut open: Vec<CaseRecord> = inner
            .cases
            .values()
            .filter(|r| r.case_type() == case_type && !r.is_terminal())
            .cloned()
            .collect();
        open.sort_by(newest_first);
        Ok(open)
    }

    async fn has_open_children(&self, parent: &CaseReference) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner
            .cases
            .values()
            .any(|r| r.parent.as_ref() == Some(parent) && !r.is_terminal()))
    }

    async fn reassign_staff(&self, reassignment: &Reassignment) -> Result<Vec<CaseReference>> {
        let mut inner = self.inner.lock().await;
        let mut affected: Vec<CaseReference> = Vec::new();
        for record in inner.cases.values() {
            if record.assigned_to != Some(reassignment.from) {
                continue;
            }
            if !reassignment.allowed_types.contains(&record.case_type()) {
                return Err(reassignment.rejection(record.case_type()));
            }
            affected.push(record.reference.clone());
        }
        affected.sort();

        for reference in &affected {
            if let Some(record) = inner.cases.get_mut(reference) {
                record.assigned_to = reassignment.to;
                record.updated_at = reassignment.at.max(record.updated_at);
                record.version += 1;
            }
            let entry = reassignment.entry_for(reference);
            inner.push_activity(entry);
        }
        Ok(affected)
    }
}

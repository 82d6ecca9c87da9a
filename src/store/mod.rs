//! Persistence port for cases and their activity.
//!
//! The repository touches state only through [`CaseStore`], so backends are
//! pluggable: [`MemoryStore`] for tests and embedding, `PgCaseStore` (feature
//! `database`) for production.

mod memory;
#[cfg(feature = "database")]
mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "database")]
pub use postgres::PgCaseStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::activity::{ActivityEntry, NewActivity};
use crate::error::{CaseError, Result};
use crate::filter::{CaseFilter, Page};
use crate::identifier::{CaseReference, SequenceKey};
use crate::record::CaseRecord;
use crate::types::{Actor, CaseType, StaffId};

#[async_trait]
pub trait CaseStore: Send + Sync {
    // ── Identifiers ──

    /// Reserve the next sequence number for `key`. Atomic: concurrent callers
    /// never receive the same value.
    async fn next_sequence(&self, key: &SequenceKey) -> Result<u32>;

    // ── Records ──

    /// Insert a new record together with its opening activity entry.
    /// Fails with `DuplicateIdentifier` if the reference is taken.
    async fn insert(&self, record: &CaseRecord, opened: ActivityEntry) -> Result<ActivityEntry>;

    async fn load(&self, reference: &CaseReference) -> Result<Option<CaseRecord>>;

    /// Replace the stored record if its version still equals
    /// `expected_version`, appending `activity` in the same unit of work.
    /// Fails with `ConcurrentModification` on a stale version and leaves
    /// everything unchanged.
    async fn commit(
        &self,
        record: &CaseRecord,
        expected_version: u64,
        activity: Option<ActivityEntry>,
    ) -> Result<Option<ActivityEntry>>;

    /// Remove a record and its activity, clearing `parent` on any case that
    /// named it. Returns false if it did not exist.
    async fn delete(&self, reference: &CaseReference) -> Result<bool>;

    // ── Activity log (append-only) ──

    /// Append an entry and return it with its assigned sequence.
    /// Fails with `NotFound` if the case does not exist.
    async fn append_activity(&self, entry: ActivityEntry) -> Result<ActivityEntry>;

    /// Entries for a case, oldest first.
    async fn activities(&self, reference: &CaseReference) -> Result<Vec<ActivityEntry>>;

    // ── Queries ──

    /// Matching records, newest first.
    async fn query(&self, filter: &CaseFilter, page: Page) -> Result<Vec<CaseRecord>>;

    /// Every non-terminal case of `case_type`, newest first.
    async fn open_cases(&self, case_type: CaseType) -> Result<Vec<CaseRecord>>;

    /// Whether any non-terminal case names `parent` as its parent.
    async fn has_open_children(&self, parent: &CaseReference) -> Result<bool>;

    // ── Staff ownership ──

    /// Apply a [`Reassignment`] as one unit: every case owned by `from` moves
    /// to `to`, with version and `updated_at` bumped and one activity entry
    /// each. If any owned case has a type outside `allowed_types`, nothing
    /// changes and `Validation` is returned. Returns the affected references.
    async fn reassign_staff(&self, reassignment: &Reassignment) -> Result<Vec<CaseReference>>;
}

/// Hand-over of every case owned by one staff member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassignment {
    pub from: StaffId,
    /// `None` leaves the cases unassigned.
    pub to: Option<StaffId>,
    /// Case types `to` may own.
    pub allowed_types: Vec<CaseType>,
    /// Logged on every affected case.
    pub activity: NewActivity,
    pub actor: Actor,
    pub at: DateTime<Utc>,
}

impl Reassignment {
    pub(crate) fn entry_for(&self, reference: &CaseReference) -> ActivityEntry {
        self.activity
            .clone()
            .into_entry(reference.clone(), self.actor, self.at)
    }

    pub(crate) fn rejection(&self, case_type: CaseType) -> CaseError {
        CaseError::validation(
            "assigned_to",
            format!(
                "{} cannot take over {case_type} cases from {}",
                self.to.map_or_else(|| "unassigned".to_string(), |id| id.to_string()),
                self.from
            ),
        )
    }
}

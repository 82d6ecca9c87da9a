//! Case repository: identifier issuance, status updates, assignment,
//! listing and the activity log.
//!
//! Every mutating call takes an [`Actor`] and commits the record together
//! with its activity entry through [`CaseStore::commit`], guarded by the
//! version the record was loaded with.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::activity::{ActivityEntry, NewActivity};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{CaseError, Result};
use crate::filter::{CaseFilter, Page};
use crate::identifier::{CaseReference, SequenceKey};
use crate::obligations::{self, Obligations};
use crate::record::{CaseRecord, NewCase};
use crate::staff::{assignable_types, check_assignable, StaffDirectory};
use crate::status_machine;
use crate::store::{CaseStore, Reassignment};
use crate::types::{Actor, CaseStatus, CaseType, StaffId};

// ============================================================================
// Requests
// ============================================================================

/// A requested status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub to: CaseStatus,
    /// Appended to the activity text; stored as `resolution_notes` when the
    /// target status resolves or closes the case.
    #[serde(default)]
    pub note: Option<String>,
    /// Log a note even when `to` equals the current status.
    #[serde(default)]
    pub log_unchanged: bool,
}

impl StatusUpdate {
    pub fn to(status: CaseStatus) -> Self {
        Self {
            to: status,
            note: None,
            log_unchanged: false,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn log_unchanged(mut self) -> Self {
        self.log_unchanged = true;
        self
    }
}

// ============================================================================
// Repository
// ============================================================================

pub struct CaseRepository {
    store: Arc<dyn CaseStore>,
    clock: Arc<dyn Clock>,
    staff: Arc<dyn StaffDirectory>,
    config: EngineConfig,
}

impl CaseRepository {
    pub fn new(
        store: Arc<dyn CaseStore>,
        clock: Arc<dyn Clock>,
        staff: Arc<dyn StaffDirectory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            clock,
            staff,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ------------------------------------------------------------------------
    // Create / read
    // ------------------------------------------------------------------------

    /// Open a new case and issue its reference.
    ///
    /// Tickets take their default priority and SLA deadline from the category
    /// configuration. A reference collision (a record inserted outside the
    /// counter) is retried with a fresh sequence up to `create_retry_limit`
    /// times.
    #[instrument(skip_all, fields(case_type = %intake.case_type, actor = %actor))]
    pub async fn create(&self, intake: NewCase, actor: Actor) -> Result<CaseRecord> {
        let now = self.clock.now();
        let intake = self.prepare_intake(intake, now).await?;
        let key = SequenceKey::new(self.config.prefix(intake.case_type), now);
        let limit = self.config.create_retry_limit;

        let mut last_collision = String::new();
        for attempt in 1..=limit {
            let sequence = self.store.next_sequence(&key).await?;
            let reference = CaseReference::compose(&key, sequence)?;
            let record = CaseRecord::open(intake.clone(), reference, now)?;
            let opened = NewActivity::status_change(format!("Opened as {}", record.status))
                .into_entry(record.reference.clone(), actor, now);

            match self.store.insert(&record, opened).await {
                Ok(_) => {
                    info!(
                        reference = %record.reference,
                        status = %record.status,
                        priority = %record.priority,
                        "Case created"
                    );
                    return Ok(record);
                }
                Err(CaseError::DuplicateIdentifier { reference, .. }) => {
                    warn!(%reference, attempt, limit, "Reference collision, issuing a new one");
                    last_collision = reference;
                }
                Err(e) => return Err(e),
            }
        }

        error!(%key, limit, "Reference collisions not resolved");
        Err(CaseError::DuplicateIdentifier {
            reference: last_collision,
            attempts: limit,
        })
    }

    async fn prepare_intake(&self, mut intake: NewCase, now: DateTime<Utc>) -> Result<NewCase> {
        if intake.case_type == CaseType::Ticket {
            let name = intake
                .category
                .as_deref()
                .ok_or_else(|| CaseError::validation("category", "required for tickets"))?;
            let category = self.config.category(name)?;
            intake.priority.get_or_insert(category.default_priority);
            if intake.due_at.is_none() {
                intake.due_at = Some(obligations::sla_due_at(now, category.sla_hours));
            }
        }
        if let Some(staff) = intake.assigned_to {
            check_assignable(self.staff.as_ref(), staff, intake.case_type)?;
        }
        if let Some(parent) = &intake.parent {
            if self.store.load(parent).await?.is_none() {
                return Err(CaseError::not_found(parent));
            }
        }
        Ok(intake)
    }

    pub async fn get(&self, reference: &CaseReference) -> Result<CaseRecord> {
        self.store
            .load(reference)
            .await?
            .ok_or_else(|| CaseError::not_found(reference))
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Move a case to another status, stamping lifecycle timestamps and
    /// logging a `status_change` entry in the same commit.
    ///
    /// Requesting the current status succeeds without touching the record;
    /// a note is logged only when `log_unchanged` is set.
    #[instrument(skip_all, fields(reference = %reference, to = %update.to, actor = %actor))]
    pub async fn update_status(
        &self,
        reference: &CaseReference,
        update: StatusUpdate,
        actor: Actor,
    ) -> Result<CaseRecord> {
        let mut record = self.get(reference).await?;
        let expected = record.version;
        let now = self.clock.now();
        let transition = status_machine::apply(&mut record, update.to, now)?;

        if transition.is_null() {
            debug!(status = %record.status, "Null transition");
            if update.log_unchanged {
                let text = with_note(format!("Status unchanged: {}", record.status), &update.note);
                self.store
                    .append_activity(NewActivity::note(text).into_entry(
                        record.reference.clone(),
                        actor,
                        now,
                    ))
                    .await?;
            }
            return Ok(record);
        }

        if status_machine::resolution(update.to).is_some() {
            if let Some(note) = &update.note {
                record.resolution_notes = Some(note.clone());
            }
        }
        record.version += 1;
        record.validate()?;

        let text = with_note(
            format!("Status: {} → {}", transition.from, transition.to),
            &update.note,
        );
        let entry = NewActivity::status_change(text).into_entry(record.reference.clone(), actor, now);
        self.commit(&record, expected, entry).await?;

        info!(
            from = %transition.from,
            to = %transition.to,
            stamped = ?transition.stamped,
            "Status updated"
        );
        Ok(record)
    }

    /// Assign (or unassign with `None`) a case. The new owner must be an
    /// active staff member allowed to handle the case type.
    #[instrument(skip_all, fields(reference = %reference, actor = %actor))]
    pub async fn assign(
        &self,
        reference: &CaseReference,
        to: Option<StaffId>,
        actor: Actor,
    ) -> Result<CaseRecord> {
        let mut record = self.get(reference).await?;
        if record.assigned_to == to {
            debug!("Assignment unchanged");
            return Ok(record);
        }
        if let Some(staff) = to {
            check_assignable(self.staff.as_ref(), staff, record.case_type())?;
        }

        let expected = record.version;
        let now = self.clock.now();
        let text = format!(
            "Assigned: {} → {}",
            self.staff_label(record.assigned_to),
            self.staff_label(to)
        );
        record.assigned_to = to;
        touch(&mut record, now);

        let entry = NewActivity::status_change(text).into_entry(record.reference.clone(), actor, now);
        self.commit(&record, expected, entry).await?;
        info!(assigned_to = ?to, "Case assigned");
        Ok(record)
    }

    /// Log a contact with a lead or ticket requester.
    #[instrument(skip_all, fields(reference = %reference, actor = %actor))]
    pub async fn record_contact(
        &self,
        reference: &CaseReference,
        text: impl Into<String>,
        actor: Actor,
    ) -> Result<CaseRecord> {
        let text = non_blank(text.into())?;
        let mut record = self.get(reference).await?;
        if !matches!(record.case_type(), CaseType::Lead | CaseType::Ticket) {
            return Err(CaseError::validation(
                "case_type",
                format!("contacts are not tracked on {} cases", record.case_type()),
            ));
        }

        let expected = record.version;
        let now = self.clock.now();
        record.last_contact_at = Some(now);
        record.contact_attempts = record.contact_attempts.saturating_add(1);
        touch(&mut record, now);

        let entry = NewActivity::note(format!("Contact #{}: {text}", record.contact_attempts))
            .into_entry(record.reference.clone(), actor, now);
        self.commit(&record, expected, entry).await?;
        debug!(attempts = record.contact_attempts, "Contact recorded");
        Ok(record)
    }

    /// Set the follow-up, SLA or scheduled date. Contracts use `end_date`
    /// and cannot be rescheduled here.
    #[instrument(skip_all, fields(reference = %reference, actor = %actor))]
    pub async fn schedule(
        &self,
        reference: &CaseReference,
        due_at: DateTime<Utc>,
        actor: Actor,
    ) -> Result<CaseRecord> {
        let mut record = self.get(reference).await?;
        if record.case_type() == CaseType::Contract {
            return Err(CaseError::validation("due_at", "contracts run until end_date"));
        }
        if record.is_terminal() {
            return Err(CaseError::validation(
                "status",
                format!("{} is {}", record.reference, record.status),
            ));
        }

        let expected = record.version;
        let now = self.clock.now();
        record.due_at = Some(due_at);
        touch(&mut record, now);
        record.validate()?;

        let entry = NewActivity::note(format!("Due {}", due_at.format("%Y-%m-%d %H:%M UTC")))
            .into_entry(record.reference.clone(), actor, now);
        self.commit(&record, expected, entry).await?;
        Ok(record)
    }

    async fn commit(
        &self,
        record: &CaseRecord,
        expected_version: u64,
        entry: ActivityEntry,
    ) -> Result<()> {
        match self.store.commit(record, expected_version, Some(entry)).await {
            Ok(_) => Ok(()),
            Err(e @ CaseError::ConcurrentModification { .. }) => {
                warn!(reference = %record.reference, expected_version, "Rejected stale update");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn staff_label(&self, staff: Option<StaffId>) -> String {
        match staff {
            None => "Unassigned".to_string(),
            Some(id) => self
                .staff
                .get(id)
                .map(|member| member.name)
                .unwrap_or_else(|| id.to_string()),
        }
    }

    // ------------------------------------------------------------------------
    // Activity log
    // ------------------------------------------------------------------------

    /// Append a comment or note. Existing entries are never touched.
    #[instrument(skip_all, fields(reference = %reference, kind = %activity.kind))]
    pub async fn append(
        &self,
        reference: &CaseReference,
        activity: NewActivity,
        actor: Actor,
    ) -> Result<ActivityEntry> {
        let activity = NewActivity {
            text: non_blank(activity.text)?,
            ..activity
        };
        let entry = activity.into_entry(reference.clone(), actor, self.clock.now());
        self.store.append_activity(entry).await
    }

    /// Entries for a case, oldest first.
    pub async fn activities(&self, reference: &CaseReference) -> Result<Vec<ActivityEntry>> {
        self.get(reference).await?;
        self.store.activities(reference).await
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn find(&self, filter: &CaseFilter, page: Page) -> Result<Vec<CaseRecord>> {
        debug!(?filter, ?page, "Finding cases");
        self.store.query(filter, page).await
    }

    /// Open cases of `case_type` whose deadline has passed, most overdue first.
    #[instrument(skip(self))]
    pub async fn list_overdue(&self, case_type: CaseType) -> Result<Vec<CaseRecord>> {
        let now = self.clock.now();
        let mut overdue: Vec<CaseRecord> = self
            .store
            .open_cases(case_type)
            .await?
            .into_iter()
            .filter(|r| obligations::is_overdue(r, now))
            .collect();
        sort_by_deadline(&mut overdue);
        debug!(count = overdue.len(), "Overdue cases");
        Ok(overdue)
    }

    /// Open cases whose deadline falls within `window` (default
    /// `due_soon_hours`), soonest first.
    #[instrument(skip(self))]
    pub async fn list_due_soon(
        &self,
        case_type: CaseType,
        window: Option<Duration>,
    ) -> Result<Vec<CaseRecord>> {
        let now = self.clock.now();
        let window = window.unwrap_or_else(|| self.config.due_soon_window());
        let mut due: Vec<CaseRecord> = self
            .store
            .open_cases(case_type)
            .await?
            .into_iter()
            .filter(|r| obligations::is_due_within(r, now, window))
            .collect();
        sort_by_deadline(&mut due);
        Ok(due)
    }

    pub async fn obligations(&self, reference: &CaseReference) -> Result<Obligations> {
        let record = self.get(reference).await?;
        Ok(Obligations::evaluate(&record, self.clock.now()))
    }

    /// Number of cases per declared status of `case_type`, in declaration
    /// order (zero counts included).
    pub async fn status_counts(&self, case_type: CaseType) -> Result<Vec<(CaseStatus, u64)>> {
        let records = self
            .store
            .query(&CaseFilter::of_type(case_type), Page::all())
            .await?;
        Ok(CaseStatus::all(case_type)
            .into_iter()
            .map(|status| {
                let count = records.iter().filter(|r| r.status == status).count() as u64;
                (status, count)
            })
            .collect())
    }

    /// Percentage of leads matching `filter` that converted.
    pub async fn conversion_rate(&self, filter: CaseFilter) -> Result<f64> {
        let filter = CaseFilter {
            case_type: Some(CaseType::Lead),
            ..filter
        };
        let leads = self.store.query(&filter, Page::all()).await?;
        Ok(obligations::conversion_rate(&leads))
    }

    // ------------------------------------------------------------------------
    // Ownership and deletion
    // ------------------------------------------------------------------------

    /// Detach a departing staff member from every case they own, handing the
    /// cases to `reassign_to` or leaving them unassigned. The hand-over and
    /// its activity entries commit together; if the successor may not own
    /// one of the cases, nothing moves. Returns the number of cases moved.
    #[instrument(skip_all, fields(staff = %staff, actor = %actor))]
    pub async fn release_staff(
        &self,
        staff: StaffId,
        reassign_to: Option<StaffId>,
        actor: Actor,
    ) -> Result<usize> {
        let allowed_types = match reassign_to {
            Some(successor) => assignable_types(self.staff.as_ref(), successor)?,
            None => CaseType::ALL.to_vec(),
        };
        let text = format!(
            "Assigned: {} → {}",
            self.staff_label(Some(staff)),
            self.staff_label(reassign_to)
        );
        let reassignment = Reassignment {
            from: staff,
            to: reassign_to,
            allowed_types,
            activity: NewActivity::status_change(text),
            actor,
            at: self.clock.now(),
        };

        let affected = match self.store.reassign_staff(&reassignment).await {
            Ok(affected) => affected,
            Err(e) => {
                warn!(error = %e, "Staff release rejected");
                return Err(e);
            }
        };
        info!(count = affected.len(), successor = ?reassign_to, "Staff released from cases");
        Ok(affected.len())
    }

    /// Remove a finished case. Open cases, and cases that still have open
    /// dependents, are refused.
    #[instrument(skip(self))]
    pub async fn delete(&self, reference: &CaseReference) -> Result<()> {
        let record = self.get(reference).await?;
        if !record.is_terminal() {
            return Err(CaseError::validation(
                "status",
                format!("{} is still {}", reference, record.status),
            ));
        }
        if self.store.has_open_children(reference).await? {
            return Err(CaseError::validation(
                "parent",
                format!("{reference} has open dependent cases"),
            ));
        }
        if !self.store.delete(reference).await? {
            return Err(CaseError::not_found(reference));
        }
        info!("Case deleted");
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn touch(record: &mut CaseRecord, now: DateTime<Utc>) {
    record.updated_at = now.max(record.updated_at);
    record.version += 1;
}

fn with_note(text: String, note: &Option<String>) -> String {
    match note.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        Some(note) => format!("{text}. {note}"),
        None => text,
    }
}

fn non_blank(text: String) -> Result<String> {
    if text.trim().is_empty() {
        Err(CaseError::validation("text", "must not be empty"))
    } else {
        Ok(text)
    }
}

fn sort_by_deadline(records: &mut [CaseRecord]) {
    records.sort_by(|a, b| {
        obligations::deadline(a)
            .cmp(&obligations::deadline(b))
            .then_with(|| a.reference.cmp(&b.reference))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityKind;
    use crate::clock::ManualClock;
    use crate::staff::{InMemoryDirectory, StaffMember, StaffRole};
    use crate::status_machine::Stamp;
    use crate::store::MemoryStore;
    use crate::types::{LeadStatus, MaintenanceStatus, TicketStatus};
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    struct Harness {
        repo: CaseRepository,
        store: Arc<MemoryStore>,
        clock: ManualClock,
        staff: Arc<InMemoryDirectory>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(t0());
        let staff = Arc::new(InMemoryDirectory::new());
        let repo = CaseRepository::new(
            store.clone(),
            Arc::new(clock.clone()),
            staff.clone(),
            EngineConfig::default(),
        );
        Harness {
            repo,
            store,
            clock,
            staff,
        }
    }

    fn ticket(status: TicketStatus) -> CaseStatus {
        CaseStatus::Ticket(status)
    }

    #[tokio::test]
    async fn test_ticket_takes_sla_and_priority_from_category() {
        let h = harness();
        let record = h
            .repo
            .create(NewCase::ticket("emergency", "Burst pipe"), Actor::System)
            .await
            .unwrap();

        assert_eq!(record.reference.as_str(), "BB2025010001");
        assert_eq!(record.priority, crate::types::Priority::Emergency);
        assert_eq!(record.due_at, Some(t0() + Duration::hours(4)));
        assert_eq!(record.status, ticket(TicketStatus::Open));

        let log = h.repo.activities(&record.reference).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, ActivityKind::StatusChange);
    }

    #[tokio::test]
    async fn test_explicit_priority_and_due_date_win() {
        let h = harness();
        let due = t0() + Duration::hours(2);
        let record = h
            .repo
            .create(
                NewCase::ticket("billing", "Double charge")
                    .with_priority(crate::types::Priority::High)
                    .due_at(due),
                Actor::System,
            )
            .await
            .unwrap();
        assert_eq!(record.priority, crate::types::Priority::High);
        assert_eq!(record.due_at, Some(due));
    }

    #[tokio::test]
    async fn test_ticket_category_is_validated() {
        let h = harness();
        let err = h
            .repo
            .create(NewCase::ticket("spa", "Sauna cold"), Actor::System)
            .await
            .unwrap_err();
        assert!(matches!(err, CaseError::Validation { .. }));
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_references_are_per_prefix_and_month() {
        let h = harness();
        let lead = h
            .repo
            .create(NewCase::lead("tenant", "Mia"), Actor::System)
            .await
            .unwrap();
        let first = h
            .repo
            .create(NewCase::ticket("billing", "A"), Actor::System)
            .await
            .unwrap();
        h.clock.set(Utc.with_ymd_and_hms(2025, 2, 3, 9, 0, 0).unwrap());
        let february = h
            .repo
            .create(NewCase::ticket("billing", "B"), Actor::System)
            .await
            .unwrap();

        assert_eq!(lead.reference.as_str(), "LD2025010001");
        assert_eq!(first.reference.as_str(), "BB2025010001");
        assert_eq!(february.reference.as_str(), "BB2025020001");
    }

    #[tokio::test]
    async fn test_collision_with_imported_record_is_retried() {
        let h = harness();
        let legacy = CaseRecord::open(
            NewCase::ticket("billing", "Imported"),
            CaseReference::parse("BB2025010001").unwrap(),
            t0(),
        )
        .unwrap();
        h.store.import(legacy).await.unwrap();

        let record = h
            .repo
            .create(NewCase::ticket("billing", "Fresh"), Actor::System)
            .await
            .unwrap();
        assert_eq!(record.reference.as_str(), "BB2025010002");
    }

    #[tokio::test]
    async fn test_collisions_beyond_retry_limit_fail() {
        let h = harness();
        for n in 1..=3 {
            let legacy = CaseRecord::open(
                NewCase::ticket("billing", "Imported"),
                CaseReference::parse(&format!("BB202501{n:04}")).unwrap(),
                t0(),
            )
            .unwrap();
            h.store.import(legacy).await.unwrap();
        }

        let err = h
            .repo
            .create(NewCase::ticket("billing", "Fresh"), Actor::System)
            .await
            .unwrap_err();
        match err {
            CaseError::DuplicateIdentifier { reference, attempts } => {
                assert_eq!(reference, "BB2025010003");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_update_status_stamps_and_logs() {
        let h = harness();
        let agent = StaffMember::new("Lena", StaffRole::SupportAgent);
        let actor = Actor::Staff(agent.id);
        h.staff.insert(agent);

        let record = h
            .repo
            .create(NewCase::ticket("amenities", "No WiFi"), Actor::System)
            .await
            .unwrap();
        h.clock.advance(Duration::minutes(30));

        let updated = h
            .repo
            .update_status(&record.reference, StatusUpdate::to(ticket(TicketStatus::InProgress)), actor)
            .await
            .unwrap();
        assert_eq!(updated.first_response_time, Some(t0() + Duration::minutes(30)));
        assert_eq!(updated.started_at, updated.first_response_time);
        assert_eq!(updated.version, 2);

        let log = h.repo.activities(&record.reference).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].text, "Status: open → in_progress");
        assert_eq!(log[1].author, actor.staff_id());
    }

    #[tokio::test]
    async fn test_resolution_note_is_kept() {
        let h = harness();
        let record = h
            .repo
            .create(NewCase::ticket("room_issues", "Window stuck"), Actor::System)
            .await
            .unwrap();

        let resolved = h
            .repo
            .update_status(
                &record.reference,
                StatusUpdate::to(ticket(TicketStatus::Resolved)).with_note("Hinge replaced"),
                Actor::System,
            )
            .await
            .unwrap();
        assert_eq!(resolved.resolution_notes.as_deref(), Some("Hinge replaced"));
        assert_eq!(resolved.resolved_at, Some(t0()));

        let log = h.repo.activities(&record.reference).await.unwrap();
        assert_eq!(log[1].text, "Status: open → resolved. Hinge replaced");
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_record_unchanged() {
        let h = harness();
        let record = h
            .repo
            .create(NewCase::ticket("billing", "Refund"), Actor::System)
            .await
            .unwrap();
        h.repo
            .update_status(&record.reference, StatusUpdate::to(ticket(TicketStatus::Closed)), Actor::System)
            .await
            .unwrap();

        let err = h
            .repo
            .update_status(
                &record.reference,
                StatusUpdate::to(ticket(TicketStatus::InProgress)),
                Actor::System,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CaseError::InvalidTransition { .. }));

        let stored = h.repo.get(&record.reference).await.unwrap();
        assert_eq!(stored.status, ticket(TicketStatus::Closed));
        assert_eq!(h.repo.activities(&record.reference).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_null_transition_policies() {
        let h = harness();
        let record = h
            .repo
            .create(NewCase::ticket("billing", "Receipt"), Actor::System)
            .await
            .unwrap();
        h.clock.advance(Duration::hours(1));

        let same = h
            .repo
            .update_status(&record.reference, StatusUpdate::to(ticket(TicketStatus::Open)), Actor::System)
            .await
            .unwrap();
        assert_eq!(same, record);
        assert_eq!(h.repo.activities(&record.reference).await.unwrap().len(), 1);

        let logged = h
            .repo
            .update_status(
                &record.reference,
                StatusUpdate::to(ticket(TicketStatus::Open)).log_unchanged(),
                Actor::System,
            )
            .await
            .unwrap();
        assert_eq!(logged.updated_at, record.updated_at);
        let log = h.repo.activities(&record.reference).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].kind, ActivityKind::Note);
    }

    #[tokio::test]
    async fn test_missing_case_is_not_found() {
        let h = harness();
        let missing = CaseReference::parse("BB2025019999").unwrap();
        let err = h
            .repo
            .update_status(&missing, StatusUpdate::to(ticket(TicketStatus::Closed)), Actor::System)
            .await
            .unwrap_err();
        assert!(matches!(err, CaseError::NotFound { .. }));
        assert!(h
            .repo
            .append(&missing, NewActivity::comment("hello"), Actor::System)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_assign_checks_directory_and_logs_names() {
        let h = harness();
        let sales = StaffMember::new("Jonas", StaffRole::SalesExecutive);
        let agent = StaffMember::new("Lena", StaffRole::SupportAgent);
        let (sales_id, agent_id) = (sales.id, agent.id);
        h.staff.insert(sales);
        h.staff.insert(agent);

        let record = h
            .repo
            .create(NewCase::ticket("billing", "Deposit"), Actor::System)
            .await
            .unwrap();

        let err = h
            .repo
            .assign(&record.reference, Some(sales_id), Actor::System)
            .await
            .unwrap_err();
        assert!(matches!(err, CaseError::Validation { .. }));

        let assigned = h
            .repo
            .assign(&record.reference, Some(agent_id), Actor::System)
            .await
            .unwrap();
        assert_eq!(assigned.assigned_to, Some(agent_id));

        let log = h.repo.activities(&record.reference).await.unwrap();
        assert_eq!(log.last().unwrap().text, "Assigned: Unassigned → Lena");
    }

    #[tokio::test]
    async fn test_record_contact_on_lead() {
        let h = harness();
        let lead = h
            .repo
            .create(NewCase::lead("tenant", "Mia Schulz"), Actor::System)
            .await
            .unwrap();
        h.clock.advance(Duration::days(3));

        let contacted = h
            .repo
            .record_contact(&lead.reference, "Called, left voicemail", Actor::System)
            .await
            .unwrap();
        assert_eq!(contacted.contact_attempts, 1);
        assert_eq!(contacted.last_contact_at, Some(t0() + Duration::days(3)));

        h.clock.advance(Duration::days(2));
        let facts = h.repo.obligations(&lead.reference).await.unwrap();
        assert_eq!(facts.days_since_last_contact, 2);
        assert_eq!(facts.days_since_created, 5);
    }

    #[tokio::test]
    async fn test_schedule_sets_followup_and_overdue() {
        let h = harness();
        let lead = h
            .repo
            .create(NewCase::lead("tenant", "Ali"), Actor::System)
            .await
            .unwrap();
        h.repo
            .schedule(&lead.reference, t0() + Duration::days(1), Actor::System)
            .await
            .unwrap();

        assert!(h.repo.list_overdue(CaseType::Lead).await.unwrap().is_empty());
        let soon = h.repo.list_due_soon(CaseType::Lead, None).await.unwrap();
        assert_eq!(soon.len(), 1);

        h.clock.advance(Duration::days(1) + Duration::seconds(1));
        let overdue = h.repo.list_overdue(CaseType::Lead).await.unwrap();
        assert_eq!(overdue.len(), 1);

        let err = h
            .repo
            .schedule(&lead.reference, t0() - Duration::days(1), Actor::System)
            .await
            .unwrap_err();
        assert!(matches!(err, CaseError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_release_staff_reassigns_and_logs() {
        let h = harness();
        let leaving = StaffMember::new("Tom", StaffRole::Manager);
        let successor = StaffMember::new("Ana", StaffRole::SupportAgent);
        let (leaving_id, successor_id) = (leaving.id, successor.id);
        h.staff.insert(leaving);
        h.staff.insert(successor);

        let first = h
            .repo
            .create(NewCase::ticket("billing", "A").assigned_to(leaving_id), Actor::System)
            .await
            .unwrap();
        let lead = h
            .repo
            .create(NewCase::lead("tenant", "B").assigned_to(leaving_id), Actor::System)
            .await
            .unwrap();

        let err = h
            .repo
            .release_staff(leaving_id, Some(successor_id), Actor::System)
            .await
            .unwrap_err();
        assert!(matches!(err, CaseError::Validation { .. }));
        // Rejected hand-over leaves both cases and their logs untouched
        for case in [&first, &lead] {
            let stored = h.repo.get(&case.reference).await.unwrap();
            assert_eq!(stored.assigned_to, Some(leaving_id));
            assert_eq!(stored.version, case.version);
            assert_eq!(h.repo.activities(&case.reference).await.unwrap().len(), 1);
        }

        let moved = h
            .repo
            .release_staff(leaving_id, None, Actor::System)
            .await
            .unwrap();
        assert_eq!(moved, 2);
        assert_eq!(h.repo.get(&first.reference).await.unwrap().assigned_to, None);
        assert_eq!(h.repo.get(&lead.reference).await.unwrap().assigned_to, None);
        let log = h.repo.activities(&first.reference).await.unwrap();
        assert_eq!(log.last().unwrap().text, "Assigned: Tom → Unassigned");
    }

    #[tokio::test]
    async fn test_release_staff_hands_cases_to_successor() {
        let h = harness();
        let leaving = StaffMember::new("Tom", StaffRole::Manager);
        let successor = StaffMember::new("Ana", StaffRole::Manager);
        let (leaving_id, successor_id) = (leaving.id, successor.id);
        h.staff.insert(leaving);
        h.staff.insert(successor);

        let ticket_case = h
            .repo
            .create(NewCase::ticket("billing", "A").assigned_to(leaving_id), Actor::System)
            .await
            .unwrap();
        let lead_case = h
            .repo
            .create(NewCase::lead("tenant", "B").assigned_to(leaving_id), Actor::System)
            .await
            .unwrap();
        h.clock.advance(Duration::hours(1));

        let moved = h
            .repo
            .release_staff(leaving_id, Some(successor_id), Actor::Staff(successor_id))
            .await
            .unwrap();
        assert_eq!(moved, 2);

        for case in [&ticket_case, &lead_case] {
            let stored = h.repo.get(&case.reference).await.unwrap();
            assert_eq!(stored.assigned_to, Some(successor_id));
            assert_eq!(stored.version, case.version + 1);
            assert_eq!(stored.updated_at, t0() + Duration::hours(1));

            let log = h.repo.activities(&case.reference).await.unwrap();
            assert_eq!(log.len(), 2);
            let last = log.last().unwrap();
            assert_eq!(last.text, "Assigned: Tom → Ana");
            assert_eq!(last.kind, ActivityKind::StatusChange);
            assert_eq!(last.author, Some(successor_id));
        }
    }

    #[tokio::test]
    async fn test_release_to_unknown_successor_is_rejected() {
        let h = harness();
        let leaving = StaffMember::new("Tom", StaffRole::Manager);
        let leaving_id = leaving.id;
        h.staff.insert(leaving);
        let record = h
            .repo
            .create(NewCase::ticket("billing", "A").assigned_to(leaving_id), Actor::System)
            .await
            .unwrap();

        let err = h
            .repo
            .release_staff(leaving_id, Some(StaffId::new()), Actor::System)
            .await
            .unwrap_err();
        assert!(matches!(err, CaseError::Validation { .. }));
        assert_eq!(h.repo.get(&record.reference).await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_delete_is_guarded() {
        let h = harness();
        let parent = h
            .repo
            .create(NewCase::ticket("maintenance", "Heater broken"), Actor::System)
            .await
            .unwrap();
        let child = h
            .repo
            .create(
                NewCase::maintenance("repair", "Replace heater").with_parent(parent.reference.clone()),
                Actor::System,
            )
            .await
            .unwrap();

        assert!(h.repo.delete(&parent.reference).await.is_err());
        h.repo
            .update_status(&parent.reference, StatusUpdate::to(ticket(TicketStatus::Closed)), Actor::System)
            .await
            .unwrap();
        let err = h.repo.delete(&parent.reference).await.unwrap_err();
        assert!(matches!(err, CaseError::Validation { ref field, .. } if field == "parent"));

        h.repo
            .update_status(
                &child.reference,
                StatusUpdate::to(CaseStatus::Maintenance(MaintenanceStatus::Cancelled)),
                Actor::System,
            )
            .await
            .unwrap();
        h.repo.delete(&parent.reference).await.unwrap();
        assert!(matches!(
            h.repo.get(&parent.reference).await,
            Err(CaseError::NotFound { .. })
        ));

        let orphan = h.repo.get(&child.reference).await.unwrap();
        assert_eq!(orphan.parent, None);
        assert_eq!(orphan.status, CaseStatus::Maintenance(MaintenanceStatus::Cancelled));
        assert_eq!(orphan.version, 3);
        assert_eq!(h.repo.activities(&child.reference).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_status_counts_and_conversion_rate() {
        let h = harness();
        let mut leads = Vec::new();
        for name in ["A", "B", "C", "D"] {
            leads.push(
                h.repo
                    .create(NewCase::lead("tenant", name), Actor::System)
                    .await
                    .unwrap(),
            );
        }
        let lead = |s| CaseStatus::Lead(s);
        h.repo
            .update_status(&leads[0].reference, StatusUpdate::to(lead(LeadStatus::Contacted)), Actor::System)
            .await
            .unwrap();
        h.repo
            .update_status(&leads[0].reference, StatusUpdate::to(lead(LeadStatus::Converted)), Actor::System)
            .await
            .unwrap();
        h.repo
            .update_status(&leads[1].reference, StatusUpdate::to(lead(LeadStatus::Lost)), Actor::System)
            .await
            .unwrap();

        let counts = h.repo.status_counts(CaseType::Lead).await.unwrap();
        assert_eq!(counts.len(), LeadStatus::ALL.len());
        assert_eq!(counts[0], (lead(LeadStatus::New), 2));
        assert!(counts.contains(&(lead(LeadStatus::Converted), 1)));
        assert!(counts.contains(&(lead(LeadStatus::Interested), 0)));

        let rate = h.repo.conversion_rate(CaseFilter::default()).await.unwrap();
        assert_eq!(rate, 25.0);
    }

    /// Store that lets another writer commit between our load and commit.
    struct InterleavingStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl CaseStore for InterleavingStore {
        async fn next_sequence(&self, key: &SequenceKey) -> Result<u32> {
            self.inner.next_sequence(key).await
        }
        async fn insert(&self, record: &CaseRecord, opened: ActivityEntry) -> Result<ActivityEntry> {
            self.inner.insert(record, opened).await
        }
        async fn load(&self, reference: &CaseReference) -> Result<Option<CaseRecord>> {
            let loaded = self.inner.load(reference).await?;
            if let Some(record) = &loaded {
                let mut other = record.clone();
                other.version += 1;
                self.inner.commit(&other, record.version, None).await?;
            }
            Ok(loaded)
        }
        async fn commit(
            &self,
            record: &CaseRecord,
            expected_version: u64,
            activity: Option<ActivityEntry>,
        ) -> Result<Option<ActivityEntry>> {
            self.inner.commit(record, expected_version, activity).await
        }
        async fn delete(&self, reference: &CaseReference) -> Result<bool> {
            self.inner.delete(reference).await
        }
        async fn append_activity(&self, entry: ActivityEntry) -> Result<ActivityEntry> {
            self.inner.append_activity(entry).await
        }
        async fn activities(&self, reference: &CaseReference) -> Result<Vec<ActivityEntry>> {
            self.inner.activities(reference).await
        }
        async fn query(&self, filter: &CaseFilter, page: Page) -> Result<Vec<CaseRecord>> {
            self.inner.query(filter, page).await
        }
        async fn open_cases(&self, case_type: CaseType) -> Result<Vec<CaseRecord>> {
            self.inner.open_cases(case_type).await
        }
        async fn has_open_children(&self, parent: &CaseReference) -> Result<bool> {
            self.inner.has_open_children(parent).await
        }
        async fn reassign_staff(&self, reassignment: &Reassignment) -> Result<Vec<CaseReference>> {
            self.inner.reassign_staff(reassignment).await
        }
    }

    #[tokio::test]
    async fn test_stale_update_is_rejected_without_side_effects() {
        let store = Arc::new(InterleavingStore {
            inner: MemoryStore::new(),
        });
        let repo = CaseRepository::new(
            store.clone(),
            Arc::new(ManualClock::new(t0())),
            Arc::new(InMemoryDirectory::new()),
            EngineConfig::default(),
        );
        let record = repo
            .create(NewCase::ticket("billing", "Late fee"), Actor::System)
            .await
            .unwrap();

        let err = repo
            .update_status(
                &record.reference,
                StatusUpdate::to(ticket(TicketStatus::Resolved)),
                Actor::System,
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let stored = store.inner.load(&record.reference).await.unwrap().unwrap();
        assert_eq!(stored.status, ticket(TicketStatus::Open));
        assert!(stored.resolved_at.is_none());
        assert_eq!(store.inner.activities(&record.reference).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_keeps_resolution_stamp() {
        let h = harness();
        let record = h
            .repo
            .create(NewCase::ticket("billing", "Statement"), Actor::System)
            .await
            .unwrap();
        h.repo
            .update_status(&record.reference, StatusUpdate::to(ticket(TicketStatus::Resolved)), Actor::System)
            .await
            .unwrap();
        h.clock.advance(Duration::hours(2));
        let reopened = h
            .repo
            .update_status(&record.reference, StatusUpdate::to(ticket(TicketStatus::InProgress)), Actor::System)
            .await
            .unwrap();
        assert_eq!(reopened.resolved_at, Some(t0()));
        assert!(!reopened.is_terminal());

        let transition = status_machine::apply(
            &mut reopened.clone(),
            ticket(TicketStatus::Resolved),
            h.repo.now(),
        )
        .unwrap();
        assert!(!transition.stamped.contains(&Stamp::Resolved));
    }
}

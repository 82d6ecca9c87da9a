//! Status machine for every case type.
//!
//! Each status enum declares its own adjacency table through [`Lifecycle`].
//! [`apply`] is the only place a record's status changes:
//!
//! ```text
//! Lead:         new ─► contacted ─► interested ─► meeting_scheduled ─► proposal_sent
//!                │          └──────────┴───────────────┴──────────────────┴─► converted | lost | not_interested
//!                └─► lost | not_interested
//!
//! Ticket:       open ─► in_progress ◄─► waiting_resident
//!                          │  ▲
//!                          ▼  │
//!                       escalated          (any open state) ─► resolved ─► closed
//!                                                              resolved ─► in_progress (reopen)
//!
//! Contract:     draft ─► sent_for_signing ─► signed ─► active ─► expired
//!                 (any non-terminal) ─► terminated
//! ```
//!
//! Entering a resolved-like status stamps `resolved_at`; entering a
//! closed-like status stamps `closed_at` (and `resolved_at` if still unset).
//! Stamps are set once and never cleared.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CaseError, Result};
use crate::record::CaseRecord;
use crate::types::{
    CaseStatus, CaseType, ContractStatus, HousekeepingStatus, LeadStatus, MaintenanceStatus,
    TicketStatus,
};

/// How a terminal status ends a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Work done / goal reached: ticket resolved, lead converted,
    /// contract expired, request completed.
    Resolved,
    /// Case shut: ticket closed, lead lost, contract terminated, request
    /// cancelled.
    Closed,
}

/// Set-once timestamp written by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stamp {
    FirstResponse,
    Started,
    Signed,
    Resolved,
    Closed,
}

/// Per-type transition rules.
pub trait Lifecycle: Copy + Eq + 'static {
    fn initial() -> Self;

    /// Statuses reachable in one step.
    fn targets(self) -> &'static [Self];

    fn resolution(self) -> Option<Resolution>;

    /// Whether moving `from -> to` is the first contact with the customer.
    fn is_first_response(from: Self, to: Self) -> bool;

    /// Status in which work has visibly started.
    fn is_work_started(self) -> bool {
        false
    }

    fn is_signed(self) -> bool {
        false
    }
}

impl Lifecycle for LeadStatus {
    fn initial() -> Self {
        Self::New
    }

    fn targets(self) -> &'static [Self] {
        use LeadStatus::*;
        match self {
            New => &[Contacted, Lost, NotInterested],
            Contacted => &[
                Interested,
                MeetingScheduled,
                ProposalSent,
                Converted,
                Lost,
                NotInterested,
            ],
            Interested => &[MeetingScheduled, ProposalSent, Converted, Lost, NotInterested],
            MeetingScheduled => &[ProposalSent, Converted, Lost, NotInterested],
            ProposalSent => &[Converted, Lost, NotInterested],
            Converted | Lost | NotInterested => &[],
        }
    }

    fn resolution(self) -> Option<Resolution> {
        match self {
            Self::Converted => Some(Resolution::Resolved),
            Self::Lost | Self::NotInterested => Some(Resolution::Closed),
            _ => None,
        }
    }

    fn is_first_response(from: Self, to: Self) -> bool {
        from == Self::New && to == Self::Contacted
    }
}

impl Lifecycle for TicketStatus {
    fn initial() -> Self {
        Self::Open
    }

    fn targets(self) -> &'static [Self] {
        use TicketStatus::*;
        match self {
            Open => &[InProgress, WaitingResident, Escalated, Resolved, Closed],
            InProgress => &[WaitingResident, Escalated, Resolved, Closed],
            WaitingResident => &[InProgress, Resolved, Closed],
            Escalated => &[InProgress, Resolved, Closed],
            Resolved => &[Closed, InProgress],
            Closed => &[],
        }
    }

    fn resolution(self) -> Option<Resolution> {
        match self {
            Self::Resolved => Some(Resolution::Resolved),
            Self::Closed => Some(Resolution::Closed),
            _ => None,
        }
    }

    fn is_first_response(from: Self, _to: Self) -> bool {
        from == Self::Open
    }

    fn is_work_started(self) -> bool {
        self == Self::InProgress
    }
}

impl Lifecycle for ContractStatus {
    fn initial() -> Self {
        Self::Draft
    }

    fn targets(self) -> &'static [Self] {
        use ContractStatus::*;
        match self {
            Draft => &[SentForSigning, Terminated],
            SentForSigning => &[Signed, Draft, Terminated],
            Signed => &[Active, Terminated],
            Active => &[Expired, Terminated],
            Expired | Terminated => &[],
        }
    }

    fn resolution(self) -> Option<Resolution> {
        match self {
            Self::Expired => Some(Resolution::Resolved),
            Self::Terminated => Some(Resolution::Closed),
            _ => None,
        }
    }

    fn is_first_response(_from: Self, _to: Self) -> bool {
        false
    }

    fn is_work_started(self) -> bool {
        self == Self::Active
    }

    fn is_signed(self) -> bool {
        self == Self::Signed
    }
}

impl Lifecycle for MaintenanceStatus {
    fn initial() -> Self {
        Self::Submitted
    }

    fn targets(self) -> &'static [Self] {
        use MaintenanceStatus::*;
        match self {
            Submitted => &[Approved, Cancelled],
            Approved => &[Assigned, InProgress, Cancelled],
            Assigned => &[InProgress, Cancelled],
            InProgress => &[Completed, Cancelled],
            Completed | Cancelled => &[],
        }
    }

    fn resolution(self) -> Option<Resolution> {
        match self {
            Self::Completed => Some(Resolution::Resolved),
            Self::Cancelled => Some(Resolution::Closed),
            _ => None,
        }
    }

    fn is_first_response(from: Self, _to: Self) -> bool {
        from == Self::Submitted
    }

    fn is_work_started(self) -> bool {
        self == Self::InProgress
    }
}

impl Lifecycle for HousekeepingStatus {
    fn initial() -> Self {
        Self::Scheduled
    }

    fn targets(self) -> &'static [Self] {
        use HousekeepingStatus::*;
        match self {
            Scheduled => &[InProgress, Rescheduled, Cancelled],
            Rescheduled => &[Scheduled, InProgress, Cancelled],
            InProgress => &[Completed],
            Completed | Cancelled => &[],
        }
    }

    fn resolution(self) -> Option<Resolution> {
        match self {
            Self::Completed => Some(Resolution::Resolved),
            Self::Cancelled => Some(Resolution::Closed),
            _ => None,
        }
    }

    fn is_first_response(_from: Self, _to: Self) -> bool {
        false
    }

    fn is_work_started(self) -> bool {
        self == Self::InProgress
    }
}

// ============================================================================
// Dispatch over CaseStatus
// ============================================================================

fn wrap_targets<S: Lifecycle>(status: S, wrap: fn(S) -> CaseStatus) -> Vec<CaseStatus> {
    status.targets().iter().copied().map(wrap).collect()
}

pub fn initial_status(case_type: CaseType) -> CaseStatus {
    match case_type {
        CaseType::Lead => CaseStatus::Lead(LeadStatus::initial()),
        CaseType::Ticket => CaseStatus::Ticket(TicketStatus::initial()),
        CaseType::Contract => CaseStatus::Contract(ContractStatus::initial()),
        CaseType::Maintenance => CaseStatus::Maintenance(MaintenanceStatus::initial()),
        CaseType::Housekeeping => CaseStatus::Housekeeping(HousekeepingStatus::initial()),
    }
}

/// Statuses reachable from `status` in one step.
pub fn allowed_targets(status: CaseStatus) -> Vec<CaseStatus> {
    match status {
        CaseStatus::Lead(s) => wrap_targets(s, CaseStatus::Lead),
        CaseStatus::Ticket(s) => wrap_targets(s, CaseStatus::Ticket),
        CaseStatus::Contract(s) => wrap_targets(s, CaseStatus::Contract),
        CaseStatus::Maintenance(s) => wrap_targets(s, CaseStatus::Maintenance),
        CaseStatus::Housekeeping(s) => wrap_targets(s, CaseStatus::Housekeeping),
    }
}

pub fn can_transition(from: CaseStatus, to: CaseStatus) -> bool {
    match (from, to) {
        (CaseStatus::Lead(a), CaseStatus::Lead(b)) => a.targets().contains(&b),
        (CaseStatus::Ticket(a), CaseStatus::Ticket(b)) => a.targets().contains(&b),
        (CaseStatus::Contract(a), CaseStatus::Contract(b)) => a.targets().contains(&b),
        (CaseStatus::Maintenance(a), CaseStatus::Maintenance(b)) => a.targets().contains(&b),
        (CaseStatus::Housekeeping(a), CaseStatus::Housekeeping(b)) => a.targets().contains(&b),
        _ => false,
    }
}

pub fn resolution(status: CaseStatus) -> Option<Resolution> {
    match status {
        CaseStatus::Lead(s) => s.resolution(),
        CaseStatus::Ticket(s) => s.resolution(),
        CaseStatus::Contract(s) => s.resolution(),
        CaseStatus::Maintenance(s) => s.resolution(),
        CaseStatus::Housekeeping(s) => s.resolution(),
    }
}

/// A status that ends the case. Ticket `resolved` counts, even though it
/// may still be reopened.
pub fn is_terminal(status: CaseStatus) -> bool {
    resolution(status).is_some()
}

fn is_first_response(from: CaseStatus, to: CaseStatus) -> bool {
    match (from, to) {
        (CaseStatus::Lead(a), CaseStatus::Lead(b)) => LeadStatus::is_first_response(a, b),
        (CaseStatus::Ticket(a), CaseStatus::Ticket(b)) => TicketStatus::is_first_response(a, b),
        (CaseStatus::Contract(a), CaseStatus::Contract(b)) => {
            ContractStatus::is_first_response(a, b)
        }
        (CaseStatus::Maintenance(a), CaseStatus::Maintenance(b)) => {
            MaintenanceStatus::is_first_response(a, b)
        }
        (CaseStatus::Housekeeping(a), CaseStatus::Housekeeping(b)) => {
            HousekeepingStatus::is_first_response(a, b)
        }
        _ => false,
    }
}

fn is_work_started(status: CaseStatus) -> bool {
    match status {
        CaseStatus::Lead(s) => s.is_work_started(),
        CaseStatus::Ticket(s) => s.is_work_started(),
        CaseStatus::Contract(s) => s.is_work_started(),
        CaseStatus::Maintenance(s) => s.is_work_started(),
        CaseStatus::Housekeeping(s) => s.is_work_started(),
    }
}

fn is_signed(status: CaseStatus) -> bool {
    matches!(status, CaseStatus::Contract(s) if s.is_signed())
}

// ============================================================================
// Transitions
// ============================================================================

/// Outcome of [`apply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: CaseStatus,
    pub to: CaseStatus,
    pub at: DateTime<Utc>,
    /// Timestamps written by this transition, in the order applied.
    pub stamped: Vec<Stamp>,
}

impl Transition {
    /// Requested status equals the current one; nothing was changed.
    pub fn is_null(&self) -> bool {
        self.from == self.to
    }
}

/// Validate `record.status -> to` without touching the record.
pub fn check(record: &CaseRecord, to: CaseStatus) -> Result<()> {
    let from = record.status;
    if from == to || can_transition(from, to) {
        Ok(())
    } else {
        Err(CaseError::InvalidTransition {
            case_type: record.case_type(),
            from: from.as_str().to_string(),
            to: to_label(record.case_type(), to),
        })
    }
}

fn to_label(case_type: CaseType, to: CaseStatus) -> String {
    if to.case_type() == case_type {
        to.as_str().to_string()
    } else {
        format!("{}:{}", to.case_type(), to.as_str())
    }
}

fn set_once(slot: &mut Option<DateTime<Utc>>, at: DateTime<Utc>, stamp: Stamp, out: &mut Vec<Stamp>) {
    if slot.is_none() {
        *slot = Some(at);
        out.push(stamp);
    }
}

/// Move `record` to `to`, writing any set-once stamps.
///
/// On error the record is untouched. Requesting the current status is a
/// null transition: it succeeds and changes nothing, including `updated_at`.
pub fn apply(record: &mut CaseRecord, to: CaseStatus, now: DateTime<Utc>) -> Result<Transition> {
    check(record, to)?;
    let from = record.status;
    let mut stamped = Vec::new();

    if from != to {
        if is_first_response(from, to) {
            set_once(&mut record.first_response_time, now, Stamp::FirstResponse, &mut stamped);
        }
        if is_work_started(to) {
            set_once(&mut record.started_at, now, Stamp::Started, &mut stamped);
        }
        if is_signed(to) {
            set_once(&mut record.signed_at, now, Stamp::Signed, &mut stamped);
        }
        match resolution(to) {
            Some(Resolution::Resolved) => {
                set_once(&mut record.resolved_at, now, Stamp::Resolved, &mut stamped);
            }
            Some(Resolution::Closed) => {
                set_once(&mut record.resolved_at, now, Stamp::Resolved, &mut stamped);
                set_once(&mut record.closed_at, now, Stamp::Closed, &mut stamped);
            }
            None => {}
        }
        record.status = to;
        record.updated_at = now.max(record.updated_at);
    }

    Ok(Transition {
        from,
        to,
        at: now,
        stamped,
    })
}

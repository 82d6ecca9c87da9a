//! Core vocabulary: case types, priorities, per-type statuses and actors.
//!
//! Status sets are closed per case type. A [`CaseStatus`] can only hold a
//! status that belongs to its own type, so "status outside the declared set"
//! is unrepresentable once a value has been parsed.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CaseError, Result};

// ============================================================================
// Case type
// ============================================================================

/// The kind of entity moving through a lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseType {
    Lead,
    Ticket,
    Contract,
    Maintenance,
    Housekeeping,
}

impl CaseType {
    pub const ALL: [CaseType; 5] = [
        CaseType::Lead,
        CaseType::Ticket,
        CaseType::Contract,
        CaseType::Maintenance,
        CaseType::Housekeeping,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lead => "lead",
            Self::Ticket => "ticket",
            Self::Contract => "contract",
            Self::Maintenance => "maintenance",
            Self::Housekeeping => "housekeeping",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == value)
            .ok_or_else(|| CaseError::validation("case_type", format!("unknown case type '{value}'")))
    }
}

impl fmt::Display for CaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Priority
// ============================================================================

/// Urgency of a case. Rank 1 is the most urgent.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Emergency = 1,
    High = 2,
    #[default]
    Medium = 3,
    Low = 4,
}

impl Priority {
    pub fn rank(self) -> u8 {
        self as u8
    }

    pub fn from_rank(rank: u8) -> Result<Self> {
        match rank {
            1 => Ok(Self::Emergency),
            2 => Ok(Self::High),
            3 => Ok(Self::Medium),
            4 => Ok(Self::Low),
            other => Err(CaseError::validation(
                "priority",
                format!("rank {other} outside 1..=4"),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Emergency => "emergency",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Per-type statuses
// ============================================================================

macro_rules! status_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                Self::ALL.iter().copied().find(|s| s.as_str() == value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

status_enum! {
    /// Sales pipeline for tenant and landlord enquiries.
    LeadStatus {
        New => "new",
        Contacted => "contacted",
        Interested => "interested",
        MeetingScheduled => "meeting_scheduled",
        ProposalSent => "proposal_sent",
        Converted => "converted",
        Lost => "lost",
        NotInterested => "not_interested",
    }
}

status_enum! {
    /// Resident support ticket.
    TicketStatus {
        Open => "open",
        InProgress => "in_progress",
        WaitingResident => "waiting_resident",
        Escalated => "escalated",
        Resolved => "resolved",
        Closed => "closed",
    }
}

status_enum! {
    /// Residency contract.
    ContractStatus {
        Draft => "draft",
        SentForSigning => "sent_for_signing",
        Signed => "signed",
        Active => "active",
        Expired => "expired",
        Terminated => "terminated",
    }
}

status_enum! {
    /// Maintenance or repair request.
    MaintenanceStatus {
        Submitted => "submitted",
        Approved => "approved",
        Assigned => "assigned",
        InProgress => "in_progress",
        Completed => "completed",
        Cancelled => "cancelled",
    }
}

status_enum! {
    /// Scheduled housekeeping visit.
    HousekeepingStatus {
        Scheduled => "scheduled",
        InProgress => "in_progress",
        Completed => "completed",
        Cancelled => "cancelled",
        Rescheduled => "rescheduled",
    }
}

/// A status tagged with the case type it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "case_type", content = "status", rename_all = "snake_case")]
pub enum CaseStatus {
    Lead(LeadStatus),
    Ticket(TicketStatus),
    Contract(ContractStatus),
    Maintenance(MaintenanceStatus),
    Housekeeping(HousekeepingStatus),
}

impl CaseStatus {
    pub fn case_type(self) -> CaseType {
        match self {
            Self::Lead(_) => CaseType::Lead,
            Self::Ticket(_) => CaseType::Ticket,
            Self::Contract(_) => CaseType::Contract,
            Self::Maintenance(_) => CaseType::Maintenance,
            Self::Housekeeping(_) => CaseType::Housekeeping,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lead(s) => s.as_str(),
            Self::Ticket(s) => s.as_str(),
            Self::Contract(s) => s.as_str(),
            Self::Maintenance(s) => s.as_str(),
            Self::Housekeeping(s) => s.as_str(),
        }
    }

    /// Parse a status string against the declared set of `case_type`.
    pub fn parse(case_type: CaseType, value: &str) -> Result<Self> {
        let parsed = match case_type {
            CaseType::Lead => LeadStatus::parse(value).map(Self::Lead),
            CaseType::Ticket => TicketStatus::parse(value).map(Self::Ticket),
            CaseType::Contract => ContractStatus::parse(value).map(Self::Contract),
            CaseType::Maintenance => MaintenanceStatus::parse(value).map(Self::Maintenance),
            CaseType::Housekeeping => HousekeepingStatus::parse(value).map(Self::Housekeeping),
        };
        parsed.ok_or_else(|| {
            CaseError::validation(
                "status",
                format!("'{value}' is not a {case_type} status"),
            )
        })
    }

    /// Every declared status of `case_type`, in declaration order.
    pub fn all(case_type: CaseType) -> Vec<CaseStatus> {
        match case_type {
            CaseType::Lead => LeadStatus::ALL.iter().copied().map(Self::Lead).collect(),
            CaseType::Ticket => TicketStatus::ALL.iter().copied().map(Self::Ticket).collect(),
            CaseType::Contract => ContractStatus::ALL
                .iter()
                .copied()
                .map(Self::Contract)
                .collect(),
            CaseType::Maintenance => MaintenanceStatus::ALL
                .iter()
                .copied()
                .map(Self::Maintenance)
                .collect(),
            CaseType::Housekeeping => HousekeepingStatus::ALL
                .iter()
                .copied()
                .map(Self::Housekeeping)
                .collect(),
        }
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Staff and actors
// ============================================================================

/// Reference to an employee. The engine never owns staff records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaffId(pub Uuid);

impl StaffId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StaffId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StaffId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Who performed a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "staff_id")]
pub enum Actor {
    Staff(StaffId),
    /// Background jobs and intake forms without a logged-in employee.
    System,
}

impl Actor {
    pub fn staff_id(self) -> Option<StaffId> {
        match self {
            Self::Staff(id) => Some(id),
            Self::System => None,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Staff(id) => write!(f, "staff:{id}"),
            Self::System => f.write_str("system"),
        }
    }
}

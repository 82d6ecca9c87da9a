//! Case records and intake.
//!
//! A [`CaseRecord`] is the shared shape of leads, support tickets, residency
//! contracts, maintenance requests and housekeeping visits. Type-specific
//! details that the lifecycle never reads live in `attributes`.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CaseError, Result};
use crate::identifier::CaseReference;
use crate::status_machine;
use crate::types::{
    CaseStatus, CaseType, ContractStatus, LeadStatus, Priority, StaffId,
};

/// A case as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub id: Uuid,
    pub reference: CaseReference,
    pub status: CaseStatus,
    pub priority: Priority,

    /// Lead name, ticket subject, contract party or request title.
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Ticket category, lead type, maintenance request type or housekeeping
    /// schedule type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<StaffId>,
    /// Case this one was raised from (a maintenance request opened for a
    /// support ticket).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<CaseReference>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every committed mutation; used for optimistic concurrency.
    pub version: u64,

    /// SLA due date (tickets), next follow-up (leads) or scheduled date
    /// (maintenance, housekeeping).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,

    // Set-once lifecycle stamps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_response_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,

    // Lead follow-up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_contact_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub contact_attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_notes: Option<String>,

    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl CaseRecord {
    /// Build the initial record for an intake. Status is the type's initial
    /// status; `due_at` must already include any derived SLA deadline.
    pub fn open(intake: NewCase, reference: CaseReference, now: DateTime<Utc>) -> Result<Self> {
        let record = Self {
            id: Uuid::new_v4(),
            reference,
            status: status_machine::initial_status(intake.case_type),
            priority: intake.priority.unwrap_or_default(),
            title: intake.title,
            description: intake.description,
            category: intake.category,
            assigned_to: intake.assigned_to,
            parent: intake.parent,
            created_at: now,
            updated_at: now,
            version: 1,
            due_at: intake.due_at,
            start_date: intake.start_date,
            end_date: intake.end_date,
            first_response_time: None,
            started_at: None,
            signed_at: None,
            resolved_at: None,
            closed_at: None,
            last_contact_at: None,
            contact_attempts: 0,
            resolution_notes: None,
            attributes: intake.attributes,
        };
        record.validate()?;
        Ok(record)
    }

    pub fn case_type(&self) -> CaseType {
        self.status.case_type()
    }

    pub fn is_terminal(&self) -> bool {
        status_machine::is_terminal(self.status)
    }

    /// Lead reached `converted`. The conversion date is `resolved_at`.
    pub fn is_converted(&self) -> bool {
        self.status == CaseStatus::Lead(LeadStatus::Converted)
    }

    pub fn is_active_contract(&self) -> bool {
        self.status == CaseStatus::Contract(ContractStatus::Active)
    }

    /// Check the record invariants.
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(CaseError::validation("title", "must not be empty"));
        }
        if self.updated_at < self.created_at {
            return Err(CaseError::validation("updated_at", "precedes created_at"));
        }
        if let Some(due_at) = self.due_at {
            if due_at < self.created_at {
                return Err(CaseError::validation("due_at", "precedes created_at"));
            }
        }
        if self.case_type() == CaseType::Contract {
            match (self.start_date, self.end_date) {
                (Some(start), Some(end)) if end < start => {
                    return Err(CaseError::validation("end_date", "precedes start_date"));
                }
                (Some(_), Some(_)) => {}
                _ => {
                    return Err(CaseError::validation(
                        "end_date",
                        "contracts need a start and end date",
                    ));
                }
            }
        } else if self.start_date.is_some() || self.end_date.is_some() {
            return Err(CaseError::validation(
                "end_date",
                format!("{} cases carry no contract dates", self.case_type()),
            ));
        }
        if self.is_terminal() && self.resolved_at.is_none() {
            return Err(CaseError::validation(
                "resolved_at",
                "terminal case without resolved_at",
            ));
        }
        if self.closed_at.is_some() && self.resolved_at.is_none() {
            return Err(CaseError::validation(
                "resolved_at",
                "closed_at set without resolved_at",
            ));
        }
        if self.parent.as_ref() == Some(&self.reference) {
            return Err(CaseError::validation("parent", "case cannot be its own parent"));
        }
        Ok(())
    }
}

/// Intake data for a new case, as produced by a form or manual entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCase {
    pub case_type: CaseType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    /// Falls back to the category default, then to `Medium`.
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub assigned_to: Option<StaffId>,
    #[serde(default)]
    pub parent: Option<CaseReference>,
    /// Explicit deadline. Tickets without one get `created_at + sla_hours`.
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl NewCase {
    fn blank(case_type: CaseType, title: impl Into<String>) -> Self {
        Self {
            case_type,
            title: title.into(),
            description: String::new(),
            category: None,
            priority: None,
            assigned_to: None,
            parent: None,
            due_at: None,
            start_date: None,
            end_date: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Enquiry from a prospective tenant or landlord. `lead_type` is e.g.
    /// `tenant`, `landlord` or `contact`.
    pub fn lead(lead_type: impl Into<String>, name: impl Into<String>) -> Self {
        let mut intake = Self::blank(CaseType::Lead, name);
        intake.category = Some(lead_type.into());
        intake
    }

    /// Resident support ticket in a configured category.
    pub fn ticket(category: impl Into<String>, subject: impl Into<String>) -> Self {
        let mut intake = Self::blank(CaseType::Ticket, subject);
        intake.category = Some(category.into());
        intake
    }

    /// Residency contract running from `start_date` to `end_date` inclusive.
    pub fn contract(party: impl Into<String>, start_date: NaiveDate, end_date: NaiveDate) -> Self {
        let mut intake = Self::blank(CaseType::Contract, party);
        intake.start_date = Some(start_date);
        intake.end_date = Some(end_date);
        intake
    }

    /// Maintenance request, e.g. `repair`, `routine`, `emergency`.
    pub fn maintenance(request_type: impl Into<String>, title: impl Into<String>) -> Self {
        let mut intake = Self::blank(CaseType::Maintenance, title);
        intake.category = Some(request_type.into());
        intake
    }

    /// Housekeeping visit scheduled for `scheduled_for`.
    pub fn housekeeping(
        schedule_type: impl Into<String>,
        title: impl Into<String>,
        scheduled_for: DateTime<Utc>,
    ) -> Self {
        let mut intake = Self::blank(CaseType::Housekeeping, title);
        intake.category = Some(schedule_type.into());
        intake.due_at = Some(scheduled_for);
        intake
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn assigned_to(mut self, staff: StaffId) -> Self {
        self.assigned_to = Some(staff);
        self
    }

    pub fn with_parent(mut self, parent: CaseReference) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = Some(due_at);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

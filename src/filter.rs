//! Query filters for `CaseRepository::find`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::CaseRecord;
use crate::types::{CaseStatus, CaseType, Priority, StaffId};

/// Assignment filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "staff_id")]
pub enum Assignee {
    Staff(StaffId),
    Unassigned,
}

/// All set fields must match (logical AND).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseFilter {
    pub case_type: Option<CaseType>,
    pub status: Option<CaseStatus>,
    pub priority: Option<Priority>,
    pub assignee: Option<Assignee>,
    /// Case-insensitive substring of title, description or reference.
    pub text: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub created_from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub created_until: Option<DateTime<Utc>>,
    /// Skip terminal cases.
    #[serde(default)]
    pub open_only: bool,
}

impl CaseFilter {
    pub fn of_type(case_type: CaseType) -> Self {
        Self {
            case_type: Some(case_type),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: CaseStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_assignee(mut self, assignee: Assignee) -> Self {
        self.assignee = Some(assignee);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn created_between(mut self, from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.created_from = Some(from);
        self.created_until = Some(until);
        self
    }

    pub fn open_only(mut self) -> Self {
        self.open_only = true;
        self
    }

    /// Search text trimmed and lower-cased; `None` when blank.
    pub fn needle(&self) -> Option<String> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
    }

    pub fn matches(&self, record: &CaseRecord) -> bool {
        if self.case_type.is_some_and(|t| t != record.case_type()) {
            return false;
        }
        if self.status.is_some_and(|s| s != record.status) {
            return false;
        }
        if self.priority.is_some_and(|p| p != record.priority) {
            return false;
        }
        match self.assignee {
            Some(Assignee::Staff(id)) if record.assigned_to != Some(id) => return false,
            Some(Assignee::Unassigned) if record.assigned_to.is_some() => return false,
            _ => {}
        }
        if self.created_from.is_some_and(|from| record.created_at < from) {
            return false;
        }
        if self.created_until.is_some_and(|until| record.created_at >= until) {
            return false;
        }
        if self.open_only && record.is_terminal() {
            return false;
        }
        if let Some(needle) = self.needle() {
            let hit = record.title.to_lowercase().contains(&needle)
                || record.description.to_lowercase().contains(&needle)
                || record.reference.as_str().to_lowercase().contains(&needle);
            if !hit {
                return false;
            }
        }
        true
    }
}

/// Offset pagination, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub const DEFAULT_LIMIT: usize = 25;

    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }

    pub fn all() -> Self {
        Self {
            offset: 0,
            limit: usize::MAX,
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::first(Self::DEFAULT_LIMIT)
    }
}

/// Newest first; reference breaks ties so paging is stable.
pub fn newest_first(a: &CaseRecord, b: &CaseRecord) -> std::cmp::Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.reference.cmp(&a.reference))
}

//! Append-only activity entries attached to a case.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CaseError, Result};
use crate::identifier::CaseReference;
use crate::types::{Actor, StaffId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Comment,
    StatusChange,
    Note,
}

impl ActivityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Comment => "comment",
            Self::StatusChange => "status_change",
            Self::Note => "note",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "comment" => Ok(Self::Comment),
            "status_change" => Ok(Self::StatusChange),
            "note" => Ok(Self::Note),
            other => Err(CaseError::validation(
                "kind",
                format!("unknown activity kind '{other}'"),
            )),
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entry as requested by a caller, before the store assigns its sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewActivity {
    pub kind: ActivityKind,
    pub text: String,
    /// Residents can see it (responses, closure notes); internal otherwise.
    pub visible_externally: bool,
}

impl NewActivity {
    pub fn comment(text: impl Into<String>) -> Self {
        Self {
            kind: ActivityKind::Comment,
            text: text.into(),
            visible_externally: false,
        }
    }

    pub fn note(text: impl Into<String>) -> Self {
        Self {
            kind: ActivityKind::Note,
            text: text.into(),
            visible_externally: false,
        }
    }

    pub fn status_change(text: impl Into<String>) -> Self {
        Self {
            kind: ActivityKind::StatusChange,
            text: text.into(),
            visible_externally: false,
        }
    }

    pub fn external(mut self) -> Self {
        self.visible_externally = true;
        self
    }

    pub(crate) fn into_entry(
        self,
        case: CaseReference,
        actor: Actor,
        created_at: DateTime<Utc>,
    ) -> ActivityEntry {
        ActivityEntry {
            id: Uuid::new_v4(),
            case,
            seq: 0,
            author: actor.staff_id(),
            kind: self.kind,
            text: self.text,
            created_at,
            visible_externally: self.visible_externally,
        }
    }
}

/// Immutable audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: Uuid,
    pub case: CaseReference,
    /// Store-assigned, strictly increasing; breaks ties between entries with
    /// the same `created_at`.
    pub seq: u64,
    /// `None` for system-generated entries.
    pub author: Option<StaffId>,
    pub kind: ActivityKind,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub visible_externally: bool,
}

impl ActivityEntry {
    /// Chronological order with the sequence as tiebreaker.
    pub fn chronological(a: &Self, b: &Self) -> Ordering {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.seq.cmp(&b.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_chronological_breaks_ties_by_seq() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let case = CaseReference::parse("BB2025030001").unwrap();
        let mut entries: Vec<ActivityEntry> = (0..3)
            .map(|n| {
                let mut entry = NewActivity::comment(format!("c{n}")).into_entry(
                    case.clone(),
                    Actor::System,
                    at,
                );
                entry.seq = 3 - n;
                entry
            })
            .collect();
        let mut earlier = NewActivity::note("first").into_entry(case, Actor::System, at - Duration::seconds(1));
        earlier.seq = 99;
        entries.push(earlier);

        entries.sort_by(ActivityEntry::chronological);
        let texts: Vec<&str> = entries.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, ["first", "c2", "c1", "c0"]);
    }

    #[test]
    fn test_system_entries_have_no_author() {
        let entry = NewActivity::status_change("Status: open → in_progress")
            .external()
            .into_entry(
                CaseReference::parse("BB2025030002").unwrap(),
                Actor::System,
                Utc::now(),
            );
        assert!(entry.author.is_none());
        assert!(entry.visible_externally);
        assert_eq!(entry.kind, ActivityKind::StatusChange);
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!(ActivityKind::parse("note").unwrap(), ActivityKind::Note);
        assert!(ActivityKind::parse("email").is_err());
    }
}

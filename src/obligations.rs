//! Time-derived facts about a case.
//!
//! Everything here is a pure function of a record and an instant supplied by
//! the caller (normally `Clock::now()`). Nothing is persisted.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::record::CaseRecord;
use crate::types::CaseType;

const SECONDS_PER_DAY: i64 = 86_400;

fn floor_days(span: Duration) -> i64 {
    span.num_seconds().div_euclid(SECONDS_PER_DAY)
}

/// First instant after `date` ends.
fn end_of_day(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.succ_opt()
        .and_then(|next| next.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
}

/// SLA deadline for a ticket created at `created_at`.
pub fn sla_due_at(created_at: DateTime<Utc>, sla_hours: u32) -> DateTime<Utc> {
    created_at + Duration::hours(i64::from(sla_hours))
}

/// The instant after which the case is late.
///
/// Contracts run through the whole of `end_date`; every other type uses
/// `due_at` directly.
pub fn deadline(record: &CaseRecord) -> Option<DateTime<Utc>> {
    match record.case_type() {
        CaseType::Contract => record.end_date.and_then(end_of_day),
        _ => record.due_at,
    }
}

/// Whether the deadline has strictly passed and the case still owes work.
///
/// Contracts only count while `active`: an active contract past its end date
/// is due for expiry processing.
pub fn is_overdue(record: &CaseRecord, now: DateTime<Utc>) -> bool {
    if record.is_terminal() {
        return false;
    }
    if record.case_type() == CaseType::Contract && !record.is_active_contract() {
        return false;
    }
    deadline(record).is_some_and(|due| now > due)
}

/// Whether the deadline falls in `(now, now + window]` and the case is open.
pub fn is_due_within(record: &CaseRecord, now: DateTime<Utc>, window: Duration) -> bool {
    if record.is_terminal() {
        return false;
    }
    if record.case_type() == CaseType::Contract && !record.is_active_contract() {
        return false;
    }
    deadline(record).is_some_and(|due| due > now && due <= now + window)
}

/// Lead whose follow-up date has passed.
pub fn needs_followup(record: &CaseRecord, now: DateTime<Utc>) -> bool {
    record.case_type() == CaseType::Lead && is_overdue(record, now)
}

pub fn days_since_created(record: &CaseRecord, now: DateTime<Utc>) -> i64 {
    floor_days(now - record.created_at)
}

/// Days since the last logged contact, or since creation if never contacted.
pub fn days_since_last_contact(record: &CaseRecord, now: DateTime<Utc>) -> i64 {
    match record.last_contact_at {
        Some(contacted) => floor_days(now - contacted),
        None => days_since_created(record, now),
    }
}

/// Whole days left on an active contract; 0 otherwise and never negative.
pub fn days_remaining(record: &CaseRecord, now: DateTime<Utc>) -> i64 {
    if !record.is_active_contract() {
        return 0;
    }
    record
        .end_date
        .map(|end| (end - now.date_naive()).num_days().max(0))
        .unwrap_or(0)
}

/// Percentage of converted leads, rounded to one decimal. Non-lead records
/// are ignored.
pub fn conversion_rate<'a>(records: impl IntoIterator<Item = &'a CaseRecord>) -> f64 {
    let (total, converted) = records
        .into_iter()
        .filter(|r| r.case_type() == CaseType::Lead)
        .fold((0u64, 0u64), |(total, converted), r| {
            (total + 1, converted + u64::from(r.is_converted()))
        });
    if total == 0 {
        return 0.0;
    }
    let rate = converted as f64 / total as f64 * 100.0;
    (rate * 10.0).round() / 10.0
}

/// All derived facts for one record at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Obligations {
    pub deadline: Option<DateTime<Utc>>,
    pub is_overdue: bool,
    pub days_since_created: i64,
    pub days_since_last_contact: i64,
    pub days_remaining: i64,
}

impl Obligations {
    pub fn evaluate(record: &CaseRecord, now: DateTime<Utc>) -> Self {
        Self {
            deadline: deadline(record),
            is_overdue: is_overdue(record, now),
            days_since_created: days_since_created(record, now),
            days_since_last_contact: days_since_last_contact(record, now),
            days_remaining: days_remaining(record, now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::CaseReference;
    use crate::record::NewCase;
    use crate::status_machine;
    use crate::types::{CaseStatus, ContractStatus, LeadStatus, TicketStatus};
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn ticket_due_in(hours: u32) -> CaseRecord {
        CaseRecord::open(
            NewCase::ticket("maintenance", "Heating broken").due_at(sla_due_at(t0(), hours)),
            CaseReference::parse("BB2025010001").unwrap(),
            t0(),
        )
        .unwrap()
    }

    fn active_contract(start: NaiveDate, end: NaiveDate, created: DateTime<Utc>) -> CaseRecord {
        let mut contract = CaseRecord::open(
            NewCase::contract("Resident", start, end),
            CaseReference::parse("CON2025010001").unwrap(),
            created,
        )
        .unwrap();
        for status in [
            ContractStatus::SentForSigning,
            ContractStatus::Signed,
            ContractStatus::Active,
        ] {
            status_machine::apply(&mut contract, CaseStatus::Contract(status), created).unwrap();
        }
        contract
    }

    #[test]
    fn test_sla_due_at_adds_hours() {
        assert_eq!(
            sla_due_at(t0(), 24),
            Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_ticket_overdue_after_sla() {
        let ticket = ticket_due_in(24);
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 1, 0, 0).unwrap();
        assert!(is_overdue(&ticket, at));
        assert!(!is_overdue(&ticket, t0() + Duration::hours(24)));
    }

    #[test]
    fn test_resolved_ticket_never_overdue() {
        let mut ticket = ticket_due_in(1);
        status_machine::apply(
            &mut ticket,
            CaseStatus::Ticket(TicketStatus::Resolved),
            t0() + Duration::minutes(30),
        )
        .unwrap();
        assert!(!is_overdue(&ticket, t0() + Duration::days(30)));
    }

    #[test]
    fn test_days_since_created_floors() {
        let ticket = ticket_due_in(24);
        assert_eq!(days_since_created(&ticket, t0() + Duration::hours(47)), 1);
        assert_eq!(days_since_created(&ticket, t0() + Duration::hours(48)), 2);
        assert_eq!(days_since_created(&ticket, t0() - Duration::hours(1)), -1);
    }

    #[test]
    fn test_days_since_last_contact_falls_back_to_creation() {
        let mut lead = CaseRecord::open(
            NewCase::lead("tenant", "Jonas"),
            CaseReference::parse("LD2025010001").unwrap(),
            t0(),
        )
        .unwrap();
        let now = t0() + Duration::days(10);
        assert_eq!(days_since_last_contact(&lead, now), 10);

        lead.last_contact_at = Some(t0() + Duration::days(7));
        assert_eq!(days_since_last_contact(&lead, now), 3);
    }

    #[test]
    fn test_contract_past_end_is_clamped_and_flagged() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();
        let contract = active_contract(start, end, Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap());
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();

        assert_eq!(days_remaining(&contract, now), 0);
        assert!(is_overdue(&contract, now));
    }

    #[test]
    fn test_contract_days_remaining_while_active() {
        let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 1, 31).unwrap();
        let contract = active_contract(start, end, t0());
        let now = Utc.with_ymd_and_hms(2025, 1, 21, 18, 0, 0).unwrap();

        assert_eq!(days_remaining(&contract, now), 10);
        assert!(!is_overdue(&contract, now));
        // Last day of the contract is still covered.
        assert!(!is_overdue(&contract, Utc.with_ymd_and_hms(2025, 1, 31, 23, 59, 59).unwrap()));
    }

    #[test]
    fn test_draft_contract_has_no_days_remaining() {
        let contract = CaseRecord::open(
            NewCase::contract(
                "Resident",
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
            ),
            CaseReference::parse("CON2023120001").unwrap(),
            Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap(),
        )
        .unwrap();
        assert_eq!(days_remaining(&contract, t0()), 0);
        assert!(!is_overdue(&contract, t0()));
    }

    #[test]
    fn test_due_within_window() {
        let ticket = ticket_due_in(24);
        assert!(is_due_within(&ticket, t0(), Duration::hours(48)));
        assert!(is_due_within(&ticket, t0(), Duration::hours(24)));
        assert!(!is_due_within(&ticket, t0(), Duration::hours(23)));
        assert!(!is_due_within(&ticket, t0() + Duration::hours(25), Duration::hours(48)));
    }

    #[test]
    fn test_conversion_rate() {
        let mut leads: Vec<CaseRecord> = (1..=3)
            .map(|n| {
                CaseRecord::open(
                    NewCase::lead("tenant", format!("Lead {n}")),
                    CaseReference::parse(&format!("LD202501000{n}")).unwrap(),
                    t0(),
                )
                .unwrap()
            })
            .collect();
        assert_eq!(conversion_rate(&leads), 0.0);

        status_machine::apply(&mut leads[0], CaseStatus::Lead(LeadStatus::Contacted), t0()).unwrap();
        status_machine::apply(&mut leads[0], CaseStatus::Lead(LeadStatus::Converted), t0()).unwrap();
        assert_eq!(conversion_rate(&leads), 33.3);
        assert_eq!(conversion_rate(std::iter::empty()), 0.0);
    }

    #[test]
    fn test_followup_only_for_leads() {
        let lead = CaseRecord::open(
            NewCase::lead("landlord", "Hausverwaltung Nord").due_at(t0() + Duration::days(1)),
            CaseReference::parse("LD2025010009").unwrap(),
            t0(),
        )
        .unwrap();
        assert!(needs_followup(&lead, t0() + Duration::days(2)));
        assert!(!needs_followup(&ticket_due_in(1), t0() + Duration::days(2)));
    }

    proptest! {
        /// Sweep `now` across the SLA boundary one second at a time.
        #[test]
        fn overdue_flips_strictly_after_deadline(hours in 1u32..=168, offset in -5i64..=5) {
            let ticket = ticket_due_in(hours);
            let due = sla_due_at(t0(), hours);
            let now = due + Duration::seconds(offset);
            prop_assert_eq!(is_overdue(&ticket, now), offset > 0);
        }
    }
}
